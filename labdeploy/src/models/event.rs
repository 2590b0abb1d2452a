//! Lifecycle events produced by the pattern watcher

use serde::Serialize;

/// A classified line of remote output, or a driver-level failure
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", content = "detail", rename_all = "snake_case")]
pub enum LifecycleEvent {
    /// A lab node is booting
    NodeStarting(String),

    /// The whole lab is up
    LabStarted,

    /// A remote tool is not installed
    DependencyMissing(String),

    /// A command failed in a way no rule recognises
    CommandFailed(String),

    /// The start command found a lab instance already running
    AlreadyRunning,
}

impl LifecycleEvent {
    /// Events that end the start phase as soon as they are seen
    pub fn is_decisive(&self) -> bool {
        matches!(
            self,
            LifecycleEvent::LabStarted | LifecycleEvent::DependencyMissing(_)
        )
    }
}
