//! Status notifications
//!
//! Progress of every host deployment is reported through a [`NotificationSink`].
//! Publishing never blocks and never fails the deployment; a sink that cannot
//! deliver a message logs and drops it.

pub mod memory;
pub mod mqtt;
pub mod topics;

use serde::Serialize;
use tracing::info;

use crate::models::result::DeploymentResult;

/// A structured status message
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Notification {
    /// A lab node is booting
    Starting { host: String, node: String },

    LabStarted { host: String },

    /// A remote tool required by the lab is missing
    DependencyMissing { host: String, tool: String },

    /// Final outcome for a host
    HostResult {
        host: String,
        result: DeploymentResult,
    },
}

impl Notification {
    pub fn host(&self) -> &str {
        match self {
            Notification::Starting { host, .. }
            | Notification::LabStarted { host }
            | Notification::DependencyMissing { host, .. }
            | Notification::HostResult { host, .. } => host,
        }
    }
}

/// Destination for notifications, shared by all host tasks
pub trait NotificationSink: Send + Sync {
    fn publish(&self, notification: &Notification);
}

/// Sink that only logs
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl NotificationSink for TracingSink {
    fn publish(&self, notification: &Notification) {
        match notification {
            Notification::Starting { host, node } => info!(host = %host, "Starting {}", node),
            Notification::LabStarted { host } => info!(host = %host, "Lab started"),
            Notification::DependencyMissing { host, tool } => {
                info!(host = %host, "Missing remote tool {}", tool)
            }
            Notification::HostResult { host, result } => info!(host = %host, "{}", result),
        }
    }
}

/// Fans a notification out to several sinks
#[derive(Default)]
pub struct MultiSink {
    sinks: Vec<std::sync::Arc<dyn NotificationSink>>,
}

impl MultiSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: std::sync::Arc<dyn NotificationSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl NotificationSink for MultiSink {
    fn publish(&self, notification: &Notification) {
        for sink in &self.sinks {
            sink.publish(notification);
        }
    }
}
