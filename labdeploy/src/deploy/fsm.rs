//! Finite State Machine for the remote lab lifecycle

use serde::{Deserialize, Serialize};

/// Lifecycle state of one host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    /// No session yet
    Idle,

    /// Session established
    Connected,

    /// Halting and cleaning any previous lab
    Cleaning,

    /// Unpacking the uploaded archive
    Extracting,

    /// Checking that the lab tools are installed
    Verifying,

    /// Start command issued, watching its output
    Starting,

    /// Waiting to reissue the start command
    Retrying,

    /// Lab reported as started
    Started,

    Failed,
}

impl LifecycleState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, LifecycleState::Started | LifecycleState::Failed)
    }
}

/// Input driving the lifecycle
#[derive(Debug, Clone)]
pub enum LifecycleInput {
    Connect,
    Cleanup,
    CleanupDone,
    Extracted,
    Verified,

    /// The start command found a lab already running
    AlreadyRunning,

    /// Reissue the start command after a retry delay
    Reissue,

    LabStarted,

    Fail(String),
}

/// Lifecycle FSM
#[derive(Debug, Clone)]
pub struct LifecycleFsm {
    state: LifecycleState,
    error: Option<String>,
    retry_count: u32,
}

impl Default for LifecycleFsm {
    fn default() -> Self {
        Self::new()
    }
}

impl LifecycleFsm {
    /// Create a new FSM in idle state
    pub fn new() -> Self {
        Self {
            state: LifecycleState::Idle,
            error: None,
            retry_count: 0,
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// Get error message if any
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Number of times the start command has been reissued
    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// Whether another reissue is allowed
    pub fn can_retry(&self, max_retries: u32) -> bool {
        self.retry_count < max_retries
    }

    /// Process an input and transition state
    pub fn process(&mut self, input: LifecycleInput) -> Result<(), String> {
        let new_state = match (&self.state, &input) {
            (LifecycleState::Idle, LifecycleInput::Connect) => LifecycleState::Connected,
            (LifecycleState::Connected, LifecycleInput::Cleanup) => LifecycleState::Cleaning,
            (LifecycleState::Cleaning, LifecycleInput::CleanupDone) => LifecycleState::Extracting,
            (LifecycleState::Extracting, LifecycleInput::Extracted) => LifecycleState::Verifying,
            (LifecycleState::Verifying, LifecycleInput::Verified) => LifecycleState::Starting,

            (LifecycleState::Starting, LifecycleInput::AlreadyRunning) => {
                self.retry_count += 1;
                LifecycleState::Retrying
            }
            (LifecycleState::Retrying, LifecycleInput::Reissue) => LifecycleState::Starting,
            (LifecycleState::Starting, LifecycleInput::LabStarted) => LifecycleState::Started,

            (state, LifecycleInput::Fail(err)) if !state.is_terminal() => {
                self.error = Some(err.clone());
                LifecycleState::Failed
            }

            // Invalid transitions
            (state, input) => {
                return Err(format!("Invalid transition: {:?} -> {:?}", state, input));
            }
        };

        self.state = new_state;
        Ok(())
    }
}
