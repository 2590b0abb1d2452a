//! Remote sessions
//!
//! A [`RemoteSession`] is one authenticated connection to one target host. It
//! keeps a single interactive shell open, so working directory changes made by
//! one command are visible to the next. Output of a command is consumed through
//! [`CommandOutput`], which ends with the exit status or an error.

pub mod ssh;

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::errors::FailureKind;
use crate::models::target::TargetHost;

/// Session level errors, independent of the SSH library in use
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("transfer failed: {0}")]
    Transfer(String),

    #[error("session closed: {0}")]
    Closed(String),
}

impl TransportError {
    pub fn kind(&self) -> FailureKind {
        match self {
            TransportError::Authentication(_) => FailureKind::Authentication,
            TransportError::Connection(_) | TransportError::Closed(_) => FailureKind::Connection,
            TransportError::Timeout(_) => FailureKind::Timeout,
            TransportError::Transfer(_) => FailureKind::Transfer,
        }
    }
}

/// One item of command output
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputEvent {
    /// A line of merged stdout/stderr, without the trailing newline
    Line(String),

    /// Exit status, always the last item of a successful stream
    Exit(i32),

    Error(TransportError),
}

/// Incremental output of one remote command
#[derive(Debug)]
pub struct CommandOutput {
    rx: mpsc::UnboundedReceiver<OutputEvent>,
    deadline: Option<Instant>,
    finished: bool,
}

impl CommandOutput {
    pub fn new(rx: mpsc::UnboundedReceiver<OutputEvent>, timeout: Option<Duration>) -> Self {
        Self {
            rx,
            deadline: timeout.map(|t| Instant::now() + t),
            finished: false,
        }
    }

    /// Output that is already complete, used by scripted sessions
    pub fn from_events(events: impl IntoIterator<Item = OutputEvent>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        for event in events {
            let _ = tx.send(event);
        }
        Self::new(rx, None)
    }

    /// Next item, or `None` once an exit status or error has been returned
    pub async fn next(&mut self) -> Option<OutputEvent> {
        if self.finished {
            return None;
        }

        let item = match self.deadline {
            Some(deadline) => match tokio::time::timeout_at(deadline, self.rx.recv()).await {
                Ok(item) => item,
                Err(_) => Some(OutputEvent::Error(TransportError::Timeout(
                    "no exit status before the command deadline".to_string(),
                ))),
            },
            None => self.rx.recv().await,
        };

        let item = item.unwrap_or_else(|| {
            OutputEvent::Error(TransportError::Closed(
                "output ended without an exit status".to_string(),
            ))
        });
        if !matches!(item, OutputEvent::Line(_)) {
            self.finished = true;
        }
        Some(item)
    }
}

/// An open, authenticated session to one host
#[async_trait]
pub trait RemoteSession: Send {
    /// Copy a local file to a path relative to the remote login directory
    async fn put(&mut self, local: &Path, remote: &str) -> Result<(), TransportError>;

    /// Run a command in the session's shell
    async fn execute(&mut self, command: &str) -> Result<CommandOutput, TransportError>;

    /// Write raw text to the session's shell
    async fn send(&mut self, text: &str) -> Result<(), TransportError>;

    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Opens sessions to target hosts
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, target: &TargetHost) -> Result<Box<dyn RemoteSession>, TransportError>;
}
