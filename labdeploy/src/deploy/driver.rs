//! Lifecycle driver
//!
//! Runs the [`LabScript`] of one host against an open [`RemoteSession`]:
//! clean up the previous lab, unpack the uploaded archive, check the lab tools
//! are installed and start the lab. Progress is only visible through the text
//! the remote commands print, which the [`PatternWatcher`] turns into
//! [`LifecycleEvent`]s.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::settings::DeploySettings;
use crate::deploy::fsm::{LifecycleFsm, LifecycleInput, LifecycleState};
use crate::deploy::script::LabScript;
use crate::deploy::watcher::PatternWatcher;
use crate::errors::FailureKind;
use crate::models::event::LifecycleEvent;
use crate::notify::{Notification, NotificationSink};
use crate::shutdown::Shutdown;
use crate::transport::{OutputEvent, RemoteSession, TransportError};

/// Lines of output kept for failure reports
const TAIL_LINES: usize = 10;

/// A start command that hit a running lab is reissued once
pub const MAX_START_RETRIES: u32 = 1;

/// Driver settings
#[derive(Debug, Clone)]
pub struct DriverSettings {
    /// Delay before reissuing the start command
    pub retry_delay: Duration,
}

impl Default for DriverSettings {
    fn default() -> Self {
        Self {
            retry_delay: Duration::from_secs(1),
        }
    }
}

impl From<&DeploySettings> for DriverSettings {
    fn from(settings: &DeploySettings) -> Self {
        Self {
            retry_delay: settings.retry_delay(),
        }
    }
}

/// Why a lifecycle ended in `Failed`
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LifecycleError {
    #[error("`{command}` failed: {reason}")]
    Extraction { command: String, reason: String },

    #[error("{tool} is not installed on the remote host")]
    DependencyMissing { tool: String },

    #[error("lab still running after {retries} restart attempt(s)")]
    AlreadyRunning { retries: u32 },

    #[error("`{command}` failed: {raw}")]
    CommandFailed { command: String, raw: String },

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("deployment cancelled")]
    Cancelled,

    #[error("{0}")]
    InvalidTransition(String),
}

impl LifecycleError {
    pub fn kind(&self) -> FailureKind {
        match self {
            LifecycleError::Extraction { .. } => FailureKind::Extraction,
            LifecycleError::DependencyMissing { .. } => FailureKind::DependencyMissing,
            LifecycleError::AlreadyRunning { .. } => FailureKind::AlreadyRunning,
            LifecycleError::CommandFailed { .. } | LifecycleError::InvalidTransition(_) => {
                FailureKind::CommandFailed
            }
            LifecycleError::Transport(e) => e.kind(),
            LifecycleError::Cancelled => FailureKind::Cancelled,
        }
    }
}

/// Outcome of one driver run
#[derive(Debug, Clone)]
pub struct LifecycleReport {
    pub final_state: LifecycleState,

    /// Events seen while starting the lab, and the event that failed it
    pub events: Vec<LifecycleEvent>,

    /// Times the start command was reissued
    pub retries: u32,

    pub error: Option<LifecycleError>,
}

impl LifecycleReport {
    pub fn is_started(&self) -> bool {
        self.final_state == LifecycleState::Started
    }
}

/// How output of a command is watched
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Watch {
    /// Classify lines, report nothing while the command runs
    Quiet,

    /// Record and publish events as they arrive; stop at the first decisive one
    Live,
}

#[derive(Debug, Default)]
struct CommandRun {
    /// `None` when consumption stopped before the command exited
    status: Option<i32>,
    events: Vec<LifecycleEvent>,
    tail: VecDeque<String>,
}

impl CommandRun {
    fn push_line(&mut self, line: String) {
        if self.tail.len() == TAIL_LINES {
            self.tail.pop_front();
        }
        self.tail.push_back(line);
    }

    fn saw(&self, wanted: &LifecycleEvent) -> bool {
        self.events.iter().any(|e| e == wanted)
    }

    fn missing_tool(&self) -> Option<String> {
        self.events.iter().find_map(|e| match e {
            LifecycleEvent::DependencyMissing(tool) => Some(tool.clone()),
            _ => None,
        })
    }

    /// Output tail, or the exit status when the command printed nothing
    fn raw(&self) -> String {
        if self.tail.is_empty() {
            match self.status {
                Some(status) => format!("exit status {}", status),
                None => "no output".to_string(),
            }
        } else {
            self.tail.iter().cloned().collect::<Vec<_>>().join("\n")
        }
    }
}

/// Drives one host through the lab lifecycle
pub struct LifecycleDriver {
    host: String,
    script: LabScript,
    settings: DriverSettings,
    watcher: Arc<PatternWatcher>,
    sink: Arc<dyn NotificationSink>,
    shutdown: Shutdown,
    fsm: LifecycleFsm,
    events: Vec<LifecycleEvent>,
}

impl LifecycleDriver {
    pub fn new(
        host: &str,
        script: LabScript,
        settings: DriverSettings,
        watcher: Arc<PatternWatcher>,
        sink: Arc<dyn NotificationSink>,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            host: host.to_string(),
            script,
            settings,
            watcher,
            sink,
            shutdown,
            fsm: LifecycleFsm::new(),
            events: Vec::new(),
        }
    }

    /// Run the whole lifecycle. The session is left open for the caller to close.
    pub async fn run(mut self, session: &mut dyn RemoteSession) -> LifecycleReport {
        let result = self.drive(session).await;

        if let Err(ref e) = result {
            warn!("Lab lifecycle failed in {:?}: {}", self.fsm.state(), e);
            if let Err(transition) = self.fsm.process(LifecycleInput::Fail(e.to_string())) {
                debug!("{}", transition);
            }
        }

        LifecycleReport {
            final_state: self.fsm.state(),
            events: self.events,
            retries: self.fsm.retry_count(),
            error: result.err(),
        }
    }

    async fn drive(&mut self, session: &mut dyn RemoteSession) -> Result<(), LifecycleError> {
        self.transition(LifecycleInput::Connect)?;

        // Cleaning
        self.transition(LifecycleInput::Cleanup)?;
        for step in self.script.cleanup() {
            let run = self
                .run_command(session, &step.command, Watch::Quiet)
                .await?;
            if run.status != Some(0) {
                warn!("Cleanup step `{}` failed: {}", step.command, run.raw());
            }
        }
        self.transition(LifecycleInput::CleanupDone)?;

        // Extracting
        for step in self.script.extract() {
            let run = self
                .run_command(session, &step.command, Watch::Quiet)
                .await?;
            if run.status == Some(0) {
                continue;
            }
            if !step.fatal {
                warn!("`{}` failed: {}", step.command, run.raw());
                continue;
            }
            if let Some(tool) = run.missing_tool() {
                return Err(self.dependency_missing(tool));
            }
            return Err(LifecycleError::Extraction {
                command: step.command,
                reason: run.raw(),
            });
        }
        self.transition(LifecycleInput::Extracted)?;

        // Verifying
        for (tool, command) in self.script.verify() {
            let run = self.run_command(session, &command, Watch::Quiet).await?;
            if run.status != Some(0) {
                return Err(self.dependency_missing(tool));
            }
        }
        self.transition(LifecycleInput::Verified)?;

        // Starting
        let start = self.script.start().to_string();
        loop {
            let run = self.run_command(session, &start, Watch::Live).await?;

            if run.saw(&LifecycleEvent::LabStarted) {
                self.transition(LifecycleInput::LabStarted)?;
                info!("Lab started in {}", self.script.lab_dir());
                if let Err(e) = session.send(&self.script.exit()).await {
                    warn!("Unable to end the remote shell: {}", e);
                }
                return Ok(());
            }

            if let Some(tool) = run.missing_tool() {
                return Err(LifecycleError::DependencyMissing { tool });
            }

            if run.saw(&LifecycleEvent::AlreadyRunning) {
                if !self.fsm.can_retry(MAX_START_RETRIES) {
                    return Err(LifecycleError::AlreadyRunning {
                        retries: self.fsm.retry_count(),
                    });
                }
                self.transition(LifecycleInput::AlreadyRunning)?;
                info!(
                    "Lab already running, retrying in {:?}",
                    self.settings.retry_delay
                );
                self.pause(self.settings.retry_delay).await?;
                self.transition(LifecycleInput::Reissue)?;
                continue;
            }

            let raw = match run.status {
                Some(0) => "start command ended without reporting the lab as started".to_string(),
                _ => run.raw(),
            };
            self.record(LifecycleEvent::CommandFailed(raw.clone()));
            return Err(LifecycleError::CommandFailed {
                command: start,
                raw,
            });
        }
    }

    async fn run_command(
        &mut self,
        session: &mut dyn RemoteSession,
        command: &str,
        watch: Watch,
    ) -> Result<CommandRun, LifecycleError> {
        if self.shutdown.is_triggered() {
            return Err(LifecycleError::Cancelled);
        }

        debug!("$ {}", command);
        let mut output = session.execute(command).await?;
        let mut run = CommandRun::default();

        loop {
            let item = tokio::select! {
                _ = self.shutdown.wait() => return Err(LifecycleError::Cancelled),
                item = output.next() => item,
            };

            match item {
                Some(OutputEvent::Line(line)) => {
                    let event = self.watcher.classify(&self.host, &line);
                    run.push_line(line);
                    let Some(event) = event else { continue };

                    let decisive = event.is_decisive();
                    if watch == Watch::Live {
                        self.record(event.clone());
                    }
                    run.events.push(event);
                    if decisive && watch == Watch::Live {
                        return Ok(run);
                    }
                }
                Some(OutputEvent::Exit(status)) => {
                    run.status = Some(status);
                    return Ok(run);
                }
                Some(OutputEvent::Error(e)) => return Err(e.into()),
                None => {
                    return Err(TransportError::Closed(
                        "command output already consumed".to_string(),
                    )
                    .into())
                }
            }
        }
    }

    async fn pause(&mut self, delay: Duration) -> Result<(), LifecycleError> {
        tokio::select! {
            _ = self.shutdown.wait() => Err(LifecycleError::Cancelled),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }

    fn dependency_missing(&mut self, tool: String) -> LifecycleError {
        self.record(LifecycleEvent::DependencyMissing(tool.clone()));
        LifecycleError::DependencyMissing { tool }
    }

    fn record(&mut self, event: LifecycleEvent) {
        let notification = match &event {
            LifecycleEvent::NodeStarting(node) => Some(Notification::Starting {
                host: self.host.clone(),
                node: node.clone(),
            }),
            LifecycleEvent::LabStarted => Some(Notification::LabStarted {
                host: self.host.clone(),
            }),
            LifecycleEvent::DependencyMissing(tool) => Some(Notification::DependencyMissing {
                host: self.host.clone(),
                tool: tool.clone(),
            }),
            LifecycleEvent::CommandFailed(_) | LifecycleEvent::AlreadyRunning => None,
        };
        if let Some(notification) = notification {
            self.sink.publish(&notification);
        }
        self.events.push(event);
    }

    fn transition(&mut self, input: LifecycleInput) -> Result<(), LifecycleError> {
        self.fsm
            .process(input)
            .map_err(LifecycleError::InvalidTransition)?;
        debug!("Lifecycle state: {:?}", self.fsm.state());
        Ok(())
    }
}
