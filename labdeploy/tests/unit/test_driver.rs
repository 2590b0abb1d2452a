//! Lifecycle driver tests against scripted sessions

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use labdeploy::config::settings::DeploySettings;
use labdeploy::deploy::driver::{
    DriverSettings, LifecycleDriver, LifecycleError, LifecycleReport, MAX_START_RETRIES,
};
use labdeploy::deploy::fsm::LifecycleState;
use labdeploy::deploy::script::LabScript;
use labdeploy::deploy::watcher::PatternWatcher;
use labdeploy::errors::FailureKind;
use labdeploy::models::event::LifecycleEvent;
use labdeploy::notify::memory::MemorySink;
use labdeploy::notify::Notification;
use labdeploy::shutdown::{self, Shutdown};
use labdeploy::transport::{OutputEvent, TransportError};

use crate::fakes::{lines, FakeSession, Script, SessionLog, START};

const ARCHIVE: &str = "nklab_nk1.tar.gz";
const VERIFY: &str = "command -v lstart";

fn driver(sink: Arc<MemorySink>, shutdown: Shutdown) -> LifecycleDriver {
    driver_with(&DeploySettings::default(), sink, shutdown)
}

fn driver_with(
    deploy: &DeploySettings,
    sink: Arc<MemorySink>,
    shutdown: Shutdown,
) -> LifecycleDriver {
    let script = LabScript::new(Path::new("nk1_netkit"), ARCHIVE, deploy);
    LifecycleDriver::new(
        "nk1",
        script,
        DriverSettings {
            retry_delay: Duration::from_secs(1),
        },
        Arc::new(PatternWatcher::lab_lifecycle(&deploy.required_tools).unwrap()),
        sink,
        shutdown,
    )
}

async fn run(script: Script) -> (LifecycleReport, SessionLog, Arc<MemorySink>) {
    let sink = Arc::new(MemorySink::new());
    let (mut session, log) = FakeSession::new(script);
    let report = driver(sink.clone(), Shutdown::never()).run(&mut session).await;
    let log = std::mem::take(&mut *log.lock().unwrap());
    (report, log, sink)
}

#[tokio::test]
async fn test_lab_starts() {
    let (report, log, sink) = run(Script::lab_starts()).await;

    assert_eq!(report.final_state, LifecycleState::Started);
    assert!(report.error.is_none());
    assert_eq!(report.retries, 0);
    assert_eq!(
        report.events,
        vec![
            LifecycleEvent::NodeStarting("nodeA".to_string()),
            LifecycleEvent::NodeStarting("nodeB".to_string()),
            LifecycleEvent::LabStarted,
        ]
    );
    assert_eq!(log.exits_sent(), 1);
    assert_eq!(log.count(START), 1);
    assert!(!log.closed);

    assert_eq!(
        sink.messages(),
        vec![
            Notification::Starting {
                host: "nk1".to_string(),
                node: "nodeA".to_string()
            },
            Notification::Starting {
                host: "nk1".to_string(),
                node: "nodeB".to_string()
            },
            Notification::LabStarted {
                host: "nk1".to_string()
            },
        ]
    );
}

#[tokio::test]
async fn test_command_order() {
    let (_, log, _) = run(Script::lab_starts()).await;
    assert_eq!(
        log.commands,
        vec![
            "cd nk1_netkit",
            "lhalt -q",
            "lcrash -k",
            "lclean",
            "cd",
            "rm -Rf nk1_netkit",
            "tar -xzf nklab_nk1.tar.gz",
            "cd nk1_netkit",
            "vlist",
            "lclean",
            VERIFY,
            START,
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_already_running_retries_once() {
    let script = Script::new()
        .on(START, lines(&["Error: lab already running"], 1))
        .on(START, lines(&["Starting r1", "The lab has been started"], 0));
    let (report, log, _) = run(script).await;

    assert_eq!(report.final_state, LifecycleState::Started);
    assert_eq!(report.retries, 1);
    assert_eq!(log.count(START), 2);
    assert_eq!(log.exits_sent(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_already_running_twice_fails() {
    let script = Script::new()
        .on(START, lines(&["Error: lab already running"], 1))
        .on(START, lines(&["Error: lab already running"], 1))
        .on(START, lines(&["The lab has been started"], 0));
    let (report, log, _) = run(script).await;

    assert_eq!(report.final_state, LifecycleState::Failed);
    assert_eq!(report.retries, 1);
    assert_eq!(report.error, Some(LifecycleError::AlreadyRunning { retries: 1 }));
    assert_eq!(log.count(START), 2);
    assert_eq!(log.exits_sent(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_retry_count_is_not_configurable() {
    let deploy: DeploySettings = serde_json::from_str(r#"{"start_retries": 0}"#).unwrap();
    assert_eq!(DriverSettings::from(&deploy).retry_delay, Duration::from_secs(1));

    let script = Script::new()
        .on(START, lines(&["Error: lab already running"], 1))
        .on(START, lines(&["The lab has been started"], 0));
    let sink = Arc::new(MemorySink::new());
    let (mut session, log) = FakeSession::new(script);
    let report = driver_with(&deploy, sink, Shutdown::never())
        .run(&mut session)
        .await;

    assert_eq!(report.final_state, LifecycleState::Started);
    assert_eq!(report.retries, MAX_START_RETRIES);
    assert_eq!(log.lock().unwrap().count(START), 2);
}

#[tokio::test]
async fn test_unrelated_not_found_during_start() {
    let script = Script::new().on(
        START,
        lines(
            &[
                "Starting \"r1\"...",
                "Warning: shared.startup: not found",
                "The lab has been started.",
            ],
            0,
        ),
    );
    let (report, log, sink) = run(script).await;

    assert_eq!(report.final_state, LifecycleState::Started);
    assert!(report.error.is_none());
    assert_eq!(
        report.events,
        vec![
            LifecycleEvent::NodeStarting("r1".to_string()),
            LifecycleEvent::LabStarted,
        ]
    );
    assert_eq!(log.exits_sent(), 1);
    assert!(!sink
        .messages()
        .iter()
        .any(|n| matches!(n, Notification::DependencyMissing { .. })));
}

#[tokio::test]
async fn test_lab_started_while_output_stays_open() {
    let script = Script::new().on_open(
        START,
        &["Starting nodeA", "The lab has been started", "Press Enter to continue"],
    );
    let sink = Arc::new(MemorySink::new());
    let (mut session, log) = FakeSession::new(script);

    let report = tokio::time::timeout(
        Duration::from_secs(5),
        driver(sink, Shutdown::never()).run(&mut session),
    )
    .await
    .unwrap();

    assert_eq!(report.final_state, LifecycleState::Started);
    assert_eq!(
        report.events,
        vec![
            LifecycleEvent::NodeStarting("nodeA".to_string()),
            LifecycleEvent::LabStarted,
        ]
    );
    assert_eq!(log.lock().unwrap().exits_sent(), 1);
}

#[tokio::test]
async fn test_missing_tool_during_start() {
    let script = Script::new().on(START, lines(&["Starting r1", "make: not found"], 127));
    let (report, log, sink) = run(script).await;

    assert_eq!(report.final_state, LifecycleState::Failed);
    assert_eq!(report.retries, 0);
    assert_eq!(
        report.error,
        Some(LifecycleError::DependencyMissing {
            tool: "make".to_string()
        })
    );
    assert_eq!(
        report.events.last(),
        Some(&LifecycleEvent::DependencyMissing("make".to_string()))
    );
    assert_eq!(log.count(START), 1);
    assert!(sink.messages().contains(&Notification::DependencyMissing {
        host: "nk1".to_string(),
        tool: "make".to_string()
    }));
}

#[tokio::test]
async fn test_missing_lab_tool_stops_before_start() {
    let script = Script::new().on(VERIFY, lines(&[], 1));
    let (report, log, _) = run(script).await;

    assert_eq!(report.error.as_ref().map(|e| e.kind()), Some(FailureKind::DependencyMissing));
    assert_eq!(
        report.events,
        vec![LifecycleEvent::DependencyMissing("lstart".to_string())]
    );
    assert_eq!(log.count(START), 0);
}

#[tokio::test]
async fn test_extraction_failure() {
    let script = Script::new().on(
        "tar -xzf nklab_nk1.tar.gz",
        lines(
            &["tar: nklab_nk1.tar.gz: Cannot open: No such file or directory"],
            2,
        ),
    );
    let (report, log, _) = run(script).await;

    let error = report.error.unwrap();
    assert_eq!(error.kind(), FailureKind::Extraction);
    assert!(error.to_string().contains("Cannot open"));
    assert_eq!(report.final_state, LifecycleState::Failed);
    assert_eq!(log.count(VERIFY), 0);
}

#[tokio::test]
async fn test_cleanup_failures_are_tolerated() {
    let script = Script::lab_starts()
        .on("lhalt -q", lines(&["lhalt: not found"], 127))
        .on("cd nk1_netkit", lines(&["cd: can't cd to nk1_netkit"], 2));
    let (report, _, sink) = run(script).await;

    assert!(report.is_started());
    assert!(!report
        .events
        .iter()
        .any(|e| matches!(e, LifecycleEvent::DependencyMissing(_))));
    assert!(!sink
        .messages()
        .iter()
        .any(|n| matches!(n, Notification::DependencyMissing { .. })));
}

#[tokio::test]
async fn test_start_without_lab_started() {
    let script = Script::new().on(START, lines(&["Starting r1"], 0));
    let (report, _, _) = run(script).await;

    assert_eq!(report.error.as_ref().map(|e| e.kind()), Some(FailureKind::CommandFailed));
    assert!(matches!(
        report.events.last(),
        Some(LifecycleEvent::CommandFailed(_))
    ));
}

#[tokio::test]
async fn test_transport_error_fails_lifecycle() {
    let script = Script::new().on(
        START,
        vec![
            OutputEvent::Line("Starting r1".to_string()),
            OutputEvent::Error(TransportError::Timeout("no exit status".to_string())),
        ],
    );
    let (report, _, _) = run(script).await;

    assert_eq!(report.final_state, LifecycleState::Failed);
    assert_eq!(report.error.as_ref().map(|e| e.kind()), Some(FailureKind::Timeout));
}

#[tokio::test]
async fn test_cancelled_before_first_command() {
    let (trigger, shutdown) = shutdown::channel();
    trigger.trigger();

    let sink = Arc::new(MemorySink::new());
    let (mut session, log) = FakeSession::new(Script::lab_starts());
    let report = driver(sink.clone(), shutdown).run(&mut session).await;

    assert_eq!(report.error, Some(LifecycleError::Cancelled));
    assert_eq!(report.final_state, LifecycleState::Failed);
    assert!(log.lock().unwrap().commands.is_empty());
    assert!(sink.is_empty());
}
