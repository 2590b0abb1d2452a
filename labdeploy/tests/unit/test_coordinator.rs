//! Coordinator tests with scripted remote hosts

use std::sync::Arc;

use serde_json::json;
use tempfile::TempDir;

use labdeploy::compile::dispatcher::CompilerDispatcher;
use labdeploy::config::settings::Settings;
use labdeploy::deploy::coordinator::Coordinator;
use labdeploy::errors::FailureKind;
use labdeploy::models::result::DeploymentResult;
use labdeploy::notify::memory::MemorySink;
use labdeploy::notify::Notification;
use labdeploy::shutdown::{self, Shutdown};

use crate::fakes::{render, settings, FakeConnector, Script, StartupCompiler, TwoRouters};

fn hosts(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

fn coordinator(
    settings: Settings,
    connector: &Arc<FakeConnector>,
    sink: &Arc<MemorySink>,
    shutdown: Shutdown,
) -> Coordinator {
    Coordinator::new(Arc::new(settings), connector.clone(), sink.clone(), shutdown).unwrap()
}

fn netkit_hosts() -> serde_json::Value {
    json!({
        "nk1": {"host": "10.0.0.1", "platform": "netkit", "username": "ank", "password": "pw"},
        "nk2": {"host": "10.0.0.2", "platform": "netkit", "username": "ank", "password": "pw"},
        "nk3": {"host": "10.0.0.3", "platform": "netkit", "username": "ank", "password": "pw"},
    })
}

#[tokio::test]
async fn test_misconfigured_hosts_never_connect() {
    let workspace = TempDir::new().unwrap();
    let settings = settings(
        workspace.path(),
        json!({
            "bare": {"host": "10.0.0.2"},
            "odd": {"host": "10.0.0.3", "platform": "olive"},
        }),
    );
    let connector = Arc::new(FakeConnector::new());
    let sink = Arc::new(MemorySink::new());

    let report = coordinator(settings, &connector, &sink, Shutdown::never())
        .deploy(&hosts(&["missing", "bare", "odd"]))
        .await;

    assert_eq!(connector.connects(), 0);
    assert_eq!(report.get("missing"), Some(&DeploymentResult::SkippedNoConfig));
    assert_eq!(report.get("bare"), Some(&DeploymentResult::SkippedNoPlatform));
    assert_eq!(
        report.get("odd"),
        Some(&DeploymentResult::SkippedUnknownPlatform {
            platform: "olive".to_string()
        })
    );
    assert!(!report.has_failures());
}

#[tokio::test]
async fn test_netkit_host_is_started() {
    let workspace = TempDir::new().unwrap();
    render(workspace.path(), "nk1", "netkit");
    let settings = settings(workspace.path(), netkit_hosts());
    let connector = Arc::new(FakeConnector::new().with_script("nk1", Script::lab_starts()));
    let sink = Arc::new(MemorySink::new());

    let report = coordinator(settings, &connector, &sink, Shutdown::never())
        .deploy(&hosts(&["nk1"]))
        .await;

    assert_eq!(report.get("nk1"), Some(&DeploymentResult::Succeeded));
    assert_eq!(connector.connects(), 1);
    assert!(workspace.path().join("archives/nklab_nk1.tar.gz").exists());

    let log = connector.log("nk1").unwrap();
    let log = log.lock().unwrap();
    assert_eq!(log.uploads, vec!["nklab_nk1.tar.gz".to_string()]);
    assert!(log.commands.contains(&"tar -xzf nklab_nk1.tar.gz".to_string()));
    assert!(log.commands.contains(&"cd nk1_netkit".to_string()));
    assert_eq!(log.exits_sent(), 1);
    assert!(log.closed);

    assert_eq!(
        sink.for_host("nk1").last(),
        Some(&Notification::HostResult {
            host: "nk1".to_string(),
            result: DeploymentResult::Succeeded
        })
    );
}

#[tokio::test]
async fn test_one_failing_host_does_not_affect_others() {
    let workspace = TempDir::new().unwrap();
    for host in ["nk1", "nk2", "nk3"] {
        render(workspace.path(), host, "netkit");
    }
    let settings = settings(workspace.path(), netkit_hosts());
    let connector = Arc::new(
        FakeConnector::new()
            .with_script("nk1", Script::lab_starts())
            .with_script("nk3", Script::lab_starts())
            .with_unreachable("nk2"),
    );
    let sink = Arc::new(MemorySink::new());

    let report = coordinator(settings, &connector, &sink, Shutdown::never())
        .deploy(&hosts(&["nk3", "nk2", "nk1", "nk3"]))
        .await;

    assert_eq!(report.len(), 3);
    let order: Vec<&str> = report.entries.iter().map(|e| e.host.as_str()).collect();
    assert_eq!(order, vec!["nk3", "nk2", "nk1"]);
    assert_eq!(report.failures().count(), 1);
    assert!(matches!(
        report.get("nk2"),
        Some(DeploymentResult::Failed {
            kind: FailureKind::Connection,
            ..
        })
    ));
    assert_eq!(report.get("nk1"), Some(&DeploymentResult::Succeeded));
    assert_eq!(report.get("nk3"), Some(&DeploymentResult::Succeeded));
    assert_eq!(connector.connects(), 3);
}

#[tokio::test]
async fn test_sequential_deploy_matches_parallel() {
    let workspace = TempDir::new().unwrap();
    for host in ["nk1", "nk2"] {
        render(workspace.path(), host, "netkit");
    }
    let settings = settings(workspace.path(), netkit_hosts());
    let connector = Arc::new(
        FakeConnector::new()
            .with_script("nk1", Script::lab_starts())
            .with_script("nk2", Script::lab_starts()),
    );
    let sink = Arc::new(MemorySink::new());

    let report = coordinator(settings, &connector, &sink, Shutdown::never())
        .with_parallelism(1)
        .deploy(&hosts(&["nk1", "nk2"]))
        .await;

    assert_eq!(report.len(), 2);
    assert!(!report.has_failures());
}

#[tokio::test]
async fn test_platform_routing() {
    let workspace = TempDir::new().unwrap();
    render(workspace.path(), "c1", "cisco");
    let settings = settings(
        workspace.path(),
        json!({
            "c1": {"host": "internal", "platform": "cisco"},
            "d1": {"host": "10.0.0.9", "platform": "dynagen"},
            "j1": {"host": "internal", "platform": "junosphere"},
            "localhost": {"host": "127.0.0.1", "platform": "netkit"},
        }),
    );
    let connector = Arc::new(FakeConnector::new());
    let sink = Arc::new(MemorySink::new());

    let report = coordinator(settings, &connector, &sink, Shutdown::never())
        .deploy(&hosts(&["c1", "d1", "j1", "localhost"]))
        .await;

    assert_eq!(connector.connects(), 0);
    assert_eq!(
        report.get("c1"),
        Some(&DeploymentResult::Packaged {
            archive: workspace.path().join("archives/nklab_c1.tar.gz")
        })
    );
    assert_eq!(
        report.get("d1"),
        Some(&DeploymentResult::SkippedNoDeployer {
            platform: "dynagen".to_string()
        })
    );
    assert_eq!(
        report.get("j1"),
        Some(&DeploymentResult::SkippedNoDeployer {
            platform: "junosphere".to_string()
        })
    );
    assert_eq!(report.get("localhost"), Some(&DeploymentResult::SkippedLocal));
}

#[tokio::test]
async fn test_missing_rendered_directory() {
    let workspace = TempDir::new().unwrap();
    let settings = settings(workspace.path(), netkit_hosts());
    let connector = Arc::new(FakeConnector::new().with_script("nk1", Script::lab_starts()));
    let sink = Arc::new(MemorySink::new());

    let report = coordinator(settings, &connector, &sink, Shutdown::never())
        .deploy(&hosts(&["nk1"]))
        .await;

    assert!(matches!(
        report.get("nk1"),
        Some(DeploymentResult::Failed {
            kind: FailureKind::Packaging,
            ..
        })
    ));
    assert_eq!(connector.connects(), 0);
}

#[tokio::test]
async fn test_missing_address_is_misconfigured() {
    let workspace = TempDir::new().unwrap();
    let settings = settings(workspace.path(), json!({"nk1": {"platform": "netkit"}}));
    let connector = Arc::new(FakeConnector::new());
    let sink = Arc::new(MemorySink::new());

    let report = coordinator(settings, &connector, &sink, Shutdown::never())
        .deploy(&hosts(&["nk1"]))
        .await;

    assert!(matches!(
        report.get("nk1"),
        Some(DeploymentResult::Failed {
            kind: FailureKind::Configuration,
            ..
        })
    ));
    assert_eq!(connector.connects(), 0);
}

#[tokio::test]
async fn test_shutdown_cancels_pending_hosts() {
    let workspace = TempDir::new().unwrap();
    render(workspace.path(), "nk1", "netkit");
    let settings = settings(workspace.path(), netkit_hosts());
    let connector = Arc::new(FakeConnector::new().with_script("nk1", Script::lab_starts()));
    let sink = Arc::new(MemorySink::new());
    let (trigger, shutdown) = shutdown::channel();
    trigger.trigger();

    let report = coordinator(settings, &connector, &sink, shutdown)
        .deploy(&hosts(&["nk1", "nk2"]))
        .await;

    assert_eq!(report.len(), 2);
    assert!(report.entries.iter().all(|entry| matches!(
        entry.result,
        DeploymentResult::Failed {
            kind: FailureKind::Cancelled,
            ..
        }
    )));
    assert_eq!(connector.connects(), 0);
}

#[tokio::test]
async fn test_compile_then_deploy() {
    let workspace = TempDir::new().unwrap();
    let dispatcher = CompilerDispatcher::new(Arc::new(settings(workspace.path(), netkit_hosts())))
        .register(Arc::new(StartupCompiler::failing_for("nk2")));
    let connector = Arc::new(FakeConnector::new().with_script("nk1", Script::lab_starts()));
    let sink = Arc::new(MemorySink::new());

    let settings = settings(workspace.path(), netkit_hosts());
    let report = coordinator(settings, &connector, &sink, Shutdown::never())
        .compile_and_deploy(&dispatcher, &TwoRouters, &hosts(&["nk1", "nk2", "gone"]))
        .await;

    assert_eq!(report.len(), 3);
    assert_eq!(report.get("nk1"), Some(&DeploymentResult::Succeeded));
    assert!(matches!(
        report.get("nk2"),
        Some(DeploymentResult::Failed {
            kind: FailureKind::Compilation,
            ..
        })
    ));
    assert_eq!(report.get("gone"), Some(&DeploymentResult::SkippedNoConfig));
    assert_eq!(connector.connects(), 1);
    assert_eq!(sink.for_host("nk2").len(), 1);
}
