//! Main application run loop

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::app::options::AppOptions;
use crate::config::settings::{HostLookup, Settings};
use crate::deploy::coordinator::Coordinator;
use crate::deploy::packager::{Archive, Packager};
use crate::errors::LabError;
use crate::models::result::DeploymentReport;
use crate::notify::mqtt::MqttSink;
use crate::notify::{MultiSink, NotificationSink, TracingSink};
use crate::shutdown::{self, Shutdown};
use crate::transport::ssh::SshConnector;

/// Deploy the configured hosts over SSH.
///
/// When `shutdown_signal` resolves first, hosts still in progress are
/// cancelled and reported as such; the report is still returned.
pub async fn run(
    settings: Arc<Settings>,
    options: AppOptions,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<DeploymentReport, LabError> {
    info!("Initializing labdeploy...");

    let (trigger, shutdown) = shutdown::channel();
    let notifications = Notifications::init(&settings, shutdown.clone());

    let connector = Arc::new(SshConnector::new(
        settings.deploy.connect_timeout(),
        settings.deploy.command_timeout(),
    ));
    let mut coordinator = Coordinator::new(
        settings.clone(),
        connector,
        notifications.sink.clone(),
        shutdown,
    )?;
    if let Some(parallelism) = options.parallelism {
        coordinator = coordinator.with_parallelism(parallelism);
    }

    let hosts = options.resolve_hosts(&settings);
    if hosts.is_empty() {
        warn!("No hosts to deploy");
    }

    let deployment = coordinator.deploy(&hosts);
    tokio::pin!(deployment);
    tokio::pin!(shutdown_signal);

    let report = tokio::select! {
        report = &mut deployment => report,
        _ = &mut shutdown_signal => {
            info!("Shutdown signal received, cancelling remaining hosts...");
            trigger.trigger();
            deployment.await
        }
    };

    notifications.shutdown(options.max_shutdown_delay).await;
    Ok(report)
}

/// Package the rendered configuration of each host without deploying it
pub async fn package(
    settings: &Settings,
    options: &AppOptions,
) -> Vec<(String, Result<Archive, LabError>)> {
    let layout = settings.layout();
    let packager = Packager::new(layout.archive_dir());
    let mut archives = Vec::new();

    for host in crate::compile::dispatcher::dedup(&options.resolve_hosts(settings)) {
        let result = match settings.lookup(&host) {
            HostLookup::Found { platform, .. } => {
                let source = layout.rendered_dir(&host, platform);
                let name = format!("{}_{}", settings.deploy.archive_name, host);
                packager.package(source.path(), &name).await
            }
            HostLookup::Missing => Err(LabError::ConfigError(format!(
                "Host {} not defined in configuration",
                host
            ))),
            HostLookup::NoPlatform => Err(LabError::ConfigError(format!(
                "No platform defined for {}",
                host
            ))),
            HostLookup::UnknownPlatform(platform) => Err(LabError::ConfigError(format!(
                "Unknown platform {} for {}",
                platform, host
            ))),
        };
        archives.push((host, result));
    }

    archives
}

// ============================== NOTIFICATIONS =================================== //

struct Notifications {
    sink: Arc<dyn NotificationSink>,
    mqtt: Option<(Arc<MqttSink>, JoinHandle<()>)>,
}

impl Notifications {
    fn init(settings: &Settings, shutdown: Shutdown) -> Self {
        let Some(mqtt_settings) = settings.mqtt.as_ref() else {
            info!("MQTT not configured, notifications are logged only");
            return Self {
                sink: Arc::new(TracingSink),
                mqtt: None,
            };
        };

        match MqttSink::connect(mqtt_settings, shutdown) {
            Ok((sink, handle)) => {
                let sink = Arc::new(sink);
                Self {
                    sink: Arc::new(MultiSink::new().with(Arc::new(TracingSink)).with(sink.clone())),
                    mqtt: Some((sink, handle)),
                }
            }
            Err(e) => {
                error!("Failed to create MQTT client, notifications are logged only: {}", e);
                Self {
                    sink: Arc::new(TracingSink),
                    mqtt: None,
                }
            }
        }
    }

    /// Flush queued MQTT messages, giving up after `max_delay`
    async fn shutdown(self, max_delay: Duration) {
        let Some((sink, handle)) = self.mqtt else {
            return;
        };
        if let Err(e) = sink.disconnect().await {
            warn!("{}", e);
            handle.abort();
            return;
        }
        if !join_or_abort(handle, max_delay).await {
            warn!(
                "MQTT notifications not flushed after {:?}, dropping them",
                max_delay
            );
        }
    }
}

/// Wait for `handle` up to `max_delay`, aborting the task past it.
/// Returns `false` when the task had to be aborted.
async fn join_or_abort(mut handle: JoinHandle<()>, max_delay: Duration) -> bool {
    match tokio::time::timeout(max_delay, &mut handle).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            warn!("MQTT event loop ended abnormally: {}", e);
            true
        }
        Err(_) => {
            handle.abort();
            false
        }
    }
}
