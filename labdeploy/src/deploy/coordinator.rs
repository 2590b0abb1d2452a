//! Deployment coordinator
//!
//! Runs every requested host through packaging, upload and the lab lifecycle,
//! independently and up to `parallelism` hosts at a time. Whatever happens to
//! one host ends up in that host's [`DeploymentResult`]; nothing short of the
//! shutdown signal stops the others.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::compile::dispatcher::{dedup, CompilerDispatcher};
use crate::compile::{CompileOutcome, NetworkModel};
use crate::config::layout::LabLayout;
use crate::config::settings::{HostLookup, Settings};
use crate::deploy::driver::{DriverSettings, LifecycleDriver};
use crate::deploy::packager::{Archive, Packager};
use crate::deploy::script::LabScript;
use crate::deploy::watcher::PatternWatcher;
use crate::errors::{FailureKind, LabError};
use crate::models::result::{DeploymentReport, DeploymentResult, HostReport};
use crate::models::target::{Platform, TargetHost, LOCALHOST};
use crate::notify::{Notification, NotificationSink};
use crate::shutdown::Shutdown;
use crate::transport::{Connector, RemoteSession};

/// Deploys labs to the hosts of a settings file
pub struct Coordinator {
    settings: Arc<Settings>,
    layout: LabLayout,
    packager: Packager,
    connector: Arc<dyn Connector>,
    sink: Arc<dyn NotificationSink>,
    watcher: Arc<PatternWatcher>,
    shutdown: Shutdown,
    parallelism: usize,
}

impl Coordinator {
    pub fn new(
        settings: Arc<Settings>,
        connector: Arc<dyn Connector>,
        sink: Arc<dyn NotificationSink>,
        shutdown: Shutdown,
    ) -> Result<Self, LabError> {
        let layout = settings.layout();
        let parallelism = settings.deploy.parallelism.max(1);
        let watcher = PatternWatcher::lab_lifecycle(&settings.deploy.required_tools)?;
        Ok(Self {
            packager: Packager::new(layout.archive_dir()),
            layout,
            settings,
            connector,
            sink,
            watcher: Arc::new(watcher),
            shutdown,
            parallelism,
        })
    }

    /// Override the number of hosts deployed at once. `1` deploys sequentially.
    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism.max(1);
        self
    }

    /// Deploy to every distinct host, one report entry per host in request order
    pub async fn deploy(&self, hosts: &[String]) -> DeploymentReport {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let hosts = dedup(hosts);

        let entries = async {
            info!(
                "Deploying {} host(s), {} at a time",
                hosts.len(),
                self.parallelism
            );

            let mut results: Vec<(usize, HostReport)> = stream::iter(hosts.into_iter().enumerate())
                .map(|(index, host)| async move {
                    let result = self
                        .deploy_host(&host)
                        .instrument(info_span!("host", host = %host))
                        .await;
                    (index, HostReport { host, result })
                })
                .buffer_unordered(self.parallelism)
                .collect()
                .await;

            results.sort_by_key(|(index, _)| *index);
            results
                .into_iter()
                .map(|(_, entry)| entry)
                .collect::<Vec<_>>()
        }
        .instrument(info_span!("deploy", run_id = %run_id))
        .await;

        let report = DeploymentReport {
            run_id,
            started_at,
            finished_at: Utc::now(),
            entries,
        };
        log_summary(&report);
        report
    }

    /// Compile every host, then deploy the ones that compiled
    pub async fn compile_and_deploy(
        &self,
        dispatcher: &CompilerDispatcher,
        model: &dyn NetworkModel,
        hosts: &[String],
    ) -> DeploymentReport {
        let started_at = Utc::now();
        let outcomes = dispatcher.compile_all(model, hosts).await;

        let compiled: Vec<String> = outcomes
            .iter()
            .filter(|(_, outcome)| outcome.is_compiled())
            .map(|(host, _)| host.clone())
            .collect();
        let mut report = self.deploy(&compiled).await;

        let mut deployed: HashMap<String, DeploymentResult> = report
            .entries
            .drain(..)
            .map(|entry| (entry.host, entry.result))
            .collect();

        report.entries = outcomes
            .into_iter()
            .map(|(host, outcome)| {
                let result = match outcome {
                    CompileOutcome::Compiled { .. } => deployed.remove(&host).unwrap_or_else(|| {
                        DeploymentResult::failed(FailureKind::Cancelled, "host was not deployed")
                    }),
                    CompileOutcome::NotCompiled(result) => {
                        self.sink.publish(&Notification::HostResult {
                            host: host.clone(),
                            result: result.clone(),
                        });
                        result
                    }
                };
                HostReport { host, result }
            })
            .collect();
        report.started_at = started_at;
        report
    }

    /// Deploy one host and publish its result
    pub async fn deploy_host(&self, host: &str) -> DeploymentResult {
        let result = self.deploy_host_inner(host).await;
        match &result {
            DeploymentResult::Failed { .. } => warn!("{}", result),
            _ => info!("{}", result),
        }
        self.sink.publish(&Notification::HostResult {
            host: host.to_string(),
            result: result.clone(),
        });
        result
    }

    async fn deploy_host_inner(&self, host: &str) -> DeploymentResult {
        if self.shutdown.is_triggered() {
            return cancelled();
        }

        let (record, platform) = match self.settings.lookup(host) {
            HostLookup::Missing => {
                warn!("Host {} not defined in configuration", host);
                return DeploymentResult::SkippedNoConfig;
            }
            HostLookup::NoPlatform => {
                warn!("No platform defined for {}", host);
                return DeploymentResult::SkippedNoPlatform;
            }
            HostLookup::UnknownPlatform(platform) => {
                warn!("Unknown platform {} for {}", platform, host);
                return DeploymentResult::SkippedUnknownPlatform { platform };
            }
            HostLookup::Found { record, platform } => (record, platform),
        };

        if host == LOCALHOST {
            info!("localhost labs are started outside labdeploy");
            return DeploymentResult::SkippedLocal;
        }

        let rendered_dir = self.layout.rendered_dir(host, platform);
        let target = match TargetHost::from_record(
            host,
            record,
            platform,
            rendered_dir.path().to_path_buf(),
        ) {
            Ok(target) => target,
            Err(e) => {
                warn!("{}", e);
                return DeploymentResult::failed(e.kind(), e.to_string());
            }
        };

        match (target.is_internal(), platform) {
            (_, Platform::Cisco) => self.package_only(&target).await,
            (false, Platform::Netkit) => self.deploy_netkit(&target).await,
            (_, platform) => {
                info!("No deployment available for {} on {}", platform, host);
                DeploymentResult::SkippedNoDeployer {
                    platform: platform.to_string(),
                }
            }
        }
    }

    fn archive_name(&self, host: &str) -> String {
        format!("{}_{}", self.settings.deploy.archive_name, host)
    }

    async fn package(&self, target: &TargetHost) -> Result<Archive, DeploymentResult> {
        self.packager
            .package(&target.rendered_dir, &self.archive_name(&target.id))
            .await
            .map_err(|e| DeploymentResult::failed(FailureKind::Packaging, e.to_string()))
    }

    async fn package_only(&self, target: &TargetHost) -> DeploymentResult {
        match self.package(target).await {
            Ok(archive) => DeploymentResult::Packaged {
                archive: archive.path,
            },
            Err(result) => result,
        }
    }

    async fn deploy_netkit(&self, target: &TargetHost) -> DeploymentResult {
        let archive = match self.package(target).await {
            Ok(archive) => archive,
            Err(result) => return result,
        };

        if self.shutdown.is_triggered() {
            return cancelled();
        }

        info!("Connecting to {}:{}", target.address, target.port);
        let mut session = match self.connector.connect(target).await {
            Ok(session) => session,
            Err(e) => return DeploymentResult::failed(e.kind(), e.to_string()),
        };

        let result = self.run_session(session.as_mut(), target, &archive).await;

        if let Err(e) = session.close().await {
            warn!("Closing session to {} failed: {}", target.address, e);
        }
        result
    }

    async fn run_session(
        &self,
        session: &mut dyn RemoteSession,
        target: &TargetHost,
        archive: &Archive,
    ) -> DeploymentResult {
        let remote_name = archive.file_name();
        info!("Transferring {} to {}", remote_name, target.address);
        if let Err(e) = session.put(&archive.path, &remote_name).await {
            return DeploymentResult::failed(e.kind(), e.to_string());
        }

        let script = LabScript::new(&archive.root, &remote_name, &self.settings.deploy);
        let driver = LifecycleDriver::new(
            &target.id,
            script,
            DriverSettings::from(&self.settings.deploy),
            self.watcher.clone(),
            self.sink.clone(),
            self.shutdown.clone(),
        );

        let report = driver.run(session).await;
        match report.error {
            None if report.is_started() => DeploymentResult::Succeeded,
            Some(e) => DeploymentResult::failed(e.kind(), e.to_string()),
            None => DeploymentResult::failed(
                FailureKind::CommandFailed,
                format!("lab lifecycle stopped in {:?}", report.final_state),
            ),
        }
    }
}

fn cancelled() -> DeploymentResult {
    DeploymentResult::failed(FailureKind::Cancelled, "deployment cancelled")
}

fn log_summary(report: &DeploymentReport) {
    let failed = report.failures().count();
    let skipped = report.entries.iter().filter(|e| e.result.is_skip()).count();
    info!(
        run_id = %report.run_id,
        "Deployment finished: {} host(s), {} skipped, {} failed",
        report.len(),
        skipped,
        failed
    );
}
