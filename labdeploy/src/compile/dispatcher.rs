//! Compiler selection per host

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{info, warn};

use crate::compile::{CompileContext, CompileOutcome, NetworkModel, PlatformCompiler};
use crate::config::layout::LabLayout;
use crate::config::settings::{HostLookup, Settings};
use crate::errors::FailureKind;
use crate::models::result::DeploymentResult;
use crate::models::target::Platform;

/// Picks and runs the compiler for each host's platform
pub struct CompilerDispatcher {
    settings: Arc<Settings>,
    layout: LabLayout,
    compilers: HashMap<Platform, Arc<dyn PlatformCompiler>>,
    ssh_pub_key: Option<String>,
}

impl CompilerDispatcher {
    /// Dispatcher with no compilers, taking the public key from the settings
    pub fn new(settings: Arc<Settings>) -> Self {
        let ssh_pub_key = settings.ssh_key.resolve();
        let layout = settings.layout();
        Self {
            settings,
            layout,
            compilers: HashMap::new(),
            ssh_pub_key,
        }
    }

    pub fn with_ssh_pub_key(mut self, key: Option<String>) -> Self {
        self.ssh_pub_key = key;
        self
    }

    /// Register a compiler, replacing any previous one for its platform
    pub fn register(mut self, compiler: Arc<dyn PlatformCompiler>) -> Self {
        self.compilers.insert(compiler.platform(), compiler);
        self
    }

    pub fn supports(&self, platform: Platform) -> bool {
        self.compilers.contains_key(&platform)
    }

    /// Compile the rendered configuration for one host
    pub async fn compile_for_host(&self, model: &dyn NetworkModel, host: &str) -> CompileOutcome {
        let (record, platform) = match self.settings.lookup(host) {
            HostLookup::Missing => {
                warn!("Host {} not defined in configuration", host);
                return CompileOutcome::NotCompiled(DeploymentResult::SkippedNoConfig);
            }
            HostLookup::NoPlatform => {
                warn!("No platform defined for {}", host);
                return CompileOutcome::NotCompiled(DeploymentResult::SkippedNoPlatform);
            }
            HostLookup::UnknownPlatform(platform) => {
                warn!("Unknown platform {} for {}", platform, host);
                return CompileOutcome::NotCompiled(DeploymentResult::SkippedUnknownPlatform {
                    platform,
                });
            }
            HostLookup::Found { record, platform } => (record, platform),
        };

        // Stale output never outlives a new compile request
        let output_dir = self.layout.rendered_dir(host, platform);
        if let Err(e) = output_dir.reset().await {
            warn!("Unable to reset {}: {}", output_dir.path().display(), e);
            return CompileOutcome::NotCompiled(DeploymentResult::failed(
                FailureKind::Compilation,
                format!("cannot reset {}: {}", output_dir.path().display(), e),
            ));
        }

        let Some(compiler) = self.compilers.get(&platform) else {
            warn!("No compiler registered for platform {} on {}", platform, host);
            return CompileOutcome::NotCompiled(DeploymentResult::failed(
                FailureKind::Compilation,
                format!("no compiler available for platform {}", platform),
            ));
        };

        let nodes = model.nodes_for(host, platform).len();
        info!(
            "Compiling {} nodes for {} on {} ({})",
            nodes,
            platform,
            host,
            record.host.as_deref().unwrap_or("no address")
        );

        let ctx = CompileContext {
            model,
            host,
            platform,
            output_dir: &output_dir,
            ssh_pub_key: self.ssh_pub_key.as_deref(),
        };
        match compiler.compile(&ctx).await {
            Ok(()) => CompileOutcome::Compiled {
                platform,
                output_dir: output_dir.path().to_path_buf(),
            },
            Err(e) => {
                warn!("Compilation for {} failed: {}", host, e);
                CompileOutcome::NotCompiled(DeploymentResult::failed(
                    FailureKind::Compilation,
                    e.to_string(),
                ))
            }
        }
    }

    /// Compile every distinct host, in order
    pub async fn compile_all(
        &self,
        model: &dyn NetworkModel,
        hosts: &[String],
    ) -> Vec<(String, CompileOutcome)> {
        let mut outcomes = Vec::new();
        for host in dedup(hosts) {
            let outcome = self.compile_for_host(model, &host).await;
            outcomes.push((host, outcome));
        }
        outcomes
    }
}

/// Distinct host ids, keeping first occurrence order
pub fn dedup(hosts: &[String]) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    hosts
        .iter()
        .filter(|host| seen.insert(host.as_str()))
        .cloned()
        .collect()
}
