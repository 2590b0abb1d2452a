//! Platform compiler dispatch
//!
//! Compilers turn the network model into configuration files for one host and
//! platform. They live outside this crate and plug in through
//! [`PlatformCompiler`]; the [`dispatcher::CompilerDispatcher`] picks the one
//! matching each host's platform.

pub mod dispatcher;

use std::path::PathBuf;

use async_trait::async_trait;

use crate::errors::LabError;
use crate::filesys::dir::Dir;
use crate::models::result::DeploymentResult;
use crate::models::target::Platform;

/// A device in the network model
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeRef {
    pub id: String,

    /// Host the node is assigned to
    pub host: Option<String>,

    /// Platform tag the node is assigned to
    pub platform: Option<String>,
}

/// The abstract network built upstream
pub trait NetworkModel: Send + Sync {
    fn nodes(&self) -> Vec<NodeRef>;

    /// Links as pairs of node ids
    fn edges(&self) -> Vec<(String, String)>;

    /// Nodes assigned to one host and platform
    fn nodes_for(&self, host: &str, platform: Platform) -> Vec<NodeRef> {
        self.nodes()
            .into_iter()
            .filter(|node| node.host.as_deref() == Some(host))
            .filter(|node| {
                node.platform
                    .as_deref()
                    .and_then(|tag| tag.parse::<Platform>().ok())
                    == Some(platform)
            })
            .collect()
    }
}

/// Everything a compiler gets for one host
pub struct CompileContext<'a> {
    pub model: &'a dyn NetworkModel,
    pub host: &'a str,
    pub platform: Platform,

    /// Freshly emptied `rendered/<host>_<platform>` directory
    pub output_dir: &'a Dir,

    /// Public key to install into lab nodes
    pub ssh_pub_key: Option<&'a str>,
}

/// Renders configuration for one platform
#[async_trait]
pub trait PlatformCompiler: Send + Sync {
    fn platform(&self) -> Platform;

    async fn compile(&self, ctx: &CompileContext<'_>) -> Result<(), LabError>;
}

/// Result of compiling for one host
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompileOutcome {
    Compiled {
        platform: Platform,
        output_dir: PathBuf,
    },

    /// Nothing usable was produced; carries the host's final result
    NotCompiled(DeploymentResult),
}

impl CompileOutcome {
    pub fn is_compiled(&self) -> bool {
        matches!(self, CompileOutcome::Compiled { .. })
    }
}
