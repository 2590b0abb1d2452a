//! Local workspace layout

use std::path::PathBuf;

use crate::filesys::dir::Dir;
use crate::models::target::Platform;

/// Where rendered configuration and archives live on the local machine
#[derive(Debug, Clone)]
pub struct LabLayout {
    /// Root of the rendered configuration tree
    pub rendered_root: PathBuf,

    /// Directory that receives archives
    pub archive_dir: PathBuf,
}

impl LabLayout {
    pub fn new(rendered_root: impl Into<PathBuf>, archive_dir: impl Into<PathBuf>) -> Self {
        Self {
            rendered_root: rendered_root.into(),
            archive_dir: archive_dir.into(),
        }
    }

    /// Rendered configuration for one host and platform, `<root>/<host>_<platform>`
    pub fn rendered_dir(&self, host: &str, platform: Platform) -> Dir {
        Dir::new(self.rendered_root.join(format!("{}_{}", host, platform)))
    }

    pub fn archive_dir(&self) -> Dir {
        Dir::new(&self.archive_dir)
    }
}

impl Default for LabLayout {
    fn default() -> Self {
        Self::new("rendered", ".")
    }
}
