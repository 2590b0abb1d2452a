//! Public key discovery for lab nodes

use std::path::{Path, PathBuf};

use tracing::{info, warn};

/// Where to take the SSH public key installed into lab nodes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum SshKeySource {
    /// `~/.ssh/id_rsa.pub`, falling back to `~/.ssh/id_dsa.pub`
    #[default]
    System,

    /// Do not install a key
    None,

    /// Explicit public key file
    File(PathBuf),
}

impl std::str::FromStr for SshKeySource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "system" => Ok(SshKeySource::System),
            "none" => Ok(SshKeySource::None),
            "" => Err("Empty SSH key source".to_string()),
            _ => Ok(SshKeySource::File(PathBuf::from(s.trim()))),
        }
    }
}

impl<'de> serde::Deserialize<'de> for SshKeySource {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

impl SshKeySource {
    /// Read the public key, if any.
    ///
    /// Unreadable files are logged and treated as no key.
    pub fn resolve(&self) -> Option<String> {
        match self {
            SshKeySource::None => None,
            SshKeySource::File(path) => read_key(path),
            SshKeySource::System => {
                let ssh_dir = home_dir()?.join(".ssh");
                resolve_system_key(&ssh_dir)
            }
        }
    }
}

/// RSA wins over DSA when both are present
pub fn resolve_system_key(ssh_dir: &Path) -> Option<String> {
    ["id_rsa.pub", "id_dsa.pub"]
        .iter()
        .map(|name| ssh_dir.join(name))
        .find(|path| path.is_file())
        .and_then(|path| read_key(&path))
}

fn read_key(path: &Path) -> Option<String> {
    match std::fs::read_to_string(path) {
        Ok(contents) => {
            info!("Taking ssh pub key from {}", path.display());
            Some(contents.trim().to_string())
        }
        Err(e) => {
            warn!("Unable to read ssh pub key {}: {}", path.display(), e);
            None
        }
    }
}

fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .map(PathBuf::from)
}
