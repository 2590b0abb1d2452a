//! Deployment targets

use std::fmt;
use std::path::PathBuf;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::config::settings::HostRecord;
use crate::errors::LabError;

/// Address that marks a host as an offline packaging target
pub const INTERNAL_ADDRESS: &str = "internal";

/// Host id that is deployed by an external local path
pub const LOCALHOST: &str = "localhost";

/// Device emulation platform a host renders configuration for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Netkit,
    Cisco,
    Dynagen,
    Junosphere,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Netkit => "netkit",
            Platform::Cisco => "cisco",
            Platform::Dynagen => "dynagen",
            Platform::Junosphere => "junosphere",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Platform {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "netkit" => Ok(Platform::Netkit),
            "cisco" => Ok(Platform::Cisco),
            "dynagen" => Ok(Platform::Dynagen),
            "junosphere" => Ok(Platform::Junosphere),
            other => Err(format!("Unknown platform: {}", other)),
        }
    }
}

/// How to authenticate against a target host
#[derive(Debug)]
pub enum AuthMethod {
    /// Private key file
    KeyFile(PathBuf),

    /// Username and password
    Password(SecretString),
}

/// A fully resolved remote deployment target
#[derive(Debug)]
pub struct TargetHost {
    /// Identifier used in the settings file
    pub id: String,

    /// Network address
    pub address: String,

    /// SSH port
    pub port: u16,

    pub platform: Platform,

    pub username: String,

    /// `None` when neither a key file nor a password was configured
    pub auth: Option<AuthMethod>,

    /// Local rendered configuration directory for this host
    pub rendered_dir: PathBuf,
}

impl TargetHost {
    /// Build a target from its settings record.
    ///
    /// An empty `keyfile` counts as absent, as does an empty password.
    pub fn from_record(
        id: &str,
        record: &HostRecord,
        platform: Platform,
        rendered_dir: PathBuf,
    ) -> Result<Self, LabError> {
        let address = record
            .host
            .as_deref()
            .map(str::trim)
            .filter(|a| !a.is_empty())
            .ok_or_else(|| LabError::ConfigError(format!("Host {} has no address", id)))?;

        let auth = match (&record.keyfile, &record.password) {
            (Some(key), _) if !key.as_os_str().is_empty() => Some(AuthMethod::KeyFile(key.clone())),
            (_, Some(password)) if !password.expose_secret().is_empty() => Some(
                AuthMethod::Password(SecretString::from(password.expose_secret().to_owned())),
            ),
            _ => None,
        };

        Ok(Self {
            id: id.to_string(),
            address: address.to_string(),
            port: record.port,
            platform,
            username: record.username.clone().unwrap_or_default(),
            auth,
            rendered_dir,
        })
    }

    /// Whether this target is deployed offline without any remote session
    pub fn is_internal(&self) -> bool {
        self.address == INTERNAL_ADDRESS
    }
}
