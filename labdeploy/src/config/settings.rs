//! Settings file management

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;
use serde::{Deserialize, Deserializer};

use crate::config::layout::LabLayout;
use crate::config::ssh_keys::SshKeySource;
use crate::errors::LabError;
use crate::filesys::file::File;
use crate::logs::LogLevel;
use crate::models::target::Platform;

/// Default settings file name, looked up in the working directory
pub const SETTINGS_FILE: &str = "labdeploy.json";

/// labdeploy settings
#[derive(Debug, Deserialize)]
pub struct Settings {
    /// Log level
    #[serde(default)]
    pub log_level: LogLevel,

    /// Directory for a rolling log file
    #[serde(default)]
    pub log_dir: Option<PathBuf>,

    /// Emit JSON formatted logs on stdout
    #[serde(default)]
    pub json_logs: bool,

    /// Deployment targets keyed by host id
    #[serde(default)]
    pub hosts: BTreeMap<String, HostRecord>,

    /// Packaging and remote lifecycle settings
    #[serde(default)]
    pub deploy: DeploySettings,

    /// MQTT notification sink, disabled when absent
    #[serde(default)]
    pub mqtt: Option<MqttSettings>,

    /// Public key handed to compilers for installation into lab nodes
    #[serde(default)]
    pub ssh_key: SshKeySource,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            log_dir: None,
            json_logs: false,
            hosts: BTreeMap::new(),
            deploy: DeploySettings::default(),
            mqtt: None,
            ssh_key: SshKeySource::default(),
        }
    }
}

impl Settings {
    /// Load settings from a JSON file
    pub async fn load(file: &File) -> Result<Self, LabError> {
        if !file.exists().await {
            return Err(LabError::ConfigError(format!(
                "Settings file not found: {}",
                file.path().display()
            )));
        }
        file.read_json::<Settings>().await
    }

    /// Resolve a host id against the `hosts` table
    pub fn lookup(&self, host_id: &str) -> HostLookup<'_> {
        let Some(record) = self.hosts.get(host_id) else {
            return HostLookup::Missing;
        };
        let Some(tag) = record
            .platform
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
        else {
            return HostLookup::NoPlatform;
        };
        match tag.parse::<Platform>() {
            Ok(platform) => HostLookup::Found { record, platform },
            Err(_) => HostLookup::UnknownPlatform(tag.to_string()),
        }
    }

    pub fn layout(&self) -> LabLayout {
        LabLayout::new(&self.deploy.rendered_root, &self.deploy.archive_dir)
    }
}

/// Result of looking a host up in the settings
#[derive(Debug)]
pub enum HostLookup<'a> {
    /// No record for the host
    Missing,

    /// Record without a platform tag
    NoPlatform,

    /// Platform tag outside the known set
    UnknownPlatform(String),

    Found {
        record: &'a HostRecord,
        platform: Platform,
    },
}

/// One entry of the `hosts` table
#[derive(Debug, Default, Deserialize)]
pub struct HostRecord {
    /// Address, or `internal` for offline packaging
    #[serde(default)]
    pub host: Option<String>,

    /// Platform tag
    #[serde(default)]
    pub platform: Option<String>,

    #[serde(default)]
    pub username: Option<String>,

    /// Private key file used for SSH authentication
    #[serde(default)]
    pub keyfile: Option<PathBuf>,

    /// Password, used when no key file is configured
    #[serde(default, deserialize_with = "deserialize_secret")]
    pub password: Option<SecretString>,

    #[serde(default = "default_ssh_port")]
    pub port: u16,
}

fn deserialize_secret<'de, D>(deserializer: D) -> Result<Option<SecretString>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.map(SecretString::from))
}

fn default_ssh_port() -> u16 {
    22
}

/// Packaging and remote lifecycle settings
#[derive(Debug, Clone, Deserialize)]
pub struct DeploySettings {
    /// Archive base name, suffixed with the host id
    #[serde(default = "default_archive_name")]
    pub archive_name: String,

    /// Root of the rendered configuration tree
    #[serde(default = "default_rendered_root")]
    pub rendered_root: PathBuf,

    /// Where archives are written
    #[serde(default = "default_archive_dir")]
    pub archive_dir: PathBuf,

    /// Timeout applied to every remote command, in seconds
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,

    /// Timeout for TCP connect and SSH handshake, in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Delay before reissuing a start command that hit a running lab
    #[serde(default = "default_retry_delay")]
    pub retry_delay_ms: u64,

    #[serde(default = "default_start_command")]
    pub start_command: String,

    /// Sent once the lab reports itself started
    #[serde(default = "default_exit_command")]
    pub exit_command: String,

    /// Tools checked with `command -v` before starting
    #[serde(default = "default_required_tools")]
    pub required_tools: Vec<String>,

    /// Hosts deployed at the same time
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,
}

fn default_archive_name() -> String {
    "nklab".to_string()
}

fn default_rendered_root() -> PathBuf {
    PathBuf::from("rendered")
}

fn default_archive_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_command_timeout() -> u64 {
    300
}

fn default_connect_timeout() -> u64 {
    20
}

fn default_retry_delay() -> u64 {
    1000
}

fn default_start_command() -> String {
    "lstart -p20 -o--con0=none".to_string()
}

fn default_exit_command() -> String {
    "exit".to_string()
}

fn default_required_tools() -> Vec<String> {
    vec!["lstart".to_string()]
}

fn default_parallelism() -> usize {
    4
}

impl DeploySettings {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

impl Default for DeploySettings {
    fn default() -> Self {
        Self {
            archive_name: default_archive_name(),
            rendered_root: default_rendered_root(),
            archive_dir: default_archive_dir(),
            command_timeout_secs: default_command_timeout(),
            connect_timeout_secs: default_connect_timeout(),
            retry_delay_ms: default_retry_delay(),
            start_command: default_start_command(),
            exit_command: default_exit_command(),
            required_tools: default_required_tools(),
            parallelism: default_parallelism(),
        }
    }
}

/// MQTT broker settings for the notification sink
#[derive(Debug, Clone, Deserialize)]
pub struct MqttSettings {
    /// Broker host
    pub host: String,

    /// Broker port
    #[serde(default = "default_mqtt_port")]
    pub port: u16,

    /// Use TLS
    #[serde(default)]
    pub tls: bool,

    /// Optional path to a PEM-encoded CA certificate for broker TLS verification.
    /// When absent, the system certificate store is used.
    #[serde(default)]
    pub ca_cert_path: Option<String>,

    #[serde(default = "default_client_id")]
    pub client_id: String,
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_client_id() -> String {
    format!("labdeploy-{}", std::process::id())
}
