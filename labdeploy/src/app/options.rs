//! Application configuration options

use std::time::Duration;

use crate::config::settings::Settings;

/// Options for one labdeploy invocation
#[derive(Debug, Clone)]
pub struct AppOptions {
    /// Hosts to deploy; every configured host when empty
    pub hosts: Vec<String>,

    /// Overrides `deploy.parallelism` from the settings file
    pub parallelism: Option<usize>,

    /// How long to wait for queued notifications after the run
    pub max_shutdown_delay: Duration,
}

impl Default for AppOptions {
    fn default() -> Self {
        Self {
            hosts: Vec::new(),
            parallelism: None,
            max_shutdown_delay: Duration::from_secs(5),
        }
    }
}

impl AppOptions {
    /// Requested hosts, or all hosts of the settings file in name order
    pub fn resolve_hosts(&self, settings: &Settings) -> Vec<String> {
        if self.hosts.is_empty() {
            settings.hosts.keys().cloned().collect()
        } else {
            self.hosts.clone()
        }
    }
}
