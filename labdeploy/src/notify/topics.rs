//! MQTT topic definitions

/// MQTT topic patterns
pub struct Topics;

impl Topics {
    /// Per-host event topic
    pub fn host_events(host: &str) -> String {
        format!("labdeploy/host/{}/events", host)
    }
}
