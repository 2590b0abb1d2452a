//! MQTT notification sink

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::settings::MqttSettings;
use crate::errors::LabError;
use crate::notify::topics::Topics;
use crate::notify::{Notification, NotificationSink};
use crate::shutdown::Shutdown;

/// Capacity of the client's request queue
const REQUEST_CAPACITY: usize = 100;

/// Publishes notifications to `labdeploy/host/<host>/events`, QoS 0
pub struct MqttSink {
    client: AsyncClient,
}

impl MqttSink {
    /// Create the client and spawn its event loop.
    ///
    /// The returned handle completes after [`MqttSink::disconnect`] has been
    /// flushed to the broker or the shutdown signal fires.
    pub fn connect(
        settings: &MqttSettings,
        shutdown: Shutdown,
    ) -> Result<(Self, JoinHandle<()>), LabError> {
        if settings.host.is_empty() {
            return Err(LabError::MqttError("MQTT host is not configured".to_string()));
        }

        let mut options = MqttOptions::new(&settings.client_id, &settings.host, settings.port);
        options.set_keep_alive(Duration::from_secs(30));

        if settings.tls {
            use rumqttc::{TlsConfiguration, Transport};
            use rustls::ClientConfig;

            let mut root_cert_store = rustls::RootCertStore::empty();

            if let Some(ref ca_path) = settings.ca_cert_path {
                let ca_pem = std::fs::read(ca_path).map_err(|e| {
                    LabError::MqttError(format!("Failed to read CA cert {ca_path}: {e}"))
                })?;
                let mut cursor = std::io::Cursor::new(ca_pem);
                for cert in rustls_pemfile::certs(&mut cursor).flatten() {
                    let _ = root_cert_store.add(cert);
                }
            } else {
                for cert in rustls_native_certs::load_native_certs().unwrap_or_default() {
                    let _ = root_cert_store.add(cert);
                }
            }

            let client_config = ClientConfig::builder()
                .with_root_certificates(root_cert_store)
                .with_no_client_auth();

            options.set_transport(Transport::tls_with_config(TlsConfiguration::Rustls(
                Arc::new(client_config),
            )));
        }

        let (client, eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
        info!(
            "Publishing notifications to MQTT broker {}:{}",
            settings.host, settings.port
        );
        let handle = tokio::spawn(drive(eventloop, shutdown));

        Ok((Self { client }, handle))
    }

    /// Queue a disconnect behind every pending publish
    pub async fn disconnect(&self) -> Result<(), LabError> {
        self.client
            .disconnect()
            .await
            .map_err(|e| LabError::MqttError(e.to_string()))
    }
}

impl NotificationSink for MqttSink {
    fn publish(&self, notification: &Notification) {
        let payload = match envelope(notification) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Unable to encode notification: {}", e);
                return;
            }
        };

        let topic = Topics::host_events(notification.host());
        match self.client.try_publish(&topic, QoS::AtMostOnce, false, payload) {
            Ok(()) => debug!("Queued notification on {}", topic),
            Err(e) => warn!("Dropping notification for {}: {}", topic, e),
        }
    }
}

/// Notification JSON with an RFC 3339 `timestamp` field added
pub fn envelope(notification: &Notification) -> Result<Vec<u8>, serde_json::Error> {
    let mut value = serde_json::to_value(notification)?;
    if let Some(object) = value.as_object_mut() {
        object.insert(
            "timestamp".to_string(),
            serde_json::Value::String(Utc::now().to_rfc3339()),
        );
    }
    serde_json::to_vec(&value)
}

async fn drive(mut eventloop: EventLoop, mut shutdown: Shutdown) {
    loop {
        tokio::select! {
            _ = shutdown.wait() => {
                debug!("MQTT event loop stopping on shutdown");
                return;
            }
            event = eventloop.poll() => match event {
                Ok(Event::Incoming(Packet::ConnAck(_))) => info!("MQTT connected"),
                Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                    info!("MQTT disconnected");
                    return;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("MQTT poll error: {}", e);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }
}
