//! MQTT connection glue.
//!
//! The broker connection is a collaborator of the engine: it only subscribes
//! and forwards publishes into the worker channel. Any connection error is
//! forwarded as a fatal event and the pump thread exits.

use anyhow::{Context, Result};
use rumqttc::v5::{mqttbytes::QoS, Client, Connection, Event, Incoming, MqttOptions};
use std::sync::mpsc::Sender;
use std::thread::JoinHandle;
use std::time::Duration;

use super::tls::{MqttEndpoint, TlsMaterials};
use crate::worker::WorkerEvent;

/// Everything needed to open a broker session.
#[derive(Clone, Debug)]
pub struct MqttSettings {
    pub endpoint: MqttEndpoint,
    pub tls: TlsMaterials,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

/// A live broker session with its pump thread.
pub struct MqttSession {
    client: Client,
    pump: Option<JoinHandle<()>>,
}

impl MqttSession {
    /// Connect, subscribe to `topics` and start forwarding publishes to `events`.
    pub fn start(
        settings: &MqttSettings,
        topics: &[&str],
        events: Sender<WorkerEvent>,
    ) -> Result<Self> {
        let (client, connection) = connect_mqtt(settings)?;
        for topic in topics {
            client
                .subscribe(*topic, QoS::AtMostOnce)
                .with_context(|| format!("subscribe to {}", topic))?;
            log::info!("Subscribed to {}", topic);
        }

        let pump = std::thread::Builder::new()
            .name("mqtt-pump".to_string())
            .spawn(move || pump_connection(connection, events))
            .context("spawn MQTT pump thread")?;

        Ok(Self {
            client,
            pump: Some(pump),
        })
    }

    pub fn disconnect(mut self) -> Result<()> {
        self.client.disconnect()?;
        if let Some(handle) = self.pump.take() {
            let _ = handle.join();
        }
        Ok(())
    }
}

fn connect_mqtt(settings: &MqttSettings) -> Result<(Client, Connection)> {
    let endpoint = &settings.endpoint;
    let mut options = MqttOptions::new(&settings.client_id, &endpoint.host, endpoint.port);
    options.set_keep_alive(Duration::from_secs(60));
    options.set_clean_start(true);
    if let Some(user) = settings.username.as_deref() {
        options.set_credentials(user, settings.password.as_deref().unwrap_or_default());
    }
    options.set_transport(settings.tls.build_transport(endpoint)?);

    let (client, connection) = Client::new(options, 64);
    log::info!(
        "MQTT client created for {}:{} (TLS: {}, auth: {})",
        endpoint.host,
        endpoint.port,
        endpoint.use_tls,
        settings.username.is_some()
    );
    Ok((client, connection))
}

fn pump_connection(mut connection: Connection, events: Sender<WorkerEvent>) {
    for event in connection.iter() {
        match event {
            Ok(Event::Incoming(Incoming::Publish(publish))) => {
                let topic = match std::str::from_utf8(&publish.topic) {
                    Ok(topic) => topic.to_string(),
                    Err(e) => {
                        log::warn!("Skipping publish with invalid topic: {}", e);
                        continue;
                    }
                };
                let message = WorkerEvent::Message {
                    topic,
                    payload: publish.payload.to_vec(),
                };
                if events.send(message).is_err() {
                    // Worker has stopped.
                    return;
                }
            }
            Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                log::info!("Connected to MQTT broker");
            }
            Ok(_) => {}
            Err(e) => {
                let _ = events.send(WorkerEvent::TransportFailed(e.to_string()));
                return;
            }
        }
    }
}
