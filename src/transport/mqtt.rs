//! MQTT delivery sink.
//!
//! `MqttSink` wraps a rumqttc v5 client. Publishing enqueues onto the
//! client's request channel; a background thread owns the broker
//! connection and drains it. Messages for a camera are published to
//! `<topic_prefix>/<routing_key>` at QoS 0.

use anyhow::{anyhow, Context, Result};
use rumqttc::v5::{mqttbytes::QoS, Client, Connection, Event, MqttOptions};
use rumqttc::Transport;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::FrameSink;
use crate::config::MqttSettings;

const CHANNEL_CAPACITY: usize = 64;
const KEEP_ALIVE: Duration = Duration::from_secs(60);
const RECONNECT_PAUSE: Duration = Duration::from_secs(1);

pub struct MqttSink {
    client: Client,
    topic_prefix: String,
    shutting_down: Arc<AtomicBool>,
    connection_handle: Option<std::thread::JoinHandle<()>>,
}

impl MqttSink {
    pub fn connect(settings: &MqttSettings) -> Result<Self> {
        let endpoint = parse_mqtt_endpoint(&settings.broker_addr)?;
        let mut options = MqttOptions::new(&settings.client_id, &endpoint.host, endpoint.port);
        options.set_keep_alive(KEEP_ALIVE);
        options.set_clean_start(true);
        if let Some(username) = &settings.username {
            options.set_credentials(username, settings.password.clone().unwrap_or_default());
        }
        if endpoint.use_tls {
            options.set_transport(Transport::tls_with_default_config());
        }

        let (client, connection) = Client::new(options, CHANNEL_CAPACITY);
        let shutting_down = Arc::new(AtomicBool::new(false));
        let drain_flag = shutting_down.clone();
        let handle = std::thread::spawn(move || drain_connection(connection, &drain_flag));

        log::info!(
            "mqtt sink connected to {}:{} (tls: {}, auth: {})",
            endpoint.host,
            endpoint.port,
            endpoint.use_tls,
            settings.username.is_some()
        );
        Ok(Self {
            client,
            topic_prefix: settings.topic_prefix.clone(),
            shutting_down,
            connection_handle: Some(handle),
        })
    }

    pub fn disconnect(mut self) -> Result<()> {
        self.shutting_down.store(true, Ordering::Relaxed);
        self.client.disconnect()?;
        if let Some(handle) = self.connection_handle.take() {
            let _ = handle.join();
        }
        Ok(())
    }
}

impl FrameSink for MqttSink {
    fn submit(&self, routing_key: &str, payload: &[u8]) -> Result<()> {
        let topic = format!("{}/{}", self.topic_prefix, routing_key);
        // try_publish keeps submission non-blocking: when the request
        // channel is full (broker down or slow), the frame is dropped
        // rather than stalling the caller's read loop.
        self.client
            .try_publish(topic, QoS::AtMostOnce, false, payload.to_vec())
            .map_err(|e| anyhow!("mqtt publish failed: {}", e))
    }
}

fn drain_connection(mut connection: Connection, shutting_down: &AtomicBool) {
    for event in connection.iter() {
        match event {
            Ok(Event::Incoming(_)) | Ok(Event::Outgoing(_)) => {}
            Err(e) => {
                if shutting_down.load(Ordering::Relaxed) {
                    break;
                }
                // rumqttc retries the broker connection on the next
                // iteration; pause so a dead broker is not hammered.
                log::warn!("mqtt connection error: {}", e);
                std::thread::sleep(RECONNECT_PAUSE);
            }
        }
    }
}

/// Broker endpoint parsed from an address like `mqtt://host:1883`,
/// `mqtts://host:8883`, or bare `host:1883`.
#[derive(Clone, Debug)]
pub struct MqttEndpoint {
    pub host: String,
    pub port: u16,
    pub use_tls: bool,
}

pub fn parse_mqtt_endpoint(addr: &str) -> Result<MqttEndpoint> {
    let mut use_tls = false;
    let mut remainder = addr.trim();

    if let Some((scheme, rest)) = remainder.split_once("://") {
        match scheme {
            "mqtt" | "tcp" => {}
            "mqtts" | "ssl" => use_tls = true,
            other => return Err(anyhow!("unsupported mqtt scheme: {}", other)),
        }
        remainder = rest;
    }

    let (host, port) = split_host_port(remainder)?;
    Ok(MqttEndpoint {
        host,
        port,
        use_tls,
    })
}

fn split_host_port(addr: &str) -> Result<(String, u16)> {
    if let Some(rest) = addr.strip_prefix('[') {
        let (host, rest) = rest
            .split_once(']')
            .ok_or_else(|| anyhow!("invalid mqtt address: {}", addr))?;
        let port = rest
            .strip_prefix(':')
            .ok_or_else(|| anyhow!("missing mqtt port in {}", addr))?;
        let port: u16 = port.parse().context("invalid mqtt port")?;
        return Ok((host.to_string(), port));
    }

    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| anyhow!("missing mqtt port in {}", addr))?;
    let port: u16 = port.parse().context("invalid mqtt port")?;
    Ok((host.to_string(), port))
}
