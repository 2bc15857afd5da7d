//! Outbound delivery.
//!
//! Workers hand serialized frame messages to a `FrameSink`. The production
//! sink is MQTT; submission is a cheap enqueue and the sink's own network
//! I/O runs on its own thread, so a slow broker cannot stall frame
//! sampling.

mod mqtt;

pub use mqtt::{parse_mqtt_endpoint, MqttEndpoint, MqttSink};

use anyhow::Result;

/// A delivery channel for serialized frame messages. Shared across all
/// workers, so implementations must tolerate concurrent submission.
pub trait FrameSink: Send + Sync {
    /// Submit one serialized message under a routing key. Best effort: the
    /// caller learns about enqueue failures, never about delivery outcomes.
    fn submit(&self, routing_key: &str, payload: &[u8]) -> Result<()>;
}
