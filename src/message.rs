//! Outbound wire messages.
//!
//! One `FrameMessage` per sampled frame, serialized as JSON with camelCase
//! keys, delivered together with a per-camera routing key so the channel
//! can partition and order messages per source.

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// One sampled frame as delivered downstream. `image` carries the base64
/// JPEG payload.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameMessage {
    pub timestamp: String,
    pub camera_id: String,
    pub location_name: String,
    pub image: String,
}

impl FrameMessage {
    /// Build a message stamped with the current UTC time.
    pub fn new(camera_id: &str, location_name: &str, image: String) -> Self {
        Self {
            timestamp: utc_timestamp_millis(),
            camera_id: camera_id.to_string(),
            location_name: location_name.to_string(),
            image,
        }
    }
}

/// Routing key used by the delivery channel to group messages per camera.
pub fn routing_key(location_name: &str, camera_id: &str) -> String {
    format!("{}_{}", location_name, camera_id)
}

/// ISO-8601 UTC with millisecond precision and a literal `Z` suffix.
fn utc_timestamp_millis() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}
