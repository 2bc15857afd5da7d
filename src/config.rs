//! Daemon configuration.
//!
//! Configuration is layered the same way for every deployment: an optional
//! JSON config file (path from `FRAME_RELAY_CONFIG`), then environment
//! overrides, then validation. Single-camera deployments can skip the file
//! entirely and drive everything through the environment.

use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;
use std::sync::OnceLock;
use url::Url;

const DEFAULT_STREAM_URI: &str = "stub://front_camera";
const DEFAULT_CAMERA_ID: &str = "cam0";
const DEFAULT_LOCATION: &str = "default";
const DEFAULT_TARGET_FPS: f64 = 1.0;
const DEFAULT_MQTT_ADDR: &str = "mqtt://127.0.0.1:1883";
const DEFAULT_MQTT_CLIENT_ID: &str = "framerelayd";
const DEFAULT_TOPIC_PREFIX: &str = "frames";

#[derive(Debug, Deserialize, Default)]
struct RelaydConfigFile {
    cameras: Option<Vec<CameraConfigFile>>,
    mqtt: Option<MqttConfigFile>,
}

#[derive(Debug, Deserialize)]
struct CameraConfigFile {
    stream_uri: String,
    camera_id: String,
    location_name: String,
    target_fps: Option<f64>,
}

#[derive(Debug, Deserialize, Default)]
struct MqttConfigFile {
    broker_addr: Option<String>,
    client_id: Option<String>,
    topic_prefix: Option<String>,
    username: Option<String>,
    password: Option<String>,
}

/// Per-camera stream settings. Immutable for the life of a worker.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub stream_uri: String,
    pub camera_id: String,
    pub location_name: String,
    /// Sampled frames per second; the worker enforces a minimum gap of
    /// `1 / target_fps` between dispatched frames.
    pub target_fps: f64,
}

impl StreamConfig {
    pub fn routing_key(&self) -> String {
        crate::message::routing_key(&self.location_name, &self.camera_id)
    }
}

#[derive(Debug, Clone)]
pub struct MqttSettings {
    pub broker_addr: String,
    pub client_id: String,
    pub topic_prefix: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RelaydConfig {
    pub cameras: Vec<StreamConfig>,
    pub mqtt: MqttSettings,
}

impl RelaydConfig {
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("FRAME_RELAY_CONFIG").ok();
        Self::load_from(config_path.as_deref().map(Path::new))
    }

    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: RelaydConfigFile) -> Self {
        let cameras = file
            .cameras
            .map(|cameras| {
                cameras
                    .into_iter()
                    .map(|camera| StreamConfig {
                        stream_uri: camera.stream_uri,
                        camera_id: camera.camera_id,
                        location_name: camera.location_name,
                        target_fps: camera.target_fps.unwrap_or(DEFAULT_TARGET_FPS),
                    })
                    .collect()
            })
            .unwrap_or_else(|| {
                vec![StreamConfig {
                    stream_uri: DEFAULT_STREAM_URI.to_string(),
                    camera_id: DEFAULT_CAMERA_ID.to_string(),
                    location_name: DEFAULT_LOCATION.to_string(),
                    target_fps: DEFAULT_TARGET_FPS,
                }]
            });
        let mqtt_file = file.mqtt.unwrap_or_default();
        let mqtt = MqttSettings {
            broker_addr: mqtt_file
                .broker_addr
                .unwrap_or_else(|| DEFAULT_MQTT_ADDR.to_string()),
            client_id: mqtt_file
                .client_id
                .unwrap_or_else(|| DEFAULT_MQTT_CLIENT_ID.to_string()),
            topic_prefix: mqtt_file
                .topic_prefix
                .unwrap_or_else(|| DEFAULT_TOPIC_PREFIX.to_string()),
            username: mqtt_file.username,
            password: mqtt_file.password,
        };
        Self { cameras, mqtt }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(addr) = std::env::var("FRAME_RELAY_MQTT_ADDR") {
            if !addr.trim().is_empty() {
                self.mqtt.broker_addr = addr;
            }
        }
        if let Ok(prefix) = std::env::var("FRAME_RELAY_TOPIC_PREFIX") {
            if !prefix.trim().is_empty() {
                self.mqtt.topic_prefix = prefix;
            }
        }
        if let Ok(username) = std::env::var("MQTT_USERNAME") {
            if !username.trim().is_empty() {
                self.mqtt.username = Some(username);
            }
        }
        if let Ok(password) = std::env::var("MQTT_PASSWORD") {
            self.mqtt.password = Some(password);
        }

        // Single-camera deployments are commonly driven by env alone; these
        // override the first configured camera.
        if let Some(camera) = self.cameras.first_mut() {
            if let Ok(uri) = std::env::var("FRAME_RELAY_STREAM_URI") {
                if !uri.trim().is_empty() {
                    camera.stream_uri = uri;
                }
            }
            if let Ok(camera_id) = std::env::var("FRAME_RELAY_CAMERA_ID") {
                if !camera_id.trim().is_empty() {
                    camera.camera_id = camera_id;
                }
            }
            if let Ok(location) = std::env::var("FRAME_RELAY_LOCATION") {
                if !location.trim().is_empty() {
                    camera.location_name = location;
                }
            }
            if let Ok(fps) = std::env::var("FRAME_RELAY_TARGET_FPS") {
                camera.target_fps = fps
                    .parse()
                    .map_err(|_| anyhow!("FRAME_RELAY_TARGET_FPS must be a number"))?;
            }
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.cameras.is_empty() {
            return Err(anyhow!("at least one camera must be configured"));
        }
        let mut seen = HashSet::new();
        for camera in &self.cameras {
            validate_identifier("camera_id", &camera.camera_id)?;
            validate_identifier("location_name", &camera.location_name)?;
            if !camera.target_fps.is_finite() || camera.target_fps <= 0.0 {
                return Err(anyhow!(
                    "camera {}: target_fps must be a positive number, got {}",
                    camera.camera_id,
                    camera.target_fps
                ));
            }
            Url::parse(&camera.stream_uri).map_err(|e| {
                anyhow!(
                    "camera {}: invalid stream_uri {}: {}",
                    camera.camera_id,
                    camera.stream_uri,
                    e
                )
            })?;
            if !seen.insert(camera.routing_key()) {
                return Err(anyhow!(
                    "duplicate camera {} at {}: at most one worker per camera",
                    camera.camera_id,
                    camera.location_name
                ));
            }
        }
        if self.mqtt.topic_prefix.trim().is_empty() {
            return Err(anyhow!("mqtt topic_prefix must not be empty"));
        }
        Ok(())
    }
}

/// Identifiers end up in routing keys and MQTT topics, so the charset is a
/// strict allowlist.
pub fn validate_identifier(field: &str, value: &str) -> Result<()> {
    // Compile once for hot paths.
    static IDENT_RE: OnceLock<regex::Regex> = OnceLock::new();
    let re = IDENT_RE
        .get_or_init(|| regex::Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_-]{0,63}$").unwrap());
    if !re.is_match(value) {
        return Err(anyhow!(
            "{} must match ^[A-Za-z0-9][A-Za-z0-9_-]{{0,63}}$, got {:?}",
            field,
            value
        ));
    }
    Ok(())
}

fn read_config_file(path: &Path) -> Result<RelaydConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}
