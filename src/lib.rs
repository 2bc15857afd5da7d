//! frame-relay
//!
//! Resilient camera-to-MQTT frame relay. One worker thread per camera pulls
//! decoded frames from a network stream, samples them down to a configured
//! rate, JPEG-encodes the samples, and publishes them with metadata to a
//! shared MQTT sink. Workers survive stream drops: a closed stream is
//! reopened and polled, and a stream object that will not come back is
//! discarded and rebuilt - the relay only stops when told to.
//!
//! # Module Structure
//!
//! - `config`: daemon configuration (JSON file + environment)
//! - `frame`: decoded RGB frames
//! - `ingest`: stream sources (`FrameSource`, stub and RTSP backends)
//! - `encode`: downscale + JPEG + base64
//! - `message`: outbound wire messages and routing keys
//! - `transport`: delivery sinks (`FrameSink`, MQTT)
//! - `worker`: the per-camera sampling and recovery loop

pub mod config;
pub mod encode;
pub mod frame;
pub mod ingest;
pub mod message;
pub mod transport;
pub mod worker;

pub use config::{MqttSettings, RelaydConfig, StreamConfig};
pub use encode::{encode_frame, scaled_dimensions, MAX_FRAME_WIDTH};
pub use frame::Frame;
pub use ingest::{source_factory, FrameSource, RtspSource, SourceFactory};
pub use message::{routing_key, FrameMessage};
pub use transport::{FrameSink, MqttSink};
pub use worker::{StreamWorker, WorkerHandle, WorkerTuning};
