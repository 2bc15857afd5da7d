//! framerelayd - camera frame relay daemon.
//!
//! This daemon:
//! 1. Loads camera and broker configuration (file + environment)
//! 2. Connects the shared MQTT sink
//! 3. Spawns one stream worker per configured camera
//! 4. Waits for Ctrl-C, then stops and joins every worker

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::{mpsc, Arc};

use frame_relay::config::RelaydConfig;
use frame_relay::ingest::source_factory;
use frame_relay::transport::MqttSink;
use frame_relay::worker::StreamWorker;

#[derive(Parser, Debug)]
#[command(author, version, about = "Relay sampled camera frames to MQTT")]
struct Args {
    /// Path to the JSON config file.
    #[arg(long, env = "FRAME_RELAY_CONFIG")]
    config: Option<PathBuf>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let config = RelaydConfig::load_from(args.config.as_deref())?;
    let sink = Arc::new(MqttSink::connect(&config.mqtt)?);

    let mut handles = Vec::with_capacity(config.cameras.len());
    for camera in &config.cameras {
        let factory = source_factory(&camera.stream_uri)?;
        let worker = StreamWorker::new(camera.clone(), factory, sink.clone())?;
        handles.push(worker.start());
    }
    log::info!("framerelayd running with {} camera worker(s)", handles.len());

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .expect("error setting Ctrl-C handler");

    let _ = rx.recv();
    log::info!("shutdown signal received, stopping workers...");

    for handle in &handles {
        handle.stop();
    }
    for handle in handles {
        handle.join();
    }

    if let Ok(sink) = Arc::try_unwrap(sink) {
        sink.disconnect()?;
    }
    Ok(())
}
