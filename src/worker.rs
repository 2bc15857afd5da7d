//! Per-camera stream worker.
//!
//! Each worker owns one `FrameSource` and runs on its own thread: read a
//! frame, decide whether to sample it, encode and dispatch sampled frames,
//! recover from disconnects, back off when the stream stalls. The worker
//! never exits on its own; only [`WorkerHandle::stop`] ends the loop.
//!
//! Recovery is two-tiered. A closed stream is first handled by closing and
//! reopening the existing source and polling its open status once per
//! second, up to ten polls. If that fails, the source object itself is
//! assumed wedged: it is discarded and rebuilt through the worker's
//! [`SourceFactory`], and the loop carries on - re-entering recovery on the
//! next iteration if the fresh instance is still closed.

use anyhow::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::config::StreamConfig;
use crate::encode::encode_frame;
use crate::frame::Frame;
use crate::ingest::{FrameSource, SourceFactory};
use crate::message::FrameMessage;
use crate::transport::FrameSink;

/// Timing knobs for the recovery paths. Defaults match production behavior;
/// tests shrink them so reconnect scenarios run in milliseconds.
#[derive(Clone, Debug)]
pub struct WorkerTuning {
    /// Pause between open-status polls while reconnecting.
    pub reconnect_poll: Duration,
    /// Open-status polls per reconnect episode before the source is rebuilt.
    pub reconnect_attempts: u32,
    /// Pause when the stream is connected but yields no frames.
    pub idle_backoff: Duration,
}

impl Default for WorkerTuning {
    fn default() -> Self {
        Self {
            reconnect_poll: Duration::from_secs(1),
            reconnect_attempts: 10,
            idle_backoff: Duration::from_secs(5),
        }
    }
}

/// Fixed-interval rate limiter for frame sampling.
///
/// The first eligible frame is always sampled; afterwards a frame is
/// sampled only when at least `1 / target_fps` has elapsed since the last
/// sampled one. Bursts inside the interval are dropped, not queued.
#[derive(Debug)]
struct FrameSampler {
    interval: Duration,
    last_sample: Option<Instant>,
}

impl FrameSampler {
    fn new(target_fps: f64) -> Self {
        Self {
            interval: Duration::from_secs_f64(1.0 / target_fps),
            last_sample: None,
        }
    }

    fn should_sample(&mut self, now: Instant) -> bool {
        let due = match self.last_sample {
            None => true,
            Some(last) => now.duration_since(last) >= self.interval,
        };
        if due {
            self.last_sample = Some(now);
        }
        due
    }
}

pub struct StreamWorker {
    config: StreamConfig,
    source: Box<dyn FrameSource>,
    factory: SourceFactory,
    sink: Arc<dyn FrameSink>,
    sampler: FrameSampler,
    tuning: WorkerTuning,
    routing_key: String,
}

/// Control surface for a running worker.
pub struct WorkerHandle {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
    camera_id: String,
}

impl WorkerHandle {
    /// Signal cooperative termination. Idempotent; the loop observes the
    /// flag at the top of its next iteration.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    /// Wait for the worker thread to finish. Call [`Self::stop`] first.
    pub fn join(mut self) {
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("stream worker for camera {} panicked", self.camera_id);
            }
        }
    }

    pub fn camera_id(&self) -> &str {
        &self.camera_id
    }
}

impl StreamWorker {
    /// Build a worker and open its stream connection. A failed open is
    /// recoverable (the loop will reconnect); a factory that cannot build a
    /// source at all is not.
    pub fn new(
        config: StreamConfig,
        factory: SourceFactory,
        sink: Arc<dyn FrameSink>,
    ) -> Result<Self> {
        let mut source = factory()?;
        if let Err(e) = source.open() {
            log::warn!(
                "camera {} at {}: initial open failed: {}",
                config.camera_id,
                config.location_name,
                e
            );
        }
        log::info!(
            "stream initialized for camera {} at {}",
            config.camera_id,
            config.location_name
        );
        let sampler = FrameSampler::new(config.target_fps);
        let routing_key = config.routing_key();
        Ok(Self {
            config,
            source,
            factory,
            sink,
            sampler,
            tuning: WorkerTuning::default(),
            routing_key,
        })
    }

    pub fn with_tuning(mut self, tuning: WorkerTuning) -> Self {
        self.tuning = tuning;
        self
    }

    /// Start the read loop on its own thread.
    pub fn start(self) -> WorkerHandle {
        let stop = Arc::new(AtomicBool::new(false));
        let camera_id = self.config.camera_id.clone();
        let stop_flag = stop.clone();
        let thread = std::thread::spawn(move || self.run(&stop_flag));
        WorkerHandle {
            stop,
            thread: Some(thread),
            camera_id,
        }
    }

    fn run(mut self, stop: &AtomicBool) {
        while !stop.load(Ordering::Relaxed) {
            let frame = self.source.read_frame();
            let open = self.source.is_open();
            match (frame, open) {
                (Some(frame), true) => {
                    if self.sampler.should_sample(Instant::now()) {
                        self.dispatch(frame);
                    }
                }
                // A closed stream, with or without a final frame, goes
                // through the same recovery path.
                (_, false) => self.reconnect(),
                (None, true) => {
                    log::warn!(
                        "stream from camera {} at {} is not transmitting",
                        self.config.camera_id,
                        self.config.location_name
                    );
                    std::thread::sleep(self.tuning.idle_backoff);
                }
            }
        }
        log::info!(
            "stream worker for camera {} at {} stopped",
            self.config.camera_id,
            self.config.location_name
        );
    }

    /// Encode and submit one sampled frame. A frame that fails anywhere on
    /// this path is one dropped sample, never a dead worker.
    fn dispatch(&mut self, frame: Frame) {
        let image = match encode_frame(frame) {
            Ok(image) => image,
            Err(e) => {
                log::warn!("camera {}: dropping frame: {}", self.config.camera_id, e);
                return;
            }
        };
        let message = FrameMessage::new(&self.config.camera_id, &self.config.location_name, image);
        let payload = match serde_json::to_vec(&message) {
            Ok(payload) => payload,
            Err(e) => {
                log::warn!("camera {}: dropping frame: {}", self.config.camera_id, e);
                return;
            }
        };
        if let Err(e) = self.sink.submit(&self.routing_key, &payload) {
            log::warn!("camera {}: dispatch failed: {}", self.config.camera_id, e);
        }
    }

    fn reconnect(&mut self) {
        log::warn!(
            "stream from camera {} at {} got disconnected, attempting reconnection",
            self.config.camera_id,
            self.config.location_name
        );
        self.source.close();
        if let Err(e) = self.source.open() {
            log::warn!("camera {}: reopen failed: {}", self.config.camera_id, e);
        }
        let mut attempts = 0;
        while !self.source.is_open() && attempts < self.tuning.reconnect_attempts {
            std::thread::sleep(self.tuning.reconnect_poll);
            attempts += 1;
        }
        if self.source.is_open() {
            return;
        }

        log::error!(
            "camera {} at {} did not reconnect, resetting stream instance",
            self.config.camera_id,
            self.config.location_name
        );
        match (self.factory)() {
            Ok(mut source) => {
                if let Err(e) = source.open() {
                    log::warn!(
                        "camera {}: open after reset failed: {}",
                        self.config.camera_id,
                        e
                    );
                }
                self.source = source;
            }
            Err(e) => {
                log::error!(
                    "camera {}: stream reset failed: {}",
                    self.config.camera_id,
                    e
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instants(start: Instant, offsets_ms: &[u64]) -> Vec<Instant> {
        offsets_ms
            .iter()
            .map(|ms| start + Duration::from_millis(*ms))
            .collect()
    }

    #[test]
    fn first_frame_is_always_sampled() {
        let mut sampler = FrameSampler::new(1.0);
        assert!(sampler.should_sample(Instant::now()));
    }

    #[test]
    fn frames_inside_the_interval_are_dropped() {
        let start = Instant::now();
        let mut sampler = FrameSampler::new(1.0);
        let ticks = instants(start, &[0, 500, 1700]);
        assert!(sampler.should_sample(ticks[0]));
        assert!(!sampler.should_sample(ticks[1]));
        assert!(sampler.should_sample(ticks[2]));
    }

    #[test]
    fn sampled_gaps_are_at_least_the_interval() {
        let start = Instant::now();
        let mut sampler = FrameSampler::new(1.0);
        let offsets: &[u64] = &[0, 300, 600, 900, 999, 1000, 1100, 1999, 2000, 2950, 3001];
        let mut sampled = Vec::new();
        for tick in instants(start, offsets) {
            if sampler.should_sample(tick) {
                sampled.push(tick);
            }
        }
        assert!(sampled.len() >= 3);
        for pair in sampled.windows(2) {
            assert!(pair[1].duration_since(pair[0]) >= Duration::from_secs(1));
        }
    }

    #[test]
    fn high_rates_use_short_intervals() {
        let start = Instant::now();
        let mut sampler = FrameSampler::new(10.0);
        assert!(sampler.should_sample(start));
        assert!(!sampler.should_sample(start + Duration::from_millis(50)));
        assert!(sampler.should_sample(start + Duration::from_millis(100)));
    }
}
