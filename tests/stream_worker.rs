//! End-to-end worker scenarios against scripted stream sources and an
//! in-memory sink: sampling, recovery, reset, and the stop contract.

use anyhow::{anyhow, Result};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use frame_relay::config::StreamConfig;
use frame_relay::frame::Frame;
use frame_relay::ingest::{FrameSource, SourceFactory};
use frame_relay::transport::FrameSink;
use frame_relay::worker::{StreamWorker, WorkerTuning};

fn camera(target_fps: f64) -> StreamConfig {
    StreamConfig {
        stream_uri: "stub://test".to_string(),
        camera_id: "cam1".to_string(),
        location_name: "lobby".to_string(),
        target_fps,
    }
}

fn fast_tuning() -> WorkerTuning {
    WorkerTuning {
        reconnect_poll: Duration::from_millis(1),
        reconnect_attempts: 10,
        idle_backoff: Duration::from_millis(2),
    }
}

fn test_frame() -> Frame {
    Frame::new(vec![64u8; 32 * 24 * 3], 32, 24).expect("frame")
}

fn wait_until(deadline: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}

// ----------------------------------------------------------------------------
// Scripted collaborators
// ----------------------------------------------------------------------------

#[derive(Default)]
struct RecordingSink {
    messages: Mutex<Vec<(String, Vec<u8>)>>,
}

impl RecordingSink {
    fn count(&self) -> usize {
        self.messages.lock().unwrap().len()
    }

    fn snapshot(&self) -> Vec<(String, Vec<u8>)> {
        self.messages.lock().unwrap().clone()
    }
}

impl FrameSink for RecordingSink {
    fn submit(&self, routing_key: &str, payload: &[u8]) -> Result<()> {
        self.messages
            .lock()
            .unwrap()
            .push((routing_key.to_string(), payload.to_vec()));
        Ok(())
    }
}

struct FailingSink;

impl FrameSink for FailingSink {
    fn submit(&self, _routing_key: &str, _payload: &[u8]) -> Result<()> {
        Err(anyhow!("broker unavailable"))
    }
}

/// Healthy source: open on request, serves frames while open.
struct LiveSource {
    open: bool,
}

impl LiveSource {
    fn new() -> Self {
        Self { open: false }
    }
}

impl FrameSource for LiveSource {
    fn open(&mut self) -> Result<()> {
        self.open = true;
        Ok(())
    }

    fn close(&mut self) {
        self.open = false;
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn read_frame(&mut self) -> Option<Frame> {
        if !self.open {
            return None;
        }
        std::thread::sleep(Duration::from_millis(1));
        Some(test_frame())
    }
}

/// Source that never serves anything and never reports open.
struct DeadSource;

impl FrameSource for DeadSource {
    fn open(&mut self) -> Result<()> {
        Ok(())
    }

    fn close(&mut self) {}

    fn is_open(&self) -> bool {
        false
    }

    fn read_frame(&mut self) -> Option<Frame> {
        None
    }
}

/// Source that reports closed for a scripted number of open-status checks,
/// then comes back up on its own - a transient network drop.
struct FlakyState {
    opens_after_checks: u32,
    checks: u32,
    open: bool,
}

struct FlakySource {
    state: Arc<Mutex<FlakyState>>,
}

impl FlakySource {
    fn new(opens_after_checks: u32) -> Self {
        Self {
            state: Arc::new(Mutex::new(FlakyState {
                opens_after_checks,
                checks: 0,
                open: false,
            })),
        }
    }
}

impl FrameSource for FlakySource {
    fn open(&mut self) -> Result<()> {
        // Reopening alone does not help; the poll loop has to observe the
        // stream come back.
        Ok(())
    }

    fn close(&mut self) {}

    fn is_open(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        if !state.open {
            state.checks += 1;
            if state.checks >= state.opens_after_checks {
                state.open = true;
            }
        }
        state.open
    }

    fn read_frame(&mut self) -> Option<Frame> {
        if self.state.lock().unwrap().open {
            std::thread::sleep(Duration::from_millis(1));
            Some(test_frame())
        } else {
            None
        }
    }
}

/// Open stream that yields no frames.
struct StalledSource;

impl FrameSource for StalledSource {
    fn open(&mut self) -> Result<()> {
        Ok(())
    }

    fn close(&mut self) {}

    fn is_open(&self) -> bool {
        true
    }

    fn read_frame(&mut self) -> Option<Frame> {
        None
    }
}

fn counted_factory(
    counter: Arc<AtomicUsize>,
    build: impl Fn(usize) -> Box<dyn FrameSource> + Send + 'static,
) -> SourceFactory {
    Box::new(move || {
        let call = counter.fetch_add(1, Ordering::SeqCst);
        Ok(build(call))
    })
}

// ----------------------------------------------------------------------------
// Scenarios
// ----------------------------------------------------------------------------

#[test]
fn stop_terminates_the_loop_and_dispatches_nothing_further() {
    let sink = Arc::new(RecordingSink::default());
    let factory = counted_factory(Arc::new(AtomicUsize::new(0)), |_| Box::new(LiveSource::new()));
    let worker = StreamWorker::new(camera(1000.0), factory, sink.clone())
        .expect("worker")
        .with_tuning(fast_tuning());
    let handle = worker.start();

    assert!(wait_until(Duration::from_secs(2), || sink.count() >= 3));
    handle.stop();
    handle.join();

    let after_stop = sink.count();
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(sink.count(), after_stop, "messages dispatched after stop");
}

#[test]
fn sampled_messages_carry_routing_key_and_increasing_timestamps() {
    let sink = Arc::new(RecordingSink::default());
    let factory = counted_factory(Arc::new(AtomicUsize::new(0)), |_| Box::new(LiveSource::new()));
    let worker = StreamWorker::new(camera(20.0), factory, sink.clone())
        .expect("worker")
        .with_tuning(fast_tuning());
    let handle = worker.start();

    assert!(wait_until(Duration::from_secs(2), || sink.count() >= 3));
    handle.stop();
    handle.join();

    let messages = sink.snapshot();
    let mut timestamps = Vec::new();
    for (routing_key, payload) in &messages {
        assert_eq!(routing_key, "lobby_cam1");
        let value: serde_json::Value = serde_json::from_slice(payload).expect("json payload");
        assert_eq!(value["cameraId"], "cam1");
        assert_eq!(value["locationName"], "lobby");
        assert!(value["image"].as_str().is_some_and(|s| !s.is_empty()));
        timestamps.push(value["timestamp"].as_str().expect("timestamp").to_string());
    }
    for pair in timestamps.windows(2) {
        assert!(
            pair[0] < pair[1],
            "timestamps not strictly increasing: {} then {}",
            pair[0],
            pair[1]
        );
    }
}

#[test]
fn transient_drop_recovers_without_rebuilding_the_source() {
    let sink = Arc::new(RecordingSink::default());
    let factory_calls = Arc::new(AtomicUsize::new(0));
    // Comes back on the fifth open-status check, well inside the ten polls.
    let factory = counted_factory(factory_calls.clone(), |_| Box::new(FlakySource::new(5)));
    let worker = StreamWorker::new(camera(50.0), factory, sink.clone())
        .expect("worker")
        .with_tuning(fast_tuning());
    let handle = worker.start();

    assert!(wait_until(Duration::from_secs(2), || sink.count() >= 1));
    handle.stop();
    handle.join();

    assert_eq!(
        factory_calls.load(Ordering::SeqCst),
        1,
        "source was rebuilt even though reopening recovered the stream"
    );
}

#[test]
fn exhausted_reconnect_rebuilds_the_source_exactly_once() {
    let sink = Arc::new(RecordingSink::default());
    let factory_calls = Arc::new(AtomicUsize::new(0));
    let factory = counted_factory(factory_calls.clone(), |call| {
        if call == 0 {
            Box::new(DeadSource) as Box<dyn FrameSource>
        } else {
            Box::new(LiveSource::new())
        }
    });
    let worker = StreamWorker::new(camera(50.0), factory, sink.clone())
        .expect("worker")
        .with_tuning(fast_tuning());
    let handle = worker.start();

    assert!(wait_until(Duration::from_secs(2), || sink.count() >= 1));
    handle.stop();
    handle.join();

    assert_eq!(
        factory_calls.load(Ordering::SeqCst),
        2,
        "expected the initial source plus exactly one reset"
    );
}

#[test]
fn stalled_open_stream_backs_off_and_dispatches_nothing() {
    let sink = Arc::new(RecordingSink::default());
    let factory = counted_factory(Arc::new(AtomicUsize::new(0)), |_| Box::new(StalledSource));
    let worker = StreamWorker::new(camera(10.0), factory, sink.clone())
        .expect("worker")
        .with_tuning(fast_tuning());
    let handle = worker.start();

    std::thread::sleep(Duration::from_millis(50));
    handle.stop();
    handle.join();

    assert_eq!(sink.count(), 0);
}

#[test]
fn sink_failures_do_not_kill_the_worker() {
    let sink = Arc::new(FailingSink);
    let factory = counted_factory(Arc::new(AtomicUsize::new(0)), |_| Box::new(LiveSource::new()));
    let worker = StreamWorker::new(camera(100.0), factory, sink)
        .expect("worker")
        .with_tuning(fast_tuning());
    let handle = worker.start();

    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(handle.camera_id(), "cam1");
    handle.stop();
    handle.join();
}

#[test]
fn factory_failure_at_construction_is_an_error() {
    let sink = Arc::new(RecordingSink::default());
    let factory: SourceFactory = Box::new(|| Err(anyhow!("no such device")));
    assert!(StreamWorker::new(camera(1.0), factory, sink).is_err());
}
