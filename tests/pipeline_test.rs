//! End-to-end pipeline behavior over the simulated capture source.

use std::io::{BufReader, Read};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use color_eyre::Result;
use helios::capture::{CaptureSource, Frame, MockSource};
use helios::pipeline::{CapturePipeline, CommandController, ControlState, FrameQueue, RecordingMode};
use helios::sink::FrameSink;

/// Sink whose record of written sequences stays observable from the test
/// after the pipeline takes ownership.
#[derive(Clone, Default)]
struct SharedSink {
    written: Arc<Mutex<Vec<u64>>>,
    delay: Option<Duration>,
}

impl FrameSink for SharedSink {
    fn persist(&mut self, _frame: &Frame, sequence: u64) -> Result<()> {
        if let Some(delay) = self.delay {
            thread::sleep(delay);
        }
        self.written.lock().unwrap().push(sequence);
        Ok(())
    }
}

fn wait_until(what: &str, deadline: Duration, mut cond: impl FnMut() -> bool) {
    let start = Instant::now();
    while !cond() {
        assert!(start.elapsed() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(5));
    }
}

fn launch(
    slots: usize,
    queue_capacity: usize,
    sink: SharedSink,
) -> (CapturePipeline<MockSource, SharedSink>, Arc<ControlState>) {
    let queue = Arc::new(FrameQueue::with_capacity(queue_capacity));
    let control = Arc::new(ControlState::new());
    let pipeline = CapturePipeline::launch(
        MockSource::new(slots, 1000),
        sink,
        None,
        queue,
        Arc::clone(&control),
        (1000, 500),
    )
    .unwrap();
    (pipeline, control)
}

#[test]
fn no_buffer_slot_leaks_after_many_acquires() {
    let mut source = MockSource::new(4, 2000);
    for _ in 0..100 {
        source.acquire_frame(Duration::from_millis(50)).unwrap();
    }
    assert_eq!(source.enqueued_slots(), 4);
}

#[test]
fn fixed_count_recording_writes_exactly_n_frames() {
    let sink = SharedSink::default();
    let written = Arc::clone(&sink.written);
    let (pipeline, control) = launch(4, 16, sink);

    assert!(control.begin_fixed(5));
    wait_until("5 frames persisted", Duration::from_secs(5), || {
        written.lock().unwrap().len() >= 5
    });
    wait_until("auto-revert to idle", Duration::from_secs(5), || {
        control.mode() == RecordingMode::Off
    });

    // Capture keeps running; nothing beyond the requested count lands.
    thread::sleep(Duration::from_millis(100));
    assert_eq!(*written.lock().unwrap(), vec![0, 1, 2, 3, 4]);

    pipeline.shutdown().unwrap();
}

#[test]
fn continuous_recording_stops_on_command() {
    let sink = SharedSink::default();
    let written = Arc::clone(&sink.written);
    let (pipeline, control) = launch(4, 16, sink);

    assert!(control.begin_continuous());
    wait_until("some frames persisted", Duration::from_secs(5), || {
        !written.lock().unwrap().is_empty()
    });

    assert!(control.stop_writing());
    thread::sleep(Duration::from_millis(50));
    let settled = written.lock().unwrap().len();
    thread::sleep(Duration::from_millis(100));
    assert_eq!(written.lock().unwrap().len(), settled, "writes after stop");

    pipeline.shutdown().unwrap();
}

#[test]
fn rate_switch_resets_recording_and_toggles_rate() {
    let sink = SharedSink::default();
    let (mut pipeline, control) = launch(4, 16, sink);
    assert_eq!(pipeline.frame_rate(), 1000);

    assert!(control.begin_fixed(5000));
    pipeline.switch_rate().unwrap();

    assert_eq!(control.mode(), RecordingMode::Off);
    assert_eq!(pipeline.frame_rate(), 500);

    pipeline.switch_rate().unwrap();
    assert_eq!(pipeline.frame_rate(), 1000);

    pipeline.shutdown().unwrap();
}

#[test]
fn shutdown_completes_while_workers_are_parked_in_the_queue() {
    // Capacity 1 and a slow sink wedge the capture worker inside push;
    // shutdown must still complete via the poison-pill releases.
    let sink = SharedSink {
        delay: Some(Duration::from_millis(20)),
        ..SharedSink::default()
    };
    let (pipeline, control) = launch(4, 1, sink);
    control.begin_continuous();
    thread::sleep(Duration::from_millis(100));

    let start = Instant::now();
    pipeline.shutdown().unwrap();
    assert!(
        start.elapsed() < Duration::from_secs(2),
        "shutdown hung on a parked worker"
    );
    assert!(!control.is_capturing());
}

/// Feeds one command line per `read`, pausing between lines so the
/// pipeline has frames in flight when the next command arrives.
struct PacedCommands {
    lines: Vec<&'static str>,
    next: usize,
    pace: Duration,
}

impl Read for PacedCommands {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.next >= self.lines.len() {
            return Ok(0);
        }
        thread::sleep(self.pace);
        let line = self.lines[self.next];
        self.next += 1;
        let bytes = line.as_bytes();
        buf[..bytes.len()].copy_from_slice(bytes);
        buf[bytes.len()] = b'\n';
        Ok(bytes.len() + 1)
    }
}

#[test]
fn command_controller_runs_a_session_to_quit() {
    let sink = SharedSink::default();
    let written = Arc::clone(&sink.written);
    let (pipeline, control) = launch(4, 16, sink);

    let input = BufReader::new(PacedCommands {
        lines: vec!["start", "start", "bogus", "stop", "3", "q"],
        next: 0,
        pace: Duration::from_millis(60),
    });
    CommandController::new(pipeline).run(input).unwrap();

    assert!(!control.is_capturing(), "quit must stop capture");
    let written = written.lock().unwrap();
    assert!(!written.is_empty(), "continuous phase persisted nothing");
    // Sequences are contiguous from zero regardless of mode changes.
    let expected: Vec<u64> = (0..written.len() as u64).collect();
    assert_eq!(*written, expected);
}
