//! Worker-thread orchestration.
//!
//! Two long-lived workers: capture (device -> queue) and persistence
//! (queue -> sink). Each worker returns its resources when it exits, so
//! stopping is a join that hands the device and sink back to the control
//! thread for teardown or a rate-switch restart.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use metrics::counter;
use tracing::{error, info, warn};

use crate::capture::CaptureSource;
use crate::error::CaptureError;
use crate::pipeline::control::ControlState;
use crate::pipeline::queue::FrameQueue;
use crate::sink::{DisplaySink, FrameSink};

pub type DisplayBox = Option<Box<dyn DisplaySink>>;

pub struct CapturePipeline<S: CaptureSource, K: FrameSink + 'static> {
    queue: Arc<FrameQueue>,
    control: Arc<ControlState>,
    /// Primary and alternate rates the `fps` command toggles between.
    rates: (u32, u32),
    current_rate: u32,
    capture_handle: Option<JoinHandle<(S, DisplayBox)>>,
    persist_handle: Option<JoinHandle<K>>,
}

impl<S: CaptureSource, K: FrameSink + 'static> CapturePipeline<S, K> {
    /// Spawn both workers against an already-streaming source.
    pub fn launch(
        source: S,
        sink: K,
        display: DisplayBox,
        queue: Arc<FrameQueue>,
        control: Arc<ControlState>,
        rates: (u32, u32),
    ) -> Result<Self, CaptureError> {
        let mut pipeline = Self {
            queue,
            control,
            rates,
            current_rate: rates.0,
            capture_handle: None,
            persist_handle: None,
        };
        pipeline.control.resume();
        pipeline.spawn_workers(source, sink, display)?;
        Ok(pipeline)
    }

    pub fn control(&self) -> &Arc<ControlState> {
        &self.control
    }

    /// The rate the running source negotiated.
    pub fn frame_rate(&self) -> u32 {
        self.current_rate
    }

    /// Stop everything, toggle to the other configured rate, reopen the
    /// device and restart both workers. Recording mode resets to off.
    pub fn switch_rate(&mut self) -> Result<(), CaptureError> {
        info!("switching capture rate, restarting pipeline");
        let (source, sink, display) = self.stop_workers();
        self.queue.clear();
        self.control.reset_recording();

        let next = if self.current_rate == self.rates.0 {
            self.rates.1
        } else {
            self.rates.0
        };
        let source = source.reconfigure_rate(next)?;
        info!(fps = source.frame_rate(), "capture restarted");

        self.control.resume();
        self.spawn_workers(source, sink, display)
    }

    /// Stop both workers, drain the queue and release the device.
    pub fn shutdown(mut self) -> Result<(), CaptureError> {
        let (source, _sink, _display) = self.stop_workers();
        self.queue.clear();
        source.shutdown()
    }

    /// Flag-flip, poison-pill release, then join. The releases matter: a
    /// worker parked inside the queue never re-reads the flag on its own.
    fn stop_workers(&mut self) -> (S, K, DisplayBox) {
        self.control.halt();
        self.queue.release_producer_wait();
        self.queue.release_consumer_wait();

        let (source, display) = join(self.capture_handle.take().expect("capture worker running"));
        let sink = join(self.persist_handle.take().expect("persistence worker running"));
        (source, sink, display)
    }

    fn spawn_workers(&mut self, source: S, sink: K, display: DisplayBox) -> Result<(), CaptureError> {
        self.current_rate = source.frame_rate();

        let capture = {
            let queue = Arc::clone(&self.queue);
            let control = Arc::clone(&self.control);
            thread::Builder::new()
                .name("capture".into())
                .spawn(move || capture_worker(source, queue, control, display))
                .map_err(|e| CaptureError::fault("spawn capture thread", e))?
        };
        let persist = {
            let queue = Arc::clone(&self.queue);
            let control = Arc::clone(&self.control);
            thread::Builder::new()
                .name("persistence".into())
                .spawn(move || persistence_worker(queue, control, sink))
                .map_err(|e| CaptureError::fault("spawn persistence thread", e))?
        };

        self.capture_handle = Some(capture);
        self.persist_handle = Some(persist);
        Ok(())
    }
}

fn join<T>(handle: JoinHandle<T>) -> T {
    match handle.join() {
        Ok(value) => value,
        Err(panic) => std::panic::resume_unwind(panic),
    }
}

fn capture_worker<S: CaptureSource>(
    mut source: S,
    queue: Arc<FrameQueue>,
    control: Arc<ControlState>,
    mut display: DisplayBox,
) -> (S, DisplayBox) {
    let timeout = source.read_timeout();

    while control.is_capturing() {
        let frame = match source.acquire_frame(timeout) {
            Ok(frame) => frame,
            Err(CaptureError::Timeout { .. }) if !control.is_capturing() => break,
            Err(err) => fatal(err),
        };
        counter!("helios_frames_captured").increment(1);

        if let Some(mut sink) = display.take() {
            match sink.show(&frame) {
                Ok(()) => display = Some(sink),
                // Display is a bystander; losing it must not stall capture.
                Err(err) => warn!(%err, "display failed, disabling preview"),
            }
        }

        // A refused push means shutdown was signalled; the loop condition
        // picks that up.
        queue.push(frame);
    }

    (source, display)
}

fn persistence_worker<K: FrameSink>(
    queue: Arc<FrameQueue>,
    control: Arc<ControlState>,
    mut sink: K,
) -> K {
    while control.is_capturing() {
        let Some(frame) = queue.pop() else { continue };
        if !control.should_persist() {
            continue;
        }

        let sequence = control.next_sequence();
        match sink.persist(&frame, sequence) {
            Ok(()) => {
                counter!("helios_frames_persisted").increment(1);
            }
            Err(err) => warn!(%err, sequence, "failed to persist frame"),
        }
    }
    sink
}

/// Device-protocol failures are not recoverable mid-stream: report the
/// failing operation and its OS error, then give up.
fn fatal(err: CaptureError) -> ! {
    error!("fatal capture error: {err}");
    std::process::exit(1);
}
