//! Simulated capture source.
//!
//! Models the same K-slot dequeue/requeue protocol as the real device so
//! pipeline behavior (and slot accounting) can be tested without hardware.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::capture::frame::{Frame, FrameMetadata, PixelFormat};
use crate::capture::CaptureSource;
use crate::error::CaptureError;

pub struct MockSource {
    fps: u32,
    slot_queued: Vec<bool>,
    next_slot: usize,
    sequence: u64,
}

impl MockSource {
    pub fn new(slots: usize, fps: u32) -> Self {
        assert!(slots >= 2, "the protocol needs at least two slots");
        Self {
            fps,
            slot_queued: vec![true; slots],
            next_slot: 0,
            sequence: 0,
        }
    }

    /// How many slots the device currently owns. After any number of
    /// completed acquires this must equal the pool size.
    pub fn enqueued_slots(&self) -> usize {
        self.slot_queued.iter().filter(|&&q| q).count()
    }

    fn frame_interval(&self) -> Duration {
        Duration::from_secs(1) / self.fps.max(1)
    }
}

impl CaptureSource for MockSource {
    fn acquire_frame(&mut self, _timeout: Duration) -> Result<Frame, CaptureError> {
        thread::sleep(self.frame_interval());

        // Dequeue: slot ownership moves to us.
        let index = self.next_slot;
        assert!(self.slot_queued[index], "dequeued a slot the device does not own");
        self.slot_queued[index] = false;

        self.sequence += 1;
        let frame = Frame {
            data: Bytes::from(vec![(self.sequence & 0xff) as u8; 32]),
            meta: Arc::new(FrameMetadata {
                sequence: self.sequence,
                width: 640,
                height: 480,
                format: PixelFormat::Grey,
                device_timestamp: Some(self.frame_interval() * self.sequence as u32),
            }),
            timestamp: Instant::now(),
        };

        // Re-enqueue before returning, the same pairing the real device
        // enforces.
        self.slot_queued[index] = true;
        self.next_slot = (index + 1) % self.slot_queued.len();

        Ok(frame)
    }

    fn frame_rate(&self) -> u32 {
        self.fps
    }

    fn read_timeout(&self) -> Duration {
        Duration::from_millis(50)
    }

    fn reconfigure_rate(mut self, fps: u32) -> Result<Self, CaptureError> {
        self.fps = fps;
        self.slot_queued.fill(true);
        self.next_slot = 0;
        Ok(self)
    }

    fn shutdown(self) -> Result<(), CaptureError> {
        Ok(())
    }
}
