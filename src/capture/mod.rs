pub mod device;
pub mod frame;
pub mod mock;
pub mod pool;

pub use device::{CaptureDevice, DeviceConfig};
pub use frame::Frame;
pub use frame::PixelFormat;
pub use mock::MockSource;

use std::time::Duration;

use crate::error::CaptureError;

/// One streaming capture source.
///
/// The real V4L2 device and the simulated device used by the tests both
/// implement this; the pipeline only ever sees the trait. Teardown-style
/// operations consume `self`, so a device cannot be torn down twice within
/// one configure cycle.
pub trait CaptureSource: Send + Sized + 'static {
    /// Block until the source has a completed frame or `timeout` elapses.
    ///
    /// "Nothing ready yet" conditions are retried internally; a returned
    /// [`CaptureError::Timeout`] means the source stalled.
    fn acquire_frame(&mut self, timeout: Duration) -> Result<Frame, CaptureError>;

    /// The negotiated frame rate currently in effect.
    fn frame_rate(&self) -> u32;

    /// Per-acquire readiness timeout.
    fn read_timeout(&self) -> Duration {
        Duration::from_secs(2)
    }

    /// Full stop/teardown/reopen cycle with a new rate. There is no
    /// in-place rate change while streaming.
    fn reconfigure_rate(self, fps: u32) -> Result<Self, CaptureError>;

    /// Stop streaming and release every kernel resource.
    fn shutdown(self) -> Result<(), CaptureError>;
}
