use std::io;
use std::time::Duration;

/// Everything that can go wrong between us and the capture device.
///
/// Apart from [`CaptureError::Timeout`] during shutdown, all of these are
/// fatal: the buffer-queue protocol cannot be resumed after a failed call
/// without a full teardown and reopen.
#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("cannot identify '{path}': {source}")]
    DeviceNotFound { path: String, source: io::Error },

    #[error("'{path}' is not a capture device")]
    NotACaptureDevice { path: String },

    #[error("'{path}' does not support video capture streaming")]
    UnsupportedDevice { path: String },

    #[error("device substituted pixel format {got} for requested {requested}")]
    FormatRejected { requested: String, got: String },

    #[error("insufficient buffer memory: device granted {granted} buffers")]
    InsufficientBuffers { granted: u32 },

    #[error("mapping buffer {index} failed: {source}")]
    OutOfMemory { index: u32, source: io::Error },

    /// A protocol call failed; carries the failing operation name and the
    /// underlying OS error, which is what gets reported before exit.
    #[error("{op} error: {source}")]
    DeviceFault { op: &'static str, source: io::Error },

    #[error("no frame ready within {timeout:?}, device stalled")]
    Timeout { timeout: Duration },
}

impl CaptureError {
    pub(crate) fn fault(op: &'static str, source: io::Error) -> Self {
        Self::DeviceFault { op, source }
    }
}
