pub mod capture;
pub mod error;
pub mod pipeline;
pub mod sink;
pub mod utils;

use std::path::PathBuf;

use arc_swap::ArcSwap;
use capture::frame::PixelFormat;
use serde::{Deserialize, Serialize};

use crate::utils::FoundDevice;

/// Global configuration that can be atomically swapped at runtime
pub static CONFIG: once_cell::sync::Lazy<ArcSwap<Config>> =
    once_cell::sync::Lazy::new(|| ArcSwap::from_pointee(Config::default()));

/// System configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub capture: CaptureConfig,
    pub pipeline: PipelineConfig,
    pub sink: SinkConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    pub device: FoundDevice,
    pub width: u32,
    pub height: u32,
    /// Rate used on startup.
    pub fps: u32,
    /// Rate the `fps` command toggles to and back from.
    pub fps_alternate: u32,
    pub format: PixelFormat,
    pub buffer_count: u32,
    /// Readiness-wait timeout in milliseconds. Expiry means the device
    /// stalled and is fatal.
    pub io_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Frames the bounded queue holds before the capture worker blocks.
    pub queue_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinkConfig {
    pub output_dir: PathBuf,
    pub format: SinkFormat,
}

/// How persisted frames land on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SinkFormat {
    /// Write the MJPEG payload as-is (cheapest at 100 fps).
    Jpeg,
    /// Decode and re-encode as PNG.
    Png,
    /// Raw pixel dump, no container.
    Raw,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            capture: CaptureConfig {
                device: FoundDevice::new("/dev/video0".into(), PixelFormat::Mjpeg),
                width: 640,
                height: 480,
                fps: 100,
                fps_alternate: 60,
                format: PixelFormat::Mjpeg,
                buffer_count: 4,
                io_timeout_ms: 2000,
            },
            pipeline: PipelineConfig {
                // Deep buffering: disk latency spikes at 100 fps are absorbed
                // here instead of stalling the capture worker.
                queue_capacity: 500,
            },
            sink: SinkConfig {
                output_dir: PathBuf::from("."),
                format: SinkFormat::Jpeg,
            },
        }
    }
}
