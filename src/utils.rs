use crate::capture::frame::PixelFormat;
use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use tracing::info;
use v4l::{capability::Flags, video::Capture, Device, FourCC};

// Detected capture device info
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FoundDevice {
    pub path: String,
    pub format: PixelFormat,
}

impl FoundDevice {
    pub fn new(path: String, format: PixelFormat) -> Self {
        Self { path, format }
    }
}

/// Probe `/dev/video0..9` for a capture-capable device, preferring the
/// formats this pipeline can persist.
pub fn auto_detect_device() -> Result<FoundDevice> {
    use std::path::Path;

    info!("Auto-detecting capture devices...");

    for i in 0..10 {
        let path = format!("/dev/video{i}");
        if !Path::new(&path).exists() {
            continue;
        }

        let Ok(dev) = Device::with_path(&path) else {
            continue;
        };
        let Ok(caps) = dev.query_caps() else {
            continue;
        };
        if !caps.capabilities.contains(Flags::VIDEO_CAPTURE) {
            continue;
        }

        let Ok(formats) = dev.enum_formats() else {
            continue;
        };
        for fmt in formats {
            if fmt.fourcc == FourCC::new(b"MJPG") {
                info!("Found MJPEG device: {} - {}", path, caps.card);
                return Ok(FoundDevice {
                    path,
                    format: PixelFormat::Mjpeg,
                });
            } else if fmt.fourcc == FourCC::new(b"YUYV") {
                info!("Found YUYV device: {} - {}", path, caps.card);
                return Ok(FoundDevice {
                    path,
                    format: PixelFormat::Yuyv4,
                });
            } else if fmt.fourcc == FourCC::new(b"GREY") {
                info!("Found GREY device: {} - {}", path, caps.card);
                return Ok(FoundDevice {
                    path,
                    format: PixelFormat::Grey,
                });
            }
        }
    }

    Err(eyre!("No suitable capture device found"))
}
