//! Persistence and display collaborators.
//!
//! The pipeline only knows the traits; what a "written frame" looks like on
//! disk is this module's business alone.

use std::fs;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use color_eyre::{eyre::eyre, Result};
use image::{GrayImage, RgbImage};
use jpeg_decoder::Decoder;
use tracing::debug;

use crate::capture::frame::{Frame, PixelFormat};
use crate::{SinkConfig, SinkFormat};

/// Persistence stage: receives every frame the pipeline decides to keep,
/// together with its 0-based sequence number.
pub trait FrameSink: Send {
    fn persist(&mut self, frame: &Frame, sequence: u64) -> Result<()>;
}

/// Optional on-screen preview. Implementations must be quick or drop
/// frames themselves; a returned error gets the display disabled, never
/// the pipeline stopped.
pub trait DisplaySink: Send {
    fn show(&mut self, frame: &Frame) -> Result<()>;
}

/// Writes frames as image files named `<timestamp-micros>_<sequence>`.
pub struct FileSink {
    dir: PathBuf,
    format: SinkFormat,
}

impl FileSink {
    pub fn new(config: &SinkConfig) -> Result<Self> {
        fs::create_dir_all(&config.output_dir)?;
        Ok(Self {
            dir: config.output_dir.clone(),
            format: config.format,
        })
    }

    fn file_stem(frame: &Frame, sequence: u64) -> String {
        let stamp = frame
            .meta
            .device_timestamp
            .unwrap_or_else(|| {
                SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .unwrap_or_default()
            })
            .as_micros();
        format!("{stamp}_{sequence}")
    }
}

impl FrameSink for FileSink {
    fn persist(&mut self, frame: &Frame, sequence: u64) -> Result<()> {
        let stem = Self::file_stem(frame, sequence);
        match self.format {
            SinkFormat::Jpeg => {
                // MJPEG payloads are standalone JPEG images; write-through.
                let path = self.dir.join(format!("{stem}.jpg"));
                fs::write(&path, &frame.data)?;
                debug!(path = %path.display(), "frame written");
            }
            SinkFormat::Raw => {
                let path = self.dir.join(format!("{stem}.raw"));
                fs::write(&path, &frame.data)?;
                debug!(path = %path.display(), "frame written");
            }
            SinkFormat::Png => {
                let path = self.dir.join(format!("{stem}.png"));
                save_decoded(frame, &path)?;
                debug!(path = %path.display(), "frame written");
            }
        }
        Ok(())
    }
}

fn save_decoded(frame: &Frame, path: &std::path::Path) -> Result<()> {
    match frame.meta.format {
        PixelFormat::Mjpeg => {
            let mut decoder = Decoder::new(frame.data.as_ref());
            let pixels = decoder.decode()?;
            let info = decoder
                .info()
                .ok_or_else(|| eyre!("jpeg decoder produced no image info"))?;
            let (w, h) = (u32::from(info.width), u32::from(info.height));
            match info.pixel_format {
                jpeg_decoder::PixelFormat::L8 => GrayImage::from_raw(w, h, pixels)
                    .ok_or_else(|| eyre!("decoded luma buffer has wrong size"))?
                    .save(path)?,
                jpeg_decoder::PixelFormat::RGB24 => RgbImage::from_raw(w, h, pixels)
                    .ok_or_else(|| eyre!("decoded rgb buffer has wrong size"))?
                    .save(path)?,
                other => return Err(eyre!("unsupported jpeg pixel format: {other:?}")),
            }
        }
        PixelFormat::Grey => {
            let (w, h) = (frame.meta.width, frame.meta.height);
            GrayImage::from_raw(w, h, frame.data.to_vec())
                .ok_or_else(|| eyre!("grey frame size does not match dimensions"))?
                .save(path)?;
        }
        PixelFormat::Yuyv4 => {
            // Luma plane only; the stereo sensor is monochrome anyway.
            let (w, h) = (frame.meta.width, frame.meta.height);
            let luma: Vec<u8> = frame.data.iter().step_by(2).copied().collect();
            GrayImage::from_raw(w, h, luma)
                .ok_or_else(|| eyre!("yuyv frame size does not match dimensions"))?
                .save(path)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::frame::FrameMetadata;
    use bytes::Bytes;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    fn grey_frame(width: u32, height: u32) -> Frame {
        Frame {
            data: Bytes::from(vec![128u8; (width * height) as usize]),
            meta: Arc::new(FrameMetadata {
                sequence: 1,
                width,
                height,
                format: PixelFormat::Grey,
                device_timestamp: Some(Duration::from_micros(123_456)),
            }),
            timestamp: Instant::now(),
        }
    }

    #[test]
    fn raw_sink_writes_timestamp_named_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = FileSink::new(&SinkConfig {
            output_dir: dir.path().to_path_buf(),
            format: SinkFormat::Raw,
        })
        .unwrap();

        sink.persist(&grey_frame(4, 2), 7).unwrap();

        let expected = dir.path().join("123456_7.raw");
        assert_eq!(fs::read(expected).unwrap().len(), 8);
    }

    #[test]
    fn png_sink_encodes_grey_frames() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = FileSink::new(&SinkConfig {
            output_dir: dir.path().to_path_buf(),
            format: SinkFormat::Png,
        })
        .unwrap();

        sink.persist(&grey_frame(8, 8), 0).unwrap();

        let written = fs::read(dir.path().join("123456_0.png")).unwrap();
        // PNG signature.
        assert_eq!(&written[..4], b"\x89PNG");
    }

    #[test]
    fn png_sink_rejects_mismatched_dimensions() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = FileSink::new(&SinkConfig {
            output_dir: dir.path().to_path_buf(),
            format: SinkFormat::Png,
        })
        .unwrap();

        let mut frame = grey_frame(8, 8);
        frame.meta = Arc::new(FrameMetadata {
            width: 1000,
            ..(*frame.meta).clone()
        });
        assert!(sink.persist(&frame, 0).is_err());
    }
}
