//! V4L2 capture device lifecycle and the acquire/release protocol.
//!
//! The device exposes a strict ownership-transfer protocol over its buffer
//! pool: a dequeue moves one slot to us, the matching re-enqueue hands it
//! back. [`CaptureDevice::acquire_frame`] never separates the two, so the
//! device's finite slot set cannot leak. Teardown consumes the value, which
//! makes a double teardown within one configure cycle unrepresentable.

use std::fs::{File, OpenOptions};
use std::io;
use std::mem;
use std::os::fd::{AsFd, AsRawFd};
use std::os::raw::c_void;
use std::os::unix::fs::{FileTypeExt, OpenOptionsExt};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use tracing::{debug, info, warn};
use v4l::buffer::Type;
use v4l::memory::Memory;
use v4l::v4l2;
use v4l::v4l_sys::{
    v4l2_buffer, v4l2_capability, v4l2_captureparm, v4l2_crop, v4l2_cropcap, v4l2_format,
    v4l2_fract, v4l2_pix_format, v4l2_streamparm, V4L2_CAP_STREAMING, V4L2_CAP_VIDEO_CAPTURE,
};
use v4l::FourCC;

use crate::capture::frame::{Frame, FrameMetadata, PixelFormat};
use crate::capture::pool::{retry_eintr, MappedBufferPool};
use crate::capture::CaptureSource;
use crate::error::CaptureError;
use crate::CaptureConfig;

/// Everything needed to bring up one capture session. Immutable once the
/// device is open; a rate change goes through a full teardown and reopen.
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    pub path: String,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub fps: u32,
    pub buffer_count: u32,
    pub io_timeout: Duration,
}

impl From<&CaptureConfig> for DeviceConfig {
    fn from(cfg: &CaptureConfig) -> Self {
        Self {
            path: cfg.device.path.clone(),
            width: cfg.width,
            height: cfg.height,
            format: cfg.format,
            fps: cfg.fps,
            buffer_count: cfg.buffer_count,
            io_timeout: Duration::from_millis(cfg.io_timeout_ms),
        }
    }
}

struct Dequeued {
    index: u32,
    bytesused: u32,
    timestamp: Duration,
}

/// One open, configured capture source.
pub struct CaptureDevice {
    config: DeviceConfig,
    file: File,
    pool: MappedBufferPool,
    streaming: bool,
    sequence: u64,
    effective_fps: u32,
}

impl CaptureDevice {
    /// Validate, open and configure the device: capability query, format
    /// and rate negotiation, buffer pool allocation and mapping.
    ///
    /// The driver may substitute nearby dimensions; those are re-read and
    /// accepted. A substituted pixel format is rejected outright, since
    /// every consumer downstream would misinterpret the payload.
    pub fn open(config: DeviceConfig) -> Result<Self, CaptureError> {
        let file = open_handle(&config.path)?;
        info!(path = %config.path, "capture device opened");

        query_capabilities(&file, &config.path)?;
        reset_crop(&file);

        let (width, height) = negotiate_format(&file, &config)?;
        let effective_fps = negotiate_rate(&file, config.fps)?;
        if effective_fps != config.fps {
            warn!(
                requested = config.fps,
                effective = effective_fps,
                "device adjusted frame rate"
            );
        }

        let pool = MappedBufferPool::map(&file, config.buffer_count, &config.path)?;
        info!(
            width,
            height,
            fps = effective_fps,
            buffers = pool.len(),
            "device configured"
        );

        let mut config = config;
        config.width = width;
        config.height = height;

        Ok(Self {
            config,
            file,
            pool,
            streaming: false,
            sequence: 0,
            effective_fps,
        })
    }

    /// Hand every mapped slot to the device and switch streaming on.
    ///
    /// A failed enqueue leaves the pool partially owned by the device;
    /// nothing short of a full teardown recovers from that, so any failure
    /// here is fatal.
    pub fn start_streaming(&mut self) -> Result<(), CaptureError> {
        for index in 0..self.pool.len() as u32 {
            self.enqueue(index)?;
        }

        let fd = self.file.as_raw_fd();
        let mut kind = Type::VideoCapture as i32;
        retry_eintr(|| unsafe {
            v4l2::ioctl(fd, v4l2::vidioc::VIDIOC_STREAMON, &mut kind as *mut _ as *mut c_void)
        })
        .map_err(|e| CaptureError::fault("VIDIOC_STREAMON", e))?;

        self.streaming = true;
        info!(buffers = self.pool.len(), "streaming started");
        Ok(())
    }

    /// Switch streaming off; every enqueued slot falls back to us.
    pub fn stop_streaming(&mut self) -> Result<(), CaptureError> {
        let fd = self.file.as_raw_fd();
        let mut kind = Type::VideoCapture as i32;
        retry_eintr(|| unsafe {
            v4l2::ioctl(fd, v4l2::vidioc::VIDIOC_STREAMOFF, &mut kind as *mut _ as *mut c_void)
        })
        .map_err(|e| CaptureError::fault("VIDIOC_STREAMOFF", e))?;

        self.streaming = false;
        Ok(())
    }

    /// Wait for a completed buffer, copy it out and immediately hand the
    /// slot back to the device.
    ///
    /// The copy happens strictly before the re-enqueue: once the slot is
    /// back with the device its contents are gone.
    pub fn acquire(&mut self, timeout: Duration) -> Result<Frame, CaptureError> {
        if !self.streaming {
            return Err(CaptureError::fault(
                "VIDIOC_DQBUF",
                io::Error::new(io::ErrorKind::NotConnected, "stream is off"),
            ));
        }

        loop {
            self.wait_readable(timeout)?;

            let Some(slot) = self.dequeue()? else {
                // Readable fd but no finished buffer yet; not an error.
                debug!("dequeue not ready, retrying");
                continue;
            };

            let view = self.pool.view(slot.index as usize);
            let data = Bytes::copy_from_slice(&view[..slot.bytesused as usize]);

            self.sequence += 1;
            let frame = Frame {
                data,
                meta: Arc::new(FrameMetadata {
                    sequence: self.sequence,
                    width: self.config.width,
                    height: self.config.height,
                    format: self.config.format,
                    device_timestamp: Some(slot.timestamp),
                }),
                timestamp: Instant::now(),
            };

            self.enqueue(slot.index)?;
            return Ok(frame);
        }
    }

    fn wait_readable(&self, timeout: Duration) -> Result<(), CaptureError> {
        let ms = timeout.as_millis().min(u128::from(u16::MAX)) as u16;
        loop {
            let mut fds = [PollFd::new(self.file.as_fd(), PollFlags::POLLIN)];
            match poll(&mut fds, PollTimeout::from(ms)) {
                Ok(0) => return Err(CaptureError::Timeout { timeout }),
                Ok(_) => return Ok(()),
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => {
                    return Err(CaptureError::fault(
                        "poll",
                        io::Error::from_raw_os_error(e as i32),
                    ))
                }
            }
        }
    }

    /// `Ok(None)` means "no frame ready yet" (EAGAIN), which callers retry.
    fn dequeue(&mut self) -> Result<Option<Dequeued>, CaptureError> {
        let fd = self.file.as_raw_fd();
        let mut buf: v4l2_buffer = unsafe { mem::zeroed() };
        buf.type_ = Type::VideoCapture as u32;
        buf.memory = Memory::Mmap as u32;

        let res = retry_eintr(|| unsafe {
            v4l2::ioctl(fd, v4l2::vidioc::VIDIOC_DQBUF, &mut buf as *mut _ as *mut c_void)
        });
        match res {
            Ok(()) => {}
            Err(e) if e.raw_os_error() == Some(libc::EAGAIN) => return Ok(None),
            Err(e) => return Err(CaptureError::fault("VIDIOC_DQBUF", e)),
        }

        debug_assert!((buf.index as usize) < self.pool.len());
        let timestamp = Duration::from_secs(buf.timestamp.tv_sec as u64)
            + Duration::from_micros(buf.timestamp.tv_usec as u64);

        Ok(Some(Dequeued {
            index: buf.index,
            bytesused: buf.bytesused,
            timestamp,
        }))
    }

    fn enqueue(&mut self, index: u32) -> Result<(), CaptureError> {
        let fd = self.file.as_raw_fd();
        let mut buf: v4l2_buffer = unsafe { mem::zeroed() };
        buf.type_ = Type::VideoCapture as u32;
        buf.memory = Memory::Mmap as u32;
        buf.index = index;

        retry_eintr(|| unsafe {
            v4l2::ioctl(fd, v4l2::vidioc::VIDIOC_QBUF, &mut buf as *mut _ as *mut c_void)
        })
        .map_err(|e| CaptureError::fault("VIDIOC_QBUF", e))
    }
}

impl CaptureSource for CaptureDevice {
    fn acquire_frame(&mut self, timeout: Duration) -> Result<Frame, CaptureError> {
        self.acquire(timeout)
    }

    fn frame_rate(&self) -> u32 {
        self.effective_fps
    }

    fn read_timeout(&self) -> Duration {
        self.config.io_timeout
    }

    fn reconfigure_rate(mut self, fps: u32) -> Result<Self, CaptureError> {
        let mut config = self.config.clone();
        config.fps = fps;

        if self.streaming {
            self.stop_streaming()?;
        }
        drop(self); // unmaps the pool, closes the handle

        let mut device = Self::open(config)?;
        device.start_streaming()?;
        Ok(device)
    }

    fn shutdown(mut self) -> Result<(), CaptureError> {
        if self.streaming {
            self.stop_streaming()?;
        }
        info!("capture device released");
        Ok(())
    }
}

impl Drop for CaptureDevice {
    fn drop(&mut self) {
        if self.streaming {
            if let Err(err) = self.stop_streaming() {
                warn!(%err, "stream-off during drop failed");
            }
        }
    }
}

fn open_handle(path: &str) -> Result<File, CaptureError> {
    let meta = std::fs::metadata(path).map_err(|e| CaptureError::DeviceNotFound {
        path: path.into(),
        source: e,
    })?;
    if !meta.file_type().is_char_device() {
        return Err(CaptureError::NotACaptureDevice { path: path.into() });
    }

    OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(path)
        .map_err(|e| CaptureError::fault("open", e))
}

fn query_capabilities(file: &File, path: &str) -> Result<(), CaptureError> {
    let fd = file.as_raw_fd();
    let mut caps: v4l2_capability = unsafe { mem::zeroed() };

    retry_eintr(|| unsafe {
        v4l2::ioctl(fd, v4l2::vidioc::VIDIOC_QUERYCAP, &mut caps as *mut _ as *mut c_void)
    })
    .map_err(|e| {
        if e.raw_os_error() == Some(libc::EINVAL) {
            CaptureError::NotACaptureDevice { path: path.into() }
        } else {
            CaptureError::fault("VIDIOC_QUERYCAP", e)
        }
    })?;

    info!(
        card = %fixed_cstr(&caps.card),
        driver = %fixed_cstr(&caps.driver),
        "device identified"
    );

    if caps.capabilities & V4L2_CAP_VIDEO_CAPTURE == 0
        || caps.capabilities & V4L2_CAP_STREAMING == 0
    {
        return Err(CaptureError::UnsupportedDevice { path: path.into() });
    }
    Ok(())
}

/// Reset cropping to the driver default. Not every driver supports this;
/// failures are ignored, as the effective format is re-read afterwards.
fn reset_crop(file: &File) {
    let fd = file.as_raw_fd();
    let mut cropcap: v4l2_cropcap = unsafe { mem::zeroed() };
    cropcap.type_ = Type::VideoCapture as u32;

    let res = retry_eintr(|| unsafe {
        v4l2::ioctl(fd, v4l2::vidioc::VIDIOC_CROPCAP, &mut cropcap as *mut _ as *mut c_void)
    });
    if res.is_err() {
        return;
    }

    let mut crop: v4l2_crop = unsafe { mem::zeroed() };
    crop.type_ = Type::VideoCapture as u32;
    crop.c = cropcap.defrect;
    let _ = retry_eintr(|| unsafe {
        v4l2::ioctl(fd, v4l2::vidioc::VIDIOC_S_CROP, &mut crop as *mut _ as *mut c_void)
    });
}

/// Negotiate pixel format and dimensions; returns the effective dimensions.
fn negotiate_format(file: &File, config: &DeviceConfig) -> Result<(u32, u32), CaptureError> {
    let fd = file.as_raw_fd();
    let requested = fourcc_for(config.format);

    let mut fmt: v4l2_format = unsafe { mem::zeroed() };
    fmt.type_ = Type::VideoCapture as u32;
    let mut pix: v4l2_pix_format = unsafe { mem::zeroed() };
    pix.width = config.width;
    pix.height = config.height;
    pix.pixelformat = u32::from_le_bytes(requested.repr);
    fmt.fmt.pix = pix;

    retry_eintr(|| unsafe {
        v4l2::ioctl(fd, v4l2::vidioc::VIDIOC_S_FMT, &mut fmt as *mut _ as *mut c_void)
    })
    .map_err(|e| CaptureError::fault("VIDIOC_S_FMT", e))?;

    // The driver writes the format it actually selected back into the
    // request; trusting the request values instead is how frames get
    // misparsed.
    let effective = unsafe { fmt.fmt.pix };
    let got = FourCC::new(&effective.pixelformat.to_le_bytes());
    if got != requested {
        return Err(CaptureError::FormatRejected {
            requested: requested.to_string(),
            got: got.to_string(),
        });
    }
    if effective.width != config.width || effective.height != config.height {
        warn!(
            requested_width = config.width,
            requested_height = config.height,
            width = effective.width,
            height = effective.height,
            "device adjusted frame dimensions"
        );
    }

    Ok((effective.width, effective.height))
}

/// Negotiate the frame interval; returns the effective rate.
fn negotiate_rate(file: &File, fps: u32) -> Result<u32, CaptureError> {
    let fd = file.as_raw_fd();
    let mut parm: v4l2_streamparm = unsafe { mem::zeroed() };
    parm.type_ = Type::VideoCapture as u32;

    let mut capture: v4l2_captureparm = unsafe { mem::zeroed() };
    capture.timeperframe = v4l2_fract {
        numerator: 1,
        denominator: fps,
    };
    parm.parm.capture = capture;

    retry_eintr(|| unsafe {
        v4l2::ioctl(fd, v4l2::vidioc::VIDIOC_S_PARM, &mut parm as *mut _ as *mut c_void)
    })
    .map_err(|e| CaptureError::fault("VIDIOC_S_PARM", e))?;

    let effective = unsafe { parm.parm.capture.timeperframe };
    if effective.numerator == 0 || effective.denominator == 0 {
        return Ok(fps);
    }
    Ok(effective.denominator / effective.numerator)
}

fn fourcc_for(format: PixelFormat) -> FourCC {
    match format {
        PixelFormat::Mjpeg => FourCC::new(b"MJPG"),
        PixelFormat::Yuyv4 => FourCC::new(b"YUYV"),
        PixelFormat::Grey => FourCC::new(b"GREY"),
    }
}

fn fixed_cstr(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}
