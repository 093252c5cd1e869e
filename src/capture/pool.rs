//! Kernel-allocated, memory-mapped buffer pool.
//!
//! The device owns a fixed set of buffer slots; this module negotiates the
//! pool (`VIDIOC_REQBUFS`), queries each slot's offset and length
//! (`VIDIOC_QUERYBUF`) and maps them into the process. Each mapping lives
//! exactly as long as its [`MappedBuffer`], so tearing the pool down unmaps
//! everything without a manual free path.

use std::fs::File;
use std::io;
use std::mem;
use std::os::fd::AsRawFd;
use std::os::raw::c_void;

use memmap2::{MmapMut, MmapOptions};
use tracing::debug;
use v4l::buffer::Type;
use v4l::memory::Memory;
use v4l::v4l2;
use v4l::v4l_sys::{v4l2_buffer, v4l2_requestbuffers};

use crate::error::CaptureError;

/// Retry a raw device call while it keeps getting interrupted.
pub(crate) fn retry_eintr(mut call: impl FnMut() -> io::Result<()>) -> io::Result<()> {
    loop {
        match call() {
            Err(e) if e.raw_os_error() == Some(libc::EINTR) => continue,
            other => return other,
        }
    }
}

/// One device-owned buffer slot, mapped into the process.
///
/// Only ever handed out as a read-only view, and only between a dequeue and
/// the matching re-enqueue; the device is free to overwrite the slot the
/// moment it gets it back.
pub struct MappedBuffer {
    map: MmapMut,
}

impl MappedBuffer {
    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.len() == 0
    }
}

/// The full set of mapped slots for one configured device.
pub struct MappedBufferPool {
    buffers: Vec<MappedBuffer>,
}

impl MappedBufferPool {
    /// Request `requested` slots from the device and map every slot it
    /// actually granted.
    pub fn map(file: &File, requested: u32, path: &str) -> Result<Self, CaptureError> {
        let fd = file.as_raw_fd();

        let mut req: v4l2_requestbuffers = unsafe { mem::zeroed() };
        req.count = requested;
        req.type_ = Type::VideoCapture as u32;
        req.memory = Memory::Mmap as u32;

        retry_eintr(|| unsafe {
            v4l2::ioctl(fd, v4l2::vidioc::VIDIOC_REQBUFS, &mut req as *mut _ as *mut c_void)
        })
        .map_err(|e| {
            if e.raw_os_error() == Some(libc::EINVAL) {
                CaptureError::UnsupportedDevice { path: path.into() }
            } else {
                CaptureError::fault("VIDIOC_REQBUFS", e)
            }
        })?;

        // The driver may grant fewer slots than requested; below two the
        // queue/dequeue protocol cannot ping-pong.
        if req.count < 2 {
            return Err(CaptureError::InsufficientBuffers { granted: req.count });
        }

        let mut buffers = Vec::with_capacity(req.count as usize);
        for index in 0..req.count {
            let mut buf: v4l2_buffer = unsafe { mem::zeroed() };
            buf.type_ = Type::VideoCapture as u32;
            buf.memory = Memory::Mmap as u32;
            buf.index = index;

            retry_eintr(|| unsafe {
                v4l2::ioctl(fd, v4l2::vidioc::VIDIOC_QUERYBUF, &mut buf as *mut _ as *mut c_void)
            })
            .map_err(|e| CaptureError::fault("VIDIOC_QUERYBUF", e))?;

            let offset = unsafe { buf.m.offset };
            let map = unsafe {
                MmapOptions::new()
                    .offset(u64::from(offset))
                    .len(buf.length as usize)
                    .map_mut(file)
            }
            .map_err(|e| CaptureError::OutOfMemory { index, source: e })?;

            debug!(index, length = buf.length, "mapped buffer slot");
            buffers.push(MappedBuffer { map });
        }

        Ok(Self { buffers })
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Read-only view of one slot, valid only while the slot is dequeued.
    pub fn view(&self, index: usize) -> &[u8] {
        &self.buffers[index].map
    }
}
