//! The kernel-facing seam: every ioctl the core issues goes through [`Driver`].
//!
//! [`V4l2Driver`] talks to a real `/dev/videoN` node through the `v4l` crate:
//! its `Device` for capability and format negotiation, and its raw
//! `v4l2::ioctl`/`mmap` wrappers with the `v4l_sys` structs for the buffer
//! queue and controls. Only the UVC extension unit query is hand-declared
//! (see [`crate::xu`]).

use crate::error::{CameraError, Result};
use crate::quirks;
use crate::xu::{UvcXuControlQuery, UVCIOC_CTRL_QUERY};
use std::io;
use std::mem;
use std::os::raw::{c_int, c_void};
use std::path::Path;
use std::ptr::NonNull;
use std::time::Duration;
use v4l::buffer::Type as BufferType;
use v4l::control::Flags as ControlFlags;
use v4l::memory::Memory;
use v4l::timestamp::Timestamp;
use v4l::v4l2::{self, vidioc};
use v4l::v4l_sys::{v4l2_buffer, v4l2_control, v4l2_queryctrl, v4l2_requestbuffers};
use v4l::video::capture::Parameters;
use v4l::video::Capture;
use v4l::{Device, FourCC};

/// UVC_SET_CUR / UVC_GET_CUR request codes.
pub const UVC_SET_CUR: u8 = 0x01;
pub const UVC_GET_CUR: u8 = 0x81;

/// Capabilities reported by `VIDIOC_QUERYCAP`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceCaps {
    pub driver: String,
    pub card: String,
    pub bus_info: String,
    pub video_capture: bool,
    pub streaming: bool,
}

/// A pixel format as requested from, or answered by, the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Format {
    pub fourcc: [u8; 4],
    pub width: u32,
    pub height: u32,
    /// Bytes per line.
    pub stride: u32,
    /// Bytes per image.
    pub size: u32,
}

impl Format {
    pub fn request(fourcc: [u8; 4], width: u32, height: u32) -> Self {
        Self {
            fourcc,
            width,
            height,
            stride: 0,
            size: 0,
        }
    }

    pub fn fourcc_str(&self) -> String {
        String::from_utf8_lossy(&self.fourcc).trim_end().to_string()
    }
}

impl std::fmt::Display for Format {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}x{}", self.fourcc_str(), self.width, self.height)
    }
}

/// A buffer handed back by `VIDIOC_DQBUF`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dequeued {
    pub index: u32,
    pub bytes_used: u32,
    pub sequence: u32,
    pub timestamp: Duration,
}

/// Control metadata from `VIDIOC_QUERYCTRL`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlInfo {
    pub id: u32,
    pub name: String,
    pub minimum: i32,
    pub maximum: i32,
    pub step: i32,
    pub default_value: i32,
}

/// A region of driver memory mapped into this process.
///
/// Only a [`Driver`] creates or destroys mappings; the buffer pool holds them
/// in between.
#[derive(Debug)]
pub struct Mapping {
    ptr: NonNull<u8>,
    len: usize,
}

// SAFETY: the mapping is plain shared memory; ownership of the region moves
// with the value and reads are coordinated by slot state.
unsafe impl Send for Mapping {}
unsafe impl Sync for Mapping {}

impl Mapping {
    /// # Safety
    ///
    /// `ptr` must be valid for reads of `len` bytes until the mapping is
    /// passed back to [`Driver::unmap_buffer`].
    pub unsafe fn from_raw_parts(ptr: NonNull<u8>, len: usize) -> Self {
        Self { ptr, len }
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The first `len` bytes of the region (clamped to the mapping length).
    pub fn bytes(&self, len: usize) -> &[u8] {
        let len = len.min(self.len);
        // SAFETY: the constructor guarantees `ptr` is readable for `self.len`
        // bytes for as long as `self` exists.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), len) }
    }
}

/// Operations the capture core needs from a video driver.
///
/// All methods take `&self`: the buffer queue is driven by the capture thread
/// while the control plane may be used from others, mirroring how a single
/// file descriptor is shared in the kernel.
pub trait Driver: Send + Sync {
    fn query_caps(&self) -> io::Result<DeviceCaps>;

    /// Ask for a format; the driver answers with what it actually set.
    fn set_format(&self, request: &Format) -> io::Result<Format>;

    /// Ask for a frame rate; returns the rate the driver settled on.
    fn set_frame_rate(&self, fps: u32) -> io::Result<u32>;

    /// Returns the number of buffers the driver granted.
    fn request_buffers(&self, count: u32) -> io::Result<u32>;
    fn release_buffers(&self) -> io::Result<()>;
    fn map_buffer(&self, index: u32) -> io::Result<Mapping>;
    fn unmap_buffer(&self, mapping: Mapping) -> io::Result<()>;
    fn queue_buffer(&self, index: u32) -> io::Result<()>;

    /// Dequeue a finished buffer; `Ok(None)` when none is ready yet.
    fn dequeue_buffer(&self) -> io::Result<Option<Dequeued>>;

    /// Wait until a buffer can be dequeued. `None` waits forever.
    /// Returns `false` on timeout.
    fn wait_for_frame(&self, timeout: Option<Duration>) -> io::Result<bool>;

    fn stream_on(&self) -> io::Result<()>;
    fn stream_off(&self) -> io::Result<()>;

    /// `Ok(None)` when the id is not known to the driver.
    fn query_control(&self, id: u32) -> io::Result<Option<ControlInfo>>;
    fn get_control(&self, id: u32) -> io::Result<i32>;
    fn set_control(&self, id: u32, value: i32) -> io::Result<()>;

    /// One UVC extension unit transfer (`UVC_SET_CUR` / `UVC_GET_CUR`).
    fn xu_query(&self, unit: u8, selector: u8, query: u8, data: &mut [u8]) -> io::Result<()>;

    /// USB VID:PID of the device, when it is a USB device.
    fn usb_ids(&self) -> Option<(u16, u16)>;
}

impl<D: Driver + ?Sized> Driver for std::sync::Arc<D> {
    fn query_caps(&self) -> io::Result<DeviceCaps> {
        (**self).query_caps()
    }
    fn set_format(&self, request: &Format) -> io::Result<Format> {
        (**self).set_format(request)
    }
    fn set_frame_rate(&self, fps: u32) -> io::Result<u32> {
        (**self).set_frame_rate(fps)
    }
    fn request_buffers(&self, count: u32) -> io::Result<u32> {
        (**self).request_buffers(count)
    }
    fn release_buffers(&self) -> io::Result<()> {
        (**self).release_buffers()
    }
    fn map_buffer(&self, index: u32) -> io::Result<Mapping> {
        (**self).map_buffer(index)
    }
    fn unmap_buffer(&self, mapping: Mapping) -> io::Result<()> {
        (**self).unmap_buffer(mapping)
    }
    fn queue_buffer(&self, index: u32) -> io::Result<()> {
        (**self).queue_buffer(index)
    }
    fn dequeue_buffer(&self) -> io::Result<Option<Dequeued>> {
        (**self).dequeue_buffer()
    }
    fn wait_for_frame(&self, timeout: Option<Duration>) -> io::Result<bool> {
        (**self).wait_for_frame(timeout)
    }
    fn stream_on(&self) -> io::Result<()> {
        (**self).stream_on()
    }
    fn stream_off(&self) -> io::Result<()> {
        (**self).stream_off()
    }
    fn query_control(&self, id: u32) -> io::Result<Option<ControlInfo>> {
        (**self).query_control(id)
    }
    fn get_control(&self, id: u32) -> io::Result<i32> {
        (**self).get_control(id)
    }
    fn set_control(&self, id: u32, value: i32) -> io::Result<()> {
        (**self).set_control(id, value)
    }
    fn xu_query(&self, unit: u8, selector: u8, query: u8, data: &mut [u8]) -> io::Result<()> {
        (**self).xu_query(unit, selector, query, data)
    }
    fn usb_ids(&self) -> Option<(u16, u16)> {
        (**self).usb_ids()
    }
}

/// A real V4L2 device node.
pub struct V4l2Driver {
    device: Device,
    path: String,
}

impl V4l2Driver {
    /// Open a V4L2 device by path (e.g., "/dev/video0").
    pub fn open(path: &str) -> Result<Self> {
        if !Path::new(path).exists() {
            return Err(CameraError::DeviceUnavailable {
                path: path.to_string(),
                source: io::Error::from(io::ErrorKind::NotFound),
            });
        }

        let device = Device::with_path(path).map_err(|source| CameraError::DeviceUnavailable {
            path: path.to_string(),
            source,
        })?;

        tracing::debug!(device = path, "opened device node");
        Ok(Self {
            device,
            path: path.to_string(),
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    fn fd(&self) -> c_int {
        self.device.handle().fd()
    }

    /// Issue `request` on the device, retrying on `EINTR`.
    ///
    /// # Safety
    ///
    /// `T` must be the argument type encoded in `request`.
    unsafe fn ioctl<T>(&self, request: vidioc::_IOC_TYPE, arg: &mut T) -> io::Result<()> {
        let arg = (arg as *mut T).cast::<c_void>();
        loop {
            // SAFETY: upheld by the caller; `arg` outlives the call.
            match unsafe { v4l2::ioctl(self.fd(), request, arg) } {
                Err(e) if e.raw_os_error() == Some(libc::EINTR) => continue,
                result => return result,
            }
        }
    }
}

fn capture_buffer(index: u32) -> v4l2_buffer {
    v4l2_buffer {
        index,
        type_: BufferType::VideoCapture as u32,
        memory: Memory::Mmap as u32,
        // SAFETY: v4l2_buffer is plain data; all-zero is a valid value.
        ..unsafe { mem::zeroed() }
    }
}

fn timestamp(buf: &v4l2_buffer) -> Duration {
    let ts = Timestamp::from(buf.timestamp);
    let secs = ts.sec.max(0) as u64;
    let micros = ts.usec.clamp(0, 999_999) as u32;
    Duration::new(secs, micros * 1000)
}

impl Driver for V4l2Driver {
    fn query_caps(&self) -> io::Result<DeviceCaps> {
        let caps = self.device.query_caps()?;
        Ok(DeviceCaps {
            video_capture: caps
                .capabilities
                .contains(v4l::capability::Flags::VIDEO_CAPTURE),
            streaming: caps.capabilities.contains(v4l::capability::Flags::STREAMING),
            driver: caps.driver,
            card: caps.card,
            bus_info: caps.bus,
        })
    }

    fn set_format(&self, request: &Format) -> io::Result<Format> {
        let mut fmt = self.device.format()?;
        fmt.fourcc = FourCC::new(&request.fourcc);
        fmt.width = request.width;
        fmt.height = request.height;

        let negotiated = self.device.set_format(&fmt)?;
        Ok(Format {
            fourcc: negotiated.fourcc.repr,
            width: negotiated.width,
            height: negotiated.height,
            stride: negotiated.stride,
            size: negotiated.size,
        })
    }

    fn set_frame_rate(&self, fps: u32) -> io::Result<u32> {
        let params = self.device.set_params(&Parameters::with_fps(fps))?;
        let interval = params.interval;
        Ok(interval.denominator / interval.numerator.max(1))
    }

    fn request_buffers(&self, count: u32) -> io::Result<u32> {
        let mut req = v4l2_requestbuffers {
            count,
            type_: BufferType::VideoCapture as u32,
            memory: Memory::Mmap as u32,
            // SAFETY: v4l2_requestbuffers is plain data; all-zero is valid.
            ..unsafe { mem::zeroed() }
        };
        // SAFETY: REQBUFS takes a v4l2_requestbuffers.
        unsafe { self.ioctl(vidioc::VIDIOC_REQBUFS, &mut req) }?;
        Ok(req.count)
    }

    fn release_buffers(&self) -> io::Result<()> {
        self.request_buffers(0).map(|_| ())
    }

    fn map_buffer(&self, index: u32) -> io::Result<Mapping> {
        let mut buf = capture_buffer(index);
        // SAFETY: QUERYBUF takes a v4l2_buffer.
        unsafe { self.ioctl(vidioc::VIDIOC_QUERYBUF, &mut buf) }?;

        let len = buf.length as usize;
        // SAFETY: MMAP buffers are described through `m.offset`; the region
        // is the driver's own offset/length on our fd.
        let ptr = unsafe {
            v4l2::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                self.fd(),
                buf.m.offset as libc::off_t,
            )
        }?;
        let ptr = NonNull::new(ptr.cast::<u8>()).ok_or_else(|| io::Error::from(io::ErrorKind::Other))?;
        // SAFETY: mmap succeeded for `len` bytes; the region lives until
        // `unmap_buffer` consumes this mapping.
        Ok(unsafe { Mapping::from_raw_parts(ptr, len) })
    }

    fn unmap_buffer(&self, mapping: Mapping) -> io::Result<()> {
        // SAFETY: the mapping was produced by `map_buffer` with this length
        // and is consumed here, so no view of it survives.
        unsafe { v4l2::munmap(mapping.as_ptr().cast(), mapping.len()) }
    }

    fn queue_buffer(&self, index: u32) -> io::Result<()> {
        let mut buf = capture_buffer(index);
        // SAFETY: QBUF takes a v4l2_buffer.
        unsafe { self.ioctl(vidioc::VIDIOC_QBUF, &mut buf) }
    }

    fn dequeue_buffer(&self) -> io::Result<Option<Dequeued>> {
        let mut buf = capture_buffer(0);
        // SAFETY: DQBUF takes a v4l2_buffer.
        match unsafe { self.ioctl(vidioc::VIDIOC_DQBUF, &mut buf) } {
            Ok(()) => {}
            Err(e) if e.raw_os_error() == Some(libc::EAGAIN) => return Ok(None),
            Err(e) => return Err(e),
        }

        Ok(Some(Dequeued {
            index: buf.index,
            bytes_used: buf.bytesused,
            sequence: buf.sequence,
            timestamp: timestamp(&buf),
        }))
    }

    fn wait_for_frame(&self, timeout: Option<Duration>) -> io::Result<bool> {
        let timeout_ms = match timeout {
            None => -1,
            Some(d) => d.as_millis().min(i32::MAX as u128) as i32,
        };
        let handle = self.device.handle();
        loop {
            match handle.poll(libc::POLLIN, timeout_ms) {
                Ok(ready) => return Ok(ready > 0),
                Err(e) if e.raw_os_error() == Some(libc::EINTR) => continue,
                Err(e) => return Err(e),
            }
        }
    }

    fn stream_on(&self) -> io::Result<()> {
        let mut buf_type = BufferType::VideoCapture as c_int;
        // SAFETY: STREAMON takes an int buffer type.
        unsafe { self.ioctl(vidioc::VIDIOC_STREAMON, &mut buf_type) }
    }

    fn stream_off(&self) -> io::Result<()> {
        let mut buf_type = BufferType::VideoCapture as c_int;
        // SAFETY: STREAMOFF takes an int buffer type.
        unsafe { self.ioctl(vidioc::VIDIOC_STREAMOFF, &mut buf_type) }
    }

    fn query_control(&self, id: u32) -> io::Result<Option<ControlInfo>> {
        let mut query = v4l2_queryctrl {
            id,
            // SAFETY: v4l2_queryctrl is plain data; all-zero is valid.
            ..unsafe { mem::zeroed() }
        };
        // SAFETY: QUERYCTRL takes a v4l2_queryctrl.
        match unsafe { self.ioctl(vidioc::VIDIOC_QUERYCTRL, &mut query) } {
            Ok(()) => {}
            Err(e) if e.raw_os_error() == Some(libc::EINVAL) => return Ok(None),
            Err(e) => return Err(e),
        }
        if ControlFlags::from(query.flags).contains(ControlFlags::DISABLED) {
            return Ok(None);
        }

        let name_len = query.name.iter().position(|&b| b == 0).unwrap_or(query.name.len());
        Ok(Some(ControlInfo {
            id: query.id,
            name: String::from_utf8_lossy(&query.name[..name_len]).into_owned(),
            minimum: query.minimum,
            maximum: query.maximum,
            step: query.step,
            default_value: query.default_value,
        }))
    }

    // Plain G/S_CTRL rather than `Device::control`: the extended-control
    // calls are keyed by class and the legacy private IDs have none.
    fn get_control(&self, id: u32) -> io::Result<i32> {
        let mut ctrl = v4l2_control { id, value: 0 };
        // SAFETY: G_CTRL takes a v4l2_control.
        unsafe { self.ioctl(vidioc::VIDIOC_G_CTRL, &mut ctrl) }?;
        Ok(ctrl.value)
    }

    fn set_control(&self, id: u32, value: i32) -> io::Result<()> {
        let mut ctrl = v4l2_control { id, value };
        // SAFETY: S_CTRL takes a v4l2_control.
        unsafe { self.ioctl(vidioc::VIDIOC_S_CTRL, &mut ctrl) }
    }

    fn xu_query(&self, unit: u8, selector: u8, query: u8, data: &mut [u8]) -> io::Result<()> {
        let size = u16::try_from(data.len())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "XU payload too large"))?;
        let mut xu = UvcXuControlQuery {
            unit,
            selector,
            query,
            _pad0: 0,
            size,
            _pad1: 0,
            data: data.as_mut_ptr(),
        };
        // SAFETY:
        // - the fd is valid for the lifetime of `self.device`
        // - `xu` is repr(C) and UVCIOC_CTRL_QUERY encodes its size
        // - `data` is valid and lives for the duration of this call
        unsafe { self.ioctl(UVCIOC_CTRL_QUERY, &mut xu) }
    }

    fn usb_ids(&self) -> Option<(u16, u16)> {
        quirks::get_usb_ids(&self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_missing_node() {
        let err = V4l2Driver::open("/dev/see3cam-does-not-exist").err();
        assert!(matches!(err, Some(CameraError::DeviceUnavailable { .. })));
    }

    #[test]
    fn test_format_display_trims_padding() {
        let fmt = Format::request(*b"Y16 ", 752, 480);
        assert_eq!(fmt.to_string(), "Y16 752x480");
    }

    #[test]
    fn test_mapping_bytes_clamped() {
        let mut backing = vec![7u8; 8];
        let ptr = NonNull::new(backing.as_mut_ptr()).unwrap();
        let mapping = unsafe { Mapping::from_raw_parts(ptr, backing.len()) };
        assert_eq!(mapping.bytes(4), &[7, 7, 7, 7]);
        assert_eq!(mapping.bytes(100).len(), 8);
    }
}
