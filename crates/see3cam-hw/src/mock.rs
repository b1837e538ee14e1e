//! In-memory [`Driver`] for tests and for running without hardware.
//!
//! Buffers are heap allocations handed out as [`Mapping`]s; a dequeue writes
//! the next scripted payload (or a generated pattern) into the slot, the way
//! the kernel fills an mmap buffer.

use crate::driver::{ControlInfo, DeviceCaps, Dequeued, Driver, Format, Mapping, UVC_GET_CUR, UVC_SET_CUR};
use std::collections::{HashMap, VecDeque};
use std::io;
use std::ptr::NonNull;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

const MAX_WIDTH: u32 = 4096;
const MAX_HEIGHT: u32 = 4096;

/// Longest a timed wait actually sleeps when nothing is ready.
const MAX_IDLE_WAIT: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
struct MockControl {
    minimum: i32,
    maximum: i32,
    default_value: i32,
    value: i32,
}

struct MockState {
    caps: DeviceCaps,
    formats: Vec<[u8; 4]>,
    format: Format,
    fps: u32,
    usb_ids: Option<(u16, u16)>,

    buffer_grant: Option<u32>,
    map_failure_at: Option<u32>,
    allocated: u32,
    /// index -> (address, length) of live heap "mappings".
    mappings: HashMap<u32, (usize, usize)>,
    queued: VecDeque<u32>,
    streaming: bool,
    stalled: bool,
    frame_delay: Option<Duration>,
    frames: VecDeque<Vec<u8>>,
    sequence: u32,

    fail_queue: Option<i32>,
    fail_dequeue: Option<i32>,
    fail_set_control: Option<i32>,

    controls: HashMap<u32, MockControl>,
    queried: Vec<u32>,
    firmware: Vec<u8>,
    xu_writes: Vec<(u8, u8, Vec<u8>)>,
}

/// Simulated UVC camera.
///
/// Defaults to a stereo See3CAM (2560:c114) that can stream every capture
/// mode up to 4096x4096 and exposes no controls until some are added.
pub struct MockDriver {
    state: Mutex<MockState>,
}

impl Default for MockDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDriver {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState {
                caps: DeviceCaps {
                    driver: "uvcvideo".into(),
                    card: "See3CAM_Tara (mock)".into(),
                    bus_info: "usb-mock-1".into(),
                    video_capture: true,
                    streaming: true,
                },
                formats: vec![*b"RGB3", *b"MJPG", *b"YUYV", *b"GRBG", *b"Y16 "],
                format: sized(Format::request(*b"YUYV", 640, 480)),
                fps: 30,
                usb_ids: Some((0x2560, 0xc114)),
                buffer_grant: None,
                map_failure_at: None,
                allocated: 0,
                mappings: HashMap::new(),
                queued: VecDeque::new(),
                streaming: false,
                stalled: false,
                frame_delay: None,
                frames: VecDeque::new(),
                sequence: 0,
                fail_queue: None,
                fail_dequeue: None,
                fail_set_control: None,
                controls: HashMap::new(),
                queried: Vec::new(),
                firmware: vec![1, 0, 0, 0, 0, 0],
                xu_writes: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // --- builders ---

    /// Answer QUERYCTRL for `id` with the given range and initial value.
    pub fn with_control(self, id: u32, minimum: i32, maximum: i32, default_value: i32) -> Self {
        self.lock().controls.insert(
            id,
            MockControl {
                minimum,
                maximum,
                default_value,
                value: default_value,
            },
        );
        self
    }

    /// Bytes returned by the extension unit firmware query.
    pub fn with_firmware(self, bytes: &[u8]) -> Self {
        self.lock().firmware = bytes.to_vec();
        self
    }

    /// Grant at most `count` buffers on REQBUFS.
    pub fn with_buffer_grant(self, count: u32) -> Self {
        self.lock().buffer_grant = Some(count);
        self
    }

    /// Fail mapping the buffer at `index`.
    pub fn with_map_failure_at(self, index: u32) -> Self {
        self.lock().map_failure_at = Some(index);
        self
    }

    /// Pixel formats the device accepts; anything else is swapped for the first.
    pub fn with_formats(self, formats: &[[u8; 4]]) -> Self {
        self.lock().formats = formats.to_vec();
        self
    }

    pub fn with_usb_ids(self, ids: Option<(u16, u16)>) -> Self {
        self.lock().usb_ids = ids;
        self
    }

    /// Report a capture device without streaming I/O.
    pub fn without_streaming(self) -> Self {
        self.lock().caps.streaming = false;
        self
    }

    /// Sleep this long in every wait, as if the sensor ran at a finite rate.
    pub fn with_frame_delay(self, delay: Duration) -> Self {
        self.lock().frame_delay = Some(delay);
        self
    }

    // --- runtime scripting ---

    /// Payload for the next dequeued frame.
    pub fn push_frame(&self, payload: Vec<u8>) {
        self.lock().frames.push_back(payload);
    }

    /// While stalled no frame completes, as with an untriggered slave unit.
    pub fn set_stalled(&self, stalled: bool) {
        self.lock().stalled = stalled;
    }

    pub fn fail_next_queue(&self, errno: i32) {
        self.lock().fail_queue = Some(errno);
    }

    pub fn fail_next_dequeue(&self, errno: i32) {
        self.lock().fail_dequeue = Some(errno);
    }

    pub fn fail_next_set_control(&self, errno: i32) {
        self.lock().fail_set_control = Some(errno);
    }

    // --- inspection ---

    /// Every ID passed to QUERYCTRL, in order.
    pub fn queried_ids(&self) -> Vec<u32> {
        self.lock().queried.clone()
    }

    /// Every extension unit SET_CUR as (unit, selector, payload).
    pub fn xu_writes(&self) -> Vec<(u8, u8, Vec<u8>)> {
        self.lock().xu_writes.clone()
    }

    pub fn live_mappings(&self) -> usize {
        self.lock().mappings.len()
    }

    pub fn allocated_buffers(&self) -> u32 {
        self.lock().allocated
    }

    pub fn is_streaming(&self) -> bool {
        self.lock().streaming
    }

    pub fn control_value(&self, id: u32) -> Option<i32> {
        self.lock().controls.get(&id).map(|c| c.value)
    }
}

fn errno(code: i32) -> io::Error {
    io::Error::from_raw_os_error(code)
}

fn bytes_per_pixel(fourcc: &[u8; 4]) -> u32 {
    match fourcc {
        b"RGB3" => 3,
        b"YUYV" | b"Y16 " => 2,
        _ => 1,
    }
}

fn sized(mut format: Format) -> Format {
    format.stride = format.width * bytes_per_pixel(&format.fourcc);
    format.size = format.stride * format.height;
    format
}

/// Deterministic filler for frames nobody scripted.
fn pattern(len: usize, sequence: u32) -> Vec<u8> {
    (0..len).map(|i| (i as u32).wrapping_add(sequence) as u8).collect()
}

fn free_mapping(address: usize, len: usize) {
    // SAFETY: `address`/`len` came from `Box::<[u8]>::into_raw` in
    // `map_buffer` and each pair is freed exactly once.
    unsafe {
        drop(Box::from_raw(std::ptr::slice_from_raw_parts_mut(
            address as *mut u8,
            len,
        )));
    }
}

impl Driver for MockDriver {
    fn query_caps(&self) -> io::Result<DeviceCaps> {
        Ok(self.lock().caps.clone())
    }

    fn set_format(&self, request: &Format) -> io::Result<Format> {
        let mut state = self.lock();
        let fourcc = if state.formats.contains(&request.fourcc) {
            request.fourcc
        } else {
            *state.formats.first().ok_or_else(|| errno(libc::EINVAL))?
        };
        let format = sized(Format::request(
            fourcc,
            request.width.clamp(1, MAX_WIDTH),
            request.height.clamp(1, MAX_HEIGHT),
        ));
        state.format = format;
        Ok(format)
    }

    fn set_frame_rate(&self, fps: u32) -> io::Result<u32> {
        let mut state = self.lock();
        state.fps = fps.clamp(1, 120);
        Ok(state.fps)
    }

    fn request_buffers(&self, count: u32) -> io::Result<u32> {
        let mut state = self.lock();
        if state.streaming || !state.mappings.is_empty() {
            return Err(errno(libc::EBUSY));
        }
        let granted = state.buffer_grant.map_or(count, |grant| count.min(grant));
        state.allocated = granted;
        Ok(granted)
    }

    fn release_buffers(&self) -> io::Result<()> {
        self.request_buffers(0).map(|_| ())
    }

    fn map_buffer(&self, index: u32) -> io::Result<Mapping> {
        let mut state = self.lock();
        if index >= state.allocated || state.mappings.contains_key(&index) {
            return Err(errno(libc::EINVAL));
        }
        if state.map_failure_at == Some(index) {
            return Err(errno(libc::ENOMEM));
        }

        let len = state.format.size as usize;
        let raw = Box::into_raw(vec![0u8; len].into_boxed_slice());
        let ptr = NonNull::new(raw.cast::<u8>()).ok_or_else(|| errno(libc::ENOMEM))?;
        state.mappings.insert(index, (ptr.as_ptr() as usize, len));
        // SAFETY: the boxed slice stays alive until `unmap_buffer` or drop.
        Ok(unsafe { Mapping::from_raw_parts(ptr, len) })
    }

    fn unmap_buffer(&self, mapping: Mapping) -> io::Result<()> {
        let mut state = self.lock();
        let address = mapping.as_ptr() as usize;
        let index = state
            .mappings
            .iter()
            .find(|(_, region)| region.0 == address)
            .map(|(index, _)| *index)
            .ok_or_else(|| errno(libc::EINVAL))?;
        if let Some((address, len)) = state.mappings.remove(&index) {
            free_mapping(address, len);
        }
        Ok(())
    }

    fn queue_buffer(&self, index: u32) -> io::Result<()> {
        let mut state = self.lock();
        if let Some(code) = state.fail_queue.take() {
            return Err(errno(code));
        }
        if index >= state.allocated || state.queued.contains(&index) {
            return Err(errno(libc::EINVAL));
        }
        state.queued.push_back(index);
        Ok(())
    }

    fn dequeue_buffer(&self) -> io::Result<Option<Dequeued>> {
        let mut state = self.lock();
        if let Some(code) = state.fail_dequeue.take() {
            return Err(errno(code));
        }
        if !state.streaming {
            return Err(errno(libc::EINVAL));
        }
        if state.stalled {
            return Ok(None);
        }
        let Some(index) = state.queued.pop_front() else {
            return Ok(None);
        };

        let sequence = state.sequence;
        state.sequence = state.sequence.wrapping_add(1);
        let capacity = state.format.size as usize;
        let payload = state
            .frames
            .pop_front()
            .unwrap_or_else(|| pattern(capacity, sequence));

        if let Some(&(address, len)) = state.mappings.get(&index) {
            let n = payload.len().min(len);
            // SAFETY: the slot was on the queue, so nothing outside the
            // driver reads it; `n` is within the allocation.
            unsafe {
                std::ptr::copy_nonoverlapping(payload.as_ptr(), address as *mut u8, n);
            }
        }

        Ok(Some(Dequeued {
            index,
            bytes_used: payload.len() as u32,
            sequence,
            timestamp: Duration::from_millis(u64::from(sequence) * 1000 / u64::from(state.fps.max(1))),
        }))
    }

    fn wait_for_frame(&self, timeout: Option<Duration>) -> io::Result<bool> {
        let delay = self.lock().frame_delay;
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }

        let ready = {
            let state = self.lock();
            state.streaming && !state.stalled && !state.queued.is_empty()
        };
        if ready {
            return Ok(true);
        }
        match timeout {
            // A real device would block forever here.
            None => Err(io::Error::new(
                io::ErrorKind::Other,
                "mock: blocking wait with no frame in flight",
            )),
            Some(limit) => {
                std::thread::sleep(limit.min(MAX_IDLE_WAIT));
                Ok(false)
            }
        }
    }

    fn stream_on(&self) -> io::Result<()> {
        let mut state = self.lock();
        if state.allocated == 0 {
            return Err(errno(libc::EINVAL));
        }
        state.streaming = true;
        Ok(())
    }

    fn stream_off(&self) -> io::Result<()> {
        let mut state = self.lock();
        state.streaming = false;
        state.queued.clear();
        Ok(())
    }

    fn query_control(&self, id: u32) -> io::Result<Option<ControlInfo>> {
        let mut state = self.lock();
        state.queried.push(id);
        Ok(state.controls.get(&id).map(|c| ControlInfo {
            id,
            name: format!("mock control {id:#x}"),
            minimum: c.minimum,
            maximum: c.maximum,
            step: 1,
            default_value: c.default_value,
        }))
    }

    fn get_control(&self, id: u32) -> io::Result<i32> {
        self.lock()
            .controls
            .get(&id)
            .map(|c| c.value)
            .ok_or_else(|| errno(libc::EINVAL))
    }

    fn set_control(&self, id: u32, value: i32) -> io::Result<()> {
        let mut state = self.lock();
        if let Some(code) = state.fail_set_control.take() {
            return Err(errno(code));
        }
        let control = state.controls.get_mut(&id).ok_or_else(|| errno(libc::EINVAL))?;
        if value < control.minimum || value > control.maximum {
            return Err(errno(libc::ERANGE));
        }
        control.value = value;
        Ok(())
    }

    fn xu_query(&self, unit: u8, selector: u8, query: u8, data: &mut [u8]) -> io::Result<()> {
        let mut state = self.lock();
        match query {
            UVC_SET_CUR => {
                state.xu_writes.push((unit, selector, data.to_vec()));
                Ok(())
            }
            UVC_GET_CUR => {
                if state.firmware.is_empty() {
                    return Err(errno(libc::ENOENT));
                }
                let n = data.len().min(state.firmware.len());
                data[..n].copy_from_slice(&state.firmware[..n]);
                Ok(())
            }
            _ => Err(errno(libc::EINVAL)),
        }
    }

    fn usb_ids(&self) -> Option<(u16, u16)> {
        self.lock().usb_ids
    }
}

impl Drop for MockDriver {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(|poisoned| poisoned.into_inner());
        for (_, (address, len)) in state.mappings.drain() {
            free_mapping(address, len);
        }
    }
}
