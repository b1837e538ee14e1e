//! Capture session: format negotiation, streaming state and grab/release.

use crate::buffer::{BufferPool, SlotState, BUFFER_COUNT};
use crate::controls::{Controls, Shared};
use crate::driver::{DeviceCaps, Dequeued, Driver, Format, V4l2Driver};
use crate::error::{CameraError, Result};
use crate::frame::{self, GrabbedBuffer, MotionGate, MotionThresholds, StereoGrab};
use crate::quirks::lookup_quirk;
use crate::xu::FirmwareVersion;
use std::str::FromStr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Capture mode requested at open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureMode {
    /// 24-bit RGB (`RGB3`), for devices that deliver it natively. Most
    /// uvcvideo sensors only offer YUYV or MJPG.
    Rgb,
    /// Motion JPEG, one compressed image per buffer.
    Mjpg,
    /// YUYV 4:2:2 packed.
    Yuyv,
    /// 8-bit Bayer, GRBG order.
    Bayer,
    /// 16-bit little-endian grayscale; stereo cameras pack both eyes here.
    Y16,
}

impl CaptureMode {
    pub fn fourcc(self) -> [u8; 4] {
        match self {
            Self::Rgb => *b"RGB3",
            Self::Mjpg => *b"MJPG",
            Self::Yuyv => *b"YUYV",
            Self::Bayer => *b"GRBG",
            Self::Y16 => *b"Y16 ",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Rgb => "rgb",
            Self::Mjpg => "mjpg",
            Self::Yuyv => "yuyv",
            Self::Bayer => "bayer",
            Self::Y16 => "y16",
        }
    }
}

impl FromStr for CaptureMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, String> {
        match s.to_ascii_lowercase().as_str() {
            "rgb" => Ok(Self::Rgb),
            "mjpg" | "mjpeg" => Ok(Self::Mjpg),
            "yuyv" => Ok(Self::Yuyv),
            "bayer" => Ok(Self::Bayer),
            "y16" => Ok(Self::Y16),
            other => Err(format!(
                "unknown capture mode {other:?} (need rgb, mjpg, yuyv, bayer or y16)"
            )),
        }
    }
}

/// How [`Camera::grab`] waits for the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GrabPolicy {
    /// Wait as long as it takes.
    #[default]
    Blocking,
    /// Give up with [`CameraError::Timeout`] after this long.
    Timeout(Duration),
    /// Return [`CameraError::NoFramePending`] unless a frame is ready now.
    NonBlocking,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Idle,
    Streaming,
}

/// Construction-time parameters of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CameraConfig {
    pub mode: CaptureMode,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub grab_policy: GrabPolicy,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            mode: CaptureMode::Rgb,
            width: 640,
            height: 480,
            fps: 30,
            grab_policy: GrabPolicy::Blocking,
        }
    }
}

/// One open camera.
///
/// Grab, release and the streaming state need `&mut self`, so a single
/// capture thread owns the camera. Control changes go through
/// [`Camera::controls`] handles, which can be used from other threads
/// while a grab is blocked.
pub struct Camera<D: Driver = V4l2Driver> {
    shared: Arc<Shared<D>>,
    pool: BufferPool,
    config: CameraConfig,
    format: Format,
    fps: u32,
    caps: DeviceCaps,
    stereo: bool,
    state: StreamState,
    closed: bool,
    motion: Option<MotionGate>,
    suppressed: u64,
}

impl Camera<V4l2Driver> {
    /// Open a V4L2 camera by path (e.g., "/dev/video0").
    pub fn open(device_path: &str, config: CameraConfig) -> Result<Self> {
        let driver = V4l2Driver::open(device_path)?;
        Self::with_driver(driver, device_path, config)
    }
}

impl<D: Driver> Camera<D> {
    /// Negotiate `config` on `driver` and map the buffer pool.
    pub fn with_driver(driver: D, device_path: &str, config: CameraConfig) -> Result<Self> {
        let caps = driver
            .query_caps()
            .map_err(|source| CameraError::DeviceUnavailable {
                path: device_path.to_string(),
                source,
            })?;

        tracing::info!(
            device = device_path,
            driver = %caps.driver,
            card = %caps.card,
            "opened camera"
        );

        if !caps.video_capture {
            return Err(CameraError::CapabilityMissing {
                path: device_path.to_string(),
                missing: "video capture",
            });
        }
        if !caps.streaming {
            return Err(CameraError::CapabilityMissing {
                path: device_path.to_string(),
                missing: "streaming",
            });
        }

        let request = Format::request(config.mode.fourcc(), config.width, config.height);
        let negotiated = driver
            .set_format(&request)
            .map_err(|e| CameraError::FormatUnsupported {
                requested: request.to_string(),
                offered: format!("error: {e}"),
            })?;
        if negotiated.fourcc != request.fourcc
            || negotiated.width != request.width
            || negotiated.height != request.height
        {
            return Err(CameraError::FormatUnsupported {
                requested: request.to_string(),
                offered: negotiated.to_string(),
            });
        }

        let fps = match driver.set_frame_rate(config.fps) {
            Ok(fps) => {
                if fps != config.fps {
                    tracing::warn!(requested = config.fps, actual = fps, "driver adjusted frame rate");
                }
                fps
            }
            Err(e) => {
                tracing::warn!(requested = config.fps, error = %e, "frame rate not settable; keeping driver default");
                config.fps
            }
        };

        let quirk = driver.usb_ids().and_then(|(vid, pid)| lookup_quirk(vid, pid));
        let stereo = quirk.is_some_and(|q| q.device.stereo);

        let pool = BufferPool::allocate(&driver, BUFFER_COUNT)?;

        tracing::info!(
            device = device_path,
            mode = config.mode.as_str(),
            width = negotiated.width,
            height = negotiated.height,
            fps,
            stereo,
            "negotiated format"
        );

        Ok(Self {
            shared: Arc::new(Shared::new(driver, device_path, quirk)),
            pool,
            config,
            format: negotiated,
            fps,
            caps,
            stereo,
            state: StreamState::Idle,
            closed: false,
            motion: None,
            suppressed: 0,
        })
    }

    pub fn device_path(&self) -> &str {
        &self.shared.path
    }

    pub fn mode(&self) -> CaptureMode {
        self.config.mode
    }

    pub fn width(&self) -> u32 {
        self.format.width
    }

    pub fn height(&self) -> u32 {
        self.format.height
    }

    pub fn fps(&self) -> u32 {
        self.fps
    }

    /// The format the driver agreed to.
    pub fn format(&self) -> &Format {
        &self.format
    }

    pub fn caps(&self) -> &DeviceCaps {
        &self.caps
    }

    /// Whether the quirk database lists this device as a stereo camera.
    pub fn is_stereo(&self) -> bool {
        self.stereo
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn grab_policy(&self) -> GrabPolicy {
        self.config.grab_policy
    }

    pub fn set_grab_policy(&mut self, policy: GrabPolicy) {
        self.config.grab_policy = policy;
    }

    /// Drop grabbed frames whose luma barely changed since the previous grab.
    ///
    /// Only YUYV sessions can be gated; `None` turns the gate off. Dropped
    /// slots go straight back to the driver and the grab waits for the next
    /// frame under the same policy.
    pub fn set_motion_thresholds(&mut self, thresholds: Option<MotionThresholds>) -> Result<()> {
        self.motion = match thresholds {
            None => None,
            Some(_) if self.format.fourcc != *b"YUYV" => {
                return Err(CameraError::FormatUnsupported {
                    requested: "motion gate (YUYV)".to_string(),
                    offered: self.format.to_string(),
                });
            }
            Some(thresholds) => Some(MotionGate::new(thresholds)),
        };
        Ok(())
    }

    pub fn motion_thresholds(&self) -> Option<MotionThresholds> {
        self.motion.as_ref().map(MotionGate::thresholds)
    }

    /// Frames dropped by the motion gate since open.
    pub fn suppressed_frames(&self) -> u64 {
        self.suppressed
    }

    /// Ownership state of one buffer slot.
    pub fn slot_state(&self, index: u32) -> Option<SlotState> {
        self.pool.state(index)
    }

    /// A handle for changing controls, usable from any thread.
    pub fn controls(&self) -> Controls<D> {
        Controls::new(Arc::clone(&self.shared))
    }

    pub fn firmware_version(&self) -> Result<FirmwareVersion> {
        self.controls().firmware_version()
    }

    fn ensure_open(&self, operation: &'static str) -> Result<()> {
        if self.closed {
            return Err(CameraError::InvalidState {
                operation,
                state: "closed",
            });
        }
        Ok(())
    }

    fn ensure_streaming(&self, operation: &'static str) -> Result<()> {
        self.ensure_open(operation)?;
        if self.state != StreamState::Streaming {
            return Err(CameraError::InvalidState {
                operation,
                state: "idle",
            });
        }
        Ok(())
    }

    /// Queue every free slot and switch the stream on (Idle → Streaming).
    pub fn start_streaming(&mut self) -> Result<()> {
        self.ensure_open("start streaming")?;
        if self.state == StreamState::Streaming {
            return Ok(());
        }

        // Vendor commands check the streaming flag under this lock.
        let _plane = self.shared.plane();
        let pool = &mut self.pool;
        self.shared.with_driver("start streaming", |driver| {
            pool.queue_free(driver)?;
            driver
                .stream_on()
                .map_err(|e| CameraError::io("VIDIOC_STREAMON", e))
        })?;
        self.state = StreamState::Streaming;
        self.shared.streaming.store(true, Ordering::Release);
        tracing::debug!(device = %self.shared.path, "streaming on");
        Ok(())
    }

    /// Switch the stream off (Streaming → Idle).
    ///
    /// The driver drops every buffer on STREAMOFF, so all slots become free
    /// and handles from earlier grabs stop being readable.
    pub fn stop_streaming(&mut self) -> Result<()> {
        if self.state == StreamState::Idle {
            return Ok(());
        }

        let _plane = self.shared.plane();
        self.shared.with_driver("stop streaming", |driver| {
            driver
                .stream_off()
                .map_err(|e| CameraError::io("VIDIOC_STREAMOFF", e))
        })?;
        self.pool.reclaim_all();
        self.state = StreamState::Idle;
        self.shared.streaming.store(false, Ordering::Release);
        tracing::debug!(device = %self.shared.path, "streaming off");
        Ok(())
    }

    /// Wait for the driver to finish a buffer and take ownership of it.
    ///
    /// The returned slot stays owned by the application until
    /// [`Camera::release`] is called with its index.
    pub fn grab(&mut self) -> Result<GrabbedBuffer> {
        self.ensure_streaming("grab")?;
        let deadline = match self.config.grab_policy {
            GrabPolicy::Timeout(limit) => Some(Instant::now() + limit),
            _ => None,
        };

        loop {
            let grabbed = self.grab_once(deadline)?;
            if self.shows_motion(&grabbed) {
                return Ok(grabbed);
            }
            self.discard(grabbed.index, "no motion")?;
            self.suppressed += 1;
            tracing::trace!(index = grabbed.index, sequence = grabbed.sequence, "frame suppressed");
        }
    }

    fn grab_once(&mut self, deadline: Option<Instant>) -> Result<GrabbedBuffer> {
        if self.pool.count(SlotState::QueuedToKernel) == 0 {
            // Every slot is held by the application; nothing can complete.
            return Err(CameraError::NoFramePending);
        }

        let policy = self.config.grab_policy;
        let dequeued = self
            .shared
            .with_driver("grab", |driver| dequeue(driver, policy, deadline))?;
        self.pool.claim(dequeued.index).map_err(|_| {
            CameraError::io(
                "VIDIOC_DQBUF",
                std::io::Error::new(
                    std::io::ErrorKind::Other,
                    format!("driver returned buffer {} that was not queued", dequeued.index),
                ),
            )
        })?;

        let capacity = self.pool.capacity(dequeued.index).unwrap_or(0);
        if dequeued.bytes_used as usize > capacity {
            let reason = format!(
                "buffer {} reports {} bytes but holds {capacity}",
                dequeued.index, dequeued.bytes_used
            );
            self.discard(dequeued.index, &reason)?;
            return Err(CameraError::MalformedFrame(reason));
        }

        tracing::trace!(
            index = dequeued.index,
            bytes_used = dequeued.bytes_used,
            sequence = dequeued.sequence,
            "grabbed"
        );
        Ok(GrabbedBuffer {
            index: dequeued.index,
            bytes_used: dequeued.bytes_used,
            sequence: dequeued.sequence,
            timestamp: dequeued.timestamp,
        })
    }

    fn shows_motion(&mut self, grabbed: &GrabbedBuffer) -> bool {
        let Some(gate) = self.motion.as_mut() else {
            return true;
        };
        match self.pool.data(grabbed.index, grabbed.bytes_used as usize) {
            Ok(data) => gate.admit(data),
            Err(_) => true,
        }
    }

    /// Hand a slot the caller never sees back to the driver.
    ///
    /// If that fails the slot stays application-owned until streaming stops;
    /// `reason` is logged because the returned error replaces it.
    fn discard(&mut self, index: u32, reason: &str) -> Result<()> {
        let pool = &mut self.pool;
        self.shared
            .with_driver("release", |driver| pool.release(driver, index))
            .map_err(|e| {
                tracing::warn!(index, reason, error = %e, "could not re-queue dropped frame");
                e
            })
    }

    /// The mapped bytes of a grabbed buffer. No copy is made.
    pub fn buffer(&self, grabbed: &GrabbedBuffer) -> Result<&[u8]> {
        self.pool.data(grabbed.index, grabbed.bytes_used as usize)
    }

    /// Give a grabbed slot back to the driver.
    ///
    /// Fails with [`CameraError::InvalidBufferIndex`] if the slot is not
    /// currently owned by the application (e.g. released twice).
    pub fn release(&mut self, index: u32) -> Result<()> {
        self.ensure_streaming("release")?;
        let pool = &mut self.pool;
        self.shared
            .with_driver("release", |driver| pool.release(driver, index))?;
        tracing::trace!(index, "released");
        Ok(())
    }

    /// Grab a side-by-side stereo frame and copy out its halves.
    ///
    /// On success the slot is still owned by the application and must be
    /// released. A frame that cannot be split is re-queued before
    /// [`CameraError::MalformedFrame`] is returned.
    pub fn grab_stereo(&mut self, keep_concat: bool) -> Result<StereoGrab> {
        let grabbed = self.grab()?;
        let split = self
            .pool
            .data(grabbed.index, grabbed.bytes_used as usize)
            .and_then(|data| frame::split_stereo(data, keep_concat));

        match split {
            Ok(frame) => Ok(StereoGrab {
                buffer: grabbed,
                frame,
            }),
            Err(e) => {
                self.discard(grabbed.index, &e.to_string())?;
                tracing::debug!(index = grabbed.index, error = %e, "dropped unsplittable stereo frame");
                Err(e)
            }
        }
    }

    /// Stop streaming, unmap every slot and close the device.
    ///
    /// The device handle is released here even while [`Controls`] handles
    /// are still alive; they fail with `InvalidState` from then on. Safe to
    /// call more than once.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }

        let stopped = self.stop_streaming();
        if stopped.is_err() {
            // The driver drops its queue on close anyway.
            self.pool.reclaim_all();
            self.state = StreamState::Idle;
            self.shared.streaming.store(false, Ordering::Release);
        }
        let pool = &mut self.pool;
        let released = self
            .shared
            .with_driver("close", |driver| pool.deallocate(driver));

        self.closed = true;
        self.shared.close_driver();
        tracing::info!(device = %self.shared.path, "camera closed");

        stopped.and(released)
    }
}

fn dequeue(driver: &impl Driver, policy: GrabPolicy, deadline: Option<Instant>) -> Result<Dequeued> {
    loop {
        let wait = match policy {
            GrabPolicy::Blocking => None,
            GrabPolicy::NonBlocking => Some(Duration::ZERO),
            GrabPolicy::Timeout(_) => {
                Some(deadline.map_or(Duration::ZERO, |d| d.saturating_duration_since(Instant::now())))
            }
        };

        let ready = driver
            .wait_for_frame(wait)
            .map_err(|e| CameraError::io("poll", e))?;
        if !ready {
            match policy {
                GrabPolicy::Blocking => continue,
                GrabPolicy::NonBlocking => return Err(CameraError::NoFramePending),
                GrabPolicy::Timeout(limit) => return Err(CameraError::Timeout(limit)),
            }
        }

        match driver
            .dequeue_buffer()
            .map_err(|e| CameraError::io("VIDIOC_DQBUF", e))?
        {
            Some(dequeued) => return Ok(dequeued),
            None if policy == GrabPolicy::NonBlocking => return Err(CameraError::NoFramePending),
            None => continue,
        }
    }
}

impl<D: Driver> Drop for Camera<D> {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!(device = %self.shared.path, error = %e, "error closing camera");
        }
    }
}
