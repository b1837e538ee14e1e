use crate::config::Config;
use see3cam_hw::{Camera, CameraError, Control, Controls, Driver, SyncMode};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("camera error: {0}")]
    Camera(#[from] CameraError),
    #[error("failed to spawn capture thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("capture thread panicked")]
    ThreadPanicked,
}

/// Pixel data of one delivered frame, borrowed for the duration of the call.
pub enum Payload<'a> {
    Mono(&'a [u8]),
    Stereo { left: &'a [u8], right: &'a [u8] },
}

impl Payload<'_> {
    pub fn len(&self) -> usize {
        match self {
            Self::Mono(data) => data.len(),
            Self::Stereo { left, right } => left.len() + right.len(),
        }
    }
}

/// One frame handed to a [`FrameSink`].
pub struct FrameEvent<'a> {
    pub frame_id: &'a str,
    /// Count of frames delivered to the sink so far.
    pub seq: u64,
    pub driver_sequence: u32,
    pub timestamp: Duration,
    pub width: u32,
    pub height: u32,
    pub payload: Payload<'a>,
}

/// Consumer of captured frames; runs on the capture thread.
pub trait FrameSink: Send {
    fn on_frame(&mut self, frame: &FrameEvent<'_>);
}

/// Logs frame rate and payload size at a fixed interval.
pub struct StatsSink {
    interval: Duration,
    window_start: Instant,
    frames: u64,
    bytes: u64,
}

impl StatsSink {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            window_start: Instant::now(),
            frames: 0,
            bytes: 0,
        }
    }
}

impl FrameSink for StatsSink {
    fn on_frame(&mut self, frame: &FrameEvent<'_>) {
        if frame.seq == 0 {
            tracing::info!(
                frame_id = frame.frame_id,
                width = frame.width,
                height = frame.height,
                bytes = frame.payload.len(),
                "first frame delivered"
            );
        }
        self.frames += 1;
        self.bytes += frame.payload.len() as u64;

        let elapsed = self.window_start.elapsed();
        if elapsed >= self.interval {
            let rate = self.frames as f64 / elapsed.as_secs_f64();
            tracing::info!(
                frame_id = frame.frame_id,
                seq = frame.seq,
                driver_sequence = frame.driver_sequence,
                timestamp = ?frame.timestamp,
                fps = format_args!("{rate:.1}"),
                avg_bytes = self.bytes / self.frames.max(1),
                "capture stats"
            );
            self.window_start = Instant::now();
            self.frames = 0;
            self.bytes = 0;
        }
    }
}

/// Delivers every (skip + 1)th frame, starting with the first.
#[derive(Debug, Clone)]
pub struct Decimator {
    skip: u32,
    remaining: u32,
}

impl Decimator {
    pub fn new(skip: u32) -> Self {
        Self { skip, remaining: 0 }
    }

    pub fn admit(&mut self) -> bool {
        if self.remaining == 0 {
            self.remaining = self.skip;
            true
        } else {
            self.remaining -= 1;
            false
        }
    }
}

/// Counters shared between the capture thread and status queries.
#[derive(Debug, Default)]
pub struct CaptureStats {
    grabbed: AtomicU64,
    delivered: AtomicU64,
    timeouts: AtomicU64,
    malformed: AtomicU64,
    last_sequence: AtomicU64,
    running: AtomicBool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub grabbed: u64,
    pub delivered: u64,
    pub timeouts: u64,
    pub malformed: u64,
    pub last_sequence: u64,
    pub running: bool,
}

impl CaptureStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            grabbed: self.grabbed.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            last_sequence: self.last_sequence.load(Ordering::Relaxed),
            running: self.running.load(Ordering::Relaxed),
        }
    }
}

/// Capture loop settings taken from [`Config`].
#[derive(Debug, Clone)]
pub struct CaptureOptions {
    pub frame_id: String,
    pub stereo: bool,
    pub skip_frames: u32,
}

impl From<&Config> for CaptureOptions {
    fn from(config: &Config) -> Self {
        Self {
            frame_id: config.frame_id.clone(),
            stereo: config.stereo,
            skip_frames: config.skip_frames,
        }
    }
}

/// Switch to manual exposure and apply the configured exposure and brightness.
///
/// Each control is applied independently; failures are logged and skipped.
pub fn apply_initial_controls<D: Driver>(controls: &Controls<D>, exposure: i32, brightness: i32) {
    // 1 = manual exposure
    let settings = [
        (Control::ExposureAuto, 1),
        (Control::Brightness, brightness),
        (Control::ExposureAbsolute, exposure),
    ];
    for (control, value) in settings {
        match controls.set(control, value) {
            Ok(()) => tracing::info!(control = control.name(), value, "initial control applied"),
            Err(e) => tracing::warn!(control = control.name(), value, error = %e, "initial control not applied"),
        }
    }
}

/// Issue the configured stereo sync role. Must run before streaming starts.
pub fn apply_sync_mode<D: Driver>(controls: &Controls<D>, mode: Option<SyncMode>) -> Result<(), EngineError> {
    match mode {
        Some(SyncMode::Master) => controls.enable_master_mode()?,
        Some(SyncMode::Trigger) => controls.enable_trigger_mode()?,
        None => {}
    }
    Ok(())
}

/// Handle to the running capture thread.
pub struct CaptureHandle<D: Driver> {
    controls: Controls<D>,
    stats: Arc<CaptureStats>,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<Result<(), EngineError>>>,
}

impl<D: Driver> CaptureHandle<D> {
    /// Control handle usable while the capture thread is blocked in a grab.
    pub fn controls(&self) -> Controls<D> {
        self.controls.clone()
    }

    pub fn stats(&self) -> Arc<CaptureStats> {
        Arc::clone(&self.stats)
    }

    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Stop the loop, wait for the thread and return how it ended.
    pub fn shutdown(mut self) -> Result<(), EngineError> {
        self.stop_and_join()
    }

    fn stop_and_join(&mut self) -> Result<(), EngineError> {
        self.stop.store(true, Ordering::Release);
        match self.thread.take() {
            Some(thread) => thread.join().map_err(|_| EngineError::ThreadPanicked)?,
            None => Ok(()),
        }
    }
}

impl<D: Driver> Drop for CaptureHandle<D> {
    fn drop(&mut self) {
        if let Err(e) = self.stop_and_join() {
            tracing::warn!(error = %e, "capture thread ended with error");
        }
    }
}

/// Start streaming and run the capture loop on a dedicated OS thread.
///
/// Streaming is switched on before this returns, so a device that cannot
/// stream fails here rather than on the thread. The camera is closed when
/// the loop ends.
pub fn spawn_capture<D, S>(
    mut camera: Camera<D>,
    options: CaptureOptions,
    mut sink: S,
) -> Result<CaptureHandle<D>, EngineError>
where
    D: Driver + 'static,
    S: FrameSink + 'static,
{
    camera.start_streaming()?;
    tracing::info!(
        device = camera.device_path(),
        format = %camera.format(),
        fps = camera.fps(),
        stereo = options.stereo,
        "streaming started"
    );

    let controls = camera.controls();
    let stats = Arc::new(CaptureStats::default());
    let stop = Arc::new(AtomicBool::new(false));

    let thread_stats = Arc::clone(&stats);
    let thread_stop = Arc::clone(&stop);
    let thread = std::thread::Builder::new()
        .name("see3cam-capture".into())
        .spawn(move || {
            thread_stats.running.store(true, Ordering::Relaxed);
            tracing::info!("capture thread started");
            let result = run_capture(&mut camera, &options, &mut sink, &thread_stats, &thread_stop);
            if let Err(e) = camera.close() {
                tracing::warn!(error = %e, "error closing camera");
            }
            thread_stats.running.store(false, Ordering::Relaxed);
            tracing::info!("capture thread exiting");
            result
        })
        .map_err(EngineError::Spawn)?;

    Ok(CaptureHandle {
        controls,
        stats,
        stop,
        thread: Some(thread),
    })
}

fn run_capture<D: Driver, S: FrameSink>(
    camera: &mut Camera<D>,
    options: &CaptureOptions,
    sink: &mut S,
    stats: &CaptureStats,
    stop: &AtomicBool,
) -> Result<(), EngineError> {
    let mut decimator = Decimator::new(options.skip_frames);
    let mut seq = 0u64;
    let (width, height) = (camera.width(), camera.height());

    while !stop.load(Ordering::Acquire) {
        let grabbed = if options.stereo {
            camera.grab_stereo(false).map(|g| (g.buffer, Some(g.frame)))
        } else {
            camera.grab().map(|b| (b, None))
        };

        let (buffer, stereo) = match grabbed {
            Ok(grabbed) => grabbed,
            Err(CameraError::Timeout(after)) => {
                stats.timeouts.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(?after, "no frame within grab timeout");
                continue;
            }
            Err(CameraError::MalformedFrame(reason)) => {
                stats.malformed.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(reason = %reason, "dropping malformed frame");
                continue;
            }
            Err(e) if e.is_fatal() => {
                tracing::error!(error = %e, "capture failed");
                return Err(e.into());
            }
            Err(e) => {
                tracing::warn!(error = %e, "grab failed; retrying");
                continue;
            }
        };

        stats.grabbed.fetch_add(1, Ordering::Relaxed);
        stats
            .last_sequence
            .store(u64::from(buffer.sequence), Ordering::Relaxed);

        if decimator.admit() {
            let payload = match &stereo {
                Some(frame) => Payload::Stereo {
                    left: &frame.left,
                    right: &frame.right,
                },
                None => Payload::Mono(camera.buffer(&buffer)?),
            };
            sink.on_frame(&FrameEvent {
                frame_id: &options.frame_id,
                seq,
                driver_sequence: buffer.sequence,
                timestamp: buffer.timestamp,
                width,
                height,
                payload,
            });
            seq += 1;
            stats.delivered.fetch_add(1, Ordering::Relaxed);
        }

        camera.release(buffer.index)?;
    }

    camera.stop_streaming()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use see3cam_hw::mock::MockDriver;
    use see3cam_hw::{CameraConfig, CaptureMode, GrabPolicy};
    use std::sync::Mutex;

    /// Records what it was given.
    #[derive(Clone, Default)]
    struct RecordingSink {
        frames: Arc<Mutex<Vec<(u64, u32, usize, bool)>>>,
    }

    impl FrameSink for RecordingSink {
        fn on_frame(&mut self, frame: &FrameEvent<'_>) {
            let stereo = matches!(frame.payload, Payload::Stereo { .. });
            self.frames
                .lock()
                .unwrap()
                .push((frame.seq, frame.driver_sequence, frame.payload.len(), stereo));
        }
    }

    fn mock_camera(mock: &Arc<MockDriver>) -> Camera<Arc<MockDriver>> {
        let config = CameraConfig {
            mode: CaptureMode::Y16,
            width: 8,
            height: 2,
            fps: 30,
            grab_policy: GrabPolicy::Timeout(Duration::from_millis(20)),
        };
        Camera::with_driver(Arc::clone(mock), "/dev/video-mock", config).unwrap()
    }

    fn options(stereo: bool, skip_frames: u32) -> CaptureOptions {
        CaptureOptions {
            frame_id: "camera".into(),
            stereo,
            skip_frames,
        }
    }

    fn wait_for_frames(sink: &RecordingSink, count: usize) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while sink.frames.lock().unwrap().len() < count {
            assert!(Instant::now() < deadline, "capture loop stalled");
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_decimator() {
        let mut every = Decimator::new(0);
        assert!((0..5).all(|_| every.admit()));

        let mut third = Decimator::new(2);
        let admitted: Vec<bool> = (0..7).map(|_| third.admit()).collect();
        assert_eq!(admitted, [true, false, false, true, false, false, true]);
    }

    #[test]
    fn test_capture_loop_delivers_and_shuts_down() {
        let mock = Arc::new(MockDriver::new().with_frame_delay(Duration::from_millis(1)));
        let sink = RecordingSink::default();
        let handle = spawn_capture(mock_camera(&mock), options(false, 0), sink.clone()).unwrap();

        wait_for_frames(&sink, 5);
        assert!(handle.is_running());
        let stats = handle.stats();
        handle.shutdown().unwrap();

        let frames = sink.frames.lock().unwrap();
        for (i, &(seq, _, len, stereo)) in frames.iter().enumerate() {
            assert_eq!(seq, i as u64);
            assert_eq!(len, 32);
            assert!(!stereo);
        }
        let snapshot = stats.snapshot();
        assert!(!snapshot.running);
        assert_eq!(snapshot.delivered, frames.len() as u64);
        assert_eq!(mock.live_mappings(), 0);
        assert!(!mock.is_streaming());
    }

    #[test]
    fn test_shutdown_releases_device_held_by_controls() {
        let mock = Arc::new(MockDriver::new().with_frame_delay(Duration::from_millis(1)));
        let sink = RecordingSink::default();
        let handle = spawn_capture(mock_camera(&mock), options(false, 0), sink.clone()).unwrap();
        // The D-Bus service keeps a handle like this for the process lifetime.
        let controls = handle.controls();
        wait_for_frames(&sink, 1);
        handle.shutdown().unwrap();

        assert!(controls.is_closed());
        assert_eq!(Arc::strong_count(&mock), 1);
    }

    #[test]
    fn test_skip_frames_decimates() {
        let mock = Arc::new(MockDriver::new().with_frame_delay(Duration::from_millis(1)));
        let sink = RecordingSink::default();
        let handle = spawn_capture(mock_camera(&mock), options(false, 2), sink.clone()).unwrap();
        wait_for_frames(&sink, 3);
        handle.shutdown().unwrap();

        let frames = sink.frames.lock().unwrap();
        let driver_seqs: Vec<u32> = frames.iter().take(3).map(|f| f.1).collect();
        assert_eq!(driver_seqs, [0, 3, 6]);
    }

    #[test]
    fn test_stereo_loop_splits_and_skips_malformed() {
        let mock = Arc::new(MockDriver::new().with_frame_delay(Duration::from_millis(1)));
        mock.push_frame(vec![0u8; 31]);
        let sink = RecordingSink::default();
        let handle = spawn_capture(mock_camera(&mock), options(true, 0), sink.clone()).unwrap();
        wait_for_frames(&sink, 2);
        let stats = handle.stats();
        handle.shutdown().unwrap();

        let frames = sink.frames.lock().unwrap();
        assert!(frames.iter().all(|f| f.3 && f.2 == 32));
        assert_eq!(frames[0].1, 1);
        assert_eq!(stats.snapshot().malformed, 1);
    }

    #[test]
    fn test_stall_counts_timeouts_without_stopping() {
        let mock = Arc::new(MockDriver::new());
        mock.set_stalled(true);
        let sink = RecordingSink::default();
        let handle = spawn_capture(mock_camera(&mock), options(false, 0), sink.clone()).unwrap();
        let stats = handle.stats();

        let deadline = Instant::now() + Duration::from_secs(5);
        while stats.snapshot().timeouts < 2 {
            assert!(Instant::now() < deadline, "no timeouts recorded");
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(handle.is_running());
        mock.set_stalled(false);
        wait_for_frames(&sink, 1);
        handle.shutdown().unwrap();
    }

    #[test]
    fn test_fatal_error_ends_loop() {
        let mock = Arc::new(MockDriver::new());
        let sink = RecordingSink::default();
        mock.fail_next_dequeue(libc::EIO);
        let handle = spawn_capture(mock_camera(&mock), options(false, 0), sink).unwrap();
        let err = handle.shutdown().unwrap_err();
        assert!(matches!(err, EngineError::Camera(CameraError::Io { .. })));
        assert_eq!(mock.live_mappings(), 0);
    }

    #[test]
    fn test_initial_controls_apply_independently() {
        // Brightness is missing on this device; the other two still apply.
        let mock = Arc::new(
            MockDriver::new()
                .with_control(0x009A_0901, 0, 3, 3)
                .with_control(0x009A_0902, 1, 10_000, 200),
        );
        let camera = mock_camera(&mock);
        apply_initial_controls(&camera.controls(), 80, 4);
        assert_eq!(mock.control_value(0x009A_0901), Some(1));
        assert_eq!(mock.control_value(0x009A_0902), Some(80));
    }

    #[test]
    fn test_sync_mode_applied_once() {
        let mock = Arc::new(MockDriver::new());
        let camera = mock_camera(&mock);
        let controls = camera.controls();
        apply_sync_mode(&controls, Some(SyncMode::Master)).unwrap();
        apply_sync_mode(&controls, None).unwrap();
        assert_eq!(mock.xu_writes().len(), 1);
        assert_eq!(controls.sync_mode(), Some(SyncMode::Master));
    }
}
