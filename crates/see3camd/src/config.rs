use see3cam_hw::{CameraConfig, CaptureMode, GrabPolicy, MotionThresholds, SyncMode};
use std::time::Duration;

/// Daemon configuration, loaded from environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// V4L2 device path (default: /dev/video0).
    pub camera_device: String,
    pub mode: CaptureMode,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// Deliver only every (skip_frames + 1)th frame to the sink.
    pub skip_frames: u32,
    /// Exposure applied at startup, after switching auto exposure off.
    pub exposure: i32,
    pub brightness: i32,
    /// Split every frame into left/right halves.
    pub stereo: bool,
    /// Stereo sync role to issue before streaming, if any.
    pub sync_mode: Option<SyncMode>,
    /// Upper bound on one grab; also how often the capture loop checks for shutdown.
    pub grab_timeout: Duration,
    /// Label attached to every delivered frame.
    pub frame_id: String,
    /// Drop still YUYV frames; set when SEE3CAM_MOTION_COUNT is given.
    pub motion: Option<MotionThresholds>,
}

impl Config {
    /// Load configuration from `SEE3CAM_*` environment variables with defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`Config::from_env`] with an arbitrary variable source.
    pub fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Self {
        let mode = var("SEE3CAM_MODE")
            .and_then(|v| match v.parse::<CaptureMode>() {
                Ok(mode) => Some(mode),
                Err(e) => {
                    tracing::warn!(error = %e, "ignoring SEE3CAM_MODE");
                    None
                }
            })
            .unwrap_or(CaptureMode::Bayer);

        let sync_mode = var("SEE3CAM_SYNC_MODE").and_then(|v| match v.trim() {
            "" | "none" => None,
            other => match other.parse::<SyncMode>() {
                Ok(mode) => Some(mode),
                Err(e) => {
                    tracing::warn!(error = %e, "ignoring SEE3CAM_SYNC_MODE");
                    None
                }
            },
        });

        Self {
            camera_device: var("SEE3CAM_DEVICE").unwrap_or_else(|| "/dev/video0".to_string()),
            mode,
            width: env_parse(&var, "SEE3CAM_WIDTH").unwrap_or(640),
            height: env_parse(&var, "SEE3CAM_HEIGHT").unwrap_or(480),
            fps: env_parse(&var, "SEE3CAM_FPS").unwrap_or(10),
            skip_frames: env_parse(&var, "SEE3CAM_SKIP_FRAMES").unwrap_or(0),
            exposure: env_parse(&var, "SEE3CAM_EXPOSURE").unwrap_or(80),
            brightness: env_parse(&var, "SEE3CAM_BRIGHTNESS").unwrap_or(4),
            stereo: var("SEE3CAM_STEREO").is_some_and(|v| v != "0"),
            sync_mode,
            grab_timeout: Duration::from_millis(env_parse(&var, "SEE3CAM_GRAB_TIMEOUT_MS").unwrap_or(1000)),
            frame_id: var("SEE3CAM_FRAME_ID").unwrap_or_else(|| "camera".to_string()),
            motion: env_parse(&var, "SEE3CAM_MOTION_COUNT").map(|count| MotionThresholds {
                luminance: env_parse(&var, "SEE3CAM_MOTION_LUMINANCE").unwrap_or(100),
                count,
            }),
        }
    }

    /// Parameters for opening the camera session.
    pub fn camera_config(&self) -> CameraConfig {
        CameraConfig {
            mode: self.mode,
            width: self.width,
            height: self.height,
            fps: self.fps,
            grab_policy: GrabPolicy::Timeout(self.grab_timeout),
        }
    }
}

fn env_parse<T: std::str::FromStr>(var: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    var(key).and_then(|v| v.trim().parse().ok())
}
