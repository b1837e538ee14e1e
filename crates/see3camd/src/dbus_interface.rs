use crate::engine::CaptureStats;
use see3cam_hw::{CameraError, Control, Controls, V4l2Driver};
use serde::Serialize;
use std::sync::Arc;
use zbus::interface;

/// Static facts about the open camera, reported by `Status`.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceSummary {
    pub device: String,
    pub format: String,
    pub fps: u32,
    pub stereo: bool,
    pub firmware: Option<String>,
    pub frame_id: String,
}

/// D-Bus interface for the see3cam capture daemon.
///
/// Bus name: io.github.see3cam.Camera1
/// Object path: /io/github/see3cam/Camera1
pub struct CameraService {
    controls: Controls<V4l2Driver>,
    stats: Arc<CaptureStats>,
    summary: DeviceSummary,
}

impl CameraService {
    pub fn new(controls: Controls<V4l2Driver>, stats: Arc<CaptureStats>, summary: DeviceSummary) -> Self {
        Self {
            controls,
            stats,
            summary,
        }
    }

    /// Control ioctls block briefly; keep them off the async executor.
    async fn set(&self, control: Control, value: f64) -> zbus::fdo::Result<()> {
        let value = control_value(value)?;
        let controls = self.controls.clone();
        tokio::task::spawn_blocking(move || controls.set(control, value))
            .await
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?
            .map_err(to_fdo)?;
        tracing::info!(control = control.name(), value, "control updated over D-Bus");
        Ok(())
    }

    async fn get(&self, control: Control) -> zbus::fdo::Result<f64> {
        let controls = self.controls.clone();
        let value = tokio::task::spawn_blocking(move || controls.get(control))
            .await
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?
            .map_err(to_fdo)?;
        Ok(f64::from(value))
    }
}

#[interface(name = "io.github.see3cam.Camera1")]
impl CameraService {
    /// Set the absolute exposure time (driver units).
    async fn set_exposure(&self, value: f64) -> zbus::fdo::Result<()> {
        self.set(Control::ExposureAbsolute, value).await
    }

    async fn set_brightness(&self, value: f64) -> zbus::fdo::Result<()> {
        self.set(Control::Brightness, value).await
    }

    /// Current exposure as read back from the device.
    async fn exposure(&self) -> zbus::fdo::Result<f64> {
        self.get(Control::ExposureAbsolute).await
    }

    async fn brightness(&self) -> zbus::fdo::Result<f64> {
        self.get(Control::Brightness).await
    }

    /// Return daemon status information.
    async fn status(&self) -> zbus::fdo::Result<String> {
        Ok(status_json(&self.summary, &self.stats, self.controls.sync_mode().map(|m| m.as_str())))
    }
}

/// D-Bus carries doubles; controls take integers.
fn control_value(value: f64) -> zbus::fdo::Result<i32> {
    let rounded = value.round();
    if !rounded.is_finite() || rounded < f64::from(i32::MIN) || rounded > f64::from(i32::MAX) {
        return Err(zbus::fdo::Error::InvalidArgs(format!(
            "{value} is not a valid control value"
        )));
    }
    Ok(rounded as i32)
}

fn to_fdo(err: CameraError) -> zbus::fdo::Error {
    match err {
        CameraError::ControlUnsupported(_) => zbus::fdo::Error::NotSupported(err.to_string()),
        CameraError::ControlRange { .. } => zbus::fdo::Error::InvalidArgs(err.to_string()),
        CameraError::Io { .. } => zbus::fdo::Error::IOError(err.to_string()),
        _ => zbus::fdo::Error::Failed(err.to_string()),
    }
}

fn status_json(summary: &DeviceSummary, stats: &CaptureStats, sync_mode: Option<&str>) -> String {
    serde_json::json!({
        "version": env!("CARGO_PKG_VERSION"),
        "camera": summary,
        "sync_mode": sync_mode,
        "capture": stats.snapshot(),
    })
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_value_conversion() {
        assert_eq!(control_value(80.0).unwrap(), 80);
        assert_eq!(control_value(15.6).unwrap(), 16);
        assert_eq!(control_value(-3.2).unwrap(), -3);
        assert!(control_value(f64::NAN).is_err());
        assert!(control_value(1e12).is_err());
    }

    #[test]
    fn test_error_mapping() {
        let unsupported = to_fdo(CameraError::ControlUnsupported("gamma".into()));
        assert!(matches!(unsupported, zbus::fdo::Error::NotSupported(_)));
        let range = to_fdo(CameraError::ControlRange {
            control: "brightness".into(),
            value: 99,
            minimum: 0,
            maximum: 15,
        });
        assert!(matches!(range, zbus::fdo::Error::InvalidArgs(_)));
    }

    #[test]
    fn test_status_json_shape() {
        let summary = DeviceSummary {
            device: "/dev/video0".into(),
            format: "GRBG 640x480".into(),
            fps: 10,
            stereo: true,
            firmware: Some("1.4.9.2".into()),
            frame_id: "camera".into(),
        };
        let stats = CaptureStats::default();
        let json: serde_json::Value =
            serde_json::from_str(&status_json(&summary, &stats, Some("master"))).unwrap();
        assert_eq!(json["camera"]["device"], "/dev/video0");
        assert_eq!(json["camera"]["stereo"], true);
        assert_eq!(json["sync_mode"], "master");
        assert_eq!(json["capture"]["delivered"], 0);
        assert_eq!(json["capture"]["running"], false);
    }
}
