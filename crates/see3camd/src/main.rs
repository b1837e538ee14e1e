use anyhow::{Context, Result};
use see3cam_hw::Camera;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;

use config::Config;
use dbus_interface::{CameraService, DeviceSummary};
use engine::{CaptureOptions, StatsSink};

const BUS_NAME: &str = "io.github.see3cam.Camera1";
const OBJECT_PATH: &str = "/io/github/see3cam/Camera1";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = Config::from_env();
    tracing::info!(device = %config.camera_device, "see3camd starting");

    // Fail fast: no camera, no daemon.
    let mut camera = Camera::open(&config.camera_device, config.camera_config())
        .with_context(|| format!("opening {}", config.camera_device))?;
    let controls = camera.controls();

    let firmware = match controls.firmware_version() {
        Ok(version) => {
            tracing::info!(%version, stereo = version.stereo, "firmware version");
            Some(version.to_string())
        }
        Err(e) => {
            tracing::debug!(error = %e, "firmware version unavailable");
            None
        }
    };

    engine::apply_initial_controls(&controls, config.exposure, config.brightness);
    engine::apply_sync_mode(&controls, config.sync_mode).context("setting sync mode")?;

    if let Err(e) = camera.set_motion_thresholds(config.motion) {
        tracing::warn!(error = %e, "motion gate not enabled");
    }

    if config.stereo && !camera.is_stereo() {
        tracing::warn!(
            device = %config.camera_device,
            "stereo splitting requested for a device not listed as stereo"
        );
    }

    let summary = DeviceSummary {
        device: config.camera_device.clone(),
        format: camera.format().to_string(),
        fps: camera.fps(),
        stereo: config.stereo,
        firmware,
        frame_id: config.frame_id.clone(),
    };

    let handle = engine::spawn_capture(
        camera,
        CaptureOptions::from(&config),
        StatsSink::new(Duration::from_secs(5)),
    )?;

    let service = CameraService::new(handle.controls(), handle.stats(), summary);
    let _conn = zbus::connection::Builder::session()?
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await
        .context("registering on the session bus")?;

    tracing::info!(bus = BUS_NAME, "see3camd ready");

    // Keep running until signaled or the capture thread dies.
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal?;
                tracing::info!("see3camd shutting down");
                break;
            }
            _ = ticker.tick() => {
                if !handle.is_running() {
                    tracing::error!("capture thread stopped");
                    break;
                }
            }
        }
    }

    tokio::task::spawn_blocking(move || handle.shutdown())
        .await
        .context("joining capture thread")??;
    Ok(())
}
