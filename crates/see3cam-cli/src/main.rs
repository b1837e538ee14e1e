use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use see3cam_hw::{
    Camera, CameraConfig, CameraError, CaptureMode, Control, GrabPolicy, MotionThresholds, SyncMode,
};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Parser)]
#[command(name = "see3cam", about = "see3cam UVC stereo camera tool")]
struct Cli {
    /// V4L2 device node
    #[arg(short, long, global = true, default_value = "/dev/video0")]
    device: String,

    /// Capture mode: rgb, mjpg, yuyv, bayer or y16
    #[arg(short, long, global = true, default_value = "y16")]
    mode: CaptureMode,

    #[arg(long, global = true, default_value_t = 752)]
    width: u32,

    #[arg(long, global = true, default_value_t = 480)]
    height: u32,

    #[arg(long, global = true, default_value_t = 30)]
    fps: u32,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List video capture devices
    List {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
        /// Only show cameras known to be stereo
        #[arg(long)]
        stereo_only: bool,
    },
    /// Show negotiated format and firmware version
    Info,
    /// List every control the device answers for
    Controls,
    /// Read one control (name, or numeric id in any namespace)
    Get { control: Control },
    /// Write one control
    Set {
        control: Control,
        #[arg(allow_hyphen_values = true)]
        value: i32,
    },
    /// Set the stereo sync role of this unit
    Sync { mode: SyncMode },
    /// Grab frames and write their raw bytes to disk
    Capture {
        #[arg(short = 'n', long, default_value_t = 1)]
        count: usize,
        /// Split each frame into left/right halves
        #[arg(long)]
        stereo: bool,
        #[arg(short, long, default_value = ".")]
        out: PathBuf,
        /// Give up on a frame after this many milliseconds
        #[arg(long, default_value_t = 2000)]
        timeout_ms: u64,
        /// Skip YUYV frames with fewer changed pixels than this
        #[arg(long)]
        motion_count: Option<usize>,
        /// Luma change that marks a pixel as changed
        #[arg(long, default_value_t = 100)]
        motion_luminance: u8,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match &cli.command {
        &Commands::List { json, stereo_only } => list(json, stereo_only),
        Commands::Info => info(&open(&cli)?),
        Commands::Controls => controls(&open(&cli)?),
        &Commands::Get { control } => {
            let camera = open(&cli)?;
            let value = camera.controls().get(control)?;
            println!("{control} = {value}");
            Ok(())
        }
        &Commands::Set { control, value } => {
            let camera = open(&cli)?;
            camera.controls().set(control, value)?;
            println!("{control} set to {value}");
            Ok(())
        }
        &Commands::Sync { mode } => {
            let camera = open(&cli)?;
            let controls = camera.controls();
            match mode {
                SyncMode::Master => controls.enable_master_mode()?,
                SyncMode::Trigger => controls.enable_trigger_mode()?,
            }
            println!("{}: {} mode", camera.device_path(), mode.as_str());
            Ok(())
        }
        Commands::Capture {
            count,
            stereo,
            out,
            timeout_ms,
            motion_count,
            motion_luminance,
        } => {
            let mut camera = open(&cli)?;
            camera.set_grab_policy(GrabPolicy::Timeout(Duration::from_millis(*timeout_ms)));
            camera.set_motion_thresholds(motion_count.map(|count| MotionThresholds {
                luminance: *motion_luminance,
                count,
            }))?;
            capture(&mut camera, *count, *stereo, out)
        }
    }
}

fn open(cli: &Cli) -> Result<Camera> {
    let config = CameraConfig {
        mode: cli.mode,
        width: cli.width,
        height: cli.height,
        fps: cli.fps,
        grab_policy: GrabPolicy::Blocking,
    };
    Camera::open(&cli.device, config).with_context(|| format!("opening {}", cli.device))
}

fn list(json: bool, stereo_only: bool) -> Result<()> {
    let devices: Vec<_> = see3cam_hw::enumerate()
        .into_iter()
        .filter(|d| !stereo_only || d.is_stereo())
        .collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&devices)?);
        return Ok(());
    }

    if devices.is_empty() {
        println!("No video capture devices found");
        return Ok(());
    }
    for d in &devices {
        println!(
            "{:>2}  {:<14} {:<9} {}{}  ({}, {})",
            d.index,
            d.path,
            d.usb_id(),
            d.name,
            if d.is_stereo() { " [stereo]" } else { "" },
            d.driver,
            d.bus_info,
        );
    }
    Ok(())
}

fn info(camera: &Camera) -> Result<()> {
    let caps = camera.caps();
    println!("device:   {}", camera.device_path());
    println!("card:     {}", caps.card);
    println!("driver:   {}", caps.driver);
    println!("bus:      {}", caps.bus_info);
    println!("format:   {} @ {} fps", camera.format(), camera.fps());
    println!("stereo:   {}", if camera.is_stereo() { "yes" } else { "no" });
    match camera.firmware_version() {
        Ok(version) => println!("firmware: {version}"),
        Err(CameraError::ControlUnsupported(_)) => println!("firmware: unknown (no extension unit)"),
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

fn controls(camera: &Camera) -> Result<()> {
    let controls = camera.controls();
    let mut found = 0;
    for control in Control::all() {
        let resolved = match controls.resolve(control) {
            Ok(resolved) => resolved,
            Err(CameraError::ControlUnsupported(_)) => continue,
            Err(e) => return Err(e.into()),
        };
        found += 1;
        let current = controls
            .get(control)
            .map_or_else(|e| format!("<{e}>"), |v| v.to_string());
        println!(
            "{:<26} {:<8} {:#010x}  [{}..{}] default {:<6} current {}",
            control.name(),
            resolved.namespace.as_str(),
            resolved.id,
            resolved.info.minimum,
            resolved.info.maximum,
            resolved.info.default_value,
            current,
        );
    }
    if found == 0 {
        println!("No known controls on {}", camera.device_path());
    }
    Ok(())
}

fn capture(camera: &mut Camera, count: usize, stereo: bool, out: &Path) -> Result<()> {
    if count == 0 {
        bail!("--count must be at least 1");
    }
    std::fs::create_dir_all(out).with_context(|| format!("creating {}", out.display()))?;

    camera.start_streaming()?;
    let mut written = 0;
    while written < count {
        if stereo {
            let grabbed = match camera.grab_stereo(false) {
                Ok(grabbed) => grabbed,
                Err(CameraError::MalformedFrame(reason)) => {
                    tracing::warn!(reason = %reason, "skipping frame");
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            camera.release(grabbed.buffer.index)?;
            let seq = grabbed.buffer.sequence;
            write_raw(out, &format!("frame_{seq:06}_left.raw"), &grabbed.frame.left)?;
            write_raw(out, &format!("frame_{seq:06}_right.raw"), &grabbed.frame.right)?;
        } else {
            let grabbed = camera.grab()?;
            let seq = grabbed.sequence;
            let result = camera
                .buffer(&grabbed)
                .map_err(anyhow::Error::from)
                .and_then(|data| write_raw(out, &format!("frame_{seq:06}.raw"), data));
            camera.release(grabbed.index)?;
            result?;
        }
        written += 1;
    }
    camera.stop_streaming()?;

    println!(
        "wrote {written} {} frame(s) ({}) to {}",
        if stereo { "stereo" } else { "raw" },
        camera.format(),
        out.display()
    );
    Ok(())
}

fn write_raw(dir: &Path, name: &str, data: &[u8]) -> Result<()> {
    let path = dir.join(name);
    std::fs::write(&path, data).with_context(|| format!("writing {}", path.display()))?;
    tracing::debug!(path = %path.display(), bytes = data.len(), "frame written");
    Ok(())
}
