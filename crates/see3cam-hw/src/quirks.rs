//! Hardware quirks database.
//!
//! Maps camera USB VID:PID to the UVC extension unit parameters used for
//! firmware queries and stereo synchronisation. Quirk files are embedded at
//! compile time from `contrib/hw/*.toml`.

use serde::Deserialize;
use std::path::Path;
use std::sync::OnceLock;
use thiserror::Error;

/// See3CAM Tara stereo camera.
const QUIRK_2560_C114: &str = include_str!("../../../contrib/hw/2560-c114.toml");
/// See3CAM_10CUG mono camera.
const QUIRK_2560_C1D0: &str = include_str!("../../../contrib/hw/2560-c1d0.toml");

/// Default sysfs directory for video4linux nodes.
pub const SYSFS_VIDEO4LINUX: &str = "/sys/class/video4linux";

static QUIRK_DB: OnceLock<Vec<QuirkFile>> = OnceLock::new();

#[derive(Debug, Error)]
pub enum QuirkError {
    #[error("bad quirk TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("extension unit payload for {0} is empty")]
    EmptyPayload(&'static str),
}

/// Top-level quirk file structure (one per `contrib/hw/*.toml`).
#[derive(Debug, Clone, Deserialize)]
pub struct QuirkFile {
    pub device: DeviceInfo,
    pub extension_unit: ExtensionUnitInfo,
}

/// Camera identification fields from the `[device]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceInfo {
    pub vendor_id: u16,
    pub product_id: u16,
    pub name: String,
    #[serde(default)]
    pub stereo: bool,
}

/// UVC extension unit parameters from the `[extension_unit]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct ExtensionUnitInfo {
    pub unit: u8,
    pub firmware_selector: u8,
    /// Bytes returned by a firmware version GET_CUR.
    pub firmware_length: u16,
    pub sync_selector: u8,
    /// SET_CUR payload that makes this unit free-run and drive the trigger.
    pub master_mode: Vec<u8>,
    /// SET_CUR payload that makes this unit wait for an external trigger.
    pub trigger_mode: Vec<u8>,
}

/// Public alias used by the extension unit code.
pub type CameraQuirk = QuirkFile;

/// Parse and validate one quirk file.
pub fn parse_quirk(src: &str) -> Result<QuirkFile, QuirkError> {
    let quirk: QuirkFile = toml::from_str(src)?;
    if quirk.extension_unit.master_mode.is_empty() {
        return Err(QuirkError::EmptyPayload("master_mode"));
    }
    if quirk.extension_unit.trigger_mode.is_empty() {
        return Err(QuirkError::EmptyPayload("trigger_mode"));
    }
    Ok(quirk)
}

fn quirk_db() -> &'static Vec<QuirkFile> {
    QUIRK_DB.get_or_init(|| {
        let mut db = Vec::new();
        for src in [QUIRK_2560_C114, QUIRK_2560_C1D0] {
            match parse_quirk(src) {
                Ok(q) => db.push(q),
                Err(e) => tracing::warn!(error = %e, "skipping quirk file"),
            }
        }
        db
    })
}

/// Look up a quirk by USB vendor:product ID.
/// Returns a `'static` reference into the embedded database.
pub fn lookup_quirk(vid: u16, pid: u16) -> Option<&'static QuirkFile> {
    quirk_db()
        .iter()
        .find(|q| q.device.vendor_id == vid && q.device.product_id == pid)
}

/// List all known quirks.
pub fn list_quirks() -> &'static [QuirkFile] {
    quirk_db()
}

/// Whether VID:PID names a known stereo camera.
pub fn is_stereo_product(vid: u16, pid: u16) -> bool {
    lookup_quirk(vid, pid).is_some_and(|q| q.device.stereo)
}

/// Read USB VID:PID from sysfs for a `/dev/videoN` device.
///
/// Returns `None` if the device is not USB or sysfs is unavailable.
pub fn get_usb_ids(device_path: &str) -> Option<(u16, u16)> {
    // /dev/video2 → "video2"
    let dev_name = Path::new(device_path).file_name()?.to_str()?;
    usb_ids_in(Path::new(SYSFS_VIDEO4LINUX), dev_name)
}

/// Same as [`get_usb_ids`] against an arbitrary video4linux sysfs root.
pub fn usb_ids_in(sys_root: &Path, dev_name: &str) -> Option<(u16, u16)> {
    // <root>/video2/device is a symlink to the USB interface dir
    let device_link = sys_root.join(dev_name).join("device");
    // Resolve: interface dir → parent = USB device dir
    let interface_dir = std::fs::canonicalize(device_link).ok()?;
    let usb_device_dir = interface_dir.parent()?;

    let vid_str = std::fs::read_to_string(usb_device_dir.join("idVendor")).ok()?;
    let pid_str = std::fs::read_to_string(usb_device_dir.join("idProduct")).ok()?;

    let vid = u16::from_str_radix(vid_str.trim(), 16).ok()?;
    let pid = u16::from_str_radix(pid_str.trim(), 16).ok()?;
    Some((vid, pid))
}
