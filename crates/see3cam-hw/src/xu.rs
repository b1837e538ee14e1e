//! Vendor extension unit commands: firmware version and stereo sync mode.
//!
//! The unit id, selectors and payload bytes come from the quirk database, so
//! this module only knows how to move them across `UVCIOC_CTRL_QUERY`.

use crate::driver::{Driver, UVC_GET_CUR, UVC_SET_CUR};
use crate::error::{CameraError, Result};
use crate::quirks::CameraQuirk;
use v4l::v4l2::vidioc::_IOC_TYPE;

/// Mirror of `struct uvc_xu_control_query` from `<linux/uvcvideo.h>`.
#[repr(C)]
pub(crate) struct UvcXuControlQuery {
    pub unit: u8,
    pub selector: u8,
    pub query: u8,
    pub _pad0: u8,
    pub size: u16,
    pub _pad1: u16,
    pub data: *mut u8,
}

const _XU_SIZE: () = assert!(
    std::mem::size_of::<UvcXuControlQuery>() == 8 + std::mem::size_of::<*mut u8>(),
    "UvcXuControlQuery must match the kernel ABI"
);

/// `_IOWR('u', 0x21, struct uvc_xu_control_query)`.
pub(crate) const UVCIOC_CTRL_QUERY: _IOC_TYPE = iowr(b'u', 0x21, std::mem::size_of::<UvcXuControlQuery>());

const fn iowr(kind: u8, nr: u8, size: usize) -> _IOC_TYPE {
    const READ_WRITE: u32 = 3;
    ((READ_WRITE << 30) | ((size as u32) << 16) | ((kind as u32) << 8) | nr as u32) as _IOC_TYPE
}

/// Stereo synchronisation role of one camera unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// Free-running; drives the trigger line.
    Master,
    /// Exposes only on an external trigger.
    Trigger,
}

impl SyncMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Master => "master",
            Self::Trigger => "trigger",
        }
    }
}

impl std::str::FromStr for SyncMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, String> {
        match s.to_ascii_lowercase().as_str() {
            "master" => Ok(Self::Master),
            "trigger" => Ok(Self::Trigger),
            other => Err(format!("unknown sync mode {other:?} (need master or trigger)")),
        }
    }
}

/// Firmware version as reported by the extension unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FirmwareVersion {
    pub major: u8,
    pub minor1: u8,
    pub minor2: u16,
    pub minor3: u16,
    /// Whether the device is a stereo camera.
    pub stereo: bool,
}

impl FirmwareVersion {
    /// Decode `[major, minor1, minor2 (BE), minor3 (BE)]`.
    pub fn parse(bytes: &[u8], stereo: bool) -> Option<Self> {
        let &[major, minor1, m2_hi, m2_lo, m3_hi, m3_lo, ..] = bytes else {
            return None;
        };
        Some(Self {
            major,
            minor1,
            minor2: u16::from_be_bytes([m2_hi, m2_lo]),
            minor3: u16::from_be_bytes([m3_hi, m3_lo]),
            stereo,
        })
    }
}

impl std::fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}.{}", self.major, self.minor1, self.minor2, self.minor3)
    }
}

/// The extension unit of one quirk-listed device.
pub struct ExtensionUnit {
    quirk: &'static CameraQuirk,
}

impl ExtensionUnit {
    pub fn new(quirk: &'static CameraQuirk) -> Self {
        Self { quirk }
    }

    /// Human-readable name from the quirk database.
    pub fn name(&self) -> &str {
        &self.quirk.device.name
    }

    pub fn is_stereo(&self) -> bool {
        self.quirk.device.stereo
    }

    pub fn firmware_version(&self, driver: &impl Driver) -> Result<FirmwareVersion> {
        let xu = &self.quirk.extension_unit;
        let mut payload = vec![0u8; usize::from(xu.firmware_length)];
        driver
            .xu_query(xu.unit, xu.firmware_selector, UVC_GET_CUR, &mut payload)
            .map_err(|source| CameraError::io("UVC_GET_CUR firmware version", source))?;

        let version = FirmwareVersion::parse(&payload, self.quirk.device.stereo).ok_or_else(|| {
            CameraError::ControlUnsupported(format!(
                "{}: firmware reply of {} bytes",
                self.name(),
                payload.len()
            ))
        })?;
        tracing::debug!(device = self.name(), version = %version, "firmware version");
        Ok(version)
    }

    pub fn set_sync_mode(&self, driver: &impl Driver, mode: SyncMode) -> Result<()> {
        let xu = &self.quirk.extension_unit;
        let mut payload = match mode {
            SyncMode::Master => xu.master_mode.clone(),
            SyncMode::Trigger => xu.trigger_mode.clone(),
        };
        tracing::debug!(device = self.name(), mode = mode.as_str(), "sending sync mode");
        driver
            .xu_query(xu.unit, xu.sync_selector, UVC_SET_CUR, &mut payload)
            .map_err(|source| match source.raw_os_error() {
                Some(libc::ENOENT) | Some(libc::ENOTTY) => {
                    CameraError::ControlUnsupported(format!("{}: sync selector", self.name()))
                }
                _ => CameraError::io("UVC_SET_CUR sync mode", source),
            })
    }
}
