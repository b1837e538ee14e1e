//! Control-ID translation across the three control namespaces.
//!
//! Different uvcvideo revisions expose the same logical control under a
//! legacy private ID, a class-based ID, or a vendor extended ID. Each
//! [`Control`] carries its candidates in priority order (extended, class,
//! legacy); the first one the open device answers for is cached for the
//! lifetime of the session.

use crate::driver::{ControlInfo, Driver};
use crate::error::{CameraError, Result};
use crate::quirks::CameraQuirk;
use crate::xu::{ExtensionUnit, FirmwareVersion, SyncMode};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

/// Base of the old uvcvideo private controls.
pub const LEGACY_PRIVATE_BASE: u32 = 0x0800_0000;
/// `V4L2_CID_BASE` (user class).
pub const USER_CLASS_BASE: u32 = 0x0098_0900;
/// `V4L2_CID_CAMERA_CLASS_BASE`.
pub const CAMERA_CLASS_BASE: u32 = 0x009A_0900;
/// First vendor extended control (Logitech-style dynamic controls).
pub const EXTENDED_BASE: u32 = 0x0A04_6D01;

/// Which generation of control IDs a candidate belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Namespace {
    Extended,
    Class,
    Legacy,
}

impl Namespace {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Extended => "extended",
            Self::Class => "class",
            Self::Legacy => "legacy",
        }
    }
}

/// Semantic type of a control value (the UVC data types).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlKind {
    Raw,
    Signed,
    Unsigned,
    Boolean,
    Enumerated,
    Bitmask,
}

/// A logical camera control, independent of its numeric ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Control {
    Brightness,
    Contrast,
    Saturation,
    Hue,
    AutoWhiteBalance,
    Gamma,
    Gain,
    PowerLineFrequency,
    HueAuto,
    WhiteBalanceTemperature,
    Sharpness,
    BacklightCompensation,
    ExposureAuto,
    ExposureAbsolute,
    ExposureAutoPriority,
    PanRelative,
    TiltRelative,
    PanReset,
    TiltReset,
    PanTiltReset,
    PanAbsolute,
    TiltAbsolute,
    FocusAbsolute,
    FocusRelative,
    FocusAuto,
    Led1Mode,
    Led1Frequency,
    DisableProcessing,
    RawBitsPerPixel,
}

/// Static description of one logical control.
#[derive(Debug)]
pub struct ControlDescriptor {
    pub control: Control,
    pub name: &'static str,
    pub kind: ControlKind,
    /// Range fixed by the class definition; only consulted when the driver
    /// reports no usable range for a class or extended ID.
    pub range: Option<(i32, i32)>,
    /// Candidate IDs, highest priority first.
    pub candidates: &'static [(Namespace, u32)],
}

use Namespace::{Class, Extended, Legacy};

macro_rules! descriptor {
    ($control:ident, $name:literal, $kind:ident, $range:expr, [$(($ns:ident, $id:expr)),+ $(,)?]) => {
        ControlDescriptor {
            control: Control::$control,
            name: $name,
            kind: ControlKind::$kind,
            range: $range,
            candidates: &[$(($ns, $id)),+],
        }
    };
}

const BOOL: Option<(i32, i32)> = Some((0, 1));

/// The translation table.
pub static DESCRIPTORS: &[ControlDescriptor] = &[
    descriptor!(Brightness, "brightness", Signed, None, [(Class, USER_CLASS_BASE)]),
    descriptor!(Contrast, "contrast", Signed, None, [(Class, USER_CLASS_BASE + 1)]),
    descriptor!(Saturation, "saturation", Signed, None, [(Class, USER_CLASS_BASE + 2)]),
    descriptor!(Hue, "hue", Signed, None, [(Class, USER_CLASS_BASE + 3)]),
    descriptor!(AutoWhiteBalance, "white_balance_auto", Boolean, BOOL, [
        (Class, USER_CLASS_BASE + 12),
        (Legacy, LEGACY_PRIVATE_BASE + 12),
    ]),
    descriptor!(Gamma, "gamma", Signed, None, [(Class, USER_CLASS_BASE + 16)]),
    descriptor!(Gain, "gain", Signed, None, [(Class, USER_CLASS_BASE + 19)]),
    descriptor!(PowerLineFrequency, "power_line_frequency", Enumerated, Some((0, 3)), [
        (Class, USER_CLASS_BASE + 24),
        (Legacy, LEGACY_PRIVATE_BASE + 1),
    ]),
    descriptor!(HueAuto, "hue_auto", Boolean, BOOL, [
        (Class, USER_CLASS_BASE + 25),
        (Legacy, LEGACY_PRIVATE_BASE + 3),
    ]),
    descriptor!(WhiteBalanceTemperature, "white_balance_temperature", Unsigned, None, [
        (Class, USER_CLASS_BASE + 26),
        (Legacy, LEGACY_PRIVATE_BASE + 13),
    ]),
    descriptor!(Sharpness, "sharpness", Unsigned, None, [
        (Class, USER_CLASS_BASE + 27),
        (Legacy, LEGACY_PRIVATE_BASE + 2),
    ]),
    descriptor!(BacklightCompensation, "backlight_compensation", Unsigned, None, [
        (Class, USER_CLASS_BASE + 28),
        (Legacy, LEGACY_PRIVATE_BASE),
    ]),
    descriptor!(ExposureAuto, "exposure_auto", Enumerated, Some((0, 3)), [
        (Class, CAMERA_CLASS_BASE + 1),
        (Legacy, LEGACY_PRIVATE_BASE + 10),
    ]),
    descriptor!(ExposureAbsolute, "exposure_absolute", Unsigned, None, [
        (Class, CAMERA_CLASS_BASE + 2),
        (Legacy, LEGACY_PRIVATE_BASE + 11),
    ]),
    descriptor!(ExposureAutoPriority, "exposure_auto_priority", Boolean, BOOL, [
        (Class, CAMERA_CLASS_BASE + 3),
    ]),
    descriptor!(PanRelative, "pan_relative", Signed, None, [
        (Class, CAMERA_CLASS_BASE + 4),
        (Legacy, LEGACY_PRIVATE_BASE + 7),
    ]),
    descriptor!(TiltRelative, "tilt_relative", Signed, None, [
        (Class, CAMERA_CLASS_BASE + 5),
        (Legacy, LEGACY_PRIVATE_BASE + 8),
    ]),
    descriptor!(PanReset, "pan_reset", Boolean, BOOL, [(Class, CAMERA_CLASS_BASE + 6)]),
    descriptor!(TiltReset, "tilt_reset", Boolean, BOOL, [(Class, CAMERA_CLASS_BASE + 7)]),
    descriptor!(PanTiltReset, "pan_tilt_reset", Bitmask, Some((0, 3)), [
        (Extended, EXTENDED_BASE + 2),
        (Legacy, LEGACY_PRIVATE_BASE + 9),
    ]),
    descriptor!(PanAbsolute, "pan_absolute", Signed, None, [(Class, CAMERA_CLASS_BASE + 8)]),
    descriptor!(TiltAbsolute, "tilt_absolute", Signed, None, [(Class, CAMERA_CLASS_BASE + 9)]),
    descriptor!(FocusAbsolute, "focus_absolute", Unsigned, None, [
        (Extended, EXTENDED_BASE + 3),
        (Class, CAMERA_CLASS_BASE + 10),
        (Legacy, LEGACY_PRIVATE_BASE + 5),
    ]),
    descriptor!(FocusRelative, "focus_relative", Signed, None, [
        (Class, CAMERA_CLASS_BASE + 11),
        (Legacy, LEGACY_PRIVATE_BASE + 6),
    ]),
    descriptor!(FocusAuto, "focus_auto", Boolean, BOOL, [
        (Class, CAMERA_CLASS_BASE + 12),
        (Legacy, LEGACY_PRIVATE_BASE + 4),
    ]),
    descriptor!(Led1Mode, "led1_mode", Enumerated, None, [(Extended, EXTENDED_BASE + 4)]),
    descriptor!(Led1Frequency, "led1_frequency", Unsigned, None, [(Extended, EXTENDED_BASE + 5)]),
    descriptor!(DisableProcessing, "disable_processing", Boolean, BOOL, [
        (Extended, EXTENDED_BASE + 0x70),
    ]),
    descriptor!(RawBitsPerPixel, "raw_bits_per_pixel", Enumerated, None, [
        (Extended, EXTENDED_BASE + 0x71),
    ]),
];

impl Control {
    pub fn descriptor(self) -> &'static ControlDescriptor {
        DESCRIPTORS
            .iter()
            .find(|d| d.control == self)
            .unwrap_or_else(|| unreachable!("every Control has a descriptor"))
    }

    pub fn name(self) -> &'static str {
        self.descriptor().name
    }

    pub fn kind(self) -> ControlKind {
        self.descriptor().kind
    }

    /// Map any known numeric control ID, from any namespace, back to its
    /// logical control.
    pub fn from_id(id: u32) -> Option<Self> {
        DESCRIPTORS
            .iter()
            .find(|d| d.candidates.iter().any(|&(_, cid)| cid == id))
            .map(|d| d.control)
    }

    pub fn all() -> impl Iterator<Item = Self> {
        DESCRIPTORS.iter().map(|d| d.control)
    }
}

impl std::fmt::Display for Control {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Control {
    type Err = CameraError;

    /// Accepts a control name (`exposure_absolute`) or a numeric ID in
    /// decimal or `0x` hex from any namespace.
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let by_name = DESCRIPTORS
            .iter()
            .find(|d| d.name.eq_ignore_ascii_case(s))
            .map(|d| d.control);
        if let Some(control) = by_name {
            return Ok(control);
        }

        let id = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
            Some(hex) => u32::from_str_radix(hex, 16).ok(),
            None => s.parse().ok(),
        };
        id.and_then(Control::from_id)
            .ok_or_else(|| CameraError::ControlUnsupported(format!("unknown control {s:?}")))
    }
}

/// The namespace-specific ID a control resolved to on this device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedControl {
    pub control: Control,
    pub namespace: Namespace,
    pub id: u32,
    pub info: ControlInfo,
}

impl ResolvedControl {
    /// Static range for this ID. Legacy private IDs carry their own value
    /// encodings (e.g. exposure_auto as a 1/2/4/8 bitmask), so none applies.
    fn static_range(&self) -> Option<(i32, i32)> {
        match self.namespace {
            Namespace::Legacy => None,
            Namespace::Class | Namespace::Extended => self.control.descriptor().range,
        }
    }

    /// Reject values outside the range the device reported for this ID.
    fn check_range(&self, value: i32) -> Result<()> {
        let (minimum, maximum) = if self.info.minimum <= self.info.maximum {
            (self.info.minimum, self.info.maximum)
        } else if let Some(range) = self.static_range() {
            range
        } else {
            return Ok(());
        };
        if value < minimum || value > maximum {
            return Err(CameraError::ControlRange {
                control: self.control.name().to_string(),
                value,
                minimum,
                maximum,
            });
        }
        Ok(())
    }
}

/// Mutable control-plane state, guarded by one mutex.
#[derive(Default)]
pub(crate) struct ControlPlane {
    resolved: HashMap<Control, Option<ResolvedControl>>,
    sync_mode: Option<SyncMode>,
}

/// State shared between a [`crate::Camera`] and its [`Controls`] handles.
///
/// The driver (and with it the device file handle) is dropped on close even
/// while control handles are still alive; they then see a closed session.
pub(crate) struct Shared<D> {
    driver: RwLock<Option<D>>,
    pub(crate) path: String,
    pub(crate) plane: Mutex<ControlPlane>,
    pub(crate) streaming: AtomicBool,
    pub(crate) xu: Option<ExtensionUnit>,
}

impl<D: Driver> Shared<D> {
    pub(crate) fn new(driver: D, path: &str, quirk: Option<&'static CameraQuirk>) -> Self {
        Self {
            driver: RwLock::new(Some(driver)),
            path: path.to_string(),
            plane: Mutex::new(ControlPlane::default()),
            streaming: AtomicBool::new(false),
            xu: quirk.map(ExtensionUnit::new),
        }
    }

    /// Run `f` against the driver, or fail with `InvalidState` once closed.
    pub(crate) fn with_driver<R>(&self, operation: &'static str, f: impl FnOnce(&D) -> Result<R>) -> Result<R> {
        let driver = self.driver.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        match driver.as_ref() {
            Some(driver) => f(driver),
            None => Err(CameraError::InvalidState {
                operation,
                state: "closed",
            }),
        }
    }

    /// Drop the driver. Waits for control calls already in flight.
    pub(crate) fn close_driver(&self) {
        let driver = self
            .driver
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        drop(driver);
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.driver
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .is_none()
    }

    /// The control-plane lock, recovering from poisoning: a panic while
    /// holding it leaves the cache intact.
    pub(crate) fn plane(&self) -> MutexGuard<'_, ControlPlane> {
        self.plane.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Thread-safe handle to a session's control plane.
///
/// Cloned handles may be used from any thread while the capture thread is
/// blocked in [`crate::Camera::grab`]; every control-plane ioctl sequence is
/// serialised by an internal mutex that the capture path never takes.
pub struct Controls<D> {
    shared: Arc<Shared<D>>,
}

impl<D> Clone for Controls<D> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<D: Driver> Controls<D> {
    pub(crate) fn new(shared: Arc<Shared<D>>) -> Self {
        Self { shared }
    }

    pub fn device_path(&self) -> &str {
        &self.shared.path
    }

    fn lock(&self, operation: &'static str) -> Result<MutexGuard<'_, ControlPlane>> {
        if self.shared.is_closed() {
            return Err(CameraError::InvalidState {
                operation,
                state: "closed",
            });
        }
        Ok(self.shared.plane())
    }

    fn resolve_locked(&self, plane: &mut ControlPlane, control: Control) -> Result<ResolvedControl> {
        if let Some(cached) = plane.resolved.get(&control) {
            return cached
                .clone()
                .ok_or_else(|| CameraError::ControlUnsupported(control.name().to_string()));
        }

        let found = self.shared.with_driver("resolve control", |driver| {
            for &(namespace, id) in control.descriptor().candidates {
                match driver.query_control(id) {
                    Ok(Some(info)) => {
                        return Ok(Some(ResolvedControl {
                            control,
                            namespace,
                            id,
                            info,
                        }))
                    }
                    Ok(None) => {}
                    Err(source) => return Err(CameraError::io("VIDIOC_QUERYCTRL", source)),
                }
            }
            Ok(None)
        })?;

        match &found {
            Some(r) => tracing::debug!(
                control = control.name(),
                namespace = r.namespace.as_str(),
                id = format_args!("{:#010x}", r.id),
                "control resolved"
            ),
            None => tracing::debug!(control = control.name(), "control not supported by device"),
        }
        plane.resolved.insert(control, found.clone());
        found.ok_or_else(|| CameraError::ControlUnsupported(control.name().to_string()))
    }

    /// Resolve `control` to the ID this device uses (queried once, then cached).
    pub fn resolve(&self, control: Control) -> Result<ResolvedControl> {
        let mut plane = self.lock("resolve control")?;
        self.resolve_locked(&mut plane, control)
    }

    pub fn set(&self, control: Control, value: i32) -> Result<()> {
        let mut plane = self.lock("set control")?;
        let resolved = self.resolve_locked(&mut plane, control)?;
        resolved.check_range(value)?;

        self.shared.with_driver("set control", |driver| {
            driver
                .set_control(resolved.id, value)
                .map_err(|source| match source.raw_os_error() {
                    Some(libc::ERANGE) | Some(libc::EINVAL) => CameraError::ControlRange {
                        control: control.name().to_string(),
                        value,
                        minimum: resolved.info.minimum,
                        maximum: resolved.info.maximum,
                    },
                    _ => CameraError::io("VIDIOC_S_CTRL", source),
                })
        })?;

        tracing::debug!(control = control.name(), value, "control set");
        Ok(())
    }

    pub fn get(&self, control: Control) -> Result<i32> {
        let mut plane = self.lock("get control")?;
        let resolved = self.resolve_locked(&mut plane, control)?;
        self.shared.with_driver("get control", |driver| {
            driver
                .get_control(resolved.id)
                .map_err(|source| CameraError::io("VIDIOC_G_CTRL", source))
        })
    }

    pub fn set_auto_white_balance(&self, on: bool) -> Result<()> {
        self.set(Control::AutoWhiteBalance, i32::from(on))
    }

    fn extension_unit(&self) -> Result<&ExtensionUnit> {
        self.shared.xu.as_ref().ok_or_else(|| {
            CameraError::ControlUnsupported(format!(
                "{}: no known extension unit",
                self.shared.path
            ))
        })
    }

    /// Firmware version and stereo capability from the vendor extension unit.
    pub fn firmware_version(&self) -> Result<FirmwareVersion> {
        let _plane = self.lock("query firmware version")?;
        let xu = self.extension_unit()?;
        self.shared
            .with_driver("query firmware version", |driver| xu.firmware_version(driver))
    }

    /// This unit free-runs and drives the trigger line of its stereo partner.
    pub fn enable_master_mode(&self) -> Result<()> {
        self.set_sync_mode(SyncMode::Master)
    }

    /// This unit captures only on an external trigger.
    pub fn enable_trigger_mode(&self) -> Result<()> {
        self.set_sync_mode(SyncMode::Trigger)
    }

    fn set_sync_mode(&self, mode: SyncMode) -> Result<()> {
        let mut plane = self.lock("set sync mode")?;
        if plane.sync_mode == Some(mode) {
            return Ok(());
        }
        if self.shared.streaming.load(Ordering::Acquire) {
            return Err(CameraError::InvalidState {
                operation: "set sync mode",
                state: "streaming",
            });
        }
        let xu = self.extension_unit()?;
        self.shared
            .with_driver("set sync mode", |driver| xu.set_sync_mode(driver, mode))?;
        plane.sync_mode = Some(mode);
        tracing::info!(device = %self.shared.path, mode = mode.as_str(), "sync mode set");
        Ok(())
    }

    /// The last sync mode successfully issued on this session.
    pub fn sync_mode(&self) -> Option<SyncMode> {
        self.shared.plane().sync_mode
    }

    /// Whether the session behind this handle has been closed.
    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockDriver;

    fn controls(mock: &Arc<MockDriver>) -> Controls<Arc<MockDriver>> {
        let quirk = crate::quirks::lookup_quirk(0x2560, 0xc114);
        Controls::new(Arc::new(Shared::new(Arc::clone(mock), "/dev/video-mock", quirk)))
    }

    #[test]
    fn test_candidates_in_priority_order() {
        for d in DESCRIPTORS {
            assert!(!d.candidates.is_empty(), "{} has no candidates", d.name);
            assert!(
                d.candidates.windows(2).all(|w| w[0].0 < w[1].0),
                "{} candidates out of order",
                d.name
            );
        }
    }

    #[test]
    fn test_ids_match_kernel_tables() {
        assert_eq!(Control::Brightness.descriptor().candidates[0].1, 0x0098_0900);
        assert_eq!(Control::ExposureAuto.descriptor().candidates[0].1, 0x009A_0901);
        assert_eq!(Control::ExposureAbsolute.descriptor().candidates[0].1, 0x009A_0902);
        assert_eq!(Control::ExposureAbsolute.descriptor().candidates[1].1, 0x0800_000B);
        assert_eq!(Control::FocusAbsolute.descriptor().candidates[0].1, 0x0A04_6D04);
        assert_eq!(Control::RawBitsPerPixel.descriptor().candidates[0].1, 0x0A04_6D72);
    }

    #[test]
    fn test_ids_unique_across_table() {
        let mut seen = std::collections::HashSet::new();
        for d in DESCRIPTORS {
            for &(_, id) in d.candidates {
                assert!(seen.insert(id), "{id:#x} listed twice");
            }
        }
    }

    #[test]
    fn test_from_id_and_from_str() {
        assert_eq!(Control::from_id(0x009a_0902), Some(Control::ExposureAbsolute));
        assert_eq!(Control::from_id(0x0800_000B), Some(Control::ExposureAbsolute));
        assert_eq!(Control::from_id(0x1234), None);
        assert_eq!("brightness".parse::<Control>().unwrap(), Control::Brightness);
        assert_eq!("0x00980900".parse::<Control>().unwrap(), Control::Brightness);
        assert_eq!("10094850".parse::<Control>().unwrap(), Control::ExposureAbsolute);
        assert!(matches!(
            "zoom".parse::<Control>(),
            Err(CameraError::ControlUnsupported(_))
        ));
    }

    #[test]
    fn test_set_get_round_trip() {
        let mock = Arc::new(MockDriver::new().with_control(0x0098_0900, -64, 64, 0));
        let controls = controls(&mock);
        controls.set(Control::Brightness, 8).unwrap();
        assert_eq!(controls.get(Control::Brightness).unwrap(), 8);
    }

    #[test]
    fn test_class_id_preferred_over_legacy() {
        let mock = Arc::new(
            MockDriver::new()
                .with_control(LEGACY_PRIVATE_BASE + 11, 1, 10_000, 80)
                .with_control(CAMERA_CLASS_BASE + 2, 1, 10_000, 80),
        );
        let controls = controls(&mock);
        let resolved = controls.resolve(Control::ExposureAbsolute).unwrap();
        assert_eq!(resolved.namespace, Namespace::Class);
        assert_eq!(resolved.id, CAMERA_CLASS_BASE + 2);
        assert_eq!(mock.queried_ids(), vec![CAMERA_CLASS_BASE + 2]);
    }

    #[test]
    fn test_extended_tried_first() {
        let mock = Arc::new(
            MockDriver::new()
                .with_control(LEGACY_PRIVATE_BASE + 5, 0, 255, 0)
                .with_control(CAMERA_CLASS_BASE + 10, 0, 255, 0),
        );
        let controls = controls(&mock);
        let resolved = controls.resolve(Control::FocusAbsolute).unwrap();
        assert_eq!(resolved.namespace, Namespace::Class);
        assert_eq!(
            mock.queried_ids(),
            vec![EXTENDED_BASE + 3, CAMERA_CLASS_BASE + 10]
        );
    }

    #[test]
    fn test_legacy_fallback_and_cache() {
        let mock = Arc::new(MockDriver::new().with_control(LEGACY_PRIVATE_BASE + 11, 1, 500, 80));
        let controls = controls(&mock);
        controls.set(Control::ExposureAbsolute, 120).unwrap();
        controls.set(Control::ExposureAbsolute, 130).unwrap();
        assert_eq!(controls.get(Control::ExposureAbsolute).unwrap(), 130);
        // Queried once: class then legacy, never again.
        assert_eq!(
            mock.queried_ids(),
            vec![CAMERA_CLASS_BASE + 2, LEGACY_PRIVATE_BASE + 11]
        );
    }

    #[test]
    fn test_unsupported_control() {
        let mock = Arc::new(MockDriver::new());
        let controls = controls(&mock);
        assert!(matches!(
            controls.set(Control::Gamma, 1),
            Err(CameraError::ControlUnsupported(_))
        ));
        assert!(matches!(
            controls.get(Control::Gamma),
            Err(CameraError::ControlUnsupported(_))
        ));
    }

    #[test]
    fn test_out_of_range_rejected() {
        let mock = Arc::new(MockDriver::new().with_control(USER_CLASS_BASE, 0, 15, 4));
        let controls = controls(&mock);
        let err = controls.set(Control::Brightness, 99).unwrap_err();
        assert!(matches!(err, CameraError::ControlRange { value: 99, maximum: 15, .. }));
        // Rejected value never reached the driver.
        assert_eq!(controls.get(Control::Brightness).unwrap(), 4);
    }

    #[test]
    fn test_driver_range_rejection_mapped() {
        let mock = Arc::new(MockDriver::new().with_control(USER_CLASS_BASE, 0, 15, 4));
        mock.fail_next_set_control(libc::ERANGE);
        let controls = controls(&mock);
        assert!(matches!(
            controls.set(Control::Brightness, 3),
            Err(CameraError::ControlRange { .. })
        ));
    }

    #[test]
    fn test_auto_white_balance_wrapper() {
        let mock = Arc::new(MockDriver::new().with_control(USER_CLASS_BASE + 12, 0, 1, 1));
        let controls = controls(&mock);
        controls.set_auto_white_balance(false).unwrap();
        assert_eq!(controls.get(Control::AutoWhiteBalance).unwrap(), 0);
        controls.set_auto_white_balance(true).unwrap();
        assert_eq!(controls.get(Control::AutoWhiteBalance).unwrap(), 1);
    }

    #[test]
    fn test_sync_mode_idempotent() {
        let mock = Arc::new(MockDriver::new());
        let controls = controls(&mock);
        controls.enable_master_mode().unwrap();
        controls.enable_master_mode().unwrap();
        assert_eq!(mock.xu_writes().len(), 1);
        controls.enable_trigger_mode().unwrap();
        assert_eq!(mock.xu_writes().len(), 2);
        assert_eq!(controls.sync_mode(), Some(SyncMode::Trigger));
    }

    #[test]
    fn test_sync_mode_without_extension_unit() {
        let mock = Arc::new(MockDriver::new());
        let controls = Controls::new(Arc::new(Shared::new(Arc::clone(&mock), "/dev/video-mock", None)));
        assert!(matches!(
            controls.enable_master_mode(),
            Err(CameraError::ControlUnsupported(_))
        ));
        assert!(matches!(
            controls.firmware_version(),
            Err(CameraError::ControlUnsupported(_))
        ));
    }

    #[test]
    fn test_closed_session_rejects_controls() {
        let mock = Arc::new(MockDriver::new().with_control(USER_CLASS_BASE, 0, 15, 4));
        let controls = controls(&mock);
        controls.get(Control::Brightness).unwrap();
        controls.shared.close_driver();
        assert!(controls.is_closed());
        assert!(matches!(
            controls.get(Control::Brightness),
            Err(CameraError::InvalidState { state: "closed", .. })
        ));
        assert!(matches!(
            controls.enable_master_mode(),
            Err(CameraError::InvalidState { state: "closed", .. })
        ));
        // The handle no longer keeps the driver alive.
        assert_eq!(Arc::strong_count(&mock), 1);
    }

    #[test]
    fn test_legacy_exposure_auto_takes_bitmask_values() {
        let mock = Arc::new(MockDriver::new().with_control(LEGACY_PRIVATE_BASE + 10, 1, 8, 2));
        let controls = controls(&mock);
        // Shutter priority (4) and aperture priority (8) in the legacy encoding.
        controls.set(Control::ExposureAuto, 8).unwrap();
        assert_eq!(controls.get(Control::ExposureAuto).unwrap(), 8);
        controls.set(Control::ExposureAuto, 4).unwrap();
        assert_eq!(mock.control_value(LEGACY_PRIVATE_BASE + 10), Some(4));
        assert!(matches!(
            controls.set(Control::ExposureAuto, 9),
            Err(CameraError::ControlRange { value: 9, minimum: 1, maximum: 8, .. })
        ));
    }

    #[test]
    fn test_static_range_when_driver_reports_none() {
        // minimum > maximum: no usable range from QUERYCTRL.
        let mock = Arc::new(MockDriver::new().with_control(USER_CLASS_BASE + 24, 1, 0, 0));
        let controls = controls(&mock);
        assert!(matches!(
            controls.set(Control::PowerLineFrequency, 5),
            Err(CameraError::ControlRange { minimum: 0, maximum: 3, .. })
        ));
    }
}
