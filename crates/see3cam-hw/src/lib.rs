//! see3cam-hw: hardware core for UVC stereo cameras.
//!
//! Format negotiation, a double-buffered mmap pool with explicit slot
//! ownership, blocking grab/release, stereo frame splitting, and control-ID
//! translation across the legacy, class and vendor-extended namespaces.

pub mod buffer;
pub mod camera;
pub mod controls;
pub mod driver;
pub mod enumerate;
pub mod error;
pub mod frame;
#[cfg(any(test, feature = "mock"))]
pub mod mock;
pub mod quirks;
pub mod xu;

pub use buffer::{SlotState, BUFFER_COUNT};
pub use camera::{Camera, CameraConfig, CaptureMode, GrabPolicy, StreamState};
pub use controls::{Control, ControlKind, Controls, Namespace};
pub use driver::{Driver, V4l2Driver};
pub use enumerate::{enumerate, DeviceRecord};
pub use error::{CameraError, Result};
pub use frame::{GrabbedBuffer, MotionThresholds, StereoFrame, StereoGrab};
pub use xu::{FirmwareVersion, SyncMode};
