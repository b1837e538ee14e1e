//! Frame handles, stereo splitting and the motion gate.

use crate::error::{CameraError, Result};
use std::time::Duration;

/// A buffer slot handed to the application by a grab.
///
/// Only metadata: the bytes stay in the slot's mapped memory and are read
/// through [`crate::Camera::buffer`] until the slot is released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GrabbedBuffer {
    pub index: u32,
    pub bytes_used: u32,
    /// Driver frame counter.
    pub sequence: u32,
    /// Driver capture timestamp (monotonic clock).
    pub timestamp: Duration,
}

/// Left/right images copied out of one side-by-side stereo frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StereoFrame {
    pub left: Vec<u8>,
    pub right: Vec<u8>,
    /// The untouched concatenated bytes, when requested.
    pub concat: Option<Vec<u8>>,
}

impl StereoFrame {
    /// Bytes per eye.
    pub fn half_len(&self) -> usize {
        self.left.len()
    }
}

/// Result of a stereo grab. The slot in `buffer` must still be released.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StereoGrab {
    pub buffer: GrabbedBuffer,
    pub frame: StereoFrame,
}

/// Split a concatenated stereo frame at exactly `data.len() / 2`.
///
/// An odd byte count cannot be split evenly and is reported as
/// [`CameraError::MalformedFrame`]. An empty frame splits into two empty
/// halves.
pub fn split_stereo(data: &[u8], keep_concat: bool) -> Result<StereoFrame> {
    if data.len() % 2 != 0 {
        return Err(CameraError::MalformedFrame(format!(
            "stereo frame of {} bytes cannot be split in half",
            data.len()
        )));
    }

    let (left, right) = data.split_at(data.len() / 2);
    Ok(StereoFrame {
        left: left.to_vec(),
        right: right.to_vec(),
        concat: keep_concat.then(|| data.to_vec()),
    })
}

/// When to drop a YUYV frame for showing too little change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MotionThresholds {
    /// A pixel counts as changed when its luma moved by more than this.
    pub luminance: u8,
    /// Frames with fewer changed pixels than this are dropped.
    pub count: usize,
}

/// Compares the luma of each YUYV frame with the frame grabbed before it.
#[derive(Debug)]
pub(crate) struct MotionGate {
    thresholds: MotionThresholds,
    previous: Vec<u8>,
}

impl MotionGate {
    pub fn new(thresholds: MotionThresholds) -> Self {
        Self {
            thresholds,
            previous: Vec::new(),
        }
    }

    pub fn thresholds(&self) -> MotionThresholds {
        self.thresholds
    }

    /// Whether `yuyv` moved enough against the previous frame. The frame
    /// becomes the new reference either way.
    ///
    /// YUYV packs two pixels per 4 bytes as [Y0, U, Y1, V]; luma is every
    /// even-indexed byte.
    pub fn admit(&mut self, yuyv: &[u8]) -> bool {
        let luma = yuyv.iter().step_by(2).copied();
        if self.previous.len() != yuyv.len().div_ceil(2) {
            // First frame, or the size changed: nothing to compare against.
            self.previous = luma.collect();
            return true;
        }

        let mut changed = 0usize;
        for (previous, y) in self.previous.iter_mut().zip(luma) {
            if previous.abs_diff(y) > self.thresholds.luminance {
                changed += 1;
            }
            *previous = y;
        }
        changed >= self.thresholds.count
    }
}
