//! Error type shared by every camera operation.

use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("device unavailable: {path}: {source}")]
    DeviceUnavailable {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{path} lacks {missing} capability")]
    CapabilityMissing { path: String, missing: &'static str },
    #[error("format unsupported: requested {requested}, driver offered {offered}")]
    FormatUnsupported { requested: String, offered: String },
    #[error("buffer allocation failed: {0}")]
    BufferAllocationFailed(String),
    #[error("{op} failed: {source}")]
    Io {
        op: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("buffer {0} is not owned by the application")]
    InvalidBufferIndex(u32),
    #[error("malformed frame: {0}")]
    MalformedFrame(String),
    #[error("control unsupported: {0}")]
    ControlUnsupported(String),
    #[error("value {value} out of range for {control} ({minimum}..={maximum})")]
    ControlRange {
        control: String,
        value: i32,
        minimum: i32,
        maximum: i32,
    },
    #[error("no frame within {0:?}")]
    Timeout(Duration),
    #[error("no frame pending")]
    NoFramePending,
    #[error("{operation} is not allowed while {state}")]
    InvalidState {
        operation: &'static str,
        state: &'static str,
    },
}

impl CameraError {
    pub(crate) fn io(op: &'static str, source: std::io::Error) -> Self {
        Self::Io { op, source }
    }

    /// Whether the capture loop should give up on the session.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Io { .. } | Self::InvalidState { .. })
    }
}

pub type Result<T, E = CameraError> = std::result::Result<T, E>;
