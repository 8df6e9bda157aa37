//! Error taxonomy for device, configuration, capture and session failures.
//!
//! Per-frame conditions that are expected during normal operation (an
//! incomplete frame, a timeout under a retry policy) are not errors; they are
//! counted in the worker report instead.

use std::path::PathBuf;

use crate::device::NodeMap;

/// Failure reported by the camera SDK collaborator.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum DeviceError {
    #[error("timed out waiting for the next frame")]
    Timeout,
    #[error("node {name} is not available in the {map} node map")]
    NodeUnavailable { map: NodeMap, name: String },
    #[error("node {name} is not writable")]
    NodeNotWritable { name: String },
    #[error("node {name} is not readable")]
    NodeNotReadable { name: String },
    #[error("node {name} has no entry {entry}")]
    InvalidEntry { name: String, entry: String },
    #[error("node {name} has a different type")]
    WrongNodeType { name: String },
    #[error("device is not acquiring")]
    NotAcquiring,
    #[error("device is not initialized")]
    NotInitialized,
    #[error("backend error: {0}")]
    Backend(String),
}

/// Which configuration sub-step failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConfigStep {
    Init,
    Identity,
    ExposureAuto,
    ExposureTime,
    FrameRate,
    Strobe,
    Trigger,
    BufferHandling,
    ImageFormat,
}

impl std::fmt::Display for ConfigStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConfigStep::Init => "init",
            ConfigStep::Identity => "identity",
            ConfigStep::ExposureAuto => "exposure-auto",
            ConfigStep::ExposureTime => "exposure-time",
            ConfigStep::FrameRate => "frame-rate",
            ConfigStep::Strobe => "strobe",
            ConfigStep::Trigger => "trigger",
            ConfigStep::BufferHandling => "buffer-handling",
            ConfigStep::ImageFormat => "image-format",
        };
        f.write_str(name)
    }
}

/// Why a configuration sub-step could not complete.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ConfigFailure {
    #[error("capability {node} unavailable")]
    CapabilityUnavailable { node: String },
    #[error("capability {node} not writable")]
    NotWritable { node: String },
    #[error("capability {node} not readable")]
    NotReadable { node: String },
    #[error("{node} has no entry {entry}")]
    MissingEntry { node: String, entry: String },
    #[error(transparent)]
    Device(#[from] DeviceError),
}

/// Configuring one device failed; the device has been deinitialized.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
#[error("camera {serial}: {step} configuration failed: {failure}")]
pub struct ConfigError {
    pub serial: String,
    pub step: ConfigStep,
    pub failure: ConfigFailure,
}

/// Fatal condition that ended one acquisition worker.
#[derive(thiserror::Error, Debug)]
pub enum CaptureError {
    #[error("no frame after {consecutive} consecutive timeouts")]
    FrameTimeout { consecutive: u32 },
    #[error("failed writing {path}: {source}")]
    SinkWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed writing the shared log: {0}")]
    LogWrite(String),
    #[error("shared log lock abandoned by a failed worker")]
    SharedLockAbandoned,
    #[error("device error: {0}")]
    Device(#[from] DeviceError),
    #[error("worker thread panicked")]
    Panicked,
}

impl CaptureError {
    /// True when the failure compromises state shared by every worker.
    pub fn is_session_fatal(&self) -> bool {
        matches!(self, CaptureError::SharedLockAbandoned)
    }
}

/// Failure that stops a session before or outside the workers.
#[derive(thiserror::Error, Debug)]
pub enum SessionError {
    #[error("output directory {path} is not writable: {source}")]
    OutputNotWritable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("no cameras detected")]
    NoDevicesFound,
    #[error("no camera matches primary serial {serial}")]
    PrimaryNotFound { serial: String },
    #[error("more than one camera reports primary serial {serial}")]
    DuplicatePrimary { serial: String },
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed creating {path}: {source}")]
    Sink {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("camera SDK error: {0}")]
    Sdk(#[from] DeviceError),
}

/// A policy string from the config could not be parsed.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
#[error("invalid {kind} '{value}', expected {expected}")]
pub struct ParsePolicyError {
    pub kind: &'static str,
    pub value: String,
    pub expected: &'static str,
}

// Worker reports cross thread boundaries.
const _: fn() = || {
    fn implements<T: Send + Sync>() {}
    implements::<CaptureError>();
    implements::<SessionError>();
};
