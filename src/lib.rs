//! syncrec: hardware-triggered multi-camera recording.
//!
//! One camera (the primary) runs free and drives a trigger line with its
//! exposure strobe; every other camera captures one frame per pulse. Frames
//! stream from all cameras in parallel into per-device binary scratch files
//! plus one shared CSV timing log, and are re-encoded into video afterwards.
//!
//! # Module Structure
//!
//! - `device`: SDK capability traits, camera profiles, configuration, simulated rig
//! - `capture`: session orchestrator, acquisition workers, shared session state
//! - `sink`: binary files, CSV log, session metadata record
//! - `convert`: binary file to video re-encoding in bounded segments
//! - `diagnostics`: per-camera statistics from the timing log
//! - `config`: recording parameters from file and environment

pub mod capture;
pub mod config;
pub mod convert;
pub mod device;
pub mod diagnostics;
pub mod error;
pub mod sink;

pub use capture::{
    CaptureSession, LockScope, SessionOutcome, SessionReport, StopSignal, TimeoutPolicy,
};
pub use config::RigConfig;
pub use device::{Camera, CameraSystem, PixelFormat, TriggerRole};
pub use error::{CaptureError, ConfigError, DeviceError, SessionError};
