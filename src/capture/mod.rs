//! Producer/consumer frame capture.
//!
//! [`CaptureSession`] configures every camera, then runs one
//! [`AcquisitionWorker`] thread per device. Workers share a
//! [`SharedSessionState`] holding the CSV log behind a mutex; each worker owns
//! its binary sink outright.

pub mod session;
pub mod shared;
pub mod worker;

pub use session::{CaptureSession, DeviceFailure, SessionOutcome, SessionReport};
pub use shared::{DeviceRecord, LockScope, SharedSessionState, StopSignal};
pub use worker::{AcquisitionWorker, TimeoutPolicy, WorkerReport, WorkerSettings, WorkerState};
