//! Per-device acquisition loop.
//!
//! A worker owns its camera and binary sink. It discards a warmup burst,
//! streams complete frames into the sink and the shared log until stopped,
//! then drains: acquisition ends, the sink is flushed and the camera is
//! released. The shared log is left open for the orchestrator to close.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use super::shared::{LockScope, SharedSessionState};
use crate::config::RigConfig;
use crate::device::{Camera, Frame};
use crate::error::{CaptureError, DeviceError, ParsePolicyError};
use crate::sink::{BinarySink, LogRow};

/// What a worker does when no frame arrives within the frame timeout.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TimeoutPolicy {
    /// Keep waiting; the stop signal is the only way out.
    #[default]
    Retry,
    /// Fail the worker after this many consecutive timeouts.
    AbortAfter(u32),
}

impl FromStr for TimeoutPolicy {
    type Err = ParsePolicyError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let value = raw.trim().to_ascii_lowercase();
        let invalid = || ParsePolicyError {
            kind: "timeout policy",
            value: raw.to_string(),
            expected: "retry or abort:N with N >= 1",
        };
        if value == "retry" {
            return Ok(TimeoutPolicy::Retry);
        }
        let count = value.strip_prefix("abort:").ok_or_else(invalid)?;
        match count.parse::<u32>() {
            Ok(n) if n >= 1 => Ok(TimeoutPolicy::AbortAfter(n)),
            _ => Err(invalid()),
        }
    }
}

impl std::fmt::Display for TimeoutPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TimeoutPolicy::Retry => f.write_str("retry"),
            TimeoutPolicy::AbortAfter(n) => write!(f, "abort:{}", n),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Warmup,
    Streaming,
    Draining,
    Closed,
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            WorkerState::Idle => "idle",
            WorkerState::Warmup => "warmup",
            WorkerState::Streaming => "streaming",
            WorkerState::Draining => "draining",
            WorkerState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Session parameters a worker needs.
#[derive(Clone, Debug)]
pub struct WorkerSettings {
    pub warmup_frames: u32,
    pub frame_timeout: Duration,
    pub timeout_policy: TimeoutPolicy,
    pub lock_scope: LockScope,
    pub max_frames: Option<u64>,
}

impl WorkerSettings {
    pub fn from_config(config: &RigConfig) -> Self {
        Self {
            warmup_frames: config.buffer_depth,
            frame_timeout: config.frame_timeout,
            timeout_policy: config.timeout_policy,
            lock_scope: config.lock_scope,
            max_frames: config.max_frames,
        }
    }
}

/// Outcome of one worker.
#[derive(Debug)]
pub struct WorkerReport {
    pub identity: usize,
    pub serial: String,
    pub frames_written: u64,
    pub frames_incomplete: u64,
    pub timeouts: u64,
    pub bytes_written: u64,
    pub final_state: WorkerState,
    pub outcome: Result<(), CaptureError>,
}

impl WorkerReport {
    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }

    /// Report for a worker whose thread died before producing one.
    pub fn panicked(identity: usize, serial: impl Into<String>) -> Self {
        Self {
            identity,
            serial: serial.into(),
            frames_written: 0,
            frames_incomplete: 0,
            timeouts: 0,
            bytes_written: 0,
            final_state: WorkerState::Closed,
            outcome: Err(CaptureError::Panicked),
        }
    }
}

pub struct AcquisitionWorker<C: Camera> {
    identity: usize,
    serial: String,
    camera: C,
    sink: Option<BinarySink>,
    shared: Arc<SharedSessionState>,
    settings: WorkerSettings,
    state: WorkerState,
    frames_written: u64,
    frames_incomplete: u64,
    timeouts: u64,
    bytes_written: u64,
}

impl<C: Camera> AcquisitionWorker<C> {
    /// `camera` must be configured and initialized.
    pub fn new(
        identity: usize,
        camera: C,
        sink: BinarySink,
        shared: Arc<SharedSessionState>,
        settings: WorkerSettings,
    ) -> Self {
        let serial = camera.serial().to_string();
        Self {
            identity,
            serial,
            camera,
            sink: Some(sink),
            shared,
            settings,
            state: WorkerState::Idle,
            frames_written: 0,
            frames_incomplete: 0,
            timeouts: 0,
            bytes_written: 0,
        }
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    pub fn run(mut self) -> WorkerReport {
        let streamed = self.stream();
        if let Err(e) = &streamed {
            log::error!("[{}] acquisition failed: {}", self.serial, e);
            if e.is_session_fatal() {
                // Nobody can log once the shared state is gone.
                self.shared.stop_signal().raise();
            }
        }
        let drained = self.drain();
        let outcome = match (streamed, drained) {
            (Err(e), Err(drain_err)) => {
                log::warn!("[{}] drain after failure: {}", self.serial, drain_err);
                Err(e)
            }
            (Err(e), Ok(())) | (Ok(()), Err(e)) => Err(e),
            (Ok(()), Ok(())) => Ok(()),
        };
        self.transition(WorkerState::Closed);
        log::info!(
            "[{}] closed: {} frames written, {} incomplete, {} timeouts",
            self.serial,
            self.frames_written,
            self.frames_incomplete,
            self.timeouts
        );

        WorkerReport {
            identity: self.identity,
            serial: std::mem::take(&mut self.serial),
            frames_written: self.frames_written,
            frames_incomplete: self.frames_incomplete,
            timeouts: self.timeouts,
            bytes_written: self.bytes_written,
            final_state: self.state,
            outcome,
        }
    }

    fn transition(&mut self, next: WorkerState) {
        log::debug!("[{}] {} -> {}", self.serial, self.state, next);
        self.state = next;
    }

    fn stop_requested(&self) -> bool {
        self.shared.stop_signal().is_raised()
    }

    fn stream(&mut self) -> Result<(), CaptureError> {
        self.transition(WorkerState::Warmup);
        self.camera.begin_acquisition()?;
        self.warmup();

        self.transition(WorkerState::Streaming);
        log::info!("[{}] streaming", self.serial);
        let timeout = Some(self.settings.frame_timeout);
        let mut consecutive_timeouts = 0u32;
        while !self.stop_requested() {
            if let Some(max) = self.settings.max_frames {
                if self.frames_written >= max {
                    log::info!("[{}] frame budget of {} reached", self.serial, max);
                    break;
                }
            }
            match self.camera.next_frame(timeout) {
                Ok(frame) => {
                    consecutive_timeouts = 0;
                    if !frame.complete {
                        self.frames_incomplete += 1;
                        log::warn!(
                            "[{}] frame {} incomplete, dropped",
                            self.serial,
                            frame.frame_id
                        );
                        continue;
                    }
                    self.write_frame(&frame)?;
                }
                Err(DeviceError::Timeout) => {
                    self.timeouts += 1;
                    consecutive_timeouts += 1;
                    match self.settings.timeout_policy {
                        TimeoutPolicy::AbortAfter(limit) if consecutive_timeouts >= limit => {
                            return Err(CaptureError::FrameTimeout {
                                consecutive: consecutive_timeouts,
                            });
                        }
                        _ => log::debug!(
                            "[{}] no frame within {:?} ({} in a row)",
                            self.serial,
                            self.settings.frame_timeout,
                            consecutive_timeouts
                        ),
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Discard the frames buffered before the rig settled. Failures here are
    /// expected and only logged.
    fn warmup(&mut self) {
        let timeout = Some(self.settings.frame_timeout);
        for index in 0..self.settings.warmup_frames {
            if self.stop_requested() {
                break;
            }
            if let Err(e) = self.camera.next_frame(timeout) {
                log::debug!("[{}] warmup frame {}: {}", self.serial, index, e);
            }
        }
    }

    fn write_frame(&mut self, frame: &Frame) -> Result<(), CaptureError> {
        let shared = Arc::clone(&self.shared);
        let row = LogRow {
            frame_id: frame.frame_id,
            timestamp_ns: frame.timestamp_ns,
            serial: &self.serial,
            identity: self.identity,
        };
        let sink = self
            .sink
            .as_mut()
            .ok_or_else(|| CaptureError::LogWrite("binary sink already closed".to_string()))?;

        match self.settings.lock_scope {
            LockScope::Frame => {
                let mut log = shared.lock_log()?;
                write_binary(sink, frame)?;
                SharedSessionState::append_row(&mut log, &row)?;
            }
            LockScope::LogRow => {
                write_binary(sink, frame)?;
                let mut log = shared.lock_log()?;
                SharedSessionState::append_row(&mut log, &row)?;
            }
        }

        self.frames_written += 1;
        self.bytes_written += frame.byte_len() as u64;
        shared.record_frame(self.identity);
        Ok(())
    }

    fn drain(&mut self) -> Result<(), CaptureError> {
        self.transition(WorkerState::Draining);
        let mut first_error = None;

        if let Err(e) = self.camera.end_acquisition() {
            if e != DeviceError::NotAcquiring {
                log::warn!("[{}] end acquisition: {}", self.serial, e);
            }
        }
        if let Some(sink) = self.sink.take() {
            let path = sink.path().to_path_buf();
            if let Err(source) = sink.finish() {
                first_error = Some(CaptureError::SinkWrite { path, source });
            }
        }
        if let Err(e) = self.camera.deinit() {
            log::warn!("[{}] deinit: {}", self.serial, e);
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// A worker dropped before [`AcquisitionWorker::run`] closed it still
/// releases its camera and finishes its sink.
impl<C: Camera> Drop for AcquisitionWorker<C> {
    fn drop(&mut self) {
        if self.state != WorkerState::Closed {
            if let Err(e) = self.drain() {
                log::warn!("[{}] release of unrun worker: {}", self.serial, e);
            }
            self.state = WorkerState::Closed;
        }
    }
}

fn write_binary(sink: &mut BinarySink, frame: &Frame) -> Result<(), CaptureError> {
    sink.write_frame(frame.data())
        .map_err(|source| CaptureError::SinkWrite {
            path: sink.path().to_path_buf(),
            source,
        })
}
