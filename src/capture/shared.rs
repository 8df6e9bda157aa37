//! State shared by every acquisition worker of one session.

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::device::{AppliedSettings, TriggerRole};
use crate::error::{CaptureError, ParsePolicyError};
use crate::sink::{LogRow, LogSink};

/// How much of a frame write happens under the shared log lock.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LockScope {
    /// Binary append and log row together, so log order matches write order
    /// across devices.
    Frame,
    /// Only the log row; binary appends of different devices run in parallel.
    #[default]
    LogRow,
}

impl FromStr for LockScope {
    type Err = ParsePolicyError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "frame" => Ok(LockScope::Frame),
            "log-row" | "logrow" | "row" => Ok(LockScope::LogRow),
            _ => Err(ParsePolicyError {
                kind: "lock scope",
                value: raw.to_string(),
                expected: "frame or log-row",
            }),
        }
    }
}

impl std::fmt::Display for LockScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LockScope::Frame => f.write_str("frame"),
            LockScope::LogRow => f.write_str("log-row"),
        }
    }
}

/// Cooperative stop request, checked by workers between frame reads.
#[derive(Clone, Debug, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Immutable identity table entry.
#[derive(Clone, Debug)]
pub struct DeviceRecord {
    pub identity: usize,
    pub serial: String,
    pub model: String,
    pub role: TriggerRole,
    pub binary_path: PathBuf,
    pub settings: AppliedSettings,
}

pub struct SharedSessionState {
    devices: Vec<DeviceRecord>,
    log: Mutex<Option<LogSink>>,
    frames_written: Vec<AtomicU64>,
    stop: StopSignal,
}

impl SharedSessionState {
    pub fn new(devices: Vec<DeviceRecord>, log: LogSink, stop: StopSignal) -> Self {
        let frames_written = devices.iter().map(|_| AtomicU64::new(0)).collect();
        Self {
            devices,
            log: Mutex::new(Some(log)),
            frames_written,
            stop,
        }
    }

    pub fn devices(&self) -> &[DeviceRecord] {
        &self.devices
    }

    pub fn device(&self, identity: usize) -> Option<&DeviceRecord> {
        self.devices.get(identity)
    }

    pub fn stop_signal(&self) -> &StopSignal {
        &self.stop
    }

    /// Acquire the log lock. A lock poisoned by a panicking worker is
    /// reported instead of recovered.
    pub fn lock_log(&self) -> Result<MutexGuard<'_, Option<LogSink>>, CaptureError> {
        self.log
            .lock()
            .map_err(|_| CaptureError::SharedLockAbandoned)
    }

    /// Append one row while holding the guard from [`Self::lock_log`].
    pub fn append_row(
        log: &mut Option<LogSink>,
        row: &LogRow<'_>,
    ) -> Result<(), CaptureError> {
        let sink = log
            .as_mut()
            .ok_or_else(|| CaptureError::LogWrite("log already closed".to_string()))?;
        sink.append(row)
            .map_err(|e| CaptureError::LogWrite(e.to_string()))
    }

    pub fn record_frame(&self, identity: usize) {
        if let Some(counter) = self.frames_written.get(identity) {
            counter.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn frames_written(&self, identity: usize) -> u64 {
        self.frames_written
            .get(identity)
            .map(|counter| counter.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn total_frames(&self) -> u64 {
        self.frames_written
            .iter()
            .map(|counter| counter.load(Ordering::Relaxed))
            .sum()
    }

    /// Flush and close the shared log. Returns the row count the first time,
    /// `None` once the log is already closed.
    pub fn close_log(&self) -> Result<Option<u64>, CaptureError> {
        let mut guard = self.lock_log()?;
        match guard.take() {
            Some(sink) => {
                let path = sink.path().to_path_buf();
                let rows = sink
                    .finish()
                    .map_err(|source| CaptureError::SinkWrite { path, source })?;
                Ok(Some(rows))
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::PixelFormat;

    fn record(identity: usize) -> DeviceRecord {
        DeviceRecord {
            identity,
            serial: format!("cam-{}", identity),
            model: "test".to_string(),
            role: if identity == 0 {
                TriggerRole::Primary
            } else {
                TriggerRole::Secondary
            },
            binary_path: PathBuf::from(format!("cam-{}.tmp", identity)),
            settings: AppliedSettings {
                role: TriggerRole::Secondary,
                exposure_us: 1000.0,
                frame_rate: 100.0,
                buffer_count: 10,
                width: 4,
                height: 4,
                pixel_format: PixelFormat::Mono8,
            },
        }
    }

    fn state(dir: &std::path::Path) -> SharedSessionState {
        let log = LogSink::create(dir.join("log.csv"), false).unwrap();
        SharedSessionState::new(vec![record(0), record(1)], log, StopSignal::new())
    }

    #[test]
    fn lock_scope_parses() {
        assert_eq!("frame".parse::<LockScope>().unwrap(), LockScope::Frame);
        assert_eq!("Log-Row".parse::<LockScope>().unwrap(), LockScope::LogRow);
        assert!("device".parse::<LockScope>().is_err());
    }

    #[test]
    fn close_log_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let shared = state(dir.path());
        {
            let mut log = shared.lock_log().unwrap();
            SharedSessionState::append_row(
                &mut log,
                &LogRow {
                    frame_id: 0,
                    timestamp_ns: 10,
                    serial: "cam-0",
                    identity: 0,
                },
            )
            .unwrap();
        }
        assert_eq!(shared.close_log().unwrap(), Some(1));
        assert_eq!(shared.close_log().unwrap(), None);

        let mut log = shared.lock_log().unwrap();
        let err = SharedSessionState::append_row(
            &mut log,
            &LogRow {
                frame_id: 1,
                timestamp_ns: 20,
                serial: "cam-0",
                identity: 0,
            },
        )
        .unwrap_err();
        assert!(matches!(err, CaptureError::LogWrite(_)));
    }

    #[test]
    fn poisoned_log_lock_is_abandoned() {
        let dir = tempfile::tempdir().unwrap();
        let shared = Arc::new(state(dir.path()));
        let holder = Arc::clone(&shared);
        let joined = std::thread::spawn(move || {
            let _guard = holder.lock_log().unwrap();
            panic!("worker died holding the log");
        })
        .join();
        assert!(joined.is_err());

        let err = match shared.lock_log() {
            Ok(_) => panic!("poisoned lock was recovered"),
            Err(err) => err,
        };
        assert!(matches!(err, CaptureError::SharedLockAbandoned));
        assert!(err.is_session_fatal());
        assert!(matches!(
            shared.close_log(),
            Err(CaptureError::SharedLockAbandoned)
        ));
    }

    #[test]
    fn counters_are_per_device() {
        let dir = tempfile::tempdir().unwrap();
        let shared = state(dir.path());
        shared.record_frame(1);
        shared.record_frame(1);
        shared.record_frame(0);
        shared.record_frame(7);
        assert_eq!(shared.frames_written(0), 1);
        assert_eq!(shared.frames_written(1), 2);
        assert_eq!(shared.total_frames(), 3);
        assert_eq!(shared.device(1).map(|d| d.role), Some(TriggerRole::Secondary));
    }
}
