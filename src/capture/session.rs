//! Capture session orchestration.

use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use super::shared::{DeviceRecord, SharedSessionState, StopSignal};
use super::worker::{AcquisitionWorker, WorkerReport, WorkerSettings};
use crate::config::RigConfig;
use crate::device::{configure, Camera, CameraProfile, CameraSystem, TriggerRole};
use crate::error::SessionError;
use crate::sink::{self, BinarySink, DeviceEntry, LogSink, SessionRecord};

const MONITOR_INTERVAL: Duration = Duration::from_millis(100);

/// One worker that did not finish cleanly.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceFailure {
    pub identity: usize,
    pub serial: String,
    pub reason: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionOutcome {
    /// Every worker completed.
    Success,
    /// At least one worker failed; the others' recordings are intact.
    PartialFailure(Vec<DeviceFailure>),
    /// Shared state was compromised or the orchestrator itself failed.
    Fatal(String),
}

impl SessionOutcome {
    /// Aggregate worker reports. A failure that compromised shared state wins
    /// over per-device failures.
    pub fn from_reports(reports: &[WorkerReport]) -> Self {
        if let Some(fatal) = reports.iter().find_map(|report| match &report.outcome {
            Err(e) if e.is_session_fatal() => Some(format!("camera {}: {}", report.serial, e)),
            _ => None,
        }) {
            return SessionOutcome::Fatal(fatal);
        }
        let failures: Vec<DeviceFailure> = reports
            .iter()
            .filter_map(|report| {
                report.outcome.as_ref().err().map(|e| DeviceFailure {
                    identity: report.identity,
                    serial: report.serial.clone(),
                    reason: e.to_string(),
                })
            })
            .collect();
        if failures.is_empty() {
            SessionOutcome::Success
        } else {
            SessionOutcome::PartialFailure(failures)
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, SessionOutcome::Success)
    }

    /// Process exit status for the recorder.
    pub fn exit_code(&self) -> i32 {
        match self {
            SessionOutcome::Success => 0,
            SessionOutcome::PartialFailure(_) => 1,
            SessionOutcome::Fatal(_) => 2,
        }
    }
}

/// Everything a finished session produced.
#[derive(Debug)]
pub struct SessionReport {
    pub stamp: String,
    pub log_path: PathBuf,
    pub metadata_path: PathBuf,
    pub log_rows: u64,
    pub devices: Vec<DeviceRecord>,
    pub workers: Vec<WorkerReport>,
    pub outcome: SessionOutcome,
}

impl SessionReport {
    pub fn total_frames(&self) -> u64 {
        self.workers.iter().map(|report| report.frames_written).sum()
    }
}

pub struct CaptureSession {
    config: RigConfig,
    stop: StopSignal,
    stamp: Option<String>,
}

impl CaptureSession {
    pub fn new(config: RigConfig) -> Self {
        Self {
            config,
            stop: StopSignal::new(),
            stamp: None,
        }
    }

    /// Use a fixed file stamp instead of the current local time.
    pub fn with_stamp(mut self, stamp: impl Into<String>) -> Self {
        self.stamp = Some(stamp.into());
        self
    }

    pub fn config(&self) -> &RigConfig {
        &self.config
    }

    /// Raising the returned signal stops every worker.
    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    pub fn run<S: CameraSystem>(&self, system: &mut S) -> Result<SessionReport, SessionError> {
        self.run_with_monitor(system, |_| {})
    }

    /// Run the session, calling `monitor` periodically while workers stream.
    pub fn run_with_monitor<S, F>(
        &self,
        system: &mut S,
        mut monitor: F,
    ) -> Result<SessionReport, SessionError>
    where
        S: CameraSystem,
        F: FnMut(&SharedSessionState),
    {
        let config = &self.config;
        sink::check_write_permission(&config.output_dir).map_err(|source| {
            SessionError::OutputNotWritable {
                path: config.output_dir.clone(),
                source,
            }
        })?;

        log::info!("camera library {}", system.library_version());
        let mut cameras = system.cameras()?;
        log::info!("{} camera(s) detected", cameras.len());
        if cameras.is_empty() {
            return Err(SessionError::NoDevicesFound);
        }
        let primary = find_primary(&cameras, &config.primary_serial)?;

        let mut settings = Vec::with_capacity(cameras.len());
        for identity in 0..cameras.len() {
            let camera = &mut cameras[identity];
            let role = if identity == primary {
                TriggerRole::Primary
            } else {
                TriggerRole::Secondary
            };
            let profile = match config.profile.as_deref().and_then(CameraProfile::by_name) {
                Some(profile) => profile,
                None => CameraProfile::for_model(camera.model()),
            };
            match configure(camera, identity, role, config, profile) {
                Ok(applied) => settings.push(applied),
                Err(e) => {
                    log::error!("{}", e);
                    release(&mut cameras[..identity]);
                    return Err(e.into());
                }
            }
        }

        let stamp = self.stamp.clone().unwrap_or_else(sink::session_stamp);
        let devices: Vec<DeviceRecord> = cameras
            .iter()
            .zip(settings)
            .enumerate()
            .map(|(identity, (camera, applied))| DeviceRecord {
                identity,
                serial: camera.serial().to_string(),
                model: camera.model().to_string(),
                role: applied.role,
                binary_path: config.output_dir.join(sink::binary_file_name(
                    &stamp,
                    camera.serial(),
                    identity,
                )),
                settings: applied,
            })
            .collect();

        let files = match self.create_outputs(&stamp, &devices, primary, system) {
            Ok(files) => files,
            Err(e) => {
                release(&mut cameras);
                return Err(e);
            }
        };
        let (sinks, log, log_path, metadata_path) = files;

        let shared = Arc::new(SharedSessionState::new(
            devices.clone(),
            log,
            self.stop.clone(),
        ));
        let worker_settings = WorkerSettings::from_config(config);
        let ready: Vec<AcquisitionWorker<S::Camera>> = cameras
            .into_iter()
            .zip(sinks)
            .enumerate()
            .map(|(identity, (camera, sink))| {
                AcquisitionWorker::new(
                    identity,
                    camera,
                    sink,
                    Arc::clone(&shared),
                    worker_settings.clone(),
                )
            })
            .collect();
        let mut handles: Vec<(usize, String, JoinHandle<WorkerReport>)> = Vec::new();
        let mut spawn_failure = None;
        let mut pending = ready.into_iter().enumerate();
        for (identity, worker) in pending.by_ref() {
            let serial = devices[identity].serial.clone();
            let spawned = std::thread::Builder::new()
                .name(format!("cam-{}", identity))
                .spawn(move || worker.run());
            match spawned {
                Ok(handle) => handles.push((identity, serial, handle)),
                Err(e) => {
                    log::error!("failed to start worker for {}: {}", serial, e);
                    self.stop.raise();
                    spawn_failure = Some(format!("failed to start worker for {}: {}", serial, e));
                    break;
                }
            }
        }
        // Workers that never started release their camera and sink on drop.
        drop(pending);
        log::info!("{} worker(s) started", handles.len());

        while handles.iter().any(|(_, _, handle)| !handle.is_finished()) {
            monitor(&shared);
            std::thread::sleep(MONITOR_INTERVAL);
        }
        monitor(&shared);

        let mut workers = Vec::with_capacity(handles.len());
        for (identity, serial, handle) in handles {
            match handle.join() {
                Ok(report) => workers.push(report),
                Err(_) => {
                    log::error!("worker for {} panicked", serial);
                    workers.push(WorkerReport::panicked(identity, serial));
                }
            }
        }

        let mut outcome = SessionOutcome::from_reports(&workers);
        let log_rows = match shared.close_log() {
            Ok(rows) => rows.unwrap_or(0),
            Err(e) => {
                log::error!("closing log: {}", e);
                if !matches!(outcome, SessionOutcome::Fatal(_)) {
                    outcome = SessionOutcome::Fatal(format!("closing log: {}", e));
                }
                0
            }
        };
        if let Some(reason) = spawn_failure {
            outcome = SessionOutcome::Fatal(reason);
        }

        match &outcome {
            SessionOutcome::Success => log::info!("session {} complete", stamp),
            SessionOutcome::PartialFailure(failures) => {
                for failure in failures {
                    log::error!(
                        "camera {} (id {}) failed: {}",
                        failure.serial,
                        failure.identity,
                        failure.reason
                    );
                }
            }
            SessionOutcome::Fatal(reason) => log::error!("session {} failed: {}", stamp, reason),
        }

        Ok(SessionReport {
            stamp,
            log_path,
            metadata_path,
            log_rows,
            devices,
            workers,
            outcome,
        })
    }

    #[allow(clippy::type_complexity)]
    fn create_outputs<S: CameraSystem>(
        &self,
        stamp: &str,
        devices: &[DeviceRecord],
        primary: usize,
        system: &S,
    ) -> Result<(Vec<BinarySink>, LogSink, PathBuf, PathBuf), SessionError> {
        let config = &self.config;
        let mut sinks = Vec::with_capacity(devices.len());
        for device in devices {
            let sink = BinarySink::create(&device.binary_path).map_err(|source| {
                SessionError::Sink {
                    path: device.binary_path.clone(),
                    source,
                }
            })?;
            sinks.push(sink);
        }

        let log_path = config.output_dir.join(sink::log_file_name(stamp));
        let log = LogSink::create(&log_path, config.log_system_time).map_err(|e| {
            SessionError::Sink {
                path: log_path.clone(),
                source: e.into(),
            }
        })?;

        let lead = &devices[primary].settings;
        let record = SessionRecord {
            stamp: stamp.to_string(),
            library_version: system.library_version(),
            frame_rate: lead.frame_rate,
            exposure_us: lead.exposure_us,
            width: lead.width,
            height: lead.height,
            pixel_format: lead.pixel_format,
            bytes_per_pixel: lead.pixel_format.bytes_per_pixel(),
            buffer_depth: config.buffer_depth,
            log_file: sink::log_file_name(stamp),
            devices: devices
                .iter()
                .map(|device| DeviceEntry {
                    identity: device.identity,
                    serial: device.serial.clone(),
                    model: device.model.clone(),
                    role: device.role,
                    binary_file: sink::binary_file_name(stamp, &device.serial, device.identity),
                    width: device.settings.width,
                    height: device.settings.height,
                    frame_rate: device.settings.frame_rate,
                })
                .collect(),
        };
        let metadata_path = config.output_dir.join(sink::metadata_file_name(stamp));
        record
            .write(&metadata_path)
            .map_err(|source| SessionError::Sink {
                path: metadata_path.clone(),
                source,
            })?;

        Ok((sinks, log, log_path, metadata_path))
    }
}

fn find_primary<C: Camera>(cameras: &[C], serial: &str) -> Result<usize, SessionError> {
    let matches: Vec<usize> = cameras
        .iter()
        .enumerate()
        .filter(|(_, camera)| camera.serial() == serial)
        .map(|(identity, _)| identity)
        .collect();
    match matches.as_slice() {
        [] => Err(SessionError::PrimaryNotFound {
            serial: serial.to_string(),
        }),
        [identity] => Ok(*identity),
        _ => Err(SessionError::DuplicatePrimary {
            serial: serial.to_string(),
        }),
    }
}

/// Deinitialize cameras that were configured before the session aborted.
fn release<C: Camera>(cameras: &mut [C]) {
    for camera in cameras {
        if let Err(e) = camera.deinit() {
            log::warn!("camera {}: deinit: {}", camera.serial(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CaptureError;

    fn report(identity: usize, outcome: Result<(), CaptureError>) -> WorkerReport {
        WorkerReport {
            identity,
            serial: format!("cam-{}", identity),
            frames_written: 0,
            frames_incomplete: 0,
            timeouts: 0,
            bytes_written: 0,
            final_state: crate::capture::WorkerState::Closed,
            outcome,
        }
    }

    #[test]
    fn success_requires_every_worker() {
        let all_ok = vec![report(0, Ok(())), report(1, Ok(()))];
        assert_eq!(SessionOutcome::from_reports(&all_ok), SessionOutcome::Success);

        let one_failed = vec![
            report(0, Ok(())),
            report(1, Err(CaptureError::FrameTimeout { consecutive: 2 })),
        ];
        match SessionOutcome::from_reports(&one_failed) {
            SessionOutcome::PartialFailure(failures) => {
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].identity, 1);
                assert!(failures[0].reason.contains("2 consecutive timeouts"));
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn abandoned_lock_is_fatal() {
        let reports = vec![
            report(0, Err(CaptureError::Panicked)),
            report(1, Err(CaptureError::SharedLockAbandoned)),
        ];
        let outcome = SessionOutcome::from_reports(&reports);
        assert!(matches!(outcome, SessionOutcome::Fatal(_)));
        assert_eq!(outcome.exit_code(), 2);
        assert_eq!(SessionOutcome::Success.exit_code(), 0);
    }
}
