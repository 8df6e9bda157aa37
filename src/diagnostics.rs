//! Recording diagnostics computed from the shared timing log.

use serde::Serialize;
use std::collections::BTreeMap;

use crate::sink::LogRecord;

/// Inter-frame interval above which a frame is counted as critical (25 fps).
pub const DEFAULT_CRITICAL_INTERVAL_S: f64 = 0.040;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CameraDiagnostics {
    pub serial: String,
    pub identity: usize,
    pub frames_recorded: u64,
    pub first_frame_id: u64,
    pub last_frame_id: u64,
    /// Device timestamp span, first to last row.
    pub duration_s: f64,
    /// Reciprocal of the mean inter-frame interval; zero with fewer than two rows.
    pub mean_fps: f64,
    pub min_interval_s: Option<f64>,
    pub max_interval_s: Option<f64>,
    pub critical_frames: u64,
    /// Frame ids missing between consecutive rows.
    pub dropped_frames: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordingReport {
    pub total_rows: u64,
    pub critical_interval_s: f64,
    pub cameras: Vec<CameraDiagnostics>,
}

/// Group rows by serial number (sorted) and compute per-camera statistics.
/// Rows keep their log order within each camera.
pub fn analyze(records: &[LogRecord], critical_interval_s: f64) -> RecordingReport {
    let mut by_serial: BTreeMap<&str, Vec<&LogRecord>> = BTreeMap::new();
    for record in records {
        by_serial.entry(record.serial.as_str()).or_default().push(record);
    }

    let cameras = by_serial
        .into_iter()
        .filter_map(|(serial, rows)| camera_diagnostics(serial, &rows, critical_interval_s))
        .collect();
    RecordingReport {
        total_rows: records.len() as u64,
        critical_interval_s,
        cameras,
    }
}

fn camera_diagnostics(
    serial: &str,
    rows: &[&LogRecord],
    critical_interval_s: f64,
) -> Option<CameraDiagnostics> {
    let first = rows.first()?;
    let last = rows.last()?;

    let intervals: Vec<f64> = rows
        .windows(2)
        .map(|pair| pair[1].timestamp_ns.saturating_sub(pair[0].timestamp_ns) as f64 / 1e9)
        .collect();
    let dropped_frames = rows
        .windows(2)
        .map(|pair| {
            pair[1]
                .frame_id
                .saturating_sub(pair[0].frame_id)
                .saturating_sub(1)
        })
        .sum();
    let mean_interval = if intervals.is_empty() {
        0.0
    } else {
        intervals.iter().sum::<f64>() / intervals.len() as f64
    };

    Some(CameraDiagnostics {
        serial: serial.to_string(),
        identity: first.identity,
        frames_recorded: rows.len() as u64,
        first_frame_id: first.frame_id,
        last_frame_id: last.frame_id,
        duration_s: last.timestamp_ns.saturating_sub(first.timestamp_ns) as f64 / 1e9,
        mean_fps: if mean_interval > 0.0 {
            1.0 / mean_interval
        } else {
            0.0
        },
        min_interval_s: intervals.iter().copied().reduce(f64::min),
        max_interval_s: intervals.iter().copied().reduce(f64::max),
        critical_frames: intervals
            .iter()
            .filter(|&&interval| interval > critical_interval_s)
            .count() as u64,
        dropped_frames,
    })
}

impl std::fmt::Display for RecordingReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "{} log rows, {} camera(s)", self.total_rows, self.cameras.len())?;
        for camera in &self.cameras {
            writeln!(f)?;
            writeln!(f, "Serial number: {} (file {})", camera.serial, camera.identity)?;
            writeln!(
                f,
                "  Frames recorded: {} (ids {}..={})",
                camera.frames_recorded, camera.first_frame_id, camera.last_frame_id
            )?;
            writeln!(f, "  Recording duration: {:.2} sec", camera.duration_s)?;
            writeln!(f, "  Average FPS: {:.2}", camera.mean_fps)?;
            if let (Some(min), Some(max)) = (camera.min_interval_s, camera.max_interval_s) {
                writeln!(
                    f,
                    "  Inter-frame interval: {:.2} ms .. {:.2} ms",
                    min * 1e3,
                    max * 1e3
                )?;
            }
            writeln!(
                f,
                "  Critical frames (> {:.0} ms): {}",
                self.critical_interval_s * 1e3,
                camera.critical_frames
            )?;
            writeln!(f, "  Dropped frames: {}", camera.dropped_frames)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(serial: &str, identity: usize, frame_id: u64, timestamp_ms: u64) -> LogRecord {
        LogRecord {
            frame_id,
            timestamp_ns: timestamp_ms * 1_000_000,
            serial: serial.to_string(),
            identity,
            system_time_ns: None,
        }
    }

    #[test]
    fn per_camera_statistics() {
        let records = vec![
            row("B", 1, 0, 0),
            row("A", 0, 10, 0),
            row("B", 1, 1, 10),
            row("A", 0, 11, 10),
            row("B", 1, 2, 20),
            row("A", 0, 14, 60),
            row("B", 1, 3, 30),
        ];
        let report = analyze(&records, DEFAULT_CRITICAL_INTERVAL_S);
        assert_eq!(report.total_rows, 7);
        assert_eq!(report.cameras.len(), 2);

        let a = &report.cameras[0];
        assert_eq!(a.serial, "A");
        assert_eq!(a.frames_recorded, 3);
        assert_eq!(a.dropped_frames, 2);
        assert_eq!(a.critical_frames, 1);
        assert!((a.duration_s - 0.06).abs() < 1e-9);
        assert!((a.mean_fps - 1.0 / 0.03).abs() < 1e-6);

        let b = &report.cameras[1];
        assert_eq!(b.identity, 1);
        assert_eq!(b.dropped_frames, 0);
        assert_eq!(b.critical_frames, 0);
        assert!((b.mean_fps - 100.0).abs() < 1e-6);
        assert!(report.to_string().contains("Serial number: B (file 1)"));
    }

    #[test]
    fn single_row_camera_has_no_rate() {
        let report = analyze(&[row("solo", 0, 5, 100)], DEFAULT_CRITICAL_INTERVAL_S);
        let camera = &report.cameras[0];
        assert_eq!(camera.mean_fps, 0.0);
        assert_eq!(camera.min_interval_s, None);
        assert_eq!(camera.duration_s, 0.0);
    }
}
