//! Output files of a recording session.
//!
//! - one binary scratch file per camera: raw, undelimited concatenation of
//!   fixed-size frame payloads
//! - one shared CSV timing log, one row per written frame
//! - one JSON metadata record describing frame geometry and devices

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::device::{PixelFormat, TriggerRole};

const CHECK_FILE: &str = ".syncrec_write_check";

/// Column headers of the shared log.
pub const LOG_HEADER: [&str; 4] = ["FrameID", "Timestamp", "SerialNumber", "FileNumber"];
pub const SYSTEM_TIME_HEADER: &str = "SystemTimeNanoseconds";

/// Local-time stamp shared by every file of one session.
pub fn session_stamp() -> String {
    chrono::Local::now().format("%Y%m%d_%H%M%S").to_string()
}

pub fn binary_file_name(stamp: &str, serial: &str, identity: usize) -> String {
    format!("{}_{}_file{}.tmp", stamp, serial, identity)
}

pub fn log_file_name(stamp: &str) -> String {
    format!("{}.csv", stamp)
}

pub fn metadata_file_name(stamp: &str) -> String {
    format!("{}_metadata.json", stamp)
}

/// Create `dir` if needed and prove a file can be written inside it.
pub fn check_write_permission(dir: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dir)?;
    let scratch = dir.join(CHECK_FILE);
    let mut file = File::create(&scratch)?;
    file.write_all(b"check")?;
    drop(file);
    std::fs::remove_file(&scratch)
}

/// Append-only frame payload file owned by exactly one worker.
pub struct BinarySink {
    path: PathBuf,
    writer: BufWriter<File>,
    frames: u64,
    bytes: u64,
}

impl BinarySink {
    pub fn create(path: impl Into<PathBuf>) -> std::io::Result<Self> {
        let path = path.into();
        let file = File::create(&path)?;
        Ok(Self {
            path,
            writer: BufWriter::with_capacity(1 << 20, file),
            frames: 0,
            bytes: 0,
        })
    }

    /// Append one payload and hand it to the OS before returning, so a full
    /// or failing disk is reported for this frame and not at [`Self::finish`].
    pub fn write_frame(&mut self, payload: &[u8]) -> std::io::Result<()> {
        self.writer.write_all(payload)?;
        self.writer.flush()?;
        self.frames += 1;
        self.bytes += payload.len() as u64;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Flush and sync to disk. Returns the number of bytes written.
    pub fn finish(mut self) -> std::io::Result<u64> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        Ok(self.bytes)
    }
}

/// One row of the shared log.
#[derive(Debug, Clone, Copy)]
pub struct LogRow<'a> {
    pub frame_id: u64,
    pub timestamp_ns: u64,
    pub serial: &'a str,
    pub identity: usize,
}

/// Shared CSV timing log. Callers serialize access.
pub struct LogSink {
    path: PathBuf,
    writer: csv::Writer<File>,
    system_time: bool,
    rows: u64,
}

impl LogSink {
    /// Create the log and write its header.
    pub fn create(path: impl Into<PathBuf>, system_time: bool) -> csv::Result<Self> {
        let path = path.into();
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_path(&path)?;
        let mut header: Vec<&str> = LOG_HEADER.to_vec();
        if system_time {
            header.push(SYSTEM_TIME_HEADER);
        }
        writer.write_record(&header)?;
        Ok(Self {
            path,
            writer,
            system_time,
            rows: 0,
        })
    }

    pub fn append(&mut self, row: &LogRow<'_>) -> csv::Result<()> {
        let mut record = vec![
            row.frame_id.to_string(),
            row.timestamp_ns.to_string(),
            row.serial.to_string(),
            row.identity.to_string(),
        ];
        if self.system_time {
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|elapsed| u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX))
                .unwrap_or(0);
            record.push(now.to_string());
        }
        self.writer.write_record(&record)?;
        self.rows += 1;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn rows(&self) -> u64 {
        self.rows
    }

    pub fn finish(mut self) -> std::io::Result<u64> {
        self.writer.flush()?;
        Ok(self.rows)
    }
}

/// A parsed row of the shared log.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct LogRecord {
    #[serde(rename = "FrameID")]
    pub frame_id: u64,
    #[serde(rename = "Timestamp")]
    pub timestamp_ns: u64,
    #[serde(rename = "SerialNumber")]
    pub serial: String,
    #[serde(rename = "FileNumber")]
    pub identity: usize,
    #[serde(rename = "SystemTimeNanoseconds", default)]
    pub system_time_ns: Option<u64>,
}

pub fn read_log(path: &Path) -> Result<Vec<LogRecord>> {
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("failed to open log {}", path.display()))?;
    let mut records = Vec::new();
    for (line, row) in reader.deserialize().enumerate() {
        let record: LogRecord =
            row.with_context(|| format!("{}: bad row {}", path.display(), line + 2))?;
        records.push(record);
    }
    Ok(records)
}

/// Per-device entry of the session metadata record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceEntry {
    pub identity: usize,
    pub serial: String,
    pub model: String,
    pub role: TriggerRole,
    pub binary_file: String,
    pub width: u32,
    pub height: u32,
    pub frame_rate: f64,
}

/// Frame geometry and device table written next to the recording.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub stamp: String,
    pub library_version: String,
    /// Frame rate applied to the primary.
    pub frame_rate: f64,
    pub exposure_us: f64,
    pub width: u32,
    pub height: u32,
    pub pixel_format: PixelFormat,
    pub bytes_per_pixel: usize,
    pub buffer_depth: u32,
    pub log_file: String,
    pub devices: Vec<DeviceEntry>,
}

impl SessionRecord {
    pub fn frame_size(&self) -> usize {
        self.pixel_format.frame_size(self.width, self.height)
    }

    pub fn device(&self, identity: usize) -> Option<&DeviceEntry> {
        self.devices.iter().find(|entry| entry.identity == identity)
    }

    pub fn write(&self, path: &Path) -> std::io::Result<()> {
        let json = serde_json::to_vec_pretty(self).map_err(std::io::Error::from)?;
        std::fs::write(path, json)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read metadata {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("invalid metadata {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_names_follow_stamp() {
        assert_eq!(
            binary_file_name("20240101_120000", "1932", 2),
            "20240101_120000_1932_file2.tmp"
        );
        assert_eq!(log_file_name("20240101_120000"), "20240101_120000.csv");
        assert_eq!(session_stamp().len(), 15);
    }

    #[test]
    fn log_rows_match_header_width() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("log.csv");
        let mut sink = LogSink::create(&path, true)?;
        for frame_id in 0..3 {
            sink.append(&LogRow {
                frame_id,
                timestamp_ns: 1000 * frame_id,
                serial: "cam-a",
                identity: 1,
            })?;
        }
        assert_eq!(sink.finish()?, 3);

        let raw = std::fs::read_to_string(&path)?;
        let mut lines = raw.lines();
        assert_eq!(
            lines.next(),
            Some("FrameID,Timestamp,SerialNumber,FileNumber,SystemTimeNanoseconds")
        );
        assert!(lines.all(|line| line.split(',').count() == 5));

        let records = read_log(&path)?;
        assert_eq!(records.len(), 3);
        assert_eq!(records[2].timestamp_ns, 2000);
        assert!(records[0].system_time_ns.is_some());
        Ok(())
    }

    #[test]
    fn binary_sink_concatenates_payloads() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut sink = BinarySink::create(dir.path().join("cam.tmp"))?;
        sink.write_frame(&[1, 2, 3])?;
        sink.write_frame(&[4, 5, 6])?;
        let path = sink.path().to_path_buf();
        // Written frames are visible before finish.
        assert_eq!(std::fs::metadata(&path)?.len(), 6);
        assert_eq!(sink.finish()?, 6);
        assert_eq!(std::fs::read(path)?, vec![1, 2, 3, 4, 5, 6]);
        Ok(())
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn full_disk_fails_the_frame_write() -> Result<()> {
        let mut sink = BinarySink::create("/dev/full")?;
        assert!(sink.write_frame(&[0; 64]).is_err());
        assert_eq!(sink.frames(), 0);
        assert_eq!(sink.bytes(), 0);
        Ok(())
    }

    #[test]
    fn write_check_rejects_path_under_file() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let file = dir.path().join("plain");
        std::fs::write(&file, b"x")?;
        assert!(check_write_permission(&file.join("out")).is_err());
        check_write_permission(&dir.path().join("new/out"))?;
        assert!(!dir.path().join("new/out").join(CHECK_FILE).exists());
        Ok(())
    }
}
