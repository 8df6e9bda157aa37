use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::capture::{LockScope, TimeoutPolicy};
use crate::device::PixelFormat;

const DEFAULT_FRAME_RATE: f64 = 100.0;
const DEFAULT_EXPOSURE_US: f64 = 5000.0;
const DEFAULT_BUFFER_DEPTH: u32 = 200;
const DEFAULT_OUTPUT_DIR: &str = ".";
const DEFAULT_RESIZE_FACTOR: u32 = 1;
const DEFAULT_FRAME_TIMEOUT_MS: u64 = 1000;
const DEFAULT_SOURCE: &str = "stub://3";

/// Session-wide recording parameters. Read once, immutable for the session.
#[derive(Debug, Clone, PartialEq)]
pub struct RigConfig {
    /// Serial number of the camera driving the trigger line.
    pub primary_serial: String,
    /// Target frame rate in Hz.
    pub frame_rate: f64,
    /// Exposure time in microseconds.
    pub exposure_us: f64,
    /// Device streaming buffer depth; also the number of warmup frames discarded.
    pub buffer_depth: u32,
    /// BayerRG8 when true, Mono8 otherwise.
    pub color: bool,
    pub output_dir: PathBuf,
    /// Integer divisor applied to sensor width and height.
    pub resize_factor: u32,
    pub frame_timeout: Duration,
    pub timeout_policy: TimeoutPolicy,
    pub lock_scope: LockScope,
    /// Append wall-clock nanoseconds to every log row.
    pub log_system_time: bool,
    /// Per-device budget of written frames, after which a worker drains.
    pub max_frames: Option<u64>,
    /// Camera SDK source, `stub://N` for the simulated rig.
    pub source: String,
    /// Force a camera profile by name instead of matching model names.
    pub profile: Option<String>,
}

/// On-disk shape of the config. Both the TOML and the flat `key=value` format
/// land here before defaults are applied.
#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct RigConfigFile {
    pub primary_serial: Option<String>,
    pub frame_rate: Option<f64>,
    pub exposure_us: Option<f64>,
    pub buffer_depth: Option<u32>,
    pub color: Option<bool>,
    pub output_dir: Option<PathBuf>,
    pub resize_factor: Option<u32>,
    pub frame_timeout_ms: Option<u64>,
    pub timeout_policy: Option<String>,
    pub lock_scope: Option<String>,
    pub log_system_time: Option<bool>,
    pub max_frames: Option<u64>,
    pub source: Option<String>,
    pub profile: Option<String>,
}

impl RigConfig {
    /// Defaults for everything but the primary serial and output directory.
    pub fn new(primary_serial: impl Into<String>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            primary_serial: primary_serial.into(),
            frame_rate: DEFAULT_FRAME_RATE,
            exposure_us: DEFAULT_EXPOSURE_US,
            buffer_depth: DEFAULT_BUFFER_DEPTH,
            color: false,
            output_dir: output_dir.into(),
            resize_factor: DEFAULT_RESIZE_FACTOR,
            frame_timeout: Duration::from_millis(DEFAULT_FRAME_TIMEOUT_MS),
            timeout_policy: TimeoutPolicy::default(),
            lock_scope: LockScope::default(),
            log_system_time: false,
            max_frames: None,
            source: DEFAULT_SOURCE.to_string(),
            profile: None,
        }
    }

    /// Load from `path` (or `SYNCREC_CONFIG`), apply environment overrides, validate.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let cfg = Self::resolve(path)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Like [`Self::load`] without validation, for callers that layer
    /// command-line overrides on top.
    pub fn resolve(path: Option<&Path>) -> Result<Self> {
        let env_path = std::env::var("SYNCREC_CONFIG").ok().map(PathBuf::from);
        let file_cfg = match path.map(Path::to_path_buf).or(env_path) {
            Some(path) => read_config_file(&path)?,
            None => RigConfigFile::default(),
        };
        let mut cfg = Self::from_file(file_cfg)?;
        cfg.apply_env()?;
        Ok(cfg)
    }

    pub fn from_file(file: RigConfigFile) -> Result<Self> {
        let timeout_policy = match file.timeout_policy.as_deref() {
            Some(raw) => raw.parse()?,
            None => TimeoutPolicy::default(),
        };
        let lock_scope = match file.lock_scope.as_deref() {
            Some(raw) => raw.parse()?,
            None => LockScope::default(),
        };
        Ok(Self {
            primary_serial: file.primary_serial.unwrap_or_default(),
            frame_rate: file.frame_rate.unwrap_or(DEFAULT_FRAME_RATE),
            exposure_us: file.exposure_us.unwrap_or(DEFAULT_EXPOSURE_US),
            buffer_depth: file.buffer_depth.unwrap_or(DEFAULT_BUFFER_DEPTH),
            color: file.color.unwrap_or(false),
            output_dir: file
                .output_dir
                .unwrap_or_else(|| PathBuf::from(DEFAULT_OUTPUT_DIR)),
            resize_factor: file.resize_factor.unwrap_or(DEFAULT_RESIZE_FACTOR),
            frame_timeout: Duration::from_millis(
                file.frame_timeout_ms.unwrap_or(DEFAULT_FRAME_TIMEOUT_MS),
            ),
            timeout_policy,
            lock_scope,
            log_system_time: file.log_system_time.unwrap_or(false),
            max_frames: file.max_frames,
            source: file.source.unwrap_or_else(|| DEFAULT_SOURCE.to_string()),
            profile: file.profile,
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(serial) = env_nonempty("SYNCREC_PRIMARY_SERIAL") {
            self.primary_serial = serial;
        }
        if let Some(dir) = env_nonempty("SYNCREC_OUTPUT_DIR") {
            self.output_dir = PathBuf::from(dir);
        }
        if let Some(source) = env_nonempty("SYNCREC_SOURCE") {
            self.source = source;
        }
        if let Some(rate) = env_nonempty("SYNCREC_FRAME_RATE") {
            self.frame_rate = rate
                .parse()
                .map_err(|_| anyhow!("SYNCREC_FRAME_RATE must be a number"))?;
        }
        if let Some(exposure) = env_nonempty("SYNCREC_EXPOSURE_US") {
            self.exposure_us = exposure
                .parse()
                .map_err(|_| anyhow!("SYNCREC_EXPOSURE_US must be a number"))?;
        }
        if let Some(depth) = env_nonempty("SYNCREC_BUFFER_DEPTH") {
            self.buffer_depth = depth
                .parse()
                .map_err(|_| anyhow!("SYNCREC_BUFFER_DEPTH must be a positive integer"))?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.primary_serial.trim().is_empty() {
            return Err(anyhow!("primary camera serial (triggerCam) must be set"));
        }
        if !(self.frame_rate.is_finite() && self.frame_rate > 0.0) {
            return Err(anyhow!("frame rate must be greater than zero"));
        }
        if !(self.exposure_us.is_finite() && self.exposure_us > 0.0) {
            return Err(anyhow!("exposure time must be greater than zero"));
        }
        if self.buffer_depth == 0 {
            return Err(anyhow!("buffer depth must be at least 1"));
        }
        if self.resize_factor == 0 {
            return Err(anyhow!("resize factor must be at least 1"));
        }
        if self.frame_timeout.is_zero() {
            return Err(anyhow!("frame timeout must be greater than zero"));
        }
        if let Some(name) = &self.profile {
            if crate::device::CameraProfile::by_name(name).is_none() {
                return Err(anyhow!("unknown camera profile {}", name));
            }
        }
        Ok(())
    }

    pub fn pixel_format(&self) -> PixelFormat {
        PixelFormat::from_color(self.color)
    }
}

fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
}

fn read_config_file(path: &Path) -> Result<RigConfigFile> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let is_toml = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("toml"))
        .unwrap_or(false);
    let parsed = if is_toml {
        toml::from_str(&raw).map_err(anyhow::Error::from)
    } else {
        parse_flat(&raw)
    };
    parsed.with_context(|| format!("invalid config file {}", path.display()))
}

/// Parse the flat `key=value` format. Whitespace is ignored everywhere, `#`
/// starts a comment line, unknown keys are logged and skipped.
pub fn parse_flat(raw: &str) -> Result<RigConfigFile> {
    let mut pairs = BTreeMap::new();
    for line in raw.lines() {
        let line: String = line.chars().filter(|c| !c.is_whitespace()).collect();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            return Err(anyhow!("expected key=value, got '{}'", line));
        };
        pairs.insert(key.to_string(), value.to_string());
    }

    let mut file = RigConfigFile::default();
    for (key, value) in pairs {
        match key.as_str() {
            "triggerCam" | "primary_serial" => file.primary_serial = Some(value),
            "FPS" | "frame_rate" => file.frame_rate = Some(parse_value(&key, &value)?),
            "exposureTime" | "exposure_us" => file.exposure_us = Some(parse_value(&key, &value)?),
            "numBuffers" | "buffer_depth" => {
                file.buffer_depth = Some(parse_whole(&key, &value)?)
            }
            "color" => file.color = Some(parse_flag(&key, &value)?),
            "path" | "output_dir" => file.output_dir = Some(PathBuf::from(value)),
            "compression" | "resize_factor" => {
                file.resize_factor = Some(parse_whole(&key, &value)?)
            }
            "timeoutMs" | "frame_timeout_ms" => {
                file.frame_timeout_ms = Some(parse_whole(&key, &value)?)
            }
            "timeoutPolicy" | "timeout_policy" => file.timeout_policy = Some(value),
            "lockScope" | "lock_scope" => file.lock_scope = Some(value),
            "systemTime" | "log_system_time" => {
                file.log_system_time = Some(parse_flag(&key, &value)?)
            }
            "maxFrames" | "max_frames" => file.max_frames = Some(parse_whole(&key, &value)?),
            "source" => file.source = Some(value),
            "profile" => file.profile = Some(value),
            other => log::warn!("ignoring unknown config key {}", other),
        }
    }
    Ok(file)
}

fn parse_value<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| anyhow!("invalid value for {}: '{}'", key, value))
}

/// Integers written as `2` or `2.0` are both accepted.
fn parse_whole<T: TryFrom<u64>>(key: &str, value: &str) -> Result<T> {
    let whole = match value.parse::<u64>() {
        Ok(v) => v,
        Err(_) => {
            let float: f64 = parse_value(key, value)?;
            if float < 0.0 || float.fract() != 0.0 {
                return Err(anyhow!("{} must be a whole number, got '{}'", key, value));
            }
            float as u64
        }
    };
    T::try_from(whole).map_err(|_| anyhow!("{} out of range: '{}'", key, value))
}

fn parse_flag(key: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Ok(true),
        "0" | "false" | "no" => Ok(false),
        _ => Err(anyhow!("invalid flag for {}: '{}'", key, value)),
    }
}
