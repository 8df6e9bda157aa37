use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use tempfile::Builder;

use syncrec::capture::{LockScope, TimeoutPolicy};
use syncrec::RigConfig;

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "SYNCREC_CONFIG",
        "SYNCREC_PRIMARY_SERIAL",
        "SYNCREC_OUTPUT_DIR",
        "SYNCREC_SOURCE",
        "SYNCREC_FRAME_RATE",
        "SYNCREC_EXPOSURE_US",
        "SYNCREC_BUFFER_DEPTH",
    ] {
        std::env::remove_var(key);
    }
}

fn config_file(suffix: &str, contents: &str) -> tempfile::NamedTempFile {
    let mut file = Builder::new().suffix(suffix).tempfile().expect("temp config");
    file.write_all(contents.as_bytes()).expect("write config");
    file
}

#[test]
fn flat_file_loads_with_defaults() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = config_file(
        ".txt",
        "triggerCam = 19061245\nFPS = 200\nnumBuffers = 100\npath = /tmp/rec\n",
    );
    let cfg = RigConfig::load(Some(file.path())).expect("load config");
    assert_eq!(cfg.primary_serial, "19061245");
    assert_eq!(cfg.frame_rate, 200.0);
    assert_eq!(cfg.buffer_depth, 100);
    assert_eq!(cfg.output_dir, PathBuf::from("/tmp/rec"));
    assert_eq!(cfg.exposure_us, 5000.0);
    assert_eq!(cfg.resize_factor, 1);
    assert_eq!(cfg.frame_timeout, Duration::from_millis(1000));
    assert_eq!(cfg.timeout_policy, TimeoutPolicy::Retry);
    assert_eq!(cfg.lock_scope, LockScope::LogRow);
    assert!(!cfg.color);
}

#[test]
fn toml_file_from_env_with_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = config_file(
        ".toml",
        r#"
primary_serial = "20323052"
frame_rate = 120.0
exposure_us = 4000.0
buffer_depth = 64
color = true
frame_timeout_ms = 250
timeout_policy = "abort:4"
lock_scope = "frame"
source = "stub://4"
"#,
    );
    std::env::set_var("SYNCREC_CONFIG", file.path());
    std::env::set_var("SYNCREC_PRIMARY_SERIAL", "sim-0002");
    std::env::set_var("SYNCREC_FRAME_RATE", "90");

    let cfg = RigConfig::load(None).expect("load config");
    assert_eq!(cfg.primary_serial, "sim-0002");
    assert_eq!(cfg.frame_rate, 90.0);
    assert_eq!(cfg.exposure_us, 4000.0);
    assert_eq!(cfg.buffer_depth, 64);
    assert!(cfg.color);
    assert_eq!(cfg.frame_timeout, Duration::from_millis(250));
    assert_eq!(cfg.timeout_policy, TimeoutPolicy::AbortAfter(4));
    assert_eq!(cfg.lock_scope, LockScope::Frame);
    assert_eq!(cfg.source, "stub://4");

    clear_env();
}

#[test]
fn invalid_values_are_rejected() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let policy = config_file(".toml", "primary_serial = \"1\"\ntimeout_policy = \"sometimes\"\n");
    let err = RigConfig::load(Some(policy.path())).unwrap_err();
    assert!(format!("{:#}", err).contains("timeout policy"));

    let unknown = config_file(".toml", "primary_serial = \"1\"\nfps = 10\n");
    assert!(RigConfig::load(Some(unknown.path())).is_err());

    let zero = config_file(".txt", "triggerCam=1\nnumBuffers=0\n");
    assert!(RigConfig::load(Some(zero.path())).is_err());

    let ok = config_file(".txt", "triggerCam=1\n");
    std::env::set_var("SYNCREC_BUFFER_DEPTH", "many");
    assert!(RigConfig::load(Some(ok.path())).is_err());

    clear_env();
}

#[test]
fn missing_primary_serial_fails_validation() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = config_file(".txt", "FPS=100\n");
    let err = RigConfig::load(Some(file.path())).unwrap_err();
    assert!(err.to_string().contains("primary camera serial"));

    // Command-line overrides are applied between resolve and validate.
    let mut cfg = RigConfig::resolve(Some(file.path())).expect("resolve config");
    cfg.primary_serial = "sim-0000".to_string();
    assert!(cfg.validate().is_ok());
}
