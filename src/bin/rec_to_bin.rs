//! rec_to_bin - record hardware-triggered frames from every camera to binary files
//!
//! Configures all detected cameras (one primary driving the trigger line, the
//! rest triggered), then streams frames into `<stamp>_<serial>_file<N>.tmp`
//! plus a shared `<stamp>.csv` timing log until Ctrl-C, `--duration` or the
//! frame budget ends the session.
//!
//! Exit status: 0 when every camera recorded cleanly, 1 when some cameras
//! failed, 2 when the session could not run or shared state was lost.

use anyhow::{Context, Result};
use clap::Parser;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use syncrec::device::sim::SimulatedSystem;
use syncrec::{CaptureSession, RigConfig, SessionOutcome};

#[path = "../ui.rs"]
mod ui;

#[derive(Parser, Debug)]
#[command(author, version, about = "Record synchronized frames from all cameras")]
struct Args {
    /// Config file (TOML, or legacy key=value)
    #[arg(long, env = "SYNCREC_CONFIG", value_name = "PATH")]
    config: Option<PathBuf>,
    /// Serial number of the primary (trigger) camera
    #[arg(long)]
    primary_serial: Option<String>,
    /// Output directory for binaries, log and metadata
    #[arg(long, value_name = "DIR")]
    output_dir: Option<PathBuf>,
    /// Camera source (stub://N for the simulated rig)
    #[arg(long)]
    source: Option<String>,
    /// Stop after this many seconds
    #[arg(long, value_name = "SECS")]
    duration: Option<f64>,
    /// Stop each camera after this many written frames
    #[arg(long)]
    max_frames: Option<u64>,
    /// UI mode for stderr progress (auto|plain|pretty)
    #[arg(long, default_value = "auto", value_name = "MODE")]
    ui: String,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let code = match run(Args::parse()) {
        Ok(outcome) => outcome.exit_code(),
        Err(e) => {
            log::error!("{:#}", e);
            eprintln!("rec_to_bin: {:#}", e);
            2
        }
    };
    std::process::exit(code);
}

fn run(args: Args) -> Result<SessionOutcome> {
    let is_tty = std::io::stderr().is_terminal();
    let stdout_is_tty = std::io::stdout().is_terminal();
    let ui = ui::Ui::from_args(Some(&args.ui), is_tty, !stdout_is_tty);

    let config = {
        let _stage = ui.stage("Load configuration");
        let mut config = RigConfig::resolve(args.config.as_deref())?;
        if let Some(serial) = args.primary_serial {
            config.primary_serial = serial;
        }
        if let Some(dir) = args.output_dir {
            config.output_dir = dir;
        }
        if let Some(source) = args.source {
            config.source = source;
        }
        if args.max_frames.is_some() {
            config.max_frames = args.max_frames;
        }
        config.validate()?;
        config
    };
    log::info!(
        "primary {}, {:.1} fps, exposure {:.0} us, {} buffers, output {}",
        config.primary_serial,
        config.frame_rate,
        config.exposure_us,
        config.buffer_depth,
        config.output_dir.display()
    );

    let mut system = SimulatedSystem::from_source(&config.source)
        .with_context(|| format!("failed to open camera source {}", config.source))?;
    let session = CaptureSession::new(config);

    let stop = session.stop_signal();
    ctrlc::set_handler(move || {
        eprintln!("rec_to_bin: stop requested, draining cameras");
        stop.raise();
    })
    .context("failed to install Ctrl-C handler")?;

    let deadline = args.duration.map(|secs| Instant::now() + Duration::from_secs_f64(secs));
    let stop = session.stop_signal();
    let mut counter = ui.counter("recording", None);
    let report = session.run_with_monitor(&mut system, |shared| {
        if deadline.is_some_and(|deadline| Instant::now() >= deadline) && !stop.is_raised() {
            log::info!("recording duration reached");
            stop.raise();
        }
        let per_device: Vec<String> = shared
            .devices()
            .iter()
            .map(|device| format!("{}={}", device.serial, shared.frames_written(device.identity)))
            .collect();
        counter.update(shared.total_frames(), &per_device.join(" "));
    })?;
    counter.finish(&format!("{} frames", report.total_frames()));

    println!("session {}", report.stamp);
    println!("  log: {} ({} rows)", report.log_path.display(), report.log_rows);
    println!("  metadata: {}", report.metadata_path.display());
    for (device, worker) in report.devices.iter().zip(&report.workers) {
        let status = match &worker.outcome {
            Ok(()) => "ok".to_string(),
            Err(e) => format!("FAILED: {}", e),
        };
        println!(
            "  [{}] {} {}: {} frames, {} incomplete, {} timeouts -> {} ({})",
            device.identity,
            device.role,
            device.serial,
            worker.frames_written,
            worker.frames_incomplete,
            worker.timeouts,
            device.binary_path.display(),
            status
        );
    }
    match &report.outcome {
        SessionOutcome::Success => println!("all cameras recorded successfully"),
        SessionOutcome::PartialFailure(failures) => {
            println!("{} camera(s) failed", failures.len())
        }
        SessionOutcome::Fatal(reason) => println!("session failed: {}", reason),
    }
    Ok(report.outcome)
}
