//! log_report - per-camera recording diagnostics from a rec_to_bin timing log
//!
//! Reports frames recorded, duration, mean frame rate, inter-frame intervals
//! over the critical threshold and frame-id gaps for every camera.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;

use syncrec::diagnostics::{self, DEFAULT_CRITICAL_INTERVAL_S};
use syncrec::sink;

#[derive(Parser, Debug)]
#[command(author, version, about = "Recording diagnostics from the CSV timing log")]
struct Args {
    /// CSV log written by rec_to_bin
    log: PathBuf,
    /// Inter-frame interval in milliseconds above which a frame is critical
    #[arg(long, default_value_t = DEFAULT_CRITICAL_INTERVAL_S * 1e3)]
    critical_ms: f64,
    /// Print the report as JSON
    #[arg(long)]
    json: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();

    let records = sink::read_log(&args.log)?;
    let report = diagnostics::analyze(&records, args.critical_ms / 1e3);
    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("Diagnostic report for {}", args.log.display());
        print!("{}", report);
    }
    Ok(())
}
