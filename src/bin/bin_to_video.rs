//! bin_to_video - re-encode binary scratch files into playable video segments

use anyhow::{anyhow, Context, Result};
use clap::{Parser, ValueEnum};
use std::io::IsTerminal;
use std::path::{Path, PathBuf};

use syncrec::convert::{self, FrameGeometry, SegmentPolicy, VideoEncoder, Y4mEncoder};
use syncrec::sink::{self, SessionRecord};

#[path = "../ui.rs"]
mod ui;

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Codec {
    /// YUV4MPEG2, no external libraries
    Y4m,
    /// Motion JPEG AVI (needs the encode-ffmpeg feature)
    Mjpeg,
    /// H.264 AVI (needs the encode-ffmpeg feature)
    H264,
    /// Uncompressed AVI (needs the encode-ffmpeg feature)
    Raw,
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Convert binary recordings to video")]
struct Args {
    /// Binary files written by rec_to_bin
    #[arg(required = true, value_name = "FILE")]
    inputs: Vec<PathBuf>,
    /// Session metadata (`<stamp>_metadata.json`, or a legacy key=value file).
    /// Defaults to the metadata file next to the first input.
    #[arg(long, value_name = "PATH")]
    metadata: Option<PathBuf>,
    /// Directory for the video segments (defaults to the input's directory)
    #[arg(long, value_name = "DIR")]
    output_dir: Option<PathBuf>,
    #[arg(long, value_enum, default_value_t = Codec::Y4m)]
    codec: Codec,
    /// Frames per output segment
    #[arg(long, default_value_t = convert::DEFAULT_SEGMENT_FRAMES)]
    segment_frames: u64,
    /// Frame payload bytes per output segment
    #[arg(long, default_value_t = convert::DEFAULT_SEGMENT_BYTES)]
    segment_bytes: u64,
    /// UI mode for stderr progress (auto|plain|pretty)
    #[arg(long, default_value = "auto", value_name = "MODE")]
    ui: String,
}

enum Metadata {
    Session(SessionRecord),
    Legacy(FrameGeometry),
}

impl Metadata {
    fn load(path: &Path) -> Result<Self> {
        let is_json = path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("json"))
            .unwrap_or(false);
        if is_json {
            return Ok(Metadata::Session(SessionRecord::load(path)?));
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read metadata {}", path.display()))?;
        Ok(Metadata::Legacy(FrameGeometry::from_legacy_metadata(&raw)?))
    }

    fn geometry_for(&self, input: &Path) -> FrameGeometry {
        match self {
            Metadata::Session(record) => {
                let name = input.file_name().and_then(|name| name.to_str());
                FrameGeometry::from_record(record, name)
            }
            Metadata::Legacy(geometry) => geometry.clone(),
        }
    }
}

/// `<stamp>_<serial>_file<N>.tmp` -> `<dir>/<stamp>_metadata.json`
fn default_metadata_path(input: &Path) -> Result<PathBuf> {
    let name = input
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| anyhow!("cannot derive metadata path from {}", input.display()))?;
    let stamp = name
        .splitn(3, '_')
        .take(2)
        .collect::<Vec<_>>()
        .join("_");
    let dir = input.parent().unwrap_or_else(|| Path::new("."));
    Ok(dir.join(sink::metadata_file_name(&stamp)))
}

fn encoder_for(codec: Codec) -> Result<Box<dyn VideoEncoder>> {
    match codec {
        Codec::Y4m => Ok(Box::new(Y4mEncoder::new())),
        #[cfg(feature = "encode-ffmpeg")]
        Codec::Mjpeg => Ok(Box::new(convert::ffmpeg::FfmpegEncoder::new(
            convert::ffmpeg::VideoCodec::Mjpeg,
        )?)),
        #[cfg(feature = "encode-ffmpeg")]
        Codec::H264 => Ok(Box::new(convert::ffmpeg::FfmpegEncoder::new(
            convert::ffmpeg::VideoCodec::H264,
        )?)),
        #[cfg(feature = "encode-ffmpeg")]
        Codec::Raw => Ok(Box::new(convert::ffmpeg::FfmpegEncoder::new(
            convert::ffmpeg::VideoCodec::Uncompressed,
        )?)),
        #[cfg(not(feature = "encode-ffmpeg"))]
        other => Err(anyhow!(
            "codec {:?} requires building with --features encode-ffmpeg",
            other
        )),
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let is_tty = std::io::stderr().is_terminal();
    let stdout_is_tty = std::io::stdout().is_terminal();
    let ui = ui::Ui::from_args(Some(&args.ui), is_tty, !stdout_is_tty);

    let metadata_path = match &args.metadata {
        Some(path) => path.clone(),
        None => default_metadata_path(&args.inputs[0])?,
    };
    let metadata = {
        let _stage = ui.stage("Load metadata");
        Metadata::load(&metadata_path)?
    };
    let policy = SegmentPolicy {
        max_frames: args.segment_frames.max(1),
        max_bytes: args.segment_bytes.max(1),
    };
    let mut encoder = encoder_for(args.codec)?;

    for input in &args.inputs {
        let output_dir = match &args.output_dir {
            Some(dir) => dir.clone(),
            None => input
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from(".")),
        };
        sink::check_write_permission(&output_dir)
            .with_context(|| format!("output directory {} is not writable", output_dir.display()))?;

        let geometry = metadata.geometry_for(input);
        let frame_size = geometry.frame_size() as u64;
        let total = std::fs::metadata(input)
            .map(|meta| meta.len() / frame_size.max(1))
            .ok();
        let _stage = ui.stage(&format!("Convert {}", input.display()));
        let mut counter = ui.counter("frames", total);
        let summary = convert::convert_file(
            input,
            &output_dir,
            &geometry,
            &policy,
            encoder.as_mut(),
            |frames| {
                if frames % 100 == 0 {
                    counter.update(frames, "");
                }
            },
        )?;
        counter.finish(&format!("{} frames", summary.frames));

        println!(
            "{}: {} frames in {} segment(s)",
            input.display(),
            summary.frames,
            summary.segments.len()
        );
        for segment in &summary.segments {
            println!("  {}", segment.display());
        }
        if summary.trailing_bytes > 0 {
            println!("  {} trailing bytes discarded", summary.trailing_bytes);
        }
    }
    Ok(())
}
