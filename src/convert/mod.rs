//! Binary scratch file to video conversion.
//!
//! A binary file is split back into fixed-size frames using the geometry from
//! the session metadata record, then streamed into a [`VideoEncoder`] in
//! bounded segments. Frames are never accumulated in memory.

use anyhow::{anyhow, Context, Result};
use std::fs::File;
use std::io::{BufReader, Cursor, Read};
use std::path::{Path, PathBuf};

use crate::device::PixelFormat;
use crate::sink::SessionRecord;

#[cfg(feature = "encode-ffmpeg")]
pub mod ffmpeg;

pub const DEFAULT_SEGMENT_FRAMES: u64 = 5000;
pub const DEFAULT_SEGMENT_BYTES: u64 = 4 << 30;

/// Geometry needed to split and encode one binary file.
#[derive(Clone, Debug, PartialEq)]
pub struct FrameGeometry {
    pub width: u32,
    pub height: u32,
    pub pixel_format: PixelFormat,
    pub frame_rate: f64,
}

impl FrameGeometry {
    pub fn frame_size(&self) -> usize {
        self.pixel_format.frame_size(self.width, self.height)
    }

    /// Geometry of the device that wrote `binary_file`, falling back to the
    /// session-wide values.
    pub fn from_record(record: &SessionRecord, binary_file: Option<&str>) -> Self {
        let device = binary_file
            .and_then(|name| record.devices.iter().find(|entry| entry.binary_file == name));
        match device {
            Some(entry) => Self {
                width: entry.width,
                height: entry.height,
                pixel_format: record.pixel_format,
                frame_rate: entry.frame_rate,
            },
            None => Self {
                width: record.width,
                height: record.height,
                pixel_format: record.pixel_format,
                frame_rate: record.frame_rate,
            },
        }
    }

    /// Parse the older `key=value` metadata file (`Framerate`, `ImageHeight`,
    /// `ImageWidth`, `ColorVideo`).
    pub fn from_legacy_metadata(raw: &str) -> Result<Self> {
        let mut frame_rate = None;
        let mut width = None;
        let mut height = None;
        let mut color = false;
        for line in raw.lines() {
            let line: String = line.chars().filter(|c| !c.is_whitespace()).collect();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            match key {
                "Framerate" => frame_rate = Some(parse_number(key, value)?),
                "ImageWidth" => width = Some(parse_number(key, value)? as u32),
                "ImageHeight" => height = Some(parse_number(key, value)? as u32),
                "ColorVideo" => color = parse_number(key, value)? == 1.0,
                _ => log::debug!("ignoring metadata key {}", key),
            }
        }
        let geometry = Self {
            width: width.ok_or_else(|| anyhow!("metadata is missing ImageWidth"))?,
            height: height.ok_or_else(|| anyhow!("metadata is missing ImageHeight"))?,
            pixel_format: PixelFormat::from_color(color),
            frame_rate: frame_rate.ok_or_else(|| anyhow!("metadata is missing Framerate"))?,
        };
        geometry.validate()?;
        Ok(geometry)
    }

    pub fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(anyhow!("frame dimensions must be non-zero"));
        }
        if !(self.frame_rate.is_finite() && self.frame_rate > 0.0) {
            return Err(anyhow!("frame rate must be greater than zero"));
        }
        Ok(())
    }
}

fn parse_number(key: &str, value: &str) -> Result<f64> {
    value
        .parse()
        .map_err(|_| anyhow!("invalid value for {}: '{}'", key, value))
}

/// Sequential fixed-size chunk reader over a binary scratch file.
pub struct FrameReader<R: Read> {
    reader: R,
    buffer: Vec<u8>,
    frames_read: u64,
    trailing_bytes: u64,
}

impl FrameReader<BufReader<File>> {
    pub fn open(path: &Path, frame_size: usize) -> std::io::Result<Self> {
        let file = File::open(path)?;
        Ok(Self::new(BufReader::with_capacity(1 << 20, file), frame_size))
    }
}

impl<R: Read> FrameReader<R> {
    pub fn new(reader: R, frame_size: usize) -> Self {
        Self {
            reader,
            buffer: vec![0; frame_size],
            frames_read: 0,
            trailing_bytes: 0,
        }
    }

    /// Next complete frame, or `None` at end of input. A trailing partial
    /// chunk is counted in [`Self::trailing_bytes`] and discarded.
    pub fn next_frame(&mut self) -> std::io::Result<Option<&[u8]>> {
        let mut filled = 0;
        while filled < self.buffer.len() {
            match self.reader.read(&mut self.buffer[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        if filled == 0 || self.buffer.is_empty() {
            return Ok(None);
        }
        if filled < self.buffer.len() {
            self.trailing_bytes = filled as u64;
            return Ok(None);
        }
        self.frames_read += 1;
        Ok(Some(&self.buffer))
    }

    pub fn frames_read(&self) -> u64 {
        self.frames_read
    }

    pub fn trailing_bytes(&self) -> u64 {
        self.trailing_bytes
    }
}

/// When to close the current output segment and open the next.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SegmentPolicy {
    pub max_frames: u64,
    /// Limit on frame payload bytes per segment.
    pub max_bytes: u64,
}

impl Default for SegmentPolicy {
    fn default() -> Self {
        Self {
            max_frames: DEFAULT_SEGMENT_FRAMES,
            max_bytes: DEFAULT_SEGMENT_BYTES,
        }
    }
}

impl SegmentPolicy {
    /// True when a segment holding `frames` frames and `bytes` payload bytes
    /// cannot take another frame of `next` bytes. An empty segment always can.
    pub fn is_full(&self, frames: u64, bytes: u64, next: u64) -> bool {
        frames > 0 && (frames >= self.max_frames || bytes + next > self.max_bytes)
    }
}

/// Output container writer. One segment is open at a time.
pub trait VideoEncoder {
    /// File extension of produced segments, without the dot.
    fn extension(&self) -> &'static str;
    fn open_segment(&mut self, path: &Path, geometry: &FrameGeometry) -> Result<()>;
    fn append(&mut self, frame: &[u8]) -> Result<()>;
    fn finish_segment(&mut self) -> Result<()>;
}

/// YUV4MPEG2 writer. Mono frames are written as `Cmono`; Bayer frames are
/// demosaiced and written as `C444`.
#[derive(Default)]
pub struct Y4mEncoder {
    encoder: Option<y4m::Encoder<File>>,
    geometry: Option<FrameGeometry>,
    rgb: Vec<u8>,
    planes: Vec<u8>,
}

impl Y4mEncoder {
    pub fn new() -> Self {
        Self::default()
    }
}

impl VideoEncoder for Y4mEncoder {
    fn extension(&self) -> &'static str {
        "y4m"
    }

    fn open_segment(&mut self, path: &Path, geometry: &FrameGeometry) -> Result<()> {
        let file =
            File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
        let colorspace = match geometry.pixel_format {
            PixelFormat::Mono8 => y4m::Colorspace::Cmono,
            PixelFormat::BayerRG8 => y4m::Colorspace::C444,
        };
        let encoder = y4m::encode(
            geometry.width as usize,
            geometry.height as usize,
            frame_rate_ratio(geometry.frame_rate),
        )
        .with_pixel_aspect(y4m::Ratio::new(1, 1))
        .with_colorspace(colorspace)
        .write_header(file)
        .with_context(|| format!("failed writing header of {}", path.display()))?;
        self.encoder = Some(encoder);
        self.geometry = Some(geometry.clone());
        Ok(())
    }

    fn append(&mut self, frame: &[u8]) -> Result<()> {
        let (Some(encoder), Some(geometry)) = (self.encoder.as_mut(), self.geometry.as_ref())
        else {
            return Err(anyhow!("no open segment"));
        };
        if frame.len() != geometry.frame_size() {
            return Err(anyhow!(
                "frame of {} bytes does not match {}x{}",
                frame.len(),
                geometry.width,
                geometry.height
            ));
        }
        match geometry.pixel_format {
            PixelFormat::Mono8 => {
                encoder.write_frame(&y4m::Frame::new([frame, &[], &[]], None))?;
            }
            PixelFormat::BayerRG8 => {
                demosaic_rggb(frame, geometry.width, geometry.height, &mut self.rgb)?;
                rgb_to_yuv444_planes(&self.rgb, &mut self.planes);
                let plane = self.rgb.len() / 3;
                let (y, chroma) = self.planes.split_at(plane);
                let (u, v) = chroma.split_at(plane);
                encoder.write_frame(&y4m::Frame::new([y, u, v], None))?;
            }
        }
        Ok(())
    }

    fn finish_segment(&mut self) -> Result<()> {
        // Frames go straight to the file; dropping the encoder closes it.
        self.encoder = None;
        Ok(())
    }
}

/// Whole rates as `N:1`, anything else with millihertz precision.
fn frame_rate_ratio(rate: f64) -> y4m::Ratio {
    if (rate - rate.round()).abs() < 1e-9 {
        y4m::Ratio::new(rate.round().max(1.0) as usize, 1)
    } else {
        y4m::Ratio::new((rate * 1000.0).round().max(1.0) as usize, 1000)
    }
}

/// Interleaved RGB8 from an RGGB mosaic.
fn demosaic_rggb(mosaic: &[u8], width: u32, height: u32, rgb: &mut Vec<u8>) -> Result<()> {
    let (w, h) = (width as usize, height as usize);
    rgb.resize(w * h * 3, 0);
    let mut dst = bayer::RasterMut::new(w, h, bayer::RasterDepth::Depth8, rgb);
    bayer::run_demosaic(
        &mut Cursor::new(mosaic),
        bayer::BayerDepth::Depth8,
        bayer::CFA::RGGB,
        bayer::Demosaic::Linear,
        &mut dst,
    )
    .map_err(|e| anyhow!("demosaic failed: {:?}", e))
}

/// Planar BT.601 Y, Cb, Cr from interleaved RGB8.
fn rgb_to_yuv444_planes(rgb: &[u8], planes: &mut Vec<u8>) {
    let plane = rgb.len() / 3;
    planes.resize(plane * 3, 0);
    for (i, px) in rgb.chunks_exact(3).enumerate() {
        let (r, g, b) = (i32::from(px[0]), i32::from(px[1]), i32::from(px[2]));
        planes[i] = (((66 * r + 129 * g + 25 * b + 128) >> 8) + 16) as u8;
        planes[plane + i] = (((-38 * r - 74 * g + 112 * b + 128) >> 8) + 128) as u8;
        planes[2 * plane + i] = (((112 * r - 94 * g - 18 * b + 128) >> 8) + 128) as u8;
    }
}

/// Result of converting one binary file.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversionSummary {
    pub input: PathBuf,
    pub segments: Vec<PathBuf>,
    pub frames: u64,
    pub trailing_bytes: u64,
}

/// `<stem>_<part>.<ext>` inside `output_dir`, parts numbered from 1.
pub fn segment_path(output_dir: &Path, input: &Path, part: usize, extension: &str) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "video".to_string());
    output_dir.join(format!("{}_{}.{}", stem, part, extension))
}

/// Re-encode one binary file into one or more segments.
pub fn convert_file<F>(
    input: &Path,
    output_dir: &Path,
    geometry: &FrameGeometry,
    policy: &SegmentPolicy,
    encoder: &mut dyn VideoEncoder,
    mut on_frame: F,
) -> Result<ConversionSummary>
where
    F: FnMut(u64),
{
    geometry.validate()?;
    let frame_size = geometry.frame_size();
    let mut reader = FrameReader::open(input, frame_size)
        .with_context(|| format!("failed to open {}", input.display()))?;

    let mut segments = Vec::new();
    let mut segment_frames = 0u64;
    let mut segment_bytes = 0u64;
    while let Some(frame) = reader
        .next_frame()
        .with_context(|| format!("failed reading {}", input.display()))?
    {
        let next = frame.len() as u64;
        if segments.is_empty() || policy.is_full(segment_frames, segment_bytes, next) {
            if !segments.is_empty() {
                encoder.finish_segment()?;
            }
            let path = segment_path(output_dir, input, segments.len() + 1, encoder.extension());
            log::info!("writing {}", path.display());
            encoder.open_segment(&path, geometry)?;
            segments.push(path);
            segment_frames = 0;
            segment_bytes = 0;
        }
        encoder.append(frame)?;
        segment_frames += 1;
        segment_bytes += next;
        on_frame(reader.frames_read());
    }
    if !segments.is_empty() {
        encoder.finish_segment()?;
    }

    if reader.trailing_bytes() > 0 {
        log::warn!(
            "{}: discarded {} trailing bytes (not a whole {}-byte frame)",
            input.display(),
            reader.trailing_bytes(),
            frame_size
        );
    }
    Ok(ConversionSummary {
        input: input.to_path_buf(),
        segments,
        frames: reader.frames_read(),
        trailing_bytes: reader.trailing_bytes(),
    })
}
