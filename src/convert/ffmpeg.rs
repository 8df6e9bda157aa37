//! FFmpeg-backed AVI encoder (MJPEG, H.264 or uncompressed).

use anyhow::{anyhow, Context, Result};
use ffmpeg_next as ffmpeg;
use std::path::Path;

use super::{FrameGeometry, VideoEncoder};
use crate::device::PixelFormat;

const H264_BIT_RATE: usize = 1_000_000;
const MJPEG_QSCALE: i32 = 2;
/// Lambda units per quantizer step (libavcodec FF_QP2LAMBDA).
const QP2LAMBDA: i32 = 118;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VideoCodec {
    Mjpeg,
    H264,
    Uncompressed,
}

impl VideoCodec {
    fn id(self) -> ffmpeg::codec::Id {
        match self {
            VideoCodec::Mjpeg => ffmpeg::codec::Id::MJPEG,
            VideoCodec::H264 => ffmpeg::codec::Id::H264,
            VideoCodec::Uncompressed => ffmpeg::codec::Id::RAWVIDEO,
        }
    }

    fn pixel(self) -> ffmpeg::format::Pixel {
        match self {
            VideoCodec::Mjpeg => ffmpeg::format::Pixel::YUVJ420P,
            VideoCodec::H264 => ffmpeg::format::Pixel::YUV420P,
            VideoCodec::Uncompressed => ffmpeg::format::Pixel::BGR24,
        }
    }
}

struct Segment {
    output: ffmpeg::format::context::Output,
    encoder: ffmpeg::encoder::Video,
    scaler: ffmpeg::software::scaling::Context,
    source: ffmpeg::frame::Video,
    scaled: ffmpeg::frame::Video,
    time_base: ffmpeg::Rational,
    next_pts: i64,
}

pub struct FfmpegEncoder {
    codec: VideoCodec,
    segment: Option<Segment>,
}

impl FfmpegEncoder {
    pub fn new(codec: VideoCodec) -> Result<Self> {
        ffmpeg::init().context("initialize ffmpeg")?;
        Ok(Self {
            codec,
            segment: None,
        })
    }
}

impl Segment {
    fn drain_packets(&mut self) -> Result<()> {
        let stream_time_base = self
            .output
            .stream(0)
            .map(|stream| stream.time_base())
            .ok_or_else(|| anyhow!("output has no video stream"))?;
        let mut packet = ffmpeg::Packet::empty();
        while self.encoder.receive_packet(&mut packet).is_ok() {
            packet.set_stream(0);
            packet.rescale_ts(self.time_base, stream_time_base);
            packet
                .write_interleaved(&mut self.output)
                .context("write video packet")?;
        }
        Ok(())
    }
}

impl VideoEncoder for FfmpegEncoder {
    fn extension(&self) -> &'static str {
        "avi"
    }

    fn open_segment(&mut self, path: &Path, geometry: &FrameGeometry) -> Result<()> {
        let mut output = ffmpeg::format::output(&path)
            .with_context(|| format!("failed to create {}", path.display()))?;
        let codec = ffmpeg::encoder::find(self.codec.id())
            .ok_or_else(|| anyhow!("ffmpeg has no {:?} encoder", self.codec))?;
        let global_header = output
            .format()
            .flags()
            .contains(ffmpeg::format::Flags::GLOBAL_HEADER);

        let mut stream = output.add_stream(codec).context("add video stream")?;
        let mut encoder = ffmpeg::codec::context::Context::new_with_codec(codec)
            .encoder()
            .video()
            .context("create video encoder")?;
        let rate = ffmpeg::Rational::from(geometry.frame_rate);
        let time_base = rate.invert();
        encoder.set_width(geometry.width);
        encoder.set_height(geometry.height);
        encoder.set_format(self.codec.pixel());
        encoder.set_time_base(time_base);
        encoder.set_frame_rate(Some(rate));
        let mut flags = ffmpeg::codec::Flags::empty();
        match self.codec {
            VideoCodec::H264 => encoder.set_bit_rate(H264_BIT_RATE),
            VideoCodec::Mjpeg => {
                flags |= ffmpeg::codec::Flags::QSCALE;
                encoder.set_global_quality(MJPEG_QSCALE * QP2LAMBDA);
            }
            VideoCodec::Uncompressed => {}
        }
        if global_header {
            flags |= ffmpeg::codec::Flags::GLOBAL_HEADER;
        }
        encoder.set_flags(flags);
        let encoder = encoder.open_as(codec).context("open video encoder")?;
        stream.set_parameters(&encoder);
        stream.set_time_base(time_base);
        output.write_header().context("write container header")?;

        let source_format = match geometry.pixel_format {
            PixelFormat::Mono8 => ffmpeg::format::Pixel::GRAY8,
            PixelFormat::BayerRG8 => ffmpeg::format::Pixel::BAYER_RGGB8,
        };
        let scaler = ffmpeg::software::scaling::Context::get(
            source_format,
            geometry.width,
            geometry.height,
            self.codec.pixel(),
            geometry.width,
            geometry.height,
            ffmpeg::software::scaling::Flags::BILINEAR,
        )
        .context("create ffmpeg scaler")?;

        self.segment = Some(Segment {
            output,
            encoder,
            scaler,
            source: ffmpeg::frame::Video::new(source_format, geometry.width, geometry.height),
            scaled: ffmpeg::frame::Video::empty(),
            time_base,
            next_pts: 0,
        });
        Ok(())
    }

    fn append(&mut self, frame: &[u8]) -> Result<()> {
        let segment = self
            .segment
            .as_mut()
            .ok_or_else(|| anyhow!("no open segment"))?;
        let width = segment.source.width() as usize;
        let height = segment.source.height() as usize;
        if frame.len() != width * height {
            return Err(anyhow!("frame of {} bytes does not match {}x{}", frame.len(), width, height));
        }
        let stride = segment.source.stride(0);
        let plane = segment.source.data_mut(0);
        for (row, line) in frame.chunks_exact(width).enumerate() {
            plane[row * stride..row * stride + width].copy_from_slice(line);
        }

        segment
            .scaler
            .run(&segment.source, &mut segment.scaled)
            .context("convert pixel format")?;
        segment.scaled.set_pts(Some(segment.next_pts));
        segment.next_pts += 1;
        segment
            .encoder
            .send_frame(&segment.scaled)
            .context("encode frame")?;
        segment.drain_packets()
    }

    fn finish_segment(&mut self) -> Result<()> {
        if let Some(mut segment) = self.segment.take() {
            segment.encoder.send_eof().context("flush encoder")?;
            segment.drain_packets()?;
            segment
                .output
                .write_trailer()
                .context("write container trailer")?;
        }
        Ok(())
    }
}
