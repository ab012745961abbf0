//! FFmpeg bridge: a pull-based decoder and a fixed-geometry encoder.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use ffmpeg_next as ffmpeg;
use ffmpeg_next::{
    Packet, codec, decoder, encoder, format, frame, media, software::scaling,
    util::rational::Rational,
};
use tracing::{debug, info, warn};

use super::{FrameSink, FrameSource, RgbFrame, StreamInfo};

/// Output pixel format for the encoder (YUV420p is universally compatible).
const ENCODE_FORMAT: format::Pixel = format::Pixel::YUV420P;
/// Scaling flags — bilinear is fast and good enough for the decode→encode path.
const SCALE_FLAGS: scaling::Flags = scaling::Flags::BILINEAR;
/// Used when the container does not advertise a frame rate.
const FALLBACK_FPS: f64 = 30.0;

fn rational_to_f64(r: Rational) -> Option<f64> {
    if r.numerator() > 0 && r.denominator() > 0 {
        Some(r.numerator() as f64 / r.denominator() as f64)
    } else {
        None
    }
}

// ── Source ───────────────────────────────────────────────────────────────────

/// Decodes the best video stream of a container into RGB24 frames, one
/// packet at a time.
pub struct FfmpegSource {
    ictx: format::context::Input,
    decoder: decoder::Video,
    to_rgb: scaling::Context,
    stream_index: usize,
    info: StreamInfo,
    decoded: frame::Video,
    rgb: frame::Video,
    eof_sent: bool,
    closed: bool,
    frames_read: u64,
}

impl FfmpegSource {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        ffmpeg::init().context("failed to initialise FFmpeg")?;

        let path = path.as_ref();
        let ictx = format::input(&path)
            .with_context(|| format!("could not open input file {}", path.display()))?;

        let (stream_index, fps, decoder) = {
            let stream = ictx
                .streams()
                .best(media::Type::Video)
                .context("no video stream found in input")?;
            let fps = rational_to_f64(stream.avg_frame_rate())
                .or_else(|| rational_to_f64(stream.rate()))
                .unwrap_or(FALLBACK_FPS);
            let decoder = codec::context::Context::from_parameters(stream.parameters())
                .context("failed to build decoder context")?
                .decoder()
                .video()
                .context("failed to open video decoder")?;
            (stream.index(), fps, decoder)
        };

        let width = decoder.width();
        let height = decoder.height();
        let src_pixel_fmt = decoder.format();

        info!(width, height, fps, ?src_pixel_fmt, "opened input video stream");

        let to_rgb = scaling::Context::get(
            src_pixel_fmt,
            width,
            height,
            format::Pixel::RGB24,
            width,
            height,
            SCALE_FLAGS,
        )
        .context("failed to create to-RGB scaler")?;

        Ok(Self {
            ictx,
            decoder,
            to_rgb,
            stream_index,
            info: StreamInfo { width, height, fps },
            decoded: frame::Video::empty(),
            rgb: frame::Video::empty(),
            eof_sent: false,
            closed: false,
            frames_read: 0,
        })
    }

    /// Convert the last decoded frame to a compact RGB24 buffer.
    fn take_rgb(&mut self) -> Result<RgbFrame> {
        self.to_rgb
            .run(&self.decoded, &mut self.rgb)
            .context("to-RGB scaling failed")?;

        // Compact to a plain Vec<u8> (remove stride padding if any)
        let width = self.info.width as usize;
        let height = self.info.height as usize;
        let stride = self.rgb.stride(0);
        let raw = self.rgb.data(0);
        let mut data = Vec::with_capacity(width * height * 3);
        for row in 0..height {
            let start = row * stride;
            data.extend_from_slice(&raw[start..start + width * 3]);
        }

        let pts = self.decoded.pts().unwrap_or(self.frames_read as i64);
        self.frames_read += 1;

        Ok(RgbFrame {
            data,
            width: self.info.width,
            height: self.info.height,
            pts,
        })
    }
}

impl FrameSource for FfmpegSource {
    fn info(&self) -> StreamInfo {
        self.info
    }

    fn next_frame(&mut self) -> Result<Option<RgbFrame>> {
        if self.closed {
            return Ok(None);
        }
        loop {
            if self.decoder.receive_frame(&mut self.decoded).is_ok() {
                return self.take_rgb().map(Some);
            }
            if self.eof_sent {
                return Ok(None);
            }

            let mut packet = Packet::empty();
            match packet.read(&mut self.ictx) {
                Ok(()) => {
                    if packet.stream() != self.stream_index {
                        continue;
                    }
                    // A corrupt packet only costs that packet.
                    if let Err(e) = self.decoder.send_packet(&packet) {
                        warn!(error = %e, "decoder rejected packet; skipping");
                    }
                }
                Err(ffmpeg::Error::Eof) => {
                    self.decoder.send_eof().ok();
                    self.eof_sent = true;
                }
                Err(e) => return Err(e).context("failed to read packet from input"),
            }
        }
    }

    fn close(&mut self) -> Result<()> {
        self.closed = true;
        debug!(frames_read = self.frames_read, "input video released");
        Ok(())
    }
}

// ── Sink ─────────────────────────────────────────────────────────────────────

/// Encodes RGB frames of one fixed size into a video file.
///
/// H.264 is preferred; MPEG-4 Part 2 is used when FFmpeg lacks libx264.
/// YUV420P needs even dimensions, so odd sizes are scaled by at most one
/// pixel on the way into the encoder.
pub struct FfmpegWriter {
    octx: format::context::Output,
    encoder: encoder::Video,
    to_yuv: scaling::Context,
    rgb_frame: frame::Video,
    yuv_frame: frame::Video,
    stream_index: usize,
    time_base: Rational,
    width: u32,
    height: u32,
    next_pts: i64,
    finished: bool,
    path: PathBuf,
}

impl FfmpegWriter {
    pub fn create<P: AsRef<Path>>(path: P, width: u32, height: u32, fps: f64) -> Result<Self> {
        ffmpeg::init().context("failed to initialise FFmpeg")?;

        let path = path.as_ref().to_path_buf();
        if width == 0 || height == 0 {
            bail!("cannot open a {width}x{height} video writer");
        }
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        let mut octx = format::output(&path)
            .with_context(|| format!("could not create output context for {}", path.display()))?;

        let global_header = octx
            .format()
            .flags()
            .contains(format::flag::Flags::GLOBAL_HEADER);

        let encoder_codec = encoder::find(codec::Id::H264)
            .or_else(|| encoder::find(codec::Id::MPEG4))
            .context("neither an H.264 nor an MPEG-4 encoder is available")?;

        let fps = if fps > 0.0 { fps } else { FALLBACK_FPS };
        let frame_rate = Rational::from(fps);
        let time_base = frame_rate.invert();
        let enc_width = (width & !1).max(2);
        let enc_height = (height & !1).max(2);

        let (encoder, stream_index) = {
            let mut stream = octx.add_stream(encoder_codec)?;
            let mut builder = codec::context::Context::new_with_codec(encoder_codec)
                .encoder()
                .video()?;
            builder.set_width(enc_width);
            builder.set_height(enc_height);
            builder.set_format(ENCODE_FORMAT);
            builder.set_time_base(time_base);
            builder.set_frame_rate(Some(frame_rate));
            if global_header {
                builder.set_flags(codec::flag::Flags::GLOBAL_HEADER);
            }

            let options = if encoder_codec.id() == codec::Id::H264 {
                ffmpeg::Dictionary::from_iter([("crf", "18"), ("preset", "fast")])
            } else {
                ffmpeg::Dictionary::new()
            };
            let encoder = builder
                .open_as_with(encoder_codec, options)
                .context("failed to open video encoder")?;

            stream.set_parameters(&encoder);
            stream.set_time_base(time_base);
            (encoder, stream.index())
        };

        let to_yuv = scaling::Context::get(
            format::Pixel::RGB24,
            width,
            height,
            ENCODE_FORMAT,
            enc_width,
            enc_height,
            SCALE_FLAGS,
        )
        .context("failed to create to-YUV scaler")?;

        octx.write_header()
            .context("failed to write output header")?;

        info!(
            path = %path.display(),
            width,
            height,
            fps,
            codec = ?encoder_codec.id(),
            "opened output video"
        );

        Ok(Self {
            octx,
            encoder,
            to_yuv,
            rgb_frame: frame::Video::new(format::Pixel::RGB24, width, height),
            yuv_frame: frame::Video::empty(),
            stream_index,
            time_base,
            width,
            height,
            next_pts: 0,
            finished: false,
            path,
        })
    }

    /// Drain all pending packets from the encoder and write them to the muxer.
    fn drain_packets(&mut self) -> Result<()> {
        let out_time_base = self
            .octx
            .stream(self.stream_index)
            .context("output video stream disappeared")?
            .time_base();
        let mut encoded = Packet::empty();
        while self.encoder.receive_packet(&mut encoded).is_ok() {
            encoded.set_stream(self.stream_index);
            encoded.rescale_ts(self.time_base, out_time_base);
            encoded
                .write_interleaved(&mut self.octx)
                .context("failed to write encoded packet")?;
        }
        Ok(())
    }
}

impl FrameSink for FfmpegWriter {
    fn write(&mut self, frame: &RgbFrame) -> Result<()> {
        if self.finished {
            bail!("video writer already finished");
        }
        if frame.size() != (self.width, self.height) {
            bail!(
                "frame is {}x{}, writer expects {}x{}",
                frame.width,
                frame.height,
                self.width,
                self.height
            );
        }

        let row_len = self.width as usize * 3;
        let out_stride = self.rgb_frame.stride(0);
        let plane = self.rgb_frame.data_mut(0);
        for row in 0..self.height as usize {
            let dst_start = row * out_stride;
            let src_start = row * row_len;
            plane[dst_start..dst_start + row_len]
                .copy_from_slice(&frame.data[src_start..src_start + row_len]);
        }

        self.to_yuv
            .run(&self.rgb_frame, &mut self.yuv_frame)
            .context("to-YUV scaling failed")?;
        self.yuv_frame.set_pts(Some(self.next_pts));
        self.next_pts += 1;

        self.encoder
            .send_frame(&self.yuv_frame)
            .context("encoder send_frame")?;
        self.drain_packets()
    }

    fn finish(&mut self) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;

        self.encoder.send_eof().ok();
        self.drain_packets()?;
        self.octx
            .write_trailer()
            .context("failed to write output trailer")?;

        info!(path = %self.path.display(), frames = self.next_pts, "output video finalized");
        Ok(())
    }
}

impl Drop for FfmpegWriter {
    fn drop(&mut self) {
        if !self.finished {
            if let Err(e) = self.finish() {
                warn!(error = %e, "failed to finalize video writer on drop");
            }
        }
    }
}

/// Return the approximate total frame count for a video file (used for
/// progress reporting).  Falls back to 0 if the count cannot be determined.
pub fn total_frames<P: AsRef<Path>>(input_path: P) -> u64 {
    ffmpeg::init().ok();
    let Ok(ictx) = format::input(&input_path) else {
        return 0;
    };
    let Some(stream) = ictx.streams().best(media::Type::Video) else {
        return 0;
    };
    // nb_frames is set by most muxers; fall back to duration × fps estimate.
    let nb = stream.frames();
    if nb > 0 {
        return nb as u64;
    }
    let dur = stream.duration(); // in stream time-base units
    let tb = stream.time_base();
    let fps = stream.avg_frame_rate();
    if dur > 0 && tb.denominator() > 0 && fps.numerator() > 0 {
        let seconds = dur as f64 * tb.numerator() as f64 / tb.denominator() as f64;
        let fps_f = fps.numerator() as f64 / fps.denominator() as f64;
        return (seconds * fps_f).round() as u64;
    }
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rational_conversion_rejects_unset_rates() {
        assert_eq!(rational_to_f64(Rational::new(30000, 1001)).map(|f| f.round()), Some(30.0));
        assert_eq!(rational_to_f64(Rational::new(0, 1)), None);
        assert_eq!(rational_to_f64(Rational::new(25, 0)), None);
    }

    #[test]
    fn missing_input_fails_to_open() {
        let err = FfmpegSource::open("/definitely/not/here.mp4").err().unwrap();
        assert!(err.to_string().contains("could not open input file"));
    }
}
