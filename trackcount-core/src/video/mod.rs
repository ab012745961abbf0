//! video — frames, stream collaborators and geometric normalization
//!
//! The pipeline never talks to FFmpeg directly: it pulls frames from a
//! [`FrameSource`] and pushes rendered frames into a [`FrameSink`].  The
//! FFmpeg-backed implementations live in [`ffmpeg`].
//!
//! Every frame is normalized to a fixed width before detection so that the
//! writer, the preview window and the count overlay all see one canvas size
//! for the whole run.

pub mod ffmpeg;

use anyhow::{Context, Result};
use fast_image_resize as fr;

use crate::config::ConfigError;

pub use self::ffmpeg::{FfmpegSource, FfmpegWriter, total_frames};

/// Interpolation used for normalization (fixed for the whole run).
const NORMALIZE_FILTER: fr::FilterType = fr::FilterType::Bilinear;

/// A single video frame in packed RGB24, along with its presentation
/// timestamp (in the source stream's time-base units).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RgbFrame {
    pub data: Vec<u8>, // packed RGB24, row-major
    pub width: u32,
    pub height: u32,
    pub pts: i64,
}

impl RgbFrame {
    /// A frame of `width × height` filled with a single color.
    pub fn filled(width: u32, height: u32, color: [u8; 3]) -> Self {
        let pixels = width as usize * height as usize;
        let mut data = Vec::with_capacity(pixels * 3);
        for _ in 0..pixels {
            data.extend_from_slice(&color);
        }
        Self {
            data,
            width,
            height,
            pts: 0,
        }
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// RGB value at `(x, y)`, or `None` outside the frame.
    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 3]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let idx = (y as usize * self.width as usize + x as usize) * 3;
        self.data
            .get(idx..idx + 3)
            .map(|px| [px[0], px[1], px[2]])
    }
}

/// Geometry and rate of a source stream, known before the first frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StreamInfo {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
}

/// Sequential supplier of decoded frames.
pub trait FrameSource {
    fn info(&self) -> StreamInfo;

    /// Next frame in presentation order, `Ok(None)` at end of stream.
    fn next_frame(&mut self) -> Result<Option<RgbFrame>>;

    /// Release the underlying container.  Called exactly once by the pipeline.
    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Consumer of rendered frames with a geometry fixed at open time.
pub trait FrameSink {
    fn write(&mut self, frame: &RgbFrame) -> Result<()>;

    /// Flush pending data and release the output.  Called exactly once.
    fn finish(&mut self) -> Result<()>;
}

/// Output size for a `src_width × src_height` stream rescaled to
/// `target_width`, preserving aspect ratio.
pub fn normalized_size(src_width: u32, src_height: u32, target_width: u32) -> (u32, u32) {
    let scale = target_width as f64 / src_width.max(1) as f64;
    let height = (src_height as f64 * scale).round().max(1.0) as u32;
    (target_width, height)
}

/// Resizes every frame of a run to one fixed output size.
///
/// The output height is derived once from the source aspect ratio; frames
/// that already have the output size pass through untouched.
pub struct Normalizer {
    width: u32,
    height: u32,
    resizer: fr::Resizer,
    out_buf: Vec<u8>,
}

impl Normalizer {
    pub fn new(source: &StreamInfo, target_width: u32) -> Result<Self> {
        if target_width == 0 {
            return Err(ConfigError::InvalidTargetWidth(target_width).into());
        }
        if source.width == 0 || source.height == 0 {
            anyhow::bail!(
                "source reports an empty frame size ({}x{})",
                source.width,
                source.height
            );
        }
        let (width, height) = normalized_size(source.width, source.height, target_width);
        Ok(Self {
            width,
            height,
            resizer: fr::Resizer::new(),
            out_buf: Vec::new(),
        })
    }

    /// The fixed output size of this run.
    pub fn output_size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Resize `frame` in place to the run's output size.
    pub fn normalize(&mut self, frame: &mut RgbFrame) -> Result<()> {
        if frame.size() == (self.width, self.height) {
            return Ok(());
        }

        let src =
            fr::images::ImageRef::new(frame.width, frame.height, &frame.data, fr::PixelType::U8x3)
                .context("failed to create fast_image_resize source for normalization")?;

        let out_len = self.width as usize * self.height as usize * 3;
        if self.out_buf.len() != out_len {
            self.out_buf.resize(out_len, 0);
        }
        let mut dst = fr::images::Image::from_vec_u8(
            self.width,
            self.height,
            std::mem::take(&mut self.out_buf),
            fr::PixelType::U8x3,
        )
        .context("failed to create fast_image_resize destination for normalization")?;

        let options =
            fr::ResizeOptions::new().resize_alg(fr::ResizeAlg::Convolution(NORMALIZE_FILTER));
        self.resizer
            .resize(&src, &mut dst, Some(&options))
            .context("fast_image_resize normalization failed")?;

        self.out_buf = dst.into_vec();
        std::mem::swap(&mut frame.data, &mut self.out_buf);
        frame.width = self.width;
        frame.height = self.height;
        Ok(())
    }
}

/// Return a copy of `frame` rescaled to `target_width`.
pub fn normalize(frame: &RgbFrame, target_width: u32) -> Result<RgbFrame> {
    let info = StreamInfo {
        width: frame.width,
        height: frame.height,
        fps: 0.0,
    };
    let mut normalizer = Normalizer::new(&info, target_width)?;
    let mut out = frame.clone();
    normalizer.normalize(&mut out)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(width: u32, height: u32) -> StreamInfo {
        StreamInfo {
            width,
            height,
            fps: 25.0,
        }
    }

    #[test]
    fn normalized_size_preserves_aspect_ratio() {
        assert_eq!(normalized_size(500, 400, 1000), (1000, 800));
        assert_eq!(normalized_size(1920, 1080, 1000), (1000, 563));
        assert_eq!(normalized_size(1000, 1, 10), (10, 1));
    }

    #[test]
    fn upscales_500x400_to_1000x800() {
        let mut normalizer = Normalizer::new(&info(500, 400), 1000).unwrap();
        let mut frame = RgbFrame::filled(500, 400, [10, 20, 30]);
        normalizer.normalize(&mut frame).unwrap();
        assert_eq!(frame.size(), (1000, 800));
        assert_eq!(frame.data.len(), 1000 * 800 * 3);
        assert_eq!(frame.pixel(500, 400), Some([10, 20, 30]));
    }

    #[test]
    fn renormalizing_keeps_the_size() {
        let frame = RgbFrame::filled(320, 240, [0, 0, 0]);
        let once = normalize(&frame, 160).unwrap();
        let twice = normalize(&once, 160).unwrap();
        assert_eq!(once.size(), (160, 120));
        assert_eq!(twice.size(), once.size());
        assert_eq!(twice, once);
    }

    #[test]
    fn zero_target_width_is_a_config_error() {
        let err = Normalizer::new(&info(640, 480), 0).err().unwrap();
        assert!(matches!(
            err.downcast_ref::<ConfigError>(),
            Some(ConfigError::InvalidTargetWidth(0))
        ));
    }

    #[test]
    fn output_size_is_fixed_for_the_run() {
        let mut normalizer = Normalizer::new(&info(640, 360), 320).unwrap();
        // A stray frame of a different size still lands on the run geometry.
        let mut odd = RgbFrame::filled(600, 600, [1, 2, 3]);
        normalizer.normalize(&mut odd).unwrap();
        assert_eq!(odd.size(), (320, 180));
        assert_eq!(normalizer.output_size(), (320, 180));
    }

    #[test]
    fn pixel_lookup_is_bounds_checked() {
        let frame = RgbFrame::filled(2, 2, [9, 8, 7]);
        assert_eq!(frame.pixel(1, 1), Some([9, 8, 7]));
        assert_eq!(frame.pixel(2, 0), None);
    }
}
