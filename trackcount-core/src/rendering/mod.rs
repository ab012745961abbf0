//! rendering — annotation styles, draw plans and the raster painter
//!
//! Annotation happens in two steps.  Planning turns tracked detections (or
//! the count table) into a list of [`DrawOp`]s; this is pure and is where
//! all layout decisions live.  The [`Painter`] then rasterizes the ops onto
//! an [`RgbFrame`] with `imageproc`.

use std::cell::Cell;
use std::path::Path;
use std::str::FromStr;

use ab_glyph::{FontVec, PxScale};
use anyhow::{Context, Result, bail};
use image::{ImageBuffer, Rgb, RgbImage};
use imageproc::rect::Rect;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::ConfigError;
use crate::detection::TrackedDetection;
use crate::video::RgbFrame;

/// Pixel height of one unit of font scale.  Scales follow the Hershey
/// convention where 1.0 is roughly a 30 px line.
const PX_PER_FONT_SCALE: f32 = 30.0;
/// Gap between a box's top edge and its label baseline.
const LABEL_OFFSET: i32 = 10;
/// Box outline thickness in pixels.
const BOX_THICKNESS: u32 = 2;

// ── Colors ───────────────────────────────────────────────────────────────────

/// Annotation color: one of the named presets or a raw RGB triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "ColorRepr")]
pub enum Color {
    Red,
    Green,
    Blue,
    Black,
    White,
    Rgb(u8, u8, u8),
}

impl Color {
    pub fn rgb(self) -> [u8; 3] {
        match self {
            Color::Red => [255, 0, 0],
            Color::Green => [0, 255, 0],
            Color::Blue => [0, 0, 255],
            Color::Black => [0, 0, 0],
            Color::White => [255, 255, 255],
            Color::Rgb(r, g, b) => [r, g, b],
        }
    }
}

impl FromStr for Color {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        match trimmed.to_ascii_uppercase().as_str() {
            "RED" => return Ok(Color::Red),
            "GREEN" => return Ok(Color::Green),
            "BLUE" => return Ok(Color::Blue),
            "BLACK" => return Ok(Color::Black),
            "WHITE" => return Ok(Color::White),
            _ => {}
        }

        let channels: Vec<u8> = trimmed
            .split(',')
            .map(|c| c.trim().parse::<u8>())
            .collect::<Result<_, _>>()
            .map_err(|_| ConfigError::InvalidColor(s.to_string()))?;
        match channels.as_slice() {
            &[r, g, b] => Ok(Color::Rgb(r, g, b)),
            _ => Err(ConfigError::InvalidColor(s.to_string())),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ColorRepr {
    Name(String),
    Rgb([u8; 3]),
}

impl TryFrom<ColorRepr> for Color {
    type Error = ConfigError;

    fn try_from(repr: ColorRepr) -> Result<Self, Self::Error> {
        match repr {
            ColorRepr::Name(name) => name.parse(),
            ColorRepr::Rgb([r, g, b]) => Ok(Color::Rgb(r, g, b)),
        }
    }
}

// ── Font scale ───────────────────────────────────────────────────────────────

/// Text size preset, or a raw positive scale.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(try_from = "FontScaleRepr")]
pub enum FontScale {
    Small,
    Average,
    Big,
    ExtraLarge,
    Custom(f32),
}

impl FontScale {
    pub fn value(self) -> f32 {
        match self {
            FontScale::Small => 0.3,
            FontScale::Average => 0.4,
            FontScale::Big => 0.5,
            FontScale::ExtraLarge => 0.6,
            FontScale::Custom(v) => v,
        }
    }

    /// Rendered line height in pixels.
    pub fn pixel_height(self) -> f32 {
        self.value() * PX_PER_FONT_SCALE
    }

    fn custom(value: f32, original: &str) -> Result<Self, ConfigError> {
        if value.is_finite() && value > 0.0 {
            Ok(FontScale::Custom(value))
        } else {
            Err(ConfigError::InvalidFontScale(original.to_string()))
        }
    }
}

impl FromStr for FontScale {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "small" => Ok(FontScale::Small),
            "average" => Ok(FontScale::Average),
            "big" => Ok(FontScale::Big),
            "extra_large" => Ok(FontScale::ExtraLarge),
            other => {
                let value = other
                    .parse::<f32>()
                    .map_err(|_| ConfigError::InvalidFontScale(s.to_string()))?;
                FontScale::custom(value, s)
            }
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum FontScaleRepr {
    Name(String),
    Value(f32),
}

impl TryFrom<FontScaleRepr> for FontScale {
    type Error = ConfigError;

    fn try_from(repr: FontScaleRepr) -> Result<Self, Self::Error> {
        match repr {
            FontScaleRepr::Name(name) => name.parse(),
            FontScaleRepr::Value(v) => FontScale::custom(v, &v.to_string()),
        }
    }
}

// ── Draw plans ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AnnotationStyle {
    pub box_color: Color,
    pub text_color: Color,
    pub font_scale: FontScale,
}

impl AnnotationStyle {
    /// Boxes and text in one color.
    pub fn uniform(color: Color, font_scale: FontScale) -> Self {
        Self {
            box_color: color,
            text_color: color,
            font_scale,
        }
    }
}

impl Default for AnnotationStyle {
    fn default() -> Self {
        Self::uniform(Color::Green, FontScale::Average)
    }
}

/// A single raster primitive.  Coordinates are frame pixels; label
/// positions are the left end of the text baseline.
#[derive(Debug, Clone, PartialEq)]
pub enum DrawOp {
    Rect {
        x1: i32,
        y1: i32,
        x2: i32,
        y2: i32,
        thickness: u32,
        color: [u8; 3],
    },
    Label {
        x: i32,
        baseline: i32,
        text: String,
        scale: f32,
        color: [u8; 3],
    },
}

/// Maps tracked detections to box + label draw ops.
#[derive(Debug, Clone)]
pub struct AnnotationRenderer {
    style: AnnotationStyle,
}

impl AnnotationRenderer {
    pub fn new(style: AnnotationStyle) -> Self {
        Self { style }
    }

    pub fn style(&self) -> &AnnotationStyle {
        &self.style
    }

    /// Draw ops for every detection that carries a track id.
    pub fn plan(&self, detections: &[TrackedDetection]) -> Vec<DrawOp> {
        detections
            .iter()
            .flat_map(|det| self.plan_one(det))
            .collect()
    }

    /// Box and label for one detection; empty when it has no track id.
    pub fn plan_one(&self, det: &TrackedDetection) -> Vec<DrawOp> {
        let Some(track_id) = det.track_id else {
            return Vec::new();
        };

        let x1 = det.bbox.x1.round() as i32;
        let y1 = det.bbox.y1.round() as i32;
        let x2 = det.bbox.x2.round() as i32;
        let y2 = det.bbox.y2.round() as i32;

        // Keep the whole label on canvas for boxes touching the top edge.
        let text_height = self.style.font_scale.pixel_height().round() as i32;
        let baseline = (y1 - LABEL_OFFSET).max(text_height);

        vec![
            DrawOp::Rect {
                x1,
                y1,
                x2,
                y2,
                thickness: BOX_THICKNESS,
                color: self.style.box_color.rgb(),
            },
            DrawOp::Label {
                x: x1.max(0),
                baseline,
                text: format!("{} ID:{}", det.class_label, track_id),
                scale: self.style.font_scale.value(),
                color: self.style.text_color.rgb(),
            },
        ]
    }

    /// Plan and paint in one go.
    pub fn render(
        &self,
        frame: &mut RgbFrame,
        detections: &[TrackedDetection],
        painter: &Painter,
    ) -> Result<()> {
        painter.paint(frame, &self.plan(detections))
    }
}

// ── Painter ──────────────────────────────────────────────────────────────────

/// Rasterizes [`DrawOp`]s.  Without a font only rectangles are drawn.
pub struct Painter {
    font: Option<FontVec>,
    warned_missing_font: Cell<bool>,
}

impl Painter {
    pub fn new(font: Option<FontVec>) -> Self {
        Self {
            font,
            warned_missing_font: Cell::new(false),
        }
    }

    pub fn without_font() -> Self {
        Self::new(None)
    }

    /// Load a TrueType/OpenType font from disk.
    pub fn from_font_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)
            .with_context(|| format!("failed to read font {}", path.display()))?;
        let font = FontVec::try_from_vec(bytes)
            .map_err(|e| anyhow::anyhow!("invalid font {}: {e}", path.display()))?;
        debug!(path = %path.display(), "loaded label font");
        Ok(Self::new(Some(font)))
    }

    pub fn paint(&self, frame: &mut RgbFrame, ops: &[DrawOp]) -> Result<()> {
        if ops.is_empty() {
            return Ok(());
        }
        let expected = frame.width as usize * frame.height as usize * 3;
        if frame.data.len() != expected {
            bail!(
                "frame buffer holds {} bytes, expected {expected} for {}x{}",
                frame.data.len(),
                frame.width,
                frame.height
            );
        }

        // Reuse the frame buffer; written back below.
        let mut img: RgbImage =
            ImageBuffer::from_raw(frame.width, frame.height, std::mem::take(&mut frame.data))
                .context("frame buffer does not match its dimensions")?;

        for op in ops {
            match op {
                DrawOp::Rect {
                    x1,
                    y1,
                    x2,
                    y2,
                    thickness,
                    color,
                } => draw_thick_rect(&mut img, (*x1, *y1, *x2, *y2), *thickness, Rgb(*color)),
                DrawOp::Label {
                    x,
                    baseline,
                    text,
                    scale,
                    color,
                } => self.draw_label(&mut img, *x, *baseline, text, *scale, Rgb(*color)),
            }
        }

        frame.data = img.into_raw();
        Ok(())
    }

    fn draw_label(
        &self,
        img: &mut RgbImage,
        x: i32,
        baseline: i32,
        text: &str,
        scale: f32,
        color: Rgb<u8>,
    ) {
        let Some(font) = &self.font else {
            if !self.warned_missing_font.replace(true) {
                warn!("no label font loaded; text annotations are skipped");
            }
            return;
        };
        let px = scale * PX_PER_FONT_SCALE;
        let top = baseline - px.round() as i32;
        imageproc::drawing::draw_text_mut(img, color, x, top, PxScale::from(px), font, text);
    }
}

/// Hollow rectangle grown inward to `thickness` pixels.
fn draw_thick_rect(
    img: &mut RgbImage,
    corners: (i32, i32, i32, i32),
    thickness: u32,
    color: Rgb<u8>,
) {
    let (x1, y1, x2, y2) = corners;
    for t in 0..thickness.max(1) as i32 {
        let w = x2 - x1 - 2 * t;
        let h = y2 - y1 - 2 * t;
        if w <= 0 || h <= 0 {
            break;
        }
        let rect = Rect::at(x1 + t, y1 + t).of_size(w as u32, h as u32);
        imageproc::drawing::draw_hollow_rect_mut(img, rect, color);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::BBox;

    fn det(track_id: Option<u64>, y1: f32) -> TrackedDetection {
        TrackedDetection {
            bbox: BBox::new(20.0, y1, 60.0, y1 + 30.0),
            class_id: 0,
            class_label: "person".into(),
            confidence: 0.9,
            track_id,
        }
    }

    #[test]
    fn named_colors_map_to_rgb() {
        assert_eq!("RED".parse::<Color>().unwrap().rgb(), [255, 0, 0]);
        assert_eq!("green".parse::<Color>().unwrap().rgb(), [0, 255, 0]);
        assert_eq!("Blue".parse::<Color>().unwrap().rgb(), [0, 0, 255]);
        assert_eq!("BLACK".parse::<Color>().unwrap().rgb(), [0, 0, 0]);
        assert_eq!("WHITE".parse::<Color>().unwrap().rgb(), [255, 255, 255]);
        assert_eq!("10, 20,30".parse::<Color>().unwrap(), Color::Rgb(10, 20, 30));
    }

    #[test]
    fn bad_colors_are_rejected() {
        assert!("purple".parse::<Color>().is_err());
        assert!("1,2".parse::<Color>().is_err());
        assert!("1,2,300".parse::<Color>().is_err());
    }

    #[test]
    fn font_scale_presets_and_raw_values() {
        assert_eq!("small".parse::<FontScale>().unwrap().value(), 0.3);
        assert_eq!("average".parse::<FontScale>().unwrap().value(), 0.4);
        assert_eq!("big".parse::<FontScale>().unwrap().value(), 0.5);
        assert_eq!("extra_large".parse::<FontScale>().unwrap().value(), 0.6);
        assert_eq!("extra-large".parse::<FontScale>().unwrap(), FontScale::ExtraLarge);
        assert_eq!("0.75".parse::<FontScale>().unwrap(), FontScale::Custom(0.75));
        assert!("0".parse::<FontScale>().is_err());
        assert!("-1".parse::<FontScale>().is_err());
        assert!("huge".parse::<FontScale>().is_err());
    }

    #[test]
    fn untracked_detections_produce_no_ops() {
        let renderer = AnnotationRenderer::new(AnnotationStyle::default());
        assert!(renderer.plan(&[det(None, 40.0)]).is_empty());
    }

    #[test]
    fn tracked_detection_gets_box_and_label() {
        let style = AnnotationStyle::uniform(Color::Red, FontScale::Big);
        let renderer = AnnotationRenderer::new(style);
        let ops = renderer.plan(&[det(Some(7), 40.0), det(None, 40.0)]);
        assert_eq!(ops.len(), 2);
        assert_eq!(
            ops[0],
            DrawOp::Rect {
                x1: 20,
                y1: 40,
                x2: 60,
                y2: 70,
                thickness: 2,
                color: [255, 0, 0]
            }
        );
        match &ops[1] {
            DrawOp::Label {
                x,
                baseline,
                text,
                scale,
                color,
            } => {
                assert_eq!(text, "person ID:7");
                assert_eq!((*x, *baseline), (20, 30));
                assert_eq!(*scale, 0.5);
                assert_eq!(*color, [255, 0, 0]);
            }
            other => panic!("expected label, got {other:?}"),
        }
    }

    #[test]
    fn label_is_clamped_inside_the_top_edge() {
        let renderer = AnnotationRenderer::new(AnnotationStyle::default());
        let ops = renderer.plan(&[det(Some(1), 0.0)]);
        let DrawOp::Label { baseline, .. } = ops[1] else {
            panic!("expected label");
        };
        // 0.4 * 30 px = 12 px of text must fit above the baseline.
        assert_eq!(baseline, 12);
    }

    #[test]
    fn painter_draws_rectangles_without_a_font() {
        let mut frame = RgbFrame::filled(80, 80, [0, 0, 0]);
        let renderer = AnnotationRenderer::new(AnnotationStyle::default());
        renderer
            .render(&mut frame, &[det(Some(3), 40.0)], &Painter::without_font())
            .unwrap();
        assert_eq!(frame.pixel(20, 40), Some([0, 255, 0]));
        assert_eq!(frame.pixel(21, 41), Some([0, 255, 0]));
        assert_eq!(frame.pixel(40, 55), Some([0, 0, 0]));
        assert_eq!(frame.data.len(), 80 * 80 * 3);
    }

    #[test]
    fn painter_leaves_frame_untouched_for_untracked() {
        let mut frame = RgbFrame::filled(80, 80, [5, 5, 5]);
        let before = frame.clone();
        let renderer = AnnotationRenderer::new(AnnotationStyle::default());
        renderer
            .render(&mut frame, &[det(None, 40.0)], &Painter::without_font())
            .unwrap();
        assert_eq!(frame, before);
    }

    #[test]
    fn painter_rejects_mismatched_buffers() {
        let mut frame = RgbFrame::filled(4, 4, [0, 0, 0]);
        frame.data.truncate(5);
        let op = DrawOp::Rect {
            x1: 0,
            y1: 0,
            x2: 3,
            y2: 3,
            thickness: 1,
            color: [1, 1, 1],
        };
        assert!(Painter::without_font().paint(&mut frame, &[op]).is_err());
        assert_eq!(frame.data.len(), 5);
    }
}
