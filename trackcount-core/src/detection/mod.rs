//! detection — YOLOv8 object detection and the tracked-detection capability
//!
//! [`Detect`] is a raw per-frame detector; [`TrackedDetectionSource`] is what
//! the pipeline consumes (detections with optional persistent track ids).
//! `tracking::TrackingDetector` glues the two together.

use std::path::Path;

use anyhow::{Context, Result, bail};
use fast_image_resize as fr;
use ort::session::Session;
use ort::session::builder::GraphOptimizationLevel;
use ort::value::Tensor;
use rayon::prelude::*;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::config::ConfigError;
use crate::video::RgbFrame;

// ── Constants ────────────────────────────────────────────────────────────────

/// Input / output tensor names of an Ultralytics ONNX export.
const YOLO_INPUT: &str = "images";
const YOLO_OUTPUT: &str = "output0";
/// Box coordinates preceding the class scores in each proposal.
const BOX_FIELDS: usize = 4;
/// ORT intra-op threads for one session.
const INTRA_THREADS: usize = 4;

// ── Public types ─────────────────────────────────────────────────────────────

/// Axis-aligned bounding box in pixel coordinates of the normalized frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn from_center(cx: f32, cy: f32, w: f32, h: f32) -> Self {
        Self::new(cx - w / 2.0, cy - h / 2.0, cx + w / 2.0, cy + h / 2.0)
    }

    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }
    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }
    pub fn center_x(&self) -> f32 {
        (self.x1 + self.x2) / 2.0
    }
    pub fn center_y(&self) -> f32 {
        (self.y1 + self.y2) / 2.0
    }
    pub fn area(&self) -> f32 {
        self.width().max(0.0) * self.height().max(0.0)
    }

    /// IoU (intersection over union) with another box.
    pub fn iou(&self, other: &BBox) -> f32 {
        let ix1 = self.x1.max(other.x1);
        let iy1 = self.y1.max(other.y1);
        let ix2 = self.x2.min(other.x2);
        let iy2 = self.y2.min(other.y2);
        let inter = (ix2 - ix1).max(0.0) * (iy2 - iy1).max(0.0);
        if inter == 0.0 {
            return 0.0;
        }
        let union = self.area() + other.area() - inter;
        inter / union
    }

    /// Clamp to a `width × height` canvas.
    pub fn clamped(&self, width: u32, height: u32) -> BBox {
        let (w, h) = (width as f32, height as f32);
        BBox {
            x1: self.x1.clamp(0.0, w),
            y1: self.y1.clamp(0.0, h),
            x2: self.x2.clamp(0.0, w),
            y2: self.y2.clamp(0.0, h),
        }
    }

    /// Non-degenerate: `x1 < x2` and `y1 < y2`.
    pub fn is_valid(&self) -> bool {
        self.x1 < self.x2 && self.y1 < self.y2
    }
}

/// One raw detector hit, before identity is assigned.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Detection {
    pub bbox: BBox,
    pub class_id: usize,
    pub confidence: f32,
}

/// One object observed in one frame, with an optional persistent identity.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackedDetection {
    pub bbox: BBox,
    pub class_id: usize,
    pub class_label: String,
    pub confidence: f32,
    pub track_id: Option<u64>,
}

/// Class-id → name table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClassNames(Vec<String>);

impl ClassNames {
    pub fn new(names: Vec<String>) -> Self {
        Self(names)
    }

    /// Name for `class_id`, or `class_<id>` when the table has no entry.
    pub fn label(&self, class_id: usize) -> String {
        self.0
            .get(class_id)
            .cloned()
            .unwrap_or_else(|| format!("class_{class_id}"))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// One class name per line; blank lines are ignored.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read classes file {}", path.display()))?;
        Ok(Self::from_lines(&text))
    }

    pub fn from_lines(text: &str) -> Self {
        Self(
            text.lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(str::to_string)
                .collect(),
        )
    }

    /// Parse the `names` metadata entry written by Ultralytics exports, a
    /// Python dict literal such as `{0: 'person', 1: 'bicycle'}`.
    pub fn from_metadata(raw: &str) -> Option<Self> {
        let mut entries: Vec<(usize, String)> = Vec::new();
        let mut chars = raw.trim().trim_start_matches('{').chars().peekable();

        loop {
            while chars.peek().is_some_and(|c| c.is_whitespace() || *c == ',') {
                chars.next();
            }
            let mut digits = String::new();
            while let Some(c) = chars.peek().copied().filter(char::is_ascii_digit) {
                digits.push(c);
                chars.next();
            }
            if digits.is_empty() {
                break;
            }
            while chars.peek().is_some_and(|c| c.is_whitespace() || *c == ':') {
                chars.next();
            }
            let quote = chars.next().filter(|c| *c == '\'' || *c == '"')?;
            let mut name = String::new();
            for c in chars.by_ref() {
                if c == quote {
                    break;
                }
                name.push(c);
            }
            entries.push((digits.parse().ok()?, name));
        }

        if entries.is_empty() {
            return None;
        }
        entries.sort_by_key(|(id, _)| *id);
        let len = entries.last().map(|(id, _)| id + 1).unwrap_or(0);
        let mut names: Vec<String> = (0..len).map(|id| format!("class_{id}")).collect();
        for (id, name) in entries {
            names[id] = name;
        }
        Some(Self(names))
    }
}

/// Detector settings for one run.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct InferenceConfig {
    /// Minimum class score for a detection to be reported
    pub confidence_threshold: f32,
    /// Overlap above which same-class boxes are suppressed
    pub iou_threshold: f32,
    /// Square model input resolution
    pub inference_size: u32,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.5,
            iou_threshold: 0.4,
            inference_size: 640,
        }
    }
}

impl InferenceConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_unit("confidence_threshold", self.confidence_threshold)?;
        check_unit("iou_threshold", self.iou_threshold)?;
        if self.inference_size == 0 {
            return Err(ConfigError::InvalidInferenceSize);
        }
        Ok(())
    }
}

pub(crate) fn check_unit(name: &'static str, value: f32) -> Result<(), ConfigError> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::ThresholdOutOfRange { name, value })
    }
}

// ── Capabilities ─────────────────────────────────────────────────────────────

/// A per-frame object detector without identity.
pub trait Detect {
    fn detect(&mut self, frame: &RgbFrame) -> Result<Vec<Detection>>;

    fn class_names(&self) -> &ClassNames;
}

/// Detector + tracker as seen by the pipeline.  Calls arrive one frame at a
/// time in presentation order; implementations keep identity state across
/// calls for the whole run.
pub trait TrackedDetectionSource {
    fn infer(&mut self, frame: &RgbFrame) -> Result<Vec<TrackedDetection>>;
}

// ── YOLOv8 detector ──────────────────────────────────────────────────────────

/// Wraps a YOLOv8 ONNX session.
pub struct YoloDetector {
    session: Session,
    config: InferenceConfig,
    names: ClassNames,
    resizer: fr::Resizer,
    resize_buf: Vec<u8>,
}

impl YoloDetector {
    /// Load a YOLOv8 ONNX model.  Class names come from `classes_path` when
    /// given, otherwise from the model's `names` metadata.
    pub fn load<P: AsRef<Path>>(
        model_path: P,
        config: InferenceConfig,
        classes_path: Option<&Path>,
    ) -> Result<Self> {
        let model_path = model_path.as_ref();
        let session = build_ort_session(model_path)?;

        let names = match classes_path {
            Some(path) => ClassNames::from_file(path)?,
            None => session
                .metadata()
                .ok()
                .and_then(|meta| meta.custom("names").ok().flatten())
                .and_then(|raw| ClassNames::from_metadata(&raw))
                .unwrap_or_else(|| {
                    warn!("model carries no class names; labels fall back to class_<id>");
                    ClassNames::default()
                }),
        };

        if config.inference_size % 32 != 0 {
            warn!(
                inference_size = config.inference_size,
                "inference size is not a multiple of 32; most YOLO exports will reject it"
            );
        }

        info!(
            model = %model_path.display(),
            classes = names.len(),
            inference_size = config.inference_size,
            "loaded YOLO model"
        );

        let side = config.inference_size as usize;
        Ok(Self {
            session,
            config,
            names,
            resizer: fr::Resizer::new(),
            resize_buf: vec![0u8; side * side * 3],
        })
    }

    fn preprocess(&mut self, frame: &RgbFrame) -> Result<ort::value::DynValue> {
        let size = self.config.inference_size;
        let src =
            fr::images::ImageRef::new(frame.width, frame.height, &frame.data, fr::PixelType::U8x3)
                .context("failed to create fast_image_resize source")?;

        let mut dst = fr::images::Image::from_vec_u8(
            size,
            size,
            std::mem::take(&mut self.resize_buf),
            fr::PixelType::U8x3,
        )
        .context("failed to create fast_image_resize destination")?;

        let options = fr::ResizeOptions::new()
            .resize_alg(fr::ResizeAlg::Convolution(fr::FilterType::Bilinear));
        self.resizer
            .resize(&src, &mut dst, Some(&options))
            .context("fast_image_resize model-input resize failed")?;

        self.resize_buf = dst.into_vec();

        let side = size as usize;
        let planes = planar_unit_rgb(&self.resize_buf);
        Ok(Tensor::from_array(([1usize, 3, side, side], planes.into_boxed_slice()))
            .context("failed to create YOLO input tensor")?
            .into_dyn())
    }
}

/// Interleaved RGB8 to channel-major `f32` planes in `[0, 1]`: the
/// `[3, H, W]` body of an NCHW model input.  Channels fill in parallel.
fn planar_unit_rgb(rgb: &[u8]) -> Vec<f32> {
    let plane = rgb.len() / 3;
    let mut planes = vec![0f32; 3 * plane];
    planes
        .par_chunks_mut(plane.max(1))
        .enumerate()
        .for_each(|(channel, out)| {
            for (dst, px) in out.iter_mut().zip(rgb.chunks_exact(3)) {
                *dst = f32::from(px[channel]) / 255.0;
            }
        });
    planes
}

impl Detect for YoloDetector {
    fn detect(&mut self, frame: &RgbFrame) -> Result<Vec<Detection>> {
        let input_tensor = self.preprocess(frame)?;

        let outputs = self
            .session
            .run(ort::inputs![YOLO_INPUT => input_tensor])
            .context("YOLO inference failed")?;

        let (shape, data) = outputs[YOLO_OUTPUT]
            .try_extract_tensor::<f32>()
            .context("failed to extract YOLO output tensor")?;

        let size = self.config.inference_size as f32;
        let scale = (frame.width as f32 / size, frame.height as f32 / size);
        let candidates = decode_predictions(
            &shape,
            data,
            scale,
            (frame.width, frame.height),
            self.config.confidence_threshold,
        )?;
        let kept = nms(candidates, self.config.iou_threshold);
        debug!(detections = kept.len(), "YOLO frame decoded");
        Ok(kept)
    }

    fn class_names(&self) -> &ClassNames {
        &self.names
    }
}

fn build_ort_session(model_path: &Path) -> Result<Session> {
    let mut builder = Session::builder().context("failed to create ORT session builder")?;
    builder = builder
        .with_optimization_level(GraphOptimizationLevel::Level3)
        .context("failed to set ORT optimization level")?;
    builder = builder
        .with_intra_threads(INTRA_THREADS)
        .context("failed to set ORT intra threads")?;
    builder
        .commit_from_file(model_path)
        .with_context(|| format!("failed to load ONNX model {}", model_path.display()))
}

// ── Post-processing ──────────────────────────────────────────────────────────

/// Decode a YOLOv8 `[1, 4 + classes, proposals]` output into detections in
/// frame coordinates.  `scale` maps model-input pixels to frame pixels.
fn decode_predictions(
    shape: &[i64],
    data: &[f32],
    scale: (f32, f32),
    frame_size: (u32, u32),
    conf_threshold: f32,
) -> Result<Vec<Detection>> {
    if shape.len() != 3 || shape[1] <= BOX_FIELDS as i64 || shape[2] <= 0 {
        bail!("unexpected YOLO output shape {shape:?}");
    }
    let rows = shape[1] as usize;
    let num_proposals = shape[2] as usize;
    let num_classes = rows - BOX_FIELDS;
    if data.len() < rows * num_proposals {
        bail!(
            "YOLO output holds {} values, shape {shape:?} needs {}",
            data.len(),
            rows * num_proposals
        );
    }

    let (scale_x, scale_y) = scale;
    let detections = (0..num_proposals)
        .into_par_iter()
        .filter_map(|i| {
            // Data layout: [cx, cy, w, h, cls0_score, cls1_score, ...]
            // Stored column-major across the rows.
            let cx = data[i];
            let cy = data[num_proposals + i];
            let w = data[2 * num_proposals + i];
            let h = data[3 * num_proposals + i];

            let (class_id, score) = (0..num_classes)
                .map(|c| (c, data[(BOX_FIELDS + c) * num_proposals + i]))
                .fold((0usize, f32::MIN), |best, cur| if cur.1 > best.1 { cur } else { best });

            if score < conf_threshold {
                return None;
            }

            let bbox = BBox::new(
                (cx - w / 2.0) * scale_x,
                (cy - h / 2.0) * scale_y,
                (cx + w / 2.0) * scale_x,
                (cy + h / 2.0) * scale_y,
            )
            .clamped(frame_size.0, frame_size.1);

            bbox.is_valid().then_some(Detection {
                bbox,
                class_id,
                confidence: score,
            })
        })
        .collect();

    Ok(detections)
}

/// Greedy per-class NMS: sort by confidence descending, suppress overlapping
/// boxes of the same class.
fn nms(mut boxes: Vec<Detection>, iou_thresh: f32) -> Vec<Detection> {
    boxes.sort_unstable_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut kept: Vec<Detection> = Vec::new();
    let mut suppressed = vec![false; boxes.len()];

    for i in 0..boxes.len() {
        if suppressed[i] {
            continue;
        }
        kept.push(boxes[i]);
        for j in (i + 1)..boxes.len() {
            if boxes[i].class_id == boxes[j].class_id
                && boxes[i].bbox.iou(&boxes[j].bbox) > iou_thresh
            {
                suppressed[j] = true;
            }
        }
    }

    kept
}

#[cfg(test)]
mod tests {
    use super::*;

    fn det(x1: f32, y1: f32, x2: f32, y2: f32, class_id: usize, confidence: f32) -> Detection {
        Detection {
            bbox: BBox::new(x1, y1, x2, y2),
            class_id,
            confidence,
        }
    }

    #[test]
    fn planes_are_channel_major_and_unit_scaled() {
        let rgb = [255, 0, 0, 0, 51, 255];
        assert_eq!(planar_unit_rgb(&rgb), vec![1.0, 0.0, 0.0, 0.2, 0.0, 1.0]);
        assert!(planar_unit_rgb(&[]).is_empty());
    }

    #[test]
    fn iou_of_identical_and_disjoint_boxes() {
        let a = BBox::new(0.0, 0.0, 10.0, 10.0);
        assert!((a.iou(&a) - 1.0).abs() < 1e-6);
        assert_eq!(a.iou(&BBox::new(20.0, 20.0, 30.0, 30.0)), 0.0);
        let half = BBox::new(5.0, 0.0, 15.0, 10.0);
        assert!((a.iou(&half) - 50.0 / 150.0).abs() < 1e-6);
    }

    #[test]
    fn clamping_keeps_boxes_on_canvas() {
        let b = BBox::new(-5.0, -1.0, 120.0, 50.0).clamped(100, 40);
        assert_eq!(b, BBox::new(0.0, 0.0, 100.0, 40.0));
        assert!(!BBox::new(100.0, 0.0, 100.0, 10.0).is_valid());
    }

    #[test]
    fn nms_suppresses_only_within_a_class() {
        let boxes = vec![
            det(0.0, 0.0, 10.0, 10.0, 0, 0.6),
            det(1.0, 1.0, 11.0, 11.0, 0, 0.9),
            det(1.0, 1.0, 11.0, 11.0, 2, 0.8),
            det(50.0, 50.0, 60.0, 60.0, 0, 0.7),
        ];
        let kept = nms(boxes, 0.4);
        assert_eq!(kept.len(), 3);
        assert_eq!(kept[0].confidence, 0.9);
        assert!(kept.iter().any(|d| d.class_id == 2));
        assert!(!kept.iter().any(|d| d.confidence == 0.6));
    }

    #[test]
    fn decodes_column_major_output() {
        // Two classes, three proposals.
        let n = 3;
        let mut data = vec![0f32; 6 * n];
        let mut set = |row: usize, col: usize, v: f32| data[row * n + col] = v;
        // proposal 0: class 1 at 0.8, centered at (32, 32), 16x16
        set(0, 0, 32.0);
        set(1, 0, 32.0);
        set(2, 0, 16.0);
        set(3, 0, 16.0);
        set(4, 0, 0.1);
        set(5, 0, 0.8);
        // proposal 1: below threshold
        set(0, 1, 10.0);
        set(1, 1, 10.0);
        set(2, 1, 4.0);
        set(3, 1, 4.0);
        set(4, 1, 0.2);
        // proposal 2: class 0 at 0.6, hanging off the right edge
        set(0, 2, 60.0);
        set(1, 2, 20.0);
        set(2, 2, 16.0);
        set(3, 2, 8.0);
        set(4, 2, 0.6);

        let mut out =
            decode_predictions(&[1, 6, 3], &data, (2.0, 1.0), (128, 64), 0.5).unwrap();
        out.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].class_id, 1);
        assert_eq!(out[0].bbox, BBox::new(48.0, 24.0, 80.0, 40.0));
        assert_eq!(out[1].class_id, 0);
        assert_eq!(out[1].bbox, BBox::new(104.0, 16.0, 128.0, 24.0));
    }

    #[test]
    fn rejects_malformed_output_shapes() {
        assert!(decode_predictions(&[1, 4, 10], &[0.0; 40], (1.0, 1.0), (8, 8), 0.5).is_err());
        assert!(decode_predictions(&[1, 6, 10], &[0.0; 12], (1.0, 1.0), (8, 8), 0.5).is_err());
    }

    #[test]
    fn parses_ultralytics_names_metadata() {
        let names =
            ClassNames::from_metadata("{0: 'person', 1: 'bicycle', 3: \"traffic light\"}").unwrap();
        assert_eq!(names.len(), 4);
        assert_eq!(names.label(0), "person");
        assert_eq!(names.label(1), "bicycle");
        assert_eq!(names.label(2), "class_2");
        assert_eq!(names.label(3), "traffic light");
        assert_eq!(names.label(9), "class_9");
        assert!(ClassNames::from_metadata("not a dict").is_none());
    }

    #[test]
    fn class_file_skips_blank_lines() {
        let names = ClassNames::from_lines("pillar\n\n  car \n");
        assert_eq!(names, ClassNames::new(vec!["pillar".into(), "car".into()]));
    }

    #[test]
    fn inference_config_validation() {
        assert!(InferenceConfig::default().validate().is_ok());
        let bad = InferenceConfig {
            inference_size: 0,
            ..Default::default()
        };
        assert!(matches!(bad.validate(), Err(ConfigError::InvalidInferenceSize)));
    }
}
