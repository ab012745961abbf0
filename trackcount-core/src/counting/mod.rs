//! counting — unique track ids per class over one run

use std::collections::{HashMap, HashSet};

use anyhow::Result;
use indexmap::IndexMap;
use tracing::debug;

use crate::detection::TrackedDetection;
use crate::rendering::{AnnotationStyle, DrawOp, Painter};
use crate::video::RgbFrame;

/// Left margin of the count overlay.
const OVERLAY_MARGIN: i32 = 10;
/// Baseline of the first overlay line.
const OVERLAY_FIRST_BASELINE: i32 = 15;
/// Vertical distance between overlay lines.
const OVERLAY_LINE_STRIDE: i32 = 15;

/// Class label → set of track ids ever observed, in first-observation order.
///
/// A track id belongs to the first class it was observed with; later
/// observations under another label are ignored, so every id is counted
/// once and no count ever decreases.
#[derive(Debug, Default, Clone)]
pub struct UniqueCountTable {
    classes: IndexMap<String, HashSet<u64>>,
    owner: HashMap<u64, usize>,
}

impl UniqueCountTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record every tracked detection of one frame.  Returns how many ids
    /// were seen for the first time.
    pub fn observe(&mut self, detections: &[TrackedDetection]) -> usize {
        let mut added = 0;
        for det in detections {
            let Some(track_id) = det.track_id else {
                continue;
            };
            if let Some(&class_idx) = self.owner.get(&track_id) {
                let first_label = self.classes.get_index(class_idx).map(|(label, _)| label);
                if first_label != Some(&det.class_label) {
                    debug!(
                        track_id,
                        label = %det.class_label,
                        "track changed class; keeping its first class"
                    );
                }
                continue;
            }

            let entry = self.classes.entry(det.class_label.clone());
            let class_idx = entry.index();
            entry.or_default().insert(track_id);
            self.owner.insert(track_id, class_idx);
            added += 1;
        }
        added
    }

    /// Unique ids observed for `class_label` so far.
    pub fn count(&self, class_label: &str) -> usize {
        self.classes.get(class_label).map_or(0, HashSet::len)
    }

    /// `(label, count)` pairs in first-observation order.
    pub fn counts(&self) -> Vec<(String, usize)> {
        self.classes
            .iter()
            .map(|(label, ids)| (label.clone(), ids.len()))
            .collect()
    }

    pub fn total(&self) -> usize {
        self.owner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    /// One `"{label}: {count}"` line per class, top-left of the frame.
    pub fn overlay_ops(&self, style: &AnnotationStyle) -> Vec<DrawOp> {
        self.classes
            .iter()
            .enumerate()
            .map(|(line, (label, ids))| DrawOp::Label {
                x: OVERLAY_MARGIN,
                baseline: OVERLAY_FIRST_BASELINE + OVERLAY_LINE_STRIDE * line as i32,
                text: format!("{label}: {}", ids.len()),
                scale: style.font_scale.value(),
                color: style.text_color.rgb(),
            })
            .collect()
    }

    pub fn overlay(
        &self,
        frame: &mut RgbFrame,
        style: &AnnotationStyle,
        painter: &Painter,
    ) -> Result<()> {
        painter.paint(frame, &self.overlay_ops(style))
    }
}
