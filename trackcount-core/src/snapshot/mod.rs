//! snapshot — one JPEG per newly seen track id

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use image::ExtendedColorType;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::detection::TrackedDetection;
use crate::rendering::{AnnotationRenderer, Painter};
use crate::video::RgbFrame;

/// Draws boxes onto the snapshot copy.  Each snapshot shows the new
/// detection's box plus every tracked box before it in the same frame.
pub struct Highlight<'a> {
    pub renderer: &'a AnnotationRenderer,
    pub painter: &'a Painter,
}

/// Saves the frame the first time each track id shows up, under
/// `output_root/video_stem/track_{id}_{uuid}.jpg`.
#[derive(Debug)]
pub struct SnapshotEmitter {
    dir: PathBuf,
    seen: HashSet<u64>,
}

impl SnapshotEmitter {
    pub fn new<P: AsRef<Path>>(output_root: P, video_stem: &str) -> Self {
        Self {
            dir: output_root.as_ref().join(video_stem),
            seen: HashSet::new(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn is_seen(&self, track_id: u64) -> bool {
        self.seen.contains(&track_id)
    }

    /// Emit a snapshot for every tracked detection not seen before.  Returns
    /// the paths actually written; failed writes are logged and the id stays
    /// seen.
    ///
    /// With a highlight, boxes are painted in detection order onto a single
    /// copy of `frame`, which is saved right after each new id's box lands.
    pub fn maybe_emit(
        &mut self,
        detections: &[TrackedDetection],
        frame: &RgbFrame,
        highlight: Option<&Highlight<'_>>,
    ) -> Vec<PathBuf> {
        let any_new = detections
            .iter()
            .filter_map(|det| det.track_id)
            .any(|id| !self.seen.contains(&id));
        if !any_new {
            return Vec::new();
        }

        let mut canvas = highlight.map(|_| frame.clone());
        let mut written = Vec::new();
        for det in detections {
            let Some(track_id) = det.track_id else {
                continue;
            };
            if let (Some(h), Some(canvas)) = (highlight, canvas.as_mut()) {
                if let Err(e) = h.painter.paint(canvas, &h.renderer.plan_one(det)) {
                    warn!(track_id, "snapshot highlight failed: {e:#}");
                }
            }
            if !self.seen.insert(track_id) {
                continue;
            }

            let path = self
                .dir
                .join(format!("track_{track_id}_{}.jpg", Uuid::new_v4()));
            match self.save(&path, canvas.as_ref().unwrap_or(frame)) {
                Ok(()) => {
                    debug!(track_id, path = %path.display(), "snapshot saved");
                    written.push(path);
                }
                Err(e) => warn!(track_id, "snapshot not saved: {e:#}"),
            }
        }
        written
    }

    fn save(&self, path: &Path, frame: &RgbFrame) -> Result<()> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("failed to create {}", self.dir.display()))?;

        image::save_buffer(
            path,
            &frame.data,
            frame.width,
            frame.height,
            ExtendedColorType::Rgb8,
        )
        .with_context(|| format!("failed to write {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::BBox;
    use crate::rendering::AnnotationStyle;

    fn det(track_id: Option<u64>) -> TrackedDetection {
        TrackedDetection {
            bbox: BBox::new(8.0, 8.0, 40.0, 40.0),
            class_id: 0,
            class_label: "person".into(),
            confidence: 0.8,
            track_id,
        }
    }

    fn jpgs(dir: &Path) -> Vec<PathBuf> {
        match std::fs::read_dir(dir) {
            Ok(entries) => entries.map(|e| e.unwrap().path()).collect(),
            Err(_) => Vec::new(),
        }
    }

    #[test]
    fn each_track_is_saved_once() {
        let root = tempfile::tempdir().unwrap();
        let mut emitter = SnapshotEmitter::new(root.path(), "clip");
        let frame = RgbFrame::filled(48, 48, [90, 90, 90]);

        let first = emitter.maybe_emit(&[det(Some(7)), det(None)], &frame, None);
        assert_eq!(first.len(), 1);
        let name = first[0].file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("track_7_") && name.ends_with(".jpg"));
        assert_eq!(first[0].parent().unwrap(), root.path().join("clip"));

        let again = emitter.maybe_emit(&[det(Some(7))], &frame, None);
        assert!(again.is_empty());
        assert_eq!(jpgs(emitter.dir()).len(), 1);
        assert!(emitter.is_seen(7));
    }

    #[test]
    fn untracked_only_frames_write_nothing() {
        let root = tempfile::tempdir().unwrap();
        let mut emitter = SnapshotEmitter::new(root.path(), "clip");
        let frame = RgbFrame::filled(16, 16, [0, 0, 0]);
        assert!(emitter.maybe_emit(&[det(None)], &frame, None).is_empty());
        assert!(!emitter.dir().exists());
    }

    #[test]
    fn failed_write_keeps_the_id_seen() {
        let root = tempfile::tempdir().unwrap();
        let blocker = root.path().join("not-a-dir");
        std::fs::write(&blocker, b"file").unwrap();
        let mut emitter = SnapshotEmitter::new(&blocker, "clip");
        let frame = RgbFrame::filled(16, 16, [0, 0, 0]);

        assert!(emitter.maybe_emit(&[det(Some(1))], &frame, None).is_empty());
        assert!(emitter.is_seen(1));
        assert!(emitter.maybe_emit(&[det(Some(1))], &frame, None).is_empty());
    }

    #[test]
    fn highlight_draws_the_new_box_on_a_copy() {
        let root = tempfile::tempdir().unwrap();
        let mut emitter = SnapshotEmitter::new(root.path(), "clip");
        let frame = RgbFrame::filled(48, 48, [0, 0, 0]);
        let renderer = AnnotationRenderer::new(AnnotationStyle::default());
        let painter = Painter::without_font();
        let highlight = Highlight {
            renderer: &renderer,
            painter: &painter,
        };

        let paths = emitter.maybe_emit(&[det(Some(2))], &frame, Some(&highlight));
        assert_eq!(paths.len(), 1);
        assert_eq!(frame.pixel(8, 20), Some([0, 0, 0]));

        let saved = image::open(&paths[0]).unwrap().to_rgb8();
        assert_eq!(saved.dimensions(), (48, 48));
        let edge = saved.get_pixel(8, 24);
        assert!(edge[1] > 100 && edge[1] > edge[0] + 40, "box edge was {edge:?}");
        let inside = saved.get_pixel(24, 24);
        assert!(inside[1] < 60, "interior was {inside:?}");
    }

    #[test]
    fn later_snapshots_include_earlier_boxes_of_the_frame() {
        let root = tempfile::tempdir().unwrap();
        let mut emitter = SnapshotEmitter::new(root.path(), "clip");
        let frame = RgbFrame::filled(96, 48, [0, 0, 0]);
        let renderer = AnnotationRenderer::new(AnnotationStyle::default());
        let painter = Painter::without_font();
        let highlight = Highlight {
            renderer: &renderer,
            painter: &painter,
        };
        let mut right = det(Some(5));
        right.bbox = BBox::new(56.0, 8.0, 88.0, 40.0);

        let paths = emitter.maybe_emit(&[det(Some(4)), right], &frame, Some(&highlight));
        assert_eq!(paths.len(), 2);

        let first = image::open(&paths[0]).unwrap().to_rgb8();
        let second = image::open(&paths[1]).unwrap().to_rgb8();
        let left_edge = (8, 24);
        let right_edge = (56, 24);

        assert!(first.get_pixel(left_edge.0, left_edge.1)[1] > 100);
        assert!(first.get_pixel(right_edge.0, right_edge.1)[1] < 60, "later box leaked back");
        assert!(second.get_pixel(left_edge.0, left_edge.1)[1] > 100, "earlier box missing");
        assert!(second.get_pixel(right_edge.0, right_edge.1)[1] > 100);
    }
}
