//! tracking — multi-object tracking with persistent ids
//!
//! Each live track carries a 2D constant-velocity Kalman filter over its box
//! centre; width and height are smoothed with an exponential moving average.
//! Association is greedy IoU matching against the predicted boxes:
//!
//! * `bytetrack` — high-confidence detections are matched first, then the
//!   remaining tracks get a second chance against low-confidence ones.
//! * `iou` — a single pass over every detection.
//!
//! New ids are only minted for unmatched high-confidence detections, so a
//! low-confidence blip never gets an identity of its own.
//!
//! State vector: [cx, cy, vx, vy]ᵀ  (position + velocity in pixels/frame)
//! Measurement:  [cx, cy]ᵀ

use anyhow::Result;
use nalgebra::{Matrix2, Matrix2x4, Matrix4, Matrix4x2, Vector2, Vector4};
use serde::Deserialize;
use tracing::debug;

use crate::config::ConfigError;
use crate::detection::{
    BBox, Detect, Detection, TrackedDetection, TrackedDetectionSource, check_unit,
};
use crate::video::RgbFrame;

// ── Tuning constants ─────────────────────────────────────────────────────────

/// Process noise — how much we trust the motion model.
const PROCESS_NOISE: f32 = 4.0;
/// Measurement noise — how much we trust the detector.
const MEASUREMENT_NOISE: f32 = 16.0;
/// EMA weight of a fresh width/height measurement.
const SIZE_ALPHA: f32 = 0.5;

// ── Configuration ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackerAlgorithm {
    #[default]
    ByteTrack,
    Iou,
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TrackerConfig {
    pub algorithm: TrackerAlgorithm,
    /// Detections at or above this confidence may start new tracks
    pub high_threshold: f32,
    /// Minimum IoU between a predicted track box and a detection
    pub match_iou: f32,
    /// Frames a track survives without a matching detection
    pub track_buffer: u32,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            algorithm: TrackerAlgorithm::ByteTrack,
            high_threshold: 0.6,
            match_iou: 0.2,
            track_buffer: 30,
        }
    }
}

impl TrackerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_unit("high_threshold", self.high_threshold)?;
        check_unit("match_iou", self.match_iou)?;
        if self.track_buffer == 0 {
            return Err(ConfigError::InvalidTrackBuffer);
        }
        Ok(())
    }
}

// ── Kalman filter ────────────────────────────────────────────────────────────

/// A minimal 2D constant-velocity Kalman filter.
#[derive(Debug, Clone)]
struct Kalman2D {
    /// State: [cx, cy, vx, vy]
    x: Vector4<f32>,
    /// State covariance
    p: Matrix4<f32>,
    /// State transition matrix (F)
    f: Matrix4<f32>,
    /// Measurement matrix (H): extracts [cx, cy] from state
    h: Matrix2x4<f32>,
    /// Process noise covariance (Q)
    q: Matrix4<f32>,
    /// Measurement noise covariance (R)
    r: Matrix2<f32>,
}

impl Kalman2D {
    fn new(cx: f32, cy: f32) -> Self {
        #[rustfmt::skip]
        let f = Matrix4::new(
            1.0, 0.0, 1.0, 0.0,
            0.0, 1.0, 0.0, 1.0,
            0.0, 0.0, 1.0, 0.0,
            0.0, 0.0, 0.0, 1.0,
        );
        Self {
            x: Vector4::new(cx, cy, 0.0, 0.0),
            p: Matrix4::identity() * 100.0,
            f,
            h: Matrix2x4::new(1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0),
            q: Matrix4::identity() * PROCESS_NOISE,
            r: Matrix2::identity() * MEASUREMENT_NOISE,
        }
    }

    fn predict(&mut self) {
        self.x = self.f * self.x;
        self.p = self.f * self.p * self.f.transpose() + self.q;
    }

    fn update(&mut self, cx: f32, cy: f32) {
        let z = Vector2::new(cx, cy);
        let y = z - self.h * self.x; // innovation
        let s = self.h * self.p * self.h.transpose() + self.r;
        let Some(s_inv) = s.try_inverse() else {
            return;
        };
        let k: Matrix4x2<f32> = self.p * self.h.transpose() * s_inv;
        self.x += k * y;
        self.p = (Matrix4::identity() - k * self.h) * self.p;
    }

    fn cx(&self) -> f32 {
        self.x[0]
    }
    fn cy(&self) -> f32 {
        self.x[1]
    }
}

// ── Tracker ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct Track {
    id: u64,
    class_id: usize,
    kalman: Kalman2D,
    width: f32,
    height: f32,
    /// Consecutive frames without a match.
    missed: u32,
}

impl Track {
    fn new(id: u64, det: &Detection) -> Self {
        Self {
            id,
            class_id: det.class_id,
            kalman: Kalman2D::new(det.bbox.center_x(), det.bbox.center_y()),
            width: det.bbox.width(),
            height: det.bbox.height(),
            missed: 0,
        }
    }

    fn predicted_box(&self) -> BBox {
        BBox::from_center(self.kalman.cx(), self.kalman.cy(), self.width, self.height)
    }

    fn absorb(&mut self, det: &Detection) {
        self.kalman.update(det.bbox.center_x(), det.bbox.center_y());
        self.width = (1.0 - SIZE_ALPHA) * self.width + SIZE_ALPHA * det.bbox.width();
        self.height = (1.0 - SIZE_ALPHA) * self.height + SIZE_ALPHA * det.bbox.height();
        self.missed = 0;
    }
}

/// Assigns persistent ids to per-frame detections.  State lives for one run.
#[derive(Debug)]
pub struct Tracker {
    config: TrackerConfig,
    tracks: Vec<Track>,
    next_id: u64,
    frame_index: u64,
}

impl Tracker {
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            config,
            tracks: Vec::new(),
            next_id: 1,
            frame_index: 0,
        }
    }

    /// Number of tracks currently alive (matched or coasting).
    pub fn live_tracks(&self) -> usize {
        self.tracks.len()
    }

    /// Advance one frame.  Returns one entry per input detection, in order:
    /// the id of the track it was associated with, or `None`.
    pub fn update(&mut self, detections: &[Detection]) -> Vec<Option<u64>> {
        self.frame_index += 1;
        for track in &mut self.tracks {
            track.kalman.predict();
        }

        let mut assigned: Vec<Option<usize>> = vec![None; detections.len()];
        let mut track_taken = vec![false; self.tracks.len()];

        let (high, low): (Vec<usize>, Vec<usize>) = (0..detections.len())
            .partition(|&i| detections[i].confidence >= self.config.high_threshold);

        match self.config.algorithm {
            TrackerAlgorithm::ByteTrack => {
                self.associate(detections, &high, &mut assigned, &mut track_taken);
                self.associate(detections, &low, &mut assigned, &mut track_taken);
            }
            TrackerAlgorithm::Iou => {
                let all: Vec<usize> = (0..detections.len()).collect();
                self.associate(detections, &all, &mut assigned, &mut track_taken);
            }
        }

        let mut ids = vec![None; detections.len()];
        for (det_idx, track_idx) in assigned.iter().enumerate() {
            if let Some(t) = *track_idx {
                self.tracks[t].absorb(&detections[det_idx]);
                ids[det_idx] = Some(self.tracks[t].id);
            }
        }

        for (track, taken) in self.tracks.iter_mut().zip(&track_taken) {
            if !taken {
                track.missed += 1;
            }
        }
        let buffer = self.config.track_buffer;
        let before = self.tracks.len();
        self.tracks.retain(|t| t.missed <= buffer);
        if self.tracks.len() < before {
            debug!(
                frame = self.frame_index,
                expired = before - self.tracks.len(),
                "tracks expired"
            );
        }

        for &det_idx in &high {
            if ids[det_idx].is_none() {
                let id = self.next_id;
                self.next_id += 1;
                self.tracks.push(Track::new(id, &detections[det_idx]));
                ids[det_idx] = Some(id);
                debug!(frame = self.frame_index, track_id = id, "new track");
            }
        }

        ids
    }

    /// Greedy IoU matching of `candidates` against the free tracks, best
    /// overlap first.  Tracks only match detections of their own class.
    fn associate(
        &self,
        detections: &[Detection],
        candidates: &[usize],
        assigned: &mut [Option<usize>],
        track_taken: &mut [bool],
    ) {
        let mut pairs: Vec<(f32, usize, usize)> = Vec::new();
        for &d in candidates {
            if assigned[d].is_some() {
                continue;
            }
            for (t, track) in self.tracks.iter().enumerate() {
                if track_taken[t] || track.class_id != detections[d].class_id {
                    continue;
                }
                let iou = track.predicted_box().iou(&detections[d].bbox);
                if iou >= self.config.match_iou && iou > 0.0 {
                    pairs.push((iou, d, t));
                }
            }
        }
        pairs.sort_unstable_by(|a, b| b.0.total_cmp(&a.0));

        for (_, d, t) in pairs {
            if assigned[d].is_none() && !track_taken[t] {
                assigned[d] = Some(t);
                track_taken[t] = true;
            }
        }
    }
}

// ── Detector + tracker ───────────────────────────────────────────────────────

/// A [`Detect`] implementation with a [`Tracker`] on top, resolving class
/// labels from the detector's name table.
pub struct TrackingDetector<D> {
    detector: D,
    tracker: Tracker,
}

impl<D: Detect> TrackingDetector<D> {
    pub fn new(detector: D, config: TrackerConfig) -> Self {
        Self {
            detector,
            tracker: Tracker::new(config),
        }
    }
}

impl<D: Detect> TrackedDetectionSource for TrackingDetector<D> {
    fn infer(&mut self, frame: &RgbFrame) -> Result<Vec<TrackedDetection>> {
        let detections = self.detector.detect(frame)?;
        let ids = self.tracker.update(&detections);
        let names = self.detector.class_names();

        Ok(detections
            .iter()
            .zip(ids)
            .map(|(det, track_id)| TrackedDetection {
                bbox: det.bbox,
                class_id: det.class_id,
                class_label: names.label(det.class_id),
                confidence: det.confidence,
                track_id,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::ClassNames;

    fn det(x: f32, y: f32, class_id: usize, confidence: f32) -> Detection {
        Detection {
            bbox: BBox::new(x, y, x + 40.0, y + 80.0),
            class_id,
            confidence,
        }
    }

    fn tracker(algorithm: TrackerAlgorithm) -> Tracker {
        Tracker::new(TrackerConfig {
            algorithm,
            track_buffer: 3,
            ..Default::default()
        })
    }

    #[test]
    fn moving_object_keeps_its_id() {
        let mut tracker = tracker(TrackerAlgorithm::ByteTrack);
        let first = tracker.update(&[det(100.0, 100.0, 0, 0.9)]);
        assert_eq!(first, vec![Some(1)]);
        for step in 1..20 {
            let x = 100.0 + step as f32 * 4.0;
            assert_eq!(tracker.update(&[det(x, 100.0, 0, 0.9)]), vec![Some(1)]);
        }
    }

    #[test]
    fn separate_objects_get_separate_ids() {
        let mut tracker = tracker(TrackerAlgorithm::ByteTrack);
        let ids = tracker.update(&[det(0.0, 0.0, 0, 0.9), det(300.0, 0.0, 0, 0.8)]);
        assert_eq!(ids, vec![Some(1), Some(2)]);
    }

    #[test]
    fn low_confidence_detections_never_start_tracks() {
        for algorithm in [TrackerAlgorithm::ByteTrack, TrackerAlgorithm::Iou] {
            let mut tracker = tracker(algorithm);
            assert_eq!(tracker.update(&[det(0.0, 0.0, 0, 0.3)]), vec![None]);
            assert_eq!(tracker.live_tracks(), 0);
        }
    }

    #[test]
    fn low_confidence_detection_continues_an_existing_track() {
        let mut tracker = tracker(TrackerAlgorithm::ByteTrack);
        tracker.update(&[det(50.0, 50.0, 0, 0.9)]);
        assert_eq!(tracker.update(&[det(52.0, 50.0, 0, 0.3)]), vec![Some(1)]);
    }

    #[test]
    fn classes_do_not_share_tracks() {
        let mut tracker = tracker(TrackerAlgorithm::Iou);
        tracker.update(&[det(50.0, 50.0, 0, 0.9)]);
        assert_eq!(tracker.update(&[det(50.0, 50.0, 2, 0.9)]), vec![Some(2)]);
    }

    #[test]
    fn tracks_expire_after_the_buffer() {
        let mut tracker = tracker(TrackerAlgorithm::ByteTrack);
        tracker.update(&[det(10.0, 10.0, 0, 0.9)]);
        for _ in 0..3 {
            tracker.update(&[]);
        }
        assert_eq!(tracker.live_tracks(), 1);
        // Still within the buffer: re-acquired with the same id.
        assert_eq!(tracker.update(&[det(10.0, 10.0, 0, 0.9)]), vec![Some(1)]);

        for _ in 0..4 {
            tracker.update(&[]);
        }
        assert_eq!(tracker.live_tracks(), 0);
        assert_eq!(tracker.update(&[det(10.0, 10.0, 0, 0.9)]), vec![Some(2)]);
    }

    #[test]
    fn config_validation() {
        assert!(TrackerConfig::default().validate().is_ok());
        let bad = TrackerConfig {
            track_buffer: 0,
            ..Default::default()
        };
        assert!(matches!(bad.validate(), Err(ConfigError::InvalidTrackBuffer)));
        let bad = TrackerConfig {
            match_iou: 2.0,
            ..Default::default()
        };
        assert!(matches!(
            bad.validate(),
            Err(ConfigError::ThresholdOutOfRange { name: "match_iou", .. })
        ));
    }

    struct ScriptedDetector {
        frames: Vec<Vec<Detection>>,
        names: ClassNames,
    }

    impl Detect for ScriptedDetector {
        fn detect(&mut self, _frame: &RgbFrame) -> Result<Vec<Detection>> {
            Ok(if self.frames.is_empty() {
                Vec::new()
            } else {
                self.frames.remove(0)
            })
        }

        fn class_names(&self) -> &ClassNames {
            &self.names
        }
    }

    #[test]
    fn tracking_detector_labels_and_ids() {
        let detector = ScriptedDetector {
            frames: vec![
                vec![det(0.0, 0.0, 0, 0.9), det(200.0, 0.0, 5, 0.2)],
                vec![det(2.0, 0.0, 0, 0.9)],
            ],
            names: ClassNames::new(vec!["person".into()]),
        };
        let mut source = TrackingDetector::new(detector, TrackerConfig::default());
        let frame = RgbFrame::filled(4, 4, [0, 0, 0]);

        let first = source.infer(&frame).unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].class_label, "person");
        assert_eq!(first[0].track_id, Some(1));
        assert_eq!(first[1].class_label, "class_5");
        assert_eq!(first[1].track_id, None);

        let second = source.infer(&frame).unwrap();
        assert_eq!(second[0].track_id, Some(1));
    }
}
