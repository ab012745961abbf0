//! pipeline — the per-frame driver
//!
//! Lifecycle: `Uninitialized → Ready → Running → Finalizing → Closed`.
//! [`Pipeline::open`] performs the first transition (any failure releases
//! what was already opened), [`Pipeline::run`] the rest.  Source, writer and
//! preview are each released exactly once on every path, including drop.

mod backend;

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Result, bail};
use tracing::{debug, error, info, warn};

pub use self::backend::{Backend, FfmpegBackend, load_painter};

use crate::config::PipelineConfig;
use crate::counting::UniqueCountTable;
use crate::detection::{TrackedDetection, TrackedDetectionSource};
use crate::display::Preview;
use crate::rendering::{AnnotationRenderer, AnnotationStyle, Painter};
use crate::snapshot::{Highlight, SnapshotEmitter};
use crate::video::{FrameSink, FrameSource, Normalizer, RgbFrame, StreamInfo};

/// Frames between two timing summaries.
const TIMING_INTERVAL: u64 = 300;
const PREVIEW_TITLE: &str = "trackcount";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Uninitialized,
    Ready,
    Running,
    Finalizing,
    Closed,
}

/// Why the frame loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    EndOfStream,
    /// `q`, Escape or a closed preview window
    Interrupted,
    /// The external cancel flag was raised
    Cancelled,
    /// The source failed to deliver a frame
    SourceError,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub frames_processed: u64,
    /// Frames whose inference failed and were treated as empty
    pub inference_failures: u64,
    pub stop_reason: StopReason,
    /// `(class label, unique ids)` in first-observation order
    pub counts: Vec<(String, usize)>,
    pub snapshots: Vec<PathBuf>,
    pub output_size: (u32, u32),
    pub video_output: Option<PathBuf>,
    /// Resources whose release reported an error
    pub release_errors: usize,
}

/// Externally owned collaborators, released in order source → writer →
/// preview.  Each slot is taken on release so nothing is closed twice.
#[derive(Default)]
struct Resources {
    source: Option<Box<dyn FrameSource>>,
    writer: Option<Box<dyn FrameSink>>,
    preview: Option<Box<dyn Preview>>,
}

impl Resources {
    /// Release everything still held.  Every release is attempted; the
    /// number of failures is returned.
    fn release(&mut self) -> usize {
        let mut failures = 0;
        if let Some(mut source) = self.source.take() {
            if let Err(e) = source.close() {
                warn!("failed to close source: {e:#}");
                failures += 1;
            }
        }
        if let Some(mut writer) = self.writer.take() {
            if let Err(e) = writer.finish() {
                warn!("failed to finalize video output: {e:#}");
                failures += 1;
            }
        }
        if let Some(mut preview) = self.preview.take() {
            if let Err(e) = preview.close() {
                warn!("failed to close preview: {e:#}");
                failures += 1;
            }
        }
        failures
    }
}

impl Drop for Resources {
    fn drop(&mut self) {
        self.release();
    }
}

#[derive(Default)]
struct StageTimings {
    frames: u64,
    normalize: Duration,
    infer: Duration,
    annotate: Duration,
    write: Duration,
}

impl StageTimings {
    fn tick(&mut self) {
        self.frames += 1;
        if self.frames % TIMING_INTERVAL == 0 {
            let frames = self.frames as f64;
            let per_frame = |d: Duration| format!("{:.2}", d.as_secs_f64() * 1000.0 / frames);
            info!(
                frames = self.frames,
                normalize_ms_per_frame = per_frame(self.normalize),
                infer_ms_per_frame = per_frame(self.infer),
                annotate_ms_per_frame = per_frame(self.annotate),
                write_ms_per_frame = per_frame(self.write),
                "pipeline timings"
            );
        }
    }
}

pub struct Pipeline {
    state: PipelineState,
    config: PipelineConfig,
    info: StreamInfo,
    resources: Resources,
    detector: Box<dyn TrackedDetectionSource>,
    normalizer: Normalizer,
    renderer: AnnotationRenderer,
    painter: Painter,
    counts: UniqueCountTable,
    snapshots: Option<SnapshotEmitter>,
    snapshot_paths: Vec<PathBuf>,
    video_output: Option<PathBuf>,
    cancel: Arc<AtomicBool>,
    progress: Option<Box<dyn FnMut(u64)>>,
    frames_processed: u64,
    inference_failures: u64,
    timings: StageTimings,
}

impl Pipeline {
    /// Validate `config` and open every collaborator through `backend`.
    ///
    /// Configuration and input-path problems fail before anything is opened.
    /// A failing source, detector or writer releases whatever was already
    /// open.  A failing preview only disables the preview.
    pub fn open<B: Backend + ?Sized>(config: PipelineConfig, backend: &mut B) -> Result<Self> {
        config.validate()?;
        config.check_inputs()?;

        let mut resources = Resources::default();
        let source = backend.open_source(&config)?;
        let info = source.info();
        resources.source = Some(source);

        let normalizer = Normalizer::new(&info, config.target_width)?;
        let (width, height) = normalizer.output_size();
        info!(
            video = %config.video_path.display(),
            src_width = info.width,
            src_height = info.height,
            fps = info.fps,
            width,
            height,
            "source opened"
        );

        let detector = backend.open_detector(&config)?;

        let video_output = if config.save_video {
            let path = config.video_output_path();
            resources.writer = Some(backend.open_writer(&path, width, height, &info)?);
            info!(path = %path.display(), "recording annotated video");
            Some(path)
        } else {
            None
        };

        if config.display_video {
            match backend.open_preview(PREVIEW_TITLE, width, height) {
                Ok(preview) => resources.preview = Some(preview),
                Err(e) => warn!("preview unavailable, continuing headless: {e:#}"),
            }
        }

        let painter = backend.painter(&config);
        let renderer = AnnotationRenderer::new(AnnotationStyle::uniform(
            config.annotation_color,
            config.font_scale,
        ));
        let snapshots = config.save_snapshots.then(|| {
            let emitter = SnapshotEmitter::new(&config.output_root, &config.video_stem());
            info!(dir = %emitter.dir().display(), "saving per-track snapshots");
            emitter
        });

        Ok(Self {
            state: PipelineState::Ready,
            config,
            info,
            resources,
            detector,
            normalizer,
            renderer,
            painter,
            counts: UniqueCountTable::new(),
            snapshots,
            snapshot_paths: Vec::new(),
            video_output,
            cancel: Arc::new(AtomicBool::new(false)),
            progress: None,
            frames_processed: 0,
            inference_failures: 0,
            timings: StageTimings::default(),
        })
    }

    /// Use `flag` as the external cancel signal.
    pub fn with_cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = flag;
        self
    }

    /// Call `f` with the number of frames processed so far after each frame.
    pub fn on_progress(mut self, f: impl FnMut(u64) + 'static) -> Self {
        self.progress = Some(Box::new(f));
        self
    }

    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn stream_info(&self) -> StreamInfo {
        self.info
    }

    pub fn output_size(&self) -> (u32, u32) {
        self.normalizer.output_size()
    }

    /// Process the whole stream, then release every resource.
    pub fn run(&mut self) -> Result<RunSummary> {
        if self.state != PipelineState::Ready {
            bail!("pipeline cannot run from state {:?}", self.state);
        }
        self.state = PipelineState::Running;
        info!("pipeline running");

        let stop_reason = self.frame_loop();

        self.state = PipelineState::Finalizing;
        info!(?stop_reason, frames = self.frames_processed, "finalizing");
        let release_errors = self.resources.release();
        self.state = PipelineState::Closed;

        for (label, count) in self.counts.counts() {
            info!(class = %label, count, "unique objects");
        }

        Ok(RunSummary {
            frames_processed: self.frames_processed,
            inference_failures: self.inference_failures,
            stop_reason,
            counts: self.counts.counts(),
            snapshots: std::mem::take(&mut self.snapshot_paths),
            output_size: self.normalizer.output_size(),
            video_output: self.video_output.clone(),
            release_errors,
        })
    }

    fn frame_loop(&mut self) -> StopReason {
        loop {
            if self.cancel.load(Ordering::Relaxed) {
                return StopReason::Cancelled;
            }

            let Some(source) = self.resources.source.as_mut() else {
                return StopReason::EndOfStream;
            };
            let mut frame = match source.next_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => return StopReason::EndOfStream,
                Err(e) => {
                    error!("failed to read frame: {e:#}");
                    return StopReason::SourceError;
                }
            };

            self.process_frame(&mut frame);
            if self.interrupt_requested() {
                return if self.cancel.load(Ordering::Relaxed) {
                    StopReason::Cancelled
                } else {
                    StopReason::Interrupted
                };
            }
        }
    }

    /// Run one frame through every stage.  Frames that cannot be normalized
    /// are dropped.
    fn process_frame(&mut self, frame: &mut RgbFrame) {
        let t = Instant::now();
        if let Err(e) = self.normalizer.normalize(frame) {
            warn!(pts = frame.pts, "skipping frame, normalization failed: {e:#}");
            return;
        }
        self.timings.normalize += t.elapsed();

        let t = Instant::now();
        let detections = match self.detector.infer(frame) {
            Ok(detections) => detections,
            Err(e) => {
                warn!(pts = frame.pts, "inference failed, treating frame as empty: {e:#}");
                self.inference_failures += 1;
                Vec::new()
            }
        };
        self.timings.infer += t.elapsed();
        debug!(
            pts = frame.pts,
            detections = detections.len(),
            tracked = detections.iter().filter(|d| d.track_id.is_some()).count(),
            "frame inferred"
        );

        let t = Instant::now();
        self.annotate(frame, &detections);
        self.timings.annotate += t.elapsed();

        let t = Instant::now();
        if let Some(writer) = self.resources.writer.as_mut() {
            if let Err(e) = writer.write(frame) {
                warn!(pts = frame.pts, "video write failed: {e:#}");
            }
        }
        self.timings.write += t.elapsed();

        if let Some(preview) = self.resources.preview.as_mut() {
            if let Err(e) = preview.show(frame) {
                warn!("preview update failed: {e:#}");
            }
        }

        self.frames_processed += 1;
        self.timings.tick();
        if let Some(progress) = self.progress.as_mut() {
            progress(self.frames_processed);
        }
    }

    /// Aggregation, snapshots, boxes and labels, then the count overlay.
    /// Snapshots paint their own boxes on a copy, so they never carry the
    /// overlay or boxes of later detections.
    fn annotate(&mut self, frame: &mut RgbFrame, detections: &[TrackedDetection]) {
        let new_ids = self.counts.observe(detections);

        if new_ids > 0 {
            debug!(new_ids, total = self.counts.total(), "new tracks counted");
        }

        if let Some(emitter) = self.snapshots.as_mut() {
            let highlight = Highlight {
                renderer: &self.renderer,
                painter: &self.painter,
            };
            let written = emitter.maybe_emit(detections, frame, Some(&highlight));
            self.snapshot_paths.extend(written);
        }

        if self.config.annotate {
            if let Err(e) = self.renderer.render(frame, detections, &self.painter) {
                warn!("annotation failed: {e:#}");
            }
        }

        let overlay = self.counts.overlay(frame, self.renderer.style(), &self.painter);
        if let Err(e) = overlay {
            warn!("count overlay failed: {e:#}");
        }
    }

    fn interrupt_requested(&mut self) -> bool {
        if self.cancel.load(Ordering::Relaxed) {
            return true;
        }
        self.resources
            .preview
            .as_mut()
            .is_some_and(|preview| preview.interrupt_requested())
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        if self.state != PipelineState::Closed {
            debug!(state = ?self.state, "pipeline dropped before completion; releasing resources");
            self.state = PipelineState::Finalizing;
            self.resources.release();
            self.state = PipelineState::Closed;
        }
    }
}
