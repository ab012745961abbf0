//! Factories for the pipeline's external collaborators.
//!
//! [`Pipeline::open`](super::Pipeline::open) asks a [`Backend`] for every
//! resource it needs, so the frame loop can be driven by FFmpeg/ORT/minifb in
//! production and by in-memory fakes in tests.

use std::path::Path;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::config::PipelineConfig;
use crate::detection::{TrackedDetectionSource, YoloDetector};
use crate::display::{Preview, PreviewWindow};
use crate::rendering::Painter;
use crate::runtime::{configure_ort_dylib, find_font};
use crate::tracking::TrackingDetector;
use crate::video::{FfmpegSource, FfmpegWriter, FrameSink, FrameSource, StreamInfo};

pub trait Backend {
    fn open_source(&mut self, config: &PipelineConfig) -> Result<Box<dyn FrameSource>>;

    fn open_detector(&mut self, config: &PipelineConfig)
    -> Result<Box<dyn TrackedDetectionSource>>;

    /// Open a sink for `width × height` frames at the source rate.
    fn open_writer(
        &mut self,
        path: &Path,
        width: u32,
        height: u32,
        source: &StreamInfo,
    ) -> Result<Box<dyn FrameSink>>;

    fn open_preview(&mut self, title: &str, width: u32, height: u32) -> Result<Box<dyn Preview>>;

    /// Painter used for boxes, labels and the count overlay.
    fn painter(&mut self, config: &PipelineConfig) -> Painter {
        load_painter(config.font_path.as_deref())
    }
}

/// The production collaborators: FFmpeg decode/encode, YOLOv8 on ONNX
/// Runtime with the built-in tracker, and a minifb preview window.
#[derive(Debug, Default, Clone, Copy)]
pub struct FfmpegBackend;

impl Backend for FfmpegBackend {
    fn open_source(&mut self, config: &PipelineConfig) -> Result<Box<dyn FrameSource>> {
        Ok(Box::new(FfmpegSource::open(&config.video_path)?))
    }

    fn open_detector(
        &mut self,
        config: &PipelineConfig,
    ) -> Result<Box<dyn TrackedDetectionSource>> {
        configure_ort_dylib();
        let detector = YoloDetector::load(
            &config.model_path,
            config.detection,
            config.classes_path.as_deref(),
        )?;
        Ok(Box::new(TrackingDetector::new(detector, config.tracker)))
    }

    fn open_writer(
        &mut self,
        path: &Path,
        width: u32,
        height: u32,
        source: &StreamInfo,
    ) -> Result<Box<dyn FrameSink>> {
        Ok(Box::new(FfmpegWriter::create(path, width, height, source.fps)?))
    }

    fn open_preview(&mut self, title: &str, width: u32, height: u32) -> Result<Box<dyn Preview>> {
        Ok(Box::new(PreviewWindow::open(title, width, height)?))
    }
}

/// Painter with the configured or a discovered font; rectangles only when
/// no usable font exists.
pub fn load_painter(configured: Option<&Path>) -> Painter {
    let Some(path) = find_font(configured) else {
        warn!("no label font found; set font_path to draw text annotations");
        return Painter::without_font();
    };
    match Painter::from_font_file(&path).context("label font unusable") {
        Ok(painter) => {
            info!(font = %path.display(), "label font loaded");
            painter
        }
        Err(e) => {
            warn!("{e:#}");
            Painter::without_font()
        }
    }
}
