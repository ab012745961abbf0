//! config — run configuration, loadable from TOML and validated up front

use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::detection::InferenceConfig;
use crate::rendering::{Color, FontScale};
use crate::tracking::TrackerConfig;

/// Fatal configuration problems.  Any of these stops the pipeline before the
/// first frame is read.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("input video not found: {}", .0.display())]
    MissingVideo(PathBuf),

    #[error("model not found: {}", .0.display())]
    MissingModel(PathBuf),

    #[error("classes file not found: {}", .0.display())]
    MissingClasses(PathBuf),

    #[error("target width must be greater than zero (got {0})")]
    InvalidTargetWidth(u32),

    #[error("inference size must be greater than zero")]
    InvalidInferenceSize,

    #[error("{name} must be within [0, 1] (got {value})")]
    ThresholdOutOfRange { name: &'static str, value: f32 },

    #[error("track buffer must be at least one frame")]
    InvalidTrackBuffer,

    #[error("unknown color {0:?}; expected RED, GREEN, BLUE, BLACK, WHITE or r,g,b")]
    InvalidColor(String),

    #[error(
        "invalid font scale {0:?}; expected small, average, big, extra_large or a positive number"
    )]
    InvalidFontScale(String),

    #[error("failed to read config file {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// Everything one pipeline run needs to know.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    /// Input video container
    pub video_path: PathBuf,
    /// YOLOv8 ONNX model
    pub model_path: PathBuf,
    /// Optional class-name list, one name per line, overriding model metadata
    pub classes_path: Option<PathBuf>,
    /// Record the annotated stream
    pub save_video: bool,
    /// Where to record; defaults to `results/result_<input file name>`
    pub video_output: Option<PathBuf>,
    /// Show a live preview window
    pub display_video: bool,
    /// Draw boxes and labels on every frame
    pub annotate: bool,
    /// Save one JPEG per newly seen track
    pub save_snapshots: bool,
    /// Width every frame is rescaled to
    pub target_width: u32,
    pub detection: InferenceConfig,
    pub tracker: TrackerConfig,
    pub annotation_color: Color,
    pub font_scale: FontScale,
    /// Root directory for snapshots
    pub output_root: PathBuf,
    /// Snapshot sub-directory; defaults to the input file stem
    pub video_stem: Option<String>,
    /// TrueType font for labels; discovered automatically when unset
    pub font_path: Option<PathBuf>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            video_path: PathBuf::new(),
            model_path: PathBuf::from("yolov8n.onnx"),
            classes_path: None,
            save_video: false,
            video_output: None,
            display_video: false,
            annotate: true,
            save_snapshots: false,
            target_width: 1000,
            detection: InferenceConfig::default(),
            tracker: TrackerConfig::default(),
            annotation_color: Color::Green,
            font_scale: FontScale::Average,
            output_root: PathBuf::from("snapshots"),
            video_stem: None,
            font_path: None,
        }
    }
}

impl PipelineConfig {
    /// Load a TOML config file.  Missing keys keep their defaults.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_toml_str(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Range checks that do not touch the filesystem.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.target_width == 0 {
            return Err(ConfigError::InvalidTargetWidth(self.target_width));
        }
        self.detection.validate()?;
        self.tracker.validate()?;
        Ok(())
    }

    /// Existence checks on the input video, the model and the classes file.
    pub fn check_inputs(&self) -> Result<(), ConfigError> {
        if !self.video_path.is_file() {
            return Err(ConfigError::MissingVideo(self.video_path.clone()));
        }
        if !self.model_path.is_file() {
            return Err(ConfigError::MissingModel(self.model_path.clone()));
        }
        if let Some(classes) = &self.classes_path {
            if !classes.is_file() {
                return Err(ConfigError::MissingClasses(classes.clone()));
            }
        }
        Ok(())
    }

    /// Snapshot sub-directory name for this run.
    pub fn video_stem(&self) -> String {
        self.video_stem.clone().unwrap_or_else(|| {
            self.video_path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| "video".to_string())
        })
    }

    /// Output path of the recorded video.
    pub fn video_output_path(&self) -> PathBuf {
        self.video_output.clone().unwrap_or_else(|| {
            let name = self
                .video_path
                .file_name()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| "video.mp4".to_string());
            PathBuf::from("results").join(format!("result_{name}"))
        })
    }
}
