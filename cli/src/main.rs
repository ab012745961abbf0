use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

use trackcount_core::{
    FfmpegBackend, Pipeline, PipelineConfig, RunSummary,
    rendering::{Color, FontScale},
    tracking::TrackerAlgorithm,
    video::{FfmpegSource, FrameSource, normalized_size, total_frames},
};

// ── CLI definition ────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(
    name = "trackcount",
    version,
    about = "Count unique tracked objects per class in a video",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Detect, track and count objects; optionally record, preview and snapshot.
    Count(CountArgs),

    /// Print stream geometry, frame rate and the normalized output size.
    Inspect {
        /// Input video path
        #[arg(short, long)]
        video: PathBuf,

        /// Width frames would be normalized to
        #[arg(long, default_value_t = 1000)]
        target_width: u32,
    },
}

#[derive(clap::Args)]
struct CountArgs {
    /// TOML config file; flags below override its values
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Input video path
    #[arg(short, long)]
    video: Option<PathBuf>,

    /// YOLOv8 ONNX model path
    #[arg(long)]
    model: Option<PathBuf>,

    /// Class names, one per line (defaults to the model's metadata)
    #[arg(long)]
    classes: Option<PathBuf>,

    /// Record the annotated video
    #[arg(long)]
    save_video: bool,

    /// Recorded video path (default: results/result_<input name>)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Show a live preview; press q or Escape to stop
    #[arg(long)]
    display: bool,

    /// Save a JPEG the first time each track appears
    #[arg(long)]
    snapshots: bool,

    /// Skip drawing boxes and labels on every frame
    #[arg(long)]
    no_annotate: bool,

    /// Width every frame is rescaled to
    #[arg(long)]
    target_width: Option<u32>,

    /// Detection confidence threshold (0–1)
    #[arg(long)]
    confidence: Option<f32>,

    /// NMS overlap threshold (0–1)
    #[arg(long)]
    iou: Option<f32>,

    /// Model input resolution
    #[arg(long)]
    imgsz: Option<u32>,

    /// Tracking algorithm
    #[arg(long, value_enum)]
    tracker: Option<TrackerArg>,

    /// Annotation color: RED, GREEN, BLUE, BLACK, WHITE or r,g,b
    #[arg(long)]
    color: Option<Color>,

    /// Label size: small, average, big, extra_large or a number
    #[arg(long)]
    font_scale: Option<FontScale>,

    /// Snapshot root directory
    #[arg(long)]
    output_root: Option<PathBuf>,

    /// Snapshot sub-directory (default: input file stem)
    #[arg(long)]
    stem: Option<String>,

    /// TrueType font for labels
    #[arg(long)]
    font: Option<PathBuf>,
}

#[derive(Clone, Copy, ValueEnum)]
enum TrackerArg {
    Bytetrack,
    Iou,
}

impl From<TrackerArg> for TrackerAlgorithm {
    fn from(arg: TrackerArg) -> Self {
        match arg {
            TrackerArg::Bytetrack => TrackerAlgorithm::ByteTrack,
            TrackerArg::Iou => TrackerAlgorithm::Iou,
        }
    }
}

impl CountArgs {
    fn into_config(self) -> Result<PipelineConfig> {
        let mut config = match &self.config {
            Some(path) => PipelineConfig::from_file(path)?,
            None => PipelineConfig::default(),
        };

        if let Some(video) = self.video {
            config.video_path = video;
        }
        if let Some(model) = self.model {
            config.model_path = model;
        }
        if self.classes.is_some() {
            config.classes_path = self.classes;
        }
        config.save_video |= self.save_video;
        if self.output.is_some() {
            config.video_output = self.output;
        }
        config.display_video |= self.display;
        config.save_snapshots |= self.snapshots;
        if self.no_annotate {
            config.annotate = false;
        }
        if let Some(width) = self.target_width {
            config.target_width = width;
        }
        if let Some(confidence) = self.confidence {
            config.detection.confidence_threshold = confidence;
        }
        if let Some(iou) = self.iou {
            config.detection.iou_threshold = iou;
        }
        if let Some(size) = self.imgsz {
            config.detection.inference_size = size;
        }
        if let Some(tracker) = self.tracker {
            config.tracker.algorithm = tracker.into();
        }
        if let Some(color) = self.color {
            config.annotation_color = color;
        }
        if let Some(scale) = self.font_scale {
            config.font_scale = scale;
        }
        if let Some(root) = self.output_root {
            config.output_root = root;
        }
        if self.stem.is_some() {
            config.video_stem = self.stem;
        }
        if self.font.is_some() {
            config.font_path = self.font;
        }

        if config.video_path.as_os_str().is_empty() {
            anyhow::bail!("no input video; pass --video or set video_path in the config file");
        }
        Ok(config)
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

fn main() -> Result<()> {
    // Respect RUST_LOG; default to info
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Count(args) => cmd_count(args),
        Commands::Inspect {
            video,
            target_width,
        } => cmd_inspect(video, target_width),
    }
}

// ── count ─────────────────────────────────────────────────────────────────────

fn cmd_count(args: CountArgs) -> Result<()> {
    let config = args.into_config()?;
    info!("Counting tracked objects");
    info!("  video  : {}", config.video_path.display());
    info!("  model  : {}", config.model_path.display());

    let total = total_frames(&config.video_path);
    let pb = if total > 0 {
        progress_bar(total)?
    } else {
        spinner("Counting…")?
    };
    let pb2 = pb.clone();

    let mut backend = FfmpegBackend;
    let mut pipeline = Pipeline::open(config, &mut backend)
        .context("failed to start the pipeline")?
        .on_progress(move |done| pb2.set_position(done));
    let source = pipeline.stream_info();
    let (out_w, out_h) = pipeline.output_size();
    info!(
        "  source : {}x{} @ {:.2} fps -> {out_w}x{out_h}",
        source.width, source.height, source.fps
    );

    let summary = pipeline.run()?;
    pb.finish_with_message("Done.");
    print_summary(&summary);
    Ok(())
}

fn print_summary(summary: &RunSummary) {
    println!();
    println!(
        "Processed {} frames at {}x{} ({:?})",
        summary.frames_processed, summary.output_size.0, summary.output_size.1, summary.stop_reason
    );
    if summary.inference_failures > 0 {
        println!("  {} frames had failed inference", summary.inference_failures);
    }
    if summary.counts.is_empty() {
        println!("No tracked objects.");
    } else {
        let width = summary
            .counts
            .iter()
            .map(|(label, _)| label.len())
            .max()
            .unwrap_or(0);
        for (label, count) in &summary.counts {
            println!("  {label:<width$}  {count}");
        }
    }
    if let Some(path) = &summary.video_output {
        println!("Video     : {}", path.display());
    }
    if !summary.snapshots.is_empty() {
        println!("Snapshots : {}", summary.snapshots.len());
    }
}

// ── inspect ───────────────────────────────────────────────────────────────────

fn cmd_inspect(video: PathBuf, target_width: u32) -> Result<()> {
    let mut source = FfmpegSource::open(&video)
        .with_context(|| format!("failed to open {}", video.display()))?;
    let stream = source.info();
    source.close()?;

    let (width, height) = normalized_size(stream.width, stream.height, target_width);
    println!("{}", video.display());
    println!("  size       : {}x{}", stream.width, stream.height);
    println!("  fps        : {:.3}", stream.fps);
    println!("  frames     : ~{}", total_frames(&video));
    println!("  normalized : {width}x{height} (target width {target_width})");
    Ok(())
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn spinner(msg: &str) -> Result<ProgressBar> {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::with_template("{spinner:.cyan} {msg} {pos} frames [{elapsed_precise}]")?
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
    );
    pb.set_message(msg.to_string());
    pb.enable_steady_tick(std::time::Duration::from_millis(80));
    Ok(pb)
}

fn progress_bar(total: u64) -> Result<ProgressBar> {
    let pb = ProgressBar::new(total);
    pb.set_style(
        ProgressStyle::with_template(
            "{bar:40.cyan/blue} {pos}/{len} frames [{elapsed_precise} < {eta_precise}]",
        )?
        .progress_chars("█▉▊▋▌▍▎▏ "),
    );
    Ok(pb)
}
