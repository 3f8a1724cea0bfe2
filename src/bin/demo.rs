//! demo - end-to-end synthetic run of the fusion pipeline

use anyhow::{anyhow, Result};
use clap::Parser;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use fusion_pipeline::config::{DepthSettings, DetectorSettings};
use fusion_pipeline::{
    BackendRegistry, DeliveryMode, DepthSampling, Detection, DetectorBackend, Frame,
    FusedResult, InferenceError, Pipeline, PipelineConfig, SyntheticSource, TrackerConfig,
};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Number of synthetic frames to generate.
    #[arg(long, default_value_t = 100)]
    frames: u64,
    /// Frames per second for the synthetic source (0 = unpaced).
    #[arg(long, default_value_t = 30)]
    fps: u32,
    #[arg(long, default_value_t = 640)]
    width: u32,
    #[arg(long, default_value_t = 480)]
    height: u32,
    /// Detector backend name.
    #[arg(long, default_value = "color")]
    detector: String,
    /// Depth backend name.
    #[arg(long, default_value = "luminance")]
    depth: String,
    /// Make the detector fail on every Nth frame.
    #[arg(long)]
    fail_every: Option<u64>,
    /// Callback delivery: inline or threaded.
    #[arg(long, default_value = "inline")]
    delivery: DeliveryMode,
    /// Depth sampling per box: center, median or min.
    #[arg(long, default_value = "center")]
    sampling: DepthSampling,
    /// Track objects across frames.
    #[arg(long)]
    track: bool,
    /// Print one JSON line per fused result.
    #[arg(long)]
    json: bool,
}

/// Wraps a detector and fails it on every Nth frame.
struct FlakyDetector {
    inner: Box<dyn DetectorBackend>,
    fail_every: u64,
}

impl DetectorBackend for FlakyDetector {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    fn infer(&mut self, frame: &Frame) -> Result<Vec<Detection>, InferenceError> {
        if frame.sequence() % self.fail_every == 0 {
            return Err(InferenceError::model(format!(
                "injected failure on frame {}",
                frame.sequence()
            )));
        }
        self.inner.infer(frame)
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();
    if args.fail_every == Some(0) {
        return Err(anyhow!("--fail-every must be >= 1"));
    }

    let registry = BackendRegistry::with_builtin();
    let mut detector = registry.create_detector(&DetectorSettings {
        backend: args.detector.clone(),
        ..DetectorSettings::default()
    })?;
    if let Some(fail_every) = args.fail_every {
        detector = Box::new(FlakyDetector {
            inner: detector,
            fail_every,
        });
    }
    let depth = registry.create_depth(&DepthSettings {
        backend: args.depth.clone(),
        ..DepthSettings::default()
    })?;

    let source = SyntheticSource::new("demo", args.width, args.height)?
        .with_fps(args.fps)
        .with_max_frames(Some(args.frames));

    stage("run pipeline");
    let objects_seen = Arc::new(AtomicU64::new(0));
    let objects = objects_seen.clone();
    let tracks_opened = Arc::new(AtomicU64::new(0));
    let opened = tracks_opened.clone();
    let json = args.json;
    let min_hits = TrackerConfig::default().min_hits;
    let mut handle = Pipeline::builder()
        .detector(detector)
        .depth(depth)
        .frame_source(source)
        .on_result(move |result: FusedResult| {
            objects.fetch_add(result.objects.len() as u64, Ordering::Relaxed);
            // A track is reported for the first time on the frame that confirms it.
            let confirmed = result.tracks.iter().filter(|t| t.frames_tracked == min_hits);
            opened.fetch_add(confirmed.count() as u64, Ordering::Relaxed);
            if json {
                println!("{}", serde_json::to_string(&result.summary())?);
            }
            Ok(())
        })
        .config(PipelineConfig {
            delivery: args.delivery,
            sampling: args.sampling,
            tracking: args.track.then(TrackerConfig::default),
            ..PipelineConfig::default()
        })
        .build()?
        .start()?;

    let report = handle.wait()?;

    println!("demo summary:");
    println!("  frames generated: {}", args.frames);
    println!("  frames accepted: {}", report.stats.frames_accepted);
    println!("  frames dropped (busy): {}", report.stats.frames_dropped);
    println!("  frames failed: {}", report.stats.frames_failed);
    println!("  results delivered: {}", report.stats.results_delivered);
    println!(
        "  objects located: {}",
        objects_seen.load(Ordering::Relaxed)
    );
    if args.track {
        println!("  tracks confirmed: {}", tracks_opened.load(Ordering::Relaxed));
    }
    if let Some(source) = &report.source {
        println!("  source frames captured: {}", source.frames_captured);
    }
    println!("  final state: {}", report.final_state);
    Ok(())
}

fn stage(msg: &str) {
    eprintln!("demo: {}", msg);
}
