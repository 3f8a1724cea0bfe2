//! fusiond - realtime detection + depth fusion daemon
//!
//! This daemon:
//! 1. Loads `FusionConfig` (FUSION_CONFIG file + FUSION_* overrides)
//! 2. Builds the configured detector and depth backends from the registry
//! 3. Opens the configured frame source (stub://, /dev/videoN)
//! 4. Runs the pipeline until Ctrl-C or end of stream, logging stats every 5 seconds
//! 5. Drains in-flight frames, logs the source counters and prints the final report as JSON

use anyhow::Result;
use std::sync::mpsc::RecvTimeoutError;
use std::time::{Duration, Instant};

use fusion_pipeline::{
    BackendRegistry, BackendRole, FusedResult, FusionConfig, Pipeline, PipelineEvent,
    PipelineState,
};

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cfg = FusionConfig::load()?;
    let registry = BackendRegistry::with_builtin();
    let detector = registry.create_detector(&cfg.detector)?;
    let depth = registry.create_depth(&cfg.depth)?;

    log::info!(
        "fusiond {} starting: source={} detector={} depth={} delivery={:?} tracking={}",
        env!("CARGO_PKG_VERSION"),
        cfg.source.url,
        cfg.detector.backend,
        cfg.depth.backend,
        cfg.pipeline.delivery,
        cfg.tracking.is_some()
    );

    let mut handle = Pipeline::builder()
        .detector(detector)
        .depth(depth)
        .on_result(|result: FusedResult| {
            for object in &result.objects {
                log::debug!(
                    "frame {}: {} ({:.2}) at {:.2} m, xyz=({:.2}, {:.2}, {:.2})",
                    result.sequence,
                    object.detection.label,
                    object.detection.confidence,
                    object.depth_m,
                    object.position[0],
                    object.position[1],
                    object.position[2]
                );
            }
            for track in result.tracks.iter().filter(|t| t.is_new) {
                log::debug!("frame {}: new track {} ({})", result.sequence, track.id, track.label);
            }
            Ok(())
        })
        .source_settings(cfg.source.clone())
        .config(cfg.pipeline_config())
        .build()?
        .start()?;

    let stop = handle.stop_handle();
    ctrlc::set_handler(move || {
        stop.stop();
    })
    .expect("error setting Ctrl-C handler");

    let stop = handle.stop_handle();
    let mut last_stats_log = Instant::now();
    log::info!("fusiond running (Ctrl-C to stop)");

    while handle.state() == PipelineState::Running && !stop.is_stop_requested() {
        match handle.events().recv_timeout(Duration::from_millis(250)) {
            Ok(PipelineEvent::BackendUnhealthy {
                role,
                consecutive_failures,
            }) => log::error!("{}", unhealthy_message(role, consecutive_failures)),
            Ok(_) | Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }

        if last_stats_log.elapsed() >= Duration::from_secs(5) {
            let stats = handle.stats();
            log::info!(
                "accepted={} delivered={} dropped={} failed={} callback_failures={}",
                stats.frames_accepted,
                stats.results_delivered,
                stats.frames_dropped,
                stats.frames_failed,
                stats.callback_failures
            );
            last_stats_log = Instant::now();
        }
    }

    log::info!("shutting down, draining in-flight frames...");
    let report = handle.wait()?;
    match &report.source {
        Some(source) => log::info!(
            "source {} captured {} frames",
            source.source,
            source.frames_captured
        ),
        None => log::warn!("frame source was abandoned during shutdown"),
    }
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

/// Failed frames are dropped and the backend is called again on the next one.
fn unhealthy_message(role: BackendRole, consecutive_failures: u32) -> String {
    format!(
        "{} backend unhealthy after {} consecutive failures, still retrying every frame",
        role, consecutive_failures
    )
}
