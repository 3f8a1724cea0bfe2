use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::depth::DepthSampling;
use crate::detect::DetectionFilter;
use crate::fuse::DEFAULT_FOCAL_SCALE;
use crate::ingest::{SourceSettings, DEFAULT_SOURCE_URL};
use crate::pipeline::{PipelineConfig, DEFAULT_UNHEALTHY_THRESHOLD};
use crate::sink::DeliveryMode;
use crate::track::TrackerConfig;

const DEFAULT_SOURCE_WIDTH: u32 = 640;
const DEFAULT_SOURCE_HEIGHT: u32 = 480;
const DEFAULT_SOURCE_FPS: u32 = 30;
const DEFAULT_DETECTOR: &str = "color";
const DEFAULT_DEPTH: &str = "luminance";
const DEFAULT_NEAR_M: f32 = 0.5;
const DEFAULT_FAR_M: f32 = 10.0;
const DEFAULT_DEPTH_STRIDE: u32 = 4;
const DEFAULT_CONSTANT_DEPTH_M: f32 = 2.0;
const DEFAULT_DELIVERY_QUEUE: usize = 4;
const DEFAULT_DRAIN_TIMEOUT_MS: u64 = 2_000;

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct FusionConfigFile {
    source: Option<SourceConfigFile>,
    detector: Option<DetectorConfigFile>,
    depth: Option<DepthConfigFile>,
    fusion: Option<FusionSectionFile>,
    pipeline: Option<PipelineConfigFile>,
    tracking: Option<TrackingConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct SourceConfigFile {
    url: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    fps: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectorConfigFile {
    backend: Option<String>,
    min_score: Option<f32>,
    nms_iou: Option<f32>,
    max_detections: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct DepthConfigFile {
    backend: Option<String>,
    near_m: Option<f32>,
    far_m: Option<f32>,
    stride: Option<u32>,
    meters: Option<f32>,
}

#[derive(Debug, Deserialize, Default)]
struct FusionSectionFile {
    sampling: Option<DepthSampling>,
    focal_scale: Option<f32>,
}

#[derive(Debug, Deserialize, Default)]
struct PipelineConfigFile {
    delivery: Option<DeliveryMode>,
    delivery_queue: Option<usize>,
    drain_timeout_ms: Option<u64>,
    unhealthy_threshold: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct TrackingConfigFile {
    enabled: Option<bool>,
    max_objects: Option<usize>,
    max_age: Option<u32>,
    min_hits: Option<u32>,
    iou_threshold: Option<f32>,
}

/// Runtime configuration for `fusiond`.
///
/// Loaded from the JSON file named by `FUSION_CONFIG` (every field optional), then overridden
/// by environment variables, then validated.
#[derive(Debug, Clone)]
pub struct FusionConfig {
    pub source: SourceSettings,
    pub detector: DetectorSettings,
    pub depth: DepthSettings,
    pub fusion: FusionSettings,
    pub pipeline: SchedulerSettings,
    /// `None` when tracking is disabled.
    pub tracking: Option<TrackerConfig>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DetectorSettings {
    /// Registry name of the detector backend.
    pub backend: String,
    pub min_score: f32,
    pub nms_iou: f32,
    pub max_detections: usize,
}

impl Default for DetectorSettings {
    fn default() -> Self {
        let filter = DetectionFilter::default();
        Self {
            backend: DEFAULT_DETECTOR.to_string(),
            min_score: filter.min_score,
            nms_iou: filter.nms_iou,
            max_detections: filter.max_detections,
        }
    }
}

impl DetectorSettings {
    pub fn filter(&self) -> DetectionFilter {
        DetectionFilter {
            min_score: self.min_score,
            nms_iou: self.nms_iou,
            max_detections: self.max_detections,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DepthSettings {
    /// Registry name of the depth backend.
    pub backend: String,
    pub near_m: f32,
    pub far_m: f32,
    pub stride: u32,
    /// Distance used by the `constant` backend.
    pub meters: f32,
}

impl Default for DepthSettings {
    fn default() -> Self {
        Self {
            backend: DEFAULT_DEPTH.to_string(),
            near_m: DEFAULT_NEAR_M,
            far_m: DEFAULT_FAR_M,
            stride: DEFAULT_DEPTH_STRIDE,
            meters: DEFAULT_CONSTANT_DEPTH_M,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FusionSettings {
    pub sampling: DepthSampling,
    pub focal_scale: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerSettings {
    pub delivery: DeliveryMode,
    pub delivery_queue: usize,
    pub drain_timeout: Duration,
    pub unhealthy_threshold: u32,
}

impl FusionConfig {
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("FUSION_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) if !path.trim().is_empty() => Some(read_config_file(Path::new(path))?),
            _ => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: FusionConfigFile) -> Self {
        let source = file.source.unwrap_or_default();
        let detector = file.detector.unwrap_or_default();
        let depth = file.depth.unwrap_or_default();
        let fusion = file.fusion.unwrap_or_default();
        let pipeline = file.pipeline.unwrap_or_default();
        let tracking = file.tracking.unwrap_or_default();
        let tracker_defaults = TrackerConfig::default();
        let detector_defaults = DetectorSettings::default();
        let depth_defaults = DepthSettings::default();

        Self {
            source: SourceSettings {
                url: source.url.unwrap_or_else(|| DEFAULT_SOURCE_URL.to_string()),
                width: source.width.unwrap_or(DEFAULT_SOURCE_WIDTH),
                height: source.height.unwrap_or(DEFAULT_SOURCE_HEIGHT),
                fps: source.fps.unwrap_or(DEFAULT_SOURCE_FPS),
                max_frames: None,
            },
            detector: DetectorSettings {
                backend: detector.backend.unwrap_or(detector_defaults.backend),
                min_score: detector.min_score.unwrap_or(detector_defaults.min_score),
                nms_iou: detector.nms_iou.unwrap_or(detector_defaults.nms_iou),
                max_detections: detector
                    .max_detections
                    .unwrap_or(detector_defaults.max_detections),
            },
            depth: DepthSettings {
                backend: depth.backend.unwrap_or(depth_defaults.backend),
                near_m: depth.near_m.unwrap_or(depth_defaults.near_m),
                far_m: depth.far_m.unwrap_or(depth_defaults.far_m),
                stride: depth.stride.unwrap_or(depth_defaults.stride),
                meters: depth.meters.unwrap_or(depth_defaults.meters),
            },
            fusion: FusionSettings {
                sampling: fusion.sampling.unwrap_or_default(),
                focal_scale: fusion.focal_scale.unwrap_or(DEFAULT_FOCAL_SCALE),
            },
            pipeline: SchedulerSettings {
                delivery: pipeline.delivery.unwrap_or_default(),
                delivery_queue: pipeline.delivery_queue.unwrap_or(DEFAULT_DELIVERY_QUEUE),
                drain_timeout: Duration::from_millis(
                    pipeline.drain_timeout_ms.unwrap_or(DEFAULT_DRAIN_TIMEOUT_MS),
                ),
                unhealthy_threshold: pipeline
                    .unhealthy_threshold
                    .unwrap_or(DEFAULT_UNHEALTHY_THRESHOLD),
            },
            tracking: tracking.enabled.unwrap_or(false).then(|| TrackerConfig {
                max_objects: tracking.max_objects.unwrap_or(tracker_defaults.max_objects),
                max_age: tracking.max_age.unwrap_or(tracker_defaults.max_age),
                min_hits: tracking.min_hits.unwrap_or(tracker_defaults.min_hits),
                iou_threshold: tracking
                    .iou_threshold
                    .unwrap_or(tracker_defaults.iou_threshold),
            }),
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(url) = std::env::var("FUSION_SOURCE_URL") {
            if !url.trim().is_empty() {
                self.source.url = url;
            }
        }
        if let Ok(name) = std::env::var("FUSION_DETECTOR") {
            if !name.trim().is_empty() {
                self.detector.backend = name.trim().to_string();
            }
        }
        if let Ok(name) = std::env::var("FUSION_DEPTH") {
            if !name.trim().is_empty() {
                self.depth.backend = name.trim().to_string();
            }
        }
        if let Ok(mode) = std::env::var("FUSION_DELIVERY") {
            self.pipeline.delivery = mode
                .parse()
                .map_err(|e| anyhow!("FUSION_DELIVERY: {}", e))?;
        }
        if let Ok(timeout) = std::env::var("FUSION_DRAIN_TIMEOUT_MS") {
            let millis: u64 = timeout.trim().parse().map_err(|_| {
                anyhow!("FUSION_DRAIN_TIMEOUT_MS must be an integer number of milliseconds")
            })?;
            self.pipeline.drain_timeout = Duration::from_millis(millis);
        }
        if let Ok(threshold) = std::env::var("FUSION_UNHEALTHY_THRESHOLD") {
            self.pipeline.unhealthy_threshold = threshold
                .trim()
                .parse()
                .map_err(|_| anyhow!("FUSION_UNHEALTHY_THRESHOLD must be a positive integer"))?;
        }
        if let Ok(flag) = std::env::var("FUSION_TRACKING") {
            match flag.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "on" => {
                    self.tracking.get_or_insert_with(TrackerConfig::default);
                }
                "0" | "false" | "off" => self.tracking = None,
                other => {
                    return Err(anyhow!(
                        "FUSION_TRACKING must be one of 1/true/on or 0/false/off (got '{}')",
                        other
                    ))
                }
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.source.url.trim().is_empty() {
            return Err(anyhow!("source url must not be empty"));
        }
        if self.source.width == 0 || self.source.height == 0 {
            return Err(anyhow!(
                "source dimensions must be non-zero (got {}x{})",
                self.source.width,
                self.source.height
            ));
        }
        if !(0.0..=1.0).contains(&self.detector.min_score) {
            return Err(anyhow!("detector.min_score must be within [0, 1]"));
        }
        if !(0.0..=1.0).contains(&self.detector.nms_iou) {
            return Err(anyhow!("detector.nms_iou must be within [0, 1]"));
        }
        if self.detector.max_detections == 0 {
            return Err(anyhow!("detector.max_detections must be greater than zero"));
        }
        if !(self.depth.near_m > 0.0 && self.depth.near_m < self.depth.far_m) {
            return Err(anyhow!(
                "depth range must satisfy 0 < near_m < far_m (got {} .. {})",
                self.depth.near_m,
                self.depth.far_m
            ));
        }
        if self.depth.stride == 0 {
            return Err(anyhow!("depth.stride must be greater than zero"));
        }
        if !(self.depth.meters > 0.0) {
            return Err(anyhow!("depth.meters must be positive"));
        }
        if !(self.fusion.focal_scale > 0.0) {
            return Err(anyhow!("fusion.focal_scale must be positive"));
        }
        if self.pipeline.delivery_queue == 0 {
            return Err(anyhow!("pipeline.delivery_queue must be greater than zero"));
        }
        if self.pipeline.drain_timeout.is_zero() {
            return Err(anyhow!("pipeline drain timeout must be greater than zero"));
        }
        if self.pipeline.unhealthy_threshold == 0 {
            return Err(anyhow!("pipeline.unhealthy_threshold must be greater than zero"));
        }
        if let Some(tracking) = &self.tracking {
            if tracking.max_objects == 0 {
                return Err(anyhow!("tracking.max_objects must be greater than zero"));
            }
            if tracking.min_hits == 0 {
                return Err(anyhow!("tracking.min_hits must be greater than zero"));
            }
            if !(0.0..=1.0).contains(&tracking.iou_threshold) {
                return Err(anyhow!("tracking.iou_threshold must be within [0, 1]"));
            }
        }
        Ok(())
    }

    /// Scheduler options derived from this configuration.
    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            delivery: self.pipeline.delivery,
            delivery_queue: self.pipeline.delivery_queue,
            drain_timeout: self.pipeline.drain_timeout,
            unhealthy_threshold: self.pipeline.unhealthy_threshold,
            filter: self.detector.filter(),
            sampling: self.fusion.sampling,
            focal_scale: self.fusion.focal_scale,
            intrinsics: None,
            tracking: self.tracking,
        }
    }
}

fn read_config_file(path: &Path) -> Result<FusionConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}
