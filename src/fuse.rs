//! Result fusion.
//!
//! Pairs the detector output and the depth map produced for the same frame, samples a depth
//! for every detection and back-projects the box centre into camera space. Fusion is a pure
//! step: no retries, no buffering, no partial results.

use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::depth::{DepthMap, DepthSampling};
use crate::detect::{Detection, DetectionSet};
use crate::frame::FrameMeta;
use crate::track::Track;

/// Default focal length as a fraction of the image width.
pub const DEFAULT_FOCAL_SCALE: f32 = 0.8;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FuseError {
    #[error("frame {0} has no detection output")]
    MissingDetections(u64),
    #[error("frame {0} has no depth output")]
    MissingDepth(u64),
    #[error("sequence mismatch for frame {frame}: detections={detections}, depth={depth}")]
    SequenceMismatch { frame: u64, detections: u64, depth: u64 },
}

// ----------------------------------------------------------------------------
// Camera model
// ----------------------------------------------------------------------------

/// Pinhole intrinsics in pixels.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct CameraIntrinsics {
    pub fx: f32,
    pub fy: f32,
    pub cx: f32,
    pub cy: f32,
}

impl CameraIntrinsics {
    /// Approximate intrinsics for an uncalibrated camera: square pixels, principal point at the
    /// image centre, focal length `focal_scale * width`.
    pub fn approximate(width: u32, height: u32, focal_scale: f32) -> Self {
        let f = focal_scale * width as f32;
        Self {
            fx: f,
            fy: f,
            cx: width as f32 / 2.0,
            cy: height as f32 / 2.0,
        }
    }

    /// Pixel `(u, v)` at depth `z` meters to camera-space `[x, y, z]`.
    pub fn back_project(&self, u: f32, v: f32, z: f32) -> [f32; 3] {
        [(u - self.cx) * z / self.fx, (v - self.cy) * z / self.fy, z]
    }

    /// The same camera seen through an image resized by `(sx, sy)`.
    pub fn scaled(&self, sx: f32, sy: f32) -> Self {
        Self {
            fx: self.fx * sx,
            fy: self.fy * sy,
            cx: self.cx * sx,
            cy: self.cy * sy,
        }
    }

    /// Back-project every cell of `depth`, row-major. The intrinsics must be expressed in the
    /// map's own pixel grid.
    pub fn point_cloud(&self, depth: &DepthMap) -> Vec<[f32; 3]> {
        let width = depth.width() as usize;
        depth
            .values()
            .iter()
            .enumerate()
            .map(|(i, &z)| self.back_project((i % width) as f32, (i / width) as f32, z))
            .collect()
    }
}

// ----------------------------------------------------------------------------
// Fused output
// ----------------------------------------------------------------------------

/// A detection with its sampled depth and 3D position.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct LocatedObject {
    pub detection: Detection,
    pub depth_m: f32,
    /// Camera-space position of the box centre in meters.
    pub position: [f32; 3],
}

/// Per-stage timings measured by the workers.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct StageTimings {
    pub detect: Duration,
    pub depth: Duration,
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct FrameLatency {
    pub detect: Duration,
    pub depth: Duration,
    /// Capture to fusion.
    pub end_to_end: Duration,
}

/// Paired detector and depth output for exactly one frame.
#[derive(Clone, Debug)]
pub struct FusedResult {
    pub sequence: u64,
    pub width: u32,
    pub height: u32,
    pub captured_at: SystemTime,
    pub detections: DetectionSet,
    pub depth: DepthMap,
    pub objects: Vec<LocatedObject>,
    /// Confirmed tracks after this frame. Empty unless tracking is enabled.
    pub tracks: Vec<Track>,
    /// Camera model used for back-projection, in frame pixels.
    pub intrinsics: CameraIntrinsics,
    pub latency: FrameLatency,
}

impl FusedResult {
    /// Depth map back-projected into camera space, one point per map cell.
    pub fn point_cloud(&self) -> Vec<[f32; 3]> {
        let sx = self.depth.width() as f32 / self.width.max(1) as f32;
        let sy = self.depth.height() as f32 / self.height.max(1) as f32;
        self.intrinsics.scaled(sx, sy).point_cloud(&self.depth)
    }

    /// Serializable view without the depth buffer.
    pub fn summary(&self) -> ResultSummary {
        let captured_at_ms = self
            .captured_at
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        ResultSummary {
            sequence: self.sequence,
            captured_at_ms,
            objects: self.objects.clone(),
            tracks: self.tracks.clone(),
            depth_range_m: self.depth.min_max(),
            detect_ms: millis(self.latency.detect),
            depth_ms: millis(self.latency.depth),
            end_to_end_ms: millis(self.latency.end_to_end),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct ResultSummary {
    pub sequence: u64,
    pub captured_at_ms: u64,
    pub objects: Vec<LocatedObject>,
    pub tracks: Vec<Track>,
    pub depth_range_m: Option<(f32, f32)>,
    pub detect_ms: f64,
    pub depth_ms: f64,
    pub end_to_end_ms: f64,
}

fn millis(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

// ----------------------------------------------------------------------------
// Fuser
// ----------------------------------------------------------------------------

#[derive(Clone, Debug)]
pub struct ResultFuser {
    sampling: DepthSampling,
    focal_scale: f32,
    intrinsics: Option<CameraIntrinsics>,
}

impl Default for ResultFuser {
    fn default() -> Self {
        Self {
            sampling: DepthSampling::default(),
            focal_scale: DEFAULT_FOCAL_SCALE,
            intrinsics: None,
        }
    }
}

impl ResultFuser {
    pub fn new(sampling: DepthSampling, focal_scale: f32) -> Self {
        Self {
            sampling,
            focal_scale,
            intrinsics: None,
        }
    }

    /// Use calibrated intrinsics instead of deriving them from the frame size.
    pub fn with_intrinsics(mut self, intrinsics: CameraIntrinsics) -> Self {
        self.intrinsics = Some(intrinsics);
        self
    }

    pub fn sampling(&self) -> DepthSampling {
        self.sampling
    }

    /// Combine both outputs for `meta`. Either half missing or stamped with another sequence
    /// number yields an error and no result.
    pub fn fuse(
        &self,
        meta: &FrameMeta,
        detections: Option<DetectionSet>,
        depth: Option<DepthMap>,
        timings: StageTimings,
    ) -> Result<FusedResult, FuseError> {
        let detections = detections.ok_or(FuseError::MissingDetections(meta.sequence))?;
        let depth = depth.ok_or(FuseError::MissingDepth(meta.sequence))?;
        if detections.sequence != meta.sequence || depth.sequence() != meta.sequence {
            return Err(FuseError::SequenceMismatch {
                frame: meta.sequence,
                detections: detections.sequence,
                depth: depth.sequence(),
            });
        }

        let intrinsics = self.intrinsics.unwrap_or_else(|| {
            CameraIntrinsics::approximate(meta.width, meta.height, self.focal_scale)
        });

        let objects = detections
            .detections
            .iter()
            .map(|det| {
                let depth_m =
                    depth.sample_frame_box(det.bbox(), meta.width, meta.height, self.sampling);
                let (u, v) = det.center();
                LocatedObject {
                    detection: det.clone(),
                    depth_m,
                    position: intrinsics.back_project(u, v, depth_m),
                }
            })
            .collect();

        Ok(FusedResult {
            sequence: meta.sequence,
            width: meta.width,
            height: meta.height,
            captured_at: meta.captured_at,
            detections,
            depth,
            objects,
            tracks: Vec::new(),
            intrinsics,
            latency: FrameLatency {
                detect: timings.detect,
                depth: timings.depth,
                end_to_end: meta.capture_instant.elapsed(),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{Frame, PixelFormat};

    fn meta(sequence: u64) -> FrameMeta {
        let frame = Frame::new(vec![0u8; 100 * 50], 100, 50, PixelFormat::Gray8, sequence).unwrap();
        FrameMeta::from(&frame)
    }

    fn depth(sequence: u64, meters: f32) -> DepthMap {
        DepthMap::filled(100, 50, meters).unwrap().with_sequence(sequence)
    }

    #[test]
    fn fuses_matching_outputs() {
        let dets = DetectionSet::new(7, vec![Detection::new([40.0, 15.0, 60.0, 35.0], 0.9, 0)]);
        let fused = ResultFuser::default()
            .fuse(&meta(7), Some(dets), Some(depth(7, 4.0)), StageTimings::default())
            .unwrap();
        assert_eq!(fused.sequence, 7);
        assert_eq!(fused.objects.len(), 1);
        let obj = &fused.objects[0];
        assert_eq!(obj.depth_m, 4.0);
        // Box centre equals the principal point, so x and y are zero.
        assert_eq!(obj.position, [0.0, 0.0, 4.0]);
    }

    #[test]
    fn missing_half_yields_no_result() {
        let fuser = ResultFuser::default();
        let err = fuser
            .fuse(&meta(3), None, Some(depth(3, 1.0)), StageTimings::default())
            .unwrap_err();
        assert_eq!(err, FuseError::MissingDetections(3));
        let err = fuser
            .fuse(
                &meta(3),
                Some(DetectionSet::new(3, Vec::new())),
                None,
                StageTimings::default(),
            )
            .unwrap_err();
        assert_eq!(err, FuseError::MissingDepth(3));
    }

    #[test]
    fn mismatched_sequences_are_rejected() {
        let err = ResultFuser::default()
            .fuse(
                &meta(4),
                Some(DetectionSet::new(4, Vec::new())),
                Some(depth(5, 1.0)),
                StageTimings::default(),
            )
            .unwrap_err();
        assert_eq!(
            err,
            FuseError::SequenceMismatch {
                frame: 4,
                detections: 4,
                depth: 5
            }
        );
    }

    #[test]
    fn back_projection_scales_with_depth() {
        let k = CameraIntrinsics::approximate(100, 50, 0.8);
        assert_eq!(k.fx, 80.0);
        let p = k.back_project(90.0, 25.0, 2.0);
        assert!((p[0] - 1.0).abs() < 1e-6);
        assert_eq!(p[1], 0.0);
    }

    #[test]
    fn point_cloud_follows_map_resolution() {
        let fused = ResultFuser::default()
            .fuse(
                &meta(2),
                Some(DetectionSet::new(2, Vec::new())),
                Some(DepthMap::filled(50, 25, 2.0).unwrap().with_sequence(2)),
                StageTimings::default(),
            )
            .unwrap();
        let cloud = fused.point_cloud();
        assert_eq!(cloud.len(), 50 * 25);
        // Map cell (25, 12) sits near the principal point at half resolution.
        let centre = cloud[12 * 50 + 25];
        assert_eq!(centre[0], 0.0);
        assert!(centre[1].abs() < 0.05);
        assert_eq!(centre[2], 2.0);
        // Left edge: x = (0 - 25) * 2 / 40.
        assert!((cloud[0][0] + 1.25).abs() < 1e-5);
    }

    #[test]
    fn summary_carries_depth_range() {
        let fused = ResultFuser::default()
            .fuse(
                &meta(1),
                Some(DetectionSet::new(1, Vec::new())),
                Some(depth(1, 2.5)),
                StageTimings::default(),
            )
            .unwrap();
        let summary = fused.summary();
        assert_eq!(summary.depth_range_m, Some((2.5, 2.5)));
        assert!(serde_json::to_string(&summary).unwrap().contains("\"sequence\":1"));
    }
}
