use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::InferenceError;

/// Depth reported for a box that collapses to nothing after clipping.
pub const DEFAULT_DEPTH_M: f32 = 1.0;

/// How a single depth value is extracted for a bounding box.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DepthSampling {
    /// Depth at the box centre.
    #[default]
    Center,
    /// Median of the positive depths inside the box.
    Median,
    /// Closest positive depth inside the box.
    Min,
}

impl FromStr for DepthSampling {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "center" => Ok(DepthSampling::Center),
            "median" => Ok(DepthSampling::Median),
            "min" => Ok(DepthSampling::Min),
            other => Err(format!("unknown depth sampling method '{}'", other)),
        }
    }
}

impl fmt::Display for DepthSampling {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DepthSampling::Center => "center",
            DepthSampling::Median => "median",
            DepthSampling::Min => "min",
        })
    }
}

/// Row-major depth values in meters for one frame.
#[derive(Clone, Debug, PartialEq)]
pub struct DepthMap {
    sequence: u64,
    width: u32,
    height: u32,
    values: Vec<f32>,
}

impl DepthMap {
    /// Build a map from row-major values. Sequence is 0 until the pipeline stamps it.
    pub fn new(width: u32, height: u32, values: Vec<f32>) -> Result<Self, InferenceError> {
        let expected = (width as usize)
            .checked_mul(height as usize)
            .ok_or_else(|| InferenceError::InvalidOutput("depth map dimensions overflow".into()))?;
        if expected == 0 {
            return Err(InferenceError::InvalidOutput(format!(
                "depth map dimensions must be non-zero (got {}x{})",
                width, height
            )));
        }
        if values.len() != expected {
            return Err(InferenceError::InvalidOutput(format!(
                "depth map length mismatch: expected {}, got {}",
                expected,
                values.len()
            )));
        }
        Ok(Self {
            sequence: 0,
            width,
            height,
            values,
        })
    }

    pub fn filled(width: u32, height: u32, meters: f32) -> Result<Self, InferenceError> {
        Self::new(width, height, vec![meters; width as usize * height as usize])
    }

    pub fn from_fn(
        width: u32,
        height: u32,
        mut f: impl FnMut(u32, u32) -> f32,
    ) -> Result<Self, InferenceError> {
        let mut values = Vec::with_capacity(width as usize * height as usize);
        for y in 0..height {
            for x in 0..width {
                values.push(f(x, y));
            }
        }
        Self::new(width, height, values)
    }

    /// Attach the sequence number of the frame this map was estimated from.
    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = sequence;
        self
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn get(&self, x: u32, y: u32) -> Option<f32> {
        if x >= self.width || y >= self.height {
            return None;
        }
        self.values
            .get(y as usize * self.width as usize + x as usize)
            .copied()
    }

    /// Smallest and largest finite depth in the map.
    pub fn min_max(&self) -> Option<(f32, f32)> {
        self.values
            .iter()
            .copied()
            .filter(|v| v.is_finite())
            .fold(None, |acc, v| match acc {
                None => Some((v, v)),
                Some((lo, hi)) => Some((lo.min(v), hi.max(v))),
            })
    }

    /// Depth for a box given in this map's own pixel coordinates.
    pub fn sample_box(&self, bbox: [f32; 4], method: DepthSampling) -> f32 {
        let max_x = (self.width - 1) as f32;
        let max_y = (self.height - 1) as f32;
        let x1 = bbox[0].clamp(0.0, max_x) as u32;
        let y1 = bbox[1].clamp(0.0, max_y) as u32;
        let x2 = bbox[2].clamp(0.0, max_x) as u32;
        let y2 = bbox[3].clamp(0.0, max_y) as u32;

        if x2 <= x1 || y2 <= y1 {
            return DEFAULT_DEPTH_M;
        }
        self.sample_cells([x1, y1, x2, y2], ((x1 + x2) / 2, (y1 + y2) / 2), method)
    }

    /// Depth for a box given in frame pixel coordinates.
    ///
    /// The box is clipped to the frame, then mapped onto every map cell it touches, so a box
    /// smaller than one cell of a coarse map still reads that cell. `Center` reads the cell
    /// under the box centre.
    pub fn sample_frame_box(
        &self,
        bbox: [f32; 4],
        frame_width: u32,
        frame_height: u32,
        method: DepthSampling,
    ) -> f32 {
        let fw = frame_width.max(1) as f32;
        let fh = frame_height.max(1) as f32;
        let [x1, y1, x2, y2] = [
            bbox[0].clamp(0.0, fw),
            bbox[1].clamp(0.0, fh),
            bbox[2].clamp(0.0, fw),
            bbox[3].clamp(0.0, fh),
        ];
        if x2 <= x1 || y2 <= y1 {
            return DEFAULT_DEPTH_M;
        }

        let sx = self.width as f32 / fw;
        let sy = self.height as f32 / fh;
        let cell = |v: f32, scale: f32, len: u32| ((v * scale).floor() as u32).min(len - 1);
        let cx1 = cell(x1, sx, self.width);
        let cy1 = cell(y1, sy, self.height);
        let cx2 = ((x2 * sx).ceil() as u32).clamp(cx1 + 1, self.width);
        let cy2 = ((y2 * sy).ceil() as u32).clamp(cy1 + 1, self.height);
        let centre = (
            cell((x1 + x2) / 2.0, sx, self.width),
            cell((y1 + y2) / 2.0, sy, self.height),
        );
        self.sample_cells([cx1, cy1, cx2, cy2], centre, method)
    }

    /// Sample the half-open cell range `[x1, x2) x [y1, y2)`.
    fn sample_cells(&self, cells: [u32; 4], centre: (u32, u32), method: DepthSampling) -> f32 {
        let [x1, y1, x2, y2] = cells;
        match method {
            DepthSampling::Center => self.get(centre.0, centre.1).unwrap_or(DEFAULT_DEPTH_M),
            DepthSampling::Median => {
                let mut region = self.region(x1, y1, x2, y2);
                median(&mut region).unwrap_or(DEFAULT_DEPTH_M)
            }
            DepthSampling::Min => self
                .region(x1, y1, x2, y2)
                .into_iter()
                .reduce(f32::min)
                .unwrap_or(DEFAULT_DEPTH_M),
        }
    }

    /// Positive values of the half-open region, or every value when none is positive.
    fn region(&self, x1: u32, y1: u32, x2: u32, y2: u32) -> Vec<f32> {
        let w = self.width as usize;
        let all: Vec<f32> = (y1..y2)
            .flat_map(|y| {
                let row = y as usize * w;
                self.values[row + x1 as usize..row + x2 as usize].iter().copied()
            })
            .collect();
        let valid: Vec<f32> = all.iter().copied().filter(|v| *v > 0.0).collect();
        if valid.is_empty() {
            all
        } else {
            valid
        }
    }
}

fn median(values: &mut [f32]) -> Option<f32> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        Some((values[mid - 1] + values[mid]) / 2.0)
    } else {
        Some(values[mid])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp() -> DepthMap {
        // value = x + 10 * y
        DepthMap::from_fn(10, 10, |x, y| (x + 10 * y) as f32).unwrap()
    }

    #[test]
    fn map_rejects_wrong_length() {
        assert!(matches!(
            DepthMap::new(2, 2, vec![1.0; 3]),
            Err(InferenceError::InvalidOutput(_))
        ));
    }

    #[test]
    fn center_sampling_reads_box_centre() {
        let map = ramp();
        assert_eq!(map.sample_box([2.0, 2.0, 6.0, 6.0], DepthSampling::Center), 44.0);
    }

    #[test]
    fn median_sampling_ignores_non_positive_values() {
        let mut values = vec![0.0; 16];
        values[5] = 2.0;
        values[6] = 4.0;
        let map = DepthMap::new(4, 4, values).unwrap();
        assert_eq!(map.sample_box([0.0, 0.0, 3.0, 3.0], DepthSampling::Median), 3.0);
        assert_eq!(map.sample_box([0.0, 0.0, 3.0, 3.0], DepthSampling::Min), 2.0);
    }

    #[test]
    fn degenerate_box_uses_default_depth() {
        let map = ramp();
        assert_eq!(
            map.sample_box([5.0, 5.0, 5.0, 9.0], DepthSampling::Center),
            DEFAULT_DEPTH_M
        );
        assert_eq!(
            map.sample_box([-20.0, -20.0, -5.0, -5.0], DepthSampling::Median),
            DEFAULT_DEPTH_M
        );
    }

    #[test]
    fn frame_boxes_are_scaled_onto_coarse_maps() {
        let map = DepthMap::from_fn(4, 4, |x, _| x as f32 + 1.0).unwrap();
        // Frame is 40x40; the box centre x = 32 falls in map column 3.
        let z = map.sample_frame_box([28.0, 0.0, 36.0, 40.0], 40, 40, DepthSampling::Center);
        assert_eq!(z, 4.0);
        // The box spans columns 2 and 3.
        let z = map.sample_frame_box([28.0, 0.0, 36.0, 40.0], 40, 40, DepthSampling::Min);
        assert_eq!(z, 3.0);
    }

    #[test]
    fn box_inside_one_coarse_cell_reads_that_cell() {
        let map = DepthMap::filled(10, 10, 5.0).unwrap();
        for method in [DepthSampling::Center, DepthSampling::Median, DepthSampling::Min] {
            assert_eq!(map.sample_frame_box([33.0, 33.0, 38.0, 38.0], 80, 80, method), 5.0);
        }
        let ramp = ramp();
        // Frame pixels 33..38 map to cell (4, 4) at stride 8.
        assert_eq!(
            ramp.sample_frame_box([33.0, 33.0, 38.0, 38.0], 80, 80, DepthSampling::Median),
            44.0
        );
    }

    #[test]
    fn frame_box_on_the_far_edge_stays_in_range() {
        let map = ramp();
        let z = map.sample_frame_box([78.0, 78.0, 80.0, 80.0], 80, 80, DepthSampling::Min);
        assert_eq!(z, 99.0);
        assert_eq!(
            map.sample_frame_box([90.0, 0.0, 120.0, 10.0], 80, 80, DepthSampling::Center),
            DEFAULT_DEPTH_M
        );
    }

    #[test]
    fn sampling_method_parses_case_insensitively() {
        assert_eq!("Median".parse::<DepthSampling>(), Ok(DepthSampling::Median));
        assert!("mean".parse::<DepthSampling>().is_err());
    }

    #[test]
    fn min_max_skips_non_finite_values() {
        let map = DepthMap::new(3, 1, vec![f32::NAN, 2.0, 5.0]).unwrap();
        assert_eq!(map.min_max(), Some((2.0, 5.0)));
    }
}
