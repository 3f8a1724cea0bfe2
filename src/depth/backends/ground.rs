use crate::depth::backend::DepthBackend;
use crate::depth::map::DepthMap;
use crate::error::InferenceError;
use crate::frame::Frame;

/// Ground-plane prior for a forward-facing camera: `far_m` at the top row, `near_m` at the
/// bottom row, linear in between. Ignores pixel content.
#[derive(Clone, Debug)]
pub struct GroundPlaneDepth {
    pub near_m: f32,
    pub far_m: f32,
    pub stride: u32,
}

impl Default for GroundPlaneDepth {
    fn default() -> Self {
        Self {
            near_m: 0.5,
            far_m: 10.0,
            stride: 4,
        }
    }
}

impl GroundPlaneDepth {
    pub fn new(near_m: f32, far_m: f32, stride: u32) -> Self {
        Self {
            near_m,
            far_m,
            stride: stride.max(1),
        }
    }
}

impl DepthBackend for GroundPlaneDepth {
    fn name(&self) -> &'static str {
        "ground"
    }

    fn infer(&mut self, frame: &Frame) -> Result<DepthMap, InferenceError> {
        if !(self.near_m < self.far_m) {
            return Err(InferenceError::model(format!(
                "ground plane needs near < far (got {} >= {})",
                self.near_m, self.far_m
            )));
        }
        let (w, h) = super::output_dims(frame, self.stride);
        let span = self.far_m - self.near_m;
        let last_row = h.saturating_sub(1).max(1) as f32;
        let far = self.far_m;
        DepthMap::from_fn(w, h, |_, y| far - span * (y as f32 / last_row))
    }
}
