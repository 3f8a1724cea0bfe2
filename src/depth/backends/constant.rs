use crate::depth::backend::DepthBackend;
use crate::depth::map::DepthMap;
use crate::error::InferenceError;
use crate::frame::Frame;

/// Flat plane at a fixed distance. Useful as a placeholder when no depth model is available.
#[derive(Clone, Debug)]
pub struct ConstantDepth {
    pub meters: f32,
    /// Output map is `ceil(width / stride) x ceil(height / stride)`.
    pub stride: u32,
}

impl Default for ConstantDepth {
    fn default() -> Self {
        Self {
            meters: 2.0,
            stride: 1,
        }
    }
}

impl ConstantDepth {
    pub fn new(meters: f32) -> Self {
        Self {
            meters,
            ..Self::default()
        }
    }

    pub fn with_stride(mut self, stride: u32) -> Self {
        self.stride = stride.max(1);
        self
    }
}

impl DepthBackend for ConstantDepth {
    fn name(&self) -> &'static str {
        "constant"
    }

    fn infer(&mut self, frame: &Frame) -> Result<DepthMap, InferenceError> {
        let (w, h) = super::output_dims(frame, self.stride);
        DepthMap::filled(w, h, self.meters)
    }
}
