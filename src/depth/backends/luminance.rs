use crate::depth::backend::DepthBackend;
use crate::depth::map::DepthMap;
use crate::error::InferenceError;
use crate::frame::{Frame, PixelFormat};

/// Brightness heuristic: brighter pixels are treated as nearer.
///
/// Samples every `stride` pixels, so the map is coarser than the frame. The fuser scales boxes
/// onto it.
#[derive(Clone, Debug)]
pub struct LuminanceDepth {
    pub near_m: f32,
    pub far_m: f32,
    pub stride: u32,
}

impl Default for LuminanceDepth {
    fn default() -> Self {
        Self {
            near_m: 0.5,
            far_m: 10.0,
            stride: 4,
        }
    }
}

impl LuminanceDepth {
    pub fn new(near_m: f32, far_m: f32, stride: u32) -> Self {
        Self {
            near_m,
            far_m,
            stride: stride.max(1),
        }
    }

    fn to_depth(&self, luma: f32) -> f32 {
        self.far_m - (self.far_m - self.near_m) * luma
    }
}

impl DepthBackend for LuminanceDepth {
    fn name(&self) -> &'static str {
        "luminance"
    }

    fn infer(&mut self, frame: &Frame) -> Result<DepthMap, InferenceError> {
        let (w, h) = super::output_dims(frame, self.stride);
        let stride = self.stride.max(1);
        let width = frame.width() as usize;

        // Gray frames are read directly; everything else goes through packed RGB.
        if frame.format() == PixelFormat::Gray8 {
            let pixels = frame.pixels();
            return DepthMap::from_fn(w, h, |x, y| {
                let idx = (y * stride) as usize * width + (x * stride) as usize;
                self.to_depth(pixels[idx] as f32 / 255.0)
            });
        }

        let rgb = frame.to_rgb24()?;
        DepthMap::from_fn(w, h, |x, y| {
            let idx = ((y * stride) as usize * width + (x * stride) as usize) * 3;
            let luma = 0.299 * rgb[idx] as f32
                + 0.587 * rgb[idx + 1] as f32
                + 0.114 * rgb[idx + 2] as f32;
            self.to_depth(luma / 255.0)
        })
    }
}
