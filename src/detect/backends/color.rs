use crate::detect::backend::DetectorBackend;
use crate::detect::result::Detection;
use crate::error::InferenceError;
use crate::frame::Frame;

/// CPU detector that boxes saturated-green pixels.
///
/// Pairs with the synthetic source, which draws a green square on black. Confidence is the
/// fill ratio of matching pixels inside the box.
#[derive(Clone, Debug)]
pub struct ColorDetector {
    class_id: u32,
    min_green: u8,
    max_other: u8,
    min_pixels: usize,
}

impl Default for ColorDetector {
    fn default() -> Self {
        Self {
            class_id: 0,
            min_green: 150,
            max_other: 100,
            min_pixels: 16,
        }
    }
}

impl ColorDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Class id reported for every box.
    pub fn with_class(mut self, class_id: u32) -> Self {
        self.class_id = class_id;
        self
    }

    fn matches(&self, px: &[u8]) -> bool {
        px[1] >= self.min_green && px[0] <= self.max_other && px[2] <= self.max_other
    }
}

impl DetectorBackend for ColorDetector {
    fn name(&self) -> &'static str {
        "color"
    }

    fn infer(&mut self, frame: &Frame) -> Result<Vec<Detection>, InferenceError> {
        let rgb = frame.to_rgb24()?;
        let width = frame.width() as usize;

        let mut count = 0usize;
        let (mut min_x, mut min_y) = (usize::MAX, usize::MAX);
        let (mut max_x, mut max_y) = (0usize, 0usize);
        for (i, px) in rgb.chunks_exact(3).enumerate() {
            if !self.matches(px) {
                continue;
            }
            let (x, y) = (i % width, i / width);
            count += 1;
            min_x = min_x.min(x);
            min_y = min_y.min(y);
            max_x = max_x.max(x);
            max_y = max_y.max(y);
        }

        if count < self.min_pixels {
            return Ok(Vec::new());
        }

        let x2 = (max_x + 1) as f32;
        let y2 = (max_y + 1) as f32;
        let area = (x2 - min_x as f32) * (y2 - min_y as f32);
        let confidence = (count as f32 / area).clamp(0.0, 1.0);

        Ok(vec![Detection::new(
            [min_x as f32, min_y as f32, x2, y2],
            confidence,
            self.class_id,
        )])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::PixelFormat;

    fn square_frame(x0: usize, y0: usize, size: usize) -> Frame {
        let (w, h) = (32usize, 24usize);
        let mut pixels = vec![0u8; w * h * 3];
        for y in y0..y0 + size {
            for x in x0..x0 + size {
                pixels[(y * w + x) * 3 + 1] = 255;
            }
        }
        Frame::new(pixels, w as u32, h as u32, PixelFormat::Rgb24, 1).unwrap()
    }

    #[test]
    fn color_detector_boxes_green_square() {
        let mut backend = ColorDetector::new().with_class(32);
        let dets = backend.infer(&square_frame(4, 6, 8)).unwrap();
        assert_eq!(dets.len(), 1);
        assert_eq!(dets[0].bbox(), [4.0, 6.0, 12.0, 14.0]);
        assert_eq!(dets[0].confidence, 1.0);
        assert_eq!(dets[0].label, "sports ball");
    }

    #[test]
    fn color_detector_ignores_small_blobs() {
        let mut backend = ColorDetector::new();
        assert!(backend.infer(&square_frame(0, 0, 3)).unwrap().is_empty());
    }
}
