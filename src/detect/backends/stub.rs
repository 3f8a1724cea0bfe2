use sha2::{Digest, Sha256};

use crate::detect::backend::DetectorBackend;
use crate::detect::result::{Detection, CLASS_COUNT};
use crate::error::InferenceError;
use crate::frame::Frame;

/// Deterministic stub detector for tests and demos.
///
/// Derives a single box from a SHA-256 digest of the pixels. Holds no state between calls, so
/// the same frame always yields the same detections. An all-black frame yields none.
#[derive(Clone, Debug, Default)]
pub struct StubDetector;

impl StubDetector {
    pub fn new() -> Self {
        Self
    }
}

impl DetectorBackend for StubDetector {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn infer(&mut self, frame: &Frame) -> Result<Vec<Detection>, InferenceError> {
        let pixels = frame.pixels();
        if pixels.iter().all(|&p| p == 0) {
            return Ok(Vec::new());
        }

        let digest: [u8; 32] = Sha256::digest(pixels).into();
        let (width, height) = (frame.width() as f32, frame.height() as f32);

        let fx = u16::from_le_bytes([digest[0], digest[1]]) as f32 / u16::MAX as f32;
        let fy = u16::from_le_bytes([digest[2], digest[3]]) as f32 / u16::MAX as f32;
        let fw = 0.1 + (digest[4] as f32 / 255.0) * 0.4;
        let fh = 0.1 + (digest[5] as f32 / 255.0) * 0.4;

        let x1 = (fx * (1.0 - fw)) * width;
        let y1 = (fy * (1.0 - fh)) * height;
        let x2 = x1 + fw * width;
        let y2 = y1 + fh * height;
        let confidence = 0.5 + (digest[6] as f32 / 255.0) * 0.49;
        let class_id = digest[7] as u32 % CLASS_COUNT;

        Ok(vec![Detection::new([x1, y1, x2, y2], confidence, class_id)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::PixelFormat;

    fn frame(fill: u8) -> Frame {
        Frame::new(vec![fill; 8 * 6 * 3], 8, 6, PixelFormat::Rgb24, 1).unwrap()
    }

    #[test]
    fn stub_detector_is_idempotent() {
        let mut backend = StubDetector::new();
        let f = frame(42);
        let a = backend.infer(&f).unwrap();
        let b = backend.infer(&f).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 1);
    }

    #[test]
    fn stub_detector_boxes_stay_inside_frame() {
        let mut backend = StubDetector::new();
        for fill in 1..20u8 {
            let dets = backend.infer(&frame(fill)).unwrap();
            let d = &dets[0];
            assert!(d.x1 >= 0.0 && d.y1 >= 0.0);
            assert!(d.x2 <= 8.0 + 1e-3 && d.y2 <= 6.0 + 1e-3);
            assert!(d.confidence >= 0.5 && d.confidence < 1.0);
        }
    }

    #[test]
    fn black_frame_has_no_detections() {
        let mut backend = StubDetector::new();
        assert!(backend.infer(&frame(0)).unwrap().is_empty());
    }
}
