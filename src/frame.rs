//! Frame values flowing through the pipeline.
//!
//! - `Frame`: immutable captured image. Pixels are private and read-only once constructed.
//! - `PixelFormat`: supported pixel layouts and their byte-length rules.
//! - `SequenceCounter`: monotonic sequence stamping used by frame sources.
//!
//! A frame is owned by its source until the scheduler accepts it. While it is being processed
//! it is shared read-only between the detector worker and the depth worker, and it is released
//! as soon as both have finished with it.

use std::borrow::Cow;
use std::fmt;
use std::time::{Duration, Instant, SystemTime};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ingest::normalize::normalize_to_rgb;

// ----------------------------------------------------------------------------
// PixelFormat
// ----------------------------------------------------------------------------

/// Pixel layout of a frame buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    /// Packed 8-bit RGB.
    Rgb24,
    /// Packed 8-bit BGR (OpenCV order).
    Bgr24,
    /// Single 8-bit luma channel.
    Gray8,
    /// Y plane followed by interleaved UV plane at quarter resolution.
    Nv12,
}

impl PixelFormat {
    pub fn name(self) -> &'static str {
        match self {
            PixelFormat::Rgb24 => "rgb24",
            PixelFormat::Bgr24 => "bgr24",
            PixelFormat::Gray8 => "gray8",
            PixelFormat::Nv12 => "nv12",
        }
    }

    /// Exact byte length a buffer of this format must have for the given dimensions.
    pub fn expected_len(self, width: u32, height: u32) -> Result<usize, FrameError> {
        if width == 0 || height == 0 {
            return Err(FrameError::ZeroDimension { width, height });
        }
        let pixels = (width as usize)
            .checked_mul(height as usize)
            .ok_or(FrameError::Overflow { width, height })?;
        let len = match self {
            PixelFormat::Rgb24 | PixelFormat::Bgr24 => pixels.checked_mul(3),
            PixelFormat::Gray8 => Some(pixels),
            PixelFormat::Nv12 => {
                if width % 2 != 0 || height % 2 != 0 {
                    return Err(FrameError::OddChromaDimensions { width, height });
                }
                pixels.checked_add(pixels / 2)
            }
        };
        len.ok_or(FrameError::Overflow { width, height })
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Errors raised while constructing or converting a frame.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame dimensions must be non-zero (got {width}x{height})")]
    ZeroDimension { width: u32, height: u32 },
    #[error("frame dimensions {width}x{height} overflow")]
    Overflow { width: u32, height: u32 },
    #[error("nv12 frames need even dimensions (got {width}x{height})")]
    OddChromaDimensions { width: u32, height: u32 },
    #[error("{format} frame length mismatch: expected {expected}, got {actual}")]
    LengthMismatch {
        format: PixelFormat,
        expected: usize,
        actual: usize,
    },
}

// ----------------------------------------------------------------------------
// Frame
// ----------------------------------------------------------------------------

/// One captured image.
///
/// There is no mutable access to the pixel buffer; backends receive `&Frame` and cannot alter
/// what the other role sees.
#[derive(Clone)]
pub struct Frame {
    data: Vec<u8>,
    width: u32,
    height: u32,
    format: PixelFormat,
    sequence: u64,
    captured_at: SystemTime,
    /// Monotonic capture instant, used for latency accounting.
    capture_instant: Instant,
}

impl Frame {
    /// Build a frame, validating the buffer length against the format and dimensions.
    pub fn new(
        data: Vec<u8>,
        width: u32,
        height: u32,
        format: PixelFormat,
        sequence: u64,
    ) -> Result<Self, FrameError> {
        let expected = format.expected_len(width, height)?;
        if data.len() != expected {
            return Err(FrameError::LengthMismatch {
                format,
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            data,
            width,
            height,
            format,
            sequence,
            captured_at: SystemTime::now(),
            capture_instant: Instant::now(),
        })
    }

    /// Override the wall-clock capture time (e.g. with a driver timestamp).
    pub fn with_capture_time(mut self, captured_at: SystemTime) -> Self {
        self.captured_at = captured_at;
        self
    }

    pub fn pixels(&self) -> &[u8] {
        &self.data
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn captured_at(&self) -> SystemTime {
        self.captured_at
    }

    /// Time elapsed since capture.
    pub fn age(&self) -> Duration {
        self.capture_instant.elapsed()
    }

    pub(crate) fn capture_instant(&self) -> Instant {
        self.capture_instant
    }

    /// Packed RGB view of the frame. Borrows when the frame already is `Rgb24`.
    pub fn to_rgb24(&self) -> Result<Cow<'_, [u8]>, FrameError> {
        match self.format {
            PixelFormat::Rgb24 => Ok(Cow::Borrowed(&self.data)),
            format => normalize_to_rgb(&self.data, self.width, self.height, format).map(Cow::Owned),
        }
    }

    /// Release the frame and hand its buffer back for reuse.
    pub fn into_pixels(self) -> Vec<u8> {
        self.data
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("sequence", &self.sequence)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("format", &self.format)
            .field("bytes", &self.data.len())
            .finish()
    }
}

/// Metadata retained for a frame after its pixels have been released.
#[derive(Clone, Copy, Debug)]
pub struct FrameMeta {
    pub sequence: u64,
    pub width: u32,
    pub height: u32,
    pub captured_at: SystemTime,
    pub capture_instant: Instant,
}

impl From<&Frame> for FrameMeta {
    fn from(frame: &Frame) -> Self {
        Self {
            sequence: frame.sequence,
            width: frame.width,
            height: frame.height,
            captured_at: frame.captured_at,
            capture_instant: frame.capture_instant,
        }
    }
}

// ----------------------------------------------------------------------------
// SequenceCounter
// ----------------------------------------------------------------------------

/// Hands out strictly increasing sequence numbers starting at 1.
#[derive(Debug, Default)]
pub struct SequenceCounter {
    last: u64,
}

impl SequenceCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_sequence(&mut self) -> u64 {
        self.last = self.last.wrapping_add(1).max(1);
        self.last
    }

    /// Last sequence number handed out (0 before the first call).
    pub fn last(&self) -> u64 {
        self.last
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_rejects_length_mismatch() {
        let err = Frame::new(vec![0u8; 10], 2, 2, PixelFormat::Rgb24, 1).unwrap_err();
        assert_eq!(
            err,
            FrameError::LengthMismatch {
                format: PixelFormat::Rgb24,
                expected: 12,
                actual: 10,
            }
        );
    }

    #[test]
    fn frame_rejects_zero_dimensions() {
        let err = Frame::new(Vec::new(), 0, 4, PixelFormat::Gray8, 1).unwrap_err();
        assert!(matches!(err, FrameError::ZeroDimension { .. }));
    }

    #[test]
    fn nv12_requires_even_dimensions() {
        assert!(matches!(
            PixelFormat::Nv12.expected_len(3, 2),
            Err(FrameError::OddChromaDimensions { .. })
        ));
        assert_eq!(PixelFormat::Nv12.expected_len(4, 2).unwrap(), 12);
    }

    #[test]
    fn rgb_frames_borrow_on_conversion() {
        let frame = Frame::new(vec![7u8; 12], 2, 2, PixelFormat::Rgb24, 3).unwrap();
        let rgb = frame.to_rgb24().unwrap();
        assert!(matches!(rgb, Cow::Borrowed(_)));
        assert_eq!(frame.sequence(), 3);
    }

    #[test]
    fn bgr_frames_convert_to_rgb() {
        let frame = Frame::new(vec![1, 2, 3], 1, 1, PixelFormat::Bgr24, 1).unwrap();
        assert_eq!(frame.to_rgb24().unwrap().as_ref(), &[3, 2, 1]);
    }

    #[test]
    fn sequence_counter_is_strictly_increasing() {
        let mut counter = SequenceCounter::new();
        assert_eq!(counter.last(), 0);
        let a = counter.next_sequence();
        let b = counter.next_sequence();
        assert_eq!((a, b), (1, 2));
    }

    #[test]
    fn debug_output_omits_pixels() {
        let frame = Frame::new(vec![9u8; 4], 2, 2, PixelFormat::Gray8, 5).unwrap();
        let text = format!("{:?}", frame);
        assert!(text.contains("sequence: 5"));
        assert!(text.contains("bytes: 4"));
    }
}
