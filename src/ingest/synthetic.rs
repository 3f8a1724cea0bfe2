use std::time::{Duration, Instant};

use crate::error::FrameSourceError;
use crate::frame::{Frame, PixelFormat, SequenceCounter};

use super::{FrameSource, SourceStats};

const SQUARE: u32 = 80;

/// Synthetic camera for `stub://` URLs.
///
/// Draws an 80x80 green square on black that moves on a Lissajous-like path, so the colour
/// detector always has something to find. Paced to the configured fps.
pub struct SyntheticSource {
    name: String,
    width: u32,
    height: u32,
    fps: u32,
    max_frames: Option<u64>,
    sequence: SequenceCounter,
    last_emit: Option<Instant>,
}

impl SyntheticSource {
    pub fn new(name: &str, width: u32, height: u32) -> Result<Self, FrameSourceError> {
        PixelFormat::Rgb24.expected_len(width, height)?;
        Ok(Self {
            name: name.to_string(),
            width,
            height,
            fps: 0,
            max_frames: None,
            sequence: SequenceCounter::new(),
            last_emit: None,
        })
    }

    /// Pace output to `fps` frames per second. 0 disables pacing.
    pub fn with_fps(mut self, fps: u32) -> Self {
        self.fps = fps;
        self
    }

    pub fn with_max_frames(mut self, max_frames: Option<u64>) -> Self {
        self.max_frames = max_frames;
        self
    }

    /// Render the scene at time `t` (seconds of simulated motion).
    pub fn render(width: u32, height: u32, t: f64) -> Vec<u8> {
        let (w, h) = (width as usize, height as usize);
        let mut pixels = vec![0u8; w * h * 3];
        let x = ((t.sin() * 0.4 + 0.5) * (width.saturating_sub(SQUARE)) as f64) as usize;
        let y = ((t.cos() * 0.4 + 0.5) * (height.saturating_sub(SQUARE)) as f64) as usize;
        let x_end = (x + SQUARE as usize).min(w);
        let y_end = (y + SQUARE as usize).min(h);
        for row in y..y_end {
            for col in x..x_end {
                pixels[(row * w + col) * 3 + 1] = 255;
            }
        }
        pixels
    }

    fn pace(&mut self) {
        if self.fps == 0 {
            return;
        }
        let interval = Duration::from_secs_f64(1.0 / self.fps as f64);
        if let Some(last) = self.last_emit {
            let elapsed = last.elapsed();
            if elapsed < interval {
                std::thread::sleep(interval - elapsed);
            }
        }
        self.last_emit = Some(Instant::now());
    }
}

impl FrameSource for SyntheticSource {
    fn connect(&mut self) -> Result<(), FrameSourceError> {
        log::info!(
            "SyntheticSource: connected to stub://{} ({}x{} @ {} fps)",
            self.name,
            self.width,
            self.height,
            self.fps
        );
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Option<Frame>, FrameSourceError> {
        if self
            .max_frames
            .is_some_and(|max| self.sequence.last() >= max)
        {
            return Ok(None);
        }
        self.pace();
        let sequence = self.sequence.next_sequence();
        let pixels = Self::render(self.width, self.height, sequence as f64 / 10.0);
        let frame = Frame::new(pixels, self.width, self.height, PixelFormat::Rgb24, sequence)?;
        Ok(Some(frame))
    }

    fn describe(&self) -> String {
        format!("stub://{}", self.name)
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.sequence.last(),
            source: self.describe(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn square_is_green_on_black() {
        let pixels = SyntheticSource::render(200, 100, 0.0);
        let green = pixels.chunks(3).filter(|p| **p == [0u8, 255, 0]).count();
        assert_eq!(green, (SQUARE * SQUARE) as usize);
        assert!(pixels.chunks(3).all(|p| p[0] == 0 && p[2] == 0));
    }

    #[test]
    fn sequences_start_at_one_and_increase() {
        let mut source = SyntheticSource::new("seq", 96, 96).unwrap();
        let a = source.next_frame().unwrap().unwrap();
        let b = source.next_frame().unwrap().unwrap();
        assert_eq!((a.sequence(), b.sequence()), (1, 2));
        assert_ne!(a.pixels(), b.pixels());
    }

    #[test]
    fn zero_sized_sources_are_rejected() {
        assert!(SyntheticSource::new("bad", 0, 10).is_err());
    }
}
