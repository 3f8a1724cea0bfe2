use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::error::FrameSourceError;
use crate::frame::Frame;

use super::{FrameSource, SourceStats};

/// Plays back frames held in memory.
///
/// Without an interval the source is non-live: the pipeline reads it only when both backends
/// are idle, so every frame is processed. With an interval it behaves like a camera and is
/// subject to frame dropping.
pub struct ReplaySource {
    name: String,
    frames: VecDeque<Frame>,
    interval: Option<Duration>,
    fail_with: Option<String>,
    last_emit: Option<Instant>,
    emitted: u64,
}

impl ReplaySource {
    pub fn new(frames: impl IntoIterator<Item = Frame>) -> Self {
        Self {
            name: "replay".to_string(),
            frames: frames.into_iter().collect(),
            interval: None,
            fail_with: None,
            last_emit: None,
            emitted: 0,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Emit one frame per `interval`, like a live camera.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = Some(interval);
        self
    }

    /// Report a disconnect once the queued frames run out instead of ending the stream.
    pub fn fail_when_exhausted(mut self, message: impl Into<String>) -> Self {
        self.fail_with = Some(message.into());
        self
    }

    pub fn remaining(&self) -> usize {
        self.frames.len()
    }
}

impl FrameSource for ReplaySource {
    fn next_frame(&mut self) -> Result<Option<Frame>, FrameSourceError> {
        let Some(frame) = self.frames.pop_front() else {
            return match &self.fail_with {
                Some(message) => Err(FrameSourceError::Disconnected(message.clone())),
                None => Ok(None),
            };
        };
        if let Some(interval) = self.interval {
            if let Some(last) = self.last_emit {
                let elapsed = last.elapsed();
                if elapsed < interval {
                    std::thread::sleep(interval - elapsed);
                }
            }
            self.last_emit = Some(Instant::now());
        }
        self.emitted += 1;
        Ok(Some(frame))
    }

    fn is_live(&self) -> bool {
        self.interval.is_some()
    }

    fn describe(&self) -> String {
        format!("replay://{}", self.name)
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.emitted,
            source: self.describe(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::PixelFormat;

    fn frames(n: u64) -> Vec<Frame> {
        (1..=n)
            .map(|seq| Frame::new(vec![0u8; 4], 2, 2, PixelFormat::Gray8, seq).unwrap())
            .collect()
    }

    #[test]
    fn replays_in_order_then_ends() {
        let mut source = ReplaySource::new(frames(2));
        assert!(!source.is_live());
        assert_eq!(source.next_frame().unwrap().unwrap().sequence(), 1);
        assert_eq!(source.next_frame().unwrap().unwrap().sequence(), 2);
        assert!(source.next_frame().unwrap().is_none());
        assert_eq!(source.stats().frames_captured, 2);
    }

    #[test]
    fn injected_failure_follows_last_frame() {
        let mut source = ReplaySource::new(frames(1)).fail_when_exhausted("cable pulled");
        assert!(source.next_frame().unwrap().is_some());
        assert!(matches!(
            source.next_frame(),
            Err(FrameSourceError::Disconnected(ref m)) if m == "cable pulled"
        ));
    }

    #[test]
    fn interval_makes_source_live() {
        let source = ReplaySource::new(frames(1)).with_interval(Duration::from_millis(5));
        assert!(source.is_live());
    }
}
