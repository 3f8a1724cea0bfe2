//! Frame sources.
//!
//! - `stub://name`: [`SyntheticSource`], a moving green square on black. Live.
//! - [`ReplaySource`]: frames held in memory, for tests and offline runs.
//! - `/dev/videoN` or `v4l2:///dev/videoN`: [`V4l2Source`] (feature: ingest-v4l2).
//!
//! The pipeline owns its source exclusively and reads it from a single thread. Sources stamp
//! every frame with a strictly increasing sequence number.

pub(crate) mod normalize;
mod replay;
mod synthetic;
#[cfg(feature = "ingest-v4l2")]
pub mod v4l2;

pub use replay::ReplaySource;
pub use synthetic::SyntheticSource;
#[cfg(feature = "ingest-v4l2")]
pub use v4l2::{V4l2Config, V4l2Source};

use serde::Serialize;

use crate::error::FrameSourceError;
use crate::frame::Frame;

/// Source used when the caller does not supply one.
#[cfg(feature = "ingest-v4l2")]
pub const DEFAULT_SOURCE_URL: &str = "/dev/video0";
#[cfg(not(feature = "ingest-v4l2"))]
pub const DEFAULT_SOURCE_URL: &str = "stub://camera";

/// Producer of timestamped frames.
pub trait FrameSource: Send {
    /// Open the underlying device. Called once by the pipeline before the first frame.
    fn connect(&mut self) -> Result<(), FrameSourceError> {
        Ok(())
    }

    /// Block until the next frame is available.
    ///
    /// `Ok(None)` marks the end of the stream; the pipeline drains and stops. An error is fatal
    /// to the run.
    fn next_frame(&mut self) -> Result<Option<Frame>, FrameSourceError>;

    /// Live sources keep producing whether or not the pipeline keeps up, so frames that arrive
    /// while the backends are busy are dropped. Non-live sources are read on demand.
    fn is_live(&self) -> bool {
        true
    }

    fn is_healthy(&self) -> bool {
        true
    }

    fn describe(&self) -> String;

    fn stats(&self) -> SourceStats;
}

impl<S: FrameSource + ?Sized> FrameSource for Box<S> {
    fn connect(&mut self) -> Result<(), FrameSourceError> {
        (**self).connect()
    }

    fn next_frame(&mut self) -> Result<Option<Frame>, FrameSourceError> {
        (**self).next_frame()
    }

    fn is_live(&self) -> bool {
        (**self).is_live()
    }

    fn is_healthy(&self) -> bool {
        (**self).is_healthy()
    }

    fn describe(&self) -> String {
        (**self).describe()
    }

    fn stats(&self) -> SourceStats {
        (**self).stats()
    }
}

/// Counters reported by a frame source.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SourceStats {
    pub frames_captured: u64,
    pub source: String,
}

/// Where to read frames from and at what geometry.
#[derive(Clone, Debug, PartialEq)]
pub struct SourceSettings {
    pub url: String,
    pub width: u32,
    pub height: u32,
    /// Target frame rate. 0 means as fast as possible.
    pub fps: u32,
    /// Stop after this many frames (synthetic sources only).
    pub max_frames: Option<u64>,
}

impl Default for SourceSettings {
    fn default() -> Self {
        Self {
            url: DEFAULT_SOURCE_URL.to_string(),
            width: 640,
            height: 480,
            fps: 30,
            max_frames: None,
        }
    }
}

/// Open the source named by `settings.url`.
pub fn open_source(settings: &SourceSettings) -> Result<Box<dyn FrameSource>, FrameSourceError> {
    let url = settings.url.trim();
    if let Some(name) = url.strip_prefix("stub://") {
        let source = SyntheticSource::new(name, settings.width, settings.height)?
            .with_fps(settings.fps)
            .with_max_frames(settings.max_frames);
        return Ok(Box::new(source));
    }

    if url.starts_with("v4l2://") || url.starts_with("/dev/video") {
        return open_v4l2(url, settings);
    }

    Err(FrameSourceError::UnsupportedUrl(url.to_string()))
}

#[cfg(feature = "ingest-v4l2")]
fn open_v4l2(url: &str, settings: &SourceSettings) -> Result<Box<dyn FrameSource>, FrameSourceError> {
    let device = url.strip_prefix("v4l2://").unwrap_or(url);
    Ok(Box::new(V4l2Source::new(V4l2Config::from_settings(
        device, settings,
    ))))
}

#[cfg(not(feature = "ingest-v4l2"))]
fn open_v4l2(url: &str, _settings: &SourceSettings) -> Result<Box<dyn FrameSource>, FrameSourceError> {
    Err(FrameSourceError::UnsupportedUrl(format!(
        "{} (built without the ingest-v4l2 feature)",
        url
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stub_urls_open_synthetic_sources() {
        let settings = SourceSettings {
            url: "stub://bench".into(),
            width: 160,
            height: 120,
            fps: 0,
            max_frames: Some(2),
        };
        let mut source = open_source(&settings).unwrap();
        source.connect().unwrap();
        assert_eq!(source.describe(), "stub://bench");
        assert!(source.next_frame().unwrap().is_some());
        assert!(source.next_frame().unwrap().is_some());
        assert!(source.next_frame().unwrap().is_none());
        assert_eq!(source.stats().frames_captured, 2);
    }

    #[test]
    fn unknown_schemes_are_rejected() {
        let settings = SourceSettings {
            url: "rtsp://camera.local/stream".into(),
            ..SourceSettings::default()
        };
        assert!(matches!(
            open_source(&settings),
            Err(FrameSourceError::UnsupportedUrl(_))
        ));
    }
}
