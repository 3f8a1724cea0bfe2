//! V4L2 frame source.
//!
//! The default camera adapter on Linux. Captures from a local device node (e.g. /dev/video0)
//! through memory-mapped buffers and copies each buffer into an owned `Frame`.
//!
//! Only packed RGB/BGR, GREY and NV12 capture formats are accepted. RGB3 is requested first;
//! whatever the driver settles on must be one of those.

use std::time::{Duration, Instant};

use ouroboros::self_referencing;

use crate::error::FrameSourceError;
use crate::frame::{Frame, PixelFormat, SequenceCounter};

use super::{FrameSource, SourceSettings, SourceStats};

/// Device node and requested capture geometry.
#[derive(Clone, Debug)]
pub struct V4l2Config {
    pub device: String,
    /// 0 keeps whatever rate the driver picks.
    pub target_fps: u32,
    pub width: u32,
    pub height: u32,
}

impl V4l2Config {
    pub fn from_settings(device: &str, settings: &SourceSettings) -> Self {
        Self {
            device: device.to_string(),
            target_fps: settings.fps,
            width: settings.width,
            height: settings.height,
        }
    }
}

impl Default for V4l2Config {
    fn default() -> Self {
        Self::from_settings(DEFAULT_DEVICE, &SourceSettings::default())
    }
}

const DEFAULT_DEVICE: &str = "/dev/video0";
const MMAP_BUFFERS: u32 = 4;

/// Geometry and pixel layout the driver agreed to.
#[derive(Clone, Copy, Debug, PartialEq)]
struct Negotiated {
    width: u32,
    height: u32,
    format: PixelFormat,
}

#[self_referencing]
struct DeviceState {
    device: v4l::Device,
    #[borrows(mut device)]
    #[covariant]
    stream: v4l::prelude::MmapStream<'this, v4l::Device>,
}

pub struct V4l2Source {
    config: V4l2Config,
    state: Option<DeviceState>,
    sequence: SequenceCounter,
    negotiated: Option<Negotiated>,
    last_frame_at: Option<Instant>,
    /// Gap before the latest frame, when it exceeded the stall limit.
    stalled_for: Option<Duration>,
    last_error: Option<String>,
}

impl V4l2Source {
    pub fn new(config: V4l2Config) -> Self {
        Self {
            config,
            state: None,
            sequence: SequenceCounter::new(),
            negotiated: None,
            last_frame_at: None,
            stalled_for: None,
            last_error: None,
        }
    }

    fn device_error(&mut self, context: &str, err: impl std::fmt::Display) -> FrameSourceError {
        let message = format!("{} {}: {}", context, self.config.device, err);
        self.last_error = Some(message.clone());
        FrameSourceError::Device(message)
    }

    /// Six frame intervals, never less than two seconds.
    fn stall_limit(&self) -> Duration {
        let interval_ms = 1_000u64
            .checked_div(u64::from(self.config.target_fps))
            .unwrap_or(0);
        Duration::from_millis((interval_ms * 6).max(2_000))
    }

    fn record_arrival(&mut self, now: Instant) {
        let gap = self.last_frame_at.map(|at| now.saturating_duration_since(at));
        self.stalled_for = gap.filter(|gap| *gap > self.stall_limit());
        if let Some(gap) = self.stalled_for {
            log::warn!("{} stalled for {:?} between frames", self.config.device, gap);
        }
        self.last_frame_at = Some(now);
    }

    /// Ask for RGB3 at the configured size and fall back to the driver's current format.
    fn negotiate(&mut self, device: &mut v4l::Device) -> Result<Negotiated, FrameSourceError> {
        use v4l::video::Capture;

        let mut wanted = device
            .format()
            .map_err(|err| self.device_error("query format of", err))?;
        wanted.width = self.config.width;
        wanted.height = self.config.height;
        wanted.fourcc = v4l::FourCC::new(b"RGB3");

        let granted = match device.set_format(&wanted) {
            Ok(granted) => granted,
            Err(err) => {
                log::warn!(
                    "{}: RGB3 {}x{} refused: {}",
                    self.config.device,
                    wanted.width,
                    wanted.height,
                    err
                );
                device
                    .format()
                    .map_err(|err| self.device_error("query format of", err))?
            }
        };
        let format = match pixel_format(&granted.fourcc) {
            Some(format) => format,
            None => {
                return Err(self.device_error("unsupported capture format on", granted.fourcc))
            }
        };

        if self.config.target_fps > 0 {
            let params = v4l::video::capture::Parameters::with_fps(self.config.target_fps);
            if let Err(err) = device.set_params(&params) {
                log::warn!(
                    "{}: cannot set {} fps: {}",
                    self.config.device,
                    self.config.target_fps,
                    err
                );
            }
        }

        Ok(Negotiated {
            width: granted.width,
            height: granted.height,
            format,
        })
    }
}

fn pixel_format(fourcc: &v4l::FourCC) -> Option<PixelFormat> {
    match &fourcc.repr {
        b"RGB3" => Some(PixelFormat::Rgb24),
        b"BGR3" => Some(PixelFormat::Bgr24),
        b"GREY" => Some(PixelFormat::Gray8),
        b"NV12" => Some(PixelFormat::Nv12),
        _ => None,
    }
}

impl FrameSource for V4l2Source {
    fn connect(&mut self) -> Result<(), FrameSourceError> {
        let mut device = v4l::Device::with_path(&self.config.device)
            .map_err(|err| self.device_error("open", err))?;
        let negotiated = self.negotiate(&mut device)?;

        let state = DeviceStateBuilder {
            device,
            stream_builder: |device| {
                v4l::prelude::MmapStream::with_buffers(
                    device,
                    v4l::buffer::Type::VideoCapture,
                    MMAP_BUFFERS,
                )
            },
        }
        .try_build()
        .map_err(|err| self.device_error("map capture buffers of", err))?;

        log::info!(
            "capturing {}x{} {} from {}",
            negotiated.width,
            negotiated.height,
            negotiated.format,
            self.config.device
        );
        self.state = Some(state);
        self.negotiated = Some(negotiated);
        self.last_error = None;
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Option<Frame>, FrameSourceError> {
        use v4l::io::traits::CaptureStream;

        let (Some(state), Some(negotiated)) = (self.state.as_mut(), self.negotiated) else {
            return Err(FrameSourceError::NotConnected(self.config.device.clone()));
        };
        let captured = state.with_mut(|fields| fields.stream.next().map(|(buf, _)| buf.to_vec()));
        let pixels = match captured {
            Ok(pixels) => pixels,
            Err(err) => {
                let message = format!("{} stopped delivering buffers: {}", self.config.device, err);
                self.last_error = Some(message.clone());
                return Err(FrameSourceError::Disconnected(message));
            }
        };

        self.record_arrival(Instant::now());
        let frame = Frame::new(
            pixels,
            negotiated.width,
            negotiated.height,
            negotiated.format,
            self.sequence.next_sequence(),
        )?;
        Ok(Some(frame))
    }

    fn is_healthy(&self) -> bool {
        self.last_error.is_none() && self.stalled_for.is_none()
    }

    fn describe(&self) -> String {
        format!("v4l2://{}", self.config.device)
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.sequence.last(),
            source: self.describe(),
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fourcc_mapping_covers_supported_formats() {
        assert_eq!(
            pixel_format(&v4l::FourCC::new(b"RGB3")),
            Some(PixelFormat::Rgb24)
        );
        assert_eq!(
            pixel_format(&v4l::FourCC::new(b"NV12")),
            Some(PixelFormat::Nv12)
        );
        assert_eq!(pixel_format(&v4l::FourCC::new(b"MJPG")), None);
    }

    #[test]
    fn stall_limit_scales_with_frame_rate() {
        let mut config = V4l2Config::default();
        config.target_fps = 1;
        assert_eq!(V4l2Source::new(config.clone()).stall_limit(), Duration::from_secs(6));
        config.target_fps = 0;
        assert_eq!(V4l2Source::new(config).stall_limit(), Duration::from_secs(2));
    }

    #[test]
    fn long_gap_between_frames_marks_a_stall() {
        let mut source = V4l2Source::new(V4l2Config::default());
        let start = Instant::now();
        source.record_arrival(start);
        source.record_arrival(start + Duration::from_millis(40));
        assert!(source.is_healthy());
        source.record_arrival(start + Duration::from_secs(5));
        assert!(!source.is_healthy());
        source.record_arrival(start + Duration::from_millis(5_040));
        assert!(source.is_healthy());
    }

    #[test]
    fn source_moves_between_threads() {
        fn assert_send<T: Send>() {}
        assert_send::<V4l2Source>();
    }

    #[test]
    fn next_frame_requires_connect() {
        let mut source = V4l2Source::new(V4l2Config {
            device: "/dev/video-missing".to_string(),
            ..V4l2Config::default()
        });
        assert!(matches!(
            source.next_frame(),
            Err(FrameSourceError::NotConnected(_))
        ));
        assert!(source.connect().is_err());
        assert!(!source.is_healthy());
    }
}
