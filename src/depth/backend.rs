use crate::error::InferenceError;
use crate::frame::Frame;

use super::map::DepthMap;

/// Monocular depth backend.
///
/// Same contract as `DetectorBackend`: read-only frame, one call at a time from a single
/// worker, `InferenceError` for per-frame faults. The returned map must cover the whole frame;
/// it may be coarser than the frame (the fuser scales coordinates). The pipeline stamps the
/// frame's sequence number onto the map.
pub trait DepthBackend: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Estimate depth (meters) for a frame.
    fn infer(&mut self, frame: &Frame) -> Result<DepthMap, InferenceError>;

    /// Optional warm-up hook, called once on the worker thread before the first frame.
    fn warm_up(&mut self) -> Result<(), InferenceError> {
        Ok(())
    }
}

impl<B: DepthBackend + ?Sized> DepthBackend for Box<B> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn infer(&mut self, frame: &Frame) -> Result<DepthMap, InferenceError> {
        (**self).infer(frame)
    }

    fn warm_up(&mut self) -> Result<(), InferenceError> {
        (**self).warm_up()
    }
}
