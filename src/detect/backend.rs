use crate::error::InferenceError;
use crate::frame::Frame;

use super::result::Detection;

/// Object-detection backend.
///
/// # Contract
///
/// - `infer` receives the frame read-only and must not retain references to its pixels.
/// - The pipeline calls a backend from a single worker thread, one frame at a time. Backends
///   may keep internal caches but must not depend on any ordering beyond that.
/// - A malformed frame or a failed model invocation is reported as `InferenceError`. The
///   pipeline drops that frame and keeps running.
///
/// The returned detections are stamped with the frame's sequence number by the pipeline, so a
/// backend cannot pair its output with the wrong frame.
pub trait DetectorBackend: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Run detection on a frame.
    fn infer(&mut self, frame: &Frame) -> Result<Vec<Detection>, InferenceError>;

    /// Optional warm-up hook, called once on the worker thread before the first frame.
    fn warm_up(&mut self) -> Result<(), InferenceError> {
        Ok(())
    }
}

impl<B: DetectorBackend + ?Sized> DetectorBackend for Box<B> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn infer(&mut self, frame: &Frame) -> Result<Vec<Detection>, InferenceError> {
        (**self).infer(frame)
    }

    fn warm_up(&mut self) -> Result<(), InferenceError> {
        (**self).warm_up()
    }
}
