//! Error taxonomy.
//!
//! Only `FrameSourceError` (through `PipelineError`) and the `BackendUnhealthy` event cross the
//! pipeline boundary. `InferenceError` and `CallbackError` are absorbed per frame and show up in
//! the aggregate counters of `PipelineStats`.

use std::fmt::Display;
use std::sync::Arc;

use thiserror::Error;

use crate::frame::{FrameError, PixelFormat};
use crate::pipeline::{BackendRole, PipelineState};

/// Per-frame backend failure. Recoverable: the frame is dropped and the stream continues.
#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("malformed frame: {0}")]
    MalformedFrame(#[from] FrameError),
    #[error("backend '{backend}' does not accept {format} frames")]
    UnsupportedFormat {
        backend: &'static str,
        format: PixelFormat,
    },
    #[error("backend produced invalid output: {0}")]
    InvalidOutput(String),
    #[error("model invocation failed: {0}")]
    Model(String),
    #[error("backend panicked: {0}")]
    Panicked(String),
}

impl InferenceError {
    /// Wrap an arbitrary model failure, keeping the full context chain in the message.
    pub fn model(err: impl Display) -> Self {
        InferenceError::Model(format!("{:#}", err))
    }
}

/// Acquisition failure. Fatal to the pipeline.
#[derive(Clone, Debug, Error)]
pub enum FrameSourceError {
    #[error("frame source disconnected: {0}")]
    Disconnected(String),
    #[error("frame source '{0}' is not connected")]
    NotConnected(String),
    #[error("frame source produced an invalid frame: {0}")]
    InvalidFrame(#[from] FrameError),
    #[error("unsupported frame source url '{0}'")]
    UnsupportedUrl(String),
    #[error("frame source device error: {0}")]
    Device(String),
    #[error(transparent)]
    Io(Arc<std::io::Error>),
}

impl From<std::io::Error> for FrameSourceError {
    fn from(err: std::io::Error) -> Self {
        FrameSourceError::Io(Arc::new(err))
    }
}

/// Fault raised by the result callback. Logged and counted, never propagated.
#[derive(Debug, Error)]
pub enum CallbackError {
    #[error("result callback failed: {0:#}")]
    Failed(anyhow::Error),
    #[error("result callback panicked: {0}")]
    Panicked(String),
}

/// Errors surfaced to the caller of the pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    FrameSource(#[from] FrameSourceError),
    #[error("no {0} backend configured")]
    MissingBackend(BackendRole),
    #[error("invalid pipeline state transition {from} -> {to}")]
    InvalidTransition {
        from: PipelineState,
        to: PipelineState,
    },
    #[error("failed to spawn {name} thread: {source}")]
    Spawn {
        name: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("{0} thread panicked")]
    ThreadPanicked(&'static str),
}

/// Render a panic payload as text.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_errors_keep_context_chain() {
        let err = anyhow::anyhow!("tensor shape mismatch").context("onnx run failed");
        let wrapped = InferenceError::model(err);
        assert_eq!(
            wrapped.to_string(),
            "model invocation failed: onnx run failed: tensor shape mismatch"
        );
    }

    #[test]
    fn source_errors_clone_with_their_cause() {
        let err = FrameSourceError::from(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "capture pipe closed",
        ));
        let copy = err.clone();
        assert_eq!(copy.to_string(), "capture pipe closed");
        assert!(matches!(
            copy,
            FrameSourceError::Io(ref io) if io.kind() == std::io::ErrorKind::UnexpectedEof
        ));
    }

    #[test]
    fn panic_payloads_render_as_text() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn std::any::Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "bang");
    }
}
