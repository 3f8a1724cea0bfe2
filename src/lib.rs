//! Realtime detection + depth fusion pipeline.
//!
//! Captures frames, runs a pluggable object detector and a pluggable monocular depth estimator
//! on each frame concurrently, fuses both outputs and hands one result per frame to a caller
//! callback.
//!
//! # Guarantees
//!
//! 1. **Paired outputs**: a `FusedResult` only ever combines detector and depth output stamped
//!    with the same frame sequence number. A frame with a missing half produces nothing.
//! 2. **Bounded latency**: at most one frame per backend role is in flight. Live frames that
//!    arrive while a backend is busy are dropped and counted, never queued.
//! 3. **Ordered delivery**: results reach the callback in strictly increasing sequence order.
//! 4. **Fault isolation**: backend errors cost one frame; callback errors and panics are logged
//!    and counted. Only frame source failures and `BackendUnhealthy` reach the caller.
//! 5. **Graceful drain**: stopping finishes in-flight frames within a bounded timeout.
//!
//! # Module Structure
//!
//! - `frame`: immutable frames, pixel formats, sequence stamping
//! - `ingest`: frame sources (synthetic, replay, V4L2)
//! - `detect` / `depth`: backend traits, output types, built-in backends
//! - `fuse`: pairing, depth sampling and back-projection
//! - `track`: optional frame-to-frame object tracking
//! - `sink`: callback delivery and fault isolation
//! - `pipeline`: state machine, scheduling, backpressure, stats and events
//! - `registry` / `config`: name-based backend selection and daemon configuration

pub mod config;
pub mod depth;
pub mod detect;
pub mod error;
pub mod frame;
pub mod fuse;
pub mod ingest;
pub mod pipeline;
pub mod registry;
pub mod sink;
pub mod track;

pub use config::FusionConfig;
pub use depth::{DepthBackend, DepthMap, DepthSampling};
pub use detect::{Detection, DetectionFilter, DetectionSet, DetectorBackend};
pub use error::{CallbackError, FrameSourceError, InferenceError, PipelineError};
pub use frame::{Frame, FrameError, PixelFormat, SequenceCounter};
pub use fuse::{CameraIntrinsics, FusedResult, LocatedObject, ResultFuser};
pub use ingest::{
    open_source, FrameSource, ReplaySource, SourceSettings, SourceStats, SyntheticSource,
};
#[cfg(feature = "ingest-v4l2")]
pub use ingest::{V4l2Config, V4l2Source};
pub use pipeline::{
    BackendRole, Pipeline, PipelineBuilder, PipelineConfig, PipelineEvent, PipelineHandle,
    PipelineReport, PipelineState, PipelineStats, StatsSnapshot, StopHandle,
};
pub use registry::BackendRegistry;
pub use sink::{DeliveryMode, ResultCallback};
pub use track::{Track, Tracker, TrackerConfig};
