mod backend;
pub mod backends;
mod map;

pub use backend::DepthBackend;
pub use backends::{ConstantDepth, GroundPlaneDepth, LuminanceDepth};
pub use map::{DepthMap, DepthSampling, DEFAULT_DEPTH_M};
