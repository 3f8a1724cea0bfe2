//! Built-in depth backends. Heuristic, not learned models.

pub mod constant;
pub mod ground;
pub mod luminance;

pub use constant::ConstantDepth;
pub use ground::GroundPlaneDepth;
pub use luminance::LuminanceDepth;

use crate::frame::Frame;

/// Output map size for a sampling stride: `ceil(dim / stride)` on each axis.
pub(crate) fn output_dims(frame: &Frame, stride: u32) -> (u32, u32) {
    let stride = stride.max(1);
    (
        frame.width().div_ceil(stride),
        frame.height().div_ceil(stride),
    )
}
