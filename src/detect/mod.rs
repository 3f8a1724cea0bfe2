mod backend;
pub mod backends;
mod postprocess;
mod result;

pub use backend::DetectorBackend;
pub use backends::{ColorDetector, StubDetector};
pub use postprocess::{filter_by_score, non_max_suppression, DetectionFilter};
pub use result::{class_label, Detection, DetectionSet, Keypoint, CLASS_COUNT};
