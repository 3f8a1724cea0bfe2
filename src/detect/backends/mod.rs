pub mod color;
pub mod stub;

pub use color::ColorDetector;
pub use stub::StubDetector;
