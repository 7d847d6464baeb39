#[cfg(feature = "camera-nokhwa")]
pub mod camera;
pub mod landmarks;
pub mod mjpeg;
pub mod rgba_converter;
pub mod skeleton;
pub mod source;

pub use landmarks::{HolisticDetector, KeypointExtractor, LandmarkDetector};
pub use source::{CaptureStream, VideoSource, recv_latest_frame, start_capture};
