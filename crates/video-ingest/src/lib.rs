//! Frame sources for the camera server: libcamera and USB cameras through
//! OpenCV, looping video files and a synthetic test pattern.

#[cfg(feature = "with-opencv")]
pub mod camera;
pub mod source;
pub mod test_pattern;
pub mod types;

pub use source::{CaptureSettings, FrameSource, SourceChain, SourceOpener, SourceSpec, open_source};
pub use types::{CaptureError, Frame, FrameFormat};
