//! Object detector backends and their post-processing.

pub mod demo;
pub mod detector;
pub mod labels;
pub mod nms;
#[cfg(feature = "with-tch")]
pub mod torch;

pub use detector::{
    Detection, DetectorBackend, DetectorOptions, ModelError, ObjectDetector, load_detector,
};
