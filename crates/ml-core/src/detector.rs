use std::{fmt, path::PathBuf, str::FromStr};

use thiserror::Error;
use tracing::info;

use crate::{demo::DemoDetector, labels::load_labels};

/// Single detection in source-frame pixel coordinates.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Detection {
    pub class_id: i64,
    pub label: String,
    pub score: f32,
    /// `[x1, y1, x2, y2]`.
    pub bbox: [f32; 4],
}

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("failed to load model {path:?}: {reason}")]
    Load { path: PathBuf, reason: String },
    #[error("failed to read labels file {path:?}: {reason}")]
    Labels { path: PathBuf, reason: String },
    #[error("frame buffer holds {actual} bytes, expected {expected} for {width}x{height} BGR")]
    InputShape {
        width: i32,
        height: i32,
        expected: usize,
        actual: usize,
    },
    #[error("unexpected detector output shape {0:?}")]
    OutputShape(Vec<i64>),
    #[error("{backend} detector is not available in this build (enable the `{feature}` feature)")]
    Unsupported {
        backend: &'static str,
        feature: &'static str,
    },
    #[error("inference failed: {0}")]
    Inference(String),
}

/// Object detector over raw BGR8 frames.
pub trait ObjectDetector: Send {
    fn name(&self) -> &str;

    /// Runs the model on one frame. Boxes are returned in the frame's own
    /// coordinate space; confidence filtering beyond the model's own cut-off
    /// is left to the caller.
    fn detect(&mut self, bgr: &[u8], width: i32, height: i32) -> Result<Vec<Detection>, ModelError>;
}

/// Checks that `bgr` holds exactly `width * height * 3` bytes.
pub fn check_input(bgr: &[u8], width: i32, height: i32) -> Result<(), ModelError> {
    let expected = (width.max(0) as usize) * (height.max(0) as usize) * 3;
    if width <= 0 || height <= 0 || bgr.len() != expected {
        return Err(ModelError::InputShape {
            width,
            height,
            expected,
            actual: bgr.len(),
        });
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectorBackend {
    /// TorchScript export of a YOLOv8 model.
    Torch,
    /// Fixed detection, for running the stack without an ML runtime.
    Demo,
    /// ML disabled; the server streams the raw camera feed.
    Disabled,
}

impl FromStr for DetectorBackend {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "torch" | "torchscript" => Ok(DetectorBackend::Torch),
            "demo" => Ok(DetectorBackend::Demo),
            "none" | "off" | "disabled" => Ok(DetectorBackend::Disabled),
            other => Err(format!("unknown detector backend {other:?} (expected torch, demo or none)")),
        }
    }
}

impl fmt::Display for DetectorBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DetectorBackend::Torch => "torch",
            DetectorBackend::Demo => "demo",
            DetectorBackend::Disabled => "none",
        })
    }
}

#[derive(Debug, Clone)]
pub struct DetectorOptions {
    pub backend: DetectorBackend,
    pub model_path: PathBuf,
    pub labels_path: Option<PathBuf>,
    /// Model input resolution as (width, height).
    pub input_size: (i64, i64),
    pub confidence_threshold: f32,
    pub iou_threshold: f32,
}

/// Builds the configured detector. `Ok(None)` means ML is disabled.
pub fn load_detector(
    options: &DetectorOptions,
) -> Result<Option<Box<dyn ObjectDetector>>, ModelError> {
    let labels = match &options.labels_path {
        Some(path) => {
            let labels = load_labels(path)?;
            info!("loaded {} class names from {}", labels.len(), path.display());
            labels
        }
        None => Vec::new(),
    };

    match options.backend {
        DetectorBackend::Disabled => Ok(None),
        DetectorBackend::Demo => Ok(Some(Box::new(DemoDetector::new()))),
        DetectorBackend::Torch => load_torch(options, labels),
    }
}

#[cfg(feature = "with-tch")]
fn load_torch(
    options: &DetectorOptions,
    labels: Vec<String>,
) -> Result<Option<Box<dyn ObjectDetector>>, ModelError> {
    let detector = crate::torch::TorchDetector::load(options, labels)?;
    Ok(Some(Box::new(detector)))
}

#[cfg(not(feature = "with-tch"))]
fn load_torch(
    options: &DetectorOptions,
    _labels: Vec<String>,
) -> Result<Option<Box<dyn ObjectDetector>>, ModelError> {
    if !options.model_path.exists() {
        return Err(ModelError::Load {
            path: options.model_path.clone(),
            reason: "file not found".to_string(),
        });
    }
    Err(ModelError::Unsupported {
        backend: "TorchScript",
        feature: "with-tch",
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(backend: DetectorBackend) -> DetectorOptions {
        DetectorOptions {
            backend,
            model_path: PathBuf::from("/nonexistent/best.torchscript"),
            labels_path: None,
            input_size: (640, 640),
            confidence_threshold: 0.5,
            iou_threshold: 0.45,
        }
    }

    #[test]
    fn parses_backend_names() {
        assert_eq!("torch".parse(), Ok(DetectorBackend::Torch));
        assert_eq!("Demo".parse(), Ok(DetectorBackend::Demo));
        assert_eq!("none".parse(), Ok(DetectorBackend::Disabled));
        assert!("onnx".parse::<DetectorBackend>().is_err());
    }

    #[test]
    fn disabled_backend_has_no_detector() {
        assert!(load_detector(&options(DetectorBackend::Disabled)).unwrap().is_none());
    }

    #[test]
    fn demo_backend_loads_without_model_file() {
        let detector = load_detector(&options(DetectorBackend::Demo)).unwrap();
        assert_eq!(detector.unwrap().name(), "demo");
    }

    #[test]
    fn missing_model_file_is_a_load_error() {
        let err = load_detector(&options(DetectorBackend::Torch)).err().unwrap();
        assert!(matches!(err, ModelError::Load { .. }), "{err}");
    }

    #[test]
    fn missing_labels_file_is_reported() {
        let mut opts = options(DetectorBackend::Demo);
        opts.labels_path = Some(PathBuf::from("/nonexistent/labels.txt"));
        let err = load_detector(&opts).err().unwrap();
        assert!(matches!(err, ModelError::Labels { .. }));
    }

    #[test]
    fn input_check_rejects_mismatched_buffers() {
        assert!(check_input(&[0; 12], 2, 2).is_ok());
        assert!(matches!(
            check_input(&[0; 11], 2, 2),
            Err(ModelError::InputShape { expected: 12, actual: 11, .. })
        ));
        assert!(check_input(&[], 0, 0).is_err());
    }
}
