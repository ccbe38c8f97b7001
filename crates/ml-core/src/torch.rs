//! TorchScript YOLOv8 detector.

use std::convert::TryFrom;

use tch::{self, Device, Kind, Tensor};
use tracing::info;

use crate::{
    detector::{Detection, DetectorOptions, ModelError, ObjectDetector, check_input},
    labels::label_for,
    nms::non_max_suppression,
};

const MAX_DETECTIONS: usize = 512;

/// TorchScript-backed detector wrapper.
pub struct TorchDetector {
    module: tch::CModule,
    device: Device,
    input_size: (i64, i64),
    confidence_threshold: f32,
    iou_threshold: f32,
    labels: Vec<String>,
}

impl TorchDetector {
    /// Load a TorchScript module on CUDA when available, CPU otherwise.
    pub fn load(options: &DetectorOptions, labels: Vec<String>) -> Result<Self, ModelError> {
        let path = &options.model_path;
        if !path.exists() {
            return Err(ModelError::Load {
                path: path.clone(),
                reason: "file not found".to_string(),
            });
        }
        let device = Device::cuda_if_available();
        let mut module =
            tch::CModule::load_on_device(path, device).map_err(|err| ModelError::Load {
                path: path.clone(),
                reason: err.to_string(),
            })?;
        module.set_eval();
        info!(
            "loaded TorchScript model {} on {:?} (input {}x{})",
            path.display(),
            device,
            options.input_size.0,
            options.input_size.1
        );
        Ok(Self {
            module,
            device,
            input_size: options.input_size,
            confidence_threshold: options.confidence_threshold,
            iou_threshold: options.iou_threshold,
            labels,
        })
    }

    /// Converts a BGR frame (height, width) into a normalized RGB NCHW tensor
    /// resized to the model input.
    fn bgr_to_tensor(&self, bgr: &[u8], width: i32, height: i32) -> Tensor {
        let (in_w, in_h) = self.input_size;
        let tensor = Tensor::from_slice(bgr)
            .to_device(self.device)
            .view([height as i64, width as i64, 3])
            .flip([2])
            .permute([2, 0, 1])
            .unsqueeze(0)
            .to_kind(Kind::Float)
            / 255.0;
        if (width as i64, height as i64) == (in_w, in_h) {
            tensor
        } else {
            tensor.upsample_bilinear2d([in_h, in_w], false, None, None)
        }
    }

    /// Decodes `[1, 4 + classes, anchors]` into frame-space boxes.
    fn decode(&self, output: &Tensor, width: i32, height: i32) -> Result<Vec<Detection>, ModelError> {
        let shape = output.size();
        if shape.len() != 3 || shape[0] != 1 || shape[1] < 5 {
            return Err(ModelError::OutputShape(shape));
        }

        let preds = output
            .to_device(Device::Cpu)
            .to_kind(Kind::Float)
            .squeeze_dim(0)
            .permute([1, 0])
            .contiguous();
        let rows = Vec::<Vec<f32>>::try_from(&preds)
            .map_err(|err| ModelError::Inference(err.to_string()))?;

        let (in_w, in_h) = self.input_size;
        let scale_x = width as f32 / in_w as f32;
        let scale_y = height as f32 / in_h as f32;
        let (max_x, max_y) = (width as f32, height as f32);

        let mut detections = Vec::new();
        for row in rows {
            let Some((class_idx, score)) = row[4..]
                .iter()
                .copied()
                .enumerate()
                .max_by(|a, b| a.1.total_cmp(&b.1))
            else {
                continue;
            };
            if score < self.confidence_threshold {
                continue;
            }
            let (cx, cy, w, h) = (row[0], row[1], row[2], row[3]);
            let bbox = [
                ((cx - w / 2.0) * scale_x).clamp(0.0, max_x),
                ((cy - h / 2.0) * scale_y).clamp(0.0, max_y),
                ((cx + w / 2.0) * scale_x).clamp(0.0, max_x),
                ((cy + h / 2.0) * scale_y).clamp(0.0, max_y),
            ];
            let class_id = class_idx as i64;
            detections.push(Detection {
                class_id,
                label: label_for(&self.labels, class_id),
                score,
                bbox,
            });
        }

        let mut kept = non_max_suppression(detections, self.iou_threshold);
        kept.truncate(MAX_DETECTIONS);
        Ok(kept)
    }
}

impl ObjectDetector for TorchDetector {
    fn name(&self) -> &str {
        "torch"
    }

    fn detect(&mut self, bgr: &[u8], width: i32, height: i32) -> Result<Vec<Detection>, ModelError> {
        check_input(bgr, width, height)?;
        let output = tch::no_grad(|| {
            let input = self.bgr_to_tensor(bgr, width, height);
            self.module.forward_ts(&[input])
        })
        .map_err(|err| ModelError::Inference(err.to_string()))?;
        self.decode(&output, width, height)
    }
}
