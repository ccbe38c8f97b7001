use crate::detector::{Detection, ModelError, ObjectDetector, check_input};

/// Reports a single "stop" sign in the upper-left quadrant of every frame.
#[derive(Debug, Default)]
pub struct DemoDetector;

impl DemoDetector {
    pub fn new() -> Self {
        Self
    }
}

impl ObjectDetector for DemoDetector {
    fn name(&self) -> &str {
        "demo"
    }

    fn detect(&mut self, bgr: &[u8], width: i32, height: i32) -> Result<Vec<Detection>, ModelError> {
        check_input(bgr, width, height)?;
        let (w, h) = (width as f32, height as f32);
        Ok(vec![Detection {
            class_id: 0,
            label: "stop".to_string(),
            score: 0.92,
            bbox: [
                (w * 0.2).floor(),
                (h * 0.2).floor(),
                (w * 0.4).floor(),
                (h * 0.5).floor(),
            ],
        }])
    }
}
