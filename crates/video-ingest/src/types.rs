use thiserror::Error;

/// Raw BGR8 frame captured from a video source.
#[derive(Clone, Debug)]
pub struct Frame {
    pub data: Vec<u8>,
    pub width: i32,
    pub height: i32,
    pub timestamp_ms: i64,
    /// Assigned when the frame is published; zero until then.
    pub sequence: u64,
    pub format: FrameFormat,
}

impl Frame {
    pub fn new(data: Vec<u8>, width: i32, height: i32, timestamp_ms: i64) -> Self {
        Self {
            data,
            width,
            height,
            timestamp_ms,
            sequence: 0,
            format: FrameFormat::Bgr8,
        }
    }

    /// All-black frame, used for model warm-up.
    pub fn blank(width: i32, height: i32, timestamp_ms: i64) -> Self {
        let len = (width.max(0) as usize) * (height.max(0) as usize) * 3;
        Self::new(vec![0; len], width, height, timestamp_ms)
    }

    /// Number of bytes a frame of this size and format should carry.
    pub fn expected_len(&self) -> usize {
        match self.format {
            FrameFormat::Bgr8 => (self.width.max(0) as usize) * (self.height.max(0) as usize) * 3,
        }
    }

    /// True when the buffer is non-empty and matches the declared dimensions.
    pub fn is_well_formed(&self) -> bool {
        self.width > 0 && self.height > 0 && self.data.len() == self.expected_len()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameFormat {
    Bgr8,
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("failed to open video source {uri:?}")]
    Open { uri: String },
    #[error("failed to read a frame from {device}: {reason}")]
    Read { device: String, reason: String },
    #[error("{backend} capture is not available in this build (enable the `{feature}` feature)")]
    Unsupported {
        backend: &'static str,
        feature: &'static str,
    },
    #[error("no camera backend could be opened ({attempts})")]
    Exhausted { attempts: String },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
