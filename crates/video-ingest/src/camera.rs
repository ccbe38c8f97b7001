//! OpenCV-backed capture: Raspberry Pi camera module over GStreamer, USB/V4L2
//! devices and looping video files.

use std::path::Path;

use chrono::Utc;
use opencv::{
    core::{self, MatTraitConstManual},
    prelude::*,
    videoio::{self, VideoCapture, VideoCaptureTrait},
};
use tracing::{debug, warn};

use crate::{
    source::{CaptureSettings, FrameSource},
    types::{CaptureError, Frame},
};

/// A single opened `VideoCapture` handle, resized to the configured resolution.
pub struct OpencvSource {
    name: String,
    cap: VideoCapture,
    frame: Mat,
    scratch: Mat,
    target: (i32, i32),
    looping: bool,
}

impl OpencvSource {
    fn new(name: String, cap: VideoCapture, settings: &CaptureSettings, looping: bool) -> Self {
        Self {
            name,
            cap,
            frame: Mat::default(),
            scratch: Mat::default(),
            target: (settings.width, settings.height),
            looping,
        }
    }

    fn read_raw(&mut self) -> Result<bool, CaptureError> {
        let ok = self.cap.read(&mut self.frame).map_err(|e| self.read_error(e))?;
        let width = self.frame.size().map_err(|e| self.read_error(e))?.width;
        Ok(ok && width > 0)
    }

    fn read_error(&self, err: opencv::Error) -> CaptureError {
        CaptureError::Read {
            device: self.name.clone(),
            reason: err.to_string(),
        }
    }
}

impl FrameSource for OpencvSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn read_frame(&mut self) -> Result<Frame, CaptureError> {
        if !self.read_raw()? {
            if !self.looping {
                return Err(CaptureError::Read {
                    device: self.name.clone(),
                    reason: "device returned an empty frame".to_string(),
                });
            }
            debug!("{} reached end of file, rewinding", self.name);
            self.cap
                .set(videoio::CAP_PROP_POS_FRAMES, 0.0)
                .map_err(|e| self.read_error(e))?;
            if !self.read_raw()? {
                return Err(CaptureError::Read {
                    device: self.name.clone(),
                    reason: "video file yielded no frames after rewind".to_string(),
                });
            }
        }

        let size = self.frame.size().map_err(|e| self.read_error(e))?;
        let (target_w, target_h) = self.target;
        let working = if size.width != target_w || size.height != target_h {
            opencv::imgproc::resize(
                &self.frame,
                &mut self.scratch,
                core::Size {
                    width: target_w,
                    height: target_h,
                },
                0.0,
                0.0,
                opencv::imgproc::INTER_LINEAR,
            )
            .map_err(|e| self.read_error(e))?;
            &self.scratch
        } else {
            &self.frame
        };

        let data = working
            .data_bytes()
            .map_err(|e| CaptureError::Other(e.into()))?
            .to_vec();

        Ok(Frame::new(
            data,
            target_w,
            target_h,
            Utc::now().timestamp_millis(),
        ))
    }
}

/// GStreamer pipeline string for the Raspberry Pi camera module.
pub fn libcamera_pipeline(settings: &CaptureSettings) -> String {
    format!(
        "libcamerasrc ! video/x-raw,width={},height={},framerate={}/1 ! videoconvert ! appsink",
        settings.width, settings.height, settings.fps
    )
}

pub fn open_libcamera(settings: &CaptureSettings) -> Result<OpencvSource, CaptureError> {
    let pipeline = libcamera_pipeline(settings);
    let cap = VideoCapture::from_file(&pipeline, videoio::CAP_GSTREAMER)
        .map_err(|e| CaptureError::Other(e.into()))?;
    if !cap.is_opened().map_err(|e| CaptureError::Other(e.into()))? {
        return Err(CaptureError::Open { uri: pipeline });
    }
    Ok(OpencvSource::new(
        "libcamera".to_string(),
        cap,
        settings,
        false,
    ))
}

pub fn open_usb(index: i32, settings: &CaptureSettings) -> Result<OpencvSource, CaptureError> {
    for backend in [videoio::CAP_V4L2, videoio::CAP_ANY] {
        match VideoCapture::new(index, backend) {
            Ok(mut cap) => {
                if cap.is_opened().map_err(|e| CaptureError::Other(e.into()))? {
                    configure_camera(&mut cap, settings);
                    return Ok(OpencvSource::new(
                        format!("usb:{index}"),
                        cap,
                        settings,
                        false,
                    ));
                }
            }
            Err(err) => {
                warn!("failed to open device #{index} with backend {backend}: {err}");
            }
        }
    }
    Err(CaptureError::Open {
        uri: format!("/dev/video{index}"),
    })
}

pub fn open_file(path: &Path, settings: &CaptureSettings) -> Result<OpencvSource, CaptureError> {
    let uri = path.to_string_lossy().into_owned();
    if !path.exists() {
        return Err(CaptureError::Open { uri });
    }
    let cap = VideoCapture::from_file(&uri, videoio::CAP_ANY)
        .map_err(|e| CaptureError::Other(e.into()))?;
    if !cap.is_opened().map_err(|e| CaptureError::Other(e.into()))? {
        return Err(CaptureError::Open { uri });
    }
    Ok(OpencvSource::new(format!("file:{uri}"), cap, settings, true))
}

/// Apply resolution, frame rate, queue depth and preferred pixel format.
fn configure_camera(cap: &mut VideoCapture, settings: &CaptureSettings) {
    let mut fourcc_set = false;
    if let Ok(mjpg) = videoio::VideoWriter::fourcc('M', 'J', 'P', 'G') {
        if matches!(cap.set(videoio::CAP_PROP_FOURCC, mjpg as f64), Ok(true)) {
            fourcc_set = true;
        }
    }
    if !fourcc_set {
        if let Ok(yuyv) = videoio::VideoWriter::fourcc('Y', 'U', 'Y', 'V') {
            let _ = cap.set(videoio::CAP_PROP_FOURCC, yuyv as f64);
        }
    }
    let _ = cap.set(videoio::CAP_PROP_FRAME_WIDTH, settings.width as f64);
    let _ = cap.set(videoio::CAP_PROP_FRAME_HEIGHT, settings.height as f64);
    let _ = cap.set(videoio::CAP_PROP_FPS, settings.fps as f64);
    let _ = cap.set(videoio::CAP_PROP_BUFFERSIZE, settings.buffer_size as f64);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn libcamera_pipeline_carries_resolution_and_rate() {
        let settings = CaptureSettings {
            width: 640,
            height: 480,
            fps: 30,
            buffer_size: 1,
        };
        assert_eq!(
            libcamera_pipeline(&settings),
            "libcamerasrc ! video/x-raw,width=640,height=480,framerate=30/1 ! videoconvert ! appsink"
        );
    }

    #[test]
    fn missing_video_file_is_an_open_error() {
        let settings = CaptureSettings {
            width: 64,
            height: 48,
            fps: 10,
            buffer_size: 1,
        };
        let err = open_file(Path::new("/nonexistent/clip.mp4"), &settings)
            .err()
            .expect("missing file must not open");
        assert!(matches!(err, CaptureError::Open { .. }));
    }
}
