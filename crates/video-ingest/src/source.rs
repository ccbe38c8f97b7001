//! Source selection: which camera interface to open, in which order, and how
//! a candidate proves it actually works.

use std::{fmt, path::PathBuf, str::FromStr};

use tracing::{info, warn};

use crate::{
    test_pattern::TestPattern,
    types::{CaptureError, Frame},
};

/// Blocking producer of frames. `read_frame` may block for up to one frame
/// interval of the underlying device.
pub trait FrameSource: Send {
    fn name(&self) -> &str;
    fn read_frame(&mut self) -> Result<Frame, CaptureError>;
}

/// Opens a ready-to-read [`FrameSource`]. Called once at startup and again
/// whenever the capture loop gives up on a device.
pub trait SourceOpener: Send {
    fn open(&mut self) -> Result<Box<dyn FrameSource>, CaptureError>;
}

/// Camera interface requested by configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SourceSpec {
    /// Raspberry Pi camera module first, USB camera `/dev/video0` second.
    Auto,
    /// Raspberry Pi camera module through a `libcamerasrc` GStreamer pipeline.
    Libcamera,
    /// USB/V4L2 camera by device index.
    Usb { index: i32 },
    /// Pre-recorded video, looped at end of file.
    File { path: PathBuf },
    /// Synthetic moving pattern, no hardware needed.
    TestPattern,
}

impl FromStr for SourceSpec {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let value = value.trim();
        match value {
            "auto" => return Ok(SourceSpec::Auto),
            "libcamera" | "picamera" => return Ok(SourceSpec::Libcamera),
            "usb" => return Ok(SourceSpec::Usb { index: 0 }),
            "test-pattern" => return Ok(SourceSpec::TestPattern),
            _ => {}
        }
        if let Some(index) = value.strip_prefix("usb:") {
            let index = index
                .parse::<i32>()
                .map_err(|_| format!("usb device index must be an integer, got {index:?}"))?;
            if index < 0 {
                return Err(format!("usb device index must not be negative, got {index}"));
            }
            return Ok(SourceSpec::Usb { index });
        }
        if let Some(index) = parse_device_index(value) {
            return Ok(SourceSpec::Usb { index });
        }
        if let Some(path) = value.strip_prefix("file:") {
            if path.is_empty() {
                return Err("file source requires a path".to_string());
            }
            return Ok(SourceSpec::File {
                path: PathBuf::from(path),
            });
        }
        Err("expected auto, libcamera, usb[:N], /dev/videoN, file:PATH or test-pattern".to_string())
    }
}

impl fmt::Display for SourceSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceSpec::Auto => f.write_str("auto"),
            SourceSpec::Libcamera => f.write_str("libcamera"),
            SourceSpec::Usb { index } => write!(f, "usb:{index}"),
            SourceSpec::File { path } => write!(f, "file:{}", path.display()),
            SourceSpec::TestPattern => f.write_str("test-pattern"),
        }
    }
}

/// Parse a `/dev/videoX` style URI and return the zero-based index if present.
pub(crate) fn parse_device_index(uri: &str) -> Option<i32> {
    let stripped = uri.strip_prefix("/dev/video")?;
    if !stripped.is_empty() && stripped.chars().all(|c| c.is_ascii_digit()) {
        return stripped.parse::<i32>().ok();
    }
    None
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CaptureSettings {
    pub width: i32,
    pub height: i32,
    pub fps: u32,
    /// Driver-side frame queue length; 1 keeps latency minimal.
    pub buffer_size: i32,
}

/// Ordered list of backends tried on every open cycle.
///
/// A backend is accepted only once it opens *and* returns a non-empty probe
/// frame; the probe frame is discarded.
pub struct SourceChain {
    candidates: Vec<SourceSpec>,
    settings: CaptureSettings,
}

impl SourceChain {
    pub fn new(spec: &SourceSpec, settings: CaptureSettings) -> Self {
        let candidates = match spec {
            SourceSpec::Auto => vec![SourceSpec::Libcamera, SourceSpec::Usb { index: 0 }],
            other => vec![other.clone()],
        };
        Self::from_candidates(candidates, settings)
    }

    pub fn from_candidates(candidates: Vec<SourceSpec>, settings: CaptureSettings) -> Self {
        Self {
            candidates,
            settings,
        }
    }

    pub fn candidates(&self) -> &[SourceSpec] {
        &self.candidates
    }
}

impl SourceOpener for SourceChain {
    fn open(&mut self) -> Result<Box<dyn FrameSource>, CaptureError> {
        let mut attempts = Vec::with_capacity(self.candidates.len());
        for candidate in &self.candidates {
            let mut source = match open_source(candidate, &self.settings) {
                Ok(source) => source,
                Err(err) => {
                    warn!("camera backend {candidate} unavailable: {err}");
                    attempts.push(format!("{candidate}: {err}"));
                    continue;
                }
            };
            match source.read_frame() {
                Ok(probe) if probe.is_well_formed() => {
                    info!(
                        "camera backend {candidate} ready ({}x{})",
                        probe.width, probe.height
                    );
                    return Ok(source);
                }
                Ok(_) => {
                    warn!("camera backend {candidate} opened but returned an empty frame");
                    attempts.push(format!("{candidate}: empty probe frame"));
                }
                Err(err) => {
                    warn!("camera backend {candidate} opened but cannot read frames: {err}");
                    attempts.push(format!("{candidate}: {err}"));
                }
            }
        }
        Err(CaptureError::Exhausted {
            attempts: attempts.join("; "),
        })
    }
}

/// Open a single backend without probing it.
pub fn open_source(
    spec: &SourceSpec,
    settings: &CaptureSettings,
) -> Result<Box<dyn FrameSource>, CaptureError> {
    match spec {
        SourceSpec::Auto => SourceChain::new(spec, *settings).open(),
        SourceSpec::TestPattern => Ok(Box::new(TestPattern::new(*settings))),
        #[cfg(feature = "with-opencv")]
        SourceSpec::Libcamera => Ok(Box::new(crate::camera::open_libcamera(settings)?)),
        #[cfg(feature = "with-opencv")]
        SourceSpec::Usb { index } => Ok(Box::new(crate::camera::open_usb(*index, settings)?)),
        #[cfg(feature = "with-opencv")]
        SourceSpec::File { path } => Ok(Box::new(crate::camera::open_file(path, settings)?)),
        #[cfg(not(feature = "with-opencv"))]
        SourceSpec::Libcamera | SourceSpec::Usb { .. } | SourceSpec::File { .. } => {
            Err(CaptureError::Unsupported {
                backend: "OpenCV",
                feature: "with-opencv",
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> CaptureSettings {
        CaptureSettings {
            width: 64,
            height: 48,
            fps: 120,
            buffer_size: 1,
        }
    }

    #[test]
    fn parses_source_specs() {
        assert_eq!("auto".parse::<SourceSpec>(), Ok(SourceSpec::Auto));
        assert_eq!("libcamera".parse::<SourceSpec>(), Ok(SourceSpec::Libcamera));
        assert_eq!("usb".parse::<SourceSpec>(), Ok(SourceSpec::Usb { index: 0 }));
        assert_eq!("usb:2".parse::<SourceSpec>(), Ok(SourceSpec::Usb { index: 2 }));
        assert_eq!(
            "/dev/video1".parse::<SourceSpec>(),
            Ok(SourceSpec::Usb { index: 1 })
        );
        assert_eq!(
            "file:clips/road.mp4".parse::<SourceSpec>(),
            Ok(SourceSpec::File {
                path: PathBuf::from("clips/road.mp4")
            })
        );
        assert_eq!(
            "test-pattern".parse::<SourceSpec>(),
            Ok(SourceSpec::TestPattern)
        );
    }

    #[test]
    fn rejects_malformed_specs() {
        assert!("usb:-1".parse::<SourceSpec>().is_err());
        assert!("usb:front".parse::<SourceSpec>().is_err());
        assert!("file:".parse::<SourceSpec>().is_err());
        assert!("rtsp://camera".parse::<SourceSpec>().is_err());
    }

    #[test]
    fn display_round_trips_through_parse() {
        for spec in [
            SourceSpec::Auto,
            SourceSpec::Libcamera,
            SourceSpec::Usb { index: 3 },
            SourceSpec::TestPattern,
        ] {
            assert_eq!(spec.to_string().parse::<SourceSpec>(), Ok(spec));
        }
    }

    #[test]
    fn auto_prefers_libcamera_then_usb() {
        let chain = SourceChain::new(&SourceSpec::Auto, settings());
        assert_eq!(
            chain.candidates(),
            &[SourceSpec::Libcamera, SourceSpec::Usb { index: 0 }]
        );
    }

    #[cfg(not(feature = "with-opencv"))]
    #[test]
    fn chain_falls_back_to_next_backend() {
        let mut chain = SourceChain::from_candidates(
            vec![SourceSpec::Libcamera, SourceSpec::TestPattern],
            settings(),
        );
        let mut source = chain.open().expect("test pattern should open");
        assert_eq!(source.name(), "test-pattern");
        assert!(source.read_frame().expect("frame").is_well_formed());
    }

    #[cfg(not(feature = "with-opencv"))]
    #[test]
    fn chain_reports_every_failed_backend() {
        let mut chain = SourceChain::new(&SourceSpec::Auto, settings());
        let err = chain.open().err().expect("no backend should open");
        let message = err.to_string();
        assert!(message.contains("libcamera"), "{message}");
        assert!(message.contains("usb:0"), "{message}");
    }
}
