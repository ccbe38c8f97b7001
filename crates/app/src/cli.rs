use std::path::PathBuf;

use clap::Parser;

use crate::vision::TelemetryOptions;

/// Camera capture, object detection and MJPEG/JSON streaming server.
///
/// Values given here override `shared/config.json`; unset flags fall back to
/// the listed environment variables, then to the file, then to defaults.
#[derive(Debug, Default, Parser)]
#[command(name = "camera-server", version, about)]
pub struct CliArgs {
    /// JSON config file (camelCase keys). Defaults to `shared/config.json` when present.
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,
    /// Camera source: auto, libcamera, usb[:N], /dev/videoN, file:PATH or test-pattern.
    #[arg(long, value_name = "SOURCE", env = "CAMERA_SOURCE")]
    pub source: Option<String>,
    /// Detection model (TorchScript export).
    #[arg(long, value_name = "PATH", env = "MODEL_PATH")]
    pub model: Option<PathBuf>,
    /// Detector backend: torch, demo or none.
    #[arg(long, value_name = "BACKEND")]
    pub backend: Option<String>,
    /// Disable object detection and stream the raw camera feed.
    #[arg(long = "no-ml", action = clap::ArgAction::SetTrue)]
    pub no_ml: bool,
    /// Class names, one per line.
    #[arg(long, value_name = "PATH")]
    pub labels: Option<PathBuf>,
    /// Capture width in pixels.
    #[arg(long, value_name = "PX", env = "CAMERA_WIDTH")]
    pub width: Option<i64>,
    /// Capture height in pixels.
    #[arg(long, value_name = "PX", env = "CAMERA_HEIGHT")]
    pub height: Option<i64>,
    /// Target capture frame rate.
    #[arg(long, value_name = "N", env = "CAMERA_FPS")]
    pub fps: Option<i64>,
    /// Minimum detection confidence (0.0-1.0).
    #[arg(long, value_name = "F", env = "CONFIDENCE_THRESHOLD")]
    pub confidence: Option<f64>,
    /// Run detection on every Nth frame.
    #[arg(long = "detection-interval", value_name = "N", env = "DETECTION_INTERVAL")]
    pub detection_interval: Option<i64>,
    /// JPEG quality for the MJPEG stream (1-100).
    #[arg(long = "jpeg-quality", value_name = "Q", env = "JPEG_QUALITY")]
    pub jpeg_quality: Option<i64>,
    /// HTTP port.
    #[arg(long, value_name = "N", env = "PORT")]
    pub port: Option<i64>,
    /// HTTP bind address.
    #[arg(long, value_name = "ADDR", env = "BIND_ADDRESS")]
    pub bind: Option<String>,
    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(long, action = clap::ArgAction::SetTrue)]
    pub verbose: bool,
    /// Write a Chrome trace JSON file capturing pipeline spans.
    #[arg(long = "chrome-trace", value_name = "PATH")]
    pub chrome_trace: Option<PathBuf>,
}

impl CliArgs {
    pub fn telemetry_options(&self) -> TelemetryOptions {
        TelemetryOptions {
            verbose: self.verbose,
            chrome_trace_path: self.chrome_trace.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_flags() {
        let args = CliArgs::try_parse_from([
            "camera-server",
            "--source",
            "usb:1",
            "--no-ml",
            "--width",
            "1280",
            "--confidence",
            "0.7",
            "--detection-interval",
            "3",
            "--verbose",
        ])
        .unwrap();
        assert_eq!(args.source.as_deref(), Some("usb:1"));
        assert!(args.no_ml);
        assert_eq!(args.width, Some(1280));
        assert_eq!(args.confidence, Some(0.7));
        assert_eq!(args.detection_interval, Some(3));
        assert!(args.telemetry_options().verbose);
    }

    #[test]
    fn rejects_non_numeric_width() {
        assert!(CliArgs::try_parse_from(["camera-server", "--width", "wide"]).is_err());
    }
}
