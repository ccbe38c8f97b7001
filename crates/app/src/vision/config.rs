//! Layered configuration: built-in defaults, then the JSON config file, then
//! environment variables and CLI flags. Everything is range-checked once here;
//! downstream stages never re-validate.

use std::{
    fmt::Display,
    fs, io,
    ops::RangeInclusive,
    path::{Path, PathBuf},
    time::Duration,
};

use ml_core::{DetectorBackend, DetectorOptions};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};
use video_ingest::{CaptureSettings, SourceSpec};

use crate::cli::CliArgs;

pub const DEFAULT_CONFIG_PATH: &str = "shared/config.json";

const DEFAULT_PORT: i64 = 5001;
const DEFAULT_BIND: &str = "0.0.0.0";
/// Without OpenCV there is no real camera to probe.
const DEFAULT_SOURCE: &str = if cfg!(feature = "with-opencv") {
    "auto"
} else {
    "test-pattern"
};
const DEFAULT_WIDTH: i64 = 640;
const DEFAULT_HEIGHT: i64 = 480;
const DEFAULT_FPS: i64 = 30;
const DEFAULT_BUFFER_SIZE: i64 = 1;
const DEFAULT_RETRY_DELAY_MS: i64 = 100;
const DEFAULT_MAX_RETRIES: i64 = 5;
const DEFAULT_REOPEN_DELAY_MS: i64 = 2_000;
const DEFAULT_MODEL_PATH: &str = "model/best.torchscript";
const DEFAULT_INPUT_SIZE: i64 = 640;
const DEFAULT_CONFIDENCE: f64 = 0.5;
const DEFAULT_IOU: f64 = 0.45;
const DEFAULT_DETECTION_INTERVAL: i64 = 1;
const DEFAULT_JPEG_QUALITY: i64 = 80;
const DEFAULT_HISTORY_CAPACITY: i64 = 10;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path:?}: {source}")]
    Read { path: PathBuf, source: io::Error },
    #[error("failed to parse config file {path:?}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("{field} must be {expected}, got {value}")]
    OutOfRange {
        field: &'static str,
        expected: String,
        value: String,
    },
    #[error("invalid camera source {value:?}: {reason}")]
    Source { value: String, reason: String },
    #[error("invalid detector backend: {0}")]
    Backend(String),
}

/// Canonical configuration shared by every stage of the server.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    pub source: SourceSpec,
    pub capture: CaptureSettings,
    /// Delay between read retries on the same device.
    pub retry_delay: Duration,
    /// Consecutive read failures tolerated before the device is reopened.
    pub max_retries: u32,
    pub reopen_delay: Duration,
    pub detector: DetectorOptions,
    /// Run inference once every N published frames.
    pub detection_interval: u64,
    pub jpeg_quality: u8,
    pub history_capacity: usize,
}

#[derive(Clone, Debug, Default)]
/// Optional telemetry knobs for tracing and runtime inspection.
pub struct TelemetryOptions {
    /// Default the log filter to `debug` instead of `info`.
    pub verbose: bool,
    /// Write a Chrome trace JSON file capturing pipeline spans.
    pub chrome_trace_path: Option<PathBuf>,
}

/// Config summary reported by `/api/status`.
#[derive(Clone, Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConfigSummary {
    pub resolution: String,
    pub target_fps: u32,
    pub confidence: f32,
    pub detection_interval: u64,
    pub jpeg_quality: u8,
    pub backend: String,
}

/// On-disk schema, mirroring `shared/config.json`. Unknown keys (ports of the
/// proxy and dashboard, display options) are ignored.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct FileConfig {
    python_server_port: Option<i64>,
    bind_address: Option<String>,
    camera: CameraSection,
    detection: DetectionSection,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct CameraSection {
    source: Option<String>,
    width: Option<i64>,
    height: Option<i64>,
    fps: Option<i64>,
    buffer_size: Option<i64>,
    retry_delay_ms: Option<i64>,
    max_retries: Option<i64>,
    reopen_delay_ms: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct DetectionSection {
    backend: Option<String>,
    model_path: Option<PathBuf>,
    labels_path: Option<PathBuf>,
    input_size: Option<i64>,
    confidence_threshold: Option<f64>,
    iou_threshold: Option<f64>,
    detection_interval: Option<i64>,
    jpeg_quality: Option<i64>,
    history_capacity: Option<i64>,
}

impl ServerConfig {
    /// Resolve the effective configuration for this process.
    ///
    /// An explicit `--config` must exist and parse. The default path is
    /// optional: when it is missing the built-in defaults are used.
    pub fn load(args: &CliArgs) -> Result<Self, ConfigError> {
        let (file, root) = match &args.config {
            Some(path) => (read_file(path)?, project_root(path)),
            None => {
                let path = Path::new(DEFAULT_CONFIG_PATH);
                if path.exists() {
                    (read_file(path)?, project_root(path))
                } else {
                    warn!("config file {DEFAULT_CONFIG_PATH} not found, using defaults");
                    (FileConfig::default(), PathBuf::new())
                }
            }
        };
        Self::resolve(file, &root, args)
    }

    fn resolve(file: FileConfig, root: &Path, args: &CliArgs) -> Result<Self, ConfigError> {
        let FileConfig {
            python_server_port,
            bind_address,
            camera,
            detection,
        } = file;

        let port = in_range(
            "port",
            args.port.or(python_server_port).unwrap_or(DEFAULT_PORT),
            1..=65_535,
        )?;
        let bind_address = args
            .bind
            .clone()
            .or(bind_address)
            .unwrap_or_else(|| DEFAULT_BIND.to_string());

        let source_text = args
            .source
            .clone()
            .or(camera.source)
            .unwrap_or_else(|| DEFAULT_SOURCE.to_string());
        let source = source_text
            .parse::<SourceSpec>()
            .map_err(|reason| ConfigError::Source {
                value: source_text.clone(),
                reason,
            })?;

        let width = in_range(
            "camera.width",
            args.width.or(camera.width).unwrap_or(DEFAULT_WIDTH),
            16..=7_680,
        )?;
        let height = in_range(
            "camera.height",
            args.height.or(camera.height).unwrap_or(DEFAULT_HEIGHT),
            16..=4_320,
        )?;
        let fps = in_range(
            "camera.fps",
            args.fps.or(camera.fps).unwrap_or(DEFAULT_FPS),
            1..=240,
        )?;
        let buffer_size = in_range(
            "camera.bufferSize",
            camera.buffer_size.unwrap_or(DEFAULT_BUFFER_SIZE),
            1..=64,
        )?;
        let retry_delay_ms = in_range(
            "camera.retryDelayMs",
            camera.retry_delay_ms.unwrap_or(DEFAULT_RETRY_DELAY_MS),
            1..=60_000,
        )?;
        let max_retries = in_range(
            "camera.maxRetries",
            camera.max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
            0..=1_000,
        )?;
        let reopen_delay_ms = in_range(
            "camera.reopenDelayMs",
            camera.reopen_delay_ms.unwrap_or(DEFAULT_REOPEN_DELAY_MS),
            1..=600_000,
        )?;

        let backend = if args.no_ml {
            DetectorBackend::Disabled
        } else {
            match args.backend.clone().or(detection.backend) {
                Some(name) => name.parse().map_err(ConfigError::Backend)?,
                None if cfg!(feature = "with-tch") => DetectorBackend::Torch,
                None => DetectorBackend::Demo,
            }
        };

        let model_path = match (&args.model, detection.model_path) {
            (Some(path), _) => path.clone(),
            (None, Some(path)) => relative_to(root, path),
            (None, None) => PathBuf::from(DEFAULT_MODEL_PATH),
        };
        let labels_path = match (&args.labels, detection.labels_path) {
            (Some(path), _) => Some(path.clone()),
            (None, Some(path)) => Some(relative_to(root, path)),
            (None, None) => None,
        };

        let input_size = in_range(
            "detection.inputSize",
            detection.input_size.unwrap_or(DEFAULT_INPUT_SIZE),
            32..=4_096,
        )?;
        if input_size % 32 != 0 {
            return Err(ConfigError::OutOfRange {
                field: "detection.inputSize",
                expected: "a multiple of 32".to_string(),
                value: input_size.to_string(),
            });
        }
        let confidence = unit_interval(
            "detection.confidenceThreshold",
            args.confidence
                .or(detection.confidence_threshold)
                .unwrap_or(DEFAULT_CONFIDENCE),
        )?;
        let iou = unit_interval(
            "detection.iouThreshold",
            detection.iou_threshold.unwrap_or(DEFAULT_IOU),
        )?;
        let detection_interval = in_range(
            "detection.detectionInterval",
            args.detection_interval
                .or(detection.detection_interval)
                .unwrap_or(DEFAULT_DETECTION_INTERVAL),
            1..=1_000,
        )?;
        let jpeg_quality = in_range(
            "detection.jpegQuality",
            args.jpeg_quality
                .or(detection.jpeg_quality)
                .unwrap_or(DEFAULT_JPEG_QUALITY),
            1..=100,
        )?;
        let history_capacity = in_range(
            "detection.historyCapacity",
            detection.history_capacity.unwrap_or(DEFAULT_HISTORY_CAPACITY),
            1..=1_000,
        )?;

        Ok(Self {
            bind_address,
            port: port as u16,
            source,
            capture: CaptureSettings {
                width: width as i32,
                height: height as i32,
                fps: fps as u32,
                buffer_size: buffer_size as i32,
            },
            retry_delay: Duration::from_millis(retry_delay_ms as u64),
            max_retries: max_retries as u32,
            reopen_delay: Duration::from_millis(reopen_delay_ms as u64),
            detector: DetectorOptions {
                backend,
                model_path,
                labels_path,
                input_size: (input_size, input_size),
                confidence_threshold: confidence,
                iou_threshold: iou,
            },
            detection_interval: detection_interval as u64,
            jpeg_quality: jpeg_quality as u8,
            history_capacity: history_capacity as usize,
        })
    }

    pub fn ml_enabled(&self) -> bool {
        self.detector.backend != DetectorBackend::Disabled
    }

    pub fn summary(&self) -> ConfigSummary {
        ConfigSummary {
            resolution: format!("{}x{}", self.capture.width, self.capture.height),
            target_fps: self.capture.fps,
            confidence: self.detector.confidence_threshold,
            detection_interval: self.detection_interval,
            jpeg_quality: self.jpeg_quality,
            backend: self.detector.backend.to_string(),
        }
    }
}

fn read_file(path: &Path) -> Result<FileConfig, ConfigError> {
    let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let file = serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    info!("configuration loaded from {}", path.display());
    Ok(file)
}

/// Paths in the config file are relative to the project root, the directory
/// above the one holding the file (`<root>/shared/config.json`).
fn project_root(config_path: &Path) -> PathBuf {
    config_path
        .parent()
        .and_then(Path::parent)
        .map(Path::to_path_buf)
        .unwrap_or_default()
}

fn relative_to(root: &Path, path: PathBuf) -> PathBuf {
    if path.is_absolute() {
        path
    } else {
        root.join(path)
    }
}

fn in_range(
    field: &'static str,
    value: i64,
    range: RangeInclusive<i64>,
) -> Result<i64, ConfigError> {
    if range.contains(&value) {
        Ok(value)
    } else {
        Err(out_of_range(field, &range, value))
    }
}

fn unit_interval(field: &'static str, value: f64) -> Result<f32, ConfigError> {
    if value.is_finite() && (0.0..=1.0).contains(&value) {
        Ok(value as f32)
    } else {
        Err(out_of_range(field, &(0.0..=1.0), value))
    }
}

fn out_of_range<T: Display>(
    field: &'static str,
    range: &RangeInclusive<T>,
    value: impl Display,
) -> ConfigError {
    ConfigError::OutOfRange {
        field,
        expected: format!("between {} and {}", range.start(), range.end()),
        value: value.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn write_config(dir: &Path, json: &str) -> PathBuf {
        let shared = dir.join("shared");
        fs::create_dir_all(&shared).unwrap();
        let path = shared.join("config.json");
        let mut file = fs::File::create(&path).unwrap();
        file.write_all(json.as_bytes()).unwrap();
        path
    }

    fn args_with(path: PathBuf) -> CliArgs {
        CliArgs {
            config: Some(path),
            ..CliArgs::default()
        }
    }

    #[test]
    fn defaults_match_shared_config() {
        let config = ServerConfig::resolve(FileConfig::default(), Path::new(""), &CliArgs::default())
            .unwrap();
        assert_eq!(config.port, 5001);
        assert_eq!((config.capture.width, config.capture.height), (640, 480));
        assert_eq!(config.capture.fps, 30);
        assert_eq!(config.capture.buffer_size, 1);
        assert_eq!(config.detector.confidence_threshold, 0.5);
        assert_eq!(config.detection_interval, 1);
        assert_eq!(config.jpeg_quality, 80);
        assert_eq!(config.history_capacity, 10);
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.retry_delay, Duration::from_millis(100));
    }

    #[test]
    fn default_source_matches_build_features() {
        let config = ServerConfig::resolve(FileConfig::default(), Path::new(""), &CliArgs::default())
            .unwrap();
        if cfg!(feature = "with-opencv") {
            assert_eq!(config.source, SourceSpec::Auto);
        } else {
            assert_eq!(config.source, SourceSpec::TestPattern);
        }
    }

    #[test]
    fn file_values_apply_and_cli_overrides_them() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            dir.path(),
            r#"{
                "backendPort": 5000,
                "pythonServerPort": 6001,
                "camera": {"width": 1280, "height": 720, "fps": 15, "bufferSize": 2},
                "detection": {
                    "modelPath": "backend/model/best.torchscript",
                    "confidenceThreshold": 0.6,
                    "detectionInterval": 3,
                    "jpegQuality": 70
                },
                "display": {"theme": "dark"}
            }"#,
        );
        let mut args = args_with(path);
        args.jpeg_quality = Some(90);
        args.source = Some("test-pattern".to_string());

        let config = ServerConfig::load(&args).unwrap();
        assert_eq!(config.port, 6001);
        assert_eq!((config.capture.width, config.capture.height), (1280, 720));
        assert_eq!(config.capture.fps, 15);
        assert_eq!(config.capture.buffer_size, 2);
        assert_eq!(config.detector.confidence_threshold, 0.6);
        assert_eq!(config.detection_interval, 3);
        assert_eq!(config.jpeg_quality, 90);
        assert_eq!(config.source, SourceSpec::TestPattern);
        assert_eq!(
            config.detector.model_path,
            dir.path().join("backend/model/best.torchscript")
        );
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let err = ServerConfig::load(&args_with(PathBuf::from("/nonexistent/config.json")))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(dir.path(), "{ \"camera\": ");
        let err = ServerConfig::load(&args_with(path)).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn rejects_out_of_range_values() {
        let cases: Vec<(CliArgs, &str)> = vec![
            (
                CliArgs {
                    jpeg_quality: Some(0),
                    ..CliArgs::default()
                },
                "detection.jpegQuality",
            ),
            (
                CliArgs {
                    confidence: Some(1.5),
                    ..CliArgs::default()
                },
                "detection.confidenceThreshold",
            ),
            (
                CliArgs {
                    detection_interval: Some(0),
                    ..CliArgs::default()
                },
                "detection.detectionInterval",
            ),
            (
                CliArgs {
                    width: Some(-640),
                    ..CliArgs::default()
                },
                "camera.width",
            ),
            (
                CliArgs {
                    port: Some(70_000),
                    ..CliArgs::default()
                },
                "port",
            ),
        ];
        for (args, expected_field) in cases {
            let err = ServerConfig::resolve(FileConfig::default(), Path::new(""), &args)
                .unwrap_err();
            match err {
                ConfigError::OutOfRange { field, .. } => assert_eq!(field, expected_field),
                other => panic!("unexpected error for {expected_field}: {other}"),
            }
        }
    }

    #[test]
    fn error_message_names_field_and_value() {
        let args = CliArgs {
            fps: Some(500),
            ..CliArgs::default()
        };
        let err = ServerConfig::resolve(FileConfig::default(), Path::new(""), &args).unwrap_err();
        assert_eq!(err.to_string(), "camera.fps must be between 1 and 240, got 500");
    }

    #[test]
    fn no_ml_flag_disables_detection() {
        let args = CliArgs {
            no_ml: true,
            backend: Some("torch".to_string()),
            ..CliArgs::default()
        };
        let config = ServerConfig::resolve(FileConfig::default(), Path::new(""), &args).unwrap();
        assert_eq!(config.detector.backend, DetectorBackend::Disabled);
        assert!(!config.ml_enabled());
    }

    #[test]
    fn rejects_unknown_source_and_backend() {
        let args = CliArgs {
            source: Some("rtsp://cam".to_string()),
            ..CliArgs::default()
        };
        assert!(matches!(
            ServerConfig::resolve(FileConfig::default(), Path::new(""), &args),
            Err(ConfigError::Source { .. })
        ));
        let args = CliArgs {
            backend: Some("onnx".to_string()),
            ..CliArgs::default()
        };
        assert!(matches!(
            ServerConfig::resolve(FileConfig::default(), Path::new(""), &args),
            Err(ConfigError::Backend(_))
        ));
    }

    #[test]
    fn summary_reports_effective_values() {
        let config = ServerConfig::resolve(FileConfig::default(), Path::new(""), &CliArgs::default())
            .unwrap();
        let summary = config.summary();
        assert_eq!(summary.resolution, "640x480");
        assert_eq!(summary.target_fps, 30);
        assert_eq!(summary.jpeg_quality, 80);
    }
}
