//! Pipeline supervisor tying together capture, inference, the health monitor
//! and the HTTP server.
//!
//! Startup walks the lifecycle states in order; every component that fails
//! to come up leaves the process serving in the Degraded state instead of
//! exiting. A camera that cannot be opened moves the pipeline to Degraded
//! right away. Only configuration and bind errors are fatal.

use std::{
    sync::Arc,
    thread::JoinHandle,
    time::Duration,
};

use actix_web::web::Bytes;
use anyhow::{Context, Result};
use crossbeam_channel::Sender;
use ml_core::load_detector;
use tracing::{error, info, warn};
use video_ingest::{SourceChain, SourceOpener};

use crate::vision::{
    ServerConfig,
    capture::{CaptureLoop, CapturePolicy, spawn_capture},
    data::{DetectionSlot, FrameSlot},
    encoding::render_placeholder,
    health::{Health, PipelineState},
    inference::{InferenceScheduler, spawn_inference},
    server::{ServerState, StreamSettings, spawn_server},
    telemetry,
    watchdog::{CaptureHeartbeat, spawn_health_monitor},
};

/// Background threads plus the shutdown broadcast they listen on.
struct Workers {
    frames: Arc<FrameSlot>,
    shutdown: Option<Sender<()>>,
    handles: Vec<(&'static str, JoinHandle<()>)>,
}

impl Workers {
    fn push(&mut self, name: &'static str, handle: JoinHandle<()>) {
        self.handles.push((name, handle));
    }

    /// Wake every loop, then join the threads in start order.
    fn stop(mut self) {
        self.frames.close();
        drop(self.shutdown.take());
        for (name, handle) in self.handles.drain(..) {
            if handle.join().is_err() {
                error!("{name} thread panicked");
            }
        }
    }
}

/// How long an MJPEG client waits for a new frame before re-checking camera
/// health. Matches the watchdog's staleness window so slow cameras are not
/// mistaken for dead ones.
fn stream_frame_timeout(fps: u32) -> Duration {
    Duration::from_millis(CaptureHeartbeat::threshold_for_fps(fps))
}

/// Run the camera server until SIGINT/SIGTERM.
pub fn run(config: ServerConfig) -> Result<()> {
    let (signal_tx, signal_rx) = crossbeam_channel::bounded::<()>(1);
    let handler_tx = signal_tx.clone();
    if let Err(err) = ctrlc::set_handler(move || {
        let _ = handler_tx.try_send(());
    }) {
        warn!("failed to install signal handler: {err}");
    }

    let metrics = match telemetry::init_metrics_recorder() {
        Ok(handle) => Some(handle.clone()),
        Err(err) => {
            warn!("metrics disabled: {err:#}");
            None
        }
    };

    let pipeline_span = tracing::info_span!(
        "camera.pipeline",
        source = %config.source,
        width = config.capture.width,
        height = config.capture.height,
        fps = config.capture.fps,
        backend = %config.detector.backend
    );
    let _pipeline_span_guard = pipeline_span.enter();

    let health = Arc::new(Health::new(config.ml_enabled()));
    let frames = Arc::new(FrameSlot::new());
    let detections = Arc::new(DetectionSlot::new(config.history_capacity));
    let heartbeat = Arc::new(CaptureHeartbeat::new(CaptureHeartbeat::threshold_for_fps(
        config.capture.fps,
    )));
    let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded::<()>(0);

    let mut opener = SourceChain::new(&config.source, config.capture);
    let source = match opener.open() {
        Ok(source) => {
            info!("camera source {} opened", source.name());
            health.set_camera_ok(true);
            health.transition(PipelineState::CameraReady);
            Some(source)
        }
        Err(err) => {
            warn!("no camera available, serving placeholder frames until one opens: {err}");
            health.transition(PipelineState::Degraded);
            None
        }
    };

    let scheduler = match load_detector(&config.detector) {
        Ok(Some(detector)) => {
            info!("detector {} loaded", detector.name());
            let scheduler = Arc::new(InferenceScheduler::new(
                detector,
                config.detector.confidence_threshold,
                health.clone(),
                detections.clone(),
            ));
            match scheduler.warm_up(config.capture.width, config.capture.height) {
                Ok(()) => {
                    health.advance(PipelineState::CameraReady, PipelineState::ModelReady);
                }
                Err(err) => warn!("model warm-up failed: {err}"),
            }
            Some(scheduler)
        }
        Ok(None) => {
            info!("object detection disabled, streaming the camera feed only");
            None
        }
        Err(err) => {
            warn!("failed to load detector, continuing without detections: {err}");
            None
        }
    };

    let mut workers = Workers {
        frames: frames.clone(),
        shutdown: Some(shutdown_tx),
        handles: Vec::new(),
    };

    let capture = CaptureLoop::new(
        Box::new(opener),
        source,
        frames.clone(),
        health.clone(),
        heartbeat.clone(),
        CapturePolicy {
            retry_delay: config.retry_delay,
            max_retries: config.max_retries,
            reopen_delay: config.reopen_delay,
        },
        shutdown_rx.clone(),
    );
    match spawn_capture(capture) {
        Ok(handle) => workers.push("camera-capture", handle),
        Err(err) => {
            workers.stop();
            return Err(err).context("failed to spawn capture thread");
        }
    }

    if let Some(scheduler) = scheduler.as_ref() {
        match spawn_inference(scheduler.clone(), frames.clone(), config.detection_interval) {
            Ok(handle) => workers.push("inference", handle),
            Err(err) => {
                workers.stop();
                return Err(err).context("failed to spawn inference thread");
            }
        }
    }

    let placeholder = match render_placeholder(
        config.capture.width.max(1) as u32,
        config.capture.height.max(1) as u32,
        config.jpeg_quality,
    ) {
        Ok(jpeg) => Bytes::from(jpeg),
        Err(err) => {
            workers.stop();
            return Err(err).context("failed to render placeholder frame");
        }
    };
    let state = ServerState {
        frames: frames.clone(),
        detections,
        health: health.clone(),
        stream: StreamSettings {
            jpeg_quality: config.jpeg_quality,
            frame_timeout: stream_frame_timeout(config.capture.fps),
        },
        config: config.summary(),
        placeholder,
        metrics,
    };
    let server = match spawn_server(config.bind_address.clone(), config.port, state) {
        Ok(server) => server,
        Err(err) => {
            workers.stop();
            return Err(err);
        }
    };

    let state = health.go_live();
    info!("camera server {state:?} on port {}", config.port);

    match spawn_health_monitor(health.clone(), heartbeat, shutdown_rx) {
        Ok(handle) => workers.push("health-monitor", handle),
        Err(err) => error!("failed to spawn health monitor: {err}"),
    }

    let _ = signal_rx.recv();
    drop(signal_tx);
    info!("shutdown requested");
    health.transition(PipelineState::ShuttingDown);

    frames.close();
    server.stop();
    workers.stop();
    drop(scheduler);
    info!(
        "camera and model released after {} frames, {} inferences",
        health.frame_count(),
        health.inference_count()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_timeout_tracks_camera_rate() {
        assert_eq!(stream_frame_timeout(30), Duration::from_millis(1_500));
        assert_eq!(stream_frame_timeout(1), Duration::from_millis(3_000));
    }
}
