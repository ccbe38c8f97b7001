//! Lifecycle state and health flags shared by every thread.

use std::{
    sync::{
        Mutex,
        atomic::{AtomicBool, AtomicU8, AtomicU32, AtomicU64, AtomicUsize, Ordering},
    },
    time::Instant,
};

use serde::Serialize;
use tracing::{info, warn};

use crate::vision::config::ConfigSummary;

/// Consecutive inference failures after which the model is reported unhealthy.
pub(crate) const MODEL_FAILURE_LIMIT: u32 = 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) enum PipelineState {
    Starting,
    CameraReady,
    ModelReady,
    Serving,
    Degraded,
    ShuttingDown,
}

impl PipelineState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => PipelineState::Starting,
            1 => PipelineState::CameraReady,
            2 => PipelineState::ModelReady,
            3 => PipelineState::Serving,
            4 => PipelineState::Degraded,
            _ => PipelineState::ShuttingDown,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            PipelineState::Starting => 0,
            PipelineState::CameraReady => 1,
            PipelineState::ModelReady => 2,
            PipelineState::Serving => 3,
            PipelineState::Degraded => 4,
            PipelineState::ShuttingDown => 5,
        }
    }

    fn is_live(self) -> bool {
        matches!(self, PipelineState::Serving | PipelineState::Degraded)
    }
}

pub(crate) struct Health {
    state: AtomicU8,
    camera_ok: AtomicBool,
    model_ok: AtomicBool,
    ml_enabled: bool,
    fps_bits: AtomicU32,
    frames: AtomicU64,
    inferences: AtomicU64,
    consecutive_failures: AtomicU32,
    stream_clients: AtomicUsize,
    source: Mutex<String>,
    started: Instant,
}

impl Health {
    pub(crate) fn new(ml_enabled: bool) -> Self {
        Self {
            state: AtomicU8::new(PipelineState::Starting.as_u8()),
            camera_ok: AtomicBool::new(false),
            model_ok: AtomicBool::new(false),
            ml_enabled,
            fps_bits: AtomicU32::new(0),
            frames: AtomicU64::new(0),
            inferences: AtomicU64::new(0),
            consecutive_failures: AtomicU32::new(0),
            stream_clients: AtomicUsize::new(0),
            source: Mutex::new(String::from("none")),
            started: Instant::now(),
        }
    }

    pub(crate) fn state(&self) -> PipelineState {
        PipelineState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Move to `next`. Returns false once shutting down; that state is final.
    pub(crate) fn transition(&self, next: PipelineState) -> bool {
        let result = self
            .state
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                (current != PipelineState::ShuttingDown.as_u8()).then_some(next.as_u8())
            });
        match result {
            Ok(prev) if prev != next.as_u8() => {
                info!(
                    "pipeline state {:?} -> {:?}",
                    PipelineState::from_u8(prev),
                    next
                );
                true
            }
            Ok(_) => true,
            Err(_) => false,
        }
    }

    /// Move from `from` to `to`, or do nothing if the pipeline is elsewhere.
    pub(crate) fn advance(&self, from: PipelineState, to: PipelineState) -> bool {
        let moved = self
            .state
            .compare_exchange(from.as_u8(), to.as_u8(), Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        if moved {
            info!("pipeline state {from:?} -> {to:?}");
        }
        moved
    }

    /// True when the camera delivers frames and the model works (or ML is off).
    pub(crate) fn is_healthy(&self) -> bool {
        self.camera_ok() && (self.model_ok() || !self.ml_enabled)
    }

    /// Enter Serving or Degraded from any startup state.
    pub(crate) fn go_live(&self) -> PipelineState {
        let next = self.live_state();
        self.transition(next);
        self.state()
    }

    /// Re-derive Serving/Degraded. Startup and shutdown states are left alone.
    pub(crate) fn evaluate(&self) -> PipelineState {
        let current = self.state();
        if current.is_live() {
            let next = self.live_state();
            if next != current {
                if next == PipelineState::Degraded {
                    warn!(
                        camera_ok = self.camera_ok(),
                        model_ok = self.model_ok(),
                        "pipeline degraded"
                    );
                }
                self.transition(next);
            }
        }
        self.state()
    }

    fn live_state(&self) -> PipelineState {
        if self.is_healthy() {
            PipelineState::Serving
        } else {
            PipelineState::Degraded
        }
    }

    pub(crate) fn camera_ok(&self) -> bool {
        self.camera_ok.load(Ordering::SeqCst)
    }

    /// Returns the previous value.
    pub(crate) fn set_camera_ok(&self, ok: bool) -> bool {
        self.camera_ok.swap(ok, Ordering::SeqCst)
    }

    pub(crate) fn model_ok(&self) -> bool {
        self.model_ok.load(Ordering::SeqCst)
    }

    pub(crate) fn set_model_ok(&self, ok: bool) {
        self.model_ok.store(ok, Ordering::SeqCst);
    }

    pub(crate) fn fps(&self) -> f32 {
        f32::from_bits(self.fps_bits.load(Ordering::Relaxed))
    }

    pub(crate) fn record_frame(&self, fps: f32) {
        self.frames.fetch_add(1, Ordering::Relaxed);
        self.fps_bits.store(fps.to_bits(), Ordering::Relaxed);
        self.camera_ok.store(true, Ordering::SeqCst);
    }

    pub(crate) fn frame_count(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }

    pub(crate) fn record_inference_success(&self) {
        self.inferences.fetch_add(1, Ordering::Relaxed);
        self.consecutive_failures.store(0, Ordering::SeqCst);
        self.model_ok.store(true, Ordering::SeqCst);
    }

    /// Count a failed inference; returns the consecutive failure count.
    pub(crate) fn record_inference_failure(&self) -> u32 {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        if failures >= MODEL_FAILURE_LIMIT {
            self.model_ok.store(false, Ordering::SeqCst);
        }
        failures
    }

    #[cfg(test)]
    pub(crate) fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::SeqCst)
    }

    pub(crate) fn inference_count(&self) -> u64 {
        self.inferences.load(Ordering::Relaxed)
    }

    pub(crate) fn stream_opened(&self) -> usize {
        self.stream_clients.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn stream_closed(&self) -> usize {
        self.stream_clients.fetch_sub(1, Ordering::SeqCst).saturating_sub(1)
    }

    pub(crate) fn stream_clients(&self) -> usize {
        self.stream_clients.load(Ordering::SeqCst)
    }

    pub(crate) fn set_source(&self, name: &str) {
        if let Ok(mut guard) = self.source.lock() {
            guard.clear();
            guard.push_str(name);
        }
    }

    pub(crate) fn source(&self) -> String {
        match self.source.lock() {
            Ok(guard) => guard.clone(),
            Err(_) => String::new(),
        }
    }

    pub(crate) fn uptime_seconds(&self) -> u64 {
        self.started.elapsed().as_secs()
    }

    pub(crate) fn snapshot(&self, config: &ConfigSummary) -> StatusSnapshot {
        StatusSnapshot {
            ok: true,
            camera_ok: self.camera_ok(),
            model_ok: self.model_ok(),
            ml_enabled: self.ml_enabled,
            fps: (self.fps() * 10.0).round() / 10.0,
            uptime_seconds: self.uptime_seconds(),
            state: self.state(),
            frame_count: self.frame_count(),
            detection_count: self.inference_count(),
            stream_clients: self.stream_clients(),
            source: self.source(),
            config: config.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct StatusSnapshot {
    pub(crate) ok: bool,
    pub(crate) camera_ok: bool,
    pub(crate) model_ok: bool,
    pub(crate) ml_enabled: bool,
    pub(crate) fps: f32,
    pub(crate) uptime_seconds: u64,
    pub(crate) state: PipelineState,
    pub(crate) frame_count: u64,
    pub(crate) detection_count: u64,
    pub(crate) stream_clients: usize,
    pub(crate) source: String,
    pub(crate) config: ConfigSummary,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn startup_walks_to_serving_when_healthy() {
        let health = Health::new(true);
        assert_eq!(health.state(), PipelineState::Starting);
        health.record_frame(30.0);
        assert!(health.transition(PipelineState::CameraReady));
        health.record_inference_success();
        assert!(health.advance(PipelineState::CameraReady, PipelineState::ModelReady));
        assert_eq!(health.go_live(), PipelineState::Serving);
    }

    #[test]
    fn missing_camera_at_startup_stays_degraded() {
        let health = Health::new(true);
        assert!(health.transition(PipelineState::Degraded));
        health.record_inference_success();
        assert!(!health.advance(PipelineState::CameraReady, PipelineState::ModelReady));
        assert_eq!(health.state(), PipelineState::Degraded);
        assert_eq!(health.go_live(), PipelineState::Degraded);

        health.record_frame(30.0);
        assert_eq!(health.evaluate(), PipelineState::Serving);
    }

    #[test]
    fn serving_and_degraded_follow_health() {
        let health = Health::new(true);
        health.record_frame(30.0);
        health.set_model_ok(true);
        health.go_live();

        health.set_camera_ok(false);
        assert_eq!(health.evaluate(), PipelineState::Degraded);
        health.record_frame(29.0);
        assert_eq!(health.evaluate(), PipelineState::Serving);
    }

    #[test]
    fn evaluate_does_not_skip_startup() {
        let health = Health::new(false);
        health.record_frame(10.0);
        assert_eq!(health.evaluate(), PipelineState::Starting);
    }

    #[test]
    fn disabled_ml_ignores_model_flag() {
        let health = Health::new(false);
        health.record_frame(30.0);
        assert!(!health.model_ok());
        assert_eq!(health.go_live(), PipelineState::Serving);
    }

    #[test]
    fn shutting_down_is_final() {
        let health = Health::new(true);
        assert!(health.transition(PipelineState::ShuttingDown));
        assert!(!health.transition(PipelineState::Serving));
        assert_eq!(health.go_live(), PipelineState::ShuttingDown);
        assert_eq!(health.evaluate(), PipelineState::ShuttingDown);
    }

    #[test]
    fn three_consecutive_failures_clear_model_ok() {
        let health = Health::new(true);
        health.record_inference_success();
        assert_eq!(health.record_inference_failure(), 1);
        assert_eq!(health.record_inference_failure(), 2);
        assert!(health.model_ok());
        assert_eq!(health.record_inference_failure(), 3);
        assert!(!health.model_ok());
        health.record_inference_success();
        assert!(health.model_ok());
        assert_eq!(health.consecutive_failures(), 0);
    }

    #[test]
    fn stream_client_count_tracks_open_and_close() {
        let health = Health::new(true);
        assert_eq!(health.stream_opened(), 1);
        assert_eq!(health.stream_opened(), 2);
        assert_eq!(health.stream_closed(), 1);
        assert_eq!(health.stream_clients(), 1);
    }

    #[test]
    fn snapshot_uses_camel_case_keys() {
        let health = Health::new(true);
        health.set_source("test-pattern");
        health.record_frame(12.34);
        let summary = ConfigSummary {
            resolution: "640x480".to_string(),
            target_fps: 30,
            confidence: 0.5,
            detection_interval: 1,
            jpeg_quality: 80,
            backend: "demo".to_string(),
        };
        let json = serde_json::to_value(health.snapshot(&summary)).unwrap();
        assert_eq!(json["cameraOk"], true);
        assert_eq!(json["modelOk"], false);
        assert_eq!(json["state"], "starting");
        assert_eq!(json["frameCount"], 1);
        assert_eq!(json["source"], "test-pattern");
        assert_eq!(json["config"]["targetFps"], 30);
        assert!(json["uptimeSeconds"].is_u64());
    }
}
