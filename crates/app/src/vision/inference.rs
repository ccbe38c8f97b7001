//! Inference scheduler: runs the detector on the latest frame at the
//! configured cadence and publishes the result.

use std::{
    io,
    sync::{
        Arc, Mutex, PoisonError, TryLockError,
        atomic::{AtomicU64, Ordering},
    },
    thread::JoinHandle,
    time::{Duration, Instant},
};

use chrono::Utc;
use ml_core::{ModelError, ObjectDetector};
use tracing::{debug, info, warn};
use video_ingest::Frame;

use crate::vision::{
    data::{DetectionSet, DetectionSlot, DetectionSummary, FrameSlot},
    health::{Health, MODEL_FAILURE_LIMIT},
    telemetry,
};

const FRAME_WAIT: Duration = Duration::from_millis(500);

#[derive(Debug)]
pub(crate) enum TickOutcome {
    Completed(Arc<DetectionSet>),
    /// The detector returned an error; already logged and published as an
    /// empty set.
    Failed,
    /// A previous inference was still running.
    Skipped,
}

pub(crate) struct InferenceScheduler {
    detector: Mutex<Box<dyn ObjectDetector>>,
    threshold: f32,
    health: Arc<Health>,
    detections: Arc<DetectionSlot>,
    skipped: AtomicU64,
    passed_over: AtomicU64,
}

impl InferenceScheduler {
    pub(crate) fn new(
        detector: Box<dyn ObjectDetector>,
        threshold: f32,
        health: Arc<Health>,
        detections: Arc<DetectionSlot>,
    ) -> Self {
        Self {
            detector: Mutex::new(detector),
            threshold,
            health,
            detections,
            skipped: AtomicU64::new(0),
            passed_over: AtomicU64::new(0),
        }
    }

    /// Run the model once on `frame`. Detections below the confidence
    /// threshold are dropped. A frame whose buffer does not match its
    /// dimensions yields an empty set.
    pub(crate) fn step(&self, frame: &Frame) -> Result<DetectionSet, ModelError> {
        let mut detector = self.detector.lock().unwrap_or_else(PoisonError::into_inner);
        self.run(detector.as_mut(), frame)
    }

    fn run(&self, detector: &mut dyn ObjectDetector, frame: &Frame) -> Result<DetectionSet, ModelError> {
        if !frame.is_well_formed() {
            debug!("skipping inference on malformed frame #{}", frame.sequence);
            return Ok(DetectionSet::empty_for(frame));
        }
        let _span = tracing::info_span!(
            "inference.step",
            frame = frame.sequence,
            detector = detector.name()
        )
        .entered();
        let started = Instant::now();
        let raw = detector.detect(&frame.data, frame.width, frame.height)?;
        metrics::histogram!("inference_seconds").record(started.elapsed().as_secs_f64());

        let detections: Vec<DetectionSummary> = raw
            .into_iter()
            .filter(|detection| detection.score >= self.threshold)
            .map(DetectionSummary::from)
            .collect();
        Ok(DetectionSet {
            timestamp_ms: frame.timestamp_ms,
            sequence: frame.sequence,
            detections,
        })
    }

    /// Non-blocking variant of [`step`](Self::step) used by the scheduler
    /// loop: at most one inference runs at a time and overlapping ticks are
    /// skipped, never queued. The outcome is published to the detection slot.
    pub(crate) fn tick(&self, frame: &Frame) -> TickOutcome {
        let result = {
            let mut detector = match self.detector.try_lock() {
                Ok(guard) => guard,
                Err(TryLockError::WouldBlock) => {
                    let skipped = self.skipped.fetch_add(1, Ordering::Relaxed) + 1;
                    metrics::counter!("inference_ticks_total", "outcome" => "skipped").increment(1);
                    debug!("inference busy, skipped tick for frame #{} ({skipped} total)", frame.sequence);
                    return TickOutcome::Skipped;
                }
                Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            };
            self.run(detector.as_mut(), frame)
        };

        match result {
            Ok(set) => {
                self.health.record_inference_success();
                metrics::counter!("inference_ticks_total", "outcome" => "completed").increment(1);
                TickOutcome::Completed(self.detections.publish(set))
            }
            Err(err) => {
                let failures = self.health.record_inference_failure();
                metrics::counter!("inference_ticks_total", "outcome" => "failed").increment(1);
                metrics::counter!("inference_failures_total").increment(1);
                if failures == MODEL_FAILURE_LIMIT {
                    warn!("inference failed {failures} times in a row, marking model unhealthy: {err}");
                } else {
                    warn!("inference failed on frame #{}: {err}", frame.sequence);
                }
                self.detections.publish(DetectionSet::empty_for(frame));
                TickOutcome::Failed
            }
        }
    }

    /// Run once on a black frame so the first real frame does not pay for
    /// lazy initialisation. Sets `modelOk` from the outcome.
    pub(crate) fn warm_up(&self, width: i32, height: i32) -> Result<(), ModelError> {
        let frame = Frame::blank(width, height, Utc::now().timestamp_millis());
        let started = Instant::now();
        match self.step(&frame) {
            Ok(_) => {
                self.health.set_model_ok(true);
                info!("model warm-up finished in {:?}", started.elapsed());
                Ok(())
            }
            Err(err) => {
                self.health.set_model_ok(false);
                Err(err)
            }
        }
    }

    pub(crate) fn skipped_ticks(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }

    /// Frames published while the detector was busy and never seen by the
    /// scheduler loop.
    pub(crate) fn frames_passed_over(&self) -> u64 {
        self.passed_over.load(Ordering::Relaxed)
    }

    fn pass_over(&self, count: u64) {
        self.passed_over.fetch_add(count, Ordering::Relaxed);
        metrics::counter!("inference_frames_dropped_total").increment(count);
    }
}

/// Spawn the inference thread. It ticks once every `interval` published
/// frames and exits when the frame slot is closed.
pub(crate) fn spawn_inference(
    scheduler: Arc<InferenceScheduler>,
    frames: Arc<FrameSlot>,
    interval: u64,
) -> io::Result<JoinHandle<()>> {
    telemetry::spawn_thread("inference", move || {
        let interval = interval.max(1);
        let mut last_seen = 0;
        let mut last_tick: Option<u64> = None;
        while !frames.is_closed() {
            let Some(frame) = frames.wait_newer(last_seen, FRAME_WAIT) else {
                continue;
            };
            let missed = frame.sequence.saturating_sub(last_seen + 1);
            if last_seen > 0 && missed > 0 {
                scheduler.pass_over(missed);
            }
            last_seen = frame.sequence;
            if last_tick.is_some_and(|tick| frame.sequence - tick < interval) {
                continue;
            }
            last_tick = Some(frame.sequence);
            if let TickOutcome::Completed(set) = scheduler.tick(&frame) {
                debug!("frame #{}: {} detections", set.sequence, set.detections.len());
            }
        }
        info!(
            "inference stopped ({} frames passed over while busy, {} ticks skipped)",
            scheduler.frames_passed_over(),
            scheduler.skipped_ticks()
        );
    })
}
