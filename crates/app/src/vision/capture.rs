//! Capture thread: reads the camera, publishes frames into the shared slot
//! and owns the retry/reopen policy for a flaky device.

use std::{
    io,
    sync::Arc,
    thread::JoinHandle,
    time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, RecvTimeoutError};
use tracing::{debug, error, info, warn};
use video_ingest::{CaptureError, Frame, FrameSource, SourceOpener};

use crate::vision::{
    data::FrameSlot, health::Health, telemetry, watchdog::CaptureHeartbeat,
};

/// Exponential moving average of the capture rate.
#[derive(Default)]
pub(crate) struct FpsMeter {
    smoothed: f32,
    last: Option<Instant>,
}

impl FpsMeter {
    pub(crate) fn tick(&mut self, now: Instant) -> f32 {
        if let Some(last) = self.last.replace(now) {
            let elapsed = now.duration_since(last).as_secs_f32();
            if elapsed > 0.0 {
                let instant = 1.0 / elapsed;
                self.smoothed = if self.smoothed == 0.0 {
                    instant
                } else {
                    0.9 * self.smoothed + 0.1 * instant
                };
            }
        }
        self.smoothed
    }
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct CapturePolicy {
    pub(crate) retry_delay: Duration,
    pub(crate) max_retries: u32,
    pub(crate) reopen_delay: Duration,
}

/// Result of a single read attempt.
pub(crate) enum Attempt {
    Published(Arc<Frame>),
    /// Read failed within the retry budget; try the same device again.
    Retry,
    /// Retry budget exhausted; the device was released.
    Reopen,
    /// No backend could be opened.
    OpenFailed,
}

pub(crate) struct CaptureLoop {
    opener: Box<dyn SourceOpener>,
    source: Option<Box<dyn FrameSource>>,
    slot: Arc<FrameSlot>,
    health: Arc<Health>,
    heartbeat: Arc<CaptureHeartbeat>,
    policy: CapturePolicy,
    shutdown: Receiver<()>,
    fps: FpsMeter,
    consecutive_failures: u32,
}

impl CaptureLoop {
    pub(crate) fn new(
        opener: Box<dyn SourceOpener>,
        source: Option<Box<dyn FrameSource>>,
        slot: Arc<FrameSlot>,
        health: Arc<Health>,
        heartbeat: Arc<CaptureHeartbeat>,
        policy: CapturePolicy,
        shutdown: Receiver<()>,
    ) -> Self {
        if let Some(source) = source.as_ref() {
            health.set_source(source.name());
        }
        Self {
            opener,
            source,
            slot,
            health,
            heartbeat,
            policy,
            shutdown,
            fps: FpsMeter::default(),
            consecutive_failures: 0,
        }
    }

    /// Block until a frame is published. `None` means shutdown was requested.
    pub(crate) fn acquire(&mut self) -> Option<Arc<Frame>> {
        loop {
            let delay = match self.attempt() {
                Attempt::Published(frame) => return Some(frame),
                Attempt::Retry => self.policy.retry_delay,
                Attempt::Reopen | Attempt::OpenFailed => self.policy.reopen_delay,
            };
            if !self.pause(delay) {
                return None;
            }
        }
    }

    /// One step of the capture state machine, without sleeping.
    pub(crate) fn attempt(&mut self) -> Attempt {
        if self.source.is_none() {
            match self.opener.open() {
                Ok(source) => {
                    info!("camera opened: {}", source.name());
                    self.health.set_source(source.name());
                    self.source = Some(source);
                }
                Err(err) => {
                    self.health.set_camera_ok(false);
                    warn!(
                        "camera unavailable, retrying in {:?}: {err}",
                        self.policy.reopen_delay
                    );
                    return Attempt::OpenFailed;
                }
            }
        }
        let Some(source) = self.source.as_mut() else {
            return Attempt::OpenFailed;
        };

        let read = {
            let _span = tracing::info_span!("capture.read", source = source.name()).entered();
            source.read_frame()
        };
        let err = match read {
            Ok(frame) if frame.is_well_formed() => return Attempt::Published(self.publish(frame)),
            Ok(frame) => CaptureError::Read {
                device: source.name().to_string(),
                reason: format!(
                    "malformed frame ({} bytes for {}x{})",
                    frame.data.len(),
                    frame.width,
                    frame.height
                ),
            },
            Err(err) => err,
        };
        self.on_read_error(err)
    }

    fn publish(&mut self, frame: Frame) -> Arc<Frame> {
        if self.consecutive_failures > 0 {
            info!(
                "camera recovered after {} failed reads",
                self.consecutive_failures
            );
            self.consecutive_failures = 0;
        }
        let fps = self.fps.tick(Instant::now());
        let frame = self.slot.publish(frame);
        self.health.record_frame(fps);
        self.heartbeat.beat();
        metrics::counter!("camera_frames_total").increment(1);
        metrics::gauge!("camera_capture_fps").set(fps as f64);
        if frame.sequence % 300 == 0 {
            debug!("capture heartbeat: frame #{}, {fps:.1} fps", frame.sequence);
        }
        frame
    }

    fn on_read_error(&mut self, err: CaptureError) -> Attempt {
        self.consecutive_failures += 1;
        metrics::counter!("camera_read_errors_total").increment(1);
        if self.consecutive_failures == 1 {
            self.health.set_camera_ok(false);
        }
        if self.consecutive_failures > self.policy.max_retries {
            error!(
                "camera failed {} consecutive reads, releasing device: {err}",
                self.consecutive_failures
            );
            self.source = None;
            self.consecutive_failures = 0;
            return Attempt::Reopen;
        }
        warn!(
            "camera read failed (attempt {}/{}): {err}",
            self.consecutive_failures, self.policy.max_retries
        );
        Attempt::Retry
    }

    /// Sleep for `delay`; false when shutdown was signalled meanwhile.
    fn pause(&self, delay: Duration) -> bool {
        matches!(
            self.shutdown.recv_timeout(delay),
            Err(RecvTimeoutError::Timeout)
        )
    }

    fn shutdown_requested(&self) -> bool {
        !matches!(
            self.shutdown.try_recv(),
            Err(crossbeam_channel::TryRecvError::Empty)
        )
    }

    pub(crate) fn run(mut self) {
        let _span = tracing::info_span!("capture.loop").entered();
        while !self.shutdown_requested() {
            if self.acquire().is_none() {
                break;
            }
        }
        self.source = None;
        info!("camera released");
    }
}

pub(crate) fn spawn_capture(capture: CaptureLoop) -> io::Result<JoinHandle<()>> {
    telemetry::spawn_thread("camera-capture", move || capture.run())
}
