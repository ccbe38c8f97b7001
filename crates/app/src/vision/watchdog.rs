use std::{
    io,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    thread::JoinHandle,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use crossbeam_channel::{Receiver, RecvTimeoutError};
use tracing::warn;

use crate::vision::{health::Health, telemetry};

pub(crate) const WATCHDOG_POLL_INTERVAL_MS: u64 = 500;
pub(crate) const WATCHDOG_STALE_THRESHOLD_MS: u64 = 1_500;
pub(crate) const WATCHDOG_STARTUP_GRACE_MS: u64 = 5_000;

/// Last time the capture thread published a frame.
pub(crate) struct CaptureHeartbeat {
    last_beat_ms: AtomicU64,
    stale_after_ms: u64,
}

impl CaptureHeartbeat {
    /// The first deadline is pushed out by the startup grace period.
    pub(crate) fn new(stale_after_ms: u64) -> Self {
        let grace_deadline = current_millis().saturating_add(WATCHDOG_STARTUP_GRACE_MS);
        Self {
            last_beat_ms: AtomicU64::new(grace_deadline),
            stale_after_ms,
        }
    }

    /// Stale threshold for a camera running at `fps`: at least three frame
    /// intervals, never below the fixed floor.
    pub(crate) fn threshold_for_fps(fps: u32) -> u64 {
        let interval = 1_000 / u64::from(fps.max(1));
        WATCHDOG_STALE_THRESHOLD_MS.max(interval.saturating_mul(3))
    }

    pub(crate) fn beat(&self) {
        self.last_beat_ms.store(current_millis(), Ordering::Relaxed);
    }

    pub(crate) fn is_stale(&self, now: u64) -> bool {
        now.saturating_sub(self.last_beat_ms.load(Ordering::Relaxed)) > self.stale_after_ms
    }
}

/// One monitor pass: flag a stalled camera, then settle Serving/Degraded.
pub(crate) fn check_health(health: &Health, heartbeat: &CaptureHeartbeat, now: u64) {
    if heartbeat.is_stale(now) && health.set_camera_ok(false) {
        warn!("no camera frame for over {} ms; marking camera unhealthy", heartbeat.stale_after_ms);
    }
    health.evaluate();
}

/// Spawn the health monitor. It exits when `shutdown` is dropped.
pub(crate) fn spawn_health_monitor(
    health: Arc<Health>,
    heartbeat: Arc<CaptureHeartbeat>,
    shutdown: Receiver<()>,
) -> io::Result<JoinHandle<()>> {
    telemetry::spawn_thread("health-monitor", move || {
        loop {
            match shutdown.recv_timeout(Duration::from_millis(WATCHDOG_POLL_INTERVAL_MS)) {
                Err(RecvTimeoutError::Timeout) => {}
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }
            check_health(&health, &heartbeat, current_millis());
        }
    })
}

pub(crate) fn current_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
