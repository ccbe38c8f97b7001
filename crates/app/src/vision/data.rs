//! Shared slots passed between the capture thread, the inference thread and
//! the HTTP handlers. The frame slot and the detection slot are locked
//! independently; no code path holds both.

use std::{
    collections::VecDeque,
    sync::{
        Arc, Condvar, Mutex, PoisonError, RwLock,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use ml_core::Detection;
use serde::Serialize;
use tokio::sync::watch;
use video_ingest::Frame;

/// Latest captured frame. Written only by the capture thread.
pub(crate) struct FrameSlot {
    latest: Mutex<Option<Arc<Frame>>>,
    ready: Condvar,
    sequence: watch::Sender<u64>,
    closed: AtomicBool,
}

impl FrameSlot {
    pub(crate) fn new() -> Self {
        let (sequence, _) = watch::channel(0);
        Self {
            latest: Mutex::new(None),
            ready: Condvar::new(),
            sequence,
            closed: AtomicBool::new(false),
        }
    }

    /// Store `frame` as the newest frame and wake every waiter.
    ///
    /// The slot assigns the sequence number and clamps a timestamp that runs
    /// behind the previous frame, so readers always observe monotonic time.
    pub(crate) fn publish(&self, mut frame: Frame) -> Arc<Frame> {
        let frame = {
            let mut guard = self.latest.lock().unwrap_or_else(PoisonError::into_inner);
            let (prev_seq, prev_ts) = guard
                .as_ref()
                .map_or((0, i64::MIN), |prev| (prev.sequence, prev.timestamp_ms));
            frame.sequence = prev_seq + 1;
            frame.timestamp_ms = frame.timestamp_ms.max(prev_ts);
            let frame = Arc::new(frame);
            *guard = Some(frame.clone());
            frame
        };
        self.ready.notify_all();
        self.sequence.send_replace(frame.sequence);
        frame
    }

    /// Newest frame, or `None` when nothing has been captured yet.
    pub(crate) fn latest(&self) -> Option<Arc<Frame>> {
        match self.latest.lock() {
            Ok(guard) => guard.clone(),
            Err(_) => None,
        }
    }

    /// Block until a frame with a sequence above `after` is available, the
    /// slot is closed, or `timeout` elapses.
    pub(crate) fn wait_newer(&self, after: u64, timeout: Duration) -> Option<Arc<Frame>> {
        let guard = self.latest.lock().unwrap_or_else(PoisonError::into_inner);
        let (guard, _) = self
            .ready
            .wait_timeout_while(guard, timeout, |latest| {
                !self.is_closed() && latest.as_ref().is_none_or(|frame| frame.sequence <= after)
            })
            .unwrap_or_else(PoisonError::into_inner);
        guard
            .as_ref()
            .filter(|frame| frame.sequence > after)
            .cloned()
    }

    /// Async change notification carrying the latest sequence number.
    pub(crate) fn subscribe(&self) -> watch::Receiver<u64> {
        self.sequence.subscribe()
    }

    /// Wake every waiter for shutdown. Later waits return immediately.
    pub(crate) fn close(&self) {
        {
            let _guard = self.latest.lock().unwrap_or_else(PoisonError::into_inner);
            self.closed.store(true, Ordering::SeqCst);
        }
        self.ready.notify_all();
        self.sequence.send_modify(|_| {});
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[derive(Clone, Debug, Serialize, PartialEq)]
pub(crate) struct DetectionSummary {
    pub(crate) label: String,
    pub(crate) confidence: f32,
    /// `[x1, y1, x2, y2]` in frame pixels.
    #[serde(rename = "box")]
    pub(crate) bbox: [f32; 4],
}

impl From<Detection> for DetectionSummary {
    fn from(detection: Detection) -> Self {
        Self {
            label: detection.label,
            confidence: detection.score,
            bbox: detection.bbox,
        }
    }
}

/// One inference result, stamped with the frame it was computed from.
#[derive(Clone, Debug, Default, Serialize, PartialEq)]
pub(crate) struct DetectionSet {
    #[serde(rename = "timestamp")]
    pub(crate) timestamp_ms: i64,
    pub(crate) sequence: u64,
    pub(crate) detections: Vec<DetectionSummary>,
}

impl DetectionSet {
    pub(crate) fn empty_for(frame: &Frame) -> Self {
        Self {
            timestamp_ms: frame.timestamp_ms,
            sequence: frame.sequence,
            detections: Vec::new(),
        }
    }
}

struct DetectionState {
    current: Arc<DetectionSet>,
    history: VecDeque<Arc<DetectionSet>>,
}

/// Latest detections plus a ring of recent non-empty results. Written only
/// by the inference thread.
pub(crate) struct DetectionSlot {
    state: RwLock<DetectionState>,
    capacity: usize,
}

impl DetectionSlot {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            state: RwLock::new(DetectionState {
                current: Arc::new(DetectionSet::default()),
                history: VecDeque::with_capacity(capacity),
            }),
            capacity: capacity.max(1),
        }
    }

    pub(crate) fn publish(&self, set: DetectionSet) -> Arc<DetectionSet> {
        let set = Arc::new(set);
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.current = set.clone();
        if !set.detections.is_empty() {
            state.history.push_back(set.clone());
            while state.history.len() > self.capacity {
                state.history.pop_front();
            }
        }
        set
    }

    pub(crate) fn latest(&self) -> Arc<DetectionSet> {
        match self.state.read() {
            Ok(state) => state.current.clone(),
            Err(_) => Arc::new(DetectionSet::default()),
        }
    }

    /// Recent non-empty results, oldest first.
    pub(crate) fn history(&self) -> Vec<Arc<DetectionSet>> {
        match self.state.read() {
            Ok(state) => state.history.iter().cloned().collect(),
            Err(_) => Vec::new(),
        }
    }
}

#[derive(Serialize)]
pub(crate) struct DetectionsResponse<'a> {
    pub(crate) ok: bool,
    pub(crate) timestamp: i64,
    pub(crate) sequence: u64,
    pub(crate) count: usize,
    pub(crate) fps: f32,
    pub(crate) detections: &'a [DetectionSummary],
}

#[derive(Serialize)]
pub(crate) struct HistoryResponse<'a> {
    pub(crate) ok: bool,
    pub(crate) count: usize,
    pub(crate) history: &'a [Arc<DetectionSet>],
}

#[cfg(test)]
mod tests {
    use std::{thread, time::Instant};

    use super::*;

    fn frame(ts: i64) -> Frame {
        Frame::new(vec![0; 12], 2, 2, ts)
    }

    fn set(sequence: u64, labels: &[&str]) -> DetectionSet {
        DetectionSet {
            timestamp_ms: sequence as i64,
            sequence,
            detections: labels
                .iter()
                .map(|label| DetectionSummary {
                    label: label.to_string(),
                    confidence: 0.9,
                    bbox: [0.0, 0.0, 1.0, 1.0],
                })
                .collect(),
        }
    }

    #[test]
    fn empty_slot_is_not_ready() {
        assert!(FrameSlot::new().latest().is_none());
    }

    #[test]
    fn publish_assigns_sequence_and_keeps_time_monotonic() {
        let slot = FrameSlot::new();
        let stamps = [100, 90, 150, 150, 20, 300];
        let mut last = i64::MIN;
        for (idx, ts) in stamps.into_iter().enumerate() {
            slot.publish(frame(ts));
            let latest = slot.latest().unwrap();
            assert_eq!(latest.sequence, idx as u64 + 1);
            assert!(latest.timestamp_ms >= last);
            last = latest.timestamp_ms;
        }
        assert_eq!(last, 300);
    }

    #[test]
    fn wait_newer_wakes_on_publish() {
        let slot = Arc::new(FrameSlot::new());
        slot.publish(frame(1));
        let producer = {
            let slot = slot.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                slot.publish(frame(2));
            })
        };
        let newer = slot.wait_newer(1, Duration::from_secs(5)).unwrap();
        assert_eq!(newer.sequence, 2);
        producer.join().unwrap();
    }

    #[test]
    fn wait_newer_times_out_and_close_releases_waiters() {
        let slot = Arc::new(FrameSlot::new());
        assert!(slot.wait_newer(0, Duration::from_millis(20)).is_none());

        let waiter = {
            let slot = slot.clone();
            thread::spawn(move || {
                let started = Instant::now();
                let result = slot.wait_newer(0, Duration::from_secs(10));
                (result.is_none(), started.elapsed())
            })
        };
        thread::sleep(Duration::from_millis(50));
        slot.close();
        let (none, waited) = waiter.join().unwrap();
        assert!(none);
        assert!(waited < Duration::from_secs(5));
    }

    #[test]
    fn subscribers_see_latest_sequence() {
        let slot = FrameSlot::new();
        let rx = slot.subscribe();
        slot.publish(frame(1));
        slot.publish(frame(2));
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow(), 2);
    }

    #[test]
    fn history_keeps_recent_non_empty_sets() {
        let slot = DetectionSlot::new(3);
        for seq in 1..=5 {
            slot.publish(set(seq, &["stop"]));
            slot.publish(set(seq * 100, &[]));
        }
        assert!(slot.latest().detections.is_empty());
        let history: Vec<u64> = slot.history().iter().map(|s| s.sequence).collect();
        assert_eq!(history, vec![3, 4, 5]);
    }

    #[test]
    fn detection_set_serializes_with_box_key() {
        let json = serde_json::to_value(set(7, &["yield"])).unwrap();
        assert_eq!(json["sequence"], 7);
        assert_eq!(json["timestamp"], 7);
        assert_eq!(json["detections"][0]["label"], "yield");
        assert_eq!(json["detections"][0]["box"][2], 1.0);
    }
}
