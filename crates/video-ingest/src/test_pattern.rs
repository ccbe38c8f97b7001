use std::{
    thread,
    time::{Duration, Instant},
};

use chrono::Utc;

use crate::{
    source::{CaptureSettings, FrameSource},
    types::{CaptureError, Frame},
};

/// Synthetic source: a gradient background with a bright square sweeping
/// across it. Paced to the configured frame rate.
pub struct TestPattern {
    settings: CaptureSettings,
    interval: Duration,
    next_due: Option<Instant>,
    tick: u64,
}

impl TestPattern {
    pub fn new(settings: CaptureSettings) -> Self {
        let fps = settings.fps.max(1);
        Self {
            settings,
            interval: Duration::from_secs_f64(1.0 / fps as f64),
            next_due: None,
            tick: 0,
        }
    }

    fn render(&self) -> Vec<u8> {
        let width = self.settings.width.max(1) as usize;
        let height = self.settings.height.max(1) as usize;
        let mut data = vec![0u8; width * height * 3];

        let side = (width.min(height) / 4).max(1);
        let span = width.saturating_sub(side).max(1);
        let left = (self.tick as usize * 4) % span;
        let top = (height - side.min(height)) / 2;

        for y in 0..height {
            for x in 0..width {
                let idx = (y * width + x) * 3;
                let inside = x >= left && x < left + side && y >= top && y < top + side;
                if inside {
                    data[idx] = 40;
                    data[idx + 1] = 220;
                    data[idx + 2] = 250;
                } else {
                    data[idx] = (x * 255 / width) as u8;
                    data[idx + 1] = (y * 255 / height) as u8;
                    data[idx + 2] = 64;
                }
            }
        }
        data
    }
}

impl FrameSource for TestPattern {
    fn name(&self) -> &str {
        "test-pattern"
    }

    fn read_frame(&mut self) -> Result<Frame, CaptureError> {
        let now = Instant::now();
        if let Some(due) = self.next_due {
            if due > now {
                thread::sleep(due - now);
            }
        }
        self.next_due = Some(Instant::now() + self.interval);

        let data = self.render();
        self.tick = self.tick.wrapping_add(1);
        Ok(Frame::new(
            data,
            self.settings.width.max(1),
            self.settings.height.max(1),
            Utc::now().timestamp_millis(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_match_configured_size() {
        let mut source = TestPattern::new(CaptureSettings {
            width: 32,
            height: 24,
            fps: 200,
            buffer_size: 1,
        });
        let frame = source.read_frame().unwrap();
        assert_eq!((frame.width, frame.height), (32, 24));
        assert_eq!(frame.data.len(), 32 * 24 * 3);
        assert!(frame.is_well_formed());
    }

    #[test]
    fn timestamps_do_not_go_backwards_and_pattern_moves() {
        let mut source = TestPattern::new(CaptureSettings {
            width: 64,
            height: 48,
            fps: 200,
            buffer_size: 1,
        });
        let first = source.read_frame().unwrap();
        let second = source.read_frame().unwrap();
        assert!(second.timestamp_ms >= first.timestamp_ms);
        assert_ne!(first.data, second.data);
    }

    #[test]
    fn reads_are_paced_to_frame_rate() {
        let mut source = TestPattern::new(CaptureSettings {
            width: 8,
            height: 8,
            fps: 20,
            buffer_size: 1,
        });
        let started = Instant::now();
        for _ in 0..3 {
            source.read_frame().unwrap();
        }
        assert!(started.elapsed() >= Duration::from_millis(90));
    }
}
