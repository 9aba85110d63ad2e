//! Detection state machine.
//!
//! States: IDLE (`pothole_detected == false`) and ALERT.
//! - IDLE -> ALERT on any frame with at least one detection.
//! - ALERT -> ALERT on every positive frame; re-stamps the last detection
//!   time and counts the frame.
//! - ALERT -> IDLE only on an empty frame arriving strictly more than the
//!   hysteresis window after the last positive frame.
//!
//! A never-seen detection counts as "infinitely long ago": the flag starts
//! false and stays false until the first positive frame.
//!
//! All reads and writes of the composite state go through one mutex, so a
//! status snapshot always reflects a whole update.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::Serialize;

/// Default grace period after the last positive frame.
pub const DEFAULT_HYSTERESIS: Duration = Duration::from_secs(3);
/// Default number of per-frame counts kept for the detection rate.
pub const DEFAULT_HISTORY_LEN: usize = 30;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AggregatorConfig {
    pub hysteresis: Duration,
    pub history_len: usize,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            hysteresis: DEFAULT_HYSTERESIS,
            history_len: DEFAULT_HISTORY_LEN,
        }
    }
}

/// Fixed-capacity FIFO of per-frame detection counts.
#[derive(Clone, Debug)]
pub struct DetectionHistory {
    counts: VecDeque<usize>,
    capacity: usize,
}

impl DetectionHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            counts: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append a count, evicting the oldest entry when full.
    pub fn push(&mut self, count: usize) {
        if self.capacity == 0 {
            return;
        }
        while self.counts.len() >= self.capacity {
            self.counts.pop_front();
        }
        self.counts.push_back(count);
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Oldest first.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.counts.iter().copied()
    }

    /// Mean count per frame; exactly 0.0 when empty.
    pub fn mean(&self) -> f64 {
        if self.counts.is_empty() {
            return 0.0;
        }
        let sum: usize = self.counts.iter().sum();
        sum as f64 / self.counts.len() as f64
    }
}

/// Running detection state shared by every pipeline.
#[derive(Clone, Debug)]
pub struct DetectionState {
    pub pothole_detected: bool,
    /// Frames with at least one detection.
    pub detection_count: u64,
    pub last_detection_time: Option<Instant>,
    /// Detections in the most recent frame.
    pub current_detections: usize,
    pub total_frames: u64,
    pub detection_history: DetectionHistory,
}

impl DetectionState {
    pub fn new(history_len: usize) -> Self {
        Self {
            pothole_detected: false,
            detection_count: 0,
            last_detection_time: None,
            current_detections: 0,
            total_frames: 0,
            detection_history: DetectionHistory::new(history_len),
        }
    }

    pub fn detection_rate(&self) -> f64 {
        self.detection_history.mean()
    }

    fn apply(&mut self, count: usize, now: Instant, hysteresis: Duration) {
        self.current_detections = count;
        self.total_frames += 1;
        self.detection_history.push(count);

        if count > 0 {
            self.pothole_detected = true;
            self.detection_count += 1;
            self.last_detection_time = Some(now);
        } else {
            let expired = match self.last_detection_time {
                None => true,
                Some(last) => now.saturating_duration_since(last) > hysteresis,
            };
            if expired {
                self.pothole_detected = false;
            }
        }
    }
}

/// Status query projection. Field names are the wire schema.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StatusReport {
    pub pothole_detected: bool,
    pub current_detections: usize,
    pub total_detections: u64,
    pub total_frames: u64,
    pub detection_rate: f64,
    /// Seconds since the Unix epoch at the time of the read.
    pub timestamp: f64,
}

pub struct DetectionAggregator {
    config: AggregatorConfig,
    state: Mutex<DetectionState>,
}

impl DetectionAggregator {
    pub fn new(config: AggregatorConfig) -> Self {
        Self {
            state: Mutex::new(DetectionState::new(config.history_len)),
            config,
        }
    }

    pub fn config(&self) -> AggregatorConfig {
        self.config
    }

    /// Fold one frame's detection count into the state, stamped now.
    pub fn record(&self, count: usize) {
        self.record_at(count, Instant::now());
    }

    /// Fold one frame's detection count into the state at `now`.
    pub fn record_at(&self, count: usize, now: Instant) {
        let hysteresis = self.config.hysteresis;
        self.lock().apply(count, now, hysteresis);
    }

    /// Consistent copy of the full state.
    pub fn state(&self) -> DetectionState {
        self.lock().clone()
    }

    pub fn is_alert(&self) -> bool {
        self.lock().pothole_detected
    }

    /// Read-only status snapshot; never mutates state.
    pub fn snapshot(&self) -> StatusReport {
        let guard = self.lock();
        StatusReport {
            pothole_detected: guard.pothole_detected,
            current_detections: guard.current_detections,
            total_detections: guard.detection_count,
            total_frames: guard.total_frames,
            detection_rate: guard.detection_rate(),
            timestamp: epoch_seconds(),
        }
    }

    // Updates are applied in one step, so the state stays consistent even
    // if a holder panicked; recover it instead of failing every reader.
    fn lock(&self) -> MutexGuard<'_, DetectionState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Default for DetectionAggregator {
    fn default() -> Self {
        Self::new(AggregatorConfig::default())
    }
}

fn epoch_seconds() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}
