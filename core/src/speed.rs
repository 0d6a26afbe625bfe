use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::types::constants;
use crate::types::SpeedBps;

/// Sliding-window throughput meter: speed is the byte sum over the
/// samples inside the smoothing window divided by their time span.
#[derive(Debug)]
pub struct SpeedMeter {
    window: Duration,
    samples: VecDeque<(Instant, u64)>,
}

impl SpeedMeter {
    pub fn new() -> Self {
        Self::with_window(constants::SPEED_SMOOTHING_WINDOW)
    }

    pub fn with_window(window: Duration) -> Self {
        Self {
            window,
            samples: VecDeque::new(),
        }
    }

    pub fn record(&mut self, bytes: u64) {
        self.record_at(Instant::now(), bytes);
    }

    fn record_at(&mut self, now: Instant, bytes: u64) {
        self.samples.push_back((now, bytes));
        self.evict(now);
    }

    pub fn bytes_per_second(&mut self) -> SpeedBps {
        let now = Instant::now();
        self.evict(now);
        if self.samples.len() < 2 {
            return 0.0;
        }
        let span = self
            .samples
            .back()
            .map(|(t, _)| *t)
            .unwrap_or(now)
            .duration_since(self.samples.front().map(|(t, _)| *t).unwrap_or(now));
        let secs = span.as_secs_f64();
        if secs <= 0.0 {
            return 0.0;
        }
        let total: u64 = self.samples.iter().map(|(_, b)| *b).sum();
        total as f64 / secs
    }

    pub fn reset(&mut self) {
        self.samples.clear();
    }

    fn evict(&mut self, now: Instant) {
        while let Some((stamp, _)) = self.samples.front() {
            if now.duration_since(*stamp) > self.window {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }
}

impl Default for SpeedMeter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_samples_means_zero() {
        let mut meter = SpeedMeter::new();
        assert_eq!(meter.bytes_per_second(), 0.0);
        meter.record(1000);
        // a single sample has no time span to divide over
        assert_eq!(meter.bytes_per_second(), 0.0);
    }

    #[test]
    fn speed_reflects_recorded_bytes() {
        let mut meter = SpeedMeter::with_window(Duration::from_secs(10));
        let base = Instant::now();
        meter.record_at(base, 1000);
        meter.record_at(base + Duration::from_secs(1), 1000);
        meter.record_at(base + Duration::from_secs(2), 1000);
        let speed = meter.bytes_per_second();
        assert!(speed > 0.0, "expected positive speed, got {speed}");
    }

    #[test]
    fn old_samples_fall_out_of_the_window() {
        let mut meter = SpeedMeter::with_window(Duration::from_millis(10));
        let base = Instant::now() - Duration::from_secs(60);
        meter.record_at(base, 1_000_000);
        meter.record_at(base + Duration::from_millis(1), 1_000_000);
        assert_eq!(meter.bytes_per_second(), 0.0);
    }

    #[test]
    fn reset_clears_history() {
        let mut meter = SpeedMeter::new();
        meter.record(5000);
        meter.record(5000);
        meter.reset();
        assert_eq!(meter.bytes_per_second(), 0.0);
    }
}
