use std::time::{Duration, Instant};

/// Exponential moving average of a transfer rate in bytes per second.
///
/// Bytes are accumulated with `record` and folded into the average on each
/// `update`, weighted by how much of the window has elapsed.
#[derive(Debug, Clone)]
pub struct RateEstimator {
    window: Duration,
    rate: f64,
    pending: u64,
    total: u64,
    last_update: Instant,
}

impl RateEstimator {
    pub fn new(window: Duration, now: Instant) -> Self {
        Self {
            window,
            rate: 0.0,
            pending: 0,
            total: 0,
            last_update: now,
        }
    }

    pub fn record(&mut self, bytes: u64) {
        self.pending += bytes;
        self.total += bytes;
    }

    pub fn update(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_update).as_secs_f64();
        if elapsed <= 0.0 {
            return;
        }
        let sample = self.pending as f64 / elapsed;
        let alpha = 1.0 - (-elapsed / self.window.as_secs_f64().max(f64::EPSILON)).exp();
        self.rate += alpha * (sample - self.rate);
        self.pending = 0;
        self.last_update = now;
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    pub fn total(&self) -> u64 {
        self.total
    }
}
