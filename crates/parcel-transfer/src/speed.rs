use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

/// Number of samples averaged into the current speed.
pub const SPEED_SAMPLES: usize = 10;

/// Minimum interval a single sample is measured over.
pub const MIN_SAMPLE_INTERVAL: Duration = Duration::from_millis(500);

/// Rolling transfer speed.
///
/// Each sample is the throughput between two observations at least
/// [`MIN_SAMPLE_INTERVAL`] apart. The reported speed is the mean of the
/// last [`SPEED_SAMPLES`] samples.
#[derive(Debug)]
pub struct SpeedMeter {
    samples: VecDeque<f64>,
    mark: Option<(Instant, u64)>,
}

impl Default for SpeedMeter {
    fn default() -> Self {
        Self::new()
    }
}

impl SpeedMeter {
    pub fn new() -> Self {
        Self {
            samples: VecDeque::with_capacity(SPEED_SAMPLES),
            mark: None,
        }
    }

    /// Records the cumulative byte count observed now.
    pub fn record(&mut self, total_bytes: u64) {
        self.record_at(total_bytes, Instant::now());
    }

    /// Records the cumulative byte count observed at `now`.
    pub fn record_at(&mut self, total_bytes: u64, now: Instant) {
        let Some((since, bytes_then)) = self.mark else {
            self.mark = Some((now, total_bytes));
            return;
        };

        let elapsed = now.saturating_duration_since(since);
        if elapsed < MIN_SAMPLE_INTERVAL {
            return;
        }

        let delta = total_bytes.saturating_sub(bytes_then);
        if self.samples.len() == SPEED_SAMPLES {
            self.samples.pop_front();
        }
        self.samples.push_back(delta as f64 / elapsed.as_secs_f64());
        self.mark = Some((now, total_bytes));
    }

    /// Mean of the retained samples in bytes/second, 0.0 before the first sample.
    pub fn bytes_per_second(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().sum::<f64>() / self.samples.len() as f64
    }

    /// Estimated time to move `remaining` more bytes.
    pub fn eta(&self, remaining: u64) -> Option<Duration> {
        let speed = self.bytes_per_second();
        if speed <= 0.0 {
            return None;
        }
        Some(Duration::from_secs_f64(remaining as f64 / speed))
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }
}
