//! Per-client execution-time history

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

/// Number of samples in the moving average
pub const MOVING_AVG_RANGE: usize = 15;

/// One retired request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecSample {
    /// Measured GPU time in microseconds
    pub exec_us: u64,
    /// When the request was submitted
    pub submitted_at: DateTime<Local>,
}

/// Sliding window of the last [`MOVING_AVG_RANGE`] execution times
#[derive(Debug, Clone, Default)]
pub struct ExecHistory {
    samples: VecDeque<ExecSample>,
    total: u64,
}

impl ExecHistory {
    /// Empty history
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a retirement, dropping the oldest sample once the window is full
    pub fn record(&mut self, exec: Duration, submitted_at: DateTime<Local>) {
        if self.samples.len() == MOVING_AVG_RANGE {
            self.samples.pop_front();
        }
        self.samples.push_back(ExecSample {
            exec_us: exec.as_micros() as u64,
            submitted_at,
        });
        self.total += 1;
    }

    /// Window sum divided by the window size
    ///
    /// The divisor is always [`MOVING_AVG_RANGE`], so a new client ramps up
    /// from zero instead of being judged on its first few samples.
    pub fn average(&self) -> Duration {
        let sum: u64 = self.samples.iter().map(|s| s.exec_us).sum();
        Duration::from_micros(sum / MOVING_AVG_RANGE as u64)
    }

    /// Samples in the window, oldest first
    pub fn samples(&self) -> impl Iterator<Item = &ExecSample> {
        self.samples.iter()
    }

    /// Retirements recorded over the client's lifetime
    pub fn total(&self) -> u64 {
        self.total
    }

    /// Forget everything
    pub fn clear(&mut self) {
        self.samples.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_average_uses_fixed_divisor() {
        let mut history = ExecHistory::new();
        history.record(Duration::from_millis(15), Local::now());
        assert_eq!(history.average(), Duration::from_millis(1));
    }

    #[test]
    fn test_window_slides() {
        let mut history = ExecHistory::new();
        for _ in 0..MOVING_AVG_RANGE {
            history.record(Duration::from_millis(90), Local::now());
        }
        assert_eq!(history.average(), Duration::from_millis(90));
        for _ in 0..MOVING_AVG_RANGE {
            history.record(Duration::from_millis(30), Local::now());
        }
        assert_eq!(history.average(), Duration::from_millis(30));
        assert_eq!(history.samples().count(), MOVING_AVG_RANGE);
        assert_eq!(history.total(), 2 * MOVING_AVG_RANGE as u64);
    }
}
