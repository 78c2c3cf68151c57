//! Adaptive wait for empty polls
//!
//! When the fetch mode blocks with no timeout, an empty poll must not turn
//! into a busy spin. The first few consecutive empties only yield the
//! scheduler; past the threshold the wait sleeps, scaling linearly with the
//! consecutive-empty count up to a capped ceiling.

use std::time::Duration;

/// Default number of leading empty polls that only yield.
const DEFAULT_YIELD_THRESHOLD: u32 = 3;
/// Default cap on the sleep multiplier.
const DEFAULT_MAX_MULTIPLIER: u32 = 10;
/// Default sleep unit.
const DEFAULT_UNIT: Duration = Duration::from_millis(1);

/// Backoff state for consecutive empty polls.
#[derive(Debug, Clone)]
pub struct EmptyPollBackoff {
    yield_threshold: u32,
    max_multiplier: u32,
    unit: Duration,
    consecutive_empty: u32,
}

impl Default for EmptyPollBackoff {
    fn default() -> Self {
        Self::new()
    }
}

impl EmptyPollBackoff {
    /// Create a backoff with the default thresholds.
    pub fn new() -> Self {
        Self {
            yield_threshold: DEFAULT_YIELD_THRESHOLD,
            max_multiplier: DEFAULT_MAX_MULTIPLIER,
            unit: DEFAULT_UNIT,
            consecutive_empty: 0,
        }
    }

    /// Override the yield threshold.
    pub fn with_yield_threshold(mut self, threshold: u32) -> Self {
        self.yield_threshold = threshold;
        self
    }

    /// Override the sleep ceiling (`max_multiplier * unit`).
    pub fn with_max_multiplier(mut self, max: u32) -> Self {
        self.max_multiplier = max;
        self
    }

    /// Override the sleep unit.
    pub fn with_unit(mut self, unit: Duration) -> Self {
        self.unit = unit;
        self
    }

    /// The configured sleep ceiling.
    pub fn ceiling(&self) -> Duration {
        self.unit.saturating_mul(self.max_multiplier)
    }

    /// Consecutive empty polls observed since the last reset.
    pub fn consecutive_empty(&self) -> u32 {
        self.consecutive_empty
    }

    /// Record one empty poll and return the wait it calls for:
    /// `None` means cooperative yield, `Some(d)` means sleep for `d`.
    pub fn next_wait(&mut self) -> Option<Duration> {
        self.consecutive_empty = self.consecutive_empty.saturating_add(1);
        if self.consecutive_empty <= self.yield_threshold {
            None
        } else {
            let multiplier = self.consecutive_empty.min(self.max_multiplier);
            Some(self.unit.saturating_mul(multiplier))
        }
    }

    /// Record one empty poll and perform the wait.
    pub async fn wait(&mut self) {
        match self.next_wait() {
            None => tokio::task::yield_now().await,
            Some(d) => tokio::time::sleep(d).await,
        }
    }

    /// Reset after a non-empty poll.
    pub fn reset(&mut self) {
        self.consecutive_empty = 0;
    }
}
