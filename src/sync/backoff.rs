//! Reconnection backoff.

use rand::Rng;
use std::time::Duration;

use crate::config::BackoffConfig;

/// Exponential backoff with jitter and a bounded number of attempts.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    multiplier: f64,
    max_retries: u32,
    attempt: u32,
}

impl Backoff {
    pub fn new(config: &BackoffConfig) -> Self {
        Self {
            initial: Duration::from_millis(config.initial_ms),
            max: Duration::from_millis(config.max_ms.max(config.initial_ms)),
            multiplier: config.multiplier.max(1.0),
            max_retries: config.max_retries,
            attempt: 0,
        }
    }

    /// Delay before the next attempt, or `None` once retries are exhausted.
    ///
    /// The delay is drawn uniformly from the upper half of the exponential
    /// step so that many nodes do not reconnect in lockstep.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.max_retries {
            return None;
        }

        let step = self.initial.as_millis() as f64 * self.multiplier.powi(self.attempt as i32);
        let capped = step.min(self.max.as_millis() as f64) as u64;
        self.attempt += 1;

        let jittered = rand::thread_rng().gen_range(capped / 2..=capped);
        Some(Duration::from_millis(jittered))
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    /// Longest delay this policy produces.
    pub fn max_delay(&self) -> Duration {
        self.max
    }
}
