//! Node-local rate limit state machines.
//!
//! Each rule pipeline owns its counters exclusively, so none of these types
//! need interior synchronization.

use std::collections::VecDeque;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Time window for rate limiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeWindow {
    /// Per-second rate limiting
    Second,
    /// Per-minute rate limiting
    Minute,
    /// Per-hour rate limiting
    Hour,
    /// Per-day rate limiting
    Day,
}

impl TimeWindow {
    /// Get the duration of this time window.
    pub fn duration(&self) -> Duration {
        match self {
            TimeWindow::Second => Duration::from_secs(1),
            TimeWindow::Minute => Duration::from_secs(60),
            TimeWindow::Hour => Duration::from_secs(3600),
            TimeWindow::Day => Duration::from_secs(86400),
        }
    }
}

/// Fixed window counter: the window opens on the first hit and resets once
/// it has fully elapsed.
#[derive(Debug)]
pub struct FixedWindowCounter {
    count: u64,
    limit: u64,
    window: TimeWindow,
    window_start: Instant,
}

impl FixedWindowCounter {
    pub fn new(limit: u64, window: TimeWindow) -> Self {
        Self {
            count: 0,
            limit,
            window,
            window_start: Instant::now(),
        }
    }

    /// Record a hit at `now`. Returns `true` while within the limit.
    pub fn hit(&mut self, now: Instant) -> bool {
        if now.duration_since(self.window_start) >= self.window.duration() {
            self.count = 0;
            self.window_start = now;
        }
        self.count += 1;
        self.count <= self.limit
    }

    pub fn current_count(&self) -> u64 {
        self.count
    }

    /// Whether the current window has fully elapsed at `now`.
    pub fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.window_start) >= self.window.duration()
    }
}

/// Sliding log: counts hits within the trailing window.
#[derive(Debug)]
pub struct SlidingWindowLog {
    hits: VecDeque<Instant>,
    limit: u64,
    window: TimeWindow,
}

impl SlidingWindowLog {
    pub fn new(limit: u64, window: TimeWindow) -> Self {
        Self {
            hits: VecDeque::new(),
            limit,
            window,
        }
    }

    /// Record a hit at `now`. Rejected hits are not logged, so a client
    /// hammering the limit does not extend its own penalty.
    pub fn hit(&mut self, now: Instant) -> bool {
        let window = self.window.duration();
        while let Some(oldest) = self.hits.front() {
            if now.duration_since(*oldest) >= window {
                self.hits.pop_front();
            } else {
                break;
            }
        }

        if (self.hits.len() as u64) < self.limit {
            self.hits.push_back(now);
            true
        } else {
            false
        }
    }

    pub fn current_count(&self) -> usize {
        self.hits.len()
    }

    /// Whether every logged hit has slid out of the window at `now`.
    pub fn is_expired(&self, now: Instant) -> bool {
        match self.hits.back() {
            Some(latest) => now.saturating_duration_since(*latest) >= self.window.duration(),
            None => true,
        }
    }
}

/// Quota: a fixed allowance per calendar period aligned to the Unix epoch.
#[derive(Debug)]
pub struct QuotaCounter {
    used: u64,
    quota: u64,
    period: TimeWindow,
    period_start: u64,
}

impl QuotaCounter {
    pub fn new(quota: u64, period: TimeWindow) -> Self {
        Self {
            used: 0,
            quota,
            period,
            period_start: 0,
        }
    }

    /// Consume one unit of quota at `now`.
    pub fn consume(&mut self, now: SystemTime) -> bool {
        let period_start = self.period_start_at(now);

        if period_start != self.period_start {
            self.period_start = period_start;
            self.used = 0;
        }

        if self.used < self.quota {
            self.used += 1;
            true
        } else {
            false
        }
    }

    pub fn remaining(&self) -> u64 {
        self.quota.saturating_sub(self.used)
    }

    /// Whether `now` falls in a later period than the one being counted.
    pub fn is_expired(&self, now: SystemTime) -> bool {
        self.period_start_at(now) != self.period_start
    }

    fn period_start_at(&self, now: SystemTime) -> u64 {
        let period_secs = self.period.duration().as_secs();
        let secs = now
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        (secs / period_secs) * period_secs
    }
}
