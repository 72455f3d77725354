//! Limit definitions and per-call decision results.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

const MICROS_PER_SEC: i64 = 1_000_000;

/// One configured `(threshold, window, burst)` tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Limit {
    /// Requests allowed per window
    pub threshold: u64,
    /// Length of the window
    pub window: Duration,
    /// Maximum requests admitted back to back (GCRA only)
    pub burst: u64,
}

impl Limit {
    /// Create a limit whose burst equals its threshold.
    pub fn new(threshold: u64, window: Duration) -> Self {
        Self {
            threshold,
            window,
            burst: threshold,
        }
    }

    /// Override the burst size.
    pub fn with_burst(mut self, burst: u64) -> Self {
        self.burst = burst;
        self
    }

    /// Window length in whole microseconds.
    pub fn window_micros(&self) -> i64 {
        i64::try_from(self.window.as_micros()).unwrap_or(i64::MAX)
    }

    /// Time between two evenly spaced requests, `window / threshold`.
    ///
    /// Never below one microsecond; route configuration rejects limits that
    /// would need finer spacing.
    pub fn emission_interval_micros(&self) -> i64 {
        let threshold = i64::try_from(self.threshold.max(1)).unwrap_or(i64::MAX);
        (self.window_micros() / threshold).max(1)
    }

    /// How far ahead of `now` the TAT may run, `emission_interval * burst`.
    pub fn burst_allowance_micros(&self) -> i64 {
        let burst = i64::try_from(self.burst).unwrap_or(i64::MAX);
        self.emission_interval_micros().saturating_mul(burst)
    }

    /// Window length in whole seconds, rounded up.
    pub fn window_secs(&self) -> u64 {
        let micros = self.window_micros();
        ((micros + MICROS_PER_SEC - 1) / MICROS_PER_SEC) as u64
    }
}

/// The outcome of one `allow_n` call.
///
/// Produced fresh for every call and never mutated afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitResult {
    /// Whether the request was admitted
    pub allowed: bool,
    /// The threshold of the limit that produced this result
    pub limit: u64,
    /// Requests that may still be admitted right now
    pub remaining: u64,
    /// When the bucket state next resets
    pub reset: DateTime<Utc>,
    /// How long to wait before retrying; zero when not meaningful
    pub retry_after: Duration,
    /// When the full quota is available again
    pub full_quota_at: DateTime<Utc>,
    /// Window of the limit
    pub window: Duration,
    /// The limit tier that produced this result
    pub limit_ref: Limit,
}

impl RateLimitResult {
    /// Time from `now` until `reset`, never negative.
    pub fn reset_after(&self, now: DateTime<Utc>) -> Duration {
        (self.reset - now).to_std().unwrap_or(Duration::ZERO)
    }
}

/// Convert a non-negative microsecond count into a duration.
pub(crate) fn micros_to_duration(micros: i64) -> Duration {
    Duration::from_micros(u64::try_from(micros).unwrap_or(0))
}
