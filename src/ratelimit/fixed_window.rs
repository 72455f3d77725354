//! Fixed window counter arithmetic.
//!
//! Time is divided into epoch-aligned windows of the limit's length. A
//! request is allowed iff `count + n <= threshold` within the current window;
//! the count starts over at every boundary. Susceptible to boundary bursts of
//! up to twice the threshold.

use super::backend::Mode;
use super::result::{micros_to_duration, Limit, RateLimitResult};
use crate::clock::from_micros;

/// Per-key fixed window state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowRecord {
    /// Units consumed in the window
    pub count: u64,
    /// Window start, microseconds
    pub window_start: i64,
}

impl WindowRecord {
    /// When the record may be discarded, microseconds.
    pub fn expiration(&self, limit: &Limit) -> i64 {
        self.window_start + limit.window_micros()
    }
}

/// Raw fixed window outcome shared by both backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Outcome {
    pub allowed: bool,
    /// Count after the call, whether or not it was mutated
    pub count: u64,
    pub window_start: i64,
}

impl Outcome {
    /// Build the public result for this outcome.
    pub(crate) fn into_result(self, limit: &Limit, now: i64) -> RateLimitResult {
        let reset = self.window_start + limit.window_micros();
        let retry_after = if self.allowed { 0 } else { reset - now };
        let full_quota_at = if self.count == 0 { now } else { reset };

        RateLimitResult {
            allowed: self.allowed,
            limit: limit.threshold,
            remaining: limit.threshold.saturating_sub(self.count),
            reset: from_micros(reset),
            retry_after: micros_to_duration(retry_after),
            full_quota_at: from_micros(full_quota_at),
            window: limit.window,
            limit_ref: *limit,
        }
    }
}

/// Start of the window containing `now`.
pub(crate) fn window_start(limit: &Limit, now: i64) -> i64 {
    now - now.rem_euclid(limit.window_micros().max(1))
}

/// Decide a fixed window call and the state to persist, if any.
pub(crate) fn decide(
    limit: &Limit,
    stored: Option<WindowRecord>,
    now: i64,
    n: u64,
    mode: Mode,
) -> (Outcome, Option<WindowRecord>) {
    let start = window_start(limit, now);
    let count = stored
        .filter(|record| record.window_start == start)
        .map_or(0, |record| record.count);

    let allowed = count.saturating_add(n) <= limit.threshold;

    if n == 0 || (!allowed && mode == Mode::Admit) {
        let outcome = Outcome {
            allowed,
            count,
            window_start: start,
        };
        return (outcome, None);
    }

    let count = count.saturating_add(n);
    let outcome = Outcome {
        allowed,
        count,
        window_start: start,
    };
    (
        outcome,
        Some(WindowRecord {
            count,
            window_start: start,
        }),
    )
}
