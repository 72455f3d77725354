//! Generic Cell Rate Algorithm arithmetic.
//!
//! GCRA tracks a single theoretical arrival time (TAT) per key. All values
//! are integer microseconds since the unix epoch so that the in-process
//! implementation and the store-side script agree exactly.
//!
//! ```text
//! emission_interval = window / threshold
//! burst_allowance   = emission_interval * burst
//! tat               = max(stored_tat, now)
//! earliest_allowed  = tat + emission_interval - burst_allowance
//! remaining(t)      = clamp(burst - ceil((t - now) / emission_interval), 0, burst)
//! ```

use super::backend::Mode;
use super::result::{micros_to_duration, Limit, RateLimitResult};
use crate::clock::from_micros;

/// Per-key GCRA state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TatRecord {
    /// Theoretical arrival time, microseconds
    pub tat: i64,
    /// When the record may be discarded, microseconds
    pub expiration: i64,
}

/// Raw GCRA outcome shared by both backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Outcome {
    pub allowed: bool,
    pub remaining: u64,
    /// TAT after the call, whether or not it was mutated
    pub tat: i64,
    pub retry_after: i64,
}

impl Outcome {
    /// Build the public result for this outcome.
    pub(crate) fn into_result(self, limit: &Limit, now: i64) -> RateLimitResult {
        RateLimitResult {
            allowed: self.allowed,
            limit: limit.threshold,
            remaining: self.remaining,
            reset: from_micros(self.tat),
            retry_after: micros_to_duration(self.retry_after),
            full_quota_at: from_micros(self.tat.max(now)),
            window: limit.window,
            limit_ref: *limit,
        }
    }
}

/// Decide a GCRA call and the state to persist, if any.
pub(crate) fn decide(
    limit: &Limit,
    stored: Option<TatRecord>,
    now: i64,
    n: u64,
    mode: Mode,
) -> (Outcome, Option<TatRecord>) {
    let emission_interval = limit.emission_interval_micros();
    let burst_allowance = limit.burst_allowance_micros();

    let tat = stored
        .filter(|record| record.expiration > now)
        .map_or(now, |record| record.tat)
        .max(now);

    let remaining_at = |t: i64| -> u64 {
        let used = ceil_div(t - now, emission_interval);
        let burst = i64::try_from(limit.burst).unwrap_or(i64::MAX);
        burst.saturating_sub(used).clamp(0, burst) as u64
    };

    let earliest_allowed = tat + emission_interval - burst_allowance;
    let remaining = remaining_at(tat);

    let (allowed, retry_after) = if now < earliest_allowed {
        (false, earliest_allowed - now)
    } else if n > remaining {
        // Not enough room for a weighted request; retry timing is not meaningful.
        (false, 0)
    } else {
        (true, 0)
    };

    if n == 0 || (!allowed && mode == Mode::Admit) {
        let outcome = Outcome {
            allowed,
            remaining,
            tat,
            retry_after,
        };
        return (outcome, None);
    }

    let increment = emission_interval.saturating_mul(i64::try_from(n).unwrap_or(i64::MAX));
    let new_tat = tat.saturating_add(increment);
    let expiration = (now + limit.window_micros() + burst_allowance).max(new_tat);

    let retry_after = if allowed {
        0
    } else {
        (new_tat + emission_interval - burst_allowance - now).max(0)
    };

    let outcome = Outcome {
        allowed,
        remaining: remaining_at(new_tat),
        tat: new_tat,
        retry_after,
    };
    (
        outcome,
        Some(TatRecord {
            tat: new_tat,
            expiration,
        }),
    )
}

/// Ceiling division for a non-negative numerator and positive divisor.
fn ceil_div(numerator: i64, divisor: i64) -> i64 {
    if numerator <= 0 {
        return 0;
    }
    (numerator + divisor - 1) / divisor
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const NOW: i64 = 1_700_000_000_000_000;

    fn step(
        limit: &Limit,
        state: &mut Option<TatRecord>,
        now: i64,
        n: u64,
        mode: Mode,
    ) -> Outcome {
        let (outcome, update) = decide(limit, *state, now, n, mode);
        if update.is_some() {
            *state = update;
        }
        outcome
    }

    #[test]
    fn test_burst_then_throttle() {
        let limit = Limit::new(2, Duration::from_secs(1));
        let mut state = None;

        let first = step(&limit, &mut state, NOW, 1, Mode::Admit);
        assert!(first.allowed);
        assert_eq!(first.remaining, 1);

        let second = step(&limit, &mut state, NOW, 1, Mode::Admit);
        assert!(second.allowed);
        assert_eq!(second.remaining, 0);

        let third = step(&limit, &mut state, NOW, 1, Mode::Admit);
        assert!(!third.allowed);
        assert_eq!(third.remaining, 0);
        assert_eq!(third.retry_after, 500_000);
    }

    #[test]
    fn test_denial_does_not_mutate_state() {
        let limit = Limit::new(1, Duration::from_secs(1));
        let mut state = None;

        step(&limit, &mut state, NOW, 1, Mode::Admit);
        let before = state;
        let (outcome, update) = decide(&limit, state, NOW, 1, Mode::Admit);

        assert!(!outcome.allowed);
        assert!(update.is_none());
        assert_eq!(state, before);
    }

    #[test]
    fn test_weighted_request_exceeding_remaining() {
        let limit = Limit::new(10, Duration::from_secs(10));
        let mut state = None;

        step(&limit, &mut state, NOW, 8, Mode::Admit);
        let outcome = step(&limit, &mut state, NOW, 5, Mode::Admit);

        assert!(!outcome.allowed);
        assert_eq!(outcome.remaining, 2);
        assert_eq!(outcome.retry_after, 0);
    }

    #[test]
    fn test_zero_cost_is_a_peek() {
        let limit = Limit::new(5, Duration::from_secs(1));
        let mut state = None;
        step(&limit, &mut state, NOW, 2, Mode::Admit);

        let (peek, update) = decide(&limit, state, NOW, 0, Mode::Admit);
        assert!(peek.allowed);
        assert_eq!(peek.remaining, 3);
        assert!(update.is_none());

        let (_, update) = decide(&limit, state, NOW, 0, Mode::Charge);
        assert!(update.is_none());
    }

    #[test]
    fn test_refill_after_idle() {
        let limit = Limit::new(4, Duration::from_secs(2)).with_burst(4);
        let mut state = None;
        for _ in 0..4 {
            assert!(step(&limit, &mut state, NOW, 1, Mode::Admit).allowed);
        }

        // half a second restores one slot
        let later = NOW + 500_000;
        let outcome = step(&limit, &mut state, later, 0, Mode::Admit);
        assert_eq!(outcome.remaining, 1);

        let idle = NOW + limit.window_micros() + limit.burst_allowance_micros();
        let outcome = step(&limit, &mut state, idle, 0, Mode::Admit);
        assert_eq!(outcome.remaining, 4);
    }

    #[test]
    fn test_remaining_stays_within_burst() {
        let limit = Limit::new(3, Duration::from_secs(3)).with_burst(5);
        let mut state = None;
        let mut now = NOW;

        for i in 0..200u64 {
            let outcome = step(&limit, &mut state, now, i % 4, Mode::Admit);
            assert!(outcome.remaining <= limit.burst);
            now += ((i * 7919) % 900_000) as i64;
        }
    }

    #[test]
    fn test_charge_overshoots_quota() {
        let limit = Limit::new(10, Duration::from_secs(10));
        let mut state = None;
        step(&limit, &mut state, NOW, 9, Mode::Admit);

        let charged = step(&limit, &mut state, NOW, 5, Mode::Charge);
        assert!(!charged.allowed);
        assert_eq!(charged.remaining, 0);
        assert!(charged.retry_after > 0);

        let next = step(&limit, &mut state, NOW, 1, Mode::Admit);
        assert!(!next.allowed);
    }

    #[test]
    fn test_expired_record_is_ignored() {
        let limit = Limit::new(1, Duration::from_secs(1));
        let stale = TatRecord {
            tat: NOW + 10_000_000,
            expiration: NOW - 1,
        };

        let (outcome, _) = decide(&limit, Some(stale), NOW, 1, Mode::Admit);
        assert!(outcome.allowed);
    }
}
