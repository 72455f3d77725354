//! Behavioral scenarios every [`Limiter`] backend must pass.

use std::time::Duration;

use super::backend::Limiter;
use super::result::{Limit, RateLimitResult};
use crate::clock::{Clock, MockClock};

fn assert_bounded(result: &RateLimitResult) {
    assert!(
        result.remaining <= result.limit_ref.burst.max(result.limit),
        "remaining {} exceeds capacity",
        result.remaining
    );
}

/// Move the clock to the next multiple of `window`.
fn align(clock: &MockClock, window: Duration) {
    let window = window.as_micros() as i64;
    let now = clock.now_micros();
    let offset = now.rem_euclid(window);
    if offset != 0 {
        clock.advance(Duration::from_micros((window - offset) as u64));
    }
}

pub(crate) async fn run_gcra_suite<F>(make: F, clock: &MockClock)
where
    F: Fn(Limit) -> Box<dyn Limiter>,
{
    // burst then throttle, then one unit back after one emission interval
    let limiter = make(Limit::new(2, Duration::from_secs(1)));
    let first = limiter.allow("burst").await.unwrap();
    assert!(first.allowed);
    assert_eq!(first.remaining, 1);
    assert_eq!(first.limit, 2);
    let second = limiter.allow("burst").await.unwrap();
    assert!(second.allowed);
    assert_eq!(second.remaining, 0);
    let third = limiter.allow("burst").await.unwrap();
    assert!(!third.allowed);
    assert_eq!(third.remaining, 0);
    assert_eq!(third.retry_after, Duration::from_millis(500));
    assert_bounded(&third);

    clock.advance(Duration::from_millis(500));
    let refilled = limiter.allow("burst").await.unwrap();
    assert!(refilled.allowed);
    assert_eq!(refilled.remaining, 0);

    clock.advance(Duration::from_secs(1));
    let peek = limiter.allow_n("burst", 0).await.unwrap();
    assert!(peek.allowed);
    assert_eq!(peek.remaining, 2);
    limiter.close().await.unwrap();

    // peeks never consume
    let limiter = make(Limit::new(3, Duration::from_secs(1)));
    for _ in 0..5 {
        let peek = limiter.allow_n("peek", 0).await.unwrap();
        assert!(peek.allowed);
        assert_eq!(peek.remaining, 3);
    }
    let all = limiter.allow_n("peek", 3).await.unwrap();
    assert!(all.allowed);
    assert_eq!(all.remaining, 0);
    limiter.close().await.unwrap();

    // weighted denial leaves state untouched
    let limiter = make(Limit::new(10, Duration::from_secs(1)));
    let seven = limiter.allow_n("weighted", 7).await.unwrap();
    assert!(seven.allowed);
    assert_eq!(seven.remaining, 3);
    let five = limiter.allow_n("weighted", 5).await.unwrap();
    assert!(!five.allowed);
    assert_eq!(five.remaining, 3);
    let three = limiter.allow_n("weighted", 3).await.unwrap();
    assert!(three.allowed);
    assert_eq!(three.remaining, 0);
    limiter.close().await.unwrap();

    // forced consumption overshoots and blocks the next admission
    let limiter = make(Limit::new(2, Duration::from_secs(1)));
    let charged = limiter.charge_n("charge", 5).await.unwrap();
    assert!(!charged.allowed);
    assert_eq!(charged.remaining, 0);
    let next = limiter.allow("charge").await.unwrap();
    assert!(!next.allowed);
    assert!(next.retry_after > Duration::ZERO);
    limiter.close().await.unwrap();

    // explicit burst smaller than the threshold
    let limiter = make(Limit::new(10, Duration::from_secs(10)).with_burst(2));
    assert!(limiter.allow("small-burst").await.unwrap().allowed);
    assert!(limiter.allow("small-burst").await.unwrap().allowed);
    let denied = limiter.allow("small-burst").await.unwrap();
    assert!(!denied.allowed);
    assert_eq!(denied.retry_after, Duration::from_secs(1));
    assert_bounded(&denied);
    limiter.close().await.unwrap();
}

pub(crate) async fn run_fixed_window_suite<F>(make: F, clock: &MockClock)
where
    F: Fn(Limit) -> Box<dyn Limiter>,
{
    let minute = Duration::from_secs(60);

    // count to the threshold, deny, then start over at the boundary
    align(clock, minute);
    let limiter = make(Limit::new(3, minute));
    for expected in [2, 1, 0] {
        let result = limiter.allow("window").await.unwrap();
        assert!(result.allowed);
        assert_eq!(result.remaining, expected);
    }
    let denied = limiter.allow("window").await.unwrap();
    assert!(!denied.allowed);
    assert_eq!(denied.remaining, 0);
    assert_eq!(denied.retry_after, minute);

    clock.advance(minute);
    let reset = limiter.allow("window").await.unwrap();
    assert!(reset.allowed);
    assert_eq!(reset.remaining, 2);
    limiter.close().await.unwrap();

    // retry_after counts down to the boundary
    align(clock, minute);
    let limiter = make(Limit::new(1, minute));
    assert!(limiter.allow("retry").await.unwrap().allowed);
    clock.advance(Duration::from_secs(15));
    let denied = limiter.allow("retry").await.unwrap();
    assert!(!denied.allowed);
    assert_eq!(denied.retry_after, Duration::from_secs(45));
    limiter.close().await.unwrap();

    // peeks and weighted denials never count
    align(clock, minute);
    let limiter = make(Limit::new(3, minute));
    assert_eq!(limiter.allow_n("weighted", 0).await.unwrap().remaining, 3);
    assert!(limiter.allow_n("weighted", 2).await.unwrap().allowed);
    let over = limiter.allow_n("weighted", 2).await.unwrap();
    assert!(!over.allowed);
    assert_eq!(over.remaining, 1);
    assert!(limiter.allow("weighted").await.unwrap().allowed);
    limiter.close().await.unwrap();

    // forced consumption
    align(clock, minute);
    let limiter = make(Limit::new(2, minute));
    let charged = limiter.charge_n("charge", 5).await.unwrap();
    assert!(!charged.allowed);
    assert_eq!(charged.remaining, 0);
    assert_bounded(&charged);
    assert!(!limiter.allow("charge").await.unwrap().allowed);
    limiter.close().await.unwrap();
}
