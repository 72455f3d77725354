//! Combinator enforcing several limits as tiers of one quota.

use async_trait::async_trait;
use futures::future::join_all;
use std::sync::Arc;
use tracing::{debug, trace};

use super::backend::Limiter;
use super::result::RateLimitResult;
use crate::error::{RatekeeperError, Result};

/// Enforces every tier in order, failing fast on the first denial.
///
/// Each tier tracks its own state under `<key>:<index>`, so a `1/s` tier and
/// a `1000/h` tier never share a bucket even when they share a backend.
#[derive(Debug)]
pub struct MultiLimiter {
    tiers: Vec<Arc<dyn Limiter>>,
}

impl MultiLimiter {
    pub fn new(tiers: Vec<Arc<dyn Limiter>>) -> Result<Self> {
        if tiers.is_empty() {
            return Err(RatekeeperError::Config("at least one limit tier is required".into()));
        }
        Ok(Self { tiers })
    }

    /// Get the number of tiers.
    pub fn tier_count(&self) -> usize {
        self.tiers.len()
    }

    fn tier_key(key: &str, index: usize) -> String {
        format!("{}:{}", key, index)
    }
}

/// Pick the tier with the least capacity left; earlier tiers win ties.
fn most_restrictive(results: Vec<RateLimitResult>) -> Option<RateLimitResult> {
    results.into_iter().reduce(|best, next| {
        if next.remaining < best.remaining {
            next
        } else {
            best
        }
    })
}

#[async_trait]
impl Limiter for MultiLimiter {
    async fn allow_n(&self, key: &str, n: u64) -> Result<RateLimitResult> {
        let mut results = Vec::with_capacity(self.tiers.len());

        for (index, tier) in self.tiers.iter().enumerate() {
            let result = tier.allow_n(&Self::tier_key(key, index), n).await?;
            if !result.allowed {
                debug!(key = %key, tier = index, limit = result.limit, "Tier denied request");
                return Ok(result);
            }
            results.push(result);
        }

        trace!(key = %key, tiers = results.len(), "All tiers allowed request");
        most_restrictive(results)
            .ok_or_else(|| RatekeeperError::Config("at least one limit tier is required".into()))
    }

    async fn charge_n(&self, key: &str, n: u64) -> Result<RateLimitResult> {
        let mut results = Vec::with_capacity(self.tiers.len());
        for (index, tier) in self.tiers.iter().enumerate() {
            results.push(tier.charge_n(&Self::tier_key(key, index), n).await?);
        }

        if let Some(index) = results.iter().position(|result| !result.allowed) {
            debug!(key = %key, tier = index, "Charge pushed tier over its limit");
            return Ok(results.swap_remove(index));
        }
        most_restrictive(results)
            .ok_or_else(|| RatekeeperError::Config("at least one limit tier is required".into()))
    }

    async fn close(&self) -> Result<()> {
        join_all(self.tiers.iter().map(|tier| tier.close()))
            .await
            .into_iter()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use crate::config::{Algorithm, MemoryConfig};
    use crate::ratelimit::{Limit, MemoryLimiter};
    use std::time::Duration;

    fn create_test_tiers(limits: &[Limit], clock: &MockClock) -> MultiLimiter {
        let tiers = limits
            .iter()
            .map(|limit| {
                Arc::new(MemoryLimiter::new(
                    *limit,
                    Algorithm::Gcra,
                    &MemoryConfig::default(),
                    Arc::new(clock.clone()),
                )) as Arc<dyn Limiter>
            })
            .collect();
        MultiLimiter::new(tiers).unwrap()
    }

    #[tokio::test]
    async fn test_fail_fast_on_first_denying_tier() {
        let clock = MockClock::at_unix(1_700_000_000);
        let multi = create_test_tiers(
            &[
                Limit::new(1, Duration::from_secs(1)),
                Limit::new(1000, Duration::from_secs(3600)),
            ],
            &clock,
        );

        let first = multi.allow("user").await.unwrap();
        assert!(first.allowed);

        let second = multi.allow("user").await.unwrap();
        assert!(!second.allowed);
        assert_eq!(second.limit, 1);
    }

    #[tokio::test]
    async fn test_most_restrictive_result_on_success() {
        let clock = MockClock::at_unix(1_700_000_000);
        let multi = create_test_tiers(
            &[
                Limit::new(100, Duration::from_secs(60)),
                Limit::new(5, Duration::from_secs(1)),
            ],
            &clock,
        );

        let result = multi.allow("user").await.unwrap();
        assert!(result.allowed);
        assert_eq!(result.limit, 5);
        assert_eq!(result.remaining, 4);
    }

    #[tokio::test]
    async fn test_tiers_do_not_share_state() {
        let clock = MockClock::at_unix(1_700_000_000);
        let limit = Limit::new(2, Duration::from_secs(1));
        let multi = create_test_tiers(&[limit, limit], &clock);

        let result = multi.allow_n("user", 2).await.unwrap();
        assert!(result.allowed);
        assert_eq!(result.remaining, 0);
    }

    #[tokio::test]
    async fn test_charge_reports_overshooting_tier() {
        let clock = MockClock::at_unix(1_700_000_000);
        let multi = create_test_tiers(
            &[
                Limit::new(100, Duration::from_secs(60)),
                Limit::new(3, Duration::from_secs(1)),
            ],
            &clock,
        );

        let charged = multi.charge_n("user", 5).await.unwrap();
        assert!(!charged.allowed);
        assert_eq!(charged.limit, 3);

        let next = multi.allow("user").await.unwrap();
        assert!(!next.allowed);
    }

    #[test]
    fn test_empty_tiers_rejected() {
        assert!(MultiLimiter::new(Vec::new()).is_err());
    }
}
