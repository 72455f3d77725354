//! Limiter trait shared by the memory and external-store implementations.

use async_trait::async_trait;

use super::result::RateLimitResult;
use crate::error::Result;

/// Trait for rate limiter implementations.
///
/// Both the in-process [`MemoryLimiter`](super::MemoryLimiter) and the
/// [`RedisLimiter`](super::RedisLimiter) implement this, so the policy
/// orchestrator never needs to know which backend it is talking to.
#[async_trait]
pub trait Limiter: Send + Sync + std::fmt::Debug {
    /// Admit a single request against `key`.
    async fn allow(&self, key: &str) -> Result<RateLimitResult> {
        self.allow_n(key, 1).await
    }

    /// Admit `n` units against `key`.
    ///
    /// State is only mutated when the call is allowed and `n > 0`; a call
    /// with `n == 0` is a pure peek.
    async fn allow_n(&self, key: &str, n: u64) -> Result<RateLimitResult>;

    /// Consume `n` units against `key` whether or not they fit.
    ///
    /// The returned result reports `allowed = false` when the charge pushed
    /// the bucket past its quota. Used once a response has already been sent
    /// and the cost can no longer be refused.
    async fn charge_n(&self, key: &str, n: u64) -> Result<RateLimitResult>;

    /// Release background resources. Calling this more than once is a no-op.
    async fn close(&self) -> Result<()>;
}

/// Whether a decision may consume capacity beyond the quota.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Mode {
    /// Consume only when the request fits.
    Admit,
    /// Consume unconditionally.
    Charge,
}
