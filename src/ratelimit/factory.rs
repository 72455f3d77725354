//! Algorithm and backend selection for an activated quota.

use std::sync::Arc;
use tracing::{info, warn};

use super::backend::Limiter;
use super::cache::{CacheKey, LimiterCache};
use super::memory::MemoryLimiter;
use super::multi::MultiLimiter;
use super::redis::{RedisLimiter, RedisStore, ScriptStore};
use super::result::Limit;
use crate::clock::{Clock, SystemClock};
use crate::config::{BackendKind, FailureMode, Quota, SystemConfig};
use crate::error::{RatekeeperError, Result};
use crate::policy::context::PolicyMetadata;

/// A limiter handed to a policy instance.
#[derive(Debug, Clone)]
pub struct BuiltLimiter {
    pub limiter: Arc<dyn Limiter>,
    /// Owned by the [`LimiterCache`]; the policy must not close it
    pub shared: bool,
}

/// Builds limiters for activated policies.
///
/// Created once per process and passed to every activation, so memory-backed
/// limiters survive route reconfiguration through the shared cache.
#[derive(Debug, Clone)]
pub struct LimiterFactory {
    cache: LimiterCache,
    clock: Arc<dyn Clock>,
}

impl Default for LimiterFactory {
    fn default() -> Self {
        Self::new(LimiterCache::new(), Arc::new(SystemClock))
    }
}

impl LimiterFactory {
    pub fn new(cache: LimiterCache, clock: Arc<dyn Clock>) -> Self {
        Self { cache, clock }
    }

    pub fn cache(&self) -> &LimiterCache {
        &self.cache
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.clock)
    }

    /// Build the limiter enforcing `quota` on the configured backend.
    pub async fn build(
        &self,
        quota: &Quota,
        system: &SystemConfig,
        metadata: &PolicyMetadata,
    ) -> Result<BuiltLimiter> {
        match system.backend {
            BackendKind::Memory => self.build_memory(quota, system, metadata),
            BackendKind::Redis => self.build_redis(quota, system).await,
        }
    }

    fn build_memory(&self, quota: &Quota, system: &SystemConfig, metadata: &PolicyMetadata) -> Result<BuiltLimiter> {
        let fingerprint = CacheKey {
            scope: metadata,
            algorithm: system.algorithm,
            limits: &quota.limits,
            cleanup_interval: system.memory.cleanup_interval,
            max_entries: system.memory.max_entries,
            key_extraction: &quota.key_components,
            headers: &system.headers,
            rejection: &quota.rejection,
        }
        .fingerprint()?;

        let limiter = self.cache.get_or_insert_with(&fingerprint, || {
            info!(
                route = %metadata.route_name,
                algorithm = ?system.algorithm,
                tiers = quota.limits.len(),
                "Creating memory limiter"
            );
            combine(&quota.limits, |limit| {
                Arc::new(MemoryLimiter::new(
                    limit,
                    system.algorithm,
                    &system.memory,
                    Arc::clone(&self.clock),
                ))
            })
        })?;

        Ok(BuiltLimiter { limiter, shared: true })
    }

    async fn build_redis(&self, quota: &Quota, system: &SystemConfig) -> Result<BuiltLimiter> {
        let store: Arc<dyn ScriptStore> = Arc::new(RedisStore::new(&system.redis)?);

        if let Err(e) = store.health_check().await {
            match system.redis.failure_mode {
                FailureMode::Open => {
                    warn!(error = %e, "Redis health check failed, continuing in fail-open mode");
                }
                FailureMode::Closed => {
                    return Err(RatekeeperError::BackendUnavailable(format!(
                        "redis health check failed: {}",
                        e
                    )));
                }
            }
        }

        info!(
            algorithm = ?system.algorithm,
            tiers = quota.limits.len(),
            key_prefix = %system.redis.key_prefix,
            "Creating redis limiter"
        );
        let limiter = combine(&quota.limits, |limit| {
            Arc::new(RedisLimiter::new(
                limit,
                system.algorithm,
                Arc::clone(&store),
                Arc::clone(&self.clock),
                system.redis.key_prefix.clone(),
            ))
        })?;

        Ok(BuiltLimiter { limiter, shared: false })
    }
}

/// One limiter per limit, wrapped in a [`MultiLimiter`] when there are several.
fn combine<F>(limits: &[Limit], mut make: F) -> Result<Arc<dyn Limiter>>
where
    F: FnMut(Limit) -> Arc<dyn Limiter>,
{
    match limits {
        [] => Err(RatekeeperError::Config("at least one limit is required".into())),
        [single] => Ok(make(*single)),
        many => {
            let tiers = many.iter().map(|limit| make(*limit)).collect();
            Ok(Arc::new(MultiLimiter::new(tiers)?))
        }
    }
}
