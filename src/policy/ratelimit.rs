//! The rate limit policy: ties key and cost extraction to a limiter.
//!
//! Each request moves through key extraction, a cost decision and
//! enforcement before it is either forwarded or rejected. When the cost can
//! only be known from the response, enforcement is split: the request phase
//! performs a non-consuming pre-check and the response phase charges the
//! real cost. A response can therefore push a quota past its limit; the
//! overshoot is only visible to the next request on the same key.

use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use super::context::{
    PolicyMetadata, ProcessingMode, RequestAction, RequestContext, ResponseAction, ResponseContext,
};
use super::headers::{rate_limit_headers, rejection_response};
use crate::clock::Clock;
use crate::config::{FailureMode, HeaderConfig, Quota, RejectionConfig, RouteConfig, SystemConfig};
use crate::error::{RatekeeperError, Result};
use crate::extract::{CostExtractor, KeyExtractor};
use crate::ratelimit::{BuiltLimiter, Limiter, LimiterFactory, RateLimitResult};

/// Per-request state carried from the request phase to the response phase.
#[derive(Debug, Clone)]
pub struct RateLimitState {
    pub key: String,
    /// Decision made in the request phase
    pub result: RateLimitResult,
}

/// A rate limit policy activated on one route.
#[derive(Debug)]
pub struct RateLimitPolicy {
    metadata: PolicyMetadata,
    limiter: Arc<dyn Limiter>,
    /// Owned by the limiter cache and left open on close
    shared: bool,
    key_extractor: KeyExtractor,
    cost_extractor: Option<CostExtractor>,
    headers: HeaderConfig,
    rejection: RejectionConfig,
    failure_mode: FailureMode,
    clock: Arc<dyn Clock>,
}

impl RateLimitPolicy {
    /// Validate route parameters and build the policy.
    ///
    /// Fails with a configuration error on malformed parameters, and with a
    /// backend error when the store is unreachable in fail-closed mode.
    pub async fn activate(
        params: &Value,
        system: &SystemConfig,
        metadata: PolicyMetadata,
        factory: &LimiterFactory,
    ) -> Result<Self> {
        let quota = RouteConfig::parse(params)?;
        // Compile extractors before touching the backend so bad expressions fail fast.
        let key_extractor = KeyExtractor::new(&quota.key_components, &metadata)?;
        let cost_extractor = quota.cost.as_ref().map(CostExtractor::new).transpose()?;
        let built = factory.build(&quota, system, &metadata).await?;

        let policy = Self::assemble(
            quota,
            metadata,
            key_extractor,
            cost_extractor,
            built,
            system,
            factory.clock(),
        );

        info!(
            route = %policy.metadata.route_name,
            api = %policy.metadata.api_name,
            backend = ?system.backend,
            algorithm = ?system.algorithm,
            deferred = policy.is_deferred(),
            "Activated rate limit policy"
        );
        Ok(policy)
    }

    fn assemble(
        quota: Quota,
        metadata: PolicyMetadata,
        key_extractor: KeyExtractor,
        cost_extractor: Option<CostExtractor>,
        built: BuiltLimiter,
        system: &SystemConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            metadata,
            limiter: built.limiter,
            shared: built.shared,
            key_extractor,
            cost_extractor,
            headers: system.headers,
            rejection: quota.rejection,
            failure_mode: system.redis.failure_mode,
            clock,
        }
    }

    /// Whether cost is only known once the response arrives.
    pub fn is_deferred(&self) -> bool {
        self.cost_extractor.as_ref().is_some_and(CostExtractor::is_deferred)
    }

    /// What the host must parse or buffer for this policy.
    pub fn processing_mode(&self) -> ProcessingMode {
        let cost = self.cost_extractor.as_ref();
        ProcessingMode {
            request_headers: true,
            buffer_request_body: self.key_extractor.needs_request_body()
                || cost.is_some_and(CostExtractor::needs_request_body),
            response_headers: true,
            buffer_response_body: cost.is_some_and(CostExtractor::needs_response_body),
        }
    }

    /// Decide whether the request may proceed upstream.
    #[instrument(skip(self, ctx), fields(route = %self.metadata.route_name, path = %ctx.path))]
    pub async fn on_request(&self, ctx: &mut RequestContext) -> RequestAction {
        let key = self.key_extractor.extract(ctx);
        let deferred = self.is_deferred();

        let n = match (&self.cost_extractor, deferred) {
            (_, true) => 0,
            (Some(extractor), false) => extractor.extract(ctx, None).units(),
            (None, false) => 1,
        };

        let result = match self.limiter.allow_n(&key, n).await {
            Ok(result) => result,
            Err(e) => return self.on_backend_failure(&key, e),
        };

        // An exhausted quota admits nothing until it refills, whatever the response costs.
        let admitted = result.allowed && !(deferred && result.remaining == 0);
        if !admitted {
            debug!(key = %key, cost = n, remaining = result.remaining, "Rejecting request");
            let response = rejection_response(Some(&result), self.clock.now(), &self.headers, &self.rejection);
            return RequestAction::Respond(response);
        }

        debug!(key = %key, cost = n, remaining = result.remaining, "Forwarding request");
        ctx.extensions.insert(RateLimitState { key, result });
        RequestAction::Forward
    }

    /// Charge deferred costs and attach rate limit headers to the response.
    #[instrument(skip(self, ctx, response), fields(route = %self.metadata.route_name, status = %response.status))]
    pub async fn on_response(&self, ctx: &mut RequestContext, response: &ResponseContext) -> ResponseAction {
        // Absent after a fail-open admission: there is no result to report.
        let Some(state) = ctx.extensions.remove::<RateLimitState>() else {
            return ResponseAction::default();
        };

        let result = match (&self.cost_extractor, self.is_deferred()) {
            (Some(extractor), true) => {
                let cost = extractor.extract(ctx, Some(response));
                match self.limiter.charge_n(&state.key, cost.units()).await {
                    Ok(result) => {
                        if !result.allowed {
                            warn!(
                                key = %state.key,
                                cost = cost.value,
                                limit = result.limit,
                                "Response cost exceeded rate limit after forwarding"
                            );
                        }
                        result
                    }
                    Err(e) => {
                        warn!(key = %state.key, error = %e, "Failed to charge response cost");
                        return ResponseAction::default();
                    }
                }
            }
            _ => state.result,
        };

        ResponseAction {
            headers_to_add: rate_limit_headers(&result, self.clock.now(), &self.headers),
        }
    }

    fn on_backend_failure(&self, key: &str, error: RatekeeperError) -> RequestAction {
        match self.failure_mode {
            FailureMode::Open => {
                warn!(key = %key, error = %error, "Rate limit backend unavailable, allowing request");
                RequestAction::Forward
            }
            FailureMode::Closed => {
                warn!(key = %key, error = %error, "Rate limit backend unavailable, rejecting request");
                RequestAction::Respond(rejection_response(
                    None,
                    self.clock.now(),
                    &self.headers,
                    &self.rejection,
                ))
            }
        }
    }

    /// Release the limiter unless it is shared through the cache.
    pub async fn close(&self) -> Result<()> {
        if self.shared {
            return Ok(());
        }
        debug!(route = %self.metadata.route_name, "Closing rate limit policy");
        self.limiter.close().await
    }
}
