//! Policy host integration: contexts, actions and the rate limit policy.

pub mod context;
pub mod headers;
mod ratelimit;

pub use context::{
    ImmediateResponse, PolicyMetadata, ProcessingMode, RequestAction, RequestContext, ResponseAction,
    ResponseContext,
};
pub use ratelimit::{RateLimitPolicy, RateLimitState};
