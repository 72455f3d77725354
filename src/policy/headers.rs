//! Rate limit response headers and rejection responses.

use chrono::{DateTime, Utc};
use http::header::{HeaderName, CONTENT_TYPE, RETRY_AFTER};
use http::{HeaderMap, HeaderValue, StatusCode};
use std::time::Duration;

use super::context::ImmediateResponse;
use crate::config::{BodyFormat, HeaderConfig, RejectionConfig};
use crate::ratelimit::RateLimitResult;

pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");
pub const RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("ratelimit-limit");
pub const RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("ratelimit-remaining");
pub const RATELIMIT_RESET: HeaderName = HeaderName::from_static("ratelimit-reset");
pub const RATELIMIT_POLICY: HeaderName = HeaderName::from_static("ratelimit-policy");

const DEFAULT_MESSAGE: &str = "Rate limit exceeded. Please try again later.";

/// Whole seconds, rounded up.
fn ceil_secs(duration: Duration) -> u64 {
    let secs = duration.as_secs();
    if duration.subsec_nanos() > 0 {
        secs + 1
    } else {
        secs
    }
}

/// Headers describing the quota state in `result`.
pub fn rate_limit_headers(result: &RateLimitResult, now: DateTime<Utc>, config: &HeaderConfig) -> HeaderMap {
    let mut headers = HeaderMap::new();

    if config.include_x_rate_limit {
        let reset_unix = ceil_secs(Duration::from_micros(result.reset.timestamp_micros().max(0) as u64));
        headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(result.limit));
        headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(result.remaining));
        headers.insert(X_RATELIMIT_RESET, HeaderValue::from(reset_unix));
    }

    if config.include_ietf {
        let policy = format!("{};w={}", result.limit, result.limit_ref.window_secs());
        headers.insert(RATELIMIT_LIMIT, HeaderValue::from(result.limit));
        headers.insert(RATELIMIT_REMAINING, HeaderValue::from(result.remaining));
        headers.insert(RATELIMIT_RESET, HeaderValue::from(ceil_secs(result.reset_after(now))));
        if let Ok(value) = HeaderValue::from_str(&policy) {
            headers.insert(RATELIMIT_POLICY, value);
        }
    }

    headers
}

/// Seconds a rejected client should wait, never less than one.
pub fn retry_after_secs(result: &RateLimitResult, now: DateTime<Utc>) -> u64 {
    let wait = if result.retry_after.is_zero() {
        result.reset_after(now)
    } else {
        result.retry_after
    };
    ceil_secs(wait).max(1)
}

/// Build the rejection response.
///
/// `result` is absent when the backend failed and no quota state is known;
/// the response then carries no rate limit headers.
pub fn rejection_response(
    result: Option<&RateLimitResult>,
    now: DateTime<Utc>,
    headers: &HeaderConfig,
    rejection: &RejectionConfig,
) -> ImmediateResponse {
    let mut response_headers = match result {
        Some(result) => rate_limit_headers(result, now, headers),
        None => HeaderMap::new(),
    };

    if let (Some(result), true) = (result, headers.include_retry_after) {
        response_headers.insert(RETRY_AFTER, HeaderValue::from(retry_after_secs(result, now)));
    }

    let (content_type, body) = match rejection.body_format {
        BodyFormat::Json => (
            "application/json",
            rejection.body.clone().unwrap_or_else(|| {
                serde_json::json!({
                    "error": "Too Many Requests",
                    "message": DEFAULT_MESSAGE,
                })
                .to_string()
            }),
        ),
        BodyFormat::Plain => (
            "text/plain",
            rejection.body.clone().unwrap_or_else(|| DEFAULT_MESSAGE.to_string()),
        ),
    };
    response_headers.insert(CONTENT_TYPE, HeaderValue::from_static(content_type));

    ImmediateResponse {
        status: StatusCode::from_u16(rejection.status_code).unwrap_or(StatusCode::TOO_MANY_REQUESTS),
        headers: response_headers,
        body: body.into_bytes(),
    }
}
