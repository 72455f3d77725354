//! Request and response contexts exchanged with the policy host.

use std::collections::HashMap;

use http::{Extensions, HeaderMap, Method, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Static metadata describing where a policy instance is attached.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyMetadata {
    pub route_name: String,
    pub api_name: String,
    pub api_version: String,
}

/// What the host must parse or buffer before invoking the policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessingMode {
    pub request_headers: bool,
    pub buffer_request_body: bool,
    pub response_headers: bool,
    pub buffer_response_body: bool,
}

/// The in-flight request as seen by the policy.
#[derive(Debug, Default)]
pub struct RequestContext {
    pub method: Method,
    pub path: String,
    /// `:authority` / `Host` of the request
    pub authority: Option<String>,
    pub headers: HeaderMap,
    /// Buffered body, present only when requested through [`ProcessingMode`]
    pub body: Option<Vec<u8>>,
    /// Opaque per-request metadata shared between policies
    pub metadata: HashMap<String, Value>,
    /// Per-request state owned by policies
    pub extensions: Extensions,
}

impl RequestContext {
    /// Create a context for `method` and `path`.
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            ..Self::default()
        }
    }

    /// First value of a header, if present and valid UTF-8.
    pub fn header(&self, name: &str) -> Option<&str> {
        first_header(&self.headers, name)
    }

    /// Parse the buffered body as JSON.
    pub fn json_body(&self) -> Option<Value> {
        parse_json(self.body.as_deref())
    }
}

/// The upstream response, once available.
#[derive(Debug, Default)]
pub struct ResponseContext {
    pub status: StatusCode,
    pub headers: HeaderMap,
    /// Buffered body, present only when requested through [`ProcessingMode`]
    pub body: Option<Vec<u8>>,
}

impl ResponseContext {
    /// Create a response context with the given status.
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            ..Self::default()
        }
    }

    /// First value of a header, if present and valid UTF-8.
    pub fn header(&self, name: &str) -> Option<&str> {
        first_header(&self.headers, name)
    }

    /// Parse the buffered body as JSON.
    pub fn json_body(&self) -> Option<Value> {
        parse_json(self.body.as_deref())
    }
}

/// A response produced by the policy instead of forwarding upstream.
#[derive(Debug, Clone, PartialEq)]
pub struct ImmediateResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

/// Outcome of the request phase.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestAction {
    /// Forward the request upstream unchanged.
    Forward,
    /// Short-circuit with the given response.
    Respond(ImmediateResponse),
}

/// Outcome of the response phase.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResponseAction {
    /// Headers to add to the downstream response
    pub headers_to_add: HeaderMap,
}

fn first_header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

fn parse_json(body: Option<&[u8]>) -> Option<Value> {
    serde_json::from_slice(body?).ok()
}

/// Headers as a JSON map of lowercase name to first value.
pub(crate) fn headers_to_json(headers: &HeaderMap) -> Value {
    let mut map = serde_json::Map::new();
    for name in headers.keys() {
        if let Some(value) = first_header(headers, name.as_str()) {
            map.insert(name.as_str().to_string(), Value::String(value.to_string()));
        }
    }
    Value::Object(map)
}
