//! Request cost extraction.
//!
//! Each configured source is tried independently. Sources whose phase has
//! data available are scaled by their multiplier and summed; when none
//! yields a value the configured default applies.

use serde_json::Value;
use tracing::trace;

use super::expr::{self, Expression};
use super::jsonpath::JsonPath;
use super::key::request_facts;
use crate::config::{CostExtractionConfig, CostSourceKind};
use crate::error::{RatekeeperError, Result};
use crate::policy::context::{headers_to_json, RequestContext, ResponseContext};

#[derive(Debug, Clone)]
enum Reader {
    RequestHeader(String),
    RequestMetadata(String),
    RequestBody(JsonPath),
    RequestCel(Expression),
    ResponseHeader(String),
    ResponseMetadata(String),
    ResponseBody(JsonPath),
    ResponseCel(Expression),
}

impl Reader {
    fn is_response_phase(&self) -> bool {
        matches!(
            self,
            Reader::ResponseHeader(_)
                | Reader::ResponseMetadata(_)
                | Reader::ResponseBody(_)
                | Reader::ResponseCel(_)
        )
    }
}

#[derive(Debug, Clone)]
struct Source {
    reader: Reader,
    multiplier: f64,
}

/// An extracted cost.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Cost {
    pub value: f64,
    /// `false` when the default was used because no source produced a value
    pub derived: bool,
}

impl Cost {
    /// Whole units to consume: negative costs consume nothing and fractions round up.
    pub fn units(&self) -> u64 {
        if self.value.is_finite() && self.value > 0.0 {
            self.value.ceil() as u64
        } else {
            0
        }
    }
}

/// Turns a request and/or response into a consumption amount.
#[derive(Debug, Clone)]
pub struct CostExtractor {
    sources: Vec<Source>,
    default: f64,
}

impl CostExtractor {
    /// Compile a cost extraction configuration.
    pub fn new(config: &CostExtractionConfig) -> Result<Self> {
        let sources = config
            .sources
            .iter()
            .map(|source| {
                let reader = match &source.kind {
                    CostSourceKind::RequestHeader { key } => Reader::RequestHeader(key.clone()),
                    CostSourceKind::RequestMetadata { key } => Reader::RequestMetadata(key.clone()),
                    CostSourceKind::RequestBody { json_path } => {
                        Reader::RequestBody(JsonPath::parse(json_path)?)
                    }
                    CostSourceKind::RequestCel { expression } => {
                        Reader::RequestCel(Expression::parse(expression)?)
                    }
                    CostSourceKind::ResponseHeader { key } => Reader::ResponseHeader(key.clone()),
                    CostSourceKind::ResponseMetadata { key } => {
                        Reader::ResponseMetadata(key.clone())
                    }
                    CostSourceKind::ResponseBody { json_path } => {
                        Reader::ResponseBody(JsonPath::parse(json_path)?)
                    }
                    CostSourceKind::ResponseCel { expression } => {
                        Reader::ResponseCel(Expression::parse(expression)?)
                    }
                };
                Ok(Source {
                    reader,
                    multiplier: source.multiplier,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            sources,
            default: config.default,
        })
    }

    /// Whether any source needs the response, forcing a two-phase decision.
    pub fn is_deferred(&self) -> bool {
        self.sources.iter().any(|s| s.reader.is_response_phase())
    }

    /// Whether the host must buffer the request body.
    ///
    /// True for `request_body` sources and for expressions that read
    /// `request.body`.
    pub fn needs_request_body(&self) -> bool {
        self.sources.iter().any(|s| match &s.reader {
            Reader::RequestBody(_) => true,
            Reader::RequestCel(e) | Reader::ResponseCel(e) => e.references("request", "body"),
            _ => false,
        })
    }

    /// Whether the host must buffer the response body.
    pub fn needs_response_body(&self) -> bool {
        self.sources.iter().any(|s| match &s.reader {
            Reader::ResponseBody(_) => true,
            Reader::ResponseCel(e) => e.references("response", "body"),
            _ => false,
        })
    }

    /// Extract the cost from whatever phases have data.
    pub fn extract(&self, request: &RequestContext, response: Option<&ResponseContext>) -> Cost {
        let mut total = 0.0;
        let mut derived = false;

        for source in &self.sources {
            if source.reader.is_response_phase() && response.is_none() {
                continue;
            }
            match read(&source.reader, request, response) {
                Ok(value) => {
                    total += value * source.multiplier;
                    derived = true;
                }
                Err(e) => {
                    trace!(error = %e, "Cost source yielded no value");
                }
            }
        }

        if derived {
            Cost {
                value: total,
                derived: true,
            }
        } else {
            Cost {
                value: self.default,
                derived: false,
            }
        }
    }
}

fn read(reader: &Reader, request: &RequestContext, response: Option<&ResponseContext>) -> Result<f64> {
    match reader {
        Reader::RequestHeader(name) => parse_number(request.header(name), name),
        Reader::RequestMetadata(name) | Reader::ResponseMetadata(name) => {
            metadata_number(request.metadata.get(name), name)
        }
        Reader::RequestBody(path) => body_number(request.json_body(), path),
        Reader::RequestCel(expression) => expression_number(expression, request_facts(request)),
        Reader::ResponseHeader(name) => {
            parse_number(response.and_then(|r| r.header(name)), name)
        }
        Reader::ResponseBody(path) => body_number(response.and_then(|r| r.json_body()), path),
        Reader::ResponseCel(expression) => {
            let facts = match response {
                Some(response) => with_response(request_facts(request), response),
                None => request_facts(request),
            };
            expression_number(expression, facts)
        }
    }
}

fn parse_number(raw: Option<&str>, name: &str) -> Result<f64> {
    let raw = raw.ok_or_else(|| RatekeeperError::Extraction(format!("header {} missing", name)))?;
    raw.trim()
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| RatekeeperError::Extraction(format!("header {} is not numeric", name)))
}

fn metadata_number(value: Option<&Value>, name: &str) -> Result<f64> {
    value
        .and_then(value_as_number)
        .ok_or_else(|| RatekeeperError::Extraction(format!("metadata {} is not numeric", name)))
}

fn body_number(body: Option<Value>, path: &JsonPath) -> Result<f64> {
    let body = body.ok_or_else(|| RatekeeperError::Extraction("body is not JSON".into()))?;
    path.select(&body)
        .and_then(value_as_number)
        .ok_or_else(|| RatekeeperError::Extraction(format!("{:?} is not numeric", path)))
}

fn expression_number(expression: &Expression, facts: Value) -> Result<f64> {
    let value = expression.evaluate(&facts)?;
    value
        .as_f64()
        .filter(|v| v.is_finite())
        .ok_or_else(|| {
            RatekeeperError::Extraction(format!(
                "expression {:?} returned non-numeric {}",
                expression.source(),
                value
            ))
        })
}

fn value_as_number(value: &Value) -> Option<f64> {
    let number = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    };
    number.filter(|v: &f64| v.is_finite())
}

fn with_response(mut facts: Value, response: &ResponseContext) -> Value {
    if let Value::Object(map) = &mut facts {
        map.insert(
            "response".to_string(),
            serde_json::json!({
                "status": response.status.as_u16(),
                "headers": headers_to_json(&response.headers),
                "body": response.json_body().unwrap_or(Value::Null),
            }),
        );
    }
    facts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CostSource;
    use http::{HeaderValue, Method, StatusCode};

    fn source(kind: CostSourceKind, multiplier: f64) -> CostSource {
        CostSource { kind, multiplier }
    }

    fn create_extractor(sources: Vec<CostSource>, default: f64) -> CostExtractor {
        CostExtractor::new(&CostExtractionConfig {
            enabled: true,
            sources,
            default,
        })
        .unwrap()
    }

    fn create_response(body: &str) -> ResponseContext {
        let mut response = ResponseContext::new(StatusCode::OK);
        response.body = Some(body.as_bytes().to_vec());
        response
    }

    #[test]
    fn test_request_header_with_multiplier() {
        let extractor = create_extractor(
            vec![source(
                CostSourceKind::RequestHeader {
                    key: "X-Cost".into(),
                },
                2.5,
            )],
            1.0,
        );
        let mut request = RequestContext::new(Method::GET, "/");
        request.headers.insert("x-cost", HeaderValue::from_static("4"));

        let cost = extractor.extract(&request, None);
        assert_eq!(cost, Cost { value: 10.0, derived: true });
        assert!(!extractor.is_deferred());
    }

    #[test]
    fn test_sources_are_summed() {
        let extractor = create_extractor(
            vec![
                source(
                    CostSourceKind::RequestMetadata {
                        key: "weight".into(),
                    },
                    1.0,
                ),
                source(
                    CostSourceKind::ResponseBody {
                        json_path: "$.usage.total_tokens".into(),
                    },
                    0.1,
                ),
            ],
            1.0,
        );
        let mut request = RequestContext::new(Method::POST, "/");
        request.metadata.insert("weight".into(), serde_json::json!("3"));
        let response = create_response(r#"{"usage": {"total_tokens": 120}}"#);

        assert!(extractor.is_deferred());
        assert!(extractor.needs_response_body());
        assert!(!extractor.needs_request_body());

        // the response source is skipped until a response exists
        assert_eq!(extractor.extract(&request, None).value, 3.0);
        assert_eq!(extractor.extract(&request, Some(&response)).value, 15.0);
    }

    #[test]
    fn test_default_when_nothing_resolves() {
        let extractor = create_extractor(
            vec![
                source(
                    CostSourceKind::RequestHeader {
                        key: "x-cost".into(),
                    },
                    1.0,
                ),
                source(
                    CostSourceKind::RequestBody {
                        json_path: "$.tokens".into(),
                    },
                    1.0,
                ),
            ],
            7.0,
        );
        let mut request = RequestContext::new(Method::POST, "/");
        request.headers.insert("x-cost", HeaderValue::from_static("lots"));
        request.body = Some(b"{\"tokens\": \"many\"}".to_vec());

        assert_eq!(extractor.extract(&request, None), Cost { value: 7.0, derived: false });
    }

    #[test]
    fn test_expression_failure_only_skips_that_source() {
        let extractor = create_extractor(
            vec![
                source(
                    CostSourceKind::ResponseCel {
                        expression: "response.status == 200".into(),
                    },
                    1.0,
                ),
                source(
                    CostSourceKind::ResponseCel {
                        expression: "response.body.usage.completion_tokens * 2".into(),
                    },
                    1.0,
                ),
                source(
                    CostSourceKind::ResponseHeader {
                        key: "x-upstream-cost".into(),
                    },
                    1.0,
                ),
            ],
            1.0,
        );
        let request = RequestContext::new(Method::POST, "/");
        let mut response = create_response(r#"{"usage": {"completion_tokens": 21}}"#);
        response
            .headers
            .insert("x-upstream-cost", HeaderValue::from_static("0.5"));

        let cost = extractor.extract(&request, Some(&response));
        assert_eq!(cost, Cost { value: 42.5, derived: true });
    }

    #[test]
    fn test_request_cel_reads_request_body() {
        let extractor = create_extractor(
            vec![source(
                CostSourceKind::RequestCel {
                    expression: "size(request.body.messages) * 10".into(),
                },
                1.0,
            )],
            1.0,
        );
        let mut request = RequestContext::new(Method::POST, "/");
        request.body = Some(br#"{"messages": ["a", "b"]}"#.to_vec());

        assert!(extractor.needs_request_body());
        assert_eq!(extractor.extract(&request, None).value, 20.0);
    }

    #[test]
    fn test_expressions_buffer_only_the_bodies_they_read() {
        let extractor = create_extractor(
            vec![
                source(
                    CostSourceKind::RequestCel {
                        expression: "int(request.headers['x-tokens'])".into(),
                    },
                    1.0,
                ),
                source(
                    CostSourceKind::ResponseCel {
                        expression: "response.status == 200 ? 1 : 0".into(),
                    },
                    1.0,
                ),
            ],
            1.0,
        );
        assert!(!extractor.needs_request_body());
        assert!(!extractor.needs_response_body());

        let extractor = create_extractor(
            vec![source(
                CostSourceKind::ResponseCel {
                    expression: "size(request.body.messages) + response.body.usage.total_tokens".into(),
                },
                1.0,
            )],
            1.0,
        );
        assert!(extractor.needs_request_body());
        assert!(extractor.needs_response_body());
    }

    #[test]
    fn test_units_round_up() {
        assert_eq!(Cost { value: 1.2, derived: true }.units(), 2);
        assert_eq!(Cost { value: 3.0, derived: true }.units(), 3);
        assert_eq!(Cost { value: -4.0, derived: true }.units(), 0);
        assert_eq!(Cost { value: 0.0, derived: false }.units(), 0);
    }

    #[test]
    fn test_invalid_json_path_fails_construction() {
        let result = CostExtractor::new(&CostExtractionConfig {
            enabled: true,
            sources: vec![source(
                CostSourceKind::RequestBody {
                    json_path: "$.a[".into(),
                },
                1.0,
            )],
            default: 1.0,
        });
        assert!(matches!(result, Err(RatekeeperError::Config(_))));
    }
}
