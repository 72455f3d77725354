//! Bucket key extraction.
//!
//! The bucket key is built from an ordered list of [`KeyComponent`]s. A single
//! component is used as-is; several are joined with `:`. Reordering the
//! components changes every key and therefore resets existing counters.

use serde_json::Value;
use tracing::trace;

use super::expr::{self, Expression};
use crate::config::KeyComponent;
use crate::error::Result;
use crate::policy::context::{headers_to_json, PolicyMetadata, RequestContext};

/// Separator between key components.
const SEPARATOR: &str = ":";
/// Value used when no client address can be determined.
const UNKNOWN_IP: &str = "unknown";
/// Value used when an expression component fails to evaluate.
const CEL_ERROR: &str = "_cel_error_";

#[derive(Debug, Clone)]
enum Resolver {
    Header(String),
    Metadata(String),
    Ip,
    Static(String),
    Cel(Expression),
}

/// Turns a request into its bucket key.
#[derive(Debug, Clone)]
pub struct KeyExtractor {
    resolvers: Vec<Resolver>,
}

impl KeyExtractor {
    /// Compile key components for a policy attached at `metadata`.
    pub fn new(components: &[KeyComponent], metadata: &PolicyMetadata) -> Result<Self> {
        let resolvers = components
            .iter()
            .map(|component| {
                Ok(match component {
                    KeyComponent::Header { key } => Resolver::Header(key.clone()),
                    KeyComponent::Metadata { key } => Resolver::Metadata(key.clone()),
                    KeyComponent::Ip => Resolver::Ip,
                    KeyComponent::ApiName => Resolver::Static(metadata.api_name.clone()),
                    KeyComponent::ApiVersion => Resolver::Static(metadata.api_version.clone()),
                    KeyComponent::RouteName => Resolver::Static(metadata.route_name.clone()),
                    KeyComponent::Constant { key } => Resolver::Static(key.clone()),
                    KeyComponent::Cel { expression } => Resolver::Cel(Expression::parse(expression)?),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { resolvers })
    }

    /// Whether a `cel` component reads `request.body`, so the host must buffer it.
    pub fn needs_request_body(&self) -> bool {
        self.resolvers
            .iter()
            .any(|resolver| matches!(resolver, Resolver::Cel(e) if e.references("request", "body")))
    }

    /// Build the bucket key for a request.
    pub fn extract(&self, ctx: &RequestContext) -> String {
        let key = match self.resolvers.as_slice() {
            [single] => resolve(single, ctx),
            resolvers => resolvers
                .iter()
                .map(|resolver| resolve(resolver, ctx))
                .collect::<Vec<_>>()
                .join(SEPARATOR),
        };
        trace!(key = %key, "Extracted bucket key");
        key
    }
}

fn resolve(resolver: &Resolver, ctx: &RequestContext) -> String {
    match resolver {
        Resolver::Header(name) => ctx
            .header(name)
            .map(str::to_string)
            .unwrap_or_else(|| format!("_missing_header_{}_", name)),
        Resolver::Metadata(name) => match ctx.metadata.get(name) {
            Some(Value::String(value)) => value.clone(),
            _ => format!("_missing_metadata_{}_", name),
        },
        Resolver::Ip => client_ip(ctx),
        Resolver::Static(value) => value.clone(),
        Resolver::Cel(expression) => match expression.evaluate(&request_facts(ctx)) {
            Ok(Value::String(value)) => value,
            Ok(value @ (Value::Number(_) | Value::Bool(_))) => expr::to_display(&value),
            Ok(_) | Err(_) => {
                trace!(expression = expression.source(), "Key expression did not yield a scalar");
                CEL_ERROR.to_string()
            }
        },
    }
}

/// Resolve the client address from forwarding headers, then the authority.
pub fn client_ip(ctx: &RequestContext) -> String {
    if let Some(first_hop) = ctx
        .header("x-forwarded-for")
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|hop| !hop.is_empty())
    {
        return first_hop.to_string();
    }

    if let Some(real_ip) = ctx
        .header("x-real-ip")
        .map(str::trim)
        .filter(|ip| !ip.is_empty())
    {
        return real_ip.to_string();
    }

    ctx.authority
        .as_deref()
        .map(host_of)
        .filter(|host| !host.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| UNKNOWN_IP.to_string())
}

/// Strip the port from an authority, keeping bracketed IPv6 hosts intact.
fn host_of(authority: &str) -> &str {
    let authority = authority.rsplit('@').next().unwrap_or(authority);
    if let Some(rest) = authority.strip_prefix('[') {
        return rest.split(']').next().unwrap_or(rest);
    }
    match authority.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => host,
        _ => authority,
    }
}

/// Facts visible to request-phase expressions.
pub(crate) fn request_facts(ctx: &RequestContext) -> Value {
    let request = serde_json::json!({
        "method": ctx.method.as_str(),
        "path": ctx.path,
        "headers": headers_to_json(&ctx.headers),
        "metadata": ctx.metadata,
        "body": ctx.json_body().unwrap_or(Value::Null),
        "ip": client_ip(ctx),
    });
    expr::activation([("request", request)])
}
