//! Configuration management for Ratekeeper.
//!
//! Two layers of configuration exist:
//!
//! - [`SystemConfig`]: deployment-wide defaults (algorithm, backend, store
//!   connection, header toggles), loaded once at process start.
//! - [`RouteConfig`]: the per-route policy parameters handed over by the
//!   policy host as an untyped map. [`RouteConfig::parse`] validates them into
//!   a typed [`Quota`] in a single step.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{RatekeeperError, Result};
use crate::ratelimit::Limit;

/// Main configuration for the Ratekeeper engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemConfig {
    /// Throttling algorithm
    #[serde(default)]
    pub algorithm: Algorithm,

    /// Where bucket state lives
    #[serde(default)]
    pub backend: BackendKind,

    /// External store connection
    #[serde(default)]
    pub redis: RedisConfig,

    /// Process-local store settings
    #[serde(default)]
    pub memory: MemoryConfig,

    /// Which rate-limit headers to emit
    #[serde(default)]
    pub headers: HeaderConfig,
}

/// Throttling algorithm.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Algorithm {
    /// Generic Cell Rate Algorithm
    #[default]
    Gcra,
    /// Discrete fixed-window counter
    FixedWindow,
}

/// Storage backend for bucket state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Process-local memory
    #[default]
    Memory,
    /// Shared Redis instance
    Redis,
}

/// Admission policy when the external store is unreachable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureMode {
    /// Let requests through without headers
    #[default]
    Open,
    /// Reject requests with the configured rejection response
    Closed,
}

/// Redis connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RedisConfig {
    #[serde(default = "default_redis_host")]
    pub host: String,

    #[serde(default = "default_redis_port")]
    pub port: u16,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    /// Logical database index
    #[serde(default)]
    pub db: i64,

    /// Prefix for every bucket key written to the store
    #[serde(default = "default_key_prefix", alias = "keyprefix")]
    pub key_prefix: String,

    #[serde(default, alias = "failuremode")]
    pub failure_mode: FailureMode,

    #[serde(default = "default_connect_timeout", alias = "connecttimeout", with = "duration_str")]
    pub connect_timeout: Duration,

    #[serde(default = "default_io_timeout", alias = "readtimeout", with = "duration_str")]
    pub read_timeout: Duration,

    #[serde(default = "default_io_timeout", alias = "writetimeout", with = "duration_str")]
    pub write_timeout: Duration,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            host: default_redis_host(),
            port: default_redis_port(),
            username: None,
            password: None,
            db: 0,
            key_prefix: default_key_prefix(),
            failure_mode: FailureMode::default(),
            connect_timeout: default_connect_timeout(),
            read_timeout: default_io_timeout(),
            write_timeout: default_io_timeout(),
        }
    }
}

impl RedisConfig {
    /// Check the connection parameters without connecting.
    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(RatekeeperError::Config("redis host must not be empty".into()));
        }
        if self.port == 0 {
            return Err(RatekeeperError::Config("redis port must not be zero".into()));
        }
        if self.db < 0 {
            return Err(RatekeeperError::Config(format!(
                "redis db index must not be negative, got {}",
                self.db
            )));
        }
        for (name, timeout) in [
            ("connectTimeout", self.connect_timeout),
            ("readTimeout", self.read_timeout),
            ("writeTimeout", self.write_timeout),
        ] {
            if timeout.is_zero() {
                return Err(RatekeeperError::Config(format!("redis {} must be positive", name)));
            }
        }
        Ok(())
    }

    /// Deadline for one round trip to the store.
    pub fn operation_timeout(&self) -> Duration {
        self.write_timeout + self.read_timeout
    }
}

fn default_redis_host() -> String {
    "localhost".to_string()
}

fn default_redis_port() -> u16 {
    6379
}

fn default_key_prefix() -> String {
    "ratelimit:".to_string()
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_io_timeout() -> Duration {
    Duration::from_secs(3)
}

/// Process-local store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryConfig {
    /// Upper bound on tracked keys per limiter
    #[serde(default = "default_max_entries", alias = "maxentries")]
    pub max_entries: usize,

    /// How often expired entries are swept
    #[serde(default = "default_cleanup_interval", alias = "cleanupinterval", with = "duration_str")]
    pub cleanup_interval: Duration,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_entries: default_max_entries(),
            cleanup_interval: default_cleanup_interval(),
        }
    }
}

fn default_max_entries() -> usize {
    10000
}

fn default_cleanup_interval() -> Duration {
    Duration::from_secs(60)
}

/// Header emission toggles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeaderConfig {
    /// `X-RateLimit-*`
    #[serde(default = "default_true", alias = "includexratelimit")]
    pub include_x_rate_limit: bool,

    /// `RateLimit-*` and `RateLimit-Policy`
    #[serde(default = "default_true", rename = "includeIETF", alias = "includeietf")]
    pub include_ietf: bool,

    /// `Retry-After` on rejections
    #[serde(default = "default_true", alias = "includeretryafter")]
    pub include_retry_after: bool,
}

impl Default for HeaderConfig {
    fn default() -> Self {
        Self {
            include_x_rate_limit: true,
            include_ietf: true,
            include_retry_after: true,
        }
    }
}

fn default_true() -> bool {
    true
}

impl SystemConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading system configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| RatekeeperError::Config(format!("Failed to parse system config: {}", e)))
    }

    /// Load configuration from an optional file layered under
    /// `RATEKEEPER__*` environment variables.
    ///
    /// The `config` crate folds keys to lowercase, so every camelCase field
    /// also accepts its lowercase spelling (`RATEKEEPER__REDIS__FAILUREMODE`).
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            info!(path = %path.display(), "Loading system configuration");
            builder = builder.add_source(config::File::from(path));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("RATEKEEPER")
                .prefix_separator("__")
                .separator("__"),
        );

        builder
            .build()
            .and_then(|cfg| cfg.try_deserialize())
            .map_err(|e| RatekeeperError::Config(format!("Failed to load system config: {}", e)))
    }
}

/// Per-route policy parameters, as supplied by the policy host.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteConfig {
    /// Limit tiers, enforced together
    #[serde(default)]
    pub limits: Vec<LimitConfig>,

    /// Ordered bucket key components
    #[serde(default)]
    pub key_extraction: Vec<KeyComponent>,

    #[serde(default)]
    pub cost_extraction: Option<CostExtractionConfig>,

    #[serde(default)]
    pub on_rate_limit_exceeded: RejectionConfig,
}

/// A single limit tier as written in configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitConfig {
    /// Requests allowed per duration
    pub limit: u64,
    /// Window length, e.g. `1s`, `1m`, `1h30m`
    pub duration: String,
    /// Back-to-back allowance (GCRA only); defaults to `limit`
    #[serde(default)]
    pub burst: Option<u64>,
}

/// One component of the bucket key. Order is significant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum KeyComponent {
    /// First value of a request header (case-insensitive)
    Header { key: String },
    /// A string entry of the per-request metadata map
    Metadata { key: String },
    /// The client address
    Ip,
    /// The API name of the attachment
    ApiName,
    /// The API version of the attachment
    ApiVersion,
    /// The route name of the attachment
    RouteName,
    /// A fixed value
    Constant {
        #[serde(alias = "value")]
        key: String,
    },
    /// An expression evaluated against the request
    Cel { expression: String },
}

/// Cost extraction configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CostExtractionConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub sources: Vec<CostSource>,

    /// Cost used when no source yields a value
    #[serde(default = "default_cost")]
    pub default: f64,
}

fn default_cost() -> f64 {
    1.0
}

/// One typed source of request cost, scaled by its multiplier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostSource {
    #[serde(flatten)]
    pub kind: CostSourceKind,

    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

fn default_multiplier() -> f64 {
    1.0
}

/// Where a cost value is read from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CostSourceKind {
    RequestHeader { key: String },
    RequestMetadata { key: String },
    RequestBody {
        #[serde(rename = "jsonPath")]
        json_path: String,
    },
    ResponseHeader { key: String },
    ResponseMetadata { key: String },
    ResponseBody {
        #[serde(rename = "jsonPath")]
        json_path: String,
    },
    RequestCel { expression: String },
    ResponseCel { expression: String },
}

impl CostSourceKind {
    /// Whether this source can only be read once the response exists.
    pub fn is_response_phase(&self) -> bool {
        matches!(
            self,
            CostSourceKind::ResponseHeader { .. }
                | CostSourceKind::ResponseMetadata { .. }
                | CostSourceKind::ResponseBody { .. }
                | CostSourceKind::ResponseCel { .. }
        )
    }
}

/// Rejection response configuration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectionConfig {
    #[serde(default = "default_status_code")]
    pub status_code: u16,

    /// Response body; a default message is used when unset
    #[serde(default)]
    pub body: Option<String>,

    #[serde(default)]
    pub body_format: BodyFormat,
}

impl Default for RejectionConfig {
    fn default() -> Self {
        Self {
            status_code: default_status_code(),
            body: None,
            body_format: BodyFormat::default(),
        }
    }
}

fn default_status_code() -> u16 {
    429
}

/// Rejection body encoding.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BodyFormat {
    #[default]
    Json,
    Plain,
}

/// A validated quota: the typed form of a [`RouteConfig`].
#[derive(Debug, Clone)]
pub struct Quota {
    pub limits: Vec<Limit>,
    pub key_components: Vec<KeyComponent>,
    /// Present only when cost extraction is enabled
    pub cost: Option<CostExtractionConfig>,
    pub rejection: RejectionConfig,
}

impl RouteConfig {
    /// Deserialize route parameters from an untyped map.
    pub fn from_value(value: &serde_json::Value) -> Result<Self> {
        serde_json::from_value(value.clone())
            .map_err(|e| RatekeeperError::Config(format!("Failed to parse route config: {}", e)))
    }

    /// Deserialize route parameters from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| RatekeeperError::Config(format!("Failed to parse route config: {}", e)))
    }

    /// Parse and validate route parameters in one step.
    pub fn parse(value: &serde_json::Value) -> Result<Quota> {
        Self::from_value(value)?.validate()
    }

    /// Validate into a typed [`Quota`].
    ///
    /// Expressions and JSON paths are compiled later by the extractors, which
    /// report their own configuration errors.
    pub fn validate(self) -> Result<Quota> {
        if self.limits.is_empty() {
            return Err(RatekeeperError::Config("limits must not be empty".into()));
        }

        let limits = self
            .limits
            .iter()
            .enumerate()
            .map(|(index, limit)| limit.to_limit(index))
            .collect::<Result<Vec<_>>>()?;

        let key_components = if self.key_extraction.is_empty() {
            vec![KeyComponent::RouteName]
        } else {
            self.key_extraction
        };
        for component in &key_components {
            validate_key_component(component)?;
        }

        let cost = match self.cost_extraction {
            Some(cost) if cost.enabled => {
                validate_cost(&cost)?;
                Some(cost)
            }
            _ => None,
        };

        let rejection = self.on_rate_limit_exceeded;
        if !(100..=599).contains(&rejection.status_code) {
            return Err(RatekeeperError::Config(format!(
                "onRateLimitExceeded.statusCode {} is not a valid HTTP status",
                rejection.status_code
            )));
        }

        Ok(Quota {
            limits,
            key_components,
            cost,
            rejection,
        })
    }
}

impl LimitConfig {
    fn to_limit(&self, index: usize) -> Result<Limit> {
        if self.limit == 0 {
            return Err(RatekeeperError::Config(format!(
                "limits[{}].limit must be positive",
                index
            )));
        }
        let window = parse_duration(&self.duration).map_err(|e| {
            RatekeeperError::Config(format!("limits[{}].duration: {}", index, e))
        })?;
        if window.is_zero() {
            return Err(RatekeeperError::Config(format!(
                "limits[{}].duration must be positive",
                index
            )));
        }

        // GCRA spaces requests in whole microseconds.
        if u128::from(self.limit) > window.as_micros() {
            return Err(RatekeeperError::Config(format!(
                "limits[{}]: {} per {} is finer than one request per microsecond",
                index, self.limit, self.duration
            )));
        }

        let limit = Limit::new(self.limit, window);
        match self.burst {
            Some(0) => Err(RatekeeperError::Config(format!(
                "limits[{}].burst must be positive",
                index
            ))),
            Some(burst) => Ok(limit.with_burst(burst)),
            None => Ok(limit),
        }
    }
}

fn validate_key_component(component: &KeyComponent) -> Result<()> {
    let empty = match component {
        KeyComponent::Header { key } | KeyComponent::Metadata { key } => key.trim().is_empty(),
        KeyComponent::Cel { expression } => expression.trim().is_empty(),
        _ => false,
    };
    if empty {
        return Err(RatekeeperError::Config(format!(
            "keyExtraction component {:?} is missing its key",
            component
        )));
    }
    Ok(())
}

fn validate_cost(cost: &CostExtractionConfig) -> Result<()> {
    if !cost.default.is_finite() || cost.default < 0.0 {
        return Err(RatekeeperError::Config(format!(
            "costExtraction.default must be a non-negative number, got {}",
            cost.default
        )));
    }
    for (index, source) in cost.sources.iter().enumerate() {
        if !source.multiplier.is_finite() {
            return Err(RatekeeperError::Config(format!(
                "costExtraction.sources[{}].multiplier must be finite",
                index
            )));
        }
        let field = match &source.kind {
            CostSourceKind::RequestHeader { key }
            | CostSourceKind::RequestMetadata { key }
            | CostSourceKind::ResponseHeader { key }
            | CostSourceKind::ResponseMetadata { key } => key,
            CostSourceKind::RequestBody { json_path } | CostSourceKind::ResponseBody { json_path } => {
                json_path
            }
            CostSourceKind::RequestCel { expression } | CostSourceKind::ResponseCel { expression } => {
                expression
            }
        };
        if field.trim().is_empty() {
            return Err(RatekeeperError::Config(format!(
                "costExtraction.sources[{}] is missing its key",
                index
            )));
        }
    }
    Ok(())
}

/// Parse a human duration such as `1s`, `500ms` or `1h30m`.
pub fn parse_duration(value: &str) -> std::result::Result<Duration, humantime::DurationError> {
    humantime::parse_duration(value.trim())
}

/// Serde adapter for human-readable durations.
mod duration_str {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        super::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}
