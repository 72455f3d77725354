//! Redis-backed limiter.
//!
//! Each decision is a single `EVALSHA` of a Lua script that performs the
//! same integer arithmetic as [`gcra::decide`] / [`fixed_window::decide`], so
//! the read-modify-write is atomic across every gateway process sharing the
//! store. Keys are `<prefix><gcra|fw>:<bucket>` and expire through the
//! store's own TTL.

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{Client, ConnectionAddr, ConnectionInfo, RedisConnectionInfo};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info, trace, warn};

use super::backend::{Limiter, Mode};
use super::fixed_window;
use super::gcra;
use super::result::{Limit, RateLimitResult};
use crate::clock::Clock;
use crate::config::{Algorithm, RedisConfig};
use crate::error::{RatekeeperError, Result};

/// GCRA decision.
///
/// KEYS: bucket. ARGV: now, emission interval, burst, window, n, charge.
/// Returns `{allowed, remaining, tat, retry_after}`.
pub(crate) const GCRA_SCRIPT: &str = r#"
local key = KEYS[1]
local now = tonumber(ARGV[1])
local interval = tonumber(ARGV[2])
local burst = tonumber(ARGV[3])
local window = tonumber(ARGV[4])
local n = tonumber(ARGV[5])
local charge = tonumber(ARGV[6])
local allowance = interval * burst

local tat = now
local stored = redis.call('GET', key)
if stored then
  tat = math.max(tonumber(stored), now)
end

local function remaining_at(t)
  local used = 0
  if t > now then
    used = math.ceil((t - now) / interval)
  end
  local left = burst - used
  if left < 0 then left = 0 end
  if left > burst then left = burst end
  return left
end

local earliest = tat + interval - allowance
local remaining = remaining_at(tat)
local allowed = 1
local retry = 0
if now < earliest then
  allowed = 0
  retry = earliest - now
elseif n > remaining then
  allowed = 0
end

if n == 0 or (allowed == 0 and charge == 0) then
  return {allowed, remaining, tat, retry}
end

local new_tat = tat + interval * n
local expiration = math.max(now + window + allowance, new_tat)
redis.call('SET', key, string.format('%d', new_tat), 'PX', math.ceil((expiration - now) / 1000))

if allowed == 0 then
  retry = math.max(new_tat + interval - allowance - now, 0)
end
return {allowed, remaining_at(new_tat), new_tat, retry}
"#;

/// Fixed window decision.
///
/// KEYS: bucket. ARGV: now, window, threshold, n, charge.
/// Returns `{allowed, count, window_start}`.
pub(crate) const FIXED_WINDOW_SCRIPT: &str = r#"
local key = KEYS[1]
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local threshold = tonumber(ARGV[3])
local n = tonumber(ARGV[4])
local charge = tonumber(ARGV[5])
local start = now - (now % window)

local count = 0
local stored = redis.call('HMGET', key, 'count', 'start')
if stored[1] and tonumber(stored[2]) == start then
  count = tonumber(stored[1])
end

local allowed = 0
if count + n <= threshold then
  allowed = 1
end

if n == 0 or (allowed == 0 and charge == 0) then
  return {allowed, count, start}
end

count = count + n
redis.call('HSET', key, 'count', count, 'start', string.format('%d', start))
redis.call('PEXPIRE', key, math.ceil((start + window - now) / 1000))
return {allowed, count, start}
"#;

/// Reply to a script invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptReply {
    Values(Vec<i64>),
    /// The store does not have the script cached
    NoScript,
}

/// The subset of store operations the limiter needs.
#[async_trait]
pub trait ScriptStore: Send + Sync + std::fmt::Debug {
    /// Run a cached script by its SHA1 digest.
    async fn eval_sha(&self, sha: &str, keys: &[String], args: &[i64]) -> Result<ScriptReply>;

    /// Cache a script, returning its digest.
    async fn load_script(&self, source: &str) -> Result<String>;

    /// Verify the store is reachable.
    async fn health_check(&self) -> Result<()>;
}

/// A Lua script addressed by digest.
#[derive(Debug, Clone)]
pub struct AtomicScript {
    source: &'static str,
    sha: String,
}

impl AtomicScript {
    pub fn new(source: &'static str) -> Self {
        Self {
            source,
            sha: redis::Script::new(source).get_hash().to_string(),
        }
    }

    pub fn sha(&self) -> &str {
        &self.sha
    }

    /// Run the script, loading it and retrying once if the store lost it.
    pub async fn invoke(&self, store: &dyn ScriptStore, keys: &[String], args: &[i64]) -> Result<Vec<i64>> {
        if let ScriptReply::Values(values) = store.eval_sha(&self.sha, keys, args).await? {
            return Ok(values);
        }

        debug!(sha = %self.sha, "Script not cached, loading");
        let loaded = store.load_script(self.source).await?;
        if loaded != self.sha {
            warn!(expected = %self.sha, loaded = %loaded, "Store returned unexpected script digest");
        }

        match store.eval_sha(&self.sha, keys, args).await? {
            ScriptReply::Values(values) => Ok(values),
            ScriptReply::NoScript => Err(RatekeeperError::BackendUnavailable(format!(
                "script {} still missing after reload",
                self.sha
            ))),
        }
    }
}

/// Store connection shared by every limiter built from the same settings.
///
/// The connection is opened lazily and retried on the next call when it
/// cannot be established. Every round trip is bounded by the configured
/// read and write timeouts.
pub struct RedisStore {
    client: Client,
    connection: OnceCell<MultiplexedConnection>,
    connect_timeout: Duration,
    operation_timeout: Duration,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("connected", &self.connection.initialized())
            .field("connect_timeout", &self.connect_timeout)
            .field("operation_timeout", &self.operation_timeout)
            .finish()
    }
}

impl RedisStore {
    pub fn new(config: &RedisConfig) -> Result<Self> {
        config.validate()?;

        let info = ConnectionInfo {
            addr: ConnectionAddr::Tcp(config.host.clone(), config.port),
            redis: RedisConnectionInfo {
                db: config.db,
                username: config.username.clone(),
                password: config.password.clone(),
                ..Default::default()
            },
        };
        let client = Client::open(info).map_err(|e| RatekeeperError::Config(format!("redis: {}", e)))?;

        info!(host = %config.host, port = config.port, db = config.db, "Configured redis store");

        Ok(Self {
            client,
            connection: OnceCell::new(),
            connect_timeout: config.connect_timeout,
            operation_timeout: config.operation_timeout(),
        })
    }

    async fn connection(&self) -> Result<MultiplexedConnection> {
        let connection = self
            .connection
            .get_or_try_init(|| async {
                debug!("Opening redis connection");
                match tokio::time::timeout(self.connect_timeout, self.client.get_multiplexed_async_connection()).await {
                    Ok(Ok(connection)) => Ok(connection),
                    Ok(Err(e)) => Err(RatekeeperError::BackendUnavailable(format!("connect: {}", e))),
                    Err(_) => Err(RatekeeperError::BackendUnavailable(format!(
                        "connect timed out after {:?}",
                        self.connect_timeout
                    ))),
                }
            })
            .await?;
        Ok(connection.clone())
    }

    async fn bounded<T, F>(&self, operation: F) -> Result<T>
    where
        F: Future<Output = redis::RedisResult<T>>,
    {
        match tokio::time::timeout(self.operation_timeout, operation).await {
            Ok(result) => result.map_err(RatekeeperError::from),
            Err(_) => Err(RatekeeperError::BackendUnavailable(format!(
                "operation timed out after {:?}",
                self.operation_timeout
            ))),
        }
    }
}

#[async_trait]
impl ScriptStore for RedisStore {
    async fn eval_sha(&self, sha: &str, keys: &[String], args: &[i64]) -> Result<ScriptReply> {
        let mut conn = self.connection().await?;
        let mut cmd = redis::cmd("EVALSHA");
        cmd.arg(sha).arg(keys.len()).arg(keys.to_vec()).arg(args.to_vec());

        match self.bounded(cmd.query_async(&mut conn)).await {
            Ok(values) => Ok(ScriptReply::Values(values)),
            Err(RatekeeperError::Redis(e)) if e.kind() == redis::ErrorKind::NoScriptError => Ok(ScriptReply::NoScript),
            Err(e) => Err(e),
        }
    }

    async fn load_script(&self, source: &str) -> Result<String> {
        let mut conn = self.connection().await?;
        let mut cmd = redis::cmd("SCRIPT");
        cmd.arg("LOAD").arg(source);

        self.bounded(cmd.query_async(&mut conn))
            .await
            .map_err(|e| RatekeeperError::ScriptLoad(e.to_string()))
    }

    async fn health_check(&self) -> Result<()> {
        debug!("Performing redis health check");
        let mut conn = self.connection().await?;
        let _: String = self.bounded(redis::cmd("PING").query_async(&mut conn)).await?;
        debug!("Redis health check passed");
        Ok(())
    }
}

/// A limiter evaluating one [`Limit`] inside the store.
#[derive(Debug)]
pub struct RedisLimiter {
    limit: Limit,
    algorithm: Algorithm,
    store: Arc<dyn ScriptStore>,
    script: AtomicScript,
    clock: Arc<dyn Clock>,
    key_prefix: String,
}

impl RedisLimiter {
    pub fn new(
        limit: Limit,
        algorithm: Algorithm,
        store: Arc<dyn ScriptStore>,
        clock: Arc<dyn Clock>,
        key_prefix: impl Into<String>,
    ) -> Self {
        let script = match algorithm {
            Algorithm::Gcra => AtomicScript::new(GCRA_SCRIPT),
            Algorithm::FixedWindow => AtomicScript::new(FIXED_WINDOW_SCRIPT),
        };
        Self {
            limit,
            algorithm,
            store,
            script,
            clock,
            key_prefix: key_prefix.into(),
        }
    }

    /// The limit enforced by this limiter.
    pub fn limit(&self) -> &Limit {
        &self.limit
    }

    async fn decide(&self, key: &str, n: u64, mode: Mode) -> Result<RateLimitResult> {
        let now = self.clock.now_micros();
        let store_key = format!("{}{}:{}", self.key_prefix, namespace(self.algorithm), key);
        let n = i64::try_from(n).unwrap_or(i64::MAX);
        let charge = i64::from(mode == Mode::Charge);

        trace!(key = %store_key, n = n, mode = ?mode, "Checking redis rate limit");

        let result = match self.algorithm {
            Algorithm::Gcra => {
                let args = [
                    now,
                    self.limit.emission_interval_micros(),
                    i64::try_from(self.limit.burst).unwrap_or(i64::MAX),
                    self.limit.window_micros(),
                    n,
                    charge,
                ];
                let reply = self.script.invoke(self.store.as_ref(), &[store_key.clone()], &args).await?;
                gcra_outcome(&reply)?.into_result(&self.limit, now)
            }
            Algorithm::FixedWindow => {
                let args = [
                    now,
                    self.limit.window_micros(),
                    i64::try_from(self.limit.threshold).unwrap_or(i64::MAX),
                    n,
                    charge,
                ];
                let reply = self.script.invoke(self.store.as_ref(), &[store_key.clone()], &args).await?;
                fixed_window_outcome(&reply)?.into_result(&self.limit, now)
            }
        };

        if !result.allowed {
            debug!(key = %store_key, remaining = result.remaining, "Rate limit exceeded");
        }
        Ok(result)
    }
}

#[async_trait]
impl Limiter for RedisLimiter {
    async fn allow_n(&self, key: &str, n: u64) -> Result<RateLimitResult> {
        self.decide(key, n, Mode::Admit).await
    }

    async fn charge_n(&self, key: &str, n: u64) -> Result<RateLimitResult> {
        self.decide(key, n, Mode::Charge).await
    }

    async fn close(&self) -> Result<()> {
        // The connection is multiplexed and closes when the last store handle drops.
        Ok(())
    }
}

/// Algorithms keep differently typed values, so each gets its own keyspace.
fn namespace(algorithm: Algorithm) -> &'static str {
    match algorithm {
        Algorithm::Gcra => "gcra",
        Algorithm::FixedWindow => "fw",
    }
}

fn gcra_outcome(reply: &[i64]) -> Result<gcra::Outcome> {
    match reply {
        [allowed, remaining, tat, retry_after] => Ok(gcra::Outcome {
            allowed: *allowed == 1,
            remaining: u64::try_from(*remaining).unwrap_or(0),
            tat: *tat,
            retry_after: *retry_after,
        }),
        _ => Err(malformed(reply)),
    }
}

fn fixed_window_outcome(reply: &[i64]) -> Result<fixed_window::Outcome> {
    match reply {
        [allowed, count, window_start] => Ok(fixed_window::Outcome {
            allowed: *allowed == 1,
            count: u64::try_from(*count).unwrap_or(0),
            window_start: *window_start,
        }),
        _ => Err(malformed(reply)),
    }
}

fn malformed(reply: &[i64]) -> RatekeeperError {
    RatekeeperError::BackendUnavailable(format!("unexpected script reply {:?}", reply))
}
