//! In-process [`ScriptStore`] that runs the limiter scripts in an embedded
//! Lua 5.1 interpreter over an in-memory keyspace.
//!
//! Only the commands the scripts issue are understood, with the reply
//! conversions Redis applies: a missing value reaches Lua as `false`,
//! integer replies as numbers, and the script's returned table is truncated
//! to integers. Key TTLs follow the injected clock.

use async_trait::async_trait;
use mlua::{Lua, Table, Value as LuaValue, Variadic};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

use super::redis::{ScriptReply, ScriptStore};
use crate::clock::Clock;
use crate::error::{RatekeeperError, Result};

#[derive(Debug, Clone)]
enum Stored {
    Text(String),
    Hash(HashMap<String, String>),
}

#[derive(Debug, Clone)]
struct Slot {
    value: Stored,
    /// Microseconds since the epoch
    expires_at: Option<i64>,
}

#[derive(Debug, Clone, PartialEq)]
enum Reply {
    Nil,
    Status(&'static str),
    Int(i64),
    Bulk(String),
    Array(Vec<Reply>),
}

type Keyspace = HashMap<String, Slot>;

const WRONGTYPE: &str = "WRONGTYPE Operation against a key holding the wrong kind of value";

/// Script store backed by an embedded Lua interpreter.
#[derive(Debug)]
pub(crate) struct EmbeddedStore {
    data: Arc<Mutex<Keyspace>>,
    scripts: Mutex<HashMap<String, String>>,
    clock: Arc<dyn Clock>,
}

impl EmbeddedStore {
    pub(crate) fn new(clock: Arc<dyn Clock>) -> Arc<Self> {
        Arc::new(Self {
            data: Arc::new(Mutex::new(HashMap::new())),
            scripts: Mutex::new(HashMap::new()),
            clock,
        })
    }

    /// Live keys, after dropping the expired ones.
    pub(crate) fn keys(&self) -> Vec<String> {
        let now = self.clock.now_micros();
        let mut data = self.data.lock();
        data.retain(|_, slot| !expired(slot, now));
        data.keys().cloned().collect()
    }

    fn run(&self, source: &str, keys: &[String], args: &[i64]) -> mlua::Result<Vec<i64>> {
        let lua = Lua::new();
        let data = Arc::clone(&self.data);
        let now = self.clock.now_micros();

        let call = lua.create_function(move |lua, command: Variadic<String>| {
            let reply = execute(&mut data.lock(), now, &command).map_err(mlua::Error::RuntimeError)?;
            into_lua(lua, reply)
        })?;
        let redis = lua.create_table()?;
        redis.set("call", call)?;

        let globals = lua.globals();
        globals.set("redis", redis)?;
        globals.set("KEYS", keys.to_vec())?;
        globals.set("ARGV", args.iter().map(i64::to_string).collect::<Vec<_>>())?;

        let reply: Table = lua.load(source).eval()?;
        let values = reply
            .sequence_values::<f64>()
            .map(|value| value.map(|v| v as i64))
            .collect::<mlua::Result<Vec<_>>>()?;
        Ok(values)
    }
}

#[async_trait]
impl ScriptStore for EmbeddedStore {
    async fn eval_sha(&self, sha: &str, keys: &[String], args: &[i64]) -> Result<ScriptReply> {
        let Some(source) = self.scripts.lock().get(sha).cloned() else {
            return Ok(ScriptReply::NoScript);
        };
        self.run(&source, keys, args)
            .map(ScriptReply::Values)
            .map_err(|e| RatekeeperError::BackendUnavailable(format!("script failed: {}", e)))
    }

    async fn load_script(&self, source: &str) -> Result<String> {
        let sha = redis::Script::new(source).get_hash().to_string();
        self.scripts.lock().insert(sha.clone(), source.to_string());
        Ok(sha)
    }

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}

fn expired(slot: &Slot, now: i64) -> bool {
    slot.expires_at.is_some_and(|at| at <= now)
}

fn live<'a>(data: &'a mut Keyspace, key: &str, now: i64) -> Option<&'a mut Slot> {
    if data.get(key).is_some_and(|slot| expired(slot, now)) {
        data.remove(key);
    }
    data.get_mut(key)
}

fn millis(raw: &str) -> std::result::Result<i64, String> {
    raw.parse::<i64>()
        .ok()
        .filter(|ms| *ms > 0)
        .ok_or_else(|| format!("ERR invalid expire time {:?}", raw))
}

fn execute(data: &mut Keyspace, now: i64, command: &[String]) -> std::result::Result<Reply, String> {
    let (name, args) = command
        .split_first()
        .ok_or_else(|| "ERR empty command".to_string())?;

    match (name.to_ascii_uppercase().as_str(), args) {
        ("GET", [key]) => match live(data, key, now) {
            None => Ok(Reply::Nil),
            Some(Slot { value: Stored::Text(text), .. }) => Ok(Reply::Bulk(text.clone())),
            Some(_) => Err(WRONGTYPE.to_string()),
        },
        ("SET", [key, value, rest @ ..]) => {
            let expires_at = match rest {
                [] => None,
                [option, ms] if option.eq_ignore_ascii_case("PX") => Some(now + millis(ms)? * 1000),
                _ => return Err(format!("ERR unsupported SET options {:?}", rest)),
            };
            data.insert(
                key.clone(),
                Slot {
                    value: Stored::Text(value.clone()),
                    expires_at,
                },
            );
            Ok(Reply::Status("OK"))
        }
        ("HMGET", [key, fields @ ..]) if !fields.is_empty() => match live(data, key, now) {
            None => Ok(Reply::Array(vec![Reply::Nil; fields.len()])),
            Some(Slot { value: Stored::Hash(hash), .. }) => Ok(Reply::Array(
                fields
                    .iter()
                    .map(|field| hash.get(field).cloned().map_or(Reply::Nil, Reply::Bulk))
                    .collect(),
            )),
            Some(_) => Err(WRONGTYPE.to_string()),
        },
        ("HSET", [key, pairs @ ..]) if !pairs.is_empty() && pairs.len() % 2 == 0 => {
            if live(data, key, now).is_none() {
                data.insert(
                    key.clone(),
                    Slot {
                        value: Stored::Hash(HashMap::new()),
                        expires_at: None,
                    },
                );
            }
            let Some(Slot { value: Stored::Hash(hash), .. }) = data.get_mut(key) else {
                return Err(WRONGTYPE.to_string());
            };
            let added = pairs
                .chunks(2)
                .filter(|pair| hash.insert(pair[0].clone(), pair[1].clone()).is_none())
                .count();
            Ok(Reply::Int(added as i64))
        }
        ("PEXPIRE", [key, ms]) => {
            let ms = millis(ms)?;
            match live(data, key, now) {
                Some(slot) => {
                    slot.expires_at = Some(now + ms * 1000);
                    Ok(Reply::Int(1))
                }
                None => Ok(Reply::Int(0)),
            }
        }
        _ => Err(format!("ERR unsupported command {:?}", command)),
    }
}

fn into_lua(lua: &Lua, reply: Reply) -> mlua::Result<LuaValue<'_>> {
    Ok(match reply {
        Reply::Nil => LuaValue::Boolean(false),
        Reply::Status(status) => {
            let table = lua.create_table()?;
            table.set("ok", status)?;
            LuaValue::Table(table)
        }
        Reply::Int(value) => LuaValue::Number(value as f64),
        Reply::Bulk(text) => LuaValue::String(lua.create_string(&text)?),
        Reply::Array(items) => {
            let table = lua.create_table()?;
            for (index, item) in items.into_iter().enumerate() {
                table.raw_set(index + 1, into_lua(lua, item)?)?;
            }
            LuaValue::Table(table)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use std::time::Duration;

    fn command(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|part| part.to_string()).collect()
    }

    #[test]
    fn test_set_px_expires() {
        let mut data = Keyspace::new();
        let now = 1_700_000_000_000_000;

        assert_eq!(execute(&mut data, now, &command(&["SET", "k", "1", "PX", "5"])), Ok(Reply::Status("OK")));
        assert_eq!(execute(&mut data, now + 4_999, &command(&["GET", "k"])), Ok(Reply::Bulk("1".into())));
        assert_eq!(execute(&mut data, now + 5_000, &command(&["GET", "k"])), Ok(Reply::Nil));
        assert!(data.is_empty());
    }

    #[test]
    fn test_hash_commands_and_wrong_type() {
        let mut data = Keyspace::new();
        let now = 0;

        assert_eq!(
            execute(&mut data, now, &command(&["HMGET", "h", "count", "start"])),
            Ok(Reply::Array(vec![Reply::Nil, Reply::Nil]))
        );
        assert_eq!(execute(&mut data, now, &command(&["HSET", "h", "count", "3", "start", "0"])), Ok(Reply::Int(2)));
        assert_eq!(execute(&mut data, now, &command(&["PEXPIRE", "h", "10"])), Ok(Reply::Int(1)));
        assert_eq!(
            execute(&mut data, now, &command(&["HMGET", "h", "count", "missing"])),
            Ok(Reply::Array(vec![Reply::Bulk("3".into()), Reply::Nil]))
        );

        assert!(execute(&mut data, now, &command(&["GET", "h"])).unwrap_err().starts_with("WRONGTYPE"));
        assert_eq!(execute(&mut data, now + 10_000, &command(&["GET", "h"])), Ok(Reply::Nil));
    }

    #[tokio::test]
    async fn test_eval_requires_loaded_script() {
        let clock = MockClock::at_unix(1_700_000_000);
        let store = EmbeddedStore::new(Arc::new(clock.clone()));
        let source = "redis.call('SET', KEYS[1], ARGV[1], 'PX', ARGV[2]) return {tonumber(redis.call('GET', KEYS[1])), 7}";
        let sha = redis::Script::new(source).get_hash().to_string();
        let keys = ["k".to_string()];

        assert_eq!(store.eval_sha(&sha, &keys, &[42, 1000]).await.unwrap(), ScriptReply::NoScript);

        assert_eq!(store.load_script(source).await.unwrap(), sha);
        assert_eq!(
            store.eval_sha(&sha, &keys, &[42, 1000]).await.unwrap(),
            ScriptReply::Values(vec![42, 7])
        );
        assert_eq!(store.keys(), vec!["k".to_string()]);

        clock.advance(Duration::from_secs(1));
        assert!(store.keys().is_empty());
    }

    #[tokio::test]
    async fn test_script_errors_are_backend_failures() {
        let store = EmbeddedStore::new(Arc::new(MockClock::at_unix(0)));
        let sha = store.load_script("return redis.call('FLUSHALL')").await.unwrap();

        let err = store.eval_sha(&sha, &[], &[]).await.unwrap_err();
        assert!(err.is_backend_failure());
    }
}
