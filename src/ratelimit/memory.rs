//! Process-local limiter.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, trace};

use super::backend::{Limiter, Mode};
use super::fixed_window::{self, WindowRecord};
use super::gcra::{self, TatRecord};
use super::result::{Limit, RateLimitResult};
use crate::clock::Clock;
use crate::config::{Algorithm, MemoryConfig};
use crate::error::Result;

/// Per-key state held by a [`MemoryLimiter`].
#[derive(Debug, Clone, Copy)]
enum Entry {
    Tat(TatRecord),
    Window(WindowRecord),
}

impl Entry {
    fn expiration(&self, limit: &Limit) -> i64 {
        match self {
            Entry::Tat(record) => record.expiration,
            Entry::Window(record) => record.expiration(limit),
        }
    }
}

type Entries = RwLock<HashMap<String, Entry>>;

/// A limiter keeping bucket state in process memory.
///
/// All keys share one reader/writer lock; the critical section is a handful
/// of integer operations. Expired entries are removed by a background sweep
/// that runs until [`Limiter::close`] is called or the limiter is dropped.
pub struct MemoryLimiter {
    limit: Limit,
    algorithm: Algorithm,
    entries: Arc<Entries>,
    clock: Arc<dyn Clock>,
    max_entries: usize,
    /// Stops the sweeper; taken on close
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
}

impl std::fmt::Debug for MemoryLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryLimiter")
            .field("limit", &self.limit)
            .field("algorithm", &self.algorithm)
            .field("entries", &self.entry_count())
            .finish()
    }
}

impl MemoryLimiter {
    /// Create a limiter and start its sweeper on the current tokio runtime.
    ///
    /// Outside a runtime no sweeper runs; expired entries are then only
    /// reclaimed when the entry bound is reached.
    pub fn new(limit: Limit, algorithm: Algorithm, config: &MemoryConfig, clock: Arc<dyn Clock>) -> Self {
        let entries: Arc<Entries> = Arc::new(RwLock::new(HashMap::new()));
        let shutdown = spawn_sweeper(
            Arc::clone(&entries),
            limit,
            Arc::clone(&clock),
            config.cleanup_interval,
        );

        debug!(
            threshold = limit.threshold,
            window = ?limit.window,
            burst = limit.burst,
            algorithm = ?algorithm,
            "Created memory limiter"
        );

        Self {
            limit,
            algorithm,
            entries,
            clock,
            max_entries: config.max_entries.max(1),
            shutdown: Mutex::new(shutdown),
        }
    }

    /// The limit enforced by this limiter.
    pub fn limit(&self) -> &Limit {
        &self.limit
    }

    /// Get the number of tracked keys.
    pub fn entry_count(&self) -> usize {
        self.entries.read().len()
    }

    /// Remove expired entries now, returning how many were removed.
    pub fn sweep(&self) -> usize {
        sweep_expired(&self.entries, &self.limit, self.clock.now_micros())
    }

    /// Clear all entries.
    ///
    /// This is primarily useful for testing.
    pub fn clear(&self) {
        self.entries.write().clear();
    }

    fn decide(&self, key: &str, n: u64, mode: Mode) -> RateLimitResult {
        let now = self.clock.now_micros();

        trace!(key = %key, n = n, mode = ?mode, "Checking memory rate limit");

        if n == 0 {
            let entries = self.entries.read();
            let stored = entries.get(key).copied();
            return self.evaluate(stored, now, n, mode).0;
        }

        let mut entries = self.entries.write();
        let stored = entries.get(key).copied();
        let (result, update) = self.evaluate(stored, now, n, mode);

        if let Some(update) = update {
            if stored.is_none() && entries.len() >= self.max_entries {
                make_room(&mut entries, &self.limit, now);
            }
            entries.insert(key.to_string(), update);
        }

        if !result.allowed {
            debug!(key = %key, remaining = result.remaining, "Rate limit exceeded");
        }
        result
    }

    fn evaluate(
        &self,
        stored: Option<Entry>,
        now: i64,
        n: u64,
        mode: Mode,
    ) -> (RateLimitResult, Option<Entry>) {
        match self.algorithm {
            Algorithm::Gcra => {
                let stored = match stored {
                    Some(Entry::Tat(record)) => Some(record),
                    _ => None,
                };
                let (outcome, update) = gcra::decide(&self.limit, stored, now, n, mode);
                (outcome.into_result(&self.limit, now), update.map(Entry::Tat))
            }
            Algorithm::FixedWindow => {
                let stored = match stored {
                    Some(Entry::Window(record)) => Some(record),
                    _ => None,
                };
                let (outcome, update) = fixed_window::decide(&self.limit, stored, now, n, mode);
                (outcome.into_result(&self.limit, now), update.map(Entry::Window))
            }
        }
    }
}

#[async_trait]
impl Limiter for MemoryLimiter {
    async fn allow_n(&self, key: &str, n: u64) -> Result<RateLimitResult> {
        Ok(self.decide(key, n, Mode::Admit))
    }

    async fn charge_n(&self, key: &str, n: u64) -> Result<RateLimitResult> {
        Ok(self.decide(key, n, Mode::Charge))
    }

    async fn close(&self) -> Result<()> {
        if let Some(shutdown) = self.shutdown.lock().take() {
            let _ = shutdown.send(());
            debug!("Stopped memory limiter sweeper");
        }
        Ok(())
    }
}

fn sweep_expired(entries: &Entries, limit: &Limit, now: i64) -> usize {
    let mut entries = entries.write();
    let before = entries.len();
    entries.retain(|_, entry| entry.expiration(limit) > now);
    before - entries.len()
}

/// Free one slot: drop expired entries, else the one expiring soonest.
fn make_room(entries: &mut HashMap<String, Entry>, limit: &Limit, now: i64) {
    entries.retain(|_, entry| entry.expiration(limit) > now);
    if entries.is_empty() {
        return;
    }

    let evict = entries
        .iter()
        .min_by_key(|(_, entry)| entry.expiration(limit))
        .map(|(key, _)| key.clone());
    if let Some(key) = evict {
        entries.remove(&key);
        debug!(key = %key, "Evicted entry to stay within maxEntries");
    }
}

fn spawn_sweeper(
    entries: Arc<Entries>,
    limit: Limit,
    clock: Arc<dyn Clock>,
    interval: Duration,
) -> Option<oneshot::Sender<()>> {
    let runtime = tokio::runtime::Handle::try_current().ok()?;
    let interval = interval.max(Duration::from_millis(10));
    let (tx, mut rx) = oneshot::channel::<()>();

    runtime.spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // the first tick completes immediately
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let removed = sweep_expired(&entries, &limit, clock.now_micros());
                    if removed > 0 {
                        trace!(removed = removed, "Swept expired entries");
                    }
                }
                // fires on close() and when the limiter is dropped
                _ = &mut rx => break,
            }
        }
    });

    Some(tx)
}
