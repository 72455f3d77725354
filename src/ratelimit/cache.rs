//! Process-wide cache of memory-backed limiters.
//!
//! Reactivating a route with an unchanged configuration must not reset its
//! counters, so memory limiters are keyed by a fingerprint of everything that
//! shapes their behavior and reused across activations.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::join_all;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::backend::Limiter;
use super::result::Limit;
use crate::config::{Algorithm, HeaderConfig, KeyComponent, RejectionConfig};
use crate::error::{RatekeeperError, Result};
use crate::policy::context::PolicyMetadata;

/// Everything that distinguishes one cached limiter from another.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheKey<'a> {
    pub scope: &'a PolicyMetadata,
    pub algorithm: Algorithm,
    pub limits: &'a [Limit],
    pub cleanup_interval: Duration,
    pub max_entries: usize,
    pub key_extraction: &'a [KeyComponent],
    pub headers: &'a HeaderConfig,
    pub rejection: &'a RejectionConfig,
}

impl CacheKey<'_> {
    /// Deterministic hex digest of the key.
    pub fn fingerprint(&self) -> Result<String> {
        let encoded = serde_json::to_vec(self)
            .map_err(|e| RatekeeperError::Config(format!("cannot fingerprint limiter: {}", e)))?;
        Ok(hex::encode(Sha256::digest(&encoded)))
    }
}

/// Shared limiter instances indexed by configuration fingerprint.
///
/// Cloning the cache yields another handle to the same entries. Entries are
/// never evicted automatically; their number is bounded by the number of
/// distinct route configurations.
#[derive(Debug, Clone, Default)]
pub struct LimiterCache {
    entries: Arc<DashMap<String, Arc<dyn Limiter>>>,
}

impl LimiterCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the limiter for `fingerprint`, building it on first use.
    pub fn get_or_insert_with<F>(&self, fingerprint: &str, build: F) -> Result<Arc<dyn Limiter>>
    where
        F: FnOnce() -> Result<Arc<dyn Limiter>>,
    {
        match self.entries.entry(fingerprint.to_string()) {
            Entry::Occupied(entry) => {
                debug!(fingerprint = %fingerprint, "Reusing cached limiter");
                Ok(Arc::clone(entry.get()))
            }
            Entry::Vacant(entry) => {
                let limiter = build()?;
                debug!(fingerprint = %fingerprint, "Caching new limiter");
                entry.insert(Arc::clone(&limiter));
                Ok(limiter)
            }
        }
    }

    /// Get the number of cached limiters.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Close and drop every cached limiter. Used at process shutdown.
    pub async fn close_all(&self) -> Result<()> {
        let limiters: Vec<Arc<dyn Limiter>> = self.entries.iter().map(|entry| Arc::clone(entry.value())).collect();
        self.entries.clear();

        info!(count = limiters.len(), "Closing cached limiters");
        join_all(limiters.iter().map(|limiter| limiter.close()))
            .await
            .into_iter()
            .collect()
    }
}
