//! Side-store for computed statistics.
//!
//! The cache never decides correctness: a backend failure on read is a miss and a
//! failure on write or invalidation is logged and dropped.

use anyhow::{anyhow, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

pub const STATISTICS_PREFIX: &str = "statistics:";

/// Key/value store with per-entry expiry.
pub trait CacheBackend: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&self, key: &str, value: String, ttl: Duration) -> Result<()>;
    fn invalidate_prefix(&self, prefix: &str) -> Result<()>;
}

/// Entries whose expiry overflows `Instant` are kept until invalidated.
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, (String, Option<Instant>)>>,
}

fn is_live(expires_at: Option<Instant>, now: Instant) -> bool {
    expires_at.map_or(true, |expires_at| expires_at > now)
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CacheBackend for MemoryCache {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let mut entries = self.entries.lock().map_err(|_| anyhow!("cache mutex poisoned"))?;
        match entries.get(key) {
            Some((value, expires_at)) if is_live(*expires_at, Instant::now()) => Ok(Some(value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    fn set(&self, key: &str, value: String, ttl: Duration) -> Result<()> {
        let mut entries = self.entries.lock().map_err(|_| anyhow!("cache mutex poisoned"))?;
        let now = Instant::now();
        entries.retain(|_, (_, expires_at)| is_live(*expires_at, now));
        entries.insert(key.to_string(), (value, now.checked_add(ttl)));
        Ok(())
    }

    fn invalidate_prefix(&self, prefix: &str) -> Result<()> {
        let mut entries = self.entries.lock().map_err(|_| anyhow!("cache mutex poisoned"))?;
        entries.retain(|key, _| !key.starts_with(prefix));
        Ok(())
    }
}

/// Wraps a backend with a generation counter. A value computed before an
/// invalidation is never stored after it.
pub struct BestEffortCache {
    backend: Box<dyn CacheBackend>,
    ttl: Duration,
    generation: Mutex<u64>,
}

impl BestEffortCache {
    pub fn new(backend: Box<dyn CacheBackend>, ttl: Duration) -> Self {
        Self {
            backend,
            ttl,
            generation: Mutex::new(0),
        }
    }

    pub fn in_memory(ttl: Duration) -> Self {
        Self::new(Box::new(MemoryCache::new()), ttl)
    }

    fn generation_guard(&self) -> MutexGuard<'_, u64> {
        self.generation.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Taken before computing a value; pass it back to `put_json`.
    pub fn generation(&self) -> u64 {
        *self.generation_guard()
    }

    pub fn get_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        if self.ttl.is_zero() {
            return None;
        }
        let raw = match self.backend.get(key) {
            Ok(raw) => raw?,
            Err(error) => {
                tracing::warn!(key = %key, error = %error, "cache read failed; treating as miss");
                return None;
            }
        };
        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(error) => {
                tracing::warn!(key = %key, error = %error, "discarding undecodable cache entry");
                None
            }
        }
    }

    /// Stores `value` unless an invalidation happened since `generation` was taken.
    pub fn put_json<T: Serialize>(&self, key: &str, value: &T, generation: u64) {
        if self.ttl.is_zero() {
            return;
        }
        let encoded = match serde_json::to_string(value) {
            Ok(encoded) => encoded,
            Err(error) => {
                tracing::warn!(key = %key, error = %error, "failed to encode cache entry");
                return;
            }
        };
        let current = self.generation_guard();
        if *current != generation {
            tracing::debug!(key = %key, "skipping cache write computed before an invalidation");
            return;
        }
        if let Err(error) = self.backend.set(key, encoded, self.ttl) {
            tracing::warn!(key = %key, error = %error, "cache write failed");
        }
    }

    pub fn invalidate(&self, prefix: &str) {
        let mut current = self.generation_guard();
        *current = current.wrapping_add(1);
        if let Err(error) = self.backend.invalidate_prefix(prefix) {
            tracing::warn!(prefix = %prefix, error = %error, "cache invalidation failed");
        }
    }
}
