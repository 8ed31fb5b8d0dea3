use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::api::ApiError;
use crate::config::Config;

/// Default freshness window for cached queries.
const DEFAULT_STALE_SECS: i64 = 5 * 60;

/// Initial backoff delay for transient retries.
const INITIAL_BACKOFF_MS: u64 = 1000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedData<T> {
    pub data: T,
    pub cached_at: DateTime<Utc>,
}

impl<T> CachedData<T> {
    pub fn new(data: T) -> Self {
        Self {
            data,
            cached_at: Utc::now(),
        }
    }

    pub fn age_minutes(&self) -> i64 {
        let now = Utc::now();
        (now - self.cached_at).num_minutes()
    }

    pub fn age_display(&self) -> String {
        let minutes = self.age_minutes();
        if minutes < 1 {
            // Also covers clock skew
            "just now".to_string()
        } else if minutes < 60 {
            format!("{}m ago", minutes)
        } else if minutes < 1440 {
            format!("{}h ago", minutes / 60)
        } else {
            format!("{}d ago", minutes / 1440)
        }
    }

    pub fn is_stale(&self, ttl: chrono::Duration) -> bool {
        Utc::now() - self.cached_at > ttl
    }
}

/// Transient-failure retry with exponential backoff.
///
/// Only errors for which [`ApiError::is_retryable`] holds are retried; client
/// errors (4xx, including Unauthorized after a failed refresh) surface at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(INITIAL_BACKOFF_MS),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_retries: config.max_retries,
            ..Self::default()
        }
    }

    /// Delay before retry number `retry` (1-based), doubling each time and
    /// saturating instead of overflowing.
    pub fn backoff_for(&self, retry: u32) -> Duration {
        let factor = 2u32.checked_pow(retry.saturating_sub(1)).unwrap_or(u32::MAX);
        self.initial_backoff.saturating_mul(factor)
    }

    pub async fn run<T, F, Fut>(&self, mut operation: F) -> Result<T, ApiError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ApiError>>,
    {
        let mut retries = 0;

        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && retries < self.max_retries => {
                    retries += 1;
                    let backoff = self.backoff_for(retries);
                    warn!(kind = %e.kind(), retry = retries, backoff_ms = backoff.as_millis() as u64, "Transient failure, backing off");
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

struct CacheInner {
    entries: Mutex<HashMap<String, CachedData<Value>>>,
    policy: RetryPolicy,
    ttl: chrono::Duration,
}

/// Keyed, TTL-based response cache.
/// Clone is cheap and all clones share entries.
#[derive(Clone)]
pub struct QueryCache {
    inner: Arc<CacheInner>,
}

impl QueryCache {
    pub fn new(policy: RetryPolicy) -> Self {
        Self::with_ttl(policy, chrono::Duration::seconds(DEFAULT_STALE_SECS))
    }

    pub fn with_ttl(policy: RetryPolicy, ttl: chrono::Duration) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                entries: Mutex::new(HashMap::new()),
                policy,
                ttl,
            }),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(RetryPolicy::from_config(config))
    }

    pub fn policy(&self) -> RetryPolicy {
        self.inner.policy
    }

    /// Cached value for `key` if present, fresh and decodable
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<CachedData<T>> {
        let entries = self.inner.entries.lock();
        let entry = entries.get(key)?;
        if entry.is_stale(self.inner.ttl) {
            return None;
        }
        match serde_json::from_value(entry.data.clone()) {
            Ok(data) => Some(CachedData {
                data,
                cached_at: entry.cached_at,
            }),
            Err(e) => {
                warn!(key, error = %e, "Cached value has unexpected shape, ignoring");
                None
            }
        }
    }

    pub fn put<T: Serialize>(&self, key: &str, data: &T) {
        match serde_json::to_value(data) {
            Ok(value) => {
                self.inner
                    .entries
                    .lock()
                    .insert(key.to_string(), CachedData::new(value));
            }
            Err(e) => warn!(key, error = %e, "Value not cacheable"),
        }
    }

    /// Return the cached value or run `fetcher` under the retry policy and cache the result.
    pub async fn fetch<T, F, Fut>(&self, key: &str, fetcher: F) -> Result<T, ApiError>
    where
        T: Serialize + DeserializeOwned,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ApiError>>,
    {
        if let Some(cached) = self.get::<T>(key) {
            debug!(key, age = %cached.age_display(), "Cache hit");
            return Ok(cached.data);
        }

        debug!(key, "Cache miss, fetching");
        let value = self.inner.policy.run(fetcher).await?;
        self.put(key, &value);
        Ok(value)
    }

    /// Run a mutation; on success drop every entry under the given key prefixes.
    pub async fn mutate<T, Fut>(&self, mutation: Fut, invalidates: &[&str]) -> Result<T, ApiError>
    where
        Fut: Future<Output = Result<T, ApiError>>,
    {
        let value = mutation.await?;
        for prefix in invalidates {
            self.invalidate_prefix(prefix);
        }
        Ok(value)
    }

    pub fn invalidate(&self, key: &str) {
        self.inner.entries.lock().remove(key);
    }

    pub fn invalidate_prefix(&self, prefix: &str) {
        let mut entries = self.inner.entries.lock();
        let before = entries.len();
        entries.retain(|key, _| !key.starts_with(prefix));
        debug!(prefix, removed = before - entries.len(), "Invalidated cached queries");
    }

    pub fn clear(&self) {
        self.inner.entries.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.inner.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.lock().is_empty()
    }
}
