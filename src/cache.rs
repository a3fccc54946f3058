//! Response caching for cacheable origin reads
//!
//! [`CacheStore`] is the key/value seam (`lookup`, `put`, `delete`);
//! [`MemoryCacheStore`] is the in-process implementation. [`ResponseCache`]
//! sits in front of a store and owns key derivation, cache-busting, size
//! limits and the metadata headers written onto stored entries.
//!
//! The invalidation token is hashed into every key, so changing it orphans
//! every existing entry. Orphans age out through their TTL.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use axum::http::{HeaderMap, Method, Uri};
use chrono::{DateTime, SecondsFormat, Utc};
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::clock::Clock;
use crate::config::CacheConfig;
use crate::transport::OriginResponse;

/// Key/value store for cached responses
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Fetch a live entry
    async fn lookup(&self, key: &str) -> Option<OriginResponse>;
    /// Insert or replace an entry
    async fn put(&self, key: &str, response: OriginResponse, ttl: Duration);
    /// Remove an entry, returning whether one existed
    async fn delete(&self, key: &str) -> bool;
}

/// A stored response with TTL metadata
struct CacheEntry {
    response: OriginResponse,
    stored_at: DateTime<Utc>,
    ttl: Duration,
}

impl CacheEntry {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match now.signed_duration_since(self.stored_at).to_std() {
            Ok(age) => age >= self.ttl,
            // stored "in the future" after a clock step back
            Err(_) => false,
        }
    }

    fn expires_at(&self) -> DateTime<Utc> {
        chrono::Duration::from_std(self.ttl)
            .ok()
            .and_then(|ttl| self.stored_at.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

/// Cache statistics tracked atomically
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl CacheStats {
    /// Entries served from cache
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Lookups that found nothing live
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Entries removed for expiry or capacity
    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    /// Hit rate (0.0-1.0)
    #[allow(clippy::cast_precision_loss)]
    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits();
        let total = hits + self.misses();
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }
}

/// Snapshot of cache statistics
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStatsSnapshot {
    /// Total cache hits
    pub hits: u64,
    /// Total cache misses
    pub misses: u64,
    /// Total evictions
    pub evictions: u64,
    /// Current number of entries
    pub size: usize,
    /// Hit rate (0.0-1.0)
    pub hit_rate: f64,
}

/// In-process TTL cache, bounded by entry count
pub struct MemoryCacheStore {
    entries: DashMap<String, CacheEntry>,
    max_entries: usize,
    stats: CacheStats,
    clock: Arc<dyn Clock>,
}

impl MemoryCacheStore {
    /// Create an empty store holding at most `max_entries`
    #[must_use]
    pub fn new(max_entries: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            max_entries: max_entries.max(1),
            stats: CacheStats::default(),
            clock,
        }
    }

    /// Current statistics
    pub fn stats(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            hits: self.stats.hits(),
            misses: self.stats.misses(),
            evictions: self.stats.evictions(),
            size: self.entries.len(),
            hit_rate: self.stats.hit_rate(),
        }
    }

    /// Remove expired entries, returning how many were dropped
    pub fn evict_expired(&self) -> usize {
        let now = self.clock.now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        let count = before.saturating_sub(self.entries.len());
        if count > 0 {
            self.stats
                .evictions
                .fetch_add(count as u64, Ordering::Relaxed);
        }
        count
    }

    /// Make room for one new entry
    fn ensure_capacity(&self) {
        if self.entries.len() < self.max_entries {
            return;
        }
        self.evict_expired();
        if self.entries.len() < self.max_entries {
            return;
        }

        let soonest = self
            .entries
            .iter()
            .min_by_key(|entry| entry.value().expires_at())
            .map(|entry| entry.key().clone());
        if let Some(key) = soonest {
            self.entries.remove(&key);
            self.stats.evictions.fetch_add(1, Ordering::Relaxed);
            debug!(key = %key, "Cache full, evicted entry closest to expiry");
        }
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn lookup(&self, key: &str) -> Option<OriginResponse> {
        let now = self.clock.now();
        let Some(entry) = self.entries.get(key) else {
            self.stats.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        };

        if entry.is_expired(now) {
            drop(entry);
            self.entries.remove(key);
            self.stats.evictions.fetch_add(1, Ordering::Relaxed);
            self.stats.misses.fetch_add(1, Ordering::Relaxed);
            None
        } else {
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
            Some(entry.response.clone())
        }
    }

    async fn put(&self, key: &str, response: OriginResponse, ttl: Duration) {
        if !self.entries.contains_key(key) {
            self.ensure_capacity();
        }
        let entry = CacheEntry {
            response,
            stored_at: self.clock.now(),
            ttl,
        };
        self.entries.insert(key.to_string(), entry);
    }

    async fn delete(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }
}

/// Derive the cache key for a request.
///
/// The digest covers the method, the path, the query pairs sorted by name
/// (minus cache-busting parameters), the invalidation token and the value of
/// every Vary header, so two clients negotiating different languages or
/// formats never share an entry. Rendered as `{METHOD}:{path}:{sha256}`.
#[must_use]
pub fn compute_key(
    method: &Method,
    uri: &Uri,
    headers: &HeaderMap,
    token: &str,
    vary_headers: &[String],
    bypass_params: &[String],
) -> String {
    let path = uri.path();

    let mut pairs: Vec<(String, String)> = uri
        .query()
        .map(|q| {
            url::form_urlencoded::parse(q.as_bytes())
                .into_owned()
                .filter(|(name, _)| !bypass_params.iter().any(|b| b == name))
                .collect()
        })
        .unwrap_or_default();
    pairs.sort();

    let mut hasher = Sha256::new();
    hasher.update(method.as_str().as_bytes());
    hasher.update(b"\n");
    hasher.update(path.as_bytes());
    hasher.update(b"\n");
    for (name, value) in &pairs {
        hasher.update(name.as_bytes());
        hasher.update(b"=");
        hasher.update(value.as_bytes());
        hasher.update(b"&");
    }
    hasher.update(b"\n");
    hasher.update(token.as_bytes());
    for name in vary_headers {
        hasher.update(b"\n");
        hasher.update(name.to_ascii_lowercase().as_bytes());
        hasher.update(b":");
        for value in headers.get_all(name.as_str()) {
            hasher.update(value.as_bytes());
            hasher.update(b",");
        }
    }

    let digest = hasher.finalize();
    format!("{}:{path}:{}", method.as_str(), hex::encode(digest))
}

/// Cache policy in front of a [`CacheStore`]
pub struct ResponseCache {
    config: CacheConfig,
    store: Arc<dyn CacheStore>,
    clock: Arc<dyn Clock>,
}

impl ResponseCache {
    /// Create a cache gateway over `store`
    #[must_use]
    pub fn new(config: &CacheConfig, store: Arc<dyn CacheStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            config: config.clone(),
            store,
            clock,
        }
    }

    /// Whether caching is active at all
    #[must_use]
    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    /// Cache settings
    #[must_use]
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Key for this request under the current invalidation token
    #[must_use]
    pub fn compute_key(&self, method: &Method, uri: &Uri, headers: &HeaderMap) -> String {
        compute_key(
            method,
            uri,
            headers,
            &self.config.invalidation_token,
            &self.config.vary_headers,
            &self.config.bypass_params,
        )
    }

    /// Whether the request asks for a fresh origin fetch (`?nocache`, `?refresh`)
    #[must_use]
    pub fn is_bypass(&self, uri: &Uri) -> bool {
        uri.query().is_some_and(|q| {
            url::form_urlencoded::parse(q.as_bytes())
                .any(|(name, _)| self.config.bypass_params.iter().any(|b| *b == name))
        })
    }

    /// Serve a cached entry, marked `X-Cache: HIT`.
    ///
    /// Entries larger than `max_entry_size` are deleted instead of served.
    pub async fn lookup(&self, key: &str) -> Option<OriginResponse> {
        if !self.config.enabled {
            return None;
        }

        let Some(mut response) = self.store.lookup(key).await else {
            debug!(key = %key, "Cache miss");
            return None;
        };

        if response.body.len() > self.config.max_entry_size {
            debug!(key = %key, size = response.body.len(), "Dropping oversized cache entry");
            self.store.delete(key).await;
            return None;
        }

        debug!(key = %key, "Cache hit");
        response.set_header("X-Cache", "HIT");
        Some(response)
    }

    /// Write cache metadata onto `response` and store a copy under `key`.
    ///
    /// The caller decides eligibility; oversized bodies are left uncached.
    pub async fn store(&self, key: &str, response: &mut OriginResponse, ttl: Duration) {
        if !self.config.enabled {
            return;
        }
        if response.body.len() > self.config.max_entry_size {
            debug!(key = %key, size = response.body.len(), "Response too large to cache");
            return;
        }

        let ttl_secs = ttl.as_secs().to_string();
        let cached_at = self
            .clock
            .now()
            .to_rfc3339_opts(SecondsFormat::Millis, true);
        response.set_header("Cache-Control", &format!("public, max-age={ttl_secs}"));
        response.set_header("X-Cache-Date", &cached_at);
        response.set_header("X-Cache", "MISS");
        response.set_header("X-Cache-TTL", &ttl_secs);
        if !self.config.vary_headers.is_empty() {
            response.set_header("Vary", &self.config.vary_headers.join(", "));
        }

        self.store.put(key, response.clone(), ttl).await;
        debug!(key = %key, ttl_secs = ttl.as_secs(), "Cached response");
    }
}
