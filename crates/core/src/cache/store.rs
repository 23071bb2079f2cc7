//! Read-through cache API.
//!
//! `CacheStore` wraps [`CacheDb`] with the lookup/fetch/write-back pattern
//! used by every provider path. There is no single-flight deduplication:
//! concurrent misses on one key each call their fetch function and the last
//! write wins.

use super::connection::CacheDb;
use crate::Error;
use crate::config::CacheConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

/// Where a returned payload came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CacheStatus {
    /// Served from a valid stored entry.
    Hit,
    /// Freshly fetched and written back.
    Miss,
    /// Expired entry returned because the refresh failed (opt-in).
    Stale,
}

/// A payload tagged with its cache status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cached<T> {
    pub data: T,
    pub cache_status: CacheStatus,
}

/// Per-call cache options.
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheOptions {
    /// Bypass any stored entry and always fetch.
    pub force_refresh: bool,
    /// Override the provider TTL for this write.
    pub ttl: Option<Duration>,
}

impl CacheOptions {
    pub fn force_refresh() -> Self {
        Self { force_refresh: true, ttl: None }
    }
}

/// Result of a search fetch: ordered identifiers plus an optional snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResults {
    pub result_ids: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<serde_json::Value>,
}

/// A search lookup: the query triple that produces a fingerprint.
#[derive(Debug, Clone)]
pub struct SearchHit<'a> {
    pub query: &'a str,
    pub provider: &'a str,
    pub params: &'a serde_json::Value,
}

impl SearchHit<'_> {
    pub fn fingerprint(&self) -> String {
        super::hash::compute_query_fingerprint(self.query, self.provider, self.params)
    }
}

/// Provider-specific default TTLs.
#[derive(Debug, Clone)]
pub struct TtlPolicy {
    default: Duration,
    per_provider: HashMap<String, Duration>,
}

impl TtlPolicy {
    pub fn new(default: Duration) -> Self {
        Self { default, per_provider: HashMap::new() }
    }

    pub fn with_provider(mut self, provider: &str, ttl: Duration) -> Self {
        self.per_provider.insert(provider.to_string(), ttl);
        self
    }

    pub fn ttl_for(&self, provider: &str) -> Duration {
        self.per_provider.get(provider).copied().unwrap_or(self.default)
    }
}

impl From<&CacheConfig> for TtlPolicy {
    fn from(config: &CacheConfig) -> Self {
        Self {
            default: Duration::from_secs(config.default_ttl_secs),
            per_provider: config
                .provider_ttl_secs
                .iter()
                .map(|(provider, secs)| (provider.clone(), Duration::from_secs(*secs)))
                .collect(),
        }
    }
}

/// Persistent read-through cache shared by request paths and maintenance.
#[derive(Debug, Clone)]
pub struct CacheStore {
    db: CacheDb,
    ttl: TtlPolicy,
    serve_stale_on_error: bool,
}

impl CacheStore {
    pub fn new(db: CacheDb, config: &CacheConfig) -> Self {
        Self { db, ttl: TtlPolicy::from(config), serve_stale_on_error: config.serve_stale_on_error }
    }

    pub fn with_policy(db: CacheDb, ttl: TtlPolicy) -> Self {
        Self { db, ttl, serve_stale_on_error: false }
    }

    pub fn db(&self) -> &CacheDb {
        &self.db
    }

    pub fn ttl_policy(&self) -> &TtlPolicy {
        &self.ttl
    }

    /// Return the stored payload for `key`, or fetch, persist and return it.
    ///
    /// A valid entry is returned as `Hit` without calling `fetch` and its
    /// access counters are bumped. A missing or expired entry, or
    /// `force_refresh`, calls `fetch` and stores the result with the
    /// provider's TTL, returning `Miss`.
    ///
    /// # Errors
    ///
    /// Propagates the fetch error (unless stale serving is enabled and an
    /// entry exists) and database read failures. A failed write-back is
    /// logged and the fetched payload is still returned.
    pub async fn get_with_cache<F, Fut>(
        &self, key: &str, provider: &str, fetch: F, opts: CacheOptions,
    ) -> Result<Cached<serde_json::Value>, Error>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<serde_json::Value, Error>>,
    {
        let stored = if opts.force_refresh { None } else { self.db.get_entry(key).await? };

        if let Some(entry) = &stored
            && !entry.is_expired()
        {
            tracing::debug!(key, provider, "cache hit");
            if let Err(e) = self.db.touch_entry(key).await {
                tracing::warn!(key, "failed to record cache hit: {e}");
            }
            return Ok(Cached { data: entry.payload.clone(), cache_status: CacheStatus::Hit });
        }

        tracing::debug!(key, provider, force_refresh = opts.force_refresh, "cache miss");

        let data = match fetch().await {
            Ok(data) => data,
            Err(e) => return self.stale_or(key, stored, || self.db.get_entry(key), |entry| entry.payload, e).await,
        };

        let ttl = opts.ttl.unwrap_or_else(|| self.ttl.ttl_for(provider));
        if let Err(e) = self.db.put_entry(key, provider, &data, ttl).await {
            tracing::warn!(key, "failed to cache payload: {e}");
        }

        Ok(Cached { data, cache_status: CacheStatus::Miss })
    }

    /// Same pattern as [`get_with_cache`](Self::get_with_cache), keyed by the
    /// query fingerprint and storing the ordered result identifiers.
    pub async fn search_with_cache<F, Fut>(
        &self, search: SearchHit<'_>, fetch: F, opts: CacheOptions,
    ) -> Result<Cached<SearchResults>, Error>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<SearchResults, Error>>,
    {
        let fingerprint = search.fingerprint();
        let stored = if opts.force_refresh { None } else { self.db.get_search(&fingerprint).await? };

        if let Some(entry) = &stored
            && !entry.is_expired()
        {
            tracing::debug!(fingerprint = %fingerprint, provider = search.provider, "search cache hit");
            if let Err(e) = self.db.touch_search(&fingerprint).await {
                tracing::warn!(fingerprint = %fingerprint, "failed to record search cache hit: {e}");
            }
            let data = SearchResults { result_ids: entry.result_ids.clone(), snapshot: entry.snapshot.clone() };
            return Ok(Cached { data, cache_status: CacheStatus::Hit });
        }

        tracing::debug!(fingerprint = %fingerprint, provider = search.provider, "search cache miss");

        let data = match fetch().await {
            Ok(data) => data,
            Err(e) => {
                let to_results =
                    |entry: super::SearchCacheEntry| SearchResults { result_ids: entry.result_ids, snapshot: entry.snapshot };
                return self
                    .stale_or(&fingerprint, stored, || self.db.get_search(&fingerprint), to_results, e)
                    .await;
            }
        };

        let ttl = opts.ttl.unwrap_or_else(|| self.ttl.ttl_for(search.provider));
        if let Err(e) = self
            .db
            .put_search(
                &fingerprint,
                search.query,
                search.provider,
                search.params,
                &data.result_ids,
                data.snapshot.as_ref(),
                ttl,
            )
            .await
        {
            tracing::warn!(fingerprint = %fingerprint, "failed to cache search result: {e}");
        }

        Ok(Cached { data, cache_status: CacheStatus::Miss })
    }

    /// Remove an entry unconditionally. Returns true if one existed.
    pub async fn invalidate(&self, key: &str) -> Result<bool, Error> {
        let removed = self.db.delete_entry(key).await?;
        tracing::debug!(key, removed, "cache entry invalidated");
        Ok(removed)
    }

    /// Remove a cached search result unconditionally.
    pub async fn invalidate_search(&self, search: SearchHit<'_>) -> Result<bool, Error> {
        self.db.delete_search(&search.fingerprint()).await
    }

    /// Fall back to an expired entry after a failed fetch, when enabled.
    ///
    /// `stored` is the entry read before the fetch; `reload` reads it again
    /// when the fetch path skipped the lookup (`force_refresh`).
    async fn stale_or<E, T, R, Fut>(
        &self, key: &str, stored: Option<E>, reload: R, into_data: impl FnOnce(E) -> T, err: Error,
    ) -> Result<Cached<T>, Error>
    where
        R: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<E>, Error>>,
    {
        if !self.serve_stale_on_error {
            return Err(err);
        }
        let stale = match stored {
            Some(entry) => Some(entry),
            None => reload().await.ok().flatten(),
        };
        match stale {
            Some(entry) => {
                tracing::warn!(key, "serving stale data after fetch failure: {err}");
                Ok(Cached { data: into_data(entry), cache_status: CacheStatus::Stale })
            }
            None => Err(err),
        }
    }
}
