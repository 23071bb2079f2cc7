//! Call API exposed to the rest of the system.
//!
//! `Gateway` composes the read-through cache with the resilient executor so
//! provider code only supplies a fetch function and a parser, and exposes
//! availability, maintenance and health views over the shared state.

use crate::breaker::{Availability, BreakerSnapshot};
use crate::executor::{RawResponse, ResilientExecutor};
use crate::scheduler::{JobStats, MaintenanceReport, MaintenanceScheduler};
use bastion_core::cache::{SearchHit, SearchResults};
use bastion_core::{CacheOptions, CacheStore, Cached, Error, HealthStats};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Combined health view: cache counters, breakers and live sessions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayHealth {
    pub cache: HealthStats,
    pub breakers: Vec<BreakerSnapshot>,
    pub active_sessions: usize,
}

/// Entry point for provider code: cache-first reads, protected fetches and
/// operational views over the whole access layer.
pub struct Gateway {
    cache: CacheStore,
    executor: Arc<ResilientExecutor>,
    scheduler: Arc<MaintenanceScheduler>,
    recent_window: Duration,
}

impl Gateway {
    pub fn new(
        cache: CacheStore, executor: Arc<ResilientExecutor>, scheduler: Arc<MaintenanceScheduler>,
        recent_window: Duration,
    ) -> Self {
        Self { cache, executor, scheduler, recent_window }
    }

    pub fn cache(&self) -> &CacheStore {
        &self.cache
    }

    pub fn executor(&self) -> &Arc<ResilientExecutor> {
        &self.executor
    }

    pub fn scheduler(&self) -> &Arc<MaintenanceScheduler> {
        &self.scheduler
    }

    /// Plain read-through lookup with a caller-supplied fetch.
    pub async fn get_with_cache<F, Fut>(
        &self, key: &str, provider: &str, fetch: F, opts: CacheOptions,
    ) -> Result<Cached<Value>, Error>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value, Error>>,
    {
        self.cache.get_with_cache(key, provider, fetch, opts).await
    }

    /// Read-through lookup whose misses run through the resilient executor.
    ///
    /// `fetch` receives a session id and returns the raw response; `parse`
    /// turns the accepted response into the cached payload. A hit never
    /// consults the breaker.
    pub async fn fetch_with_cache<F, Fut, P>(
        &self, key: &str, provider: &str, target: &str, fetch: F, parse: P, opts: CacheOptions,
    ) -> Result<Cached<Value>, Error>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<RawResponse, Error>>,
        P: FnOnce(RawResponse) -> Result<Value, Error>,
    {
        self.cache
            .get_with_cache(
                key,
                provider,
                || async move {
                    let raw = self.executor.execute(target, fetch).await?;
                    parse(raw)
                },
                opts,
            )
            .await
    }

    /// Like [`fetch_with_cache`](Self::fetch_with_cache), loading `url`
    /// through the automation endpoint.
    pub async fn navigate_with_cache<P>(
        &self, key: &str, provider: &str, target: &str, url: &str, parse: P, opts: CacheOptions,
    ) -> Result<Cached<Value>, Error>
    where
        P: FnOnce(RawResponse) -> Result<Value, Error>,
    {
        self.cache
            .get_with_cache(
                key,
                provider,
                || async move {
                    let raw = self.executor.navigate(target, url).await?;
                    parse(raw)
                },
                opts,
            )
            .await
    }

    pub async fn search_with_cache<F, Fut>(
        &self, search: SearchHit<'_>, fetch: F, opts: CacheOptions,
    ) -> Result<Cached<SearchResults>, Error>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<SearchResults, Error>>,
    {
        self.cache.search_with_cache(search, fetch, opts).await
    }

    pub async fn invalidate(&self, key: &str) -> Result<bool, Error> {
        self.cache.invalidate(key).await
    }

    pub fn is_available(&self, target: &str) -> Availability {
        self.executor.breaker().is_available(target)
    }

    pub async fn run_maintenance_now(&self) -> MaintenanceReport {
        self.scheduler.run_now().await
    }

    pub async fn health_stats(&self) -> Result<GatewayHealth, Error> {
        Ok(GatewayHealth {
            cache: self.cache.db().health_stats(self.recent_window).await?,
            breakers: self.executor.breaker().snapshot(),
            active_sessions: self.executor.sessions().active_count(),
        })
    }

    pub async fn job_stats(&self) -> JobStats {
        self.scheduler.job_stats().await
    }
}
