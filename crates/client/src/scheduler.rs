//! Background maintenance sweep.
//!
//! Runs on a fixed tick independent of request traffic. Each cycle flags
//! popular entries that recently expired (logged only, refresh stays lazy),
//! takes a health snapshot, closes idle automation sessions and, when
//! enabled, purges long-unused low-value entries. A failing step is logged
//! and counted; it never stops the loop.

use crate::session::SessionManager;
use async_trait::async_trait;
use bastion_core::config::MaintenanceConfig;
use bastion_core::{CacheDb, CacheEntry, Error, HealthStats};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// Counters describing the scheduler's own health.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobStats {
    pub runs: u64,
    /// Cycles in which at least one step failed.
    pub failures: u64,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_duration_ms: Option<u64>,
    pub last_flagged: usize,
    /// Sessions closed across all cycles.
    pub sessions_closed: u64,
    pub last_error: Option<String>,
}

/// A popular entry that expired within the lookback window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlaggedEntry {
    pub key: String,
    pub provider: String,
    pub access_count: i64,
    pub expired_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurgeReport {
    pub entries: u64,
    pub searches: u64,
}

/// Outcome of one maintenance cycle.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MaintenanceReport {
    pub flagged: Vec<FlaggedEntry>,
    pub health: Option<HealthStats>,
    pub sessions_closed: usize,
    pub purged: Option<PurgeReport>,
    pub errors: Vec<String>,
}

/// Cache queries the sweep depends on.
#[async_trait]
pub trait MaintenanceStore: Send + Sync {
    async fn list_expired_popular(&self, lookback: Duration, min_access_count: i64) -> Result<Vec<CacheEntry>, Error>;
    async fn health_stats(&self, recent_window: Duration) -> Result<HealthStats, Error>;
    async fn delete_expired_below_popularity(&self, unused_for: Duration, max_access_count: i64) -> Result<u64, Error>;
    async fn purge_expired_search(&self) -> Result<u64, Error>;
}

#[async_trait]
impl MaintenanceStore for CacheDb {
    async fn list_expired_popular(&self, lookback: Duration, min_access_count: i64) -> Result<Vec<CacheEntry>, Error> {
        CacheDb::list_expired_popular(self, lookback, min_access_count).await
    }

    async fn health_stats(&self, recent_window: Duration) -> Result<HealthStats, Error> {
        CacheDb::health_stats(self, recent_window).await
    }

    async fn delete_expired_below_popularity(
        &self, unused_for: Duration, max_access_count: i64,
    ) -> Result<u64, Error> {
        CacheDb::delete_expired_below_popularity(self, unused_for, max_access_count).await
    }

    async fn purge_expired_search(&self) -> Result<u64, Error> {
        CacheDb::purge_expired_search(self).await
    }
}

/// Periodic cache and session upkeep, decoupled from request traffic.
pub struct MaintenanceScheduler {
    store: Arc<dyn MaintenanceStore>,
    sessions: Option<Arc<SessionManager>>,
    config: MaintenanceConfig,
    stats: Mutex<JobStats>,
}

impl MaintenanceScheduler {
    pub fn new(db: CacheDb, sessions: Option<Arc<SessionManager>>, config: MaintenanceConfig) -> Self {
        Self::with_store(Arc::new(db), sessions, config)
    }

    pub fn with_store(
        store: Arc<dyn MaintenanceStore>, sessions: Option<Arc<SessionManager>>, config: MaintenanceConfig,
    ) -> Self {
        Self { store, sessions, config, stats: Mutex::new(JobStats::default()) }
    }

    /// Start the sweep loop. It stops once `shutdown` is notified
    /// (`notify_one` stores a permit, so a signal sent mid-cycle is not lost).
    pub fn spawn(self: Arc<Self>, shutdown: Arc<Notify>) -> JoinHandle<()> {
        tokio::spawn(async move {
            if !self.config.enabled {
                tracing::info!("maintenance disabled");
                return;
            }
            tracing::info!(
                interval_secs = self.config.interval_secs,
                initial_delay_secs = self.config.initial_delay_secs,
                "maintenance loop started"
            );

            tokio::select! {
                _ = shutdown.notified() => {
                    tracing::info!("maintenance loop stopping before first run");
                    return;
                }
                _ = tokio::time::sleep(self.config.initial_delay()) => {}
            }

            let mut ticker = tokio::time::interval(self.config.interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.notified() => {
                        tracing::info!("maintenance loop stopping");
                        break;
                    }
                    _ = ticker.tick() => {
                        self.run_now().await;
                    }
                }
            }
        })
    }

    /// Run one cycle immediately and record it in the job stats.
    pub async fn run_now(&self) -> MaintenanceReport {
        let started = Instant::now();
        let mut report = MaintenanceReport::default();

        match self.flag_popular_expired().await {
            Ok(flagged) => report.flagged = flagged,
            Err(e) => report.errors.push(format!("popular scan: {e}")),
        }

        match self.store.health_stats(self.config.recent_window()).await {
            Ok(health) => {
                tracing::info!(
                    total = health.total_entries,
                    expired = health.expired_entries,
                    valid = health.valid_entries,
                    recently_accessed = health.recently_accessed,
                    recently_created = health.recently_created,
                    avg_access = health.avg_access_count,
                    max_access = health.max_access_count,
                    "cache health"
                );
                report.health = Some(health);
            }
            Err(e) => report.errors.push(format!("health snapshot: {e}")),
        }

        if let Some(sessions) = &self.sessions {
            report.sessions_closed = sessions.close_idle().await;
            if report.sessions_closed > 0 {
                tracing::info!(closed = report.sessions_closed, "closed idle automation sessions");
            }
        }

        if self.config.purge_enabled {
            match self.purge_unpopular().await {
                Ok(purged) => report.purged = Some(purged),
                Err(e) => report.errors.push(format!("purge: {e}")),
            }
        }

        for error in &report.errors {
            tracing::warn!("maintenance step failed: {error}");
        }

        let mut stats = self.stats.lock().await;
        stats.runs += 1;
        stats.last_run_at = Some(Utc::now());
        stats.last_duration_ms = Some(started.elapsed().as_millis() as u64);
        stats.last_flagged = report.flagged.len();
        stats.sessions_closed += report.sessions_closed as u64;
        if report.errors.is_empty() {
            stats.last_error = None;
        } else {
            stats.failures += 1;
            stats.last_error = report.errors.first().cloned();
        }

        report
    }

    /// Log popular entries that expired within the lookback window. Nothing
    /// is refetched or removed.
    async fn flag_popular_expired(&self) -> Result<Vec<FlaggedEntry>, Error> {
        let entries = self
            .store
            .list_expired_popular(self.config.lookback(), self.config.popularity_threshold)
            .await?;

        let flagged: Vec<FlaggedEntry> = entries
            .into_iter()
            .map(|e| FlaggedEntry {
                key: e.key,
                provider: e.provider,
                access_count: e.access_count,
                expired_at: e.expires_at,
            })
            .collect();

        for entry in &flagged {
            tracing::info!(
                key = %entry.key,
                provider = %entry.provider,
                access_count = entry.access_count,
                expired_at = %entry.expired_at,
                "popular entry expired, will refresh on next read"
            );
        }
        Ok(flagged)
    }

    /// Delete expired entries unused for `purge_unused_days` with at most
    /// `purge_max_access_count` hits, plus all expired search results.
    pub async fn purge_unpopular(&self) -> Result<PurgeReport, Error> {
        let entries = self
            .store
            .delete_expired_below_popularity(self.config.purge_unused(), self.config.purge_max_access_count)
            .await?;
        let searches = self.store.purge_expired_search().await?;
        tracing::info!(entries, searches, "purged unpopular cache entries");
        Ok(PurgeReport { entries, searches })
    }

    pub async fn job_stats(&self) -> JobStats {
        self.stats.lock().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::FakeAutomation;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Store whose popular-entry scan fails while `broken` is set.
    #[derive(Default)]
    struct FlakyStore {
        broken: AtomicBool,
    }

    #[async_trait]
    impl MaintenanceStore for FlakyStore {
        async fn list_expired_popular(&self, _: Duration, _: i64) -> Result<Vec<CacheEntry>, Error> {
            if self.broken.load(Ordering::SeqCst) {
                return Err(Error::InfraFault("database is locked".into()));
            }
            Ok(Vec::new())
        }

        async fn health_stats(&self, _: Duration) -> Result<HealthStats, Error> {
            Ok(HealthStats { total_entries: 3, ..HealthStats::default() })
        }

        async fn delete_expired_below_popularity(&self, _: Duration, _: i64) -> Result<u64, Error> {
            Ok(0)
        }

        async fn purge_expired_search(&self) -> Result<u64, Error> {
            Ok(0)
        }
    }

    fn entry(key: &str, expired_secs_ago: i64, access_count: i64, last_accessed_days_ago: i64) -> CacheEntry {
        let now = Utc::now();
        CacheEntry {
            key: key.to_string(),
            provider: "bgg".to_string(),
            payload: json!({"id": key}),
            created_at: now - chrono::Duration::days(90),
            expires_at: now - chrono::Duration::seconds(expired_secs_ago),
            access_count,
            last_accessed: now - chrono::Duration::days(last_accessed_days_ago),
        }
    }

    fn config() -> MaintenanceConfig {
        MaintenanceConfig { popularity_threshold: 10, ..MaintenanceConfig::default() }
    }

    #[tokio::test]
    async fn test_popular_expired_entry_is_flagged_not_removed() {
        let db = CacheDb::open_in_memory().await.unwrap();
        db.upsert_entry(&entry("bgg:13", 600, 12, 0)).await.unwrap();
        db.upsert_entry(&entry("bgg:unpopular", 600, 3, 0)).await.unwrap();

        let scheduler = MaintenanceScheduler::new(db.clone(), None, config());
        let report = scheduler.run_now().await;

        assert_eq!(report.flagged.len(), 1);
        assert_eq!(report.flagged[0].key, "bgg:13");
        assert_eq!(report.flagged[0].access_count, 12);
        assert!(report.errors.is_empty());

        let stored = db.get_entry("bgg:13").await.unwrap().unwrap();
        assert_eq!(stored.payload, json!({"id": "bgg:13"}));
        assert_eq!(stored.access_count, 12);
        assert!(stored.is_expired());
    }

    #[tokio::test]
    async fn test_cycle_reports_health_and_stats() {
        let db = CacheDb::open_in_memory().await.unwrap();
        db.put_entry("lego:75192", "lego", &json!({"pieces": 7541}), Duration::from_secs(3600))
            .await
            .unwrap();
        db.upsert_entry(&entry("bgg:13", 600, 12, 0)).await.unwrap();

        let scheduler = MaintenanceScheduler::new(db, None, config());
        let report = scheduler.run_now().await;

        let health = report.health.unwrap();
        assert_eq!(health.total_entries, 2);
        assert_eq!(health.expired_entries, 1);
        assert_eq!(health.max_access_count, 12);
        assert!(report.purged.is_none());

        let stats = scheduler.job_stats().await;
        assert_eq!(stats.runs, 1);
        assert_eq!(stats.failures, 0);
        assert_eq!(stats.last_flagged, 1);
        assert!(stats.last_run_at.is_some());
        assert!(stats.last_error.is_none());
    }

    #[tokio::test]
    async fn test_cycle_closes_idle_sessions() {
        let db = CacheDb::open_in_memory().await.unwrap();
        let automation = Arc::new(FakeAutomation::new());
        let sessions = Arc::new(SessionManager::new(automation.clone(), Duration::from_millis(20)));
        sessions.acquire("bgg", false).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let scheduler = MaintenanceScheduler::new(db, Some(sessions.clone()), config());
        let report = scheduler.run_now().await;

        assert_eq!(report.sessions_closed, 1);
        assert_eq!(sessions.active_count(), 0);
        assert_eq!(scheduler.job_stats().await.sessions_closed, 1);
    }

    #[tokio::test]
    async fn test_purge_only_when_enabled() {
        let db = CacheDb::open_in_memory().await.unwrap();
        db.upsert_entry(&entry("stale:cold", 86_400, 1, 45)).await.unwrap();
        db.upsert_entry(&entry("stale:popular", 86_400, 40, 45)).await.unwrap();
        db.upsert_entry(&entry("stale:recent", 86_400, 1, 2)).await.unwrap();

        let scheduler = MaintenanceScheduler::new(db.clone(), None, config());
        scheduler.run_now().await;
        assert!(db.get_entry("stale:cold").await.unwrap().is_some());

        let purging = MaintenanceScheduler::new(db.clone(), None, MaintenanceConfig { purge_enabled: true, ..config() });
        let report = purging.run_now().await;

        assert_eq!(report.purged, Some(PurgeReport { entries: 1, searches: 0 }));
        assert!(db.get_entry("stale:cold").await.unwrap().is_none());
        assert!(db.get_entry("stale:popular").await.unwrap().is_some());
        assert!(db.get_entry("stale:recent").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_failing_step_is_counted_and_others_still_run() {
        let store = Arc::new(FlakyStore::default());
        store.broken.store(true, Ordering::SeqCst);
        let scheduler = MaintenanceScheduler::with_store(store.clone(), None, config());

        let report = scheduler.run_now().await;
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].contains("database is locked"));
        assert_eq!(report.health.unwrap().total_entries, 3);

        let stats = scheduler.job_stats().await;
        assert_eq!(stats.runs, 1);
        assert_eq!(stats.failures, 1);
        assert!(stats.last_error.unwrap().contains("popular scan"));

        store.broken.store(false, Ordering::SeqCst);
        assert!(scheduler.run_now().await.errors.is_empty());
        let stats = scheduler.job_stats().await;
        assert_eq!(stats.runs, 2);
        assert_eq!(stats.failures, 1);
        assert!(stats.last_error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_keeps_ticking_after_failures() {
        let store = Arc::new(FlakyStore::default());
        store.broken.store(true, Ordering::SeqCst);
        let scheduler = Arc::new(MaintenanceScheduler::with_store(
            store,
            None,
            MaintenanceConfig { initial_delay_secs: 0, interval_secs: 60, ..config() },
        ));
        let shutdown = Arc::new(Notify::new());

        let handle = scheduler.clone().spawn(shutdown.clone());
        tokio::time::sleep(Duration::from_secs(150)).await;

        let stats = scheduler.job_stats().await;
        assert!(stats.runs >= 2);
        assert_eq!(stats.failures, stats.runs);

        shutdown.notify_one();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_spawned_loop_runs_and_stops() {
        let db = CacheDb::open_in_memory().await.unwrap();
        let scheduler = Arc::new(MaintenanceScheduler::new(
            db,
            None,
            MaintenanceConfig { initial_delay_secs: 0, interval_secs: 3600, ..config() },
        ));
        let shutdown = Arc::new(Notify::new());

        let handle = scheduler.clone().spawn(shutdown.clone());
        tokio::time::sleep(Duration::from_millis(300)).await;
        shutdown.notify_one();
        tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();

        assert_eq!(scheduler.job_stats().await.runs, 1);
    }

    #[tokio::test]
    async fn test_shutdown_during_initial_delay() {
        let db = CacheDb::open_in_memory().await.unwrap();
        let scheduler = Arc::new(MaintenanceScheduler::new(db, None, config()));
        let shutdown = Arc::new(Notify::new());

        let handle = scheduler.clone().spawn(shutdown.clone());
        shutdown.notify_one();
        tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();

        assert_eq!(scheduler.job_stats().await.runs, 0);
    }

    #[tokio::test]
    async fn test_disabled_loop_exits() {
        let db = CacheDb::open_in_memory().await.unwrap();
        let scheduler = Arc::new(MaintenanceScheduler::new(
            db,
            None,
            MaintenanceConfig { enabled: false, ..config() },
        ));

        let handle = scheduler.clone().spawn(Arc::new(Notify::new()));
        tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
        assert_eq!(scheduler.job_stats().await.runs, 0);
    }
}
