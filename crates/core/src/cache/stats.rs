//! Aggregate health counters over the cache tables.

use super::connection::CacheDb;
use crate::Error;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio_rusqlite::params;

/// Snapshot of cache health, computed in a single pass over each table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HealthStats {
    pub total_entries: i64,
    pub expired_entries: i64,
    pub valid_entries: i64,
    /// Entries read within the recent window.
    pub recently_accessed: i64,
    /// Entries (re)created within the recent window.
    pub recently_created: i64,
    pub avg_access_count: f64,
    pub max_access_count: i64,
    pub search_total: i64,
    pub search_expired: i64,
}

impl CacheDb {
    /// Compute aggregate counters; `recent_window` bounds the "recently" counters.
    pub async fn health_stats(&self, recent_window: Duration) -> Result<HealthStats, Error> {
        let now = Utc::now().timestamp_millis();
        let recent_since = now - recent_window.as_millis() as i64;
        self.conn
            .call(move |conn| -> Result<HealthStats, Error> {
                let mut stats = conn.query_row(
                    "SELECT
                        COUNT(*),
                        COALESCE(SUM(CASE WHEN expires_at <= ?1 THEN 1 ELSE 0 END), 0),
                        COALESCE(SUM(CASE WHEN last_accessed >= ?2 THEN 1 ELSE 0 END), 0),
                        COALESCE(SUM(CASE WHEN created_at >= ?2 THEN 1 ELSE 0 END), 0),
                        COALESCE(AVG(access_count), 0.0),
                        COALESCE(MAX(access_count), 0)
                     FROM cache_entries",
                    params![now, recent_since],
                    |row| {
                        Ok(HealthStats {
                            total_entries: row.get(0)?,
                            expired_entries: row.get(1)?,
                            valid_entries: 0,
                            recently_accessed: row.get(2)?,
                            recently_created: row.get(3)?,
                            avg_access_count: row.get(4)?,
                            max_access_count: row.get(5)?,
                            search_total: 0,
                            search_expired: 0,
                        })
                    },
                )?;
                stats.valid_entries = stats.total_entries - stats.expired_entries;

                let (search_total, search_expired): (i64, i64) = conn.query_row(
                    "SELECT COUNT(*), COALESCE(SUM(CASE WHEN expires_at <= ?1 THEN 1 ELSE 0 END), 0)
                     FROM search_cache",
                    params![now],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )?;
                stats.search_total = search_total;
                stats.search_expired = search_expired;

                Ok(stats)
            })
            .await
            .map_err(Error::from)
    }
}
