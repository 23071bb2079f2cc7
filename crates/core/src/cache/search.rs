//! Search cache operations.
//!
//! Provides functions for caching and retrieving provider search results
//! keyed by query fingerprint. Result identifiers keep the order the
//! provider returned them in.

use super::connection::CacheDb;
use super::from_millis;
use crate::Error;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio_rusqlite::params;
use tokio_rusqlite::rusqlite;

/// A cached search result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchCacheEntry {
    pub fingerprint: String,
    pub query: String,
    pub provider: String,
    pub params: serde_json::Value,
    /// Result identifiers, verbatim from the source fetch.
    pub result_ids: Vec<String>,
    /// Optional denormalized copy of the full results.
    pub snapshot: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub access_count: i64,
    pub last_accessed: DateTime<Utc>,
}

impl SearchCacheEntry {
    pub fn is_expired(&self) -> bool {
        self.expires_at <= Utc::now()
    }
}

struct RawSearchRow {
    fingerprint: String,
    query: String,
    provider: String,
    params_json: String,
    result_ids_json: String,
    snapshot_json: Option<String>,
    created_at: i64,
    expires_at: i64,
    access_count: i64,
    last_accessed: i64,
}

impl RawSearchRow {
    fn decode(self) -> Result<SearchCacheEntry, Error> {
        Ok(SearchCacheEntry {
            fingerprint: self.fingerprint,
            query: self.query,
            provider: self.provider,
            params: serde_json::from_str(&self.params_json)?,
            result_ids: serde_json::from_str(&self.result_ids_json)?,
            snapshot: self.snapshot_json.as_deref().map(serde_json::from_str).transpose()?,
            created_at: from_millis(self.created_at),
            expires_at: from_millis(self.expires_at),
            access_count: self.access_count,
            last_accessed: from_millis(self.last_accessed),
        })
    }
}

impl CacheDb {
    /// Get a cached search result by fingerprint, fresh or expired.
    ///
    /// Returns None if the fingerprint doesn't exist in the cache.
    pub async fn get_search(&self, fingerprint: &str) -> Result<Option<SearchCacheEntry>, Error> {
        let fingerprint = fingerprint.to_string();
        self.conn
            .call(move |conn| -> Result<Option<SearchCacheEntry>, Error> {
                let mut stmt = conn.prepare(
                    "SELECT fingerprint, query, provider, params_json, result_ids, snapshot_json,
                            created_at, expires_at, access_count, last_accessed
                     FROM search_cache WHERE fingerprint = ?1",
                )?;

                let result = stmt.query_row(params![fingerprint], |row| {
                    Ok(RawSearchRow {
                        fingerprint: row.get(0)?,
                        query: row.get(1)?,
                        provider: row.get(2)?,
                        params_json: row.get(3)?,
                        result_ids_json: row.get(4)?,
                        snapshot_json: row.get(5)?,
                        created_at: row.get(6)?,
                        expires_at: row.get(7)?,
                        access_count: row.get(8)?,
                        last_accessed: row.get(9)?,
                    })
                });

                match result {
                    Ok(raw) => Ok(Some(raw.decode()?)),
                    Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                    Err(e) => Err(e.into()),
                }
            })
            .await
            .map_err(Error::from)
    }

    /// Insert or update a cached search result expiring `ttl` from now.
    ///
    /// Uses UPSERT semantics: results, snapshot and timestamps are replaced;
    /// access tracking of an existing row survives.
    #[allow(clippy::too_many_arguments)]
    pub async fn put_search(
        &self, fingerprint: &str, query: &str, provider: &str, params: &serde_json::Value, result_ids: &[String],
        snapshot: Option<&serde_json::Value>, ttl: Duration,
    ) -> Result<SearchCacheEntry, Error> {
        if ttl.is_zero() {
            return Err(Error::InvalidInput(format!("ttl for search {fingerprint} must be greater than zero")));
        }
        let now = Utc::now();
        let expires_at = super::expiry_after(now, ttl).ok_or_else(|| {
            Error::InvalidInput(format!("ttl for search {fingerprint} is out of range: {}s", ttl.as_secs()))
        })?;
        let entry = SearchCacheEntry {
            fingerprint: fingerprint.to_string(),
            query: query.to_string(),
            provider: provider.to_string(),
            params: params.clone(),
            result_ids: result_ids.to_vec(),
            snapshot: snapshot.cloned(),
            created_at: now,
            expires_at,
            access_count: 0,
            last_accessed: now,
        };

        let params_json = serde_json::to_string(&entry.params)?;
        let result_ids_json = serde_json::to_string(&entry.result_ids)?;
        let snapshot_json = entry.snapshot.as_ref().map(serde_json::to_string).transpose()?;
        let row = entry.clone();

        self.conn
            .call(move |conn| -> Result<(), Error> {
                conn.execute(
                    "INSERT INTO search_cache (fingerprint, query, provider, params_json, result_ids, snapshot_json,
                                               created_at, expires_at, access_count, last_accessed)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                    ON CONFLICT(fingerprint) DO UPDATE SET
                        query = excluded.query,
                        provider = excluded.provider,
                        params_json = excluded.params_json,
                        result_ids = excluded.result_ids,
                        snapshot_json = excluded.snapshot_json,
                        created_at = excluded.created_at,
                        expires_at = excluded.expires_at",
                    params![
                        row.fingerprint,
                        row.query,
                        row.provider,
                        params_json,
                        result_ids_json,
                        snapshot_json,
                        row.created_at.timestamp_millis(),
                        row.expires_at.timestamp_millis(),
                        row.access_count,
                        row.last_accessed.timestamp_millis(),
                    ],
                )?;
                Ok(())
            })
            .await
            .map_err(Error::from)?;

        Ok(entry)
    }

    /// Record a search cache hit.
    pub async fn touch_search(&self, fingerprint: &str) -> Result<bool, Error> {
        let fingerprint = fingerprint.to_string();
        let now = Utc::now().timestamp_millis();
        self.conn
            .call(move |conn| -> Result<bool, Error> {
                let updated = conn.execute(
                    "UPDATE search_cache SET access_count = access_count + 1, last_accessed = ?2
                     WHERE fingerprint = ?1",
                    params![fingerprint, now],
                )?;
                Ok(updated > 0)
            })
            .await
            .map_err(Error::from)
    }

    /// Delete a search result regardless of its remaining TTL.
    pub async fn delete_search(&self, fingerprint: &str) -> Result<bool, Error> {
        let fingerprint = fingerprint.to_string();
        self.conn
            .call(move |conn| -> Result<bool, Error> {
                let deleted = conn.execute("DELETE FROM search_cache WHERE fingerprint = ?1", params![fingerprint])?;
                Ok(deleted > 0)
            })
            .await
            .map_err(Error::from)
    }

    /// Delete expired search cache entries.
    ///
    /// Returns the number of deleted entries.
    pub async fn purge_expired_search(&self) -> Result<u64, Error> {
        let now = Utc::now().timestamp_millis();
        self.conn
            .call(move |conn| -> Result<u64, Error> {
                let count = conn.execute("DELETE FROM search_cache WHERE expires_at <= ?1", params![now])?;
                Ok(count as u64)
            })
            .await
            .map_err(Error::from)
    }
}
