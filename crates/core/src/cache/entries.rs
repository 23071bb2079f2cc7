//! Cache entry CRUD operations.
//!
//! Provides the keyed payload table behind the read-through cache:
//! lookup, upsert with TTL, hit tracking, invalidation, and the
//! maintenance-only queries (popular expired scan, unpopular purge).

use super::connection::CacheDb;
use super::from_millis;
use crate::Error;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio_rusqlite::params;
use tokio_rusqlite::rusqlite;

/// A cached provider payload.
///
/// The payload is replaced wholesale on refresh, never merged.
/// `access_count` and `last_accessed` carry over across refreshes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Caller-chosen key, usually `provider:id`.
    pub key: String,
    /// Source that produced the payload; selects the TTL.
    pub provider: String,
    pub payload: serde_json::Value,
    /// When the payload was last (re)fetched.
    pub created_at: DateTime<Utc>,
    /// Always strictly after `created_at`.
    pub expires_at: DateTime<Utc>,
    /// Cache hits since the key was first stored.
    pub access_count: i64,
    pub last_accessed: DateTime<Utc>,
}

impl CacheEntry {
    /// Build a fresh entry expiring `ttl` from now.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidInput` for a zero TTL or one that pushes the
    /// expiry past the representable date range.
    pub fn new(key: &str, provider: &str, payload: serde_json::Value, ttl: Duration) -> Result<Self, Error> {
        if ttl.is_zero() {
            return Err(Error::InvalidInput(format!("ttl for {key} must be greater than zero")));
        }
        let now = Utc::now();
        let expires_at = super::expiry_after(now, ttl)
            .ok_or_else(|| Error::InvalidInput(format!("ttl for {key} is out of range: {}s", ttl.as_secs())))?;
        Ok(Self {
            key: key.to_string(),
            provider: provider.to_string(),
            payload,
            created_at: now,
            expires_at,
            access_count: 0,
            last_accessed: now,
        })
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }
}

const SELECT_ENTRY: &str = "SELECT key, provider, payload, created_at, expires_at, access_count, last_accessed
     FROM cache_entries";

fn entry_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<(CacheEntry, String)> {
    let raw_payload: String = row.get(2)?;
    Ok((
        CacheEntry {
            key: row.get(0)?,
            provider: row.get(1)?,
            payload: serde_json::Value::Null,
            created_at: from_millis(row.get(3)?),
            expires_at: from_millis(row.get(4)?),
            access_count: row.get(5)?,
            last_accessed: from_millis(row.get(6)?),
        },
        raw_payload,
    ))
}

fn decode(row: (CacheEntry, String)) -> Result<CacheEntry, Error> {
    let (mut entry, raw) = row;
    entry.payload = serde_json::from_str(&raw)?;
    Ok(entry)
}

impl CacheDb {
    /// Get an entry by key, fresh or expired.
    ///
    /// Returns None if the key doesn't exist in the cache.
    pub async fn get_entry(&self, key: &str) -> Result<Option<CacheEntry>, Error> {
        let key = key.to_string();
        self.conn
            .call(move |conn| -> Result<Option<CacheEntry>, Error> {
                let mut stmt = conn.prepare(&format!("{SELECT_ENTRY} WHERE key = ?1"))?;
                let result = stmt.query_row(params![key], entry_from_row);

                match result {
                    Ok(row) => Ok(Some(decode(row)?)),
                    Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                    Err(e) => Err(e.into()),
                }
            })
            .await
            .map_err(Error::from)
    }

    /// Insert or replace an entry.
    ///
    /// Uses UPSERT semantics: payload, `created_at` and `expires_at` are
    /// overwritten; `access_count` and `last_accessed` of an existing row survive.
    pub async fn upsert_entry(&self, entry: &CacheEntry) -> Result<(), Error> {
        if entry.expires_at <= entry.created_at {
            return Err(Error::InvalidInput(format!("entry {} must expire after it is created", entry.key)));
        }
        let payload = serde_json::to_string(&entry.payload)?;
        let entry = entry.clone();
        self.conn
            .call(move |conn| -> Result<(), Error> {
                conn.execute(
                    "INSERT INTO cache_entries (key, provider, payload, created_at, expires_at, access_count, last_accessed)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                    ON CONFLICT(key) DO UPDATE SET
                        provider = excluded.provider,
                        payload = excluded.payload,
                        created_at = excluded.created_at,
                        expires_at = excluded.expires_at",
                    params![
                        &entry.key,
                        &entry.provider,
                        payload,
                        entry.created_at.timestamp_millis(),
                        entry.expires_at.timestamp_millis(),
                        entry.access_count,
                        entry.last_accessed.timestamp_millis(),
                    ],
                )?;
                Ok(())
            })
            .await
            .map_err(Error::from)
    }

    /// Store a freshly fetched payload expiring `ttl` from now.
    pub async fn put_entry(
        &self, key: &str, provider: &str, payload: &serde_json::Value, ttl: Duration,
    ) -> Result<CacheEntry, Error> {
        let entry = CacheEntry::new(key, provider, payload.clone(), ttl)?;
        self.upsert_entry(&entry).await?;
        Ok(entry)
    }

    /// Record a cache hit: `access_count += 1`, `last_accessed = now`.
    ///
    /// Returns false if the key no longer exists.
    pub async fn touch_entry(&self, key: &str) -> Result<bool, Error> {
        let key = key.to_string();
        let now = Utc::now().timestamp_millis();
        self.conn
            .call(move |conn| -> Result<bool, Error> {
                let updated = conn.execute(
                    "UPDATE cache_entries SET access_count = access_count + 1, last_accessed = ?2 WHERE key = ?1",
                    params![key, now],
                )?;
                Ok(updated > 0)
            })
            .await
            .map_err(Error::from)
    }

    /// Delete an entry regardless of its remaining TTL.
    ///
    /// Returns true if a row was removed.
    pub async fn delete_entry(&self, key: &str) -> Result<bool, Error> {
        let key = key.to_string();
        self.conn
            .call(move |conn| -> Result<bool, Error> {
                let deleted = conn.execute("DELETE FROM cache_entries WHERE key = ?1", params![key])?;
                Ok(deleted > 0)
            })
            .await
            .map_err(Error::from)
    }

    /// Entries that expired within `lookback` and whose `access_count`
    /// exceeds `min_access_count`, most popular first.
    pub async fn list_expired_popular(
        &self, lookback: Duration, min_access_count: i64,
    ) -> Result<Vec<CacheEntry>, Error> {
        let now = Utc::now().timestamp_millis();
        let since = now - lookback.as_millis() as i64;
        self.conn
            .call(move |conn| -> Result<Vec<CacheEntry>, Error> {
                let mut stmt = conn.prepare(&format!(
                    "{SELECT_ENTRY}
                     WHERE expires_at <= ?1 AND expires_at > ?2 AND access_count > ?3
                     ORDER BY access_count DESC"
                ))?;
                let rows = stmt.query_map(params![now, since, min_access_count], entry_from_row)?;

                let mut entries = Vec::new();
                for row in rows {
                    entries.push(decode(row?)?);
                }
                Ok(entries)
            })
            .await
            .map_err(Error::from)
    }

    /// Delete expired entries that have not been read for `unused_for` and
    /// whose `access_count` is at most `max_access_count`.
    ///
    /// Returns the number of deleted entries.
    pub async fn delete_expired_below_popularity(
        &self, unused_for: Duration, max_access_count: i64,
    ) -> Result<u64, Error> {
        let now = Utc::now().timestamp_millis();
        let unused_since = now - unused_for.as_millis() as i64;
        self.conn
            .call(move |conn| -> Result<u64, Error> {
                let count = conn.execute(
                    "DELETE FROM cache_entries
                     WHERE expires_at <= ?1 AND last_accessed < ?2 AND access_count <= ?3",
                    params![now, unused_since, max_access_count],
                )?;
                Ok(count as u64)
            })
            .await
            .map_err(Error::from)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;

    /// Entry whose timestamps are offset from now, for expiry scenarios.
    pub(crate) fn entry_at(key: &str, created_ago_secs: i64, expires_in_secs: i64, access_count: i64) -> CacheEntry {
        let now = Utc::now();
        CacheEntry {
            key: key.to_string(),
            provider: "test".to_string(),
            payload: json!({ "key": key }),
            created_at: now - chrono::Duration::seconds(created_ago_secs),
            expires_at: now + chrono::Duration::seconds(expires_in_secs),
            access_count,
            last_accessed: now - chrono::Duration::seconds(created_ago_secs),
        }
    }

    #[tokio::test]
    async fn test_put_and_get() {
        let db = CacheDb::open_in_memory().await.unwrap();
        let payload = json!({"title": "Millennium Falcon", "pieces": 7541});

        db.put_entry("lego:75192", "lego", &payload, Duration::from_secs(3600))
            .await
            .unwrap();

        let entry = db.get_entry("lego:75192").await.unwrap().unwrap();
        assert_eq!(entry.payload, payload);
        assert_eq!(entry.provider, "lego");
        assert_eq!(entry.access_count, 0);
        assert!(entry.expires_at > entry.created_at);
        assert!(!entry.is_expired());
    }

    #[tokio::test]
    async fn test_get_missing() {
        let db = CacheDb::open_in_memory().await.unwrap();
        assert!(db.get_entry("nonexistent").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_zero_ttl_rejected() {
        let db = CacheDb::open_in_memory().await.unwrap();
        let result = db.put_entry("k", "p", &json!(1), Duration::ZERO).await;
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_out_of_range_ttl_rejected() {
        let db = CacheDb::open_in_memory().await.unwrap();
        let ttl = Duration::from_secs(10_000_000_000_000);
        let result = db.put_entry("k", "p", &json!(1), ttl).await;
        assert!(matches!(result, Err(Error::InvalidInput(_))));
        assert!(db.get_entry("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_touch_increments_access() {
        let db = CacheDb::open_in_memory().await.unwrap();
        db.put_entry("k", "p", &json!(1), Duration::from_secs(60)).await.unwrap();

        assert!(db.touch_entry("k").await.unwrap());
        assert!(db.touch_entry("k").await.unwrap());
        assert!(!db.touch_entry("missing").await.unwrap());

        let entry = db.get_entry("k").await.unwrap().unwrap();
        assert_eq!(entry.access_count, 2);
    }

    #[tokio::test]
    async fn test_refresh_replaces_payload_and_keeps_popularity() {
        let db = CacheDb::open_in_memory().await.unwrap();
        db.put_entry("k", "p", &json!({"a": 1, "b": 2}), Duration::from_secs(60))
            .await
            .unwrap();
        db.touch_entry("k").await.unwrap();

        db.put_entry("k", "p", &json!({"c": 3}), Duration::from_secs(120))
            .await
            .unwrap();

        let entry = db.get_entry("k").await.unwrap().unwrap();
        assert_eq!(entry.payload, json!({"c": 3}));
        assert_eq!(entry.access_count, 1);
    }

    #[tokio::test]
    async fn test_delete_entry() {
        let db = CacheDb::open_in_memory().await.unwrap();
        db.put_entry("k", "p", &json!(1), Duration::from_secs(60)).await.unwrap();

        assert!(db.delete_entry("k").await.unwrap());
        assert!(!db.delete_entry("k").await.unwrap());
        assert!(db.get_entry("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_expired_popular() {
        let db = CacheDb::open_in_memory().await.unwrap();
        db.upsert_entry(&entry_at("popular", 7200, -600, 12)).await.unwrap();
        db.upsert_entry(&entry_at("unpopular", 7200, -600, 3)).await.unwrap();
        db.upsert_entry(&entry_at("fresh", 60, 600, 50)).await.unwrap();
        db.upsert_entry(&entry_at("ancient", 90_000, -7200, 50)).await.unwrap();

        let flagged = db
            .list_expired_popular(Duration::from_secs(3600), 10)
            .await
            .unwrap();

        let keys: Vec<_> = flagged.iter().map(|e| e.key.as_str()).collect();
        assert_eq!(keys, vec!["popular"]);
    }

    #[tokio::test]
    async fn test_delete_expired_below_popularity() {
        let db = CacheDb::open_in_memory().await.unwrap();
        db.upsert_entry(&entry_at("stale-unloved", 90_000, -3600, 1)).await.unwrap();
        db.upsert_entry(&entry_at("stale-loved", 90_000, -3600, 40)).await.unwrap();
        db.upsert_entry(&entry_at("fresh-unloved", 90_000, 3600, 0)).await.unwrap();

        let deleted = db
            .delete_expired_below_popularity(Duration::from_secs(3600), 2)
            .await
            .unwrap();

        assert_eq!(deleted, 1);
        assert!(db.get_entry("stale-unloved").await.unwrap().is_none());
        assert!(db.get_entry("stale-loved").await.unwrap().is_some());
        assert!(db.get_entry("fresh-unloved").await.unwrap().is_some());
    }
}
