//! SQLite-backed cache for provider payloads and search results.
//!
//! This module provides a persistent read-through cache using SQLite
//! with async access via tokio-rusqlite. It supports:
//!
//! - Keyed payload entries with per-provider TTLs and access tracking
//! - Search results keyed by a SHA-256 query fingerprint
//! - Automatic schema migrations
//! - WAL mode for concurrent access
//! - Aggregate health counters and a popularity-aware purge

pub mod connection;
pub mod entries;
pub mod hash;
pub mod migrations;
pub mod search;
pub mod stats;
pub mod store;

pub use crate::Error;

pub use connection::CacheDb;
pub use entries::CacheEntry;
pub use search::SearchCacheEntry;
pub use stats::HealthStats;
pub use store::{CacheOptions, CacheStatus, CacheStore, Cached, SearchHit, SearchResults, TtlPolicy};

use chrono::{DateTime, Utc};

/// Convert a stored millisecond timestamp back to UTC.
pub(crate) fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

/// `now + ttl`, or None when the result leaves chrono's date range.
pub(crate) fn expiry_after(now: DateTime<Utc>, ttl: std::time::Duration) -> Option<DateTime<Utc>> {
    let ttl = chrono::Duration::from_std(ttl).ok()?;
    now.checked_add_signed(ttl)
}
