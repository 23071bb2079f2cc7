//! Core types and shared functionality for bastion.
//!
//! This crate provides:
//! - Read-through cache with SQLite backend and TTL policy
//! - Unified error types
//! - Configuration structures

pub mod cache;
pub mod config;
pub mod error;

pub use cache::{CacheDb, CacheEntry, CacheOptions, CacheStatus, CacheStore, Cached, HealthStats, SearchCacheEntry};
pub use config::{AppConfig, ConfigError};
pub use error::{Error, ErrorResponse};
