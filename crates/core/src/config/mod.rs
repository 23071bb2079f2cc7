//! Application configuration with layered loading.
//!
//! This module provides configuration management using figment for layered
//! configuration loading from multiple sources:
//!
//! 1. Environment variables (BASTION_*, nested keys split on `__`)
//! 2. TOML config file (if BASTION_CONFIG_FILE set)
//! 3. Built-in defaults

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};

mod validation;

pub use validation::ConfigError;

/// Application configuration with layered loading.
///
/// Loading precedence (highest wins):
/// 1. Environment variables (BASTION_*)
/// 2. TOML config file (if BASTION_CONFIG_FILE set)
/// 3. Built-in defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Path to SQLite cache database.
    ///
    /// Set via BASTION_DB_PATH environment variable.
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub breaker: BreakerConfig,

    #[serde(default)]
    pub egress: EgressConfig,

    #[serde(default)]
    pub session: SessionConfig,

    #[serde(default)]
    pub executor: ExecutorConfig,

    #[serde(default)]
    pub maintenance: MaintenanceConfig,
}

/// TTL policy and fallback behaviour of the cache store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// TTL applied when a provider has no entry in `provider_ttl_secs`.
    #[serde(default = "default_ttl_secs")]
    pub default_ttl_secs: u64,

    /// Provider-specific TTLs, keyed by provider name.
    #[serde(default)]
    pub provider_ttl_secs: HashMap<String, u64>,

    /// Return an expired entry (tagged STALE) when the refresh fails.
    #[serde(default)]
    pub serve_stale_on_error: bool,
}

/// Per-target circuit breaker thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive blocking failures before the breaker opens.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Seconds the breaker stays open before letting a probe through.
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
}

/// Network tunnel control and egress safety checks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EgressConfig {
    /// When false, fetches skip egress verification and rotation entirely.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Base URL of the tunnel control server.
    #[serde(default = "default_egress_control_url")]
    pub control_url: String,

    /// Plain-text IP echo endpoint used once at startup to learn the host IP.
    #[serde(default = "default_host_ip_probe_url")]
    pub host_ip_probe_url: String,

    /// How long a check result is reused before asking the tunnel again.
    #[serde(default = "default_check_ttl_secs")]
    pub check_ttl_secs: u64,

    /// Pause between stopping and restarting the tunnel.
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,

    /// Polls after restart before a rotation is declared failed.
    #[serde(default = "default_rotate_attempts")]
    pub rotate_attempts: u32,

    #[serde(default = "default_rotate_interval_ms")]
    pub rotate_interval_ms: u64,

    /// Hard timeout of every control-plane request.
    #[serde(default = "default_egress_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

/// Remote browser-automation sessions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// `remote` (HTTP control endpoint) or `headless` (local browser).
    #[serde(default = "default_session_backend")]
    pub backend: String,

    #[serde(default = "default_session_control_url")]
    pub control_url: String,

    /// Sessions older than this are replaced on the next acquire.
    #[serde(default = "default_max_age_secs")]
    pub max_age_secs: u64,

    #[serde(default = "default_session_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

/// Resilient fetch executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Hard timeout of a single fetch attempt.
    #[serde(default = "default_attempt_timeout_ms")]
    pub attempt_timeout_ms: u64,

    /// Pause between a detected block and the retry.
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// Anti-automation markers per target; the `*` key applies to every target.
    ///
    /// Each entry is a regex matched against the response body, or
    /// `status:<code>` to match the response status.
    #[serde(default = "default_blocking_signatures")]
    pub blocking_signatures: HashMap<String, Vec<String>>,
}

/// Background maintenance sweep.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaintenanceConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,

    /// Delay before the first sweep after startup.
    #[serde(default = "default_initial_delay_secs")]
    pub initial_delay_secs: u64,

    /// How far back the sweep looks for recently expired entries.
    #[serde(default = "default_lookback_secs")]
    pub lookback_secs: u64,

    /// Entries with `access_count` above this are flagged when they expire.
    #[serde(default = "default_popularity_threshold")]
    pub popularity_threshold: i64,

    /// Window for the "recently accessed/created" health counters.
    #[serde(default = "default_recent_window_secs")]
    pub recent_window_secs: u64,

    /// Run the unpopular-entry purge as part of every sweep.
    #[serde(default)]
    pub purge_enabled: bool,

    #[serde(default = "default_purge_unused_days")]
    pub purge_unused_days: u64,

    #[serde(default = "default_purge_max_access_count")]
    pub purge_max_access_count: i64,
}

fn default_db_path() -> PathBuf {
    PathBuf::from("./bastion-cache.sqlite")
}

fn default_ttl_secs() -> u64 {
    86_400
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_cooldown_secs() -> u64 {
    15 * 60
}

fn default_true() -> bool {
    true
}

fn default_egress_control_url() -> String {
    "http://127.0.0.1:8000".into()
}

fn default_host_ip_probe_url() -> String {
    "https://api.ipify.org".into()
}

fn default_check_ttl_secs() -> u64 {
    60
}

fn default_settle_ms() -> u64 {
    3_000
}

fn default_rotate_attempts() -> u32 {
    10
}

fn default_rotate_interval_ms() -> u64 {
    3_000
}

fn default_egress_request_timeout_ms() -> u64 {
    10_000
}

fn default_session_backend() -> String {
    "remote".into()
}

fn default_session_control_url() -> String {
    "http://127.0.0.1:8191/v1".into()
}

fn default_max_age_secs() -> u64 {
    5 * 60
}

fn default_session_request_timeout_ms() -> u64 {
    60_000
}

fn default_attempt_timeout_ms() -> u64 {
    60_000
}

fn default_retry_backoff_ms() -> u64 {
    2_000
}

fn default_blocking_signatures() -> HashMap<String, Vec<String>> {
    HashMap::from([(
        "*".to_string(),
        vec![
            r"(?i)<title>\s*just a moment\.\.\.\s*</title>".to_string(),
            "cf-browser-verification".to_string(),
            r"(?i)attention required! \| cloudflare".to_string(),
            "status:429".to_string(),
        ],
    )])
}

fn default_interval_secs() -> u64 {
    5 * 60
}

fn default_initial_delay_secs() -> u64 {
    30
}

fn default_lookback_secs() -> u64 {
    60 * 60
}

fn default_popularity_threshold() -> i64 {
    10
}

fn default_recent_window_secs() -> u64 {
    60 * 60
}

fn default_purge_unused_days() -> u64 {
    30
}

fn default_purge_max_access_count() -> i64 {
    2
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            cache: CacheConfig::default(),
            breaker: BreakerConfig::default(),
            egress: EgressConfig::default(),
            session: SessionConfig::default(),
            executor: ExecutorConfig::default(),
            maintenance: MaintenanceConfig::default(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { default_ttl_secs: default_ttl_secs(), provider_ttl_secs: HashMap::new(), serve_stale_on_error: false }
    }
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self { failure_threshold: default_failure_threshold(), cooldown_secs: default_cooldown_secs() }
    }
}

impl Default for EgressConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            control_url: default_egress_control_url(),
            host_ip_probe_url: default_host_ip_probe_url(),
            check_ttl_secs: default_check_ttl_secs(),
            settle_ms: default_settle_ms(),
            rotate_attempts: default_rotate_attempts(),
            rotate_interval_ms: default_rotate_interval_ms(),
            request_timeout_ms: default_egress_request_timeout_ms(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            backend: default_session_backend(),
            control_url: default_session_control_url(),
            max_age_secs: default_max_age_secs(),
            request_timeout_ms: default_session_request_timeout_ms(),
        }
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            attempt_timeout_ms: default_attempt_timeout_ms(),
            retry_backoff_ms: default_retry_backoff_ms(),
            blocking_signatures: default_blocking_signatures(),
        }
    }
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_interval_secs(),
            initial_delay_secs: default_initial_delay_secs(),
            lookback_secs: default_lookback_secs(),
            popularity_threshold: default_popularity_threshold(),
            recent_window_secs: default_recent_window_secs(),
            purge_enabled: false,
            purge_unused_days: default_purge_unused_days(),
            purge_max_access_count: default_purge_max_access_count(),
        }
    }
}

impl BreakerConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }
}

impl EgressConfig {
    pub fn check_ttl(&self) -> Duration {
        Duration::from_secs(self.check_ttl_secs)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn rotate_interval(&self) -> Duration {
        Duration::from_millis(self.rotate_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl SessionConfig {
    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl ExecutorConfig {
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

impl MaintenanceConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn initial_delay(&self) -> Duration {
        Duration::from_secs(self.initial_delay_secs)
    }

    pub fn lookback(&self) -> Duration {
        Duration::from_secs(self.lookback_secs)
    }

    pub fn recent_window(&self) -> Duration {
        Duration::from_secs(self.recent_window_secs)
    }

    pub fn purge_unused(&self) -> Duration {
        Duration::from_secs(self.purge_unused_days * 24 * 60 * 60)
    }
}

impl AppConfig {
    /// Load configuration from all sources with layered precedence.
    ///
    /// Priority (highest wins):
    /// 1. Environment variables prefixed with `BASTION_`
    /// 2. TOML file from `BASTION_CONFIG_FILE` (if set)
    /// 3. Built-in defaults via `Default::default()`
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if:
    /// - Configuration file cannot be read
    /// - Environment variables cannot be parsed
    /// - Validation fails after loading
    pub fn load() -> Result<Self, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));

        if let Ok(config_path) = std::env::var("BASTION_CONFIG_FILE") {
            figment = figment.merge(Toml::file(&config_path));
        }

        figment = figment.merge(
            Env::prefixed("BASTION_")
                .map(|key| key.as_str().to_lowercase().into())
                .split("__"),
        );

        let config: Self = figment.extract().map_err(|e| ConfigError::LoadFailed(e.to_string()))?;

        config.validate()?;

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.db_path, PathBuf::from("./bastion-cache.sqlite"));
        assert_eq!(config.cache.default_ttl_secs, 86_400);
        assert!(!config.cache.serve_stale_on_error);
        assert_eq!(config.breaker.failure_threshold, 3);
        assert_eq!(config.breaker.cooldown(), Duration::from_secs(900));
        assert_eq!(config.egress.check_ttl(), Duration::from_secs(60));
        assert_eq!(config.session.max_age(), Duration::from_secs(300));
        assert_eq!(config.maintenance.interval(), Duration::from_secs(300));
        assert_eq!(config.maintenance.initial_delay(), Duration::from_secs(30));
        assert!(!config.maintenance.purge_enabled);
    }

    #[test]
    fn test_default_signatures_cover_all_targets() {
        let config = ExecutorConfig::default();
        let wildcard = config.blocking_signatures.get("*").unwrap();
        assert!(wildcard.iter().any(|s| s == "status:429"));
    }

    #[test]
    fn test_nested_toml_overrides_defaults() {
        let figment = Figment::from(Serialized::defaults(AppConfig::default())).merge(Toml::string(
            r#"
            [breaker]
            failure_threshold = 5

            [cache.provider_ttl_secs]
            tmdb = 3600
            "#,
        ));
        let config: AppConfig = figment.extract().unwrap();
        assert_eq!(config.breaker.failure_threshold, 5);
        assert_eq!(config.breaker.cooldown_secs, 900);
        assert_eq!(config.cache.provider_ttl_secs.get("tmdb"), Some(&3600));
    }

    #[test]
    fn test_purge_unused_duration() {
        let config = MaintenanceConfig { purge_unused_days: 2, ..Default::default() };
        assert_eq!(config.purge_unused(), Duration::from_secs(2 * 86_400));
    }
}
