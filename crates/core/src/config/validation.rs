//! Configuration validation rules.
//!
//! This module provides validation logic for `AppConfig` values
//! after they have been loaded from environment, files, or defaults.

use crate::config::AppConfig;
use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    LoadFailed(String),

    #[error("invalid configuration: {field} - {reason}")]
    Invalid { field: String, reason: String },

    #[error("missing required configuration: {field} ({hint})")]
    Missing { field: String, hint: String },
}

const MIN_TIMEOUT_MS: u64 = 100;
const MAX_TIMEOUT_MS: u64 = 300_000;
const MAX_TTL_SECS: u64 = 10 * 365 * 24 * 3600;

fn invalid(field: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid { field: field.into(), reason: reason.into() }
}

fn check_ttl(field: &str, value: u64) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(invalid(field, "must be greater than 0"));
    }
    if value > MAX_TTL_SECS {
        return Err(invalid(field, "must not exceed 10 years (315360000s)"));
    }
    Ok(())
}

fn check_timeout(field: &str, value: u64) -> Result<(), ConfigError> {
    if value < MIN_TIMEOUT_MS {
        return Err(invalid(field, "must be at least 100ms"));
    }
    if value > MAX_TIMEOUT_MS {
        return Err(invalid(field, "must not exceed 5 minutes (300000ms)"));
    }
    Ok(())
}

impl AppConfig {
    /// Validate configuration values after loading.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` if:
    /// - any TTL is 0 (an entry must expire strictly after it is created)
    ///   or longer than 10 years
    /// - the breaker threshold or cooldown is 0
    /// - a control-plane or attempt timeout is below 100ms or above 5 minutes
    /// - the rotation budget, session max age or sweep interval is 0
    /// - the session backend is unknown
    ///
    /// Returns `ConfigError::Missing` if egress is enabled without a control URL.
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_ttl("cache.default_ttl_secs", self.cache.default_ttl_secs)?;
        for (provider, ttl) in &self.cache.provider_ttl_secs {
            check_ttl(&format!("cache.provider_ttl_secs.{provider}"), *ttl)?;
        }

        if self.breaker.failure_threshold == 0 {
            return Err(invalid("breaker.failure_threshold", "must be at least 1"));
        }
        if self.breaker.cooldown_secs == 0 {
            return Err(invalid("breaker.cooldown_secs", "must be greater than 0"));
        }

        if self.egress.enabled && self.egress.control_url.trim().is_empty() {
            return Err(ConfigError::Missing {
                field: "egress.control_url".into(),
                hint: "Set BASTION_EGRESS__CONTROL_URL or disable egress with BASTION_EGRESS__ENABLED=false".into(),
            });
        }
        if self.egress.rotate_attempts == 0 {
            return Err(invalid("egress.rotate_attempts", "must be at least 1"));
        }
        check_timeout("egress.request_timeout_ms", self.egress.request_timeout_ms)?;

        match self.session.backend.as_str() {
            "remote" | "headless" => {}
            _ => return Err(invalid("session.backend", "must be one of: remote, headless")),
        }
        if self.session.max_age_secs == 0 {
            return Err(invalid("session.max_age_secs", "must be greater than 0"));
        }
        check_timeout("session.request_timeout_ms", self.session.request_timeout_ms)?;

        check_timeout("executor.attempt_timeout_ms", self.executor.attempt_timeout_ms)?;

        if self.maintenance.interval_secs == 0 {
            return Err(invalid("maintenance.interval_secs", "must be greater than 0"));
        }

        if self.executor.blocking_signatures.is_empty() {
            tracing::warn!("no blocking signatures configured; anti-automation blocks will pass as successes");
        }

        Ok(())
    }
}
