//! Per-target circuit breaker.
//!
//! Only anti-automation detections advance a breaker toward `open`;
//! ordinary timeouts and network errors are tolerated so a flaky upstream
//! does not trip it. State lives in an injected registry keyed by target
//! and is never persisted.
//!
//! ```text
//! closed --(threshold blocking failures)--> open
//! open   --(cooldown elapsed)-------------> half_open
//! half_open --(success)--> closed
//! half_open --(blocking failure)--> open (opened_at reset)
//! ```
//!
//! A half-open breaker admits one probe at a time. The probe slot frees
//! when its outcome is recorded, when it is released, or after a cooldown.

use bastion_core::config::BreakerConfig;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// State of one target's breaker.
#[derive(Debug, Clone)]
pub struct BreakerState {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub opened_at: Option<Instant>,
    /// Start of the half-open probe currently in flight.
    pub probe_started_at: Option<Instant>,
}

impl Default for BreakerState {
    fn default() -> Self {
        Self { state: CircuitState::Closed, consecutive_failures: 0, opened_at: None, probe_started_at: None }
    }
}

/// Answer to [`CircuitBreaker::is_available`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Availability {
    pub available: bool,
    /// Seconds until the next probe is allowed; `None` when available.
    pub retry_after_secs: Option<i64>,
    /// The caller holds the half-open probe slot (only from `try_acquire`).
    #[serde(default)]
    pub probe: bool,
}

impl Availability {
    fn open() -> Self {
        Self { available: true, retry_after_secs: None, probe: false }
    }

    fn refused(wait: Duration) -> Self {
        Self { available: false, retry_after_secs: Some(wait.as_secs_f64().ceil() as i64), probe: false }
    }
}

/// Per-target view for health reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    pub target: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub retry_after_secs: Option<i64>,
}

/// Registry of per-target breakers, created lazily on first use.
#[derive(Debug)]
pub struct CircuitBreaker {
    threshold: u32,
    cooldown: Duration,
    targets: DashMap<String, BreakerState>,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self { threshold: threshold.max(1), cooldown, targets: DashMap::new() }
    }

    pub fn from_config(config: &BreakerConfig) -> Self {
        Self::new(config.failure_threshold, config.cooldown())
    }

    /// Whether a call to `target` may proceed now.
    ///
    /// An open breaker whose cooldown has elapsed moves to half-open. A
    /// half-open breaker reports available while no probe is in flight.
    pub fn is_available(&self, target: &str) -> Availability {
        self.admit(target, false)
    }

    /// Like [`is_available`](Self::is_available), but a half-open breaker
    /// hands its single probe slot to the caller (`probe` is set). The
    /// holder reports the outcome or calls [`release_probe`](Self::release_probe).
    pub fn try_acquire(&self, target: &str) -> Availability {
        self.admit(target, true)
    }

    fn admit(&self, target: &str, claim: bool) -> Availability {
        let Some(mut entry) = self.targets.get_mut(target) else {
            return Availability::open();
        };

        match entry.state {
            CircuitState::Closed => return Availability::open(),
            CircuitState::Open => {
                let elapsed = entry.opened_at.map(|t| t.elapsed()).unwrap_or(self.cooldown);
                if elapsed < self.cooldown {
                    return Availability::refused(self.cooldown - elapsed);
                }
                entry.state = CircuitState::HalfOpen;
                entry.probe_started_at = None;
                tracing::info!(domain = target, "breaker half-open, letting a probe through");
            }
            CircuitState::HalfOpen => {}
        }

        if let Some(started) = entry.probe_started_at {
            let running = started.elapsed();
            if running < self.cooldown {
                return Availability::refused(self.cooldown - running);
            }
            tracing::warn!(domain = target, "half-open probe never reported, freeing its slot");
        }

        if claim {
            entry.probe_started_at = Some(Instant::now());
        }
        Availability { available: true, retry_after_secs: None, probe: claim }
    }

    /// Free the probe slot of a half-open breaker without recording an outcome.
    pub fn release_probe(&self, target: &str) {
        if let Some(mut entry) = self.targets.get_mut(target)
            && entry.state == CircuitState::HalfOpen
        {
            entry.probe_started_at = None;
        }
    }

    /// Reset the failure count and close the breaker, whatever its state.
    pub fn record_success(&self, target: &str) {
        let mut entry = self.targets.entry(target.to_string()).or_default();
        if entry.state != CircuitState::Closed {
            tracing::info!(domain = target, "breaker closed after successful probe");
        }
        *entry = BreakerState::default();
    }

    /// Record a failed call. Only blocking signatures count toward `open`.
    pub fn record_failure(&self, target: &str, is_blocking_signature: bool) {
        if !is_blocking_signature {
            tracing::debug!(domain = target, "non-blocking failure ignored by breaker");
            self.release_probe(target);
            return;
        }

        let mut entry = self.targets.entry(target.to_string()).or_default();
        entry.consecutive_failures = entry.consecutive_failures.saturating_add(1);

        match entry.state {
            CircuitState::HalfOpen => {
                entry.state = CircuitState::Open;
                entry.opened_at = Some(Instant::now());
                entry.probe_started_at = None;
                tracing::warn!(domain = target, "probe blocked, breaker reopened");
            }
            CircuitState::Closed if entry.consecutive_failures >= self.threshold => {
                entry.state = CircuitState::Open;
                entry.opened_at = Some(Instant::now());
                tracing::warn!(
                    domain = target,
                    failures = entry.consecutive_failures,
                    cooldown_secs = self.cooldown.as_secs(),
                    "breaker opened"
                );
            }
            _ => {}
        }
    }

    /// Current state of `target`, if it has been used.
    pub fn state(&self, target: &str) -> Option<BreakerState> {
        self.targets.get(target).map(|s| s.value().clone())
    }

    pub fn snapshot(&self) -> Vec<BreakerSnapshot> {
        let mut out: Vec<BreakerSnapshot> = self
            .targets
            .iter()
            .map(|entry| {
                let retry_after_secs = match (entry.state, entry.opened_at) {
                    (CircuitState::Open, Some(opened_at)) => {
                        Some(self.cooldown.saturating_sub(opened_at.elapsed()).as_secs_f64().ceil() as i64)
                    }
                    _ => None,
                };
                BreakerSnapshot {
                    target: entry.key().clone(),
                    state: entry.state,
                    consecutive_failures: entry.consecutive_failures,
                    retry_after_secs,
                }
            })
            .collect();
        out.sort_by(|a, b| a.target.cmp(&b.target));
        out
    }
}
