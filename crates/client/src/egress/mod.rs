//! Egress verification and rotation.
//!
//! Outbound traffic for a protected target must leave through the tunnel,
//! never through the host's own public address. A check confirms the tunnel
//! is running and that its public IP differs from the host IP detected at
//! startup; results are cached briefly per target. Rotation restarts the
//! tunnel and polls until a fresh address shows up, one rotation per target
//! at a time.

pub mod gluetun;

use crate::http::{build_http_client, control_failure, ensure_success};
use async_trait::async_trait;
use bastion_core::Error;
use bastion_core::config::EgressConfig;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

pub use gluetun::HttpTunnelControl;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelStatus {
    Running,
    Stopped,
}

/// Network tunnel control endpoint.
#[async_trait]
pub trait TunnelControl: Send + Sync {
    async fn status(&self) -> Result<TunnelStatus, Error>;
    async fn public_ip(&self) -> Result<IpAddr, Error>;
    async fn stop(&self) -> Result<(), Error>;
    async fn start(&self) -> Result<(), Error>;
}

/// Outcome of an egress check. Transient, never stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EgressCheckResult {
    pub ok: bool,
    pub observed_ip: Option<IpAddr>,
    pub error: Option<String>,
}

impl EgressCheckResult {
    fn passed(ip: IpAddr) -> Self {
        Self { ok: true, observed_ip: Some(ip), error: None }
    }

    fn failed(observed_ip: Option<IpAddr>, error: impl Into<String>) -> Self {
        Self { ok: false, observed_ip, error: Some(error.into()) }
    }
}

/// Per-target egress checks and serialized tunnel rotation.
pub struct EgressVerifier {
    control: Arc<dyn TunnelControl>,
    host_ip: Option<IpAddr>,
    check_ttl: Duration,
    settle: Duration,
    rotate_attempts: u32,
    rotate_interval: Duration,
    checks: DashMap<String, (Instant, EgressCheckResult)>,
    rotations: DashMap<String, Arc<Mutex<()>>>,
}

impl EgressVerifier {
    /// `host_ip` is the uncontrolled public address; `None` disables the
    /// leak comparison.
    pub fn new(control: Arc<dyn TunnelControl>, host_ip: Option<IpAddr>, config: &EgressConfig) -> Self {
        Self {
            control,
            host_ip,
            check_ttl: config.check_ttl(),
            settle: config.settle(),
            rotate_attempts: config.rotate_attempts.max(1),
            rotate_interval: config.rotate_interval(),
            checks: DashMap::new(),
            rotations: DashMap::new(),
        }
    }

    pub fn host_ip(&self) -> Option<IpAddr> {
        self.host_ip
    }

    /// Verify egress for `target`, reusing a recent result.
    pub async fn check(&self, target: &str) -> EgressCheckResult {
        if let Some(cached) = self.checks.get(target)
            && cached.0.elapsed() < self.check_ttl
        {
            return cached.1.clone();
        }

        let result = self.probe().await;
        if !result.ok {
            tracing::warn!(
                domain = target,
                observed_ip = ?result.observed_ip,
                error = result.error.as_deref().unwrap_or_default(),
                "egress check failed"
            );
        }
        self.checks.insert(target.to_string(), (Instant::now(), result.clone()));
        result
    }

    async fn probe(&self) -> EgressCheckResult {
        match self.control.status().await {
            Ok(TunnelStatus::Running) => {}
            Ok(TunnelStatus::Stopped) => return EgressCheckResult::failed(None, "tunnel is not running"),
            Err(e) => return EgressCheckResult::failed(None, e.to_string()),
        }

        let ip = match self.control.public_ip().await {
            Ok(ip) => ip,
            Err(e) => return EgressCheckResult::failed(None, e.to_string()),
        };

        if self.host_ip == Some(ip) {
            return EgressCheckResult::failed(Some(ip), format!("egress IP {ip} equals the host IP"));
        }
        EgressCheckResult::passed(ip)
    }

    /// Restart the tunnel and wait for a fresh, safe public IP.
    ///
    /// # Errors
    ///
    /// `InfraFault` when a control call fails or the attempt budget runs out
    /// before a new address differing from both the previous and the host IP
    /// appears.
    pub async fn rotate(&self, target: &str) -> Result<EgressCheckResult, Error> {
        let lock = self.rotations.entry(target.to_string()).or_default().clone();
        let _guard = lock.lock().await;
        self.checks.remove(target);

        let previous = self.control.public_ip().await.ok();
        tracing::info!(domain = target, previous_ip = ?previous, "rotating egress");

        self.control.stop().await?;
        tokio::time::sleep(self.settle).await;
        self.control.start().await?;

        for attempt in 1..=self.rotate_attempts {
            tokio::time::sleep(self.rotate_interval).await;

            if !matches!(self.control.status().await, Ok(TunnelStatus::Running)) {
                tracing::debug!(domain = target, attempt, "tunnel not running yet");
                continue;
            }
            let ip = match self.control.public_ip().await {
                Ok(ip) => ip,
                Err(e) => {
                    tracing::debug!(domain = target, attempt, "public ip unavailable: {e}");
                    continue;
                }
            };
            if Some(ip) == previous || Some(ip) == self.host_ip {
                tracing::debug!(domain = target, attempt, ip = %ip, "egress IP not refreshed yet");
                continue;
            }

            let result = EgressCheckResult::passed(ip);
            self.checks.insert(target.to_string(), (Instant::now(), result.clone()));
            tracing::info!(domain = target, ip = %ip, attempt, "egress rotated");
            return Ok(result);
        }

        Err(Error::InfraFault(format!(
            "egress rotation for {target} produced no fresh IP after {} attempts",
            self.rotate_attempts
        )))
    }
}

/// Ask a plain-text IP echo endpoint for this host's public address.
pub async fn detect_host_ip(probe_url: &str, timeout: Duration) -> Result<IpAddr, Error> {
    let client = build_http_client(timeout)?;
    let response = client
        .get(probe_url)
        .send()
        .await
        .map_err(|e| control_failure(probe_url, e))?;
    let body = ensure_success(probe_url, response)?
        .text()
        .await
        .map_err(|e| control_failure(probe_url, e))?;

    let ip = body
        .trim()
        .parse::<IpAddr>()
        .map_err(|e| Error::InfraFault(format!("{probe_url} returned {:?}: {e}", body.trim())))?;
    tracing::info!(host_ip = %ip, "detected host public IP");
    Ok(ip)
}
