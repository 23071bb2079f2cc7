//! Wiring of the access layer from configuration.

use anyhow::{Context, Result, bail};
use bastion_client::{
    AutomationControl, CircuitBreaker, EgressVerifier, Gateway, HttpAutomationControl, HttpTunnelControl,
    MaintenanceScheduler, ResilientExecutor, SessionManager, SignatureSet, detect_host_ip,
};
use bastion_core::{AppConfig, CacheDb, CacheStore};
use std::sync::Arc;

pub struct App {
    pub gateway: Arc<Gateway>,
    pub sessions: Arc<SessionManager>,
}

pub async fn build(config: &AppConfig) -> Result<App> {
    let db = CacheDb::open(&config.db_path)
        .await
        .with_context(|| format!("opening cache at {}", config.db_path.display()))?;

    let automation = automation_backend(config).await?;
    let sessions = Arc::new(SessionManager::from_config(automation, &config.session));
    let breaker = Arc::new(CircuitBreaker::from_config(&config.breaker));
    let signatures =
        SignatureSet::from_config(&config.executor.blocking_signatures).context("parsing blocking signatures")?;
    if signatures.is_empty() {
        tracing::warn!("no blocking signatures configured, blocks will never be detected");
    }

    let mut executor = ResilientExecutor::new(breaker, sessions.clone(), signatures, &config.executor);
    if config.egress.enabled {
        let host_ip = detect_host_ip(&config.egress.host_ip_probe_url, config.egress.request_timeout())
            .await
            .context("egress is enabled but the host public IP could not be detected")?;
        let tunnel = Arc::new(HttpTunnelControl::new(&config.egress.control_url, config.egress.request_timeout())?);
        executor = executor.with_egress(Arc::new(EgressVerifier::new(tunnel, Some(host_ip), &config.egress)));
    } else {
        tracing::warn!("egress verification disabled, traffic leaves through the host address");
    }

    let scheduler = Arc::new(MaintenanceScheduler::new(
        db.clone(),
        Some(sessions.clone()),
        config.maintenance.clone(),
    ));
    let cache = CacheStore::new(db, &config.cache);
    let gateway = Gateway::new(cache, Arc::new(executor), scheduler, config.maintenance.recent_window());

    Ok(App { gateway: Arc::new(gateway), sessions })
}

async fn automation_backend(config: &AppConfig) -> Result<Arc<dyn AutomationControl>> {
    match config.session.backend.as_str() {
        "remote" => Ok(Arc::new(HttpAutomationControl::new(
            &config.session.control_url,
            config.session.request_timeout(),
        )?)),
        #[cfg(feature = "render")]
        "headless" => Ok(Arc::new(bastion_client::HeadlessAutomation::launch().await?)),
        #[cfg(not(feature = "render"))]
        "headless" => bail!("session backend `headless` requires the `render` feature"),
        other => bail!("unknown session backend `{other}`"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bastion_core::CacheOptions;
    use serde_json::json;

    fn config() -> AppConfig {
        let mut config = AppConfig { db_path: ":memory:".into(), ..AppConfig::default() };
        config.egress.enabled = false;
        config
    }

    #[tokio::test]
    async fn test_build_without_egress() {
        let app = build(&config()).await.unwrap();

        let cached = app
            .gateway
            .get_with_cache("lego:75192", "lego", || async { Ok(json!({"pieces": 7541})) }, CacheOptions::default())
            .await
            .unwrap();
        assert_eq!(cached.data, json!({"pieces": 7541}));
        assert!(app.gateway.is_available("lego").available);
        assert_eq!(app.sessions.active_count(), 0);
    }

    #[tokio::test]
    async fn test_unknown_backend_rejected() {
        let mut config = config();
        config.session.backend = "carrier-pigeon".into();
        assert!(build(&config).await.is_err());
    }

    #[tokio::test]
    async fn test_egress_requires_host_ip() {
        let mut config = config();
        config.egress.enabled = true;
        config.egress.host_ip_probe_url = "http://127.0.0.1:1/".into();
        config.egress.request_timeout_ms = 500;

        let err = build(&config).await.err().unwrap();
        assert!(err.to_string().contains("host public IP"));
    }
}
