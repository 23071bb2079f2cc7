//! Resilient fetch executor.
//!
//! One logical fetch runs as:
//!
//! 1. fail fast if the target's breaker is open
//! 2. verify egress; a failed check is an infrastructure fault
//! 3. acquire a session and run the fetch under a hard timeout
//! 4. on a blocking signature, drop the session, rotate egress, back off and
//!    retry once with a fresh session; a first-attempt timeout retries once
//!    without rotating
//! 5. report the outcome to the breaker
//!
//! Only blocks (and a timeout that recurs on the retry) count against the
//! breaker. There is no retry budget beyond the single retry.

use crate::breaker::CircuitBreaker;
use crate::egress::EgressVerifier;
use crate::session::{NavigateResponse, SessionManager};
use crate::signatures::SignatureSet;
use bastion_core::Error;
use bastion_core::config::ExecutorConfig;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// What a fetch function hands back for signature inspection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawResponse {
    /// HTTP status, when the transport exposes one.
    pub status: Option<u16>,
    /// Response body as text; blocking signatures match against it.
    pub body: String,
    /// Final URL after redirects.
    pub url: Option<String>,
}

impl RawResponse {
    pub fn ok(body: impl Into<String>) -> Self {
        Self { status: Some(200), body: body.into(), url: None }
    }
}

impl From<NavigateResponse> for RawResponse {
    fn from(page: NavigateResponse) -> Self {
        Self { status: page.status, body: page.html, url: page.url }
    }
}

enum Attempt {
    Clean(RawResponse),
    Blocked(String),
    Failed(Error),
}

/// Runs upstream fetches behind the breaker, egress checks and a single
/// rotate-and-retry on detected blocks.
pub struct ResilientExecutor {
    breaker: Arc<CircuitBreaker>,
    egress: Option<Arc<EgressVerifier>>,
    sessions: Arc<SessionManager>,
    signatures: SignatureSet,
    attempt_timeout: Duration,
    retry_backoff: Duration,
}

impl ResilientExecutor {
    pub fn new(
        breaker: Arc<CircuitBreaker>, sessions: Arc<SessionManager>, signatures: SignatureSet, config: &ExecutorConfig,
    ) -> Self {
        Self {
            breaker,
            egress: None,
            sessions,
            signatures,
            attempt_timeout: config.attempt_timeout(),
            retry_backoff: config.retry_backoff(),
        }
    }

    /// Route every fetch through egress verification and rotation.
    pub fn with_egress(mut self, egress: Arc<EgressVerifier>) -> Self {
        self.egress = Some(egress);
        self
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// Run `fetch` for `target` with breaker, egress and rotation-retry
    /// protection. `fetch` receives the session id to use.
    ///
    /// # Errors
    ///
    /// - `BreakerOpen` when the breaker refuses the call
    /// - `InfraFault` when egress or session control is unusable
    /// - `Blocked` when a block survives the rotation-retry or rotation fails
    /// - `Timeout` when both attempts time out
    /// - any other fetch error, passed through untouched
    pub async fn execute<F, Fut>(&self, target: &str, fetch: F) -> Result<RawResponse, Error>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<RawResponse, Error>>,
    {
        let availability = self.breaker.try_acquire(target);
        if !availability.available {
            let retry_after_secs = availability.retry_after_secs.unwrap_or(0).max(0) as u64;
            tracing::debug!(domain = target, retry_after_secs, "breaker open, failing fast");
            return Err(Error::BreakerOpen { target: target.to_string(), retry_after_secs });
        }

        let result = self.run(target, &fetch).await;
        if availability.probe {
            self.breaker.release_probe(target);
        }
        result
    }

    async fn run<F, Fut>(&self, target: &str, fetch: &F) -> Result<RawResponse, Error>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<RawResponse, Error>>,
    {
        if let Some(egress) = &self.egress {
            let check = egress.check(target).await;
            if !check.ok {
                return Err(Error::InfraFault(format!(
                    "egress check for {target} failed: {}",
                    check.error.unwrap_or_default()
                )));
            }
        }

        let session_id = self.sessions.acquire(target, false).await?;
        let first_failure = match self.attempt(target, fetch, session_id).await {
            Attempt::Clean(response) => {
                self.breaker.record_success(target);
                return Ok(response);
            }
            Attempt::Failed(Error::Timeout(msg)) => {
                tracing::warn!(domain = target, "attempt timed out, retrying with a fresh session: {msg}");
                self.sessions.destroy(target).await;
                Error::Timeout(msg)
            }
            Attempt::Failed(e) => return Err(e),
            Attempt::Blocked(reason) => {
                tracing::warn!(domain = target, reason = %reason, "blocking signature detected");
                self.sessions.destroy(target).await;
                if let Some(egress) = &self.egress
                    && let Err(e) = egress.rotate(target).await
                {
                    self.breaker.record_failure(target, true);
                    return Err(Error::Blocked {
                        target: target.to_string(),
                        reason: format!("{reason}; egress rotation failed: {e}"),
                    });
                }
                Error::Blocked { target: target.to_string(), reason }
            }
        };

        tokio::time::sleep(self.retry_backoff).await;
        let session_id = self.sessions.acquire(target, true).await?;

        match self.attempt(target, fetch, session_id).await {
            Attempt::Clean(response) => {
                tracing::info!(domain = target, "retry succeeded");
                self.breaker.record_success(target);
                Ok(response)
            }
            Attempt::Blocked(reason) => {
                tracing::warn!(domain = target, reason = %reason, "still blocked after retry");
                self.sessions.destroy(target).await;
                self.breaker.record_failure(target, true);
                Err(Error::Blocked { target: target.to_string(), reason })
            }
            Attempt::Failed(e @ Error::InfraFault(_)) => Err(e),
            Attempt::Failed(e) => match first_failure {
                Error::Blocked { target: blocked, reason } => {
                    self.sessions.destroy(target).await;
                    self.breaker.record_failure(target, true);
                    Err(Error::Blocked { target: blocked, reason: format!("{reason}; retry failed: {e}") })
                }
                _ if matches!(e, Error::Timeout(_)) => {
                    tracing::warn!(domain = target, "attempt timed out again");
                    self.sessions.destroy(target).await;
                    self.breaker.record_failure(target, true);
                    Err(e)
                }
                _ => Err(e),
            },
        }
    }

    /// Load `url` through the automation endpoint with full protection.
    pub async fn navigate(&self, target: &str, url: &str) -> Result<RawResponse, Error> {
        let timeout = self.attempt_timeout;
        self.execute(target, |session_id| {
            let control = self.sessions.control().clone();
            let url = url.to_string();
            async move { control.navigate(&session_id, &url, timeout).await.map(RawResponse::from) }
        })
        .await
    }

    async fn attempt<F, Fut>(&self, target: &str, fetch: &F, session_id: String) -> Attempt
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<RawResponse, Error>>,
    {
        match tokio::time::timeout(self.attempt_timeout, fetch(session_id)).await {
            Err(_) => Attempt::Failed(Error::Timeout(format!(
                "{target}: attempt exceeded {}ms",
                self.attempt_timeout.as_millis()
            ))),
            Ok(Err(Error::Blocked { reason, .. })) => Attempt::Blocked(reason),
            Ok(Err(e)) => Attempt::Failed(e),
            Ok(Ok(response)) => match self.signatures.find(target, &response) {
                Some(reason) => Attempt::Blocked(reason),
                None => Attempt::Clean(response),
            },
        }
    }
}
