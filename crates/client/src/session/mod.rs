//! Browser-automation sessions bound to targets.
//!
//! Each target owns at most one live session. Sessions are reused until they
//! reach `max_age`, replaced on demand after a detected block, and closed by
//! the maintenance sweep once idle past `max_age`. Every slot is guarded by
//! its own async mutex so two concurrent callers never create two sessions
//! for one target.

pub mod flaresolverr;
#[cfg(feature = "render")]
pub mod headless;

use async_trait::async_trait;
use bastion_core::Error;
use bastion_core::config::SessionConfig;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

pub use flaresolverr::HttpAutomationControl;
#[cfg(feature = "render")]
pub use headless::HeadlessAutomation;

/// Page returned by [`AutomationControl::navigate`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NavigateResponse {
    pub html: String,
    pub status: Option<u16>,
    /// Final URL after redirects, when the backend reports it.
    pub url: Option<String>,
}

/// Remote browser-automation control endpoint.
#[async_trait]
pub trait AutomationControl: Send + Sync {
    async fn create_session(&self) -> Result<String, Error>;
    async fn destroy_session(&self, session_id: &str) -> Result<(), Error>;
    async fn navigate(&self, session_id: &str, url: &str, timeout: Duration) -> Result<NavigateResponse, Error>;
}

/// A live automation session owned by one target.
#[derive(Debug, Clone)]
pub struct Session {
    /// Identifier issued by the automation backend.
    pub session_id: String,
    pub target_domain: String,
    pub created_at: Instant,
    /// Bumped on every reuse; drives idle closing.
    pub last_used_at: Instant,
    /// Age at which the session is replaced on next acquire.
    pub max_age: Duration,
}

impl Session {
    fn new(session_id: String, target_domain: &str, max_age: Duration) -> Self {
        let now = Instant::now();
        Self { session_id, target_domain: target_domain.to_string(), created_at: now, last_used_at: now, max_age }
    }

    pub fn is_expired(&self) -> bool {
        self.created_at.elapsed() >= self.max_age
    }

    pub fn is_idle(&self) -> bool {
        self.last_used_at.elapsed() >= self.max_age
    }
}

type Slot = Arc<Mutex<Option<Session>>>;

/// Hard limit on a create or destroy call unless configured otherwise.
const DEFAULT_CONTROL_TIMEOUT: Duration = Duration::from_secs(30);

/// Per-target session registry over one automation backend.
pub struct SessionManager {
    control: Arc<dyn AutomationControl>,
    max_age: Duration,
    /// Deadline for `create_session` and `destroy_session`.
    control_timeout: Duration,
    slots: DashMap<String, Slot>,
}

impl SessionManager {
    pub fn new(control: Arc<dyn AutomationControl>, max_age: Duration) -> Self {
        Self { control, max_age, control_timeout: DEFAULT_CONTROL_TIMEOUT, slots: DashMap::new() }
    }

    pub fn from_config(control: Arc<dyn AutomationControl>, config: &SessionConfig) -> Self {
        Self::new(control, config.max_age()).with_control_timeout(config.request_timeout())
    }

    pub fn with_control_timeout(mut self, timeout: Duration) -> Self {
        self.control_timeout = timeout;
        self
    }

    pub fn control(&self) -> &Arc<dyn AutomationControl> {
        &self.control
    }

    fn slot(&self, target: &str) -> Slot {
        self.slots.entry(target.to_string()).or_default().clone()
    }

    /// Return the session for `target`, creating one when there is none,
    /// it has reached `max_age`, or `force_new` is set.
    ///
    /// # Errors
    ///
    /// `InfraFault` when the control endpoint cannot create a session or
    /// does not answer within the control timeout.
    pub async fn acquire(&self, target: &str, force_new: bool) -> Result<String, Error> {
        let slot = self.slot(target);
        let mut current = slot.lock().await;

        if !force_new
            && let Some(session) = current.as_mut()
            && !session.is_expired()
        {
            session.last_used_at = Instant::now();
            return Ok(session.session_id.clone());
        }

        if let Some(old) = current.take() {
            self.destroy_quietly(&old).await;
        }

        let session_id = match tokio::time::timeout(self.control_timeout, self.control.create_session()).await {
            Ok(Ok(id)) => id,
            Ok(Err(e @ Error::InfraFault(_))) => return Err(e),
            Ok(Err(other)) => return Err(Error::InfraFault(format!("session create for {target}: {other}"))),
            Err(_) => {
                return Err(Error::InfraFault(format!(
                    "session create for {target} timed out after {}ms",
                    self.control_timeout.as_millis()
                )));
            }
        };
        tracing::info!(domain = target, session_id = %session_id, force_new, "automation session created");

        *current = Some(Session::new(session_id.clone(), target, self.max_age));
        Ok(session_id)
    }

    /// Tear down the session for `target`, whatever its age.
    pub async fn destroy(&self, target: &str) {
        let Some(slot) = self.slots.get(target).map(|s| s.value().clone()) else {
            return;
        };
        let taken = slot.lock().await.take();
        if let Some(session) = taken {
            self.destroy_quietly(&session).await;
        }
    }

    pub async fn destroy_all(&self) {
        let targets: Vec<String> = self.slots.iter().map(|e| e.key().clone()).collect();
        for target in targets {
            self.destroy(&target).await;
        }
    }

    /// Close sessions idle beyond `max_age`. Returns how many were closed.
    pub async fn close_idle(&self) -> usize {
        let slots: Vec<Slot> = self.slots.iter().map(|e| e.value().clone()).collect();
        let mut closed = 0;
        for slot in slots {
            let mut current = slot.lock().await;
            if current.as_ref().is_some_and(Session::is_idle)
                && let Some(session) = current.take()
            {
                self.destroy_quietly(&session).await;
                closed += 1;
            }
        }
        closed
    }

    pub async fn session(&self, target: &str) -> Option<Session> {
        let slot = self.slots.get(target).map(|s| s.value().clone())?;
        slot.lock().await.clone()
    }

    /// Number of live sessions; slots busy in an acquire count as live.
    pub fn active_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|e| e.value().try_lock().map(|s| s.is_some()).unwrap_or(true))
            .count()
    }

    async fn destroy_quietly(&self, session: &Session) {
        let destroyed = tokio::time::timeout(self.control_timeout, self.control.destroy_session(&session.session_id));
        match destroyed.await {
            Ok(Ok(())) => tracing::debug!(
                domain = %session.target_domain,
                session_id = %session.session_id,
                "automation session destroyed"
            ),
            Ok(Err(e)) => tracing::warn!(
                domain = %session.target_domain,
                session_id = %session.session_id,
                "failed to destroy automation session: {e}"
            ),
            Err(_) => tracing::warn!(
                domain = %session.target_domain,
                session_id = %session.session_id,
                timeout_ms = self.control_timeout.as_millis() as u64,
                "automation session destroy timed out"
            ),
        }
    }
}
