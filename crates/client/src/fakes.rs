//! In-memory control-plane fakes for unit tests.

use crate::egress::{TunnelControl, TunnelStatus};
use crate::session::{AutomationControl, NavigateResponse};
use async_trait::async_trait;
use bastion_core::Error;
use std::collections::VecDeque;
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::Duration;

struct TunnelState {
    running: bool,
    ip: IpAddr,
    next_ips: VecDeque<IpAddr>,
    unreachable: bool,
    status_calls: usize,
    stops: usize,
    starts: usize,
    overlapping_stops: usize,
}

/// Tunnel whose public IP changes to the next queued address on each start.
pub(crate) struct FakeTunnel {
    state: Mutex<TunnelState>,
}

impl FakeTunnel {
    pub(crate) fn new(ip: IpAddr) -> Self {
        Self {
            state: Mutex::new(TunnelState {
                running: true,
                ip,
                next_ips: VecDeque::new(),
                unreachable: false,
                status_calls: 0,
                stops: 0,
                starts: 0,
                overlapping_stops: 0,
            }),
        }
    }

    pub(crate) fn with_rotation_ips(self, ips: impl IntoIterator<Item = IpAddr>) -> Self {
        self.state.lock().unwrap().next_ips.extend(ips);
        self
    }

    pub(crate) fn set_running(&self, running: bool) {
        self.state.lock().unwrap().running = running;
    }

    pub(crate) fn set_unreachable(&self, unreachable: bool) {
        self.state.lock().unwrap().unreachable = unreachable;
    }

    pub(crate) fn status_calls(&self) -> usize {
        self.state.lock().unwrap().status_calls
    }

    pub(crate) fn stops(&self) -> usize {
        self.state.lock().unwrap().stops
    }

    pub(crate) fn starts(&self) -> usize {
        self.state.lock().unwrap().starts
    }

    /// Stops issued while the tunnel was already stopped.
    pub(crate) fn overlapping_stops(&self) -> usize {
        self.state.lock().unwrap().overlapping_stops
    }
}

#[async_trait]
impl TunnelControl for FakeTunnel {
    async fn status(&self) -> Result<TunnelStatus, Error> {
        let mut state = self.state.lock().unwrap();
        state.status_calls += 1;
        if state.unreachable {
            return Err(Error::InfraFault("tunnel control unreachable".into()));
        }
        Ok(if state.running { TunnelStatus::Running } else { TunnelStatus::Stopped })
    }

    async fn public_ip(&self) -> Result<IpAddr, Error> {
        let state = self.state.lock().unwrap();
        if state.unreachable || !state.running {
            return Err(Error::InfraFault("public ip unavailable".into()));
        }
        Ok(state.ip)
    }

    async fn stop(&self) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        if !state.running {
            state.overlapping_stops += 1;
        }
        state.running = false;
        state.stops += 1;
        Ok(())
    }

    async fn start(&self) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        state.running = true;
        state.starts += 1;
        if let Some(next) = state.next_ips.pop_front() {
            state.ip = next;
        }
        Ok(())
    }
}

#[derive(Default)]
struct AutomationState {
    next_id: u64,
    created: usize,
    destroyed: Vec<String>,
    navigations: Vec<String>,
    pages: VecDeque<NavigateResponse>,
    fail_create: bool,
    fail_destroy: bool,
    hang: bool,
}

/// Automation endpoint handing out sequential session ids and queued pages.
pub(crate) struct FakeAutomation {
    state: Mutex<AutomationState>,
}

impl FakeAutomation {
    pub(crate) fn new() -> Self {
        Self { state: Mutex::new(AutomationState::default()) }
    }

    pub(crate) fn set_fail_create(&self, fail: bool) {
        self.state.lock().unwrap().fail_create = fail;
    }

    pub(crate) fn set_fail_destroy(&self, fail: bool) {
        self.state.lock().unwrap().fail_destroy = fail;
    }

    /// Make create and destroy calls never resolve.
    pub(crate) fn set_hang(&self, hang: bool) {
        self.state.lock().unwrap().hang = hang;
    }

    fn hanging(&self) -> bool {
        self.state.lock().unwrap().hang
    }

    pub(crate) fn push_page(&self, page: NavigateResponse) {
        self.state.lock().unwrap().pages.push_back(page);
    }

    pub(crate) fn created(&self) -> usize {
        self.state.lock().unwrap().created
    }

    pub(crate) fn destroyed(&self) -> Vec<String> {
        self.state.lock().unwrap().destroyed.clone()
    }

    pub(crate) fn navigations(&self) -> Vec<String> {
        self.state.lock().unwrap().navigations.clone()
    }
}

#[async_trait]
impl AutomationControl for FakeAutomation {
    async fn create_session(&self) -> Result<String, Error> {
        if self.hanging() {
            std::future::pending::<()>().await;
        }
        let mut state = self.state.lock().unwrap();
        if state.fail_create {
            return Err(Error::Timeout("sessions.create timed out".into()));
        }
        state.next_id += 1;
        state.created += 1;
        Ok(format!("session-{}", state.next_id))
    }

    async fn destroy_session(&self, session_id: &str) -> Result<(), Error> {
        if self.hanging() {
            std::future::pending::<()>().await;
        }
        let mut state = self.state.lock().unwrap();
        if state.fail_destroy {
            return Err(Error::InfraFault("sessions.destroy failed".into()));
        }
        state.destroyed.push(session_id.to_string());
        Ok(())
    }

    async fn navigate(&self, _session_id: &str, url: &str, _timeout: Duration) -> Result<NavigateResponse, Error> {
        let mut state = self.state.lock().unwrap();
        state.navigations.push(url.to_string());
        Ok(state.pages.pop_front().unwrap_or(NavigateResponse {
            html: "<html>ok</html>".into(),
            status: Some(200),
            url: Some(url.to_string()),
        }))
    }
}
