//! Shared HTTP plumbing for the control-plane clients.

use bastion_core::Error;
use reqwest::Client;
use std::time::Duration;

const USER_AGENT: &str = concat!("bastion/", env!("CARGO_PKG_VERSION"));

/// Build a client whose every request carries a hard `timeout`.
pub fn build_http_client(timeout: Duration) -> Result<Client, Error> {
    Client::builder()
        .user_agent(USER_AGENT)
        .timeout(timeout)
        .connect_timeout(timeout)
        .use_rustls_tls()
        .gzip(true)
        .brotli(true)
        .deflate(true)
        .build()
        .map_err(|e| Error::InfraFault(format!("failed to build HTTP client: {e}")))
}

/// Classify a failed control-plane call: timeouts stay timeouts, anything
/// else means the endpoint is unusable.
pub(crate) fn control_failure(endpoint: &str, err: reqwest::Error) -> Error {
    if err.is_timeout() {
        Error::Timeout(format!("{endpoint}: {err}"))
    } else {
        Error::InfraFault(format!("{endpoint}: {err}"))
    }
}

/// Map a non-success status from a control endpoint to an infrastructure fault.
pub(crate) fn ensure_success(endpoint: &str, response: reqwest::Response) -> Result<reqwest::Response, Error> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        Err(Error::InfraFault(format!("{endpoint}: status {}", status.as_u16())))
    }
}
