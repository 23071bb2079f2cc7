//! HTTP client for a FlareSolverr-style automation endpoint.
//!
//! Every command is a `POST` of `{"cmd": ...}` to the control URL:
//! `sessions.create`, `sessions.destroy` and `request.get`.

use super::{AutomationControl, NavigateResponse};
use crate::http::{build_http_client, control_failure};
use async_trait::async_trait;
use bastion_core::Error;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Value, json};
use std::time::Duration;

/// Extra transport time allowed on top of a navigation's own `maxTimeout`.
const NAVIGATE_SLACK: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
struct CommandResponse {
    status: String,
    #[serde(default)]
    message: String,
    session: Option<String>,
    solution: Option<Solution>,
}

#[derive(Debug, Deserialize)]
struct Solution {
    url: Option<String>,
    status: Option<u16>,
    #[serde(default)]
    response: String,
}

/// [`AutomationControl`] over a FlareSolverr-style command endpoint.
pub struct HttpAutomationControl {
    http: Client,
    control_url: String,
}

impl HttpAutomationControl {
    pub fn new(control_url: &str, timeout: Duration) -> Result<Self, Error> {
        url::Url::parse(control_url)
            .map_err(|e| Error::InvalidInput(format!("automation control url {control_url}: {e}")))?;
        Ok(Self { http: build_http_client(timeout)?, control_url: control_url.to_string() })
    }

    async fn command(&self, body: &Value, timeout: Option<Duration>) -> Result<CommandResponse, Error> {
        let cmd = body["cmd"].as_str().unwrap_or("unknown").to_string();
        tracing::debug!(cmd = %cmd, "automation command");

        let mut request = self.http.post(&self.control_url).json(body);
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }
        let response = request
            .send()
            .await
            .map_err(|e| control_failure(&self.control_url, e))?;

        let status = response.status();
        let text = response.text().await.map_err(|e| control_failure(&self.control_url, e))?;
        serde_json::from_str::<CommandResponse>(&text).map_err(|e| {
            Error::InfraFault(format!("{cmd}: unexpected response (status {}): {e}", status.as_u16()))
        })
    }
}

#[async_trait]
impl AutomationControl for HttpAutomationControl {
    async fn create_session(&self) -> Result<String, Error> {
        let response = self.command(&json!({"cmd": "sessions.create"}), None).await?;
        match (response.status.as_str(), response.session) {
            ("ok", Some(id)) => Ok(id),
            _ => Err(Error::InfraFault(format!("sessions.create failed: {}", response.message))),
        }
    }

    async fn destroy_session(&self, session_id: &str) -> Result<(), Error> {
        let response = self
            .command(&json!({"cmd": "sessions.destroy", "session": session_id}), None)
            .await?;
        if response.status == "ok" {
            Ok(())
        } else {
            Err(Error::InfraFault(format!("sessions.destroy {session_id} failed: {}", response.message)))
        }
    }

    async fn navigate(&self, session_id: &str, url: &str, timeout: Duration) -> Result<NavigateResponse, Error> {
        let body = json!({
            "cmd": "request.get",
            "url": url,
            "session": session_id,
            "maxTimeout": timeout.as_millis() as u64,
        });
        let response = self.command(&body, Some(timeout + NAVIGATE_SLACK)).await?;

        if response.status != "ok" {
            return Err(if response.message.to_ascii_lowercase().contains("timeout") {
                Error::Timeout(format!("request.get {url}: {}", response.message))
            } else {
                Error::UpstreamFetch(format!("request.get {url}: {}", response.message))
            });
        }

        let solution = response
            .solution
            .ok_or_else(|| Error::InfraFault(format!("request.get {url}: response carried no solution")))?;
        Ok(NavigateResponse { html: solution.response, status: solution.status, url: solution.url })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn control(server: &MockServer) -> HttpAutomationControl {
        HttpAutomationControl::new(&format!("{}/v1", server.uri()), Duration::from_secs(2)).unwrap()
    }

    #[tokio::test]
    async fn test_create_session() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1"))
            .and(body_partial_json(json!({"cmd": "sessions.create"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "ok",
                "message": "Session created successfully.",
                "session": "8f0e1a2b"
            })))
            .mount(&server)
            .await;

        assert_eq!(control(&server).await.create_session().await.unwrap(), "8f0e1a2b");
    }

    #[tokio::test]
    async fn test_create_session_error_is_infra_fault() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_json(json!({
                "status": "error",
                "message": "Error: no browser available"
            })))
            .mount(&server)
            .await;

        let err = control(&server).await.create_session().await.unwrap_err();
        assert!(matches!(err, Error::InfraFault(msg) if msg.contains("no browser")));
    }

    #[tokio::test]
    async fn test_destroy_session() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"cmd": "sessions.destroy", "session": "8f0e1a2b"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "ok", "message": ""})))
            .expect(1)
            .mount(&server)
            .await;

        control(&server).await.destroy_session("8f0e1a2b").await.unwrap();
    }

    #[tokio::test]
    async fn test_navigate_returns_solution() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({
                "cmd": "request.get",
                "url": "https://boardgamegeek.com/boardgame/13",
                "session": "s1",
                "maxTimeout": 30000
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "ok",
                "message": "Challenge not detected!",
                "solution": {
                    "url": "https://boardgamegeek.com/boardgame/13/catan",
                    "status": 200,
                    "response": "<html><title>Catan</title></html>"
                }
            })))
            .mount(&server)
            .await;

        let page = control(&server)
            .await
            .navigate("s1", "https://boardgamegeek.com/boardgame/13", Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(page.status, Some(200));
        assert!(page.html.contains("Catan"));
        assert_eq!(page.url.as_deref(), Some("https://boardgamegeek.com/boardgame/13/catan"));
    }

    #[tokio::test]
    async fn test_navigate_timeout_message_is_timeout() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_json(json!({
                "status": "error",
                "message": "Error: Error solving the challenge. Timeout after 30.0 seconds."
            })))
            .mount(&server)
            .await;

        let err = control(&server)
            .await
            .navigate("s1", "https://example.com", Duration::from_secs(30))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
    }

    #[tokio::test]
    async fn test_garbage_response_is_infra_fault() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(502).set_body_string("Bad Gateway"))
            .mount(&server)
            .await;

        let err = control(&server).await.create_session().await.unwrap_err();
        assert!(matches!(err, Error::InfraFault(_)));
    }
}
