//! HTTP client for a Gluetun-style tunnel control server.
//!
//! - `GET /v1/openvpn/status` -> `{"status":"running"}`
//! - `PUT /v1/openvpn/status` with `{"status":"stopped"|"running"}`
//! - `GET /v1/publicip/ip` -> `{"public_ip":"203.0.113.10"}`

use super::{TunnelControl, TunnelStatus};
use crate::http::{build_http_client, control_failure, ensure_success};
use async_trait::async_trait;
use bastion_core::Error;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::time::Duration;
use url::Url;

const STATUS_PATH: &str = "v1/openvpn/status";
const PUBLIC_IP_PATH: &str = "v1/publicip/ip";

#[derive(Debug, Serialize, Deserialize)]
struct StatusBody {
    status: String,
}

#[derive(Debug, Deserialize)]
struct PublicIpBody {
    public_ip: String,
}

/// [`TunnelControl`](super::TunnelControl) over a Gluetun-style HTTP control server.
pub struct HttpTunnelControl {
    http: Client,
    base: Url,
}

impl HttpTunnelControl {
    pub fn new(control_url: &str, timeout: Duration) -> Result<Self, Error> {
        let mut base =
            Url::parse(control_url).map_err(|e| Error::InvalidInput(format!("tunnel control url {control_url}: {e}")))?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        Ok(Self { http: build_http_client(timeout)?, base })
    }

    fn endpoint(&self, path: &str) -> Result<Url, Error> {
        self.base
            .join(path)
            .map_err(|e| Error::InvalidInput(format!("tunnel control path {path}: {e}")))
    }

    async fn set_status(&self, status: TunnelStatus) -> Result<(), Error> {
        let url = self.endpoint(STATUS_PATH)?;
        let body = StatusBody { status: if status == TunnelStatus::Running { "running" } else { "stopped" }.into() };
        tracing::debug!(url = %url, status = %body.status, "setting tunnel status");

        let response = self
            .http
            .put(url.clone())
            .json(&body)
            .send()
            .await
            .map_err(|e| control_failure(url.as_str(), e))?;
        ensure_success(url.as_str(), response)?;
        Ok(())
    }
}

#[async_trait]
impl TunnelControl for HttpTunnelControl {
    async fn status(&self) -> Result<TunnelStatus, Error> {
        let url = self.endpoint(STATUS_PATH)?;
        let response = self
            .http
            .get(url.clone())
            .send()
            .await
            .map_err(|e| control_failure(url.as_str(), e))?;
        let body: StatusBody = ensure_success(url.as_str(), response)?
            .json()
            .await
            .map_err(|e| control_failure(url.as_str(), e))?;

        Ok(if body.status.eq_ignore_ascii_case("running") { TunnelStatus::Running } else { TunnelStatus::Stopped })
    }

    async fn public_ip(&self) -> Result<IpAddr, Error> {
        let url = self.endpoint(PUBLIC_IP_PATH)?;
        let response = self
            .http
            .get(url.clone())
            .send()
            .await
            .map_err(|e| control_failure(url.as_str(), e))?;
        let body: PublicIpBody = ensure_success(url.as_str(), response)?
            .json()
            .await
            .map_err(|e| control_failure(url.as_str(), e))?;

        body.public_ip
            .parse()
            .map_err(|e| Error::InfraFault(format!("{url}: invalid public ip {:?}: {e}", body.public_ip)))
    }

    async fn stop(&self) -> Result<(), Error> {
        self.set_status(TunnelStatus::Stopped).await
    }

    async fn start(&self) -> Result<(), Error> {
        self.set_status(TunnelStatus::Running).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn control(server: &MockServer) -> HttpTunnelControl {
        HttpTunnelControl::new(&server.uri(), Duration::from_secs(2)).unwrap()
    }

    #[tokio::test]
    async fn test_status_running_and_stopped() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/openvpn/status"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "running"})))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/openvpn/status"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "stopped"})))
            .mount(&server)
            .await;

        let control = control(&server).await;
        assert_eq!(control.status().await.unwrap(), TunnelStatus::Running);
        assert_eq!(control.status().await.unwrap(), TunnelStatus::Stopped);
    }

    #[tokio::test]
    async fn test_public_ip() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/publicip/ip"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"public_ip": "203.0.113.10"})))
            .mount(&server)
            .await;

        let ip = control(&server).await.public_ip().await.unwrap();
        assert_eq!(ip, "203.0.113.10".parse::<IpAddr>().unwrap());
    }

    #[tokio::test]
    async fn test_stop_and_start_put_status() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/v1/openvpn/status"))
            .and(body_json(json!({"status": "stopped"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"outcome": "stopped"})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/v1/openvpn/status"))
            .and(body_json(json!({"status": "running"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"outcome": "running"})))
            .expect(1)
            .mount(&server)
            .await;

        let control = control(&server).await;
        control.stop().await.unwrap();
        control.start().await.unwrap();
    }

    #[tokio::test]
    async fn test_server_error_is_infra_fault() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let err = control(&server).await.status().await.unwrap_err();
        assert!(matches!(err, Error::InfraFault(_)));
    }

    #[test]
    fn test_invalid_control_url() {
        assert!(HttpTunnelControl::new("not a url", Duration::from_secs(1)).is_err());
    }
}
