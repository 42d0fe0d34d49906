use std::net::{Ipv4Addr, SocketAddr};

use reqwest::header::CONTENT_TYPE;
use reqwest::Method;

use crate::error::{RelayError, RequestStage};
use crate::session::TunnelSession;

/// Invoke API version used when none is configured
pub const DEFAULT_API_VERSION: &str = "1";

/// Build the invoke URL for an app method behind a local port
pub fn invoke_url(port: u16, api_version: &str, app_id: &str, method: &str) -> String {
    invoke_url_at(
        SocketAddr::from((Ipv4Addr::LOCALHOST, port)),
        api_version,
        app_id,
        method,
    )
}

/// Build the invoke URL for an app method at any address
pub fn invoke_url_at(addr: SocketAddr, api_version: &str, app_id: &str, method: &str) -> String {
    format!("http://{}{}", addr, invoke_path(api_version, app_id, method))
}

/// Sidecar path of an app method.
///
/// Leading slashes on `method` are dropped, so "status" and "/status" name
/// the same method.
pub fn invoke_path(api_version: &str, app_id: &str, method: &str) -> String {
    format!(
        "/v{}/invoke/{}/method/{}",
        api_version,
        app_id,
        method.trim_start_matches('/')
    )
}

/// Performs one buffered request/response exchange through a ready tunnel
#[derive(Clone)]
pub struct RequestRelay {
    client: reqwest::Client,
    api_version: String,
}

impl RequestRelay {
    pub fn new(api_version: impl Into<String>) -> Result<Self, RelayError> {
        // Targets are loopback tunnels or pod IPs; never route them via a proxy
        let client = reqwest::Client::builder()
            .no_proxy()
            .build()
            .map_err(|e| RelayError::request(RequestStage::Construction, e))?;

        Ok(Self {
            client,
            api_version: api_version.into(),
        })
    }

    pub fn api_version(&self) -> &str {
        &self.api_version
    }

    /// Invoke `method` on `app_id` through the session's bound address.
    ///
    /// The response body is returned as-is whatever the status code.
    pub async fn send(
        &self,
        session: &TunnelSession,
        app_id: &str,
        method: &str,
        payload: &[u8],
        verb: &str,
    ) -> Result<String, RelayError> {
        let addr = session.local_addr().ok_or(RelayError::NotReady)?;
        let url = invoke_url_at(addr, &self.api_version, app_id, method);
        self.send_to(&url, payload, verb).await
    }

    /// Issue one request to `url` and read the whole body
    pub async fn send_to(&self, url: &str, payload: &[u8], verb: &str) -> Result<String, RelayError> {
        let method = Method::from_bytes(verb.as_bytes())
            .map_err(|e| RelayError::request(RequestStage::Construction, e))?;

        tracing::debug!("Relaying {} {}", method, url);

        let mut request = self.client.request(method, url);
        if !payload.is_empty() {
            request = request
                .header(CONTENT_TYPE, "application/json")
                .body(payload.to_vec());
        }
        let request = request
            .build()
            .map_err(|e| RelayError::request(RequestStage::Construction, e))?;

        let response = self
            .client
            .execute(request)
            .await
            .map_err(|e| RelayError::request(RequestStage::Execution, e))?;

        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|e| RelayError::request(RequestStage::BodyRead, e))?;

        tracing::debug!("Response: {} ({} bytes)", status, body.len());

        Ok(String::from_utf8_lossy(&body).into_owned())
    }
}
