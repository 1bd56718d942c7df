//! Egress identity probing.

use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;

use super::{PrivacyConfig, SessionError};
use crate::http_client::HttpClient;

/// Learns the public address the proxy currently egresses from.
#[async_trait]
pub trait IdentityProbe: Send + Sync {
    async fn probe(&self) -> Result<IpAddr, SessionError>;
}

/// Probe against an IP-reflecting HTTP endpoint, through the proxy.
pub struct HttpIdentityProbe {
    client: HttpClient,
    url: String,
    timeout: Duration,
}

impl HttpIdentityProbe {
    pub fn new(client: HttpClient, url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client,
            url: url.into(),
            timeout,
        }
    }

    /// Build a probe with its own proxied client.
    pub fn from_config(config: &PrivacyConfig) -> Result<Self, SessionError> {
        let proxy = config.effective_proxy_url()?;
        let client = HttpClient::builder("identity-probe", config.probe_timeout())
            .proxy(&proxy)
            .build()
            .map_err(SessionError::Config)?;
        Ok(Self::new(client, config.probe_url.clone(), config.probe_timeout()))
    }

    async fn fetch(&self) -> Result<IpAddr, SessionError> {
        let response = self
            .client
            .get(&self.url)
            .await
            .map_err(|e| SessionError::ProbeFailed(format!("request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(SessionError::ProbeFailed(format!(
                "probe endpoint answered {}",
                status
            )));
        }

        let body = response
            .text()
            .await
            .map_err(|e| SessionError::ProbeFailed(format!("reading body failed: {}", e)))?;
        parse_identity(&body)
    }
}

#[async_trait]
impl IdentityProbe for HttpIdentityProbe {
    async fn probe(&self) -> Result<IpAddr, SessionError> {
        tokio::time::timeout(self.timeout, self.fetch())
            .await
            .map_err(|_| SessionError::ProbeFailed("probe timed out".into()))?
    }
}

/// The body must be a bare IP address, surrounding whitespace aside.
pub(crate) fn parse_identity(body: &str) -> Result<IpAddr, SessionError> {
    let trimmed = body.trim();
    trimmed.parse().map_err(|_| {
        let preview: String = trimmed.chars().take(40).collect();
        SessionError::ProbeFailed(format!("malformed identity response: {:?}", preview))
    })
}
