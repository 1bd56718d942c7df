//! Proxied HTTP client.
//!
//! The only place in the crate that constructs a `reqwest::Client`. Every
//! client built here egresses through a SOCKS5 proxy; a builder without a
//! proxy, or with a non-SOCKS proxy, fails to build instead of falling back
//! to a direct connection.

mod user_agent;

pub use user_agent::{random_user_agent, resolve_user_agent, IMPERSONATE_USER_AGENTS, USER_AGENT};

use std::time::Duration;

use reqwest::{Client, Proxy, Response};
use tracing::debug;

/// HTTP client bound to the session proxy.
#[derive(Clone)]
pub struct HttpClient {
    client: Client,
    name: String,
}

/// Builder for constructing `HttpClient`.
///
/// Required parameters (name, timeout) are provided via
/// `HttpClient::builder()`. The proxy is mandatory in practice: `build()`
/// refuses to produce a client without one.
pub struct HttpClientBuilder {
    name: String,
    timeout: Duration,
    user_agent: Option<String>,
    proxy_url: Option<String>,
}

impl HttpClientBuilder {
    /// Set the user agent string.
    /// - `"impersonate"`: Use random real browser user agent
    /// - Any other string: Use as-is
    /// - Not called: Use the generic default
    pub fn user_agent(mut self, ua: &str) -> Self {
        self.user_agent = Some(ua.to_string());
        self
    }

    /// Route all requests through this SOCKS5 proxy.
    pub fn proxy(mut self, url: &str) -> Self {
        self.proxy_url = Some(url.to_string());
        self
    }

    /// Build the `HttpClient`.
    ///
    /// # Errors
    /// Returns an error if no proxy is set, the proxy is not SOCKS5, or
    /// reqwest rejects the configuration.
    pub fn build(self) -> Result<HttpClient, String> {
        let user_agent = resolve_user_agent(self.user_agent.as_deref());

        let proxy_url = self.proxy_url.ok_or_else(|| {
            format!(
                "HTTP client '{}' has no proxy configured; refusing to connect directly",
                self.name
            )
        })?;

        // Validate SOCKS URL scheme
        if !proxy_url.starts_with("socks5://") && !proxy_url.starts_with("socks5h://") {
            return Err(format!(
                "Invalid SOCKS proxy URL: '{}'. Must start with socks5:// or socks5h://",
                proxy_url
            ));
        }
        let proxy = Proxy::all(&proxy_url)
            .map_err(|e| format!("Invalid SOCKS proxy URL '{}': {}", proxy_url, e))?;

        let client = Client::builder()
            .user_agent(&user_agent)
            .timeout(self.timeout)
            .gzip(true)
            .brotli(true)
            .proxy(proxy)
            .build()
            .map_err(|e| format!("Failed to build HTTP client: {}", e))?;

        debug!("HTTP client '{}' routed through SOCKS proxy", self.name);

        Ok(HttpClient {
            client,
            name: self.name,
        })
    }
}

impl HttpClient {
    /// Start building a client.
    pub fn builder(name: &str, timeout: Duration) -> HttpClientBuilder {
        HttpClientBuilder {
            name: name.to_string(),
            timeout,
            user_agent: None,
            proxy_url: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn get(&self, url: &str) -> Result<Response, reqwest::Error> {
        self.client.get(url).send().await
    }

    /// POST an urlencoded form.
    pub async fn post_form(
        &self,
        url: &str,
        form: &[(&str, &str)],
    ) -> Result<Response, reqwest::Error> {
        self.client.post(url).form(form).send().await
    }
}
