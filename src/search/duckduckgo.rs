//! DuckDuckGo HTML search surface.

use async_trait::async_trait;
use reqwest::StatusCode;
use tracing::debug;

use super::{parse, Candidate, SearchConfig, SearchError, SearchMode, SearchSurface};
use crate::http_client::HttpClient;

/// Searches the no-JavaScript DuckDuckGo endpoint, restricted to YouTube.
pub struct DuckDuckGoSurface {
    client: HttpClient,
    endpoint: String,
    mode: SearchMode,
}

impl DuckDuckGoSurface {
    pub fn new(client: HttpClient, endpoint: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
            mode: SearchMode::default(),
        }
    }

    pub fn with_mode(mut self, mode: SearchMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn from_config(config: &SearchConfig, proxy_url: &str) -> Result<Self, SearchError> {
        let client = HttpClient::builder("duckduckgo", config.timeout())
            .user_agent(&config.user_agent)
            .proxy(proxy_url)
            .build()
            .map_err(SearchError::Config)?;
        Ok(Self::new(client, config.endpoint.clone()).with_mode(config.mode))
    }
}

/// Statuses DuckDuckGo uses to push back on a client address.
///
/// 202 is what the HTML endpoint answers with its bot challenge.
fn classify_status(status: StatusCode) -> Result<(), SearchError> {
    match status.as_u16() {
        200..=201 | 203..=299 => Ok(()),
        202 | 403 | 429 | 503 => Err(SearchError::Blocked(format!(
            "DuckDuckGo returned {}",
            status
        ))),
        _ => Err(SearchError::Transport(format!(
            "DuckDuckGo returned {}",
            status
        ))),
    }
}

#[async_trait]
impl SearchSurface for DuckDuckGoSurface {
    fn name(&self) -> &str {
        "duckduckgo"
    }

    async fn search(
        &self,
        query: &str,
        _max_results: usize,
    ) -> Result<Vec<Candidate>, SearchError> {
        let query = self.mode.query_text(query);
        debug!("DuckDuckGo search: {}", query);

        let response = self
            .client
            .post_form(&self.endpoint, &[("q", query.as_str()), ("kl", "us-en")])
            .await
            .map_err(|e| SearchError::Transport(e.to_string()))?;

        classify_status(response.status())?;

        let html = response
            .text()
            .await
            .map_err(|e| SearchError::Transport(format!("Failed to read response text: {}", e)))?;
        Ok(parse::parse_results(&html))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_text_per_mode() {
        assert_eq!(
            SearchMode::Broad.query_text("Blue October"),
            "Blue October youtube"
        );
        assert_eq!(
            SearchMode::Precise.query_text("Blue October"),
            "Blue October site:youtube.com OR site:music.youtube.com"
        );
    }

    #[test]
    fn surface_takes_mode_from_config() {
        let config = SearchConfig {
            mode: SearchMode::Precise,
            ..Default::default()
        };
        let proxy = "socks5h://127.0.0.1:9050";
        let surface = DuckDuckGoSurface::from_config(&config, proxy).unwrap();
        assert_eq!(surface.mode, SearchMode::Precise);

        let default = DuckDuckGoSurface::from_config(&SearchConfig::default(), proxy).unwrap();
        assert_eq!(default.mode, SearchMode::Broad);
    }

    #[test]
    fn block_statuses() {
        for code in [202u16, 403, 429, 503] {
            let status = StatusCode::from_u16(code).unwrap();
            assert!(matches!(classify_status(status), Err(SearchError::Blocked(_))));
        }
    }

    #[test]
    fn other_failures_are_transport() {
        for code in [400u16, 404, 500, 502] {
            let status = StatusCode::from_u16(code).unwrap();
            assert!(matches!(
                classify_status(status),
                Err(SearchError::Transport(_))
            ));
        }
        assert!(classify_status(StatusCode::OK).is_ok());
    }
}
