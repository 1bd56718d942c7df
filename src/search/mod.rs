//! Search acquisition: free-text query to ranked candidate videos.
//!
//! A [`SearchSurface`] performs a single request against some search front
//! end and returns whatever candidates it could parse. The [`SearchResolver`]
//! wraps a surface with the degradation policy: a block signal costs one
//! rotation and one retry, nothing more.

mod duckduckgo;
pub mod parse;
mod ytsearch;

pub use duckduckgo::DuckDuckGoSurface;
pub use ytsearch::ToolSearchSurface;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::fetch::FetchTool;
use crate::privacy::Circuit;

/// A discovered video awaiting fetch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    /// Platform video id; unique within one result set.
    pub id: String,
    /// Canonical watch URL.
    pub url: String,
    pub title: Option<String>,
    /// 1-based position in the surface's result order.
    pub rank: usize,
}

/// Failure of a single search request.
#[derive(Debug, thiserror::Error)]
pub enum SearchError {
    /// Rate limit, captcha or other refusal tied to the current identity.
    #[error("search surface blocked the request: {0}")]
    Blocked(String),

    #[error("search request failed: {0}")]
    Transport(String),

    #[error("search tool failed: {0}")]
    Tool(String),

    #[error("search configuration error: {0}")]
    Config(String),
}

/// Failure of the resolution stage as a whole.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolveError {
    #[error("search resolution failed: {0}")]
    ResolutionFailed(String),
}

/// One request against a search front end.
#[async_trait]
pub trait SearchSurface: Send + Sync {
    fn name(&self) -> &str;

    /// Candidates in surface order. An unparseable page is an empty list.
    async fn search(&self, query: &str, max_results: usize)
        -> Result<Vec<Candidate>, SearchError>;
}

/// Which search front end to use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SurfaceKind {
    /// DuckDuckGo HTML endpoint.
    #[default]
    Duckduckgo,
    /// The fetch tool's own search (`ytsearchN:`).
    Ytsearch,
}

/// How a DuckDuckGo query is scoped to the platform.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SearchMode {
    /// `<query> youtube`: more varied results, uploads by anyone.
    #[default]
    Broad,
    /// Restricted to youtube.com and music.youtube.com.
    Precise,
}

impl SearchMode {
    /// The query text actually sent to the search engine.
    pub fn query_text(&self, query: &str) -> String {
        match self {
            SearchMode::Broad => format!("{} youtube", query),
            SearchMode::Precise => {
                format!("{} site:youtube.com OR site:music.youtube.com", query)
            }
        }
    }
}

pub const DDG_SEARCH_URL: &str = "https://html.duckduckgo.com/html/";

/// Search configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    #[serde(default)]
    pub surface: SurfaceKind,

    /// Query scoping for the DuckDuckGo surface.
    #[serde(default)]
    pub mode: SearchMode,

    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// Single request timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// User agent; "impersonate" picks a real browser string.
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    #[serde(default = "default_max_results")]
    pub default_max_results: usize,
}

fn default_endpoint() -> String {
    DDG_SEARCH_URL.to_string()
}

fn default_timeout() -> u64 {
    30
}

fn default_user_agent() -> String {
    "impersonate".to_string()
}

fn default_max_results() -> usize {
    5
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            surface: SurfaceKind::default(),
            mode: SearchMode::default(),
            endpoint: default_endpoint(),
            timeout_secs: default_timeout(),
            user_agent: default_user_agent(),
            default_max_results: default_max_results(),
        }
    }
}

impl SearchConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Instantiate the configured surface, bound to the session proxy.
    pub fn build_surface(
        &self,
        proxy_url: &str,
        tool: Arc<dyn FetchTool>,
    ) -> Result<Arc<dyn SearchSurface>, SearchError> {
        Ok(match self.surface {
            SurfaceKind::Duckduckgo => Arc::new(DuckDuckGoSurface::from_config(self, proxy_url)?),
            SurfaceKind::Ytsearch => Arc::new(ToolSearchSurface::new(tool, proxy_url)),
        })
    }
}

/// Resolves queries through a surface, rotating once when blocked.
///
/// Callers are expected to have run `Circuit::ensure_ready` first.
pub struct SearchResolver {
    circuit: Arc<dyn Circuit>,
    surface: Arc<dyn SearchSurface>,
}

impl SearchResolver {
    pub fn new(circuit: Arc<dyn Circuit>, surface: Arc<dyn SearchSurface>) -> Self {
        Self { circuit, surface }
    }

    /// Ordered, deduplicated candidates for `query`, at most `max_results`.
    pub async fn resolve(
        &self,
        query: &str,
        max_results: usize,
    ) -> Result<Vec<Candidate>, ResolveError> {
        let query = query.trim();
        if query.is_empty() || max_results == 0 {
            return Ok(Vec::new());
        }

        debug!("Resolving '{}' via {}", query, self.surface.name());
        let found = match self.surface.search(query, max_results).await {
            Ok(found) => found,
            Err(SearchError::Blocked(reason)) => {
                warn!("{} blocked search: {}; rotating once", self.surface.name(), reason);
                if let Err(e) = self.circuit.rotate().await {
                    warn!("Rotation after search block failed: {}", e);
                }
                self.retry(query, max_results).await?
            }
            Err(e @ SearchError::Config(_)) => {
                return Err(ResolveError::ResolutionFailed(e.to_string()));
            }
            Err(e) => {
                warn!("{} search failed: {}; retrying once", self.surface.name(), e);
                self.retry(query, max_results).await?
            }
        };

        let candidates = parse::rank(
            found.into_iter().map(|c| (c.id, c.title)).collect(),
            max_results,
        );
        info!("Resolved '{}' to {} candidate(s)", query, candidates.len());
        Ok(candidates)
    }

    async fn retry(&self, query: &str, max_results: usize) -> Result<Vec<Candidate>, ResolveError> {
        self.surface
            .search(query, max_results)
            .await
            .map_err(|e| ResolveError::ResolutionFailed(e.to_string()))
    }
}
