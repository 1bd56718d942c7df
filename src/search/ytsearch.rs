//! Search through the fetch tool's own `ytsearch` listing.

use std::sync::Arc;

use async_trait::async_trait;

use super::{parse, Candidate, SearchError, SearchSurface};
use crate::fetch::{FetchTool, ToolError};

pub struct ToolSearchSurface {
    tool: Arc<dyn FetchTool>,
    proxy_url: String,
}

impl ToolSearchSurface {
    pub fn new(tool: Arc<dyn FetchTool>, proxy_url: &str) -> Self {
        Self {
            tool,
            proxy_url: proxy_url.to_string(),
        }
    }
}

#[async_trait]
impl SearchSurface for ToolSearchSurface {
    fn name(&self) -> &str {
        "ytsearch"
    }

    async fn search(
        &self,
        query: &str,
        max_results: usize,
    ) -> Result<Vec<Candidate>, SearchError> {
        let entries = self
            .tool
            .search(query, max_results, &self.proxy_url)
            .await
            .map_err(|e| match e {
                ToolError::Rejected(msg) => SearchError::Blocked(msg),
                ToolError::Network(msg) => SearchError::Transport(msg),
                other => SearchError::Tool(other.to_string()),
            })?;

        let found = entries
            .into_iter()
            .filter_map(|entry| parse::video_id(&entry.url).map(|id| (id, entry.title)))
            .collect();
        Ok(parse::rank(found, usize::MAX))
    }
}
