//! Shared helper functions for CLI commands.

use std::sync::Arc;

use anyhow::Context;
use serde::Serialize;

use crate::collect::CollectionCoordinator;
use crate::config::Config;
use crate::fetch::{FetchOrchestrator, FetchTool, YtDlp};
use crate::privacy::{Circuit, CircuitSession, IdentitySnapshot};
use crate::search::SearchResolver;

/// The session every command shares for the lifetime of the process.
pub fn build_session(config: &Config) -> anyhow::Result<Arc<CircuitSession>> {
    let session =
        CircuitSession::from_config(&config.privacy).context("Invalid privacy configuration")?;
    Ok(Arc::new(session))
}

pub fn build_tool(config: &Config) -> Arc<YtDlp> {
    Arc::new(YtDlp::from_config(&config.fetch))
}

pub fn build_resolver(
    config: &Config,
    session: Arc<CircuitSession>,
    tool: Arc<dyn FetchTool>,
) -> anyhow::Result<SearchResolver> {
    let surface = config
        .search
        .build_surface(session.proxy_url(), tool)
        .context("Failed to set up search")?;
    Ok(SearchResolver::new(session, surface))
}

/// Wire session, search, fetch tool and storage into a coordinator.
pub fn build_coordinator(
    config: &Config,
    session: Arc<CircuitSession>,
) -> anyhow::Result<CollectionCoordinator> {
    let tool: Arc<dyn FetchTool> = build_tool(config);
    let resolver = build_resolver(config, session.clone(), tool.clone())?;
    let orchestrator = Arc::new(FetchOrchestrator::new(
        session.clone(),
        tool,
        config.fetch.clone(),
    ));

    Ok(CollectionCoordinator::new(
        session,
        resolver,
        orchestrator,
        config.storage_layout(),
        config.rotation.clone(),
    ))
}

pub fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// One-line description of the session identity.
pub fn describe_identity(snapshot: &IdentitySnapshot) -> String {
    let identity = snapshot
        .identity
        .map(|ip| ip.to_string())
        .unwrap_or_else(|| "not observed by this process".to_string());
    let rotated = snapshot
        .last_rotation
        .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| "never".to_string());
    format!(
        "{} ({}, last rotation: {})",
        identity,
        if snapshot.live { "live" } else { "unverified" },
        rotated
    )
}

/// Hint printed under `status` when the identity was not probed.
///
/// A new process has observed nothing yet, so without `--probe` the
/// identity is always unknown.
pub fn status_hint(snapshot: &IdentitySnapshot, probed: bool) -> Option<&'static str> {
    match (probed, snapshot.identity) {
        (true, _) => None,
        (false, None) => Some(
            "Each run starts without an observed identity; use --probe to check it through the proxy",
        ),
        (false, Some(_)) => Some("Last observed identity; use --probe to refresh it"),
    }
}

/// Truncate a string to at most `max` characters, adding "..." when cut.
pub fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let kept: String = s.chars().take(max.saturating_sub(3)).collect();
    format!("{}...", kept)
}
