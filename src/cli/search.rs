//! Search command.

use anyhow::Context;
use console::style;

use crate::config::Config;
use crate::privacy::Circuit;

use super::helpers::{build_resolver, build_session, build_tool, print_json, truncate};

/// Resolve a query through the proxy and list the videos found.
pub async fn cmd_search(
    config: &Config,
    query: &str,
    max_results: Option<usize>,
    json: bool,
) -> anyhow::Result<()> {
    let max_results = max_results.unwrap_or(config.search.default_max_results);
    let session = build_session(config)?;
    session.ensure_ready().await.context("Tor is not ready")?;

    let resolver = build_resolver(config, session, build_tool(config))?;
    let candidates = resolver.resolve(query, max_results).await?;

    if json {
        return print_json(&candidates);
    }

    if candidates.is_empty() {
        println!("{} No videos found for '{}'", style("!").yellow(), query);
        return Ok(());
    }

    println!("\n{}", style(format!("Results for '{}'", query)).bold());
    println!("{}", "-".repeat(80));
    for candidate in &candidates {
        println!(
            "{:>3}. {:<45} {}",
            candidate.rank,
            truncate(candidate.title.as_deref().unwrap_or("-"), 44),
            candidate.url
        );
    }
    Ok(())
}
