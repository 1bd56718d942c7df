//! Identity commands: status and rotate.

use anyhow::Context;
use console::style;

use crate::config::Config;
use crate::privacy::Circuit;

use super::helpers::{
    build_coordinator, build_session, describe_identity, print_json, status_hint,
};

/// Show the session identity, optionally probing it first.
pub async fn cmd_status(config: &Config, probe: bool, json: bool) -> anyhow::Result<()> {
    let session = build_session(config)?;

    if probe {
        session.ensure_ready().await.context("Tor is not ready")?;
        if let Err(e) = session.probe_identity().await {
            eprintln!("{} {}", style("!").yellow(), e);
        }
    }

    let coordinator = build_coordinator(config, session.clone())?;
    let snapshot = coordinator.status().await;

    if json {
        return print_json(&snapshot);
    }

    println!("\n{}", style("Tor Session").bold());
    println!("{}", "-".repeat(60));
    println!("{:<12} {}", "Proxy:", session.proxy_url());
    println!("{:<12} {}", "Control:", config.privacy.control_addr);
    println!("{:<12} {}", "Identity:", describe_identity(&snapshot));
    if let Some(hint) = status_hint(&snapshot, probe) {
        println!("  {} {}", style("i").dim(), hint);
    }
    Ok(())
}

/// Rotate to a new circuit and report the old and new identity.
pub async fn cmd_rotate(config: &Config, json: bool) -> anyhow::Result<()> {
    let session = build_session(config)?;
    session.ensure_ready().await.context("Tor is not ready")?;

    let coordinator = build_coordinator(config, session)?;
    let report = coordinator.rotate_now().await.context("Rotation failed")?;

    if json {
        return print_json(&report);
    }

    let old = report
        .old
        .map(|ip| ip.to_string())
        .unwrap_or_else(|| "unknown".to_string());
    println!(
        "{} Identity rotated: {} → {}",
        style("✓").green(),
        old,
        style(report.new).bold()
    );
    Ok(())
}
