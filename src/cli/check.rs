//! Prerequisite check.

use console::style;

use crate::config::Config;
use crate::fetch::FetchTool;
use crate::privacy::{Circuit, ControlChannel, TorControl};

use super::helpers::{build_session, build_tool};

/// Check that Tor and the fetch tool are usable.
pub async fn cmd_check(config: &Config) -> anyhow::Result<()> {
    println!("\n{}", style("Prerequisites").bold());
    println!("{}", "-".repeat(60));

    let mut all_ok = true;

    let control = TorControl::from_config(&config.privacy);
    match control.bootstrap_progress().await {
        Ok(100) => println!(
            "  {} Tor control port {} (bootstrapped)",
            style("✓").green(),
            config.privacy.control_addr
        ),
        Ok(progress) => {
            all_ok = false;
            println!(
                "  {} Tor control port {} (bootstrap {}%)",
                style("!").yellow(),
                config.privacy.control_addr,
                progress
            );
        }
        Err(e) => {
            all_ok = false;
            println!("  {} Tor control port: {}", style("✗").red(), e);
        }
    }

    let session = build_session(config)?;
    match session.probe_identity().await {
        Ok(ip) => println!(
            "  {} Identity through {}: {}",
            style("✓").green(),
            session.proxy_url(),
            ip
        ),
        Err(e) => {
            all_ok = false;
            println!("  {} Identity probe: {}", style("✗").red(), e);
        }
    }

    let tool = build_tool(config);
    match tool.locate() {
        Ok(path) => match tool.version().await {
            Ok(version) => println!(
                "  {} yt-dlp {} ({})",
                style("✓").green(),
                version,
                path.display()
            ),
            Err(e) => {
                all_ok = false;
                println!("  {} yt-dlp at {}: {}", style("✗").red(), path.display(), e);
            }
        },
        Err(e) => {
            all_ok = false;
            println!("  {} {}", style("✗").red(), e);
            println!("    Install yt-dlp (and ffmpeg for audio/video conversion)");
        }
    }

    println!();
    if all_ok {
        println!("{} Ready to collect", style("✓").green());
        Ok(())
    } else {
        println!("{} Some prerequisites are missing", style("✗").red());
        std::process::exit(1);
    }
}
