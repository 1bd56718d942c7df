//! CLI commands implementation.
//!
//! This module contains the CLI parser and dispatches to command-specific modules.

mod check;
mod collect;
mod helpers;
mod search;
mod session;

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};

use crate::config::Config;
use crate::fetch::AudioFormat;
use crate::search::SearchMode;

#[derive(Parser)]
#[command(name = "ghosttube")]
#[command(about = "Collect audio, video and transcripts through Tor")]
#[command(version)]
pub struct Cli {
    /// Config file path (overrides auto-discovery)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Storage root (overrides config file and GHOSTTUBE_OUTPUT_DIR)
    #[arg(short, long, global = true)]
    output: Option<PathBuf>,

    /// Tor SOCKS proxy URL, e.g. socks5h://127.0.0.1:9150
    #[arg(long, global = true)]
    socks_proxy: Option<String>,

    /// Disable Tor legality warning
    #[arg(long, global = true)]
    no_tor_warning: bool,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Check if verbose mode is enabled (for early logging setup).
pub fn is_verbose() -> bool {
    std::env::args().any(|arg| arg == "-v" || arg == "--verbose")
}

#[derive(Subcommand)]
enum Commands {
    /// Search (or list) videos and fetch the requested representations
    Collect {
        /// Search query (omit when using --url or --playlist)
        query: Option<String>,
        /// Video URL to fetch directly (repeatable)
        #[arg(long = "url", conflicts_with_all = ["query", "playlist"])]
        urls: Vec<String>,
        /// Playlist or channel URL to fetch entries from
        #[arg(long, conflicts_with = "query")]
        playlist: Option<String>,
        /// Extract audio in this format (default: mp3 when nothing else is requested)
        #[arg(long, value_enum)]
        audio: Option<AudioFormat>,
        /// Fetch the video as mp4
        #[arg(long)]
        video: bool,
        /// Fetch captions as SRT
        #[arg(long)]
        transcript: bool,
        /// Caption language (default from config, usually "en")
        #[arg(long)]
        lang: Option<String>,
        /// Maximum number of search or playlist results
        #[arg(short = 'n', long)]
        max_results: Option<usize>,
        /// DuckDuckGo query scope (default from config, usually broad)
        #[arg(long, value_enum)]
        mode: Option<SearchMode>,
        /// Succeed only when every requested file was fetched
        #[arg(long)]
        strict: bool,
        /// Output the result as JSON
        #[arg(long)]
        json: bool,
    },

    /// Resolve a query to videos without fetching anything
    Search {
        /// Search query
        query: String,
        /// Maximum number of results
        #[arg(short = 'n', long)]
        max_results: Option<usize>,
        /// DuckDuckGo query scope (default from config, usually broad)
        #[arg(long, value_enum)]
        mode: Option<SearchMode>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show the Tor identity
    Status {
        /// Probe the identity through the proxy instead of reporting the last known one
        #[arg(long)]
        probe: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Request a new Tor circuit and confirm the identity changed
    Rotate {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Check Tor control access, the proxied identity and the fetch tool
    Check,
}

/// Run the CLI.
pub async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::load_from_path(path)
            .await
            .map_err(anyhow::Error::msg)
            .with_context(|| format!("Failed to load {}", path.display()))?,
        None => Config::load().await,
    };

    config.privacy = config
        .privacy
        .with_cli_overrides(cli.socks_proxy, cli.no_tor_warning);
    if let Some(output) = cli.output {
        let output = std::env::current_dir()?.join(output);
        config.output_dir = Some(output.to_string_lossy().into_owned());
    }

    // Show Tor legality warning (can be disabled)
    config.privacy.show_tor_legal_warning();

    match cli.command {
        Commands::Collect {
            query,
            urls,
            playlist,
            audio,
            video,
            transcript,
            lang,
            max_results,
            mode,
            strict,
            json,
        } => {
            if let Some(mode) = mode {
                config.search.mode = mode;
            }
            let args = collect::CollectArgs {
                query,
                urls,
                playlist,
                audio,
                video,
                transcript,
                lang,
                max_results,
                strict,
                json,
            };
            collect::cmd_collect(&config, args).await
        }
        Commands::Search {
            query,
            max_results,
            mode,
            json,
        } => {
            if let Some(mode) = mode {
                config.search.mode = mode;
            }
            search::cmd_search(&config, &query, max_results, json).await
        }
        Commands::Status { probe, json } => session::cmd_status(&config, probe, json).await,
        Commands::Rotate { json } => session::cmd_rotate(&config, json).await,
        Commands::Check => check::cmd_check(&config).await,
    }
}
