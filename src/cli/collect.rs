//! Collect command.

use anyhow::Context;
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::mpsc;

use crate::collect::{
    CancelToken, CollectionEvent, CollectionRequest, CollectionResult, CollectionTarget,
    SuccessPolicy,
};
use crate::config::Config;
use crate::fetch::{AudioFormat, FetchStatus, Representation, RepresentationSet};

use super::helpers::{build_coordinator, build_session, build_tool, print_json, truncate};

/// Arguments of `ghosttube collect`.
pub struct CollectArgs {
    pub query: Option<String>,
    pub urls: Vec<String>,
    pub playlist: Option<String>,
    pub audio: Option<AudioFormat>,
    pub video: bool,
    pub transcript: bool,
    pub lang: Option<String>,
    pub max_results: Option<usize>,
    pub strict: bool,
    pub json: bool,
}

impl CollectArgs {
    fn target(&self) -> anyhow::Result<CollectionTarget> {
        if !self.urls.is_empty() {
            return Ok(CollectionTarget::Urls(self.urls.clone()));
        }
        if let Some(ref playlist) = self.playlist {
            return Ok(CollectionTarget::Playlist(playlist.clone()));
        }
        match self.query.as_deref().map(str::trim) {
            Some(query) if !query.is_empty() => Ok(CollectionTarget::Query(query.to_string())),
            _ => anyhow::bail!("Provide a search query, --url or --playlist"),
        }
    }

    /// Audio defaults to mp3 when nothing was asked for.
    fn representations(&self, config: &Config) -> anyhow::Result<RepresentationSet> {
        let mut representations = Vec::new();
        if self.audio.is_some() || (!self.video && !self.transcript) {
            representations.push(Representation::Audio {
                format: self.audio.unwrap_or(AudioFormat::Mp3),
            });
        }
        if self.video {
            representations.push(Representation::Video);
        }
        if self.transcript {
            let language = self
                .lang
                .clone()
                .unwrap_or_else(|| config.fetch.transcript_language.clone());
            representations.push(Representation::Transcript { language });
        }
        Ok(RepresentationSet::new(representations)?)
    }
}

/// Collect media for a query, URL list or playlist.
pub async fn cmd_collect(config: &Config, args: CollectArgs) -> anyhow::Result<()> {
    let target = args.target()?;
    let representations = args.representations(config)?;
    let max_results = args
        .max_results
        .unwrap_or(config.search.default_max_results);
    let policy = if args.strict {
        SuccessPolicy::AllCompleted
    } else {
        SuccessPolicy::AnyCompleted
    };

    let tool = build_tool(config);
    tool.locate()
        .context("yt-dlp is required; install it or set GHOSTTUBE_YT_DLP")?;

    let session = build_session(config)?;
    let coordinator = build_coordinator(config, session)?;

    let cancel = CancelToken::new();
    let ctrl_c = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!(
                    "\n{} Cancelling: letting running downloads finish...",
                    style("!").yellow()
                );
                cancel.cancel();
            }
        })
    };

    let (event_tx, event_rx) = mpsc::channel(64);
    let progress = tokio::spawn(show_progress(event_rx, args.json));

    if !args.json {
        println!(
            "{} Collecting {} into {}",
            style("→").cyan(),
            style(target.label()).bold(),
            coordinator.layout().root().display()
        );
    }

    let request = CollectionRequest::new(target, representations, max_results).with_policy(policy);
    let result = coordinator.collect(request, &cancel, event_tx).await;
    ctrl_c.abort();
    let _ = progress.await;
    let result = result.context("Collection aborted")?;

    if args.json {
        print_json(&result)?;
    } else {
        print_summary(&result);
    }

    if !result.overall_success {
        std::process::exit(1);
    }
    Ok(())
}

async fn show_progress(mut event_rx: mpsc::Receiver<CollectionEvent>, hidden: bool) {
    let pb = if hidden {
        ProgressBar::hidden()
    } else {
        ProgressBar::new_spinner()
    };
    pb.set_message("Waiting for Tor...");
    pb.enable_steady_tick(std::time::Duration::from_millis(120));

    while let Some(event) = event_rx.recv().await {
        match event {
            CollectionEvent::Resolved { candidates } => {
                pb.set_length(candidates as u64);
                if let Ok(bar) = ProgressStyle::default_bar()
                    .template("{spinner:.green} [{bar:30.cyan/blue}] {pos}/{len} {wide_msg}")
                {
                    pb.set_style(bar.progress_chars("█▓░"));
                }
                pb.set_message(format!("{} video(s) found", candidates));
            }
            CollectionEvent::CandidateStarted { candidate, .. } => {
                let title = candidate.title.as_deref().unwrap_or(&candidate.id);
                pb.set_message(truncate(title, 50));
            }
            CollectionEvent::CandidateFinished { .. } => pb.inc(1),
            CollectionEvent::Rotated { reason, identity } => {
                pb.println(format!(
                    "  {} New identity {} ({})",
                    style("↻").cyan(),
                    identity,
                    reason
                ));
            }
            CollectionEvent::RotationFailed { reason, error } => {
                pb.println(format!(
                    "  {} Rotation failed ({}): {}",
                    style("!").yellow(),
                    reason,
                    error
                ));
            }
            CollectionEvent::Cancelled { skipped } => {
                pb.println(format!("  {} Skipped {} video(s)", style("!").yellow(), skipped));
            }
        }
    }
    pb.finish_and_clear();
}

fn print_summary(result: &CollectionResult) {
    if let Some(ref error) = result.resolution_error {
        println!("{} {}", style("✗").red(), error);
    }
    if result.groups.is_empty() {
        println!("{} No videos found for '{}'", style("!").yellow(), result.query);
        return;
    }

    for group in &result.groups {
        let title = group
            .candidate
            .title
            .as_deref()
            .unwrap_or(&group.candidate.id);
        println!("\n{}", style(truncate(title, 70)).bold());
        for outcome in &group.outcomes {
            match &outcome.status {
                FetchStatus::Completed { files } => {
                    for file in files {
                        println!(
                            "  {} {:<16} {}",
                            style("✓").green(),
                            outcome.representation.to_string(),
                            file.display()
                        );
                    }
                }
                FetchStatus::Failed { reason, detail } => {
                    println!(
                        "  {} {:<16} {}: {}",
                        style("✗").red(),
                        outcome.representation.to_string(),
                        reason,
                        truncate(detail, 80)
                    );
                }
            }
        }
    }

    let completed = result.completed_count();
    let total = completed + result.failed_count();
    let mark = if result.overall_success {
        style("✓").green()
    } else {
        style("✗").red()
    };
    println!(
        "\n{} {} of {} file(s) collected under {}",
        mark,
        completed,
        total,
        result.storage_root.display()
    );
}
