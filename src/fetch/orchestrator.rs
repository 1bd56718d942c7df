//! Fan-out of one candidate into per-representation tool invocations.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use super::{
    sanitize_component, FailureReason, FetchConfig, FetchJob, FetchOutcome, FetchTool,
    Representation, RepresentationSet, StemClaims, StorageLayout, ToolError, VideoDetails,
};
use crate::privacy::Circuit;
use crate::search::Candidate;

/// Delay before retry number `retry` (0-based): `base * 2^retry`, capped.
pub fn backoff_delay(base: Duration, cap: Duration, retry: u32) -> Duration {
    base.checked_mul(2u32.saturating_pow(retry))
        .unwrap_or(cap)
        .min(cap)
}

/// Runs the fetch tool for every requested representation of a candidate.
///
/// One orchestrator is shared by all requests of a process so the worker
/// ceiling bounds the total load on the proxy. Rotation is never triggered
/// here; callers inspect the outcomes and decide.
pub struct FetchOrchestrator {
    circuit: Arc<dyn Circuit>,
    tool: Arc<dyn FetchTool>,
    permits: Arc<Semaphore>,
    config: FetchConfig,
}

impl FetchOrchestrator {
    pub fn new(circuit: Arc<dyn Circuit>, tool: Arc<dyn FetchTool>, config: FetchConfig) -> Self {
        let permits = Arc::new(Semaphore::new(config.workers.max(1)));
        Self {
            circuit,
            tool,
            permits,
            config,
        }
    }

    pub fn tool(&self) -> &Arc<dyn FetchTool> {
        &self.tool
    }

    /// One outcome per requested representation, in request order.
    pub async fn fetch(
        &self,
        candidate: &Candidate,
        representations: &RepresentationSet,
        layout: &StorageLayout,
        group: &str,
    ) -> Vec<FetchOutcome> {
        self.fetch_claimed(candidate, representations, layout, group, &StemClaims::default())
            .await
    }

    /// Like [`fetch`](Self::fetch), but file stems are claimed in `claims`
    /// so candidates of one collection never write to the same file.
    pub async fn fetch_claimed(
        &self,
        candidate: &Candidate,
        representations: &RepresentationSet,
        layout: &StorageLayout,
        group: &str,
        claims: &StemClaims,
    ) -> Vec<FetchOutcome> {
        let proxy_url = self.circuit.proxy_url().to_string();

        let details = match self.describe(candidate, &proxy_url).await {
            Ok(details) => Some(details),
            Err(ToolError::NotAvailable(detail)) => {
                info!("{} is not available: {}", candidate.url, detail);
                return representations
                    .iter()
                    .map(|rep| {
                        FetchOutcome::failed(
                            &candidate.id,
                            rep.clone(),
                            0,
                            FailureReason::NotAvailable,
                            detail.clone(),
                        )
                    })
                    .collect();
            }
            Err(e) => {
                debug!("Metadata for {} unavailable, continuing: {}", candidate.id, e);
                None
            }
        };

        let title = details
            .as_ref()
            .and_then(|d| d.title.clone())
            .or_else(|| candidate.title.clone())
            .unwrap_or_else(|| candidate.id.clone());
        let stem = claims.claim(
            group,
            &sanitize_component(&title, &candidate.id),
            &candidate.id,
        );

        let jobs = representations.iter().map(|rep| {
            let job = FetchJob {
                url: candidate.url.clone(),
                representation: rep.clone(),
                output_dir: layout.group_dir(rep, group),
                file_stem: stem.clone(),
                proxy_url: proxy_url.clone(),
            };
            self.fetch_one(&candidate.id, job, details.as_ref())
        });
        join_all(jobs).await
    }

    async fn describe(
        &self,
        candidate: &Candidate,
        proxy_url: &str,
    ) -> Result<VideoDetails, ToolError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| ToolError::Launch("worker pool closed".into()))?;
        let limit = self.config.describe_timeout();
        tokio::time::timeout(limit, self.tool.describe(&candidate.url, proxy_url))
            .await
            .unwrap_or_else(|_| {
                Err(ToolError::Network(format!(
                    "metadata timed out after {}s",
                    limit.as_secs()
                )))
            })
    }

    async fn fetch_one(
        &self,
        candidate_id: &str,
        job: FetchJob,
        details: Option<&VideoDetails>,
    ) -> FetchOutcome {
        if let (Representation::Transcript { language }, Some(details)) =
            (&job.representation, details)
        {
            if !details.has_transcript(language) {
                return FetchOutcome::failed(
                    candidate_id,
                    job.representation.clone(),
                    0,
                    FailureReason::NotAvailable,
                    format!("no '{}' captions listed", language),
                );
            }
        }

        let mut attempts = 0;
        loop {
            attempts += 1;
            match self.attempt(&job).await {
                Ok(files) if files.is_empty() => {
                    return FetchOutcome::failed(
                        candidate_id,
                        job.representation,
                        attempts,
                        FailureReason::NotAvailable,
                        "fetch produced no files",
                    );
                }
                Ok(files) => {
                    info!(
                        "Fetched {} {} ({} file(s))",
                        candidate_id,
                        job.representation,
                        files.len()
                    );
                    return FetchOutcome::completed(
                        candidate_id,
                        job.representation,
                        attempts,
                        files,
                    );
                }
                Err(e)
                    if e.reason() == FailureReason::NetworkError
                        && attempts <= self.config.max_retries =>
                {
                    let delay = backoff_delay(
                        self.config.backoff_base(),
                        self.config.backoff_cap(),
                        attempts - 1,
                    );
                    warn!(
                        "{} {} attempt {} failed: {}; retrying in {:?}",
                        candidate_id, job.representation, attempts, e, delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    warn!("{} {} failed: {}", candidate_id, job.representation, e);
                    return FetchOutcome::failed(
                        candidate_id,
                        job.representation,
                        attempts,
                        e.reason(),
                        e.message(),
                    );
                }
            }
        }
    }

    /// A single bounded tool invocation. The worker permit is held only
    /// for the invocation, not across backoff.
    async fn attempt(&self, job: &FetchJob) -> Result<Vec<PathBuf>, ToolError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| ToolError::Launch("worker pool closed".into()))?;

        let limit = self.config.attempt_timeout(job.representation.kind());
        match tokio::time::timeout(limit, self.tool.fetch(job)).await {
            Ok(result) => result,
            Err(_) => Err(ToolError::Network(format!(
                "attempt timed out after {}s",
                limit.as_secs()
            ))),
        }
    }
}
