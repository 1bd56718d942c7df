//! Request-level orchestration: readiness, resolution, per-candidate fetch
//! and the rotation policy.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{
    normalize_listing_url, CancelToken, CandidateOutcomes, CollectError, CollectionEvent,
    CollectionRequest, CollectionResult, CollectionTarget, RotationPolicy, RotationReport,
    SuccessPolicy,
};
use crate::fetch::{
    FailureReason, FetchOrchestrator, FetchOutcome, RepresentationSet, RequestError,
    StemClaims, StorageLayout, ToolError,
};
use crate::privacy::{Circuit, IdentitySnapshot, SessionError};
use crate::search::{parse, Candidate, SearchResolver};

pub struct CollectionCoordinator {
    circuit: Arc<dyn Circuit>,
    resolver: SearchResolver,
    orchestrator: Arc<FetchOrchestrator>,
    layout: StorageLayout,
    rotation: RotationPolicy,
}

impl CollectionCoordinator {
    pub fn new(
        circuit: Arc<dyn Circuit>,
        resolver: SearchResolver,
        orchestrator: Arc<FetchOrchestrator>,
        layout: StorageLayout,
        rotation: RotationPolicy,
    ) -> Self {
        Self {
            circuit,
            resolver,
            orchestrator,
            layout,
            rotation,
        }
    }

    pub fn layout(&self) -> &StorageLayout {
        &self.layout
    }

    /// Run one collection request to completion.
    ///
    /// Only an unusable session or an invalid request is an error. Search
    /// failures produce an empty result with `resolution_error` set, and
    /// fetch failures are recorded as outcomes.
    pub async fn collect(
        &self,
        request: CollectionRequest,
        cancel: &CancelToken,
        event_tx: mpsc::Sender<CollectionEvent>,
    ) -> Result<CollectionResult, CollectError> {
        let started_at = Utc::now();
        let job_id = uuid::Uuid::new_v4().to_string();
        let direct = direct_candidates(&request.target)?;
        let listing = match &request.target {
            CollectionTarget::Playlist(url) => Some(normalize_listing_url(url)?),
            _ => None,
        };

        self.circuit
            .ensure_ready()
            .await
            .map_err(CollectError::SessionUnavailable)?;

        if self.rotation.rotate_before_collect {
            self.rotate_between("before collection", &event_tx).await;
        }

        let resolved = match (&request.target, direct, listing) {
            (_, Some(candidates), _) => Ok(candidates),
            (_, None, Some(listing_url)) => self.list(&listing_url, request.max_results).await,
            (target, None, None) => self
                .resolver
                .resolve(&target.label(), request.max_results)
                .await
                .map_err(|e| e.to_string()),
        };

        let (candidates, resolution_error) = match resolved {
            Ok(candidates) => (candidates, None),
            Err(e) => {
                warn!("Job {}: resolution failed: {}", job_id, e);
                (Vec::new(), Some(e))
            }
        };
        let _ = event_tx
            .send(CollectionEvent::Resolved {
                candidates: candidates.len(),
            })
            .await;

        let group = request.target.group_name();
        let groups = self
            .fetch_all(&candidates, &request.representations, &group, cancel, &event_tx)
            .await;

        let result = CollectionResult {
            overall_success: overall_success(&groups, request.policy),
            job_id,
            query: request.target.label(),
            groups,
            storage_root: self.layout.root().to_path_buf(),
            resolution_error,
            started_at,
            finished_at: Utc::now(),
        };
        info!(
            "Job {} finished: {} completed, {} failed",
            result.job_id,
            result.completed_count(),
            result.failed_count()
        );
        self.write_job_log(&result).await;
        Ok(result)
    }

    /// Last known identity; never probes.
    pub async fn status(&self) -> IdentitySnapshot {
        self.circuit.current_identity().await
    }

    /// Rotate on demand. Joins an in-flight rotation instead of starting one.
    pub async fn rotate_now(&self) -> Result<RotationReport, SessionError> {
        let outcome = self.circuit.rotate().await?;
        Ok(RotationReport {
            old: outcome.previous,
            new: outcome.current,
            rotated_at: outcome.rotated_at,
        })
    }

    async fn fetch_all(
        &self,
        candidates: &[Candidate],
        representations: &RepresentationSet,
        group: &str,
        cancel: &CancelToken,
        event_tx: &mpsc::Sender<CollectionEvent>,
    ) -> Vec<CandidateOutcomes> {
        let total = candidates.len();
        let mut groups = Vec::with_capacity(total);
        let mut blocked_streak = 0;
        let mut since_rotation = 0;
        let mut cancel_noted = false;
        let claims = StemClaims::default();

        for (index, candidate) in candidates.iter().enumerate() {
            if cancel.is_cancelled() {
                if !cancel_noted {
                    cancel_noted = true;
                    info!("Collection cancelled; skipping {} candidate(s)", total - index);
                    let _ = event_tx
                        .send(CollectionEvent::Cancelled {
                            skipped: total - index,
                        })
                        .await;
                }
                groups.push(cancelled(candidate, representations));
                continue;
            }

            if let Some(reason) = self.rotation_due(blocked_streak, since_rotation) {
                self.rotate_between(reason, event_tx).await;
                blocked_streak = 0;
                since_rotation = 0;
            }

            let _ = event_tx
                .send(CollectionEvent::CandidateStarted {
                    index,
                    total,
                    candidate: candidate.clone(),
                })
                .await;

            let outcomes = self
                .orchestrator
                .fetch_claimed(candidate, representations, &self.layout, group, &claims)
                .await;
            let entry = CandidateOutcomes {
                candidate: candidate.clone(),
                outcomes,
            };

            if entry.blocked() {
                blocked_streak += 1;
                debug!("{} blocked; streak {}", candidate.id, blocked_streak);
            } else {
                blocked_streak = 0;
            }
            since_rotation += 1;

            let completed = entry.outcomes.iter().filter(|o| o.is_completed()).count();
            let _ = event_tx
                .send(CollectionEvent::CandidateFinished {
                    index,
                    completed,
                    failed: entry.outcomes.len() - completed,
                })
                .await;
            groups.push(entry);
        }
        groups
    }

    /// At most one reason per gap between two candidates.
    fn rotation_due(&self, blocked_streak: usize, since_rotation: usize) -> Option<&'static str> {
        let threshold = self.rotation.blocked_threshold;
        let every = self.rotation.every_candidates;
        if threshold > 0 && blocked_streak >= threshold {
            Some("consecutive blocked candidates")
        } else if every > 0 && since_rotation >= every {
            Some("periodic rotation")
        } else {
            None
        }
    }

    /// Rotation failures are logged and the request continues.
    async fn rotate_between(&self, reason: &str, event_tx: &mpsc::Sender<CollectionEvent>) {
        info!("Rotating identity: {}", reason);
        let event = match self.circuit.rotate().await {
            Ok(outcome) => CollectionEvent::Rotated {
                reason: reason.to_string(),
                identity: outcome.current,
            },
            Err(e) => {
                warn!("Rotation ({}) failed: {}", reason, e);
                CollectionEvent::RotationFailed {
                    reason: reason.to_string(),
                    error: e.to_string(),
                }
            }
        };
        let _ = event_tx.send(event).await;
    }

    /// List a playlist or channel; a rejection costs one rotation and one retry.
    async fn list(&self, listing_url: &str, max_results: usize) -> Result<Vec<Candidate>, String> {
        if max_results == 0 {
            return Ok(Vec::new());
        }

        let tool = self.orchestrator.tool();
        let proxy = self.circuit.proxy_url();
        let entries = match tool.list_entries(listing_url, max_results, proxy).await {
            Ok(entries) => entries,
            Err(ToolError::Rejected(reason)) => {
                warn!("Listing rejected: {}; rotating once", reason);
                if let Err(e) = self.circuit.rotate().await {
                    warn!("Rotation after listing rejection failed: {}", e);
                }
                tool.list_entries(listing_url, max_results, proxy)
                    .await
                    .map_err(|e| e.to_string())?
            }
            Err(e @ ToolError::Network(_)) => {
                warn!("Listing failed: {}; retrying once", e);
                tool.list_entries(listing_url, max_results, proxy)
                    .await
                    .map_err(|e| e.to_string())?
            }
            Err(e) => return Err(e.to_string()),
        };

        let found = entries
            .into_iter()
            .filter_map(|entry| parse::video_id(&entry.url).map(|id| (id, entry.title)))
            .collect();
        Ok(parse::rank(found, max_results))
    }

    async fn write_job_log(&self, result: &CollectionResult) {
        let dir = self.layout.logs_dir();
        let path = dir.join(format!("job_{}.json", result.job_id));
        let json = match serde_json::to_vec_pretty(result) {
            Ok(json) => json,
            Err(e) => {
                warn!("Failed to serialize job log: {}", e);
                return;
            }
        };
        if let Err(e) = tokio::fs::create_dir_all(&dir).await {
            warn!("Failed to create {}: {}", dir.display(), e);
            return;
        }
        match tokio::fs::write(&path, json).await {
            Ok(()) => debug!("Wrote job log {}", path.display()),
            Err(e) => warn!("Failed to write job log {}: {}", path.display(), e),
        }
    }
}

/// Candidates for a URL list target, validated before any network use.
fn direct_candidates(target: &CollectionTarget) -> Result<Option<Vec<Candidate>>, RequestError> {
    let CollectionTarget::Urls(urls) = target else {
        return Ok(None);
    };

    let mut found = Vec::with_capacity(urls.len());
    for url in urls {
        match parse::video_id(url) {
            Some(id) => found.push((id, None)),
            None => warn!("Skipping unrecognized video URL: {}", url),
        }
    }
    if found.is_empty() {
        return Err(RequestError::InvalidTarget(
            "no recognizable video URLs".into(),
        ));
    }
    Ok(Some(parse::rank(found, usize::MAX)))
}

fn cancelled(candidate: &Candidate, representations: &RepresentationSet) -> CandidateOutcomes {
    CandidateOutcomes {
        candidate: candidate.clone(),
        outcomes: representations
            .iter()
            .map(|rep| {
                FetchOutcome::failed(
                    &candidate.id,
                    rep.clone(),
                    0,
                    FailureReason::Cancelled,
                    "request cancelled before launch",
                )
            })
            .collect(),
    }
}

fn overall_success(groups: &[CandidateOutcomes], policy: SuccessPolicy) -> bool {
    let mut outcomes = groups.iter().flat_map(|g| g.outcomes.iter()).peekable();
    match policy {
        SuccessPolicy::AnyCompleted => outcomes.any(|o| o.is_completed()),
        SuccessPolicy::AllCompleted => outcomes.peek().is_some() && outcomes.all(|o| o.is_completed()),
    }
}
