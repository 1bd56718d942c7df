//! Collection requests: resolve a target to candidates and fetch each one.
//!
//! The [`CollectionCoordinator`] is the only place that decides when the
//! identity should be rotated because fetches keep failing.

mod coordinator;

pub use coordinator::CollectionCoordinator;

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::fetch::{FetchOutcome, RepresentationSet, RequestError};
use crate::privacy::SessionError;
use crate::search::Candidate;

/// Group directory used for caller-provided video URLs.
pub const DIRECT_GROUP: &str = "direct";

/// What a request collects from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum CollectionTarget {
    /// Free-text search.
    Query(String),
    /// Video URLs, fetched in the given order without searching.
    Urls(Vec<String>),
    /// A playlist or channel listing.
    Playlist(String),
}

impl CollectionTarget {
    /// Human-readable label recorded in the result.
    pub fn label(&self) -> String {
        match self {
            CollectionTarget::Query(q) => q.trim().to_string(),
            CollectionTarget::Urls(urls) => urls.join(" "),
            CollectionTarget::Playlist(url) => url.clone(),
        }
    }

    /// Directory name grouping this target's files (sanitized by the layout).
    pub fn group_name(&self) -> String {
        match self {
            CollectionTarget::Query(q) => q.trim().to_string(),
            CollectionTarget::Urls(_) => DIRECT_GROUP.to_string(),
            CollectionTarget::Playlist(url) => listing_group(url),
        }
    }
}

/// When a collection counts as successful.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuccessPolicy {
    /// At least one representation of one candidate completed.
    #[default]
    AnyCompleted,
    /// Every requested pair completed.
    AllCompleted,
}

#[derive(Debug, Clone)]
pub struct CollectionRequest {
    pub target: CollectionTarget,
    pub representations: RepresentationSet,
    /// Upper bound on searched or listed candidates.
    pub max_results: usize,
    pub policy: SuccessPolicy,
}

impl CollectionRequest {
    pub fn new(target: CollectionTarget, representations: RepresentationSet, max_results: usize) -> Self {
        Self {
            target,
            representations,
            max_results,
            policy: SuccessPolicy::default(),
        }
    }

    pub fn query(query: &str, representations: RepresentationSet, max_results: usize) -> Self {
        Self::new(
            CollectionTarget::Query(query.to_string()),
            representations,
            max_results,
        )
    }

    pub fn with_policy(mut self, policy: SuccessPolicy) -> Self {
        self.policy = policy;
        self
    }
}

/// All outcomes for one candidate, in requested representation order.
#[derive(Debug, Clone, Serialize)]
pub struct CandidateOutcomes {
    pub candidate: Candidate,
    pub outcomes: Vec<FetchOutcome>,
}

impl CandidateOutcomes {
    /// True when every outcome failed for a reason tied to the identity.
    pub fn blocked(&self) -> bool {
        !self.outcomes.is_empty()
            && self.outcomes.iter().all(|o| {
                o.failure_reason()
                    .is_some_and(|reason| reason.is_identity_related())
            })
    }
}

/// Aggregate result of one collection request.
#[derive(Debug, Clone, Serialize)]
pub struct CollectionResult {
    pub job_id: String,
    pub query: String,
    pub groups: Vec<CandidateOutcomes>,
    pub overall_success: bool,
    pub storage_root: PathBuf,
    /// Set when the search or listing stage gave up.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolution_error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl CollectionResult {
    pub fn outcomes(&self) -> impl Iterator<Item = &FetchOutcome> {
        self.groups.iter().flat_map(|g| g.outcomes.iter())
    }

    pub fn completed_count(&self) -> usize {
        self.outcomes().filter(|o| o.is_completed()).count()
    }

    pub fn failed_count(&self) -> usize {
        self.outcomes().filter(|o| !o.is_completed()).count()
    }
}

/// Request-level failures. Per-fetch failures never end up here.
#[derive(Debug, thiserror::Error)]
pub enum CollectError {
    #[error(transparent)]
    SessionUnavailable(SessionError),

    #[error("invalid request: {0}")]
    InvalidRequest(#[from] RequestError),
}

/// Cooperative cancellation shared between a caller and a running request.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Progress events emitted while a request runs.
#[derive(Debug, Clone)]
pub enum CollectionEvent {
    /// Candidates are known; fetching starts.
    Resolved { candidates: usize },
    CandidateStarted {
        index: usize,
        total: usize,
        candidate: Candidate,
    },
    CandidateFinished {
        index: usize,
        completed: usize,
        failed: usize,
    },
    Rotated {
        reason: String,
        identity: IpAddr,
    },
    RotationFailed {
        reason: String,
        error: String,
    },
    /// Remaining candidates were skipped.
    Cancelled { skipped: usize },
}

/// When the coordinator rotates on its own.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RotationPolicy {
    /// Consecutive fully blocked candidates before a rotation; 0 disables.
    #[serde(default = "default_blocked_threshold")]
    pub blocked_threshold: usize,

    /// Rotate after this many candidates regardless of outcome; 0 disables.
    #[serde(default)]
    pub every_candidates: usize,

    #[serde(default)]
    pub rotate_before_collect: bool,
}

fn default_blocked_threshold() -> usize {
    3
}

impl Default for RotationPolicy {
    fn default() -> Self {
        Self {
            blocked_threshold: default_blocked_threshold(),
            every_candidates: 0,
            rotate_before_collect: false,
        }
    }
}

/// Identity before and after an explicit rotation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RotationReport {
    pub old: Option<IpAddr>,
    pub new: IpAddr,
    pub rotated_at: DateTime<Utc>,
}

fn youtube_url(raw: &str) -> Result<Url, RequestError> {
    let url = Url::parse(raw.trim())
        .map_err(|e| RequestError::InvalidTarget(format!("{}: {}", raw, e)))?;
    let host = url.host_str().unwrap_or_default().to_ascii_lowercase();
    if host == "youtube.com" || host.ends_with(".youtube.com") {
        Ok(url)
    } else {
        Err(RequestError::InvalidTarget(format!(
            "not a YouTube listing: {}",
            raw
        )))
    }
}

/// Normalize a playlist or channel URL to something the fetch tool lists.
///
/// Bare channel URLs point at the channel home page, which lists shelves
/// rather than uploads; they are redirected to the `/videos` tab.
pub fn normalize_listing_url(raw: &str) -> Result<String, RequestError> {
    let mut url = youtube_url(raw)?;
    if url.query_pairs().any(|(k, _)| k == "list") {
        return Ok(url.to_string());
    }

    let path = url.path().trim_end_matches('/').to_string();
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    let needs_tab = match segments.as_slice() {
        [handle] if handle.starts_with('@') => true,
        ["channel" | "c" | "user", _] => true,
        [handle, "videos" | "shorts" | "streams" | "playlists"] if handle.starts_with('@') => false,
        ["channel" | "c" | "user", _, "videos" | "shorts" | "streams" | "playlists"] => false,
        _ => {
            return Err(RequestError::InvalidTarget(format!(
                "not a playlist or channel URL: {}",
                raw
            )))
        }
    };
    if needs_tab {
        url.set_path(&format!("{}/videos", path));
    }
    Ok(url.to_string())
}

/// Group directory name for a listing URL.
pub fn listing_group(raw: &str) -> String {
    let Ok(url) = Url::parse(raw.trim()) else {
        return "playlist".to_string();
    };
    if let Some((_, list)) = url.query_pairs().find(|(k, _)| k == "list") {
        return format!("playlist_{}", list);
    }

    let mut segments = url.path_segments().into_iter().flatten().filter(|s| !s.is_empty());
    match segments.next() {
        Some(handle) if handle.starts_with('@') => {
            format!("channel_{}", handle.trim_start_matches('@'))
        }
        Some("channel" | "c" | "user") => segments
            .next()
            .map(|name| format!("channel_{}", name))
            .unwrap_or_else(|| "channel".to_string()),
        _ => "playlist".to_string(),
    }
}
