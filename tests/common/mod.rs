//! Scripted stand-ins for Tor, the search surface and the fetch tool.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::mpsc;

use ghosttube::collect::{CancelToken, CollectionCoordinator, CollectionEvent, RotationPolicy};
use ghosttube::fetch::{
    FetchConfig, FetchJob, FetchOrchestrator, FetchTool, ListedEntry, StorageLayout, ToolError,
    VideoDetails,
};
use ghosttube::privacy::{Circuit, IdentitySnapshot, RotationOutcome, SessionError};
use ghosttube::search::{parse, Candidate, SearchError, SearchResolver, SearchSurface};

pub const PROXY: &str = "socks5h://127.0.0.1:9050";

/// Shared ordered log of what the fakes were asked to do.
pub type Journal = Arc<Mutex<Vec<String>>>;

pub fn journal() -> Journal {
    Arc::new(Mutex::new(Vec::new()))
}

/// Circuit whose identity advances by one on each rotation.
pub struct FakeCircuit {
    pub ready: Result<(), SessionError>,
    pub rotations: AtomicUsize,
    last_octet: AtomicU8,
    journal: Journal,
}

impl FakeCircuit {
    pub fn new(journal: Journal) -> Self {
        Self {
            ready: Ok(()),
            rotations: AtomicUsize::new(0),
            last_octet: AtomicU8::new(1),
            journal,
        }
    }

    pub fn unavailable(journal: Journal) -> Self {
        Self {
            ready: Err(SessionError::SessionUnavailable("bootstrap stuck at 45%".into())),
            ..Self::new(journal)
        }
    }

    fn ip(octet: u8) -> IpAddr {
        IpAddr::from([198, 51, 100, octet])
    }
}

#[async_trait]
impl Circuit for FakeCircuit {
    fn proxy_url(&self) -> &str {
        PROXY
    }

    async fn ensure_ready(&self) -> Result<(), SessionError> {
        self.ready.clone()
    }

    async fn current_identity(&self) -> IdentitySnapshot {
        IdentitySnapshot {
            identity: Some(Self::ip(self.last_octet.load(Ordering::SeqCst))),
            probed_at: None,
            last_rotation: None,
            live: self.ready.is_ok(),
        }
    }

    async fn probe_identity(&self) -> Result<IpAddr, SessionError> {
        Ok(Self::ip(self.last_octet.load(Ordering::SeqCst)))
    }

    async fn rotate(&self) -> Result<RotationOutcome, SessionError> {
        self.rotations.fetch_add(1, Ordering::SeqCst);
        self.journal.lock().unwrap().push("rotate".to_string());
        let previous = self.last_octet.fetch_add(1, Ordering::SeqCst);
        Ok(RotationOutcome {
            previous: Some(Self::ip(previous)),
            current: Self::ip(previous + 1),
            rotated_at: Utc::now(),
        })
    }
}

/// Surface replaying one scripted response per call; exhausted means empty.
pub struct FakeSurface {
    responses: Mutex<VecDeque<Result<Vec<(String, String)>, SearchError>>>,
    pub calls: AtomicUsize,
}

impl FakeSurface {
    pub fn new(responses: Vec<Result<Vec<(String, String)>, SearchError>>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            calls: AtomicUsize::new(0),
        }
    }

    /// A page listing `(id, title)` pairs.
    pub fn page(results: &[(&str, &str)]) -> Self {
        Self::new(vec![Ok(results
            .iter()
            .map(|(id, title)| (id.to_string(), title.to_string()))
            .collect())])
    }
}

#[async_trait]
impl SearchSurface for FakeSurface {
    fn name(&self) -> &str {
        "fake"
    }

    async fn search(&self, _query: &str, _max: usize) -> Result<Vec<Candidate>, SearchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self.responses.lock().unwrap().pop_front();
        match next {
            Some(Ok(results)) => Ok(results
                .into_iter()
                .enumerate()
                .map(|(i, (id, title))| Candidate {
                    url: parse::canonical_watch_url(&id),
                    id,
                    title: Some(title),
                    rank: i + 1,
                })
                .collect()),
            Some(Err(e)) => Err(e),
            None => Ok(Vec::new()),
        }
    }
}

/// Fetch tool that writes the expected file unless a failure is scripted
/// for the video id.
pub struct FakeTool {
    failures: Mutex<HashMap<String, ToolError>>,
    titles: HashMap<String, String>,
    listing: Vec<ListedEntry>,
    cancel_on: Option<(String, CancelToken)>,
    journal: Journal,
    pub proxies: Mutex<Vec<String>>,
}

impl FakeTool {
    pub fn new(journal: Journal) -> Self {
        Self {
            failures: Mutex::new(HashMap::new()),
            titles: HashMap::new(),
            listing: Vec::new(),
            cancel_on: None,
            journal,
            proxies: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(self, id: &str, error: ToolError) -> Self {
        self.failures.lock().unwrap().insert(id.to_string(), error);
        self
    }

    pub fn titled(mut self, id: &str, title: &str) -> Self {
        self.titles.insert(id.to_string(), title.to_string());
        self
    }

    /// Cancel `token` while fetching `id`, as a user pressing Ctrl-C would.
    pub fn cancelling(mut self, id: &str, token: CancelToken) -> Self {
        self.cancel_on = Some((id.to_string(), token));
        self
    }

    pub fn with_listing(mut self, ids: &[&str]) -> Self {
        self.listing = ids
            .iter()
            .map(|id| ListedEntry {
                url: format!("https://www.youtube.com/watch?v={}", id),
                title: Some(format!("Entry {}", id)),
            })
            .collect();
        self
    }

    pub fn fetched(&self) -> Vec<String> {
        self.journal
            .lock()
            .unwrap()
            .iter()
            .filter_map(|e| e.strip_prefix("fetch:").map(str::to_string))
            .collect()
    }

    fn id_of(url: &str) -> String {
        parse::video_id(url).unwrap_or_else(|| url.to_string())
    }
}

#[async_trait]
impl FetchTool for FakeTool {
    async fn describe(&self, url: &str, proxy_url: &str) -> Result<VideoDetails, ToolError> {
        self.proxies.lock().unwrap().push(proxy_url.to_string());
        let id = Self::id_of(url);
        Ok(VideoDetails {
            title: self.titles.get(&id).cloned(),
            id,
            subtitle_languages: vec!["en".into()],
            ..Default::default()
        })
    }

    async fn fetch(&self, job: &FetchJob) -> Result<Vec<PathBuf>, ToolError> {
        self.proxies.lock().unwrap().push(job.proxy_url.clone());
        let id = Self::id_of(&job.url);
        self.journal
            .lock()
            .unwrap()
            .push(format!("fetch:{}:{}", id, job.representation.kind()));

        if let Some((ref target, ref token)) = self.cancel_on {
            if *target == id {
                token.cancel();
            }
        }

        if let Some(error) = self.failures.lock().unwrap().get(&id) {
            return Err(error.clone());
        }

        let path = job.expected_path();
        std::fs::create_dir_all(&job.output_dir)
            .map_err(|e| ToolError::Launch(e.to_string()))?;
        std::fs::write(&path, b"data").map_err(|e| ToolError::Launch(e.to_string()))?;
        Ok(vec![path])
    }

    async fn list_entries(
        &self,
        _listing_url: &str,
        limit: usize,
        proxy_url: &str,
    ) -> Result<Vec<ListedEntry>, ToolError> {
        self.proxies.lock().unwrap().push(proxy_url.to_string());
        Ok(self.listing.iter().take(limit).cloned().collect())
    }

    async fn search(
        &self,
        _query: &str,
        _limit: usize,
        _proxy_url: &str,
    ) -> Result<Vec<ListedEntry>, ToolError> {
        Ok(Vec::new())
    }

    async fn version(&self) -> Result<String, ToolError> {
        Ok("2025.01.01".into())
    }
}

/// Retries without waiting so failure scenarios finish quickly.
pub fn fast_fetch_config() -> FetchConfig {
    FetchConfig {
        backoff_base_secs: 0,
        max_retries: 1,
        ..Default::default()
    }
}

pub fn coordinator(
    circuit: Arc<FakeCircuit>,
    surface: Arc<FakeSurface>,
    tool: Arc<FakeTool>,
    root: &Path,
    rotation: RotationPolicy,
) -> CollectionCoordinator {
    let resolver = SearchResolver::new(circuit.clone(), surface);
    let orchestrator = Arc::new(FetchOrchestrator::new(
        circuit.clone(),
        tool,
        fast_fetch_config(),
    ));
    CollectionCoordinator::new(
        circuit,
        resolver,
        orchestrator,
        StorageLayout::new(root),
        rotation,
    )
}

/// An event sender nobody listens to.
pub fn no_events() -> mpsc::Sender<CollectionEvent> {
    let (tx, _rx) = mpsc::channel(1);
    tx
}

/// Ten distinct valid video ids.
pub fn ids() -> Vec<String> {
    (0..10).map(|i| format!("vid{:08}", i)).collect()
}
