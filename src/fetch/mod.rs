//! Per-candidate retrieval through an external fetch-and-transcode tool.
//!
//! A collection request names one or more [`Representation`]s. The
//! [`FetchOrchestrator`] turns every `(candidate, representation)` pair into
//! exactly one [`FetchOutcome`], whatever happens to the tool underneath.

mod layout;
mod orchestrator;
mod ytdlp;

pub use layout::{sanitize_component, StemClaims, StorageLayout, MAX_COMPONENT_LEN};
pub use orchestrator::{backoff_delay, FetchOrchestrator};
pub use ytdlp::{classify_stderr, YtDlp};

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Audio codecs/containers the fetch tool can extract to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum AudioFormat {
    Mp3,
    Aac,
    Flac,
    Wav,
    Ogg,
    Opus,
    M4a,
}

impl AudioFormat {
    pub const ALL: [AudioFormat; 7] = [
        AudioFormat::Mp3,
        AudioFormat::Aac,
        AudioFormat::Flac,
        AudioFormat::Wav,
        AudioFormat::Ogg,
        AudioFormat::Opus,
        AudioFormat::M4a,
    ];

    /// File extension of the extracted audio.
    pub fn extension(&self) -> &'static str {
        match self {
            AudioFormat::Mp3 => "mp3",
            AudioFormat::Aac => "aac",
            AudioFormat::Flac => "flac",
            AudioFormat::Wav => "wav",
            AudioFormat::Ogg => "ogg",
            AudioFormat::Opus => "opus",
            AudioFormat::M4a => "m4a",
        }
    }

    /// Value for the tool's `--audio-format`.
    pub fn codec_arg(&self) -> &'static str {
        match self {
            AudioFormat::Ogg => "vorbis",
            other => other.extension(),
        }
    }
}

impl fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for AudioFormat {
    type Err = RequestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        let wanted = if wanted == "vorbis" { "ogg".to_string() } else { wanted };
        AudioFormat::ALL
            .into_iter()
            .find(|f| f.extension() == wanted)
            .ok_or_else(|| RequestError::UnknownAudioFormat(s.to_string()))
    }
}

/// Kind of output, independent of format parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepresentationKind {
    Audio,
    Video,
    Transcript,
}

impl RepresentationKind {
    /// Top-level directory under the storage root.
    pub fn dir_name(&self) -> &'static str {
        match self {
            RepresentationKind::Audio => "audio",
            RepresentationKind::Video => "video",
            RepresentationKind::Transcript => "transcripts",
        }
    }
}

impl fmt::Display for RepresentationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RepresentationKind::Audio => "audio",
            RepresentationKind::Video => "video",
            RepresentationKind::Transcript => "transcript",
        })
    }
}

/// One requested output form of a candidate.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Representation {
    Audio { format: AudioFormat },
    /// Always merged into mp4.
    Video,
    /// Captions in the preferred language, converted to SRT.
    Transcript { language: String },
}

impl Representation {
    pub fn kind(&self) -> RepresentationKind {
        match self {
            Representation::Audio { .. } => RepresentationKind::Audio,
            Representation::Video => RepresentationKind::Video,
            Representation::Transcript { .. } => RepresentationKind::Transcript,
        }
    }

    /// Extension of the produced file, after the title stem.
    pub fn extension(&self) -> String {
        match self {
            Representation::Audio { format } => format.extension().to_string(),
            Representation::Video => "mp4".to_string(),
            Representation::Transcript { language } => format!("{}.srt", language),
        }
    }
}

impl fmt::Display for Representation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Representation::Audio { format } => write!(f, "audio/{}", format),
            Representation::Video => f.write_str("video/mp4"),
            Representation::Transcript { language } => write!(f, "transcript/{}", language),
        }
    }
}

/// Problems with what a caller asked for.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RequestError {
    #[error("at least one representation must be requested")]
    Empty,

    #[error("exactly one audio format may be requested")]
    MultipleAudioFormats,

    #[error("{0} requested more than once")]
    Duplicate(RepresentationKind),

    #[error("unknown audio format '{0}' (expected one of mp3, aac, flac, wav, ogg, opus, m4a)")]
    UnknownAudioFormat(String),

    #[error("transcript language must not be empty")]
    EmptyLanguage,

    #[error("invalid collection target: {0}")]
    InvalidTarget(String),
}

/// Validated, ordered set of representations for one request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RepresentationSet(Vec<Representation>);

impl RepresentationSet {
    pub fn new(representations: Vec<Representation>) -> Result<Self, RequestError> {
        if representations.is_empty() {
            return Err(RequestError::Empty);
        }

        let mut seen = HashSet::new();
        for rep in &representations {
            if let Representation::Transcript { language } = rep {
                if language.trim().is_empty() {
                    return Err(RequestError::EmptyLanguage);
                }
            }
            if !seen.insert(rep.kind()) {
                return Err(match rep.kind() {
                    RepresentationKind::Audio => RequestError::MultipleAudioFormats,
                    kind => RequestError::Duplicate(kind),
                });
            }
        }
        Ok(Self(representations))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Representation> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Why a fetch did not complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// Timeout, reset or proxy failure; retryable.
    NetworkError,
    /// The platform refused this identity (rate limit, bot check, 403).
    RemoteRejected,
    /// The content or the requested representation does not exist.
    NotAvailable,
    /// The fetch tool is missing or could not store its output.
    ToolUnavailable,
    /// Never launched because the request was cancelled.
    Cancelled,
}

impl FailureReason {
    /// Failures that suggest the current identity is blocked.
    pub fn is_identity_related(&self) -> bool {
        matches!(self, FailureReason::NetworkError | FailureReason::RemoteRejected)
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FailureReason::NetworkError => "network error",
            FailureReason::RemoteRejected => "rejected by remote",
            FailureReason::NotAvailable => "not available",
            FailureReason::ToolUnavailable => "fetch tool unavailable",
            FailureReason::Cancelled => "cancelled",
        })
    }
}

/// Terminal state of one `(candidate, representation)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FetchStatus {
    Completed { files: Vec<PathBuf> },
    Failed { reason: FailureReason, detail: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FetchOutcome {
    pub candidate_id: String,
    pub representation: Representation,
    /// Tool invocations spent, 0 when never launched.
    pub attempts: u32,
    #[serde(flatten)]
    pub status: FetchStatus,
}

impl FetchOutcome {
    pub fn completed(
        candidate_id: &str,
        representation: Representation,
        attempts: u32,
        files: Vec<PathBuf>,
    ) -> Self {
        Self {
            candidate_id: candidate_id.to_string(),
            representation,
            attempts,
            status: FetchStatus::Completed { files },
        }
    }

    pub fn failed(
        candidate_id: &str,
        representation: Representation,
        attempts: u32,
        reason: FailureReason,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            candidate_id: candidate_id.to_string(),
            representation,
            attempts,
            status: FetchStatus::Failed {
                reason,
                detail: detail.into(),
            },
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self.status, FetchStatus::Completed { .. })
    }

    pub fn files(&self) -> &[PathBuf] {
        match &self.status {
            FetchStatus::Completed { files } => files,
            FetchStatus::Failed { .. } => &[],
        }
    }

    pub fn failure_reason(&self) -> Option<FailureReason> {
        match &self.status {
            FetchStatus::Completed { .. } => None,
            FetchStatus::Failed { reason, .. } => Some(*reason),
        }
    }
}

/// Failures reported by a fetch tool invocation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ToolError {
    #[error("network error: {0}")]
    Network(String),

    #[error("rejected by remote: {0}")]
    Rejected(String),

    #[error("not available: {0}")]
    NotAvailable(String),

    /// The tool could not be run or its output could not be stored.
    #[error("fetch tool unavailable: {0}")]
    Launch(String),
}

impl ToolError {
    pub fn reason(&self) -> FailureReason {
        match self {
            ToolError::Network(_) => FailureReason::NetworkError,
            ToolError::Rejected(_) => FailureReason::RemoteRejected,
            ToolError::NotAvailable(_) => FailureReason::NotAvailable,
            ToolError::Launch(_) => FailureReason::ToolUnavailable,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            ToolError::Network(m)
            | ToolError::Rejected(m)
            | ToolError::NotAvailable(m)
            | ToolError::Launch(m) => m,
        }
    }
}

/// Metadata the tool reports for a video without downloading it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VideoDetails {
    pub id: String,
    pub title: Option<String>,
    pub duration: Option<f64>,
    pub uploader: Option<String>,
    /// Languages with manual or automatic captions.
    pub subtitle_languages: Vec<String>,
}

impl VideoDetails {
    pub fn has_transcript(&self, language: &str) -> bool {
        self.subtitle_languages.iter().any(|l| l == language)
    }
}

/// An entry of a playlist, channel or search listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListedEntry {
    pub url: String,
    pub title: Option<String>,
}

/// One tool invocation producing one representation.
#[derive(Debug, Clone)]
pub struct FetchJob {
    pub url: String,
    pub representation: Representation,
    pub output_dir: PathBuf,
    /// Sanitized file name without extension.
    pub file_stem: String,
    pub proxy_url: String,
}

impl FetchJob {
    pub fn expected_path(&self) -> PathBuf {
        self.output_dir
            .join(format!("{}.{}", self.file_stem, self.representation.extension()))
    }
}

/// External fetch-and-transcode capability.
///
/// Every method takes the proxy URL explicitly; implementations must pass it
/// to whatever performs network I/O.
#[async_trait]
pub trait FetchTool: Send + Sync {
    async fn describe(&self, url: &str, proxy_url: &str) -> Result<VideoDetails, ToolError>;

    /// Produce one representation; returns the files written.
    async fn fetch(&self, job: &FetchJob) -> Result<Vec<PathBuf>, ToolError>;

    /// Entries of a playlist or channel, at most `limit`.
    async fn list_entries(
        &self,
        listing_url: &str,
        limit: usize,
        proxy_url: &str,
    ) -> Result<Vec<ListedEntry>, ToolError>;

    /// The tool's own platform search.
    async fn search(
        &self,
        query: &str,
        limit: usize,
        proxy_url: &str,
    ) -> Result<Vec<ListedEntry>, ToolError>;

    async fn version(&self) -> Result<String, ToolError>;
}

/// Fetch configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchConfig {
    /// Fetch tool executable, looked up in PATH when not absolute.
    #[serde(default = "default_binary")]
    pub binary: String,

    /// Netscape cookies file handed to the tool.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cookies_file: Option<PathBuf>,

    /// Concurrent tool invocations across all requests.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Additional attempts after a network failure.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_backoff_base")]
    pub backoff_base_secs: u64,

    #[serde(default = "default_backoff_cap")]
    pub backoff_cap_secs: u64,

    #[serde(default = "default_audio_timeout")]
    pub audio_timeout_secs: u64,

    #[serde(default = "default_video_timeout")]
    pub video_timeout_secs: u64,

    #[serde(default = "default_transcript_timeout")]
    pub transcript_timeout_secs: u64,

    #[serde(default = "default_describe_timeout")]
    pub describe_timeout_secs: u64,

    /// Socket timeout passed to the tool itself.
    #[serde(default = "default_socket_timeout")]
    pub socket_timeout_secs: u64,

    #[serde(default = "default_language")]
    pub transcript_language: String,
}

fn default_binary() -> String {
    "yt-dlp".to_string()
}

fn default_workers() -> usize {
    3
}

fn default_max_retries() -> u32 {
    2
}

fn default_backoff_base() -> u64 {
    2
}

fn default_backoff_cap() -> u64 {
    60
}

fn default_audio_timeout() -> u64 {
    300
}

fn default_video_timeout() -> u64 {
    600
}

fn default_transcript_timeout() -> u64 {
    60
}

fn default_describe_timeout() -> u64 {
    60
}

fn default_socket_timeout() -> u64 {
    30
}

fn default_language() -> String {
    "en".to_string()
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            binary: default_binary(),
            cookies_file: None,
            workers: default_workers(),
            max_retries: default_max_retries(),
            backoff_base_secs: default_backoff_base(),
            backoff_cap_secs: default_backoff_cap(),
            audio_timeout_secs: default_audio_timeout(),
            video_timeout_secs: default_video_timeout(),
            transcript_timeout_secs: default_transcript_timeout(),
            describe_timeout_secs: default_describe_timeout(),
            socket_timeout_secs: default_socket_timeout(),
            transcript_language: default_language(),
        }
    }
}

impl FetchConfig {
    /// Per-attempt timeout for a representation kind.
    pub fn attempt_timeout(&self, kind: RepresentationKind) -> Duration {
        Duration::from_secs(match kind {
            RepresentationKind::Audio => self.audio_timeout_secs,
            RepresentationKind::Video => self.video_timeout_secs,
            RepresentationKind::Transcript => self.transcript_timeout_secs,
        })
    }

    pub fn describe_timeout(&self) -> Duration {
        Duration::from_secs(self.describe_timeout_secs)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_secs(self.backoff_base_secs)
    }

    pub fn backoff_cap(&self) -> Duration {
        Duration::from_secs(self.backoff_cap_secs)
    }

    pub fn cookies_path(&self) -> Option<&Path> {
        self.cookies_file.as_deref()
    }
}
