//! yt-dlp adapter.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, warn};

use super::{
    FetchConfig, FetchJob, FetchTool, ListedEntry, Representation, ToolError, VideoDetails,
};

/// Refusals tied to the exit address or session. Checked first: yt-dlp
/// wraps geo-blocks in the same "Video unavailable" line as deleted videos.
const REJECTED_MARKERS: &[&str] = &[
    "http error 429",
    "too many requests",
    "sign in to confirm",
    "confirm your age",
    "age-restricted",
    "http error 403",
    "forbidden",
    "available in your country",
    "blocked it in your country",
    "geo restricted",
    "geo-restricted",
];

const NOT_AVAILABLE_MARKERS: &[&str] = &[
    "private video",
    "video unavailable",
    "has been removed",
    "account associated with this video has been terminated",
    "no subtitles",
    "does not exist",
    "unsupported url",
    "is not available",
    "not available",
];

/// Classify a failed invocation from its stderr.
///
/// Anything unrecognised counts as a network failure, which the
/// orchestrator retries a bounded number of times.
pub fn classify_stderr(stderr: &str) -> ToolError {
    let lower = stderr.to_lowercase();
    let message = last_error_line(stderr);

    if REJECTED_MARKERS.iter().any(|m| lower.contains(m)) {
        ToolError::Rejected(message)
    } else if NOT_AVAILABLE_MARKERS.iter().any(|m| lower.contains(m)) {
        ToolError::NotAvailable(message)
    } else {
        ToolError::Network(message)
    }
}

fn last_error_line(stderr: &str) -> String {
    let lines: Vec<&str> = stderr.lines().map(str::trim).filter(|l| !l.is_empty()).collect();
    lines
        .iter()
        .rev()
        .find(|l| l.starts_with("ERROR"))
        .or_else(|| lines.last())
        .map(|l| l.to_string())
        .unwrap_or_else(|| "fetch tool exited without output".to_string())
}

#[derive(Debug, Deserialize)]
struct DumpedVideo {
    id: String,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    duration: Option<f64>,
    #[serde(default)]
    uploader: Option<String>,
    #[serde(default)]
    subtitles: Option<HashMap<String, serde_json::Value>>,
    #[serde(default)]
    automatic_captions: Option<HashMap<String, serde_json::Value>>,
}

impl From<DumpedVideo> for VideoDetails {
    fn from(v: DumpedVideo) -> Self {
        let mut languages: Vec<String> = v
            .subtitles
            .unwrap_or_default()
            .into_keys()
            .chain(v.automatic_captions.unwrap_or_default().into_keys())
            .filter(|l| l != "live_chat")
            .collect();
        languages.sort();
        languages.dedup();

        VideoDetails {
            id: v.id,
            title: v.title,
            duration: v.duration,
            uploader: v.uploader,
            subtitle_languages: languages,
        }
    }
}

/// Invokes the yt-dlp binary, always with `--proxy`.
pub struct YtDlp {
    binary: String,
    cookies_file: Option<PathBuf>,
    socket_timeout_secs: u64,
}

impl YtDlp {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            cookies_file: None,
            socket_timeout_secs: 30,
        }
    }

    pub fn from_config(config: &FetchConfig) -> Self {
        Self {
            binary: config.binary.clone(),
            cookies_file: config.cookies_file.clone(),
            socket_timeout_secs: config.socket_timeout_secs,
        }
    }

    /// Resolve the binary in PATH.
    pub fn locate(&self) -> Result<PathBuf, ToolError> {
        which::which(&self.binary)
            .map_err(|_| ToolError::Launch(format!("{} not found in PATH", self.binary)))
    }

    fn common_args(&self, proxy_url: &str) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "--proxy".into(),
            proxy_url.into(),
            "--socket-timeout".into(),
            self.socket_timeout_secs.to_string(),
            "--no-warnings".into(),
            "--no-progress".into(),
            "--ignore-config".into(),
        ];
        if let Some(ref cookies) = self.cookies_file {
            if cookies.exists() {
                args.push("--cookies".into());
                args.push(cookies.to_string_lossy().into_owned());
            } else {
                warn!("Cookies file {} does not exist, ignoring", cookies.display());
            }
        }
        args
    }

    fn representation_args(representation: &Representation) -> Vec<String> {
        match representation {
            Representation::Audio { format } => vec![
                "-x".into(),
                "--audio-format".into(),
                format.codec_arg().into(),
                "--audio-quality".into(),
                "0".into(),
            ],
            Representation::Video => vec![
                "-f".into(),
                "bestvideo+bestaudio/best".into(),
                "--merge-output-format".into(),
                "mp4".into(),
            ],
            Representation::Transcript { language } => vec![
                "--skip-download".into(),
                "--write-sub".into(),
                "--write-auto-sub".into(),
                "--sub-langs".into(),
                language.clone(),
                "--convert-subs".into(),
                "srt".into(),
            ],
        }
    }

    /// Arguments for producing one representation.
    pub fn fetch_args(&self, job: &FetchJob) -> Vec<String> {
        let template = job
            .output_dir
            .join(format!("{}.%(ext)s", job.file_stem))
            .to_string_lossy()
            .into_owned();

        let mut args = self.common_args(&job.proxy_url);
        args.extend([
            "--no-playlist".to_string(),
            "--force-overwrites".to_string(),
        ]);
        args.extend(Self::representation_args(&job.representation));
        args.extend(["-o".to_string(), template, "--".to_string(), job.url.clone()]);
        args
    }

    async fn run(&self, args: &[String]) -> Result<Output, ToolError> {
        debug!("Running {} with {} args", self.binary, args.len());

        let output = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    ToolError::Launch(format!("{} not found", self.binary))
                } else {
                    ToolError::Launch(format!("failed to execute {}: {}", self.binary, e))
                }
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            debug!("{} stderr: {}", self.binary, stderr.trim());
            return Err(classify_stderr(&stderr));
        }
        Ok(output)
    }

    async fn listing(
        &self,
        target: &str,
        limit: usize,
        proxy_url: &str,
    ) -> Result<Vec<ListedEntry>, ToolError> {
        let mut args = self.common_args(proxy_url);
        args.extend([
            "--flat-playlist".to_string(),
            "--playlist-end".to_string(),
            limit.to_string(),
            "--print".to_string(),
            "%(url)s\t%(title)s".to_string(),
            "--".to_string(),
            target.to_string(),
        ]);

        let output = self.run(&args).await?;
        Ok(parse_listing(&String::from_utf8_lossy(&output.stdout), limit))
    }
}

fn parse_listing(stdout: &str, limit: usize) -> Vec<ListedEntry> {
    stdout
        .lines()
        .filter_map(|line| {
            let mut parts = line.splitn(2, '\t');
            let url = parts.next()?.trim();
            if url.is_empty() || url == "NA" {
                return None;
            }
            let title = parts
                .next()
                .map(str::trim)
                .filter(|t| !t.is_empty() && *t != "NA")
                .map(str::to_string);
            Some(ListedEntry {
                url: url.to_string(),
                title,
            })
        })
        .take(limit)
        .collect()
}

/// Files the tool wrote for `stem` in `dir`, ignoring partial downloads.
async fn produced_files(
    dir: &Path,
    stem: &str,
    representation: &Representation,
) -> Result<Vec<PathBuf>, ToolError> {
    let prefix = format!("{}.", stem);
    let mut found = Vec::new();

    let mut entries = tokio::fs::read_dir(dir)
        .await
        .map_err(|e| ToolError::Launch(format!("cannot read {}: {}", dir.display(), e)))?;
    while let Ok(Some(entry)) = entries.next_entry().await {
        let name = entry.file_name().to_string_lossy().into_owned();
        let Some(rest) = name.strip_prefix(&prefix) else {
            continue;
        };
        if rest.ends_with(".part") || rest.ends_with(".ytdl") || rest.contains(".temp") {
            continue;
        }
        let wanted = match representation {
            Representation::Transcript { .. } => rest.ends_with(".srt"),
            // Merged or extracted output has no intermediate format suffix.
            _ => !rest.contains('.'),
        };
        if wanted {
            found.push(entry.path());
        }
    }
    found.sort();
    Ok(found)
}

#[async_trait]
impl FetchTool for YtDlp {
    async fn describe(&self, url: &str, proxy_url: &str) -> Result<VideoDetails, ToolError> {
        let mut args = self.common_args(proxy_url);
        args.extend([
            "--dump-json".to_string(),
            "--skip-download".to_string(),
            "--no-playlist".to_string(),
            "--".to_string(),
            url.to_string(),
        ]);

        let output = self.run(&args).await?;
        let dumped: DumpedVideo = serde_json::from_slice(&output.stdout)
            .map_err(|e| ToolError::Network(format!("unparseable metadata: {}", e)))?;
        Ok(dumped.into())
    }

    async fn fetch(&self, job: &FetchJob) -> Result<Vec<PathBuf>, ToolError> {
        tokio::fs::create_dir_all(&job.output_dir).await.map_err(|e| {
            ToolError::Launch(format!(
                "cannot create {}: {}",
                job.output_dir.display(),
                e
            ))
        })?;

        self.run(&self.fetch_args(job)).await?;

        let files = produced_files(&job.output_dir, &job.file_stem, &job.representation).await?;
        if files.is_empty() {
            return Err(match job.representation {
                Representation::Transcript { ref language } => {
                    ToolError::NotAvailable(format!("no '{}' subtitles", language))
                }
                _ => ToolError::Network("tool reported success but wrote no output".into()),
            });
        }
        Ok(files)
    }

    async fn list_entries(
        &self,
        listing_url: &str,
        limit: usize,
        proxy_url: &str,
    ) -> Result<Vec<ListedEntry>, ToolError> {
        self.listing(listing_url, limit, proxy_url).await
    }

    async fn search(
        &self,
        query: &str,
        limit: usize,
        proxy_url: &str,
    ) -> Result<Vec<ListedEntry>, ToolError> {
        self.listing(&format!("ytsearch{}:{}", limit, query), limit, proxy_url)
            .await
    }

    async fn version(&self) -> Result<String, ToolError> {
        let output = self.run(&["--version".to_string()]).await?;
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::AudioFormat;

    fn job(representation: Representation) -> FetchJob {
        FetchJob {
            url: "https://www.youtube.com/watch?v=AAAAAAAAAAA".into(),
            representation,
            output_dir: PathBuf::from("/out/audio/q"),
            file_stem: "Song".into(),
            proxy_url: "socks5h://127.0.0.1:9050".into(),
        }
    }

    fn has_pair(args: &[String], flag: &str, value: &str) -> bool {
        args.windows(2).any(|w| w[0] == flag && w[1] == value)
    }

    #[test]
    fn every_invocation_carries_proxy() {
        let tool = YtDlp::new("yt-dlp");
        for rep in [
            Representation::Audio {
                format: AudioFormat::Ogg,
            },
            Representation::Video,
            Representation::Transcript {
                language: "en".into(),
            },
        ] {
            let args = tool.fetch_args(&job(rep));
            assert!(has_pair(&args, "--proxy", "socks5h://127.0.0.1:9050"));
            assert_eq!(args.last().unwrap(), "https://www.youtube.com/watch?v=AAAAAAAAAAA");
        }
    }

    #[test]
    fn audio_args() {
        let args = YtDlp::new("yt-dlp").fetch_args(&job(Representation::Audio {
            format: AudioFormat::Ogg,
        }));
        assert!(args.contains(&"-x".to_string()));
        assert!(has_pair(&args, "--audio-format", "vorbis"));
        assert!(has_pair(&args, "-o", "/out/audio/q/Song.%(ext)s"));
    }

    #[test]
    fn refetch_overwrites_existing_output() {
        let args = YtDlp::new("yt-dlp").fetch_args(&job(Representation::Video));
        assert!(args.contains(&"--force-overwrites".to_string()));
        assert!(!args.contains(&"--continue".to_string()));
    }

    #[test]
    fn transcript_args() {
        let args = YtDlp::new("yt-dlp").fetch_args(&job(Representation::Transcript {
            language: "de".into(),
        }));
        assert!(args.contains(&"--skip-download".to_string()));
        assert!(has_pair(&args, "--sub-langs", "de"));
        assert!(has_pair(&args, "--convert-subs", "srt"));
    }

    #[test]
    fn stderr_classification() {
        assert!(matches!(
            classify_stderr("ERROR: [youtube] abc: Video unavailable"),
            ToolError::NotAvailable(_)
        ));
        assert!(matches!(
            classify_stderr("ERROR: [youtube] abc: Private video. Sign in if you've been granted access"),
            ToolError::NotAvailable(_)
        ));
        assert!(matches!(
            classify_stderr("ERROR: unable to download video data: HTTP Error 429: Too Many Requests"),
            ToolError::Rejected(_)
        ));
        assert!(matches!(
            classify_stderr("ERROR: [youtube] abc: Sign in to confirm you're not a bot"),
            ToolError::Rejected(_)
        ));
        assert!(matches!(
            classify_stderr("ERROR: [Errno 104] Connection reset by peer"),
            ToolError::Network(_)
        ));
    }

    #[test]
    fn geo_blocks_are_rejections() {
        for stderr in [
            "ERROR: [youtube] AAAAAAAAAAA: Video unavailable. The uploader has not made this video available in your country",
            "ERROR: [youtube] AAAAAAAAAAA: This video is not available in your country",
            "ERROR: [youtube] AAAAAAAAAAA: Video unavailable. This video contains content from SME, who has blocked it in your country on copyright grounds",
        ] {
            assert!(
                matches!(classify_stderr(stderr), ToolError::Rejected(_)),
                "{}",
                stderr
            );
        }
    }

    #[test]
    fn digits_in_ids_are_not_rate_limits() {
        assert!(matches!(
            classify_stderr("ERROR: [youtube] x429abcdefg: Unable to extract uploader id; connection reset"),
            ToolError::Network(_)
        ));
        assert!(matches!(
            classify_stderr("ERROR: [download] Got error: 4290 bytes read, 10000 more expected"),
            ToolError::Network(_)
        ));
    }

    #[test]
    fn classification_keeps_error_line() {
        let err = classify_stderr("WARNING: x\nERROR: Read timed out\n[download] 10%\n");
        assert_eq!(err, ToolError::Network("ERROR: Read timed out".into()));
    }

    #[test]
    fn dumped_metadata_languages() {
        let json = r#"{"id":"AAAAAAAAAAA","title":"Song","duration":212.0,
            "subtitles":{"en":[],"live_chat":[]},"automatic_captions":{"en":[],"fr":[]}}"#;
        let details: VideoDetails = serde_json::from_str::<DumpedVideo>(json).unwrap().into();
        assert_eq!(details.subtitle_languages, vec!["en", "fr"]);
        assert!(details.has_transcript("fr"));
        assert!(!details.has_transcript("de"));
    }

    #[test]
    fn listing_parse() {
        let out = "https://www.youtube.com/watch?v=AAAAAAAAAAA\tFirst\nNA\tNA\nhttps://www.youtube.com/watch?v=BBBBBBBBBBB\tNA\n";
        let entries = parse_listing(out, 10);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].title.as_deref(), Some("First"));
        assert_eq!(entries[1].title, None);
        assert_eq!(parse_listing(out, 1).len(), 1);
    }

    #[tokio::test]
    async fn produced_files_skips_partials() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["Song.mp3", "Song.webm.part", "Song.f251.webm", "Other.mp3"] {
            std::fs::write(dir.path().join(name), b"x").unwrap();
        }
        let rep = Representation::Audio {
            format: AudioFormat::Mp3,
        };
        let files = produced_files(dir.path(), "Song", &rep).await.unwrap();
        assert_eq!(files, vec![dir.path().join("Song.mp3")]);
    }

    #[tokio::test]
    async fn missing_binary_is_launch_error() {
        let tool = YtDlp::new("definitely-not-a-real-binary-ghosttube");
        assert!(matches!(tool.version().await, Err(ToolError::Launch(_))));
        assert!(tool.locate().is_err());
    }
}
