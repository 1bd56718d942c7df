//! Configuration management for ghosttube using the prefer crate.
//!
//! Configuration is discovered with `prefer` (`ghosttube.toml`, `.yaml`,
//! `.json`, ... in the usual locations), parsed with serde according to the
//! file extension, then overridden by environment variables and finally by
//! command-line flags.

use std::env;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::collect::RotationPolicy;
use crate::fetch::{FetchConfig, StorageLayout};
use crate::privacy::PrivacyConfig;
use crate::search::SearchConfig;

/// Storage directory name under the user's documents or home directory.
pub const DEFAULT_OUTPUT_SUBDIR: &str = "ghosttube";

/// Application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Storage root. Relative paths resolve against the config file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_dir: Option<String>,

    #[serde(default)]
    pub privacy: PrivacyConfig,

    #[serde(default)]
    pub search: SearchConfig,

    #[serde(default)]
    pub fetch: FetchConfig,

    #[serde(default)]
    pub rotation: RotationPolicy,

    /// File the configuration was loaded from.
    #[serde(skip)]
    pub source_path: Option<PathBuf>,
}

impl Config {
    /// Load configuration using prefer for discovery.
    pub async fn load() -> Self {
        match prefer::load("ghosttube").await {
            Ok(pref_config) => {
                if let Some(path) = pref_config.source_path() {
                    match Self::load_from_path(path).await {
                        Ok(config) => config,
                        Err(e) => {
                            warn!("Ignoring {}: {}", path.display(), e);
                            Self::default_with_env()
                        }
                    }
                } else {
                    Self::default_with_env()
                }
            }
            Err(_) => {
                debug!("No ghosttube config file found, using defaults");
                Self::default_with_env()
            }
        }
    }

    /// Defaults with environment variable overrides applied.
    pub fn default_with_env() -> Self {
        Self::default().with_env_overrides()
    }

    /// Load configuration from a specific file.
    /// The format follows the extension: TOML, YAML, anything else JSON.
    pub async fn load_from_path(path: &Path) -> Result<Self, String> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| format!("Failed to read config file: {}", e))?;

        let mut config = Self::parse(&contents, path)?;
        config.source_path = Some(path.to_path_buf());
        Ok(config.with_env_overrides())
    }

    fn parse(contents: &str, path: &Path) -> Result<Self, String> {
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("json");
        match ext {
            "toml" => {
                toml::from_str(contents).map_err(|e| format!("Failed to parse TOML config: {}", e))
            }
            "yaml" | "yml" => serde_yaml::from_str(contents)
                .map_err(|e| format!("Failed to parse YAML config: {}", e)),
            _ => serde_json::from_str(contents)
                .map_err(|e| format!("Failed to parse JSON config: {}", e)),
        }
    }

    /// Apply environment variable overrides.
    pub fn with_env_overrides(mut self) -> Self {
        self.privacy = self.privacy.with_env_overrides();

        if let Some(dir) = env_value("GHOSTTUBE_OUTPUT_DIR") {
            self.output_dir = Some(dir);
        }
        if let Some(binary) = env_value("GHOSTTUBE_YT_DLP") {
            self.fetch.binary = binary;
        }
        if let Some(cookies) = env_value("GHOSTTUBE_COOKIES") {
            self.fetch.cookies_file = Some(PathBuf::from(cookies));
        }
        self
    }

    /// Directory relative paths resolve against: the config file's
    /// directory, or the working directory.
    pub fn base_dir(&self) -> PathBuf {
        self.source_path
            .as_ref()
            .and_then(|p| p.parent().map(Path::to_path_buf))
            .unwrap_or_else(|| PathBuf::from("."))
    }

    /// Resolve a path that may be relative or start with `~`.
    pub fn resolve_path(&self, path_str: &str) -> PathBuf {
        let expanded = shellexpand::tilde(path_str);
        let path = Path::new(expanded.as_ref());

        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir().join(path)
        }
    }

    /// Effective storage root.
    pub fn output_root(&self) -> PathBuf {
        match &self.output_dir {
            Some(dir) => self.resolve_path(dir),
            None => default_output_root(),
        }
    }

    pub fn storage_layout(&self) -> StorageLayout {
        StorageLayout::new(self.output_root())
    }
}

/// `~/Documents/ghosttube`, falling back to the home directory.
pub fn default_output_root() -> PathBuf {
    dirs::document_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(DEFAULT_OUTPUT_SUBDIR)
}

fn env_value(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::SurfaceKind;

    #[test]
    fn parses_toml_sections() {
        let toml = r#"
output_dir = "media"

[privacy]
socks_proxy = "socks5://127.0.0.1:9150"
control_addr = "127.0.0.1:9151"

[search]
surface = "ytsearch"

[fetch]
workers = 2
max_retries = 1

[rotation]
blocked_threshold = 5
"#;
        let config = Config::parse(toml, Path::new("ghosttube.toml")).unwrap();
        assert_eq!(config.output_dir.as_deref(), Some("media"));
        assert_eq!(config.privacy.control_addr, "127.0.0.1:9151");
        assert_eq!(config.search.surface, SurfaceKind::Ytsearch);
        assert_eq!(config.fetch.workers, 2);
        assert_eq!(config.fetch.max_retries, 1);
        assert_eq!(config.fetch.binary, "yt-dlp");
        assert_eq!(config.rotation.blocked_threshold, 5);
        assert_eq!(config.rotation.every_candidates, 0);
    }

    #[test]
    fn parses_yaml_and_json() {
        let yaml = "fetch:\n  transcript_language: de\n";
        let config = Config::parse(yaml, Path::new("ghosttube.yml")).unwrap();
        assert_eq!(config.fetch.transcript_language, "de");

        let json = r#"{"search": {"default_max_results": 10}}"#;
        let config = Config::parse(json, Path::new("ghosttube.json")).unwrap();
        assert_eq!(config.search.default_max_results, 10);
    }

    #[test]
    fn empty_file_is_all_defaults() {
        let config = Config::parse("", Path::new("ghosttube.toml")).unwrap();
        assert_eq!(config.privacy.control_addr, "127.0.0.1:9051");
        assert_eq!(config.rotation.blocked_threshold, 3);
        assert!(!config.rotation.rotate_before_collect);
    }

    #[test]
    fn rejects_malformed_config() {
        let err = Config::parse("fetch = [", Path::new("ghosttube.toml")).unwrap_err();
        assert!(err.contains("TOML"));
    }

    #[tokio::test]
    async fn relative_output_dir_resolves_against_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ghosttube.json");
        std::fs::write(&path, r#"{"output_dir": "media"}"#).unwrap();

        let config = Config::load_from_path(&path).await.unwrap();
        if env::var("GHOSTTUBE_OUTPUT_DIR").is_err() {
            assert_eq!(config.output_root(), dir.path().join("media"));
        }
        assert_eq!(config.source_path.as_deref(), Some(path.as_path()));
    }

    #[test]
    fn absolute_output_dir_is_kept() {
        let config = Config {
            output_dir: Some("/srv/media".into()),
            ..Default::default()
        };
        assert_eq!(config.output_root(), PathBuf::from("/srv/media"));
        assert!(default_output_root().ends_with(DEFAULT_OUTPUT_SUBDIR));
    }
}
