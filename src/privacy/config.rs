//! Privacy configuration types.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::SessionError;

pub const DEFAULT_SOCKS_PROXY: &str = "socks5h://127.0.0.1:9050";
pub const DEFAULT_CONTROL_ADDR: &str = "127.0.0.1:9051";
pub const DEFAULT_PROBE_URL: &str = "https://api.ipify.org?format=text";

const DEFAULT_BOOTSTRAP_TIMEOUT_SECS: u64 = 120;
const DEFAULT_PROBE_TIMEOUT_SECS: u64 = 20;
const DEFAULT_SETTLE_DELAY_SECS: u64 = 8;
const DEFAULT_PROBE_ATTEMPTS: u32 = 3;
const DEFAULT_CONTROL_TIMEOUT_SECS: u64 = 10;

/// Global privacy configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrivacyConfig {
    /// SOCKS5 proxy URL of the Tor daemon.
    #[serde(default = "default_socks_proxy")]
    pub socks_proxy: String,

    /// Address of the Tor control port.
    #[serde(default = "default_control_addr")]
    pub control_addr: String,

    /// Control port password (HashedControlPassword). Never serialized.
    #[serde(default, skip_serializing)]
    pub control_password: Option<String>,

    /// Control auth cookie path, used when Tor does not advertise one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cookie_path: Option<PathBuf>,

    /// Seconds to wait for Tor to finish bootstrapping.
    #[serde(default = "default_bootstrap_timeout")]
    pub bootstrap_timeout_secs: u64,

    /// Identity-reflecting endpoint; must answer with a bare IP address.
    #[serde(default = "default_probe_url")]
    pub probe_url: String,

    /// Timeout of a single identity probe.
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,

    /// Timeout of a single control port exchange.
    #[serde(default = "default_control_timeout")]
    pub control_timeout_secs: u64,

    /// Seconds to let a new circuit settle after NEWNYM before probing.
    #[serde(default = "default_settle_delay")]
    pub settle_delay_secs: u64,

    /// Post-rotation probes before declaring the rotation failed.
    #[serde(default = "default_probe_attempts")]
    pub rotation_probe_attempts: u32,

    /// Show Tor legality warning (default: true).
    /// Can be disabled via `--no-tor-warning` or `GHOSTTUBE_NO_TOR_WARNING=1`.
    #[serde(default = "default_true", skip_serializing_if = "is_true")]
    pub tor_legal_warning: bool,
}

fn default_socks_proxy() -> String {
    DEFAULT_SOCKS_PROXY.to_string()
}

fn default_control_addr() -> String {
    DEFAULT_CONTROL_ADDR.to_string()
}

fn default_probe_url() -> String {
    DEFAULT_PROBE_URL.to_string()
}

fn default_bootstrap_timeout() -> u64 {
    DEFAULT_BOOTSTRAP_TIMEOUT_SECS
}

fn default_probe_timeout() -> u64 {
    DEFAULT_PROBE_TIMEOUT_SECS
}

fn default_control_timeout() -> u64 {
    DEFAULT_CONTROL_TIMEOUT_SECS
}

fn default_settle_delay() -> u64 {
    DEFAULT_SETTLE_DELAY_SECS
}

fn default_probe_attempts() -> u32 {
    DEFAULT_PROBE_ATTEMPTS
}

fn default_true() -> bool {
    true
}

fn is_true(v: &bool) -> bool {
    *v
}

fn env_flag(name: &str) -> bool {
    env::var(name)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

impl Default for PrivacyConfig {
    fn default() -> Self {
        Self {
            socks_proxy: default_socks_proxy(),
            control_addr: default_control_addr(),
            control_password: None,
            cookie_path: None,
            bootstrap_timeout_secs: DEFAULT_BOOTSTRAP_TIMEOUT_SECS,
            probe_url: default_probe_url(),
            probe_timeout_secs: DEFAULT_PROBE_TIMEOUT_SECS,
            control_timeout_secs: DEFAULT_CONTROL_TIMEOUT_SECS,
            settle_delay_secs: DEFAULT_SETTLE_DELAY_SECS,
            rotation_probe_attempts: DEFAULT_PROBE_ATTEMPTS,
            tor_legal_warning: true,
        }
    }
}

impl PrivacyConfig {
    /// Apply environment variable overrides.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(proxy) = env::var("SOCKS_PROXY") {
            if !proxy.is_empty() {
                self.socks_proxy = proxy;
            }
        }

        if let Ok(addr) = env::var("TOR_CONTROL_ADDR") {
            if !addr.is_empty() {
                self.control_addr = addr;
            }
        }

        if let Ok(password) = env::var("TOR_CONTROL_PASSWORD") {
            if !password.is_empty() {
                self.control_password = Some(password);
            }
        }

        if let Ok(path) = env::var("TOR_COOKIE_PATH") {
            if !path.is_empty() {
                self.cookie_path = Some(PathBuf::from(path));
            }
        }

        if env_flag("GHOSTTUBE_NO_TOR_WARNING") {
            self.tor_legal_warning = false;
        }

        self
    }

    /// Apply CLI flag overrides.
    pub fn with_cli_overrides(mut self, socks_proxy: Option<String>, no_tor_warning: bool) -> Self {
        if let Some(proxy) = socks_proxy {
            self.socks_proxy = proxy;
        }
        if no_tor_warning {
            self.tor_legal_warning = false;
        }
        self
    }

    /// The proxy URL every outbound request uses.
    ///
    /// `socks5://` is upgraded to `socks5h://` so hostnames are resolved by
    /// Tor rather than the local resolver. Anything else is rejected.
    pub fn effective_proxy_url(&self) -> Result<String, SessionError> {
        let url = self.socks_proxy.trim();
        if let Some(rest) = url.strip_prefix("socks5://") {
            return Ok(format!("socks5h://{}", rest));
        }
        if url.starts_with("socks5h://") {
            return Ok(url.to_string());
        }
        Err(SessionError::Config(format!(
            "Invalid SOCKS proxy URL: '{}'. Must start with socks5:// or socks5h://",
            url
        )))
    }

    pub fn bootstrap_timeout(&self) -> Duration {
        Duration::from_secs(self.bootstrap_timeout_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn control_timeout(&self) -> Duration {
        Duration::from_secs(self.control_timeout_secs)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_secs(self.settle_delay_secs)
    }

    /// Print the Tor legality note unless disabled.
    pub fn show_tor_legal_warning(&self) {
        if !self.tor_legal_warning {
            return;
        }

        eprintln!();
        eprintln!("Note: Tor may be illegal or monitored in some jurisdictions.");
        eprintln!("      Know your local laws before proceeding.");
        eprintln!("      Disable this warning with --no-tor-warning or GHOSTTUBE_NO_TOR_WARNING=1");
        eprintln!();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_proxy_is_remote_dns() {
        let config = PrivacyConfig::default();
        assert_eq!(
            config.effective_proxy_url().unwrap(),
            "socks5h://127.0.0.1:9050"
        );
    }

    #[test]
    fn test_socks5_upgraded_to_socks5h() {
        let config = PrivacyConfig {
            socks_proxy: "socks5://10.0.0.2:9150".into(),
            ..Default::default()
        };
        assert_eq!(
            config.effective_proxy_url().unwrap(),
            "socks5h://10.0.0.2:9150"
        );
    }

    #[test]
    fn test_non_socks_proxy_rejected() {
        for url in ["http://127.0.0.1:8080", "", "127.0.0.1:9050"] {
            let config = PrivacyConfig {
                socks_proxy: url.into(),
                ..Default::default()
            };
            assert!(matches!(
                config.effective_proxy_url(),
                Err(SessionError::Config(_))
            ));
        }
    }

    #[test]
    fn test_cli_overrides() {
        let config = PrivacyConfig::default()
            .with_cli_overrides(Some("socks5h://tor:9050".into()), true);
        assert_eq!(config.socks_proxy, "socks5h://tor:9050");
        assert!(!config.tor_legal_warning);
    }

    #[test]
    fn test_password_not_serialized() {
        let config = PrivacyConfig {
            control_password: Some("hunter2".into()),
            ..Default::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        assert!(!json.contains("hunter2"));
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: PrivacyConfig =
            serde_json::from_str(r#"{"control_addr": "10.0.0.5:9051"}"#).unwrap();
        assert_eq!(config.control_addr, "10.0.0.5:9051");
        assert_eq!(config.socks_proxy, DEFAULT_SOCKS_PROXY);
        assert_eq!(config.settle_delay_secs, 8);
        assert!(config.tor_legal_warning);
    }
}
