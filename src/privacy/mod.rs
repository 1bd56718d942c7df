//! Privacy subsystem: the anonymizing Tor session every request egresses through.
//!
//! All network traffic produced by the pipeline (search requests, identity
//! probes, fetch tool invocations) is routed through the SOCKS proxy owned by
//! a [`CircuitSession`]. The session also owns the Tor control channel used to
//! request new circuits, and tracks the egress identity observed through the
//! proxy.
//!
//! # Configuration
//!
//! Global settings via environment or config file:
//! - `SOCKS_PROXY=socks5h://...` - Tor SOCKS endpoint (default `127.0.0.1:9050`)
//! - `TOR_CONTROL_ADDR=host:port` - control port (default `127.0.0.1:9051`)
//! - `TOR_CONTROL_PASSWORD=...` - HashedControlPassword credential
//! - `TOR_COOKIE_PATH=...` - control auth cookie, when not advertised by Tor
//! - `GHOSTTUBE_NO_TOR_WARNING=1` - silence the Tor legality note
//!
//! There is no direct mode. A proxy URL that is not SOCKS5 is a configuration
//! error, never a fallback to direct connections.

mod config;
mod control;
mod probe;
mod session;

pub use config::PrivacyConfig;
pub use control::{ControlAuth, ControlChannel, TorControl};
pub use probe::{HttpIdentityProbe, IdentityProbe};
pub use session::CircuitSession;

use std::net::IpAddr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Errors raised by the identity layer.
///
/// Payloads are strings so a single rotation result can be handed to every
/// caller that was waiting on it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("anonymizing session unavailable: {0}")]
    SessionUnavailable(String),

    #[error("identity probe failed: {0}")]
    ProbeFailed(String),

    #[error("rotation failed: {0}")]
    RotationFailed(String),

    #[error("tor control error: {0}")]
    Control(String),

    #[error("privacy configuration error: {0}")]
    Config(String),
}

/// Read-only view of the session state, cheap to produce.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IdentitySnapshot {
    /// Last egress address observed through the proxy.
    pub identity: Option<IpAddr>,
    /// When `identity` was observed.
    pub probed_at: Option<DateTime<Utc>>,
    /// When the last successful rotation completed.
    pub last_rotation: Option<DateTime<Utc>>,
    /// True only when the last probe succeeded against the current identity.
    pub live: bool,
}

/// Result of a completed rotation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RotationOutcome {
    pub previous: Option<IpAddr>,
    pub current: IpAddr,
    pub rotated_at: DateTime<Utc>,
}

/// The anonymizing session as seen by the rest of the pipeline.
///
/// Components receive an `Arc<dyn Circuit>` rather than reaching for a global,
/// so tests can substitute a scripted session.
#[async_trait]
pub trait Circuit: Send + Sync {
    /// SOCKS URL every outbound request must be configured with.
    fn proxy_url(&self) -> &str;

    /// Block until Tor is bootstrapped and the proxy answers, or time out.
    async fn ensure_ready(&self) -> Result<(), SessionError>;

    /// Last probed identity. Performs no network I/O.
    async fn current_identity(&self) -> IdentitySnapshot;

    /// Round-trip through the proxy to learn the current egress address.
    async fn probe_identity(&self) -> Result<IpAddr, SessionError>;

    /// Request a new circuit and confirm the observable identity changed.
    async fn rotate(&self) -> Result<RotationOutcome, SessionError>;
}
