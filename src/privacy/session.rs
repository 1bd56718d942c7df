//! The shared anonymizing session.

use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use super::{
    Circuit, ControlChannel, HttpIdentityProbe, IdentityProbe, IdentitySnapshot, PrivacyConfig,
    RotationOutcome, SessionError, TorControl,
};

const BOOTSTRAP_POLL_INTERVAL: Duration = Duration::from_millis(500);
const DEFAULT_PROBE_ATTEMPTS: u32 = 3;

type StoredRotation = Option<(u64, Result<RotationOutcome, SessionError>)>;

/// Owns the proxy endpoint, the control channel and the observed identity.
///
/// Created once per process and shared as `Arc<CircuitSession>`. Identity
/// state is only written by probes and by the rotation path; rotations are
/// serialized and a caller that queued behind an in-flight rotation receives
/// that rotation's result instead of sending a second NEWNYM.
pub struct CircuitSession {
    proxy_url: String,
    control: Arc<dyn ControlChannel>,
    probe: Arc<dyn IdentityProbe>,
    bootstrap_timeout: Duration,
    poll_interval: Duration,
    settle_delay: Duration,
    probe_attempts: u32,
    state: RwLock<IdentitySnapshot>,
    generation: AtomicU64,
    rotation: Mutex<StoredRotation>,
    readiness: Mutex<()>,
}

impl CircuitSession {
    pub fn new(
        proxy_url: impl Into<String>,
        control: Arc<dyn ControlChannel>,
        probe: Arc<dyn IdentityProbe>,
    ) -> Self {
        Self {
            proxy_url: proxy_url.into(),
            control,
            probe,
            bootstrap_timeout: Duration::from_secs(120),
            poll_interval: BOOTSTRAP_POLL_INTERVAL,
            settle_delay: Duration::from_secs(8),
            probe_attempts: DEFAULT_PROBE_ATTEMPTS,
            state: RwLock::new(IdentitySnapshot::default()),
            generation: AtomicU64::new(0),
            rotation: Mutex::new(None),
            readiness: Mutex::new(()),
        }
    }

    /// Session against a local Tor daemon as described by the config.
    pub fn from_config(config: &PrivacyConfig) -> Result<Self, SessionError> {
        let proxy_url = config.effective_proxy_url()?;
        let control = Arc::new(TorControl::from_config(config));
        let probe = Arc::new(HttpIdentityProbe::from_config(config)?);

        Ok(Self::new(proxy_url, control, probe)
            .with_bootstrap_timeout(config.bootstrap_timeout())
            .with_settle_delay(config.settle_delay())
            .with_probe_attempts(config.rotation_probe_attempts))
    }

    pub fn with_bootstrap_timeout(mut self, timeout: Duration) -> Self {
        self.bootstrap_timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Wait after NEWNYM (and between post-rotation probes).
    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    pub fn with_probe_attempts(mut self, attempts: u32) -> Self {
        self.probe_attempts = attempts.max(1);
        self
    }

    async fn record_identity(&self, ip: IpAddr, rotated: bool) {
        let now = Utc::now();
        let mut state = self.state.write().await;
        state.identity = Some(ip);
        state.probed_at = Some(now);
        state.live = true;
        if rotated {
            state.last_rotation = Some(now);
        }
    }

    async fn mark_unverified(&self) {
        self.state.write().await.live = false;
    }

    async fn perform_rotation(&self) -> Result<RotationOutcome, SessionError> {
        let known = self.state.read().await.identity;
        let baseline = match known {
            Some(ip) => Some(ip),
            None => match self.probe.probe().await {
                Ok(ip) => {
                    self.record_identity(ip, false).await;
                    Some(ip)
                }
                Err(e) => {
                    debug!("No baseline identity before rotation: {}", e);
                    None
                }
            },
        };

        self.control.new_identity().await.map_err(|e| {
            SessionError::RotationFailed(format!("control channel rejected NEWNYM: {}", e))
        })?;

        // The old identity no longer describes the circuit in use.
        self.mark_unverified().await;
        tokio::time::sleep(self.settle_delay).await;

        let mut last_error = String::new();
        for attempt in 1..=self.probe_attempts {
            match self.probe.probe().await {
                Ok(ip) if Some(ip) != baseline => {
                    self.record_identity(ip, true).await;
                    let outcome = RotationOutcome {
                        previous: baseline,
                        current: ip,
                        rotated_at: Utc::now(),
                    };
                    info!(
                        "Identity rotated: {} -> {}",
                        baseline
                            .map(|ip| ip.to_string())
                            .unwrap_or_else(|| "unknown".into()),
                        ip
                    );
                    return Ok(outcome);
                }
                Ok(ip) => {
                    // Same exit: the probe is valid for the current circuit.
                    self.record_identity(ip, false).await;
                    last_error = format!("identity still {} after NEWNYM", ip);
                    debug!("Rotation probe {}/{}: {}", attempt, self.probe_attempts, last_error);
                }
                Err(e) => {
                    last_error = e.to_string();
                    debug!("Rotation probe {}/{} failed: {}", attempt, self.probe_attempts, e);
                }
            }

            if attempt < self.probe_attempts {
                tokio::time::sleep(self.settle_delay).await;
            }
        }

        warn!("Rotation did not change identity: {}", last_error);
        Err(SessionError::RotationFailed(last_error))
    }
}

#[async_trait]
impl Circuit for CircuitSession {
    fn proxy_url(&self) -> &str {
        &self.proxy_url
    }

    async fn ensure_ready(&self) -> Result<(), SessionError> {
        if self.state.read().await.live {
            return Ok(());
        }

        let _guard = self.readiness.lock().await;
        if self.state.read().await.live {
            return Ok(());
        }

        let started = Instant::now();
        loop {
            let last_error = match self.control.bootstrap_progress().await {
                Ok(progress) if progress >= 100 => match self.probe_identity().await {
                    Ok(ip) => {
                        info!("Tor session ready, egress identity {}", ip);
                        return Ok(());
                    }
                    Err(e) => e.to_string(),
                },
                Ok(progress) => {
                    debug!("Tor bootstrap at {}%", progress);
                    format!("bootstrap at {}%", progress)
                }
                Err(e) => e.to_string(),
            };

            if started.elapsed() >= self.bootstrap_timeout {
                return Err(SessionError::SessionUnavailable(format!(
                    "Tor not usable within {}s ({})",
                    self.bootstrap_timeout.as_secs(),
                    last_error
                )));
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn current_identity(&self) -> IdentitySnapshot {
        self.state.read().await.clone()
    }

    async fn probe_identity(&self) -> Result<IpAddr, SessionError> {
        match self.probe.probe().await {
            Ok(ip) => {
                self.record_identity(ip, false).await;
                Ok(ip)
            }
            Err(e) => {
                self.mark_unverified().await;
                Err(e)
            }
        }
    }

    async fn rotate(&self) -> Result<RotationOutcome, SessionError> {
        let observed = self.generation.load(Ordering::SeqCst);
        let mut slot = self.rotation.lock().await;

        // A rotation finished while this caller was queued: share its result.
        if let Some((generation, ref result)) = *slot {
            if generation > observed {
                debug!("Joining result of rotation #{}", generation);
                return result.clone();
            }
        }

        let result = self.perform_rotation().await;
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *slot = Some((generation, result.clone()));
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;

    struct ScriptedControl {
        progress: u8,
        reject: bool,
        newnym: AtomicUsize,
        progress_calls: AtomicUsize,
    }

    impl ScriptedControl {
        fn new(progress: u8) -> Self {
            Self {
                progress,
                reject: false,
                newnym: AtomicUsize::new(0),
                progress_calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ControlChannel for ScriptedControl {
        async fn bootstrap_progress(&self) -> Result<u8, SessionError> {
            self.progress_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.progress)
        }

        async fn new_identity(&self) -> Result<(), SessionError> {
            if self.reject {
                return Err(SessionError::Control("552 Unrecognized signal".into()));
            }
            self.newnym.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Replays queued answers, then repeats the last one.
    struct ScriptedProbe {
        answers: std::sync::Mutex<VecDeque<Result<IpAddr, SessionError>>>,
        last: std::sync::Mutex<Option<Result<IpAddr, SessionError>>>,
    }

    impl ScriptedProbe {
        fn new(answers: Vec<Result<IpAddr, SessionError>>) -> Self {
            Self {
                answers: std::sync::Mutex::new(answers.into()),
                last: std::sync::Mutex::new(None),
            }
        }
    }

    #[async_trait]
    impl IdentityProbe for ScriptedProbe {
        async fn probe(&self) -> Result<IpAddr, SessionError> {
            let next = self.answers.lock().unwrap().pop_front();
            match next {
                Some(answer) => {
                    *self.last.lock().unwrap() = Some(answer.clone());
                    answer
                }
                None => self
                    .last
                    .lock()
                    .unwrap()
                    .clone()
                    .unwrap_or_else(|| Err(SessionError::ProbeFailed("no answer".into()))),
            }
        }
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn session(control: Arc<ScriptedControl>, probe: ScriptedProbe) -> CircuitSession {
        CircuitSession::new("socks5h://127.0.0.1:9050", control, Arc::new(probe))
            .with_settle_delay(Duration::from_millis(1))
            .with_poll_interval(Duration::from_millis(5))
            .with_bootstrap_timeout(Duration::from_millis(60))
    }

    #[tokio::test]
    async fn rotate_succeeds_when_identity_changes() {
        let control = Arc::new(ScriptedControl::new(100));
        let s = session(
            control.clone(),
            ScriptedProbe::new(vec![Ok(ip("1.1.1.1")), Ok(ip("2.2.2.2"))]),
        );

        s.probe_identity().await.unwrap();
        let outcome = s.rotate().await.unwrap();

        assert_eq!(outcome.previous, Some(ip("1.1.1.1")));
        assert_eq!(outcome.current, ip("2.2.2.2"));
        let snapshot = s.current_identity().await;
        assert_eq!(snapshot.identity, Some(ip("2.2.2.2")));
        assert!(snapshot.live);
        assert!(snapshot.last_rotation.is_some());
        assert_eq!(control.newnym.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn rotate_fails_when_identity_unchanged() {
        let control = Arc::new(ScriptedControl::new(100));
        let s = session(control, ScriptedProbe::new(vec![Ok(ip("1.1.1.1"))]));

        s.probe_identity().await.unwrap();
        let err = s.rotate().await.unwrap_err();

        assert!(matches!(err, SessionError::RotationFailed(_)));
        let snapshot = s.current_identity().await;
        assert_eq!(snapshot.identity, Some(ip("1.1.1.1")));
        assert!(snapshot.last_rotation.is_none());
    }

    #[tokio::test]
    async fn rotate_probes_baseline_when_unknown() {
        let control = Arc::new(ScriptedControl::new(100));
        let s = session(
            control,
            ScriptedProbe::new(vec![Ok(ip("1.1.1.1")), Ok(ip("1.1.1.1")), Ok(ip("3.3.3.3"))]),
        );

        let outcome = s.rotate().await.unwrap();
        assert_eq!(outcome.previous, Some(ip("1.1.1.1")));
        assert_eq!(outcome.current, ip("3.3.3.3"));
    }

    #[tokio::test]
    async fn rotate_surfaces_control_rejection() {
        let control = Arc::new(ScriptedControl {
            reject: true,
            ..ScriptedControl::new(100)
        });
        let s = session(control, ScriptedProbe::new(vec![Ok(ip("1.1.1.1"))]));

        let err = s.rotate().await.unwrap_err();
        assert!(matches!(err, SessionError::RotationFailed(ref m) if m.contains("NEWNYM")));
    }

    #[tokio::test]
    async fn concurrent_rotations_share_one_newnym() {
        let control = Arc::new(ScriptedControl::new(100));
        let s = Arc::new(
            session(
                control.clone(),
                ScriptedProbe::new(vec![Ok(ip("1.1.1.1")), Ok(ip("2.2.2.2"))]),
            )
            .with_settle_delay(Duration::from_millis(50)),
        );
        s.probe_identity().await.unwrap();

        let (a, b) = tokio::join!(s.rotate(), s.rotate());

        assert_eq!(a, b);
        assert_eq!(a.unwrap().current, ip("2.2.2.2"));
        assert_eq!(control.newnym.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn later_rotation_is_a_new_rotation() {
        let control = Arc::new(ScriptedControl::new(100));
        let s = session(
            control.clone(),
            ScriptedProbe::new(vec![
                Ok(ip("1.1.1.1")),
                Ok(ip("2.2.2.2")),
                Ok(ip("3.3.3.3")),
            ]),
        );
        s.probe_identity().await.unwrap();

        s.rotate().await.unwrap();
        let second = s.rotate().await.unwrap();

        assert_eq!(second.previous, Some(ip("2.2.2.2")));
        assert_eq!(control.newnym.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn ensure_ready_times_out_while_bootstrapping() {
        let control = Arc::new(ScriptedControl::new(40));
        let s = session(control, ScriptedProbe::new(vec![Ok(ip("1.1.1.1"))]));

        let err = s.ensure_ready().await.unwrap_err();
        assert!(matches!(err, SessionError::SessionUnavailable(ref m) if m.contains("40%")));
        assert!(!s.current_identity().await.live);
    }

    #[tokio::test]
    async fn ensure_ready_is_idempotent() {
        let control = Arc::new(ScriptedControl::new(100));
        let s = session(control.clone(), ScriptedProbe::new(vec![Ok(ip("1.1.1.1"))]));

        s.ensure_ready().await.unwrap();
        s.ensure_ready().await.unwrap();

        assert_eq!(control.progress_calls.load(Ordering::SeqCst), 1);
        assert_eq!(s.current_identity().await.identity, Some(ip("1.1.1.1")));
    }

    #[tokio::test]
    async fn failed_probe_clears_liveness() {
        let control = Arc::new(ScriptedControl::new(100));
        let s = session(
            control,
            ScriptedProbe::new(vec![
                Ok(ip("1.1.1.1")),
                Err(SessionError::ProbeFailed("timeout".into())),
            ]),
        );

        s.probe_identity().await.unwrap();
        assert!(s.probe_identity().await.is_err());

        let snapshot = s.current_identity().await;
        assert!(!snapshot.live);
        assert_eq!(snapshot.identity, Some(ip("1.1.1.1")));
    }
}
