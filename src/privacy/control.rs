//! Tor control port client.
//!
//! Speaks just enough of the control protocol to authenticate, read the
//! bootstrap phase and request new circuits. Every command opens its own
//! connection so no authenticated socket is held between rotations.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::debug;

use super::{PrivacyConfig, SessionError};

/// Commands the session issues against the Tor daemon.
#[async_trait]
pub trait ControlChannel: Send + Sync {
    /// Bootstrap completion in percent (100 = usable).
    async fn bootstrap_progress(&self) -> Result<u8, SessionError>;

    /// Ask Tor for a new circuit (`SIGNAL NEWNYM`).
    async fn new_identity(&self) -> Result<(), SessionError>;
}

/// Credentials for the control port.
#[derive(Debug, Clone, Default)]
pub struct ControlAuth {
    pub password: Option<String>,
    pub cookie_path: Option<PathBuf>,
}

/// Control port client over TCP.
pub struct TorControl {
    addr: String,
    auth: ControlAuth,
    timeout: Duration,
}

impl TorControl {
    pub fn new(addr: impl Into<String>, auth: ControlAuth, timeout: Duration) -> Self {
        Self {
            addr: addr.into(),
            auth,
            timeout,
        }
    }

    pub fn from_config(config: &PrivacyConfig) -> Self {
        Self::new(
            config.control_addr.clone(),
            ControlAuth {
                password: config.control_password.clone(),
                cookie_path: config.cookie_path.clone(),
            },
            config.control_timeout(),
        )
    }

    /// Run one command on a fresh authenticated connection.
    async fn command(&self, cmd: &str) -> Result<Reply, SessionError> {
        tokio::time::timeout(self.timeout, self.exchange(cmd))
            .await
            .map_err(|_| {
                SessionError::Control(format!("control port {} timed out", self.addr))
            })?
    }

    async fn exchange(&self, cmd: &str) -> Result<Reply, SessionError> {
        let stream = TcpStream::connect(&self.addr).await.map_err(|e| {
            SessionError::Control(format!("cannot reach control port {}: {}", self.addr, e))
        })?;
        let mut conn = Connection::new(stream);

        self.authenticate(&mut conn).await?;
        let reply = conn.request(cmd).await?;

        // Tor closes the connection on QUIT; nothing useful to report either way.
        let _ = conn.send("QUIT").await;
        Ok(reply)
    }

    async fn authenticate(&self, conn: &mut Connection) -> Result<(), SessionError> {
        let info = conn.request("PROTOCOLINFO 1").await?;
        let methods = info.auth_methods();
        debug!("Tor control auth methods: {:?}", methods);

        let cmd = if let Some(ref password) = self.auth.password {
            format!("AUTHENTICATE \"{}\"", quote(password))
        } else if methods.iter().any(|m| m == "NULL") {
            "AUTHENTICATE".to_string()
        } else if methods.iter().any(|m| m == "COOKIE") {
            let path = self
                .auth
                .cookie_path
                .clone()
                .or_else(|| info.cookie_file().map(PathBuf::from))
                .ok_or_else(|| {
                    SessionError::Control("cookie auth offered without a cookie file".into())
                })?;
            let cookie = tokio::fs::read(&path).await.map_err(|e| {
                SessionError::Control(format!(
                    "cannot read auth cookie {}: {}",
                    path.display(),
                    e
                ))
            })?;
            format!("AUTHENTICATE {}", hex::encode(cookie))
        } else {
            return Err(SessionError::Control(format!(
                "no supported auth method (offered: {})",
                methods.join(",")
            )));
        };

        conn.request(&cmd)
            .await
            .map_err(|e| SessionError::Control(format!("authentication rejected: {}", e)))?;
        Ok(())
    }
}

#[async_trait]
impl ControlChannel for TorControl {
    async fn bootstrap_progress(&self) -> Result<u8, SessionError> {
        let reply = self.command("GETINFO status/bootstrap-phase").await?;
        reply
            .lines
            .iter()
            .find_map(|line| parse_progress(line))
            .ok_or_else(|| SessionError::Control("bootstrap phase missing PROGRESS".into()))
    }

    async fn new_identity(&self) -> Result<(), SessionError> {
        self.command("SIGNAL NEWNYM").await?;
        debug!("NEWNYM accepted by {}", self.addr);
        Ok(())
    }
}

struct Connection {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Connection {
    fn new(stream: TcpStream) -> Self {
        let (read, writer) = stream.into_split();
        Self {
            reader: BufReader::new(read),
            writer,
        }
    }

    async fn send(&mut self, cmd: &str) -> Result<(), SessionError> {
        self.writer
            .write_all(format!("{}\r\n", cmd).as_bytes())
            .await
            .map_err(|e| SessionError::Control(format!("control write failed: {}", e)))
    }

    /// Send a command and require a 250 reply.
    async fn request(&mut self, cmd: &str) -> Result<Reply, SessionError> {
        self.send(cmd).await?;
        let reply = self.read_reply().await?;
        if reply.code != 250 {
            let verb = cmd.split_whitespace().next().unwrap_or(cmd);
            return Err(SessionError::Control(format!(
                "{} rejected: {} {}",
                verb,
                reply.code,
                reply.lines.join(" ")
            )));
        }
        Ok(reply)
    }

    async fn read_line(&mut self) -> Result<String, SessionError> {
        let mut line = String::new();
        let n = self
            .reader
            .read_line(&mut line)
            .await
            .map_err(|e| SessionError::Control(format!("control read failed: {}", e)))?;
        if n == 0 {
            return Err(SessionError::Control("control connection closed".into()));
        }
        Ok(line.trim_end_matches(['\r', '\n']).to_string())
    }

    async fn read_reply(&mut self) -> Result<Reply, SessionError> {
        let mut lines = Vec::new();
        loop {
            let line = self.read_line().await?;
            let (code, sep, rest) = split_reply_line(&line)?;
            lines.push(rest.to_string());

            match sep {
                ' ' => return Ok(Reply { code, lines }),
                '+' => loop {
                    let data = self.read_line().await?;
                    if data == "." {
                        break;
                    }
                    lines.push(data);
                },
                _ => {}
            }
        }
    }
}

/// A complete control port reply with status prefixes stripped.
#[derive(Debug, Clone)]
struct Reply {
    code: u16,
    lines: Vec<String>,
}

impl Reply {
    fn auth_methods(&self) -> Vec<String> {
        self.lines
            .iter()
            .find_map(|line| parse_auth_methods(line))
            .unwrap_or_default()
    }

    fn cookie_file(&self) -> Option<String> {
        self.lines.iter().find_map(|line| parse_cookie_file(line))
    }
}

fn split_reply_line(line: &str) -> Result<(u16, char, &str), SessionError> {
    let malformed = || SessionError::Control(format!("malformed control reply: {:?}", line));

    let code = line
        .get(..3)
        .and_then(|c| c.parse::<u16>().ok())
        .ok_or_else(malformed)?;
    let sep = line[3..].chars().next().ok_or_else(malformed)?;
    if !matches!(sep, ' ' | '-' | '+') {
        return Err(malformed());
    }
    Ok((code, sep, &line[4..]))
}

fn parse_auth_methods(line: &str) -> Option<Vec<String>> {
    let rest = line.strip_prefix("AUTH METHODS=")?;
    let methods = rest.split_whitespace().next().unwrap_or("");
    Some(
        methods
            .split(',')
            .filter(|m| !m.is_empty())
            .map(|m| m.to_string())
            .collect(),
    )
}

fn parse_cookie_file(line: &str) -> Option<String> {
    let start = line.find("COOKIEFILE=\"")? + "COOKIEFILE=\"".len();
    let mut out = String::new();
    let mut chars = line[start..].chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => out.push(chars.next()?),
            '"' => return Some(out),
            _ => out.push(c),
        }
    }
    None
}

fn parse_progress(line: &str) -> Option<u8> {
    let start = line.find("PROGRESS=")? + "PROGRESS=".len();
    let digits: String = line[start..]
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

fn quote(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_final_and_continuation_lines() {
        assert_eq!(split_reply_line("250 OK").unwrap(), (250, ' ', "OK"));
        assert_eq!(
            split_reply_line("250-PROTOCOLINFO 1").unwrap(),
            (250, '-', "PROTOCOLINFO 1")
        );
        assert_eq!(
            split_reply_line("515 Authentication failed").unwrap().0,
            515
        );
    }

    #[test]
    fn split_rejects_garbage() {
        assert!(split_reply_line("OK").is_err());
        assert!(split_reply_line("250").is_err());
        assert!(split_reply_line("250?x").is_err());
    }

    #[test]
    fn auth_methods_and_cookie_file() {
        let line = r#"AUTH METHODS=COOKIE,SAFECOOKIE COOKIEFILE="/run/tor/control.authcookie""#;
        assert_eq!(
            parse_auth_methods(line).unwrap(),
            vec!["COOKIE".to_string(), "SAFECOOKIE".to_string()]
        );
        assert_eq!(
            parse_cookie_file(line).unwrap(),
            "/run/tor/control.authcookie"
        );
    }

    #[test]
    fn cookie_file_unescapes() {
        let line = r#"AUTH METHODS=COOKIE COOKIEFILE="C:\\tor\\cookie""#;
        assert_eq!(parse_cookie_file(line).unwrap(), r"C:\tor\cookie");
    }

    #[test]
    fn progress_from_bootstrap_phase() {
        let line = r#"status/bootstrap-phase=NOTICE BOOTSTRAP PROGRESS=100 TAG=done SUMMARY="Done""#;
        assert_eq!(parse_progress(line), Some(100));
        assert_eq!(
            parse_progress("status/bootstrap-phase=NOTICE BOOTSTRAP PROGRESS=45 TAG=loading"),
            Some(45)
        );
        assert_eq!(parse_progress("OK"), None);
    }

    #[test]
    fn password_quoting() {
        assert_eq!(quote(r#"pa"ss\word"#), r#"pa\"ss\\word"#);
    }
}
