// ABOUTME: executes one command per fresh ssh connection with pinned host keys and bounded output.
// ABOUTME: transient transport errors retry a fixed number of times; identity and auth errors never do.

use std::future::Future;
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use ssh2::Session;
use thiserror::Error;

use crate::config::{AgentConfig, HostConfig};

/// Closed error taxonomy so retry policy is a total function over the set,
/// not a per-call judgment.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExecError {
    #[error("unknown host alias '{0}'")]
    UnknownHost(String),
    #[error("address resolution failed for {0}")]
    AddressResolution(String),
    #[error("connection refused by {0}")]
    ConnectionRefused(String),
    #[error("host unreachable: {0}")]
    Unreachable(String),
    #[error("connection establishment timed out: {0}")]
    HandshakeTimeout(String),
    #[error("connection dropped: {0}")]
    Disconnected(String),
    #[error("authentication failed: {0}")]
    AuthFailed(String),
    #[error("host key mismatch for {host}: expected {expected}, observed {observed}")]
    HostKeyMismatch {
        host: String,
        expected: String,
        observed: String,
    },
    #[error("command timed out after {0} seconds")]
    CommandTimeout(u64),
}

impl ExecError {
    /// Only non-security transport failures are worth another attempt.
    /// Authentication failures and identity mismatches are terminal; a
    /// changed host key may indicate compromise or a reimage.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ExecError::ConnectionRefused(_)
                | ExecError::Unreachable(_)
                | ExecError::HandshakeTimeout(_)
                | ExecError::Disconnected(_)
        )
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ExecResult {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub truncated: bool,
    pub truncated_info: Option<String>,
    pub duration_ms: u64,
}

#[async_trait::async_trait]
pub trait RemoteExecutor: Send + Sync {
    async fn execute(
        &self,
        host_alias: &str,
        command: &str,
        timeout: Duration,
    ) -> Result<ExecResult, ExecError>;
}

/// Runs `attempt` up to `1 + max_extra` times, sleeping a fixed delay between
/// tries, but only while the failure is transient.
pub async fn execute_with_retry<F, Fut>(
    max_extra: u32,
    delay: Duration,
    mut attempt: F,
) -> Result<ExecResult, ExecError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<ExecResult, ExecError>>,
{
    let mut tries = 0u32;
    loop {
        match attempt().await {
            Ok(result) => return Ok(result),
            Err(err) if err.is_transient() && tries < max_extra => {
                tries += 1;
                tracing::warn!(error = %err, attempt = tries, "transient transport error, retrying");
                tokio::time::sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Bounds output by line count first, then byte count, always cutting at a
/// line boundary, with a note stating shown-vs-total.
pub fn truncate_output(output: &str, max_lines: usize, max_bytes: usize) -> (String, bool, Option<String>) {
    let total_lines = output.split('\n').count();
    if total_lines > max_lines {
        let kept: Vec<&str> = output.split('\n').take(max_lines).collect();
        let info = format!("showing first {max_lines} of {total_lines} lines");
        return (kept.join("\n"), true, Some(info));
    }

    if output.len() > max_bytes {
        let mut cut = max_bytes;
        while cut > 0 && !output.is_char_boundary(cut) {
            cut -= 1;
        }
        let mut kept = &output[..cut];
        if let Some(last_newline) = kept.rfind('\n') {
            if last_newline > 0 {
                kept = &kept[..last_newline];
            }
        }
        let info = format!(
            "showing first {} of {} bytes",
            kept.len(),
            output.len()
        );
        return (kept.to_string(), true, Some(info));
    }

    (output.to_string(), false, None)
}

pub struct SshClient {
    config: Arc<AgentConfig>,
}

impl SshClient {
    pub fn new(config: Arc<AgentConfig>) -> Self {
        SshClient { config }
    }

    async fn attempt(
        &self,
        alias: String,
        host: HostConfig,
        command: String,
        timeout: Duration,
    ) -> Result<ExecResult, ExecError> {
        let connect_timeout = Duration::from_secs(self.config.connect_timeout_secs);
        let max_lines = self.config.max_output_lines;
        let max_bytes = self.config.max_output_bytes;
        let started = Instant::now();
        let timeout_secs = timeout.as_secs();

        let blocking = tokio::task::spawn_blocking(move || {
            run_blocking(&alias, &host, &command, connect_timeout, timeout)
        });

        // Hard stop from the async side; the blocking task owns the session
        // and drops it (closing the connection) when it finishes.
        let raw = match tokio::time::timeout(connect_timeout + timeout, blocking).await {
            Ok(Ok(result)) => result?,
            Ok(Err(join_err)) => return Err(ExecError::Disconnected(join_err.to_string())),
            Err(_) => return Err(ExecError::CommandTimeout(timeout_secs)),
        };

        let (stdout, truncated, truncated_info) = truncate_output(&raw.stdout, max_lines, max_bytes);
        Ok(ExecResult {
            success: raw.exit_code == 0,
            stdout,
            stderr: raw.stderr,
            exit_code: raw.exit_code,
            truncated,
            truncated_info,
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }
}

#[async_trait::async_trait]
impl RemoteExecutor for SshClient {
    async fn execute(
        &self,
        host_alias: &str,
        command: &str,
        timeout: Duration,
    ) -> Result<ExecResult, ExecError> {
        let host = self
            .config
            .hosts
            .get(host_alias)
            .ok_or_else(|| ExecError::UnknownHost(host_alias.to_string()))?
            .clone();

        let max_extra = self.config.retry_attempts;
        let delay = Duration::from_millis(self.config.retry_delay_ms);
        let alias = host_alias.to_string();
        let command = command.to_string();

        execute_with_retry(max_extra, delay, || {
            self.attempt(alias.clone(), host.clone(), command.clone(), timeout)
        })
        .await
    }
}

#[derive(Debug)]
struct RawOutput {
    stdout: String,
    stderr: String,
    exit_code: i32,
}

fn run_blocking(
    alias: &str,
    host: &HostConfig,
    command: &str,
    connect_timeout: Duration,
    command_timeout: Duration,
) -> Result<RawOutput, ExecError> {
    use std::io::Read;

    // Hostnames are as valid as literal IPs here; a name that does not
    // resolve is a configuration error, not a transport hiccup.
    let addrs: Vec<_> = (host.addr.as_str(), host.port)
        .to_socket_addrs()
        .map_err(|err| ExecError::AddressResolution(format!("'{alias}': {err}")))?
        .collect();
    if addrs.is_empty() {
        return Err(ExecError::AddressResolution(format!(
            "'{alias}' resolved to no addresses"
        )));
    }

    let mut tcp = None;
    let mut last_err = None;
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, connect_timeout) {
            Ok(stream) => {
                tcp = Some(stream);
                break;
            }
            Err(err) => last_err = Some(err),
        }
    }
    let Some(tcp) = tcp else {
        return Err(classify_connect_error(last_err.expect("at least one connect attempt")));
    };
    tcp.set_read_timeout(Some(command_timeout)).ok();
    tcp.set_write_timeout(Some(command_timeout)).ok();

    let mut session =
        Session::new().map_err(|err| ExecError::Disconnected(err.to_string()))?;
    session.set_tcp_stream(tcp);
    session.set_timeout(command_timeout.as_millis() as u32);
    session
        .handshake()
        .map_err(|err| ExecError::HandshakeTimeout(err.to_string()))?;

    // Identity check before any credentials are offered.
    let observed = session
        .host_key_hash(ssh2::HashType::Sha256)
        .map(hex_lower)
        .unwrap_or_default();
    if !observed.eq_ignore_ascii_case(host.host_key_sha256.trim()) {
        return Err(ExecError::HostKeyMismatch {
            host: alias.to_string(),
            expected: host.host_key_sha256.trim().to_string(),
            observed,
        });
    }

    session
        .userauth_pubkey_file(&host.username, None, std::path::Path::new(&host.key_path), None)
        .map_err(|err| ExecError::AuthFailed(err.to_string()))?;
    if !session.authenticated() {
        return Err(ExecError::AuthFailed(format!(
            "key rejected for {}@{alias}",
            host.username
        )));
    }

    let mut channel = session
        .channel_session()
        .map_err(|err| ExecError::Disconnected(err.to_string()))?;
    channel
        .exec(command)
        .map_err(|err| ExecError::Disconnected(err.to_string()))?;

    let mut stdout = String::new();
    let mut stderr = String::new();
    channel
        .read_to_string(&mut stdout)
        .map_err(|err| classify_session_error(err, command_timeout))?;
    channel
        .stderr()
        .read_to_string(&mut stderr)
        .map_err(|err| classify_session_error(err, command_timeout))?;

    channel
        .wait_close()
        .map_err(|err| ExecError::Disconnected(err.to_string()))?;
    let exit_code = channel
        .exit_status()
        .map_err(|err| ExecError::Disconnected(err.to_string()))?;

    // Session and tcp stream drop here on every path, closing the connection.
    Ok(RawOutput {
        stdout,
        stderr,
        exit_code,
    })
}

fn classify_connect_error(err: std::io::Error) -> ExecError {
    use std::io::ErrorKind;
    match err.kind() {
        ErrorKind::ConnectionRefused => ExecError::ConnectionRefused(err.to_string()),
        ErrorKind::TimedOut | ErrorKind::WouldBlock => {
            ExecError::HandshakeTimeout(err.to_string())
        }
        _ => ExecError::Unreachable(err.to_string()),
    }
}

fn classify_session_error(err: std::io::Error, command_timeout: Duration) -> ExecError {
    use std::io::ErrorKind;
    match err.kind() {
        ErrorKind::TimedOut | ErrorKind::WouldBlock => {
            ExecError::CommandTimeout(command_timeout.as_secs())
        }
        _ => ExecError::Disconnected(err.to_string()),
    }
}

fn hex_lower(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}
