// ABOUTME: hosts the unix socket gateway that accepts operator queries and returns agent replies.
// ABOUTME: enforces strict parsing, validation, and the user allowlist before the agent runs.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use opsagent_common::{
    parse_agent_request, validate_agent_request, AgentResponse, ErrorCode,
};
use std::os::unix::io::AsRawFd;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};

use crate::agent::Agent;
use crate::audit::{AuditEntry, AuditLog};
use crate::config::AgentConfig;

const MAX_REQUEST_BYTES: usize = 64 * 1024;
#[cfg(test)]
const READ_IDLE_TIMEOUT: std::time::Duration = std::time::Duration::from_millis(50);
#[cfg(not(test))]
const READ_IDLE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(2);

#[derive(Debug, Clone, Copy)]
struct PeerCredentials {
    pid: i32,
    uid: u32,
    gid: u32,
}

/// Sliding-window request counter per user id. Only requests that passed the
/// allowlist consume budget.
struct RateLimiter {
    max_requests: usize,
    window: Duration,
    recent: tokio::sync::Mutex<HashMap<u64, VecDeque<Instant>>>,
}

impl RateLimiter {
    fn new(max_requests: usize, window: Duration) -> Self {
        RateLimiter {
            max_requests,
            window,
            recent: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    async fn check(&self, user_id: u64) -> bool {
        let now = Instant::now();
        let mut recent = self.recent.lock().await;
        let timestamps = recent.entry(user_id).or_default();
        while let Some(front) = timestamps.front() {
            if now.duration_since(*front) >= self.window {
                timestamps.pop_front();
            } else {
                break;
            }
        }
        if timestamps.len() >= self.max_requests {
            return false;
        }
        timestamps.push_back(now);
        true
    }
}

pub async fn run(
    socket_path: &str,
    config: Arc<AgentConfig>,
    agent: Arc<Agent>,
    audit: Arc<AuditLog>,
) -> anyhow::Result<()> {
    if Path::new(socket_path).exists() {
        tokio::fs::remove_file(socket_path)
            .await
            .with_context(|| format!("remove existing socket at {socket_path}"))?;
    }

    let listener = UnixListener::bind(socket_path).with_context(|| format!("bind {socket_path}"))?;
    tracing::info!(socket = socket_path, "gateway listening");

    let limiter = Arc::new(RateLimiter::new(
        config.rate_limit_max_requests,
        Duration::from_secs(config.rate_limit_window_secs),
    ));

    loop {
        let (stream, _addr) = listener.accept().await?;
        let config = config.clone();
        let agent = agent.clone();
        let audit = audit.clone();
        let limiter = limiter.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_client(stream, config, agent, audit, limiter).await {
                tracing::warn!(error = %err, "client connection failed");
            }
        });
    }
}

async fn handle_client(
    mut stream: UnixStream,
    config: Arc<AgentConfig>,
    agent: Arc<Agent>,
    audit: Arc<AuditLog>,
    limiter: Arc<RateLimiter>,
) -> anyhow::Result<()> {
    let peer = peer_credentials(&stream);
    if let Some(peer) = peer {
        tracing::debug!(pid = peer.pid, uid = peer.uid, gid = peer.gid, "client connected");
    }

    let mut input = Vec::new();
    let mut buf = [0u8; 4096];
    let mut exceeded = false;
    let mut idle = false;
    loop {
        let n = match tokio::time::timeout(READ_IDLE_TIMEOUT, stream.read(&mut buf)).await {
            Ok(res) => res?,
            Err(_) => {
                idle = true;
                break;
            }
        };
        if n == 0 {
            break;
        }
        if exceeded {
            continue;
        }
        if input.len() + n > MAX_REQUEST_BYTES {
            exceeded = true;
            continue;
        }
        input.extend_from_slice(&buf[..n]);
    }

    if exceeded {
        return write_response(
            &mut stream,
            AgentResponse::failure(ErrorCode::RequestTooLarge, "request exceeds max bytes"),
        )
        .await;
    }

    if idle && input.is_empty() {
        return write_response(
            &mut stream,
            AgentResponse::failure(ErrorCode::ParseFailed, "read timed out"),
        )
        .await;
    }

    let input_str = String::from_utf8_lossy(&input);
    let request = match parse_agent_request(&input_str) {
        Ok(request) => request,
        Err(err) => {
            return write_response(
                &mut stream,
                AgentResponse::failure(ErrorCode::ParseFailed, &format!("parse failed: {err}")),
            )
            .await;
        }
    };

    if let Err(err) = validate_agent_request(&request) {
        return write_response(
            &mut stream,
            AgentResponse::failure(
                ErrorCode::ValidationFailed,
                &format!("validation failed: {}", err.message),
            ),
        )
        .await;
    }

    if !config.allowed_user_ids.contains(&request.user_id) {
        // refusal is generic on the wire; the audit record carries the reason
        audit
            .append(AuditEntry::decision(
                request.user_id,
                "-",
                "",
                false,
                None,
                Some("user not in allowlist"),
            ))
            .await?;
        return write_response(
            &mut stream,
            AgentResponse::failure(ErrorCode::Unauthorized, "request refused"),
        )
        .await;
    }

    if !limiter.check(request.user_id).await {
        audit
            .append(AuditEntry::decision(
                request.user_id,
                "-",
                "",
                false,
                None,
                Some("rate limit exceeded"),
            ))
            .await?;
        return write_response(
            &mut stream,
            AgentResponse::failure(ErrorCode::RateLimited, "too many requests, try again later"),
        )
        .await;
    }

    let response = match agent
        .handle_query(request.user_id, &request.query, request.session_id.as_deref())
        .await
    {
        Ok(outcome) => AgentResponse {
            success: outcome.success,
            reply: outcome.reply,
            session_id: Some(outcome.session_id),
            error: None,
        },
        Err(err) => {
            tracing::error!(user_id = request.user_id, error = %err, "query handling failed");
            AgentResponse::failure(ErrorCode::Internal, "request failed")
        }
    };

    write_response(&mut stream, response).await
}

async fn write_response(stream: &mut UnixStream, response: AgentResponse) -> anyhow::Result<()> {
    let encoded = serde_json::to_vec(&response)?;
    stream.write_all(&encoded).await?;
    let _ = stream.shutdown().await;
    Ok(())
}

fn peer_credentials(stream: &UnixStream) -> Option<PeerCredentials> {
    let fd = stream.as_raw_fd();

    let mut ucred: libc::ucred = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::ucred>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_PEERCRED,
            (&mut ucred as *mut libc::ucred).cast(),
            &mut len,
        )
    };
    if rc != 0 {
        return None;
    }
    if len as usize != std::mem::size_of::<libc::ucred>() {
        return None;
    }

    Some(PeerCredentials {
        pid: ucred.pid,
        uid: ucred.uid,
        gid: ucred.gid,
    })
}
