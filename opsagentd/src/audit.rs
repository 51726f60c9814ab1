// ABOUTME: writes append-only audit records for every policy decision and execution attempt.
// ABOUTME: each record is one structured json line, written whole so concurrent appends never interleave.

use std::path::PathBuf;

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    /// A policy decision, written before any execution is attempted.
    Policy,
    /// A completed execution attempt against a remote host.
    Execute,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub user_id: u64,
    pub action: AuditAction,
    pub host: String,
    pub command: String,
    pub allowed: bool,
    pub level: Option<String>,
    pub reason: Option<String>,
    pub exit_code: Option<i32>,
    pub duration_ms: Option<u64>,
}

#[derive(Debug)]
pub struct AuditLog {
    path: PathBuf,
    // serializes appends so timestamps stay monotonic within one process
    write_lock: Mutex<()>,
}

impl AuditLog {
    pub fn new(path: PathBuf) -> Self {
        AuditLog {
            path,
            write_lock: Mutex::new(()),
        }
    }

    pub async fn append(&self, entry: AuditEntry) -> anyhow::Result<()> {
        let mut line = serde_json::to_vec(&entry)?;
        line.push(b'\n');

        let _guard = self.write_lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("open audit log at {}", self.path.display()))?;

        use tokio::io::AsyncWriteExt;
        file.write_all(&line).await?;
        file.flush().await?;

        if entry.allowed {
            tracing::info!(
                user_id = entry.user_id,
                host = %entry.host,
                action = ?entry.action,
                "audit: allowed"
            );
        } else {
            tracing::warn!(
                user_id = entry.user_id,
                host = %entry.host,
                reason = entry.reason.as_deref().unwrap_or(""),
                "audit: denied"
            );
        }
        Ok(())
    }
}

impl AuditEntry {
    pub fn decision(
        user_id: u64,
        host: &str,
        command: &str,
        allowed: bool,
        level: Option<&str>,
        reason: Option<&str>,
    ) -> Self {
        AuditEntry {
            timestamp: Utc::now(),
            user_id,
            action: AuditAction::Policy,
            host: host.to_string(),
            command: command.to_string(),
            allowed,
            level: level.map(str::to_string),
            reason: reason.map(str::to_string),
            exit_code: None,
            duration_ms: None,
        }
    }

    pub fn execution(
        user_id: u64,
        host: &str,
        command: &str,
        level: &str,
        exit_code: Option<i32>,
        duration_ms: u64,
    ) -> Self {
        AuditEntry {
            timestamp: Utc::now(),
            user_id,
            action: AuditAction::Execute,
            host: host.to_string(),
            command: command.to_string(),
            allowed: true,
            level: Some(level.to_string()),
            reason: None,
            exit_code,
            duration_ms: Some(duration_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn read_lines(path: &std::path::Path) -> Vec<serde_json::Value> {
        let raw = tokio::fs::read_to_string(path).await.unwrap();
        raw.lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn append_writes_one_line_per_entry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let log = AuditLog::new(path.clone());

        log.append(AuditEntry::decision(
            42,
            "web-1",
            "df -h",
            true,
            Some("operator"),
            None,
        ))
        .await
        .unwrap();
        log.append(AuditEntry::execution(42, "web-1", "df -h", "operator", Some(0), 120))
            .await
            .unwrap();

        let lines = read_lines(&path).await;
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["action"], "policy");
        assert_eq!(lines[0]["allowed"], true);
        assert!(lines[0]["exit_code"].is_null());
        assert_eq!(lines[1]["action"], "execute");
        assert_eq!(lines[1]["exit_code"], 0);
        assert_eq!(lines[1]["duration_ms"], 120);
    }

    #[tokio::test]
    async fn denied_decision_carries_reason_and_no_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let log = AuditLog::new(path.clone());

        log.append(AuditEntry::decision(
            7,
            "metrics",
            "systemctl restart nginx",
            false,
            Some("readonly"),
            Some("not permitted at this authorization level"),
        ))
        .await
        .unwrap();

        let lines = read_lines(&path).await;
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0]["allowed"], false);
        assert_eq!(
            lines[0]["reason"],
            "not permitted at this authorization level"
        );
        assert!(lines[0]["exit_code"].is_null());
    }

    #[tokio::test]
    async fn timestamps_are_monotonic_across_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let log = AuditLog::new(path.clone());

        for i in 0..5u64 {
            log.append(AuditEntry::decision(i, "web-1", "uptime", true, None, None))
                .await
                .unwrap();
        }

        let lines = read_lines(&path).await;
        let stamps: Vec<String> = lines
            .iter()
            .map(|v| v["timestamp"].as_str().unwrap().to_string())
            .collect();
        let mut sorted = stamps.clone();
        sorted.sort();
        assert_eq!(stamps, sorted);
    }
}
