// ABOUTME: durable session and incident storage backing the control loop's context.
// ABOUTME: sessions are whole-file json replaced atomically; incidents append one jsonl line each.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryRole {
    User,
    Assistant,
    Tool,
    System,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ContextEntry {
    pub role: EntryRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl ContextEntry {
    pub fn new(role: EntryRole, content: impl Into<String>) -> Self {
        ContextEntry {
            role,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Closed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Session {
    pub id: String,
    pub user_id: u64,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub status: SessionStatus,
    pub entries: Vec<ContextEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Incident {
    pub id: String,
    pub user_id: u64,
    pub timestamp: DateTime<Utc>,
    pub query: String,
    pub resolution: Option<String>,
    pub tools_used: Vec<String>,
    pub success: bool,
    pub duration_ms: u64,
}

#[derive(Debug)]
pub struct SessionStore {
    sessions_dir: PathBuf,
    incidents_path: PathBuf,
    max_entries: usize,
    keep_recent: usize,
    sessions: Mutex<HashMap<String, Session>>,
    incident_lock: Mutex<()>,
}

impl SessionStore {
    /// Opens the store, creating its directory layout and loading any
    /// sessions persisted by a previous run.
    pub async fn open(
        dir: PathBuf,
        max_entries: usize,
        keep_recent: usize,
    ) -> anyhow::Result<Arc<Self>> {
        let sessions_dir = dir.join("sessions");
        tokio::fs::create_dir_all(&sessions_dir)
            .await
            .with_context(|| format!("create session dir at {}", sessions_dir.display()))?;

        let mut sessions = HashMap::new();
        let mut entries = tokio::fs::read_dir(&sessions_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.path().extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let raw = tokio::fs::read_to_string(entry.path()).await?;
            match serde_json::from_str::<Session>(&raw) {
                Ok(session) => {
                    sessions.insert(session.id.clone(), session);
                }
                Err(err) => {
                    tracing::warn!(path = %entry.path().display(), error = %err, "skipping unreadable session file");
                }
            }
        }

        Ok(Arc::new(SessionStore {
            sessions_dir,
            incidents_path: dir.join("incidents.jsonl"),
            max_entries,
            keep_recent,
            sessions: Mutex::new(sessions),
            incident_lock: Mutex::new(()),
        }))
    }

    /// Returns the user's active session, creating one if none exists.
    pub async fn create_or_get_session(&self, user_id: u64) -> anyhow::Result<Session> {
        let mut sessions = self.sessions.lock().await;
        if let Some(session) = sessions
            .values()
            .filter(|s| s.user_id == user_id && s.status == SessionStatus::Active)
            .max_by_key(|s| s.last_activity)
        {
            return Ok(session.clone());
        }

        let now = Utc::now();
        let session = Session {
            id: Uuid::new_v4().to_string(),
            user_id,
            created_at: now,
            last_activity: now,
            status: SessionStatus::Active,
            entries: Vec::new(),
        };
        self.persist(&session).await?;
        sessions.insert(session.id.clone(), session.clone());
        Ok(session)
    }

    pub async fn get_session(&self, session_id: &str) -> Option<Session> {
        self.sessions.lock().await.get(session_id).cloned()
    }

    /// Appends one entry and compacts before the write commits, so a
    /// persisted session never exceeds the configured bound.
    pub async fn append_context(
        &self,
        session_id: &str,
        entry: ContextEntry,
    ) -> anyhow::Result<()> {
        let mut sessions = self.sessions.lock().await;
        let session = sessions
            .get_mut(session_id)
            .with_context(|| format!("unknown session '{session_id}'"))?;
        session.entries.push(entry);
        session.last_activity = Utc::now();
        compact(session, self.max_entries, self.keep_recent);
        let snapshot = session.clone();
        drop(sessions);
        self.persist(&snapshot).await
    }

    /// Explicit compaction pass; returns the number of entries dropped.
    pub async fn compact_if_needed(&self, session_id: &str) -> anyhow::Result<usize> {
        let mut sessions = self.sessions.lock().await;
        let session = sessions
            .get_mut(session_id)
            .with_context(|| format!("unknown session '{session_id}'"))?;
        let dropped = compact(session, self.max_entries, self.keep_recent);
        let snapshot = session.clone();
        drop(sessions);
        if dropped > 0 {
            self.persist(&snapshot).await?;
        }
        Ok(dropped)
    }

    /// Sessions are never deleted, only closed.
    pub async fn close_session(&self, session_id: &str) -> anyhow::Result<()> {
        let mut sessions = self.sessions.lock().await;
        let session = sessions
            .get_mut(session_id)
            .with_context(|| format!("unknown session '{session_id}'"))?;
        session.status = SessionStatus::Closed;
        session.last_activity = Utc::now();
        let snapshot = session.clone();
        drop(sessions);
        self.persist(&snapshot).await
    }

    pub async fn save_incident(
        &self,
        user_id: u64,
        query: &str,
        resolution: Option<&str>,
        tools_used: Vec<String>,
        success: bool,
        duration_ms: u64,
    ) -> anyhow::Result<Incident> {
        let incident = Incident {
            id: Uuid::new_v4().to_string(),
            user_id,
            timestamp: Utc::now(),
            query: query.to_string(),
            resolution: resolution.map(str::to_string),
            tools_used,
            success,
            duration_ms,
        };

        let mut line = serde_json::to_vec(&incident)?;
        line.push(b'\n');

        // One whole line per record; the lock keeps concurrent sessions from
        // interleaving partial writes.
        let _guard = self.incident_lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.incidents_path)
            .await
            .with_context(|| format!("open incident log at {}", self.incidents_path.display()))?;
        use tokio::io::AsyncWriteExt;
        file.write_all(&line).await?;
        file.flush().await?;

        Ok(incident)
    }

    /// Most recent incidents for a user, newest first.
    pub async fn recent_incidents(&self, user_id: u64, limit: usize) -> anyhow::Result<Vec<Incident>> {
        let raw = match tokio::fs::read_to_string(&self.incidents_path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut incidents: Vec<Incident> = raw
            .lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|l| serde_json::from_str::<Incident>(l).ok())
            .filter(|i| i.user_id == user_id)
            .collect();
        incidents.reverse();
        incidents.truncate(limit);
        Ok(incidents)
    }

    // Whole-file replace via temp file + rename, so a crash never leaves a
    // half-written session on disk.
    async fn persist(&self, session: &Session) -> anyhow::Result<()> {
        let path = self.sessions_dir.join(format!("{}.json", session.id));
        let tmp = self.sessions_dir.join(format!("{}.json.tmp", session.id));
        let raw = serde_json::to_vec_pretty(session)?;
        tokio::fs::write(&tmp, &raw)
            .await
            .with_context(|| format!("write session at {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("commit session at {}", path.display()))?;
        Ok(())
    }
}

fn compact(session: &mut Session, max_entries: usize, keep_recent: usize) -> usize {
    if session.entries.len() <= max_entries {
        return 0;
    }
    let dropped = session.entries.len() - keep_recent;
    let kept: Vec<ContextEntry> = session
        .entries
        .split_off(session.entries.len() - keep_recent);
    let summary = ContextEntry::new(
        EntryRole::System,
        format!("[{dropped} earlier entries compacted]"),
    );
    session.entries = std::iter::once(summary).chain(kept).collect();
    dropped
}
