//! In-memory status table, one entry per session.
//!
//! Entries are independent of whether a terminal is attached: a session can
//! be `running` with nobody watching it.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    #[default]
    Idle,
    Running,
    Done,
    Failed,
    Attention,
}

impl SessionStatus {
    /// Terminal states are the only ones that carry an exit code
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionStatus::Done | SessionStatus::Failed)
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(SessionStatus::Idle),
            "running" => Ok(SessionStatus::Running),
            "done" => Ok(SessionStatus::Done),
            "failed" => Ok(SessionStatus::Failed),
            "attention" => Ok(SessionStatus::Attention),
            other => Err(format!(
                "unknown status '{}' (expected idle, running, done, failed or attention)",
                other
            )),
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionStatus::Idle => "idle",
            SessionStatus::Running => "running",
            SessionStatus::Done => "done",
            SessionStatus::Failed => "failed",
            SessionStatus::Attention => "attention",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusEntry {
    pub status: SessionStatus,
    /// Set at creation, never changed by updates
    pub working_directory: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// Unix milliseconds of the last transition
    pub since: u64,
}

/// An administrative status change. Callers never resupply the working
/// directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusUpdate {
    pub session_id: String,
    pub status: SessionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

/// The broadcastable result of applying an update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusEvent {
    pub session_id: String,
    #[serde(flatten)]
    pub entry: StatusEntry,
}

pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

pub struct StatusRegistry {
    entries: RwLock<HashMap<String, StatusEntry>>,
    /// Working directory for updates that arrive before any `init`
    fallback_working_directory: String,
}

impl StatusRegistry {
    pub fn new(fallback_working_directory: impl Into<String>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            fallback_working_directory: fallback_working_directory.into(),
        }
    }

    pub fn fallback_working_directory(&self) -> &str {
        &self.fallback_working_directory
    }

    /// Insert a fresh idle entry, replacing any previous one.
    pub async fn init(&self, session_id: &str, working_directory: &str) -> StatusEntry {
        let entry = StatusEntry {
            status: SessionStatus::Idle,
            working_directory: working_directory.to_string(),
            event_id: None,
            title: None,
            exit_code: None,
            since: now_millis(),
        };
        self.entries
            .write()
            .await
            .insert(session_id.to_string(), entry.clone());
        entry
    }

    /// Apply an update and build its event under the same write lock.
    pub async fn apply_update(&self, update: StatusUpdate) -> StatusEvent {
        let mut entries = self.entries.write().await;

        let working_directory = entries
            .get(&update.session_id)
            .map(|e| e.working_directory.clone())
            .unwrap_or_else(|| self.fallback_working_directory.clone());

        let exit_code = if update.status.is_terminal() {
            update.exit_code
        } else {
            None
        };

        let entry = StatusEntry {
            status: update.status,
            working_directory,
            event_id: update.event_id,
            title: update.title,
            exit_code,
            since: now_millis(),
        };
        entries.insert(update.session_id.clone(), entry.clone());

        StatusEvent {
            session_id: update.session_id,
            entry,
        }
    }

    pub async fn get(&self, session_id: &str) -> Option<StatusEntry> {
        self.entries.read().await.get(session_id).cloned()
    }

    pub async fn remove(&self, session_id: &str) -> Option<StatusEntry> {
        self.entries.write().await.remove(session_id)
    }

    #[cfg(test)]
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}
