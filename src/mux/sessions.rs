use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::broadcast::Broadcaster;
use crate::config::TmuxConfig;
use crate::error::{ExecError, SessionError};
use crate::events::Event;
use crate::status::{SessionStatus, StatusEvent, StatusRegistry, StatusUpdate};

use super::executor::{CommandOutput, CommandRunner};

/// One row of `list()`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub session_id: String,
    pub working_directory: String,
    pub status: SessionStatus,
    pub since: u64,
    /// Unix seconds, as reported by tmux
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<u64>,
}

/// Owns tmux-backed shell sessions. Which sessions exist is always asked
/// of tmux; nothing is cached here.
pub struct SessionManager {
    runner: Arc<dyn CommandRunner>,
    tmux: TmuxConfig,
    status: Arc<StatusRegistry>,
    events: Arc<Broadcaster>,
}

impl SessionManager {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        tmux: TmuxConfig,
        status: Arc<StatusRegistry>,
        events: Arc<Broadcaster>,
    ) -> Self {
        Self {
            runner,
            tmux,
            status,
            events,
        }
    }

    pub fn status(&self) -> &StatusRegistry {
        &self.status
    }

    /// Full tmux argv: binary, optional `-L <socket>`, then `args`.
    fn tmux_argv(&self, args: &[&str]) -> Vec<String> {
        let mut argv = vec![self.tmux.binary.clone()];
        if let Some(sock) = &self.tmux.socket_name {
            argv.push("-L".to_string());
            argv.push(sock.clone());
        }
        argv.extend(args.iter().map(|a| a.to_string()));
        argv
    }

    async fn tmux(&self, args: &[&str]) -> Result<CommandOutput, ExecError> {
        let argv = self.tmux_argv(args);
        self.runner.execute(&argv, self.tmux.command_timeout()).await
    }

    /// `<prefix>` + 8 random hex chars, e.g. `chat-abcd1234`
    pub fn generate_id(&self) -> String {
        let id = uuid::Uuid::new_v4().simple().to_string();
        format!("{}{}", self.tmux.session_prefix, &id[..8])
    }

    fn validate_id(&self, id: &str) -> Result<(), SessionError> {
        let valid_chars = id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        let has_suffix = id.len() > self.tmux.session_prefix.len();
        if !valid_chars || !has_suffix || !id.starts_with(&self.tmux.session_prefix) {
            return Err(SessionError::InvalidSessionId(id.to_string()));
        }
        Ok(())
    }

    pub async fn create(
        &self,
        session_id: Option<String>,
        working_directory: &str,
    ) -> Result<String, SessionError> {
        let id = match session_id {
            Some(id) => {
                self.validate_id(&id)?;
                id
            }
            None => self.generate_id(),
        };

        let out = self
            .tmux(&["new-session", "-d", "-s", &id, "-c", working_directory])
            .await?;
        if !out.success() {
            return Err(SessionError::SessionCreationFailed(out.stderr.trim().to_string()));
        }

        // Pointer reporting on; alternate screen off so the client's
        // scrollback holds the history.
        let target = option_target(&id);
        for args in [
            ["set-option", "-t", target.as_str(), "mouse", "on"],
            ["set-window-option", "-t", target.as_str(), "alternate-screen", "off"],
        ] {
            match self.tmux(&args).await {
                Ok(o) if o.success() => {}
                Ok(o) => tracing::warn!(
                    session = %id,
                    option = args[3],
                    stderr = %o.stderr.trim(),
                    "Failed to set tmux option"
                ),
                Err(e) => tracing::warn!(
                    session = %id,
                    option = args[3],
                    error = %e,
                    "Failed to set tmux option"
                ),
            }
        }

        self.status.init(&id, working_directory).await;

        tracing::info!(session = %id, working_directory = %working_directory, "Created session");

        self.events.publish(&Event::SessionCreated {
            session_id: id.clone(),
            working_directory: working_directory.to_string(),
        });

        Ok(id)
    }

    pub async fn list(&self) -> Result<Vec<SessionSummary>, SessionError> {
        let out = self
            .tmux(&["list-sessions", "-F", "#{session_name}\t#{session_created}"])
            .await?;
        if !out.success() {
            // No tmux server running means no sessions
            tracing::debug!(stderr = %out.stderr.trim(), "tmux list-sessions returned non-zero");
            return Ok(Vec::new());
        }

        let mut sessions = Vec::new();
        for line in out.stdout.lines() {
            let mut parts = line.splitn(2, '\t');
            let name = parts.next().unwrap_or_default().trim();
            if name.is_empty() || !name.starts_with(&self.tmux.session_prefix) {
                continue;
            }
            let created_at = parts.next().and_then(|c| c.trim().parse().ok());

            let summary = match self.status.get(name).await {
                Some(entry) => SessionSummary {
                    session_id: name.to_string(),
                    working_directory: entry.working_directory,
                    status: entry.status,
                    since: entry.since,
                    created_at,
                },
                None => SessionSummary {
                    session_id: name.to_string(),
                    working_directory: self.status.fallback_working_directory().to_string(),
                    status: SessionStatus::Idle,
                    since: created_at.map(|c| c * 1000).unwrap_or_default(),
                    created_at,
                },
            };
            sessions.push(summary);
        }
        Ok(sessions)
    }

    /// One session's summary, joined with its status entry.
    pub async fn get(&self, session_id: &str) -> Result<SessionSummary, SessionError> {
        self.list()
            .await?
            .into_iter()
            .find(|s| s.session_id == session_id)
            .ok_or_else(|| SessionError::SessionNotFound(session_id.to_string()))
    }

    pub async fn exists(&self, session_id: &str) -> Result<bool, SessionError> {
        let out = self
            .tmux(&["has-session", "-t", &exact_target(session_id)])
            .await?;
        Ok(out.success())
    }

    /// Best-effort kill plus unconditional status removal. Idempotent.
    pub async fn destroy(&self, session_id: &str) {
        match self
            .tmux(&["kill-session", "-t", &exact_target(session_id)])
            .await
        {
            Ok(o) if o.success() => {
                tracing::info!(session = %session_id, "Destroyed session");
            }
            Ok(o) => {
                tracing::debug!(session = %session_id, stderr = %o.stderr.trim(), "kill-session returned non-zero");
            }
            Err(e) => {
                tracing::warn!(session = %session_id, error = %e, "Failed to kill session");
            }
        }

        if self.status.remove(session_id).await.is_some() {
            self.events.publish(&Event::SessionDestroyed {
                session_id: session_id.to_string(),
            });
        }
    }

    /// Apply a status update and push it to every event feed. Updates for
    /// sessions tmux does not know are rejected so no stray entries pile up.
    pub async fn update_status(&self, update: StatusUpdate) -> Result<StatusEvent, SessionError> {
        if !self.exists(&update.session_id).await? {
            return Err(SessionError::SessionNotFound(update.session_id));
        }
        let event = self.status.apply_update(update).await;
        tracing::debug!(session = %event.session_id, status = %event.entry.status, "Status updated");
        self.events.publish(&Event::Status(event.clone()));
        Ok(event)
    }

    /// The command a PTY runs to join an existing session.
    pub fn attach_argv(&self, session_id: &str) -> Vec<String> {
        self.tmux_argv(&["attach-session", "-t", &exact_target(session_id)])
    }
}

/// `=name` makes tmux match the session name exactly instead of by prefix.
fn exact_target(session_id: &str) -> String {
    format!("={}", session_id)
}

/// Option commands take a target pane, so the exact session needs a
/// trailing `:` to resolve.
fn option_target(session_id: &str) -> String {
    format!("={}:", session_id)
}
