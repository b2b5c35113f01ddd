use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Top-level settings file (config.toml)
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub tmux: TmuxConfig,
    #[serde(default)]
    pub terminal: TerminalConfig,
    #[serde(default)]
    pub client: ClientConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Shared secret for the HTTP and WebSocket endpoints. Generated at
    /// startup when unset.
    pub token: Option<String>,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8890
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            token: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TmuxConfig {
    #[serde(default = "default_tmux_binary")]
    pub binary: String,
    /// Passed as `-L <name>` so sessions live on a dedicated tmux server
    pub socket_name: Option<String>,
    /// Only tmux sessions whose name starts with this prefix are listed
    #[serde(default = "default_session_prefix")]
    pub session_prefix: String,
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
    /// Used when a session has no recorded working directory. Supports `~`
    /// and `$VAR` expansion.
    pub default_working_directory: Option<String>,
}

fn default_tmux_binary() -> String {
    "tmux".to_string()
}

fn default_session_prefix() -> String {
    "chat-".to_string()
}

fn default_command_timeout_ms() -> u64 {
    5000
}

impl Default for TmuxConfig {
    fn default() -> Self {
        Self {
            binary: default_tmux_binary(),
            socket_name: None,
            session_prefix: default_session_prefix(),
            command_timeout_ms: default_command_timeout_ms(),
            default_working_directory: None,
        }
    }
}

impl TmuxConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    /// Resolve the fallback working directory: configured value (expanded),
    /// then the home directory, then `/`.
    pub fn fallback_working_directory(&self) -> String {
        if let Some(dir) = &self.default_working_directory {
            return shellexpand::full(dir)
                .map(|s| s.into_owned())
                .unwrap_or_else(|_| dir.clone());
        }
        super::paths::home_dir()
            .map(|p| p.to_string_lossy().to_string())
            .unwrap_or_else(|_| "/".to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TerminalConfig {
    #[serde(default = "default_cols")]
    pub cols: u16,
    #[serde(default = "default_rows")]
    pub rows: u16,
    #[serde(default = "default_term")]
    pub term: String,
    #[serde(default = "default_colorterm")]
    pub colorterm: String,
}

fn default_cols() -> u16 {
    120
}

fn default_rows() -> u16 {
    40
}

fn default_term() -> String {
    "xterm-256color".to_string()
}

fn default_colorterm() -> String {
    "truecolor".to_string()
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            cols: default_cols(),
            rows: default_rows(),
            term: default_term(),
            colorterm: default_colorterm(),
        }
    }
}

impl TerminalConfig {
    /// Environment overrides applied on top of the inherited environment
    pub fn env_overrides(&self) -> Vec<(String, String)> {
        vec![
            ("TERM".to_string(), self.term.clone()),
            ("COLORTERM".to_string(), self.colorterm.clone()),
        ]
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClientConfig {
    #[serde(default = "default_reconnect_base_ms")]
    pub reconnect_base_ms: u64,
    #[serde(default = "default_reconnect_max_ms")]
    pub reconnect_max_ms: u64,
}

fn default_reconnect_base_ms() -> u64 {
    500
}

fn default_reconnect_max_ms() -> u64 {
    10_000
}

impl ClientConfig {
    pub fn reconnect_base(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_ms)
    }

    pub fn reconnect_max(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_ms)
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            reconnect_base_ms: default_reconnect_base_ms(),
            reconnect_max_ms: default_reconnect_max_ms(),
        }
    }
}

impl Settings {
    /// Load settings from a TOML file. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "No settings file, using defaults");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("Failed to parse {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        let settings: Settings = toml::from_str(content)?;
        Ok(settings)
    }

    /// Load from an explicit path (with `~` expansion) or the default location.
    pub fn resolve(path: Option<&str>) -> Result<Self> {
        match path {
            Some(p) => {
                let expanded = shellexpand::tilde(p).into_owned();
                Self::load(Path::new(&expanded))
            }
            None => Self::load(&super::paths::settings_path()?),
        }
    }
}
