use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use crate::client::{feed, ApiClient, Driver};
use crate::config::Settings;
use crate::status::{SessionStatus, StatusUpdate};
use crate::web::{generate_token, start_web_server, WebState};

#[derive(Parser, Debug)]
#[command(name = "shellmux", version, about = "tmux-backed shell sessions over WebSockets")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Settings file (default: ~/.config/shellmux/config.toml)
    #[arg(long, global = true)]
    pub config: Option<String>,

    /// Server base URL for client commands (default: from [server] settings)
    #[arg(long, global = true)]
    pub server: Option<String>,

    /// Auth token (default: server.token from settings)
    #[arg(long, global = true)]
    pub token: Option<String>,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the HTTP + WebSocket server
    Serve {
        /// Bind address
        #[arg(short = 'H', long)]
        host: Option<String>,

        /// Port number
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// List sessions
    Ls {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Create a session
    New {
        /// Working directory (default: server's default directory)
        #[arg(short = 'd', long)]
        dir: Option<String>,

        /// Session id, must start with the session prefix
        #[arg(short, long)]
        name: Option<String>,

        /// Attach right after creating
        #[arg(short, long)]
        attach: bool,
    },

    /// Destroy a session
    Kill {
        /// Session id
        session: String,
    },

    /// Report a status change for a session
    Status {
        /// Session id
        session: String,

        /// idle, running, done, failed or attention
        status: SessionStatus,

        #[arg(long)]
        event_id: Option<String>,

        #[arg(long)]
        title: Option<String>,

        /// Only kept for done/failed
        #[arg(long)]
        exit_code: Option<i32>,
    },

    /// Push a JSON payload to every feed subscribed to a scope
    Notify {
        /// Scope (usually a session id)
        scope: String,

        /// JSON payload
        payload: String,
    },

    /// Attach the local terminal to a session (Ctrl+] detaches)
    Attach {
        /// Session id
        session: String,
    },

    /// Print the event feed
    Events {
        /// Also receive notifications for this scope
        #[arg(long)]
        subject: Option<String>,
    },
}

pub async fn run(cli: Cli) -> Result<()> {
    let settings = Settings::resolve(cli.config.as_deref())?;
    let api = || api_client(&settings, cli.server.as_deref(), cli.token.as_deref());

    match cli.command {
        Commands::Serve { host, port } => {
            serve(settings.clone(), host, port, cli.token.clone()).await?;
        }
        Commands::Ls { json } => {
            let sessions = api()?.list().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&sessions)?);
            } else if sessions.is_empty() {
                println!("No sessions.");
            } else {
                println!("{:<16} {:<10} {:<36} {}", "SESSION", "STATUS", "DIRECTORY", "AGE");
                for s in sessions {
                    println!(
                        "{:<16} {:<10} {:<36} {}",
                        s.session_id,
                        s.status,
                        truncate(&s.working_directory, 34),
                        s.created_at.map(format_age).unwrap_or_else(|| "-".to_string()),
                    );
                }
            }
        }
        Commands::New { dir, name, attach } => {
            let api = api()?;
            let session_id = api.create(dir, name).await?;
            println!("{}", session_id);
            if attach {
                Driver::new(api, &settings.client).run(&session_id).await?;
            }
        }
        Commands::Kill { session } => {
            api()?.destroy(&session).await?;
            println!("Session '{}' killed", session);
        }
        Commands::Status {
            session,
            status,
            event_id,
            title,
            exit_code,
        } => {
            let event = api()?
                .update_status(&StatusUpdate {
                    session_id: session,
                    status,
                    event_id,
                    title,
                    exit_code,
                })
                .await?;
            println!("{}", serde_json::to_string(&event)?);
        }
        Commands::Notify { scope, payload } => {
            let payload: serde_json::Value =
                serde_json::from_str(&payload).context("Payload must be valid JSON")?;
            let delivered = api()?.notify(&scope, &payload).await?;
            println!("Delivered to {} connection(s)", delivered);
        }
        Commands::Attach { session } => {
            Driver::new(api()?, &settings.client).run(&session).await?;
        }
        Commands::Events { subject } => {
            feed::follow(&api()?, subject.as_deref()).await?;
        }
    }

    Ok(())
}

async fn serve(
    mut settings: Settings,
    host: Option<String>,
    port: Option<u16>,
    token: Option<String>,
) -> Result<()> {
    crate::config::ensure_dirs()?;

    if let Some(host) = host {
        settings.server.host = host;
    }
    if let Some(port) = port {
        settings.server.port = port;
    }
    let token = token
        .or_else(|| settings.server.token.clone())
        .unwrap_or_else(generate_token);

    println!();
    println!(
        "  Local:   http://{}:{}?token={}",
        settings.server.host, settings.server.port, token
    );
    println!();

    let state = WebState::from_settings(&settings, token);
    start_web_server(&settings.server.host, settings.server.port, state).await
}

fn api_client(settings: &Settings, server: Option<&str>, token: Option<&str>) -> Result<ApiClient> {
    let server = server.map(str::to_string).unwrap_or_else(|| {
        format!("http://{}:{}", settings.server.host, settings.server.port)
    });
    let Some(token) = token.or(settings.server.token.as_deref()) else {
        bail!("No token: pass --token or set server.token in the settings file");
    };
    ApiClient::new(&server, token)
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() > max {
        let head: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", head)
    } else {
        s.to_string()
    }
}

/// Age from a unix-seconds creation time, e.g. `5m` or `2h 10m`.
fn format_age(created: u64) -> String {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    let elapsed = now.saturating_sub(created);

    if elapsed < 60 {
        format!("{}s", elapsed)
    } else if elapsed < 3600 {
        format!("{}m", elapsed / 60)
    } else if elapsed < 86400 {
        format!("{}h {}m", elapsed / 3600, (elapsed % 3600) / 60)
    } else {
        format!("{}d {}h", elapsed / 86400, (elapsed % 86400) / 3600)
    }
}
