use std::sync::Arc;

use anyhow::{Context, Result};
use axum::response::Json;
use axum::routing::get;
use axum::Router;
use tower_http::cors::CorsLayer;

use crate::broadcast::Broadcaster;
use crate::config::Settings;
use crate::mux::{Executor, SessionManager};
use crate::pty::PtyBridge;
use crate::status::StatusRegistry;

/// State shared across all web request handlers
pub struct WebState {
    pub sessions: Arc<SessionManager>,
    pub bridge: Arc<PtyBridge>,
    pub events: Arc<Broadcaster>,
    pub token: String,
}

impl WebState {
    /// Wire the real tmux executor, registries and bridge from settings.
    pub fn from_settings(settings: &Settings, token: String) -> Arc<Self> {
        let events = Arc::new(Broadcaster::new());
        let status = Arc::new(StatusRegistry::new(
            settings.tmux.fallback_working_directory(),
        ));
        let sessions = Arc::new(SessionManager::new(
            Arc::new(Executor),
            settings.tmux.clone(),
            status,
            events.clone(),
        ));
        let bridge = Arc::new(PtyBridge::new(sessions.clone(), settings.terminal.clone()));
        Arc::new(Self {
            sessions,
            bridge,
            events,
            token,
        })
    }

    pub fn verify_token(&self, token: Option<&str>) -> bool {
        token.is_some_and(|t| t == self.token)
    }
}

pub fn create_router(state: Arc<WebState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .merge(super::api::api_routes())
        .merge(super::websocket::ws_routes())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

/// Random URL-safe token for servers started without one
pub fn generate_token() -> String {
    use base64::Engine;
    use rand::Rng;
    let mut rng = rand::rng();
    let bytes: [u8; 16] = rng.random();
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

/// Serve until ctrl-c.
pub async fn start_web_server(host: &str, port: u16, state: Arc<WebState>) -> Result<()> {
    let app = create_router(state);

    let addr = format!("{}:{}", host, port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    tracing::info!(addr = %addr, "Web server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutting down");
        })
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_from_settings() {
        let state = WebState::from_settings(&Settings::default(), "tok".to_string());
        assert!(state.verify_token(Some("tok")));
        assert!(!state.verify_token(Some("other")));
        assert!(!state.verify_token(None));
        assert_eq!(state.events.global.len(), 0);
    }

    #[test]
    fn test_generate_token_is_url_safe() {
        let a = generate_token();
        let b = generate_token();
        assert_eq!(a.len(), 22);
        assert_ne!(a, b);
        assert!(a
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }
}
