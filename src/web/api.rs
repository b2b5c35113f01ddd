use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};

use super::server::WebState;
use crate::error::SessionError;
use crate::mux::SessionSummary;
use crate::status::{StatusEvent, StatusUpdate};

pub fn api_routes() -> Router<Arc<WebState>> {
    Router::new()
        .route("/api/sessions", get(list_sessions).post(create_session))
        .route("/api/sessions/{id}", get(get_session).delete(destroy_session))
        .route("/api/status", post(update_status))
        .route("/api/scopes/{scope}/notify", post(notify_scope))
}

#[derive(Deserialize)]
pub struct TokenQuery {
    pub token: Option<String>,
}

#[derive(Debug)]
pub enum ApiError {
    Forbidden,
    BadRequest(String),
    Session(SessionError),
}

impl From<SessionError> for ApiError {
    fn from(e: SessionError) -> Self {
        ApiError::Session(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind, message) = match self {
            ApiError::Forbidden => (StatusCode::FORBIDDEN, "forbidden", "invalid token".to_string()),
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, "bad_request", message),
            ApiError::Session(e) => {
                let (status, kind) = match &e {
                    SessionError::SessionNotFound(_) => (StatusCode::NOT_FOUND, "session_not_found"),
                    SessionError::SessionCreationFailed(_) => {
                        (StatusCode::BAD_GATEWAY, "session_creation_failed")
                    }
                    SessionError::InvalidSessionId(_) => (StatusCode::BAD_REQUEST, "invalid_session_id"),
                    e if e.is_timeout() => (StatusCode::GATEWAY_TIMEOUT, "timeout"),
                    _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
                };
                if status.is_server_error() {
                    tracing::error!(error = %e, "API request failed");
                }
                (status, kind, e.to_string())
            }
        };
        (
            status,
            Json(serde_json::json!({ "error": kind, "message": message })),
        )
            .into_response()
    }
}

fn authorize(state: &WebState, query: &TokenQuery) -> Result<(), ApiError> {
    if state.verify_token(query.token.as_deref()) {
        Ok(())
    } else {
        Err(ApiError::Forbidden)
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionResponse {
    pub session_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct NotifyResponse {
    pub delivered: usize,
}

async fn list_sessions(
    State(state): State<Arc<WebState>>,
    Query(query): Query<TokenQuery>,
) -> Result<Json<Vec<SessionSummary>>, ApiError> {
    authorize(&state, &query)?;
    Ok(Json(state.sessions.list().await?))
}

async fn create_session(
    State(state): State<Arc<WebState>>,
    Query(query): Query<TokenQuery>,
    body: Bytes,
) -> Result<Json<CreateSessionResponse>, ApiError> {
    authorize(&state, &query)?;
    // An empty body means all defaults
    let body: CreateSessionRequest = if body.is_empty() {
        CreateSessionRequest::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| ApiError::BadRequest(e.to_string()))?
    };
    let working_directory = body
        .working_directory
        .unwrap_or_else(|| state.sessions.status().fallback_working_directory().to_string());
    let session_id = state
        .sessions
        .create(body.session_id, &working_directory)
        .await?;
    Ok(Json(CreateSessionResponse { session_id }))
}

async fn get_session(
    State(state): State<Arc<WebState>>,
    Query(query): Query<TokenQuery>,
    Path(id): Path<String>,
) -> Result<Json<SessionSummary>, ApiError> {
    authorize(&state, &query)?;
    Ok(Json(state.sessions.get(&id).await?))
}

async fn destroy_session(
    State(state): State<Arc<WebState>>,
    Query(query): Query<TokenQuery>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    authorize(&state, &query)?;
    state.sessions.destroy(&id).await;
    Ok(Json(serde_json::json!({ "ok": true })))
}

async fn update_status(
    State(state): State<Arc<WebState>>,
    Query(query): Query<TokenQuery>,
    Json(update): Json<StatusUpdate>,
) -> Result<Json<StatusEvent>, ApiError> {
    authorize(&state, &query)?;
    Ok(Json(state.sessions.update_status(update).await?))
}

async fn notify_scope(
    State(state): State<Arc<WebState>>,
    Query(query): Query<TokenQuery>,
    Path(scope): Path<String>,
    Json(payload): Json<serde_json::Value>,
) -> Result<Json<NotifyResponse>, ApiError> {
    authorize(&state, &query)?;
    let delivered = state.events.notify(&scope, payload);
    tracing::debug!(scope = %scope, delivered, "Scoped notification");
    Ok(Json(NotifyResponse { delivered }))
}
