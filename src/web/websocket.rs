use std::future::ready;
use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;

use super::server::WebState;
use crate::broadcast::{Broadcaster, ConnectionHandle, ConnectionId};
use crate::pty::{InboundFrame, OutboundFrame};

pub fn ws_routes() -> Router<Arc<WebState>> {
    Router::new()
        .route("/ws/terminal/{id}", get(terminal_handler))
        .route("/ws/events", get(events_handler))
}

#[derive(Deserialize)]
pub struct TerminalQuery {
    pub token: Option<String>,
}

#[derive(Deserialize)]
pub struct EventsQuery {
    pub token: Option<String>,
    pub subject: Option<String>,
}

async fn terminal_handler(
    State(state): State<Arc<WebState>>,
    Path(session): Path<String>,
    Query(query): Query<TerminalQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    if !state.verify_token(query.token.as_deref()) {
        return axum::http::StatusCode::FORBIDDEN.into_response();
    }

    ws.on_upgrade(move |socket| handle_terminal(socket, state, session))
        .into_response()
}

async fn handle_terminal(socket: WebSocket, state: Arc<WebState>, session: String) {
    tracing::info!(session = %session, "Terminal WebSocket connected");

    let (sink, stream) = socket.split();
    let inbound = stream.filter_map(|msg| ready(inbound_frame(msg)));
    let outbound = sink.with(|frame| ready(Ok::<_, axum::Error>(outbound_message(frame))));

    let outcome = state.bridge.run(&session, inbound, outbound).await;

    tracing::info!(
        session = %session,
        outcome = ?outcome,
        ended_in = ?outcome.ended_in(),
        "Terminal WebSocket disconnected"
    );
}

/// Ping/pong are handled by axum and never reach the bridge.
fn inbound_frame(msg: Result<Message, axum::Error>) -> Option<InboundFrame> {
    match msg {
        Ok(Message::Text(text)) => Some(InboundFrame::Text(text.as_str().to_owned())),
        Ok(Message::Binary(data)) => Some(InboundFrame::Binary(data)),
        Ok(Message::Close(_)) => Some(InboundFrame::Close),
        Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => None,
        Err(e) => {
            tracing::debug!(error = %e, "WebSocket receive error");
            Some(InboundFrame::Close)
        }
    }
}

fn outbound_message(frame: OutboundFrame) -> Message {
    match frame {
        OutboundFrame::Text(text) => Message::Text(text.into()),
        OutboundFrame::Close { code, reason } => Message::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        })),
    }
}

async fn events_handler(
    State(state): State<Arc<WebState>>,
    Query(query): Query<EventsQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    if !state.verify_token(query.token.as_deref()) {
        return axum::http::StatusCode::FORBIDDEN.into_response();
    }

    ws.on_upgrade(move |socket| handle_events(socket, state, query.subject))
        .into_response()
}

async fn handle_events(socket: WebSocket, state: Arc<WebState>, subject: Option<String>) {
    let (handle, mut rx) = ConnectionHandle::new();
    let guard = FeedGuard {
        events: state.events.clone(),
        id: handle.id(),
    };
    state.events.global.register(handle.clone());
    if let Some(scope) = &subject {
        state.events.scoped.register(scope, handle);
        tracing::debug!(
            connection = guard.id,
            scope = %scope,
            scope_subscribers = state.events.scoped.scope_len(scope),
            "Scoped subscription added"
        );
    }
    tracing::info!(
        connection = guard.id,
        subject = ?subject,
        subscribers = state.events.global.len(),
        "Event feed connected"
    );

    let (mut ws_sink, mut ws_stream) = socket.split();

    loop {
        tokio::select! {
            payload = rx.recv() => {
                let Some(payload) = payload else { break };
                if ws_sink.send(Message::Text(payload.to_string().into())).await.is_err() {
                    break;
                }
            }
            msg = ws_stream.next() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        tracing::debug!(error = %e, "WebSocket receive error");
                        break;
                    }
                    // Feeds are one-way
                    _ => {}
                }
            }
        }
    }

    tracing::info!(connection = guard.id, "Event feed disconnected");
}

/// Removes a feed connection from both registries on drop
struct FeedGuard {
    events: Arc<Broadcaster>,
    id: ConnectionId,
}

impl Drop for FeedGuard {
    fn drop(&mut self) {
        self.events.global.unregister(self.id);
        self.events.scoped.unregister(self.id);
    }
}
