//! WebSocket upgrade, keepalive, and per-connection message routing.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use futures::{SinkExt, StreamExt};
use time::OffsetDateTime;
use tokio::sync::mpsc;

use crate::auth::cookie::{cookie_from_header, COOKIE_NAME};
use crate::oauth;
use crate::protocol::{ClientMessage, ServerEvent};
use crate::router::AppState;

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(25);

/// Axum handler for the configured WS path. Plain HTTP requests that reach it
/// (a mis-routed login return, say) get 426 instead of a 404.
pub async fn ws_route(
    State(state): State<Arc<AppState>>,
    upgrade: Option<WebSocketUpgrade>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let wants_upgrade = headers
        .get("upgrade")
        .and_then(|value| value.to_str().ok())
        .map(|value| value.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);
    if !wants_upgrade {
        return (StatusCode::UPGRADE_REQUIRED, "WebSocket upgrade required").into_response();
    }
    if !authorized(&state, &headers, params.get("token").map(String::as_str)) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    match upgrade {
        Some(upgrade) => upgrade.on_upgrade(move |socket| handle_socket(socket, state)),
        None => (StatusCode::UPGRADE_REQUIRED, "WebSocket upgrade required").into_response(),
    }
}

/// Accepts either a signed session cookie or a `?token=` value carrying a
/// signed cookie token or a short-lived WS ticket.
fn authorized(state: &AppState, headers: &HeaderMap, query_token: Option<&str>) -> bool {
    if let Some(cookie_header) = headers.get("cookie").and_then(|v| v.to_str().ok()) {
        if let Some(value) = cookie_from_header(cookie_header, COOKIE_NAME) {
            if state.cookies.verify(&value).is_some() {
                return true;
            }
        }
    }
    if let Some(token) = query_token {
        if state.cookies.verify(token).is_some() {
            return true;
        }
        if state.tickets.validate(token, OffsetDateTime::now_utc()) {
            return true;
        }
    }
    false
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (events_tx, mut events_rx) = mpsc::unbounded_channel::<String>();
    let subscriber_id = state.sessions.add_subscriber(events_tx.clone()).await;
    tracing::debug!(subscriber_id, "websocket connected");

    let (mut sink, mut stream) = socket.split();
    let send_task = tokio::spawn(async move {
        let mut keepalive = tokio::time::interval(KEEPALIVE_INTERVAL);
        keepalive.tick().await;
        loop {
            tokio::select! {
                event = events_rx.recv() => match event {
                    Some(payload) => {
                        if sink.send(Message::Text(payload)).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
                _ = keepalive.tick() => {
                    if sink.send(Message::Ping(Vec::new())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    while let Some(Ok(message)) = stream.next().await {
        match message {
            Message::Text(text) => route_client_message(&state, &events_tx, &text).await,
            Message::Close(_) => break,
            _ => {}
        }
    }

    send_task.abort();
    state.sessions.remove_subscriber(subscriber_id).await;
    tracing::debug!(subscriber_id, "websocket disconnected");
}

async fn route_client_message(
    state: &Arc<AppState>,
    reply: &mpsc::UnboundedSender<String>,
    text: &str,
) {
    let message: ClientMessage = match serde_json::from_str(text) {
        Ok(message) => message,
        Err(err) => {
            tracing::debug!(error = %err, "unparseable client message");
            return;
        }
    };

    match message {
        ClientMessage::Message { content } => {
            let phase = state.sessions.phase().await;
            let result = if phase.can_start() {
                start_session_and_send(state, &content).await
            } else {
                state.sessions.send_message(&content).await
            };
            if let Err(err) = result {
                // Startup problems concern only the connection that asked.
                let _ = reply.send(
                    ServerEvent::Error {
                        message: err.to_string(),
                    }
                    .to_json(),
                );
                state.log.push("session.start_failed", &err.to_string(), None);
            }
        }
        ClientMessage::PermissionResponse { id, allow } => {
            state.sessions.handle_permission_response(&id, allow).await;
        }
        ClientMessage::Interrupt => {
            state.sessions.interrupt().await;
        }
    }
}

/// Lazy session start for the first message of a conversation: resolve
/// tokens, refresh when stale, make sure the sandbox is up, start the Agent,
/// then deliver the message.
async fn start_session_and_send(
    state: &Arc<AppState>,
    content: &str,
) -> Result<(), agent_gateway_error::GatewayError> {
    let mut tokens = oauth::load_tokens(&state.store, &state.cipher)?.ok_or_else(|| {
        agent_gateway_error::GatewayError::SetupIncomplete {
            message: "no assistant credentials configured".to_string(),
        }
    })?;

    if oauth::needs_refresh(
        tokens.expires_at,
        oauth::REFRESH_THRESHOLD,
        OffsetDateTime::now_utc(),
    ) {
        if let Some(refresh_token) = tokens.refresh_token.clone() {
            match state.oauth.refresh_access_token(&refresh_token).await {
                Ok(refreshed) => {
                    oauth::store_tokens(&state.store, &state.cipher, &refreshed)?;
                    tokens = refreshed;
                }
                Err(err) => {
                    // Non-fatal: the Agent surfaces any ultimate auth failure.
                    tracing::warn!(error = %err, "token refresh failed, using stored token");
                    state.log.push("oauth.refresh_failed", &err.to_string(), None);
                }
            }
        }
    }

    if let Some(sandbox) = &state.sandbox {
        sandbox.ensure_running().await?;
    }

    state
        .sessions
        .start_session(&tokens.access_token, &state.config.wrapper_path)
        .await?;
    state.sessions.send_message(content).await
}
