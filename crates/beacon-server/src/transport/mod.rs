//! Delivery transports.
//!
//! One envelope codec, two strategy implementations: the bidirectional
//! WebSocket ([`ws`]) and the one-way SSE push stream ([`sse`]). Both share
//! the connection state machine and the client frame schema, so behavior
//! cannot silently diverge between them.

pub mod codec;
pub mod sse;
pub mod ws;

use std::sync::Arc;

use axum::http::HeaderMap;
use serde::Deserialize;
use tracing::info;

use crate::connection::{CloseReason, Connection};
use crate::server::AppState;

/// Handshake query parameters (`?token=...`).
///
/// The `Authorization: Bearer` header is also accepted; `EventSource`
/// clients cannot set headers, so the query form is the documented path
/// for SSE.
#[derive(Debug, Deserialize)]
pub struct HandshakeParams {
    /// Bearer token validated by the auth gate.
    pub token: Option<String>,
}

/// Resolve the bearer token from query or `Authorization` header.
#[must_use]
pub fn extract_token(params: &HandshakeParams, headers: &HeaderMap) -> Option<String> {
    if let Some(token) = params.token.as_ref().filter(|t| !t.is_empty()) {
        return Some(token.clone());
    }
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .filter(|token| !token.is_empty())
        .map(str::to_owned)
}

/// One teardown path for both transports.
///
/// Rooms and registry are cleared before presence hears about the
/// disconnect, so nothing can fan out to a half-closed connection and the
/// presence grace window starts only once delivery has truly stopped.
pub(crate) fn teardown_connection(state: &AppState, conn: &Arc<Connection>) {
    // No-op if a closer already won; establishes ClientClosed otherwise.
    let _ = conn.begin_close(CloseReason::ClientClosed);

    for topic in state.rooms.remove_connection(&conn.id) {
        state.bridge.unsubscribe_topic(&topic);
    }
    let _ = state.registry.unregister(&conn.id);
    state.presence.on_disconnect(&conn.user_id);
    conn.finish_close();

    let reason = conn.close_reason().unwrap_or(CloseReason::Error);
    metrics::counter!("disconnections_total", "reason" => reason.as_str()).increment(1);
    info!(
        conn_id = %conn.id,
        user_id = %conn.user_id,
        transport = conn.kind.as_str(),
        reason = reason.as_str(),
        age_secs = conn.age().as_secs(),
        dropped_frames = conn.dropped_frames(),
        "connection closed"
    );
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
