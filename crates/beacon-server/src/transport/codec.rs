//! Shared wire codec: control frames in, client frames out.
//!
//! Both transports speak exactly these shapes. Inbound control frames are
//! parsed and size-checked once, here; outbound envelopes become the
//! `{id, type, data, ts}` client frame via [`EventEnvelope::to_client_frame`]
//! and are shared as `Arc<str>` so one serialization serves a whole room.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;

use beacon_core::{ConnectionId, GatewayError};
use beacon_events::EventEnvelope;

/// Client → server control actions (bidirectional transport only).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlAction {
    /// Join a room (authorized for post/conversation topics).
    Join,
    /// Leave a room.
    Leave,
    /// Typing indicator for a room.
    Typing,
    /// Application-level liveness ack.
    Ack,
}

/// A parsed control frame: `{action, room?, data?}`.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ControlFrame {
    /// What the client wants.
    pub action: ControlAction,
    /// Room topic, required for `join`/`leave`/`typing`.
    pub room: Option<String>,
    /// Optional action payload.
    pub data: Option<Value>,
}

/// Parse and bound-check a control frame.
pub fn parse_control(text: &str, max_bytes: usize) -> Result<ControlFrame, GatewayError> {
    if text.len() > max_bytes {
        return Err(GatewayError::Protocol(format!(
            "control frame of {} bytes exceeds limit of {max_bytes}",
            text.len()
        )));
    }
    serde_json::from_str(text)
        .map_err(|err| GatewayError::Protocol(format!("malformed control frame: {err}")))
}

/// Serialize an envelope once for a whole room's worth of sends.
pub fn encode_client_frame(envelope: &EventEnvelope) -> Result<Arc<str>, GatewayError> {
    Ok(Arc::from(envelope.to_client_frame()?))
}

/// The handshake hello, sent as the first frame on both transports.
///
/// Carries the connection id the client needs for SSE heartbeats and
/// support tickets. Shaped like a client frame minus the envelope id.
#[must_use]
pub fn hello_frame(conn_id: &ConnectionId) -> String {
    serde_json::json!({
        "type": "connection.established",
        "data": { "connectionId": conn_id },
        "ts": chrono::Utc::now().to_rfc3339(),
    })
    .to_string()
}

/// Application-level heartbeat reply to an `ack` control frame.
#[must_use]
pub fn pong_frame() -> String {
    serde_json::json!({
        "id": beacon_core::EventId::new(),
        "type": "pong",
        "data": {},
        "ts": chrono::Utc::now().to_rfc3339(),
    })
    .to_string()
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
