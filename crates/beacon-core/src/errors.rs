//! Gateway-wide error taxonomy.
//!
//! [`GatewayError`] covers every failure the gateway distinguishes on the
//! wire or in logs. Variants map onto the WebSocket close codes in
//! [`close_code`]; anything without a distinct code closes as a generic
//! internal fault. Duplicate events are deliberately *not* an error —
//! they are deduped silently on arrival.

use thiserror::Error;

/// Errors that can occur in the real-time gateway.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Bad or expired token at handshake. Closed with
    /// [`close_code::UNAUTHORIZED`]; never retried by the server.
    #[error("authentication rejected: {0}")]
    AuthRejected(String),

    /// The auth gate did not answer within its bounded timeout.
    #[error("authentication timed out after {0}ms")]
    AuthTimeout(u64),

    /// Malformed control frame or invalid topic from a client.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The shared broker is unreachable. Surfaced as counters and logs
    /// only; never fails the write that triggered a publish.
    #[error("broker unavailable: {0}")]
    BrokerUnavailable(String),

    /// A consumer's outbound queue overflowed; the connection is closed
    /// to protect the process.
    #[error("slow consumer: outbound queue exceeded {0} frames")]
    SlowConsumer(usize),

    /// Operation raced with connection teardown.
    #[error("connection closed")]
    ConnectionClosed,

    /// JSON (de)serialization failure at a wire boundary.
    #[error("serde error: {0}")]
    Serde(#[from] serde_json::Error),

    /// Internal error (e.g. a background task went away).
    #[error("internal error: {0}")]
    Internal(String),
}

/// Convenience type alias for gateway results.
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Application WebSocket close codes (4000–4999 range).
pub mod close_code {
    /// Malformed control frame.
    pub const PROTOCOL_ERROR: u16 = 4400;
    /// Token rejected at handshake.
    pub const UNAUTHORIZED: u16 = 4401;
    /// Auth gate did not answer inside the handshake window.
    pub const AUTH_TIMEOUT: u16 = 4408;
    /// Outbound queue overflowed.
    pub const SLOW_CONSUMER: u16 = 4413;
    /// Server is shutting down.
    pub const GOING_AWAY: u16 = 4001;
}

impl GatewayError {
    /// The WebSocket close code for this error, if it closes a connection.
    #[must_use]
    pub fn close_code(&self) -> Option<u16> {
        match self {
            Self::AuthRejected(_) => Some(close_code::UNAUTHORIZED),
            Self::AuthTimeout(_) => Some(close_code::AUTH_TIMEOUT),
            Self::Protocol(_) => Some(close_code::PROTOCOL_ERROR),
            Self::SlowConsumer(_) => Some(close_code::SLOW_CONSUMER),
            Self::BrokerUnavailable(_)
            | Self::ConnectionClosed
            | Self::Serde(_)
            | Self::Internal(_) => None,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
