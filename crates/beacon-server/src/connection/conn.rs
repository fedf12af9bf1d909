//! A live client connection.
//!
//! One value per accepted transport, owned by the session task that
//! accepted it. Everything mutable is either atomic or behind a short
//! `parking_lot` lock so the fan-out path can touch thousands of these
//! without contention.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
// tokio's Instant so paused-clock tests can drive heartbeat timeouts.
use tokio::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use beacon_core::{ConnectionId, UserId, errors::close_code};

use super::state::{ConnectionState, StateCell};

/// Which delivery transport a connection speaks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportKind {
    /// Bidirectional WebSocket.
    Socket,
    /// One-way SSE push stream.
    Stream,
}

impl TransportKind {
    /// Label used in logs and metrics.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Socket => "socket",
            Self::Stream => "stream",
        }
    }
}

/// Why a connection was (or is being) closed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseReason {
    /// The client went away first.
    ClientClosed,
    /// Heartbeat inactivity timeout.
    Timeout,
    /// Token rejected at handshake.
    AuthRejected,
    /// Auth gate did not answer inside the handshake window.
    AuthTimeout,
    /// Malformed control frame.
    Protocol,
    /// Outbound queue overflowed.
    SlowConsumer,
    /// Server shutting down.
    Shutdown,
    /// Unclassified per-connection fault.
    Error,
}

impl CloseReason {
    /// Label used in logs and metrics.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ClientClosed => "client_closed",
            Self::Timeout => "timeout",
            Self::AuthRejected => "auth_rejected",
            Self::AuthTimeout => "auth_timeout",
            Self::Protocol => "protocol",
            Self::SlowConsumer => "slow_consumer",
            Self::Shutdown => "shutdown",
            Self::Error => "error",
        }
    }

    /// WebSocket close code to send, when the server initiates the close.
    #[must_use]
    pub fn close_code(self) -> Option<u16> {
        match self {
            Self::AuthRejected => Some(close_code::UNAUTHORIZED),
            Self::AuthTimeout => Some(close_code::AUTH_TIMEOUT),
            Self::Protocol => Some(close_code::PROTOCOL_ERROR),
            Self::SlowConsumer => Some(close_code::SLOW_CONSUMER),
            Self::Shutdown => Some(close_code::GOING_AWAY),
            Self::ClientClosed | Self::Timeout | Self::Error => None,
        }
    }
}

/// A connected client.
pub struct Connection {
    /// Unique connection id, minted at accept time.
    pub id: ConnectionId,
    /// Authenticated owner.
    pub user_id: UserId,
    /// Which transport this connection speaks.
    pub kind: TransportKind,
    state: StateCell,
    tx: mpsc::Sender<Arc<str>>,
    connected_at: Instant,
    last_heartbeat: Mutex<Instant>,
    dropped_frames: AtomicU64,
    close_reason: Mutex<Option<CloseReason>>,
    cancel: CancellationToken,
}

impl Connection {
    /// Create a connection in `Connecting`, sending frames into `tx`.
    ///
    /// The channel capacity **is** the backpressure threshold: a full
    /// channel marks the consumer slow and closes it.
    #[must_use]
    pub fn new(user_id: UserId, kind: TransportKind, tx: mpsc::Sender<Arc<str>>) -> Self {
        let now = Instant::now();
        Self {
            id: ConnectionId::new(),
            user_id,
            kind,
            state: StateCell::new(),
            tx,
            connected_at: now,
            last_heartbeat: Mutex::new(now),
            dropped_frames: AtomicU64::new(0),
            close_reason: Mutex::new(None),
            cancel: CancellationToken::new(),
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    /// `Connecting → Authenticating`.
    pub fn begin_authenticating(&self) -> bool {
        self.state
            .transition(ConnectionState::Connecting, ConnectionState::Authenticating)
    }

    /// `Authenticating → Open`.
    pub fn open(&self) -> bool {
        self.state
            .transition(ConnectionState::Authenticating, ConnectionState::Open)
    }

    /// Whether envelopes should still be delivered here.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.state.is_open()
    }

    /// Enqueue a frame for the write task.
    ///
    /// Returns `false` without enqueueing if the connection is not open.
    /// A full queue is the slow-consumer condition: the frame is counted
    /// as dropped and the connection starts closing.
    pub fn send(&self, frame: &Arc<str>) -> bool {
        if !self.is_open() {
            return false;
        }
        match self.tx.try_send(frame.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                let _ = self.dropped_frames.fetch_add(1, Ordering::Relaxed);
                warn!(conn_id = %self.id, user_id = %self.user_id, "outbound queue full, disconnecting slow consumer");
                metrics::counter!("backpressure_disconnects_total").increment(1);
                let _ = self.begin_close(CloseReason::SlowConsumer);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                let _ = self.begin_close(CloseReason::ClientClosed);
                false
            }
        }
    }

    /// Record client liveness (pong, ack, or SSE heartbeat).
    pub fn heartbeat(&self) {
        *self.last_heartbeat.lock() = Instant::now();
    }

    /// Time since the last recorded heartbeat.
    #[must_use]
    pub fn idle_for(&self) -> Duration {
        self.last_heartbeat.lock().elapsed()
    }

    /// Connection age.
    #[must_use]
    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }

    /// Frames dropped on the floor for this connection.
    #[must_use]
    pub fn dropped_frames(&self) -> u64 {
        self.dropped_frames.load(Ordering::Relaxed)
    }

    /// Start teardown with `reason`. Idempotent: exactly one caller wins
    /// the CAS, records the reason, and trips the cancel token; the rest
    /// are no-ops.
    pub fn begin_close(&self, reason: CloseReason) -> bool {
        if self.state.begin_close() {
            *self.close_reason.lock() = Some(reason);
            self.cancel.cancel();
            true
        } else {
            false
        }
    }

    /// Mark the heartbeat timeout edge (`Open → TimedOut`).
    pub fn mark_timed_out(&self) -> bool {
        self.state.mark_timed_out()
    }

    /// Finish teardown (`→ Closed`).
    pub fn finish_close(&self) {
        self.state.finish_close();
    }

    /// The recorded close reason, once one closer has won.
    #[must_use]
    pub fn close_reason(&self) -> Option<CloseReason> {
        *self.close_reason.lock()
    }

    /// Token tripped when the connection starts closing.
    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
