//! The connection state machine.
//!
//! `Connecting → Authenticating → Open → Closing → Closed`, with a
//! parallel `TimedOut → Closed` edge. Transitions go through a single
//! compare-and-swap so concurrent closers (client disconnect, server
//! timeout, forced disconnect) race safely: whichever fires first wins and
//! the rest become no-ops.

use std::sync::atomic::{AtomicU8, Ordering};

/// Lifecycle states of a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    /// Transport accepted, handshake not yet started.
    Connecting = 0,
    /// Waiting on the auth gate (bounded).
    Authenticating = 1,
    /// Fully established; envelopes flow.
    Open = 2,
    /// Teardown in progress; exactly one task runs cleanup.
    Closing = 3,
    /// Terminal.
    Closed = 4,
    /// Heartbeat expired; terminal apart from the edge to `Closed`.
    TimedOut = 5,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Connecting,
            1 => Self::Authenticating,
            2 => Self::Open,
            3 => Self::Closing,
            5 => Self::TimedOut,
            _ => Self::Closed,
        }
    }
}

/// Atomic cell holding a [`ConnectionState`].
#[derive(Debug)]
pub struct StateCell(AtomicU8);

impl StateCell {
    /// New cell in `Connecting`.
    #[must_use]
    pub fn new() -> Self {
        Self(AtomicU8::new(ConnectionState::Connecting as u8))
    }

    /// Current state.
    #[must_use]
    pub fn get(&self) -> ConnectionState {
        ConnectionState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Compare-and-swap transition. Returns `true` if this caller won.
    pub fn transition(&self, from: ConnectionState, to: ConnectionState) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Begin teardown from whatever live state the connection is in.
    ///
    /// Returns `true` for exactly one caller; losers see `false` and must
    /// not run cleanup.
    pub fn begin_close(&self) -> bool {
        self.transition(ConnectionState::Open, ConnectionState::Closing)
            || self.transition(ConnectionState::Connecting, ConnectionState::Closing)
            || self.transition(ConnectionState::Authenticating, ConnectionState::Closing)
            || self.transition(ConnectionState::TimedOut, ConnectionState::Closing)
    }

    /// Mark the connection timed out; the reaper then drives it to Closed.
    pub fn mark_timed_out(&self) -> bool {
        self.transition(ConnectionState::Open, ConnectionState::TimedOut)
    }

    /// Finish teardown.
    pub fn finish_close(&self) {
        self.0.store(ConnectionState::Closed as u8, Ordering::Release);
    }

    /// Whether the connection still delivers envelopes.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.get() == ConnectionState::Open
    }
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_connecting() {
        let cell = StateCell::new();
        assert_eq!(cell.get(), ConnectionState::Connecting);
        assert!(!cell.is_open());
    }

    #[test]
    fn happy_path_transitions() {
        let cell = StateCell::new();
        assert!(cell.transition(ConnectionState::Connecting, ConnectionState::Authenticating));
        assert!(cell.transition(ConnectionState::Authenticating, ConnectionState::Open));
        assert!(cell.is_open());
        assert!(cell.begin_close());
        assert_eq!(cell.get(), ConnectionState::Closing);
        cell.finish_close();
        assert_eq!(cell.get(), ConnectionState::Closed);
    }

    #[test]
    fn wrong_from_state_fails() {
        let cell = StateCell::new();
        assert!(!cell.transition(ConnectionState::Open, ConnectionState::Closing));
        assert_eq!(cell.get(), ConnectionState::Connecting);
    }

    #[test]
    fn begin_close_wins_once() {
        let cell = StateCell::new();
        assert!(cell.transition(ConnectionState::Connecting, ConnectionState::Authenticating));
        assert!(cell.transition(ConnectionState::Authenticating, ConnectionState::Open));

        assert!(cell.begin_close(), "first closer wins");
        assert!(!cell.begin_close(), "second closer is a no-op");
        assert!(!cell.begin_close(), "third closer is a no-op");
    }

    #[test]
    fn begin_close_from_authenticating() {
        let cell = StateCell::new();
        assert!(cell.transition(ConnectionState::Connecting, ConnectionState::Authenticating));
        assert!(cell.begin_close(), "auth-phase close allowed");
    }

    #[test]
    fn timed_out_edge() {
        let cell = StateCell::new();
        assert!(cell.transition(ConnectionState::Connecting, ConnectionState::Authenticating));
        assert!(cell.transition(ConnectionState::Authenticating, ConnectionState::Open));
        assert!(cell.mark_timed_out());
        assert_eq!(cell.get(), ConnectionState::TimedOut);
        assert!(cell.begin_close(), "timed-out connection can still be closed");
    }

    #[test]
    fn mark_timed_out_only_from_open() {
        let cell = StateCell::new();
        assert!(!cell.mark_timed_out());
    }

    #[test]
    fn concurrent_closers_one_winner() {
        use std::sync::Arc;
        use std::sync::atomic::{AtomicUsize, Ordering};

        let cell = Arc::new(StateCell::new());
        assert!(cell.transition(ConnectionState::Connecting, ConnectionState::Authenticating));
        assert!(cell.transition(ConnectionState::Authenticating, ConnectionState::Open));

        let wins = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cell = cell.clone();
                let wins = wins.clone();
                std::thread::spawn(move || {
                    if cell.begin_close() {
                        let _ = wins.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(wins.load(Ordering::SeqCst), 1);
    }
}
