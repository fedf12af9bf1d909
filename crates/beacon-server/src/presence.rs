//! TTL-based presence with a reconnect grace window.
//!
//! State machine per user: `Offline → (connect) → Online → (grace elapses
//! with zero live connections) → Offline`. The tracker is the *only* owner
//! of the grace timer — reconnecting inside the window cancels it and
//! produces zero `user_status` events. Flapping is a correctness bug here,
//! not cosmetic.
//!
//! Inputs come from the registry (connect/disconnect); output is a
//! `user_status` envelope through the dispatcher on every real
//! Online↔Offline transition, and only then.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use beacon_core::UserId;
use beacon_events::EventDispatcher;

struct PresenceEntry {
    live: usize,
    online: bool,
    last_seen: String,
    grace_cancel: Option<CancellationToken>,
}

/// Per-process presence state, fed by registry events.
pub struct PresenceTracker {
    entries: DashMap<UserId, PresenceEntry>,
    dispatcher: EventDispatcher,
    grace: Duration,
}

impl PresenceTracker {
    /// Create a tracker emitting transitions through `dispatcher`.
    pub fn new(dispatcher: EventDispatcher, grace: Duration) -> Arc<Self> {
        Arc::new(Self {
            entries: DashMap::new(),
            dispatcher,
            grace,
        })
    }

    /// A connection for `user_id` reached Open.
    ///
    /// First connection while offline emits `online`; a reconnect inside
    /// the grace window cancels the pending timer and emits nothing.
    pub fn on_connect(&self, user_id: &UserId) {
        let now = chrono::Utc::now().to_rfc3339();
        let mut entry = self
            .entries
            .entry(user_id.clone())
            .or_insert_with(|| PresenceEntry {
                live: 0,
                online: false,
                last_seen: now.clone(),
                grace_cancel: None,
            });
        entry.live += 1;
        entry.last_seen = now.clone();
        if let Some(pending) = entry.grace_cancel.take() {
            pending.cancel();
            debug!(user_id = %user_id, "reconnect inside grace window, no transition");
        }
        if !entry.online {
            entry.online = true;
            drop(entry);
            metrics::counter!("presence_transitions_total", "status" => "online").increment(1);
            let _ = self.dispatcher.user_status(user_id, true, &now);
        }
    }

    /// A connection for `user_id` went away.
    ///
    /// When the last one goes, a grace timer starts; only its expiry with
    /// still-zero live connections flips the user offline.
    pub fn on_disconnect(self: &Arc<Self>, user_id: &UserId) {
        let Some(mut entry) = self.entries.get_mut(user_id) else {
            return;
        };
        entry.live = entry.live.saturating_sub(1);
        entry.last_seen = chrono::Utc::now().to_rfc3339();
        if entry.live > 0 || !entry.online {
            return;
        }

        let cancel = CancellationToken::new();
        entry.grace_cancel = Some(cancel.clone());
        drop(entry);

        let tracker = self.clone();
        let user = user_id.clone();
        let grace = self.grace;
        drop(tokio::spawn(async move {
            tokio::select! {
                () = cancel.cancelled() => {}
                () = tokio::time::sleep(grace) => tracker.grace_expired(&user),
            }
        }));
    }

    /// Grace elapsed; flip offline if nothing reconnected meanwhile.
    fn grace_expired(&self, user_id: &UserId) {
        if let Some(mut entry) = self.entries.get_mut(user_id) {
            if entry.live == 0 && entry.online {
                entry.online = false;
                entry.grace_cancel = None;
                let last_seen = entry.last_seen.clone();
                drop(entry);
                metrics::counter!("presence_transitions_total", "status" => "offline")
                    .increment(1);
                let _ = self.dispatcher.user_status(user_id, false, &last_seen);
                debug!(user_id = %user_id, "grace elapsed, user offline");
            }
        }
        // Fully-idle entries are dropped so the map tracks only users with
        // a recent connection history.
        let _ = self
            .entries
            .remove_if(user_id, |_, entry| entry.live == 0 && !entry.online);
    }

    /// Whether a user currently counts as online.
    #[must_use]
    pub fn is_online(&self, user_id: &UserId) -> bool {
        self.entries
            .get(user_id)
            .is_some_and(|entry| entry.online)
    }

    /// Number of users currently online.
    #[must_use]
    pub fn online_count(&self) -> usize {
        self.entries.iter().filter(|entry| entry.online).count()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
