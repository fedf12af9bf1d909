//! Process-local connection registry.
//!
//! Two sharded maps (`DashMap` uses per-shard locks internally, so high
//! connect/disconnect churn never convoys on one global lock): the primary
//! id → connection table and a user → connection-set index for
//! `user:{id}` lookups. A background reaper closes connections whose
//! heartbeat has gone stale.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use beacon_core::{ConnectionId, UserId};

use super::conn::{CloseReason, Connection};

/// Table of live connections owned by this process.
#[derive(Default)]
pub struct ConnectionRegistry {
    conns: DashMap<ConnectionId, Arc<Connection>>,
    by_user: DashMap<UserId, HashSet<ConnectionId>>,
}

impl ConnectionRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection, indexing it by user.
    pub fn register(&self, conn: Arc<Connection>) -> ConnectionId {
        let id = conn.id.clone();
        let _ = self
            .by_user
            .entry(conn.user_id.clone())
            .or_default()
            .insert(id.clone());
        let _ = self.conns.insert(id.clone(), conn);
        metrics::gauge!("connections_active").increment(1.0);
        metrics::counter!("connections_total").increment(1);
        id
    }

    /// Remove a connection. Returns the connection and how many live
    /// connections its user still has (the presence tracker's input).
    pub fn unregister(&self, id: &ConnectionId) -> Option<(Arc<Connection>, usize)> {
        let (_, conn) = self.conns.remove(id)?;
        let remaining = match self.by_user.get_mut(&conn.user_id) {
            Some(mut set) => {
                let _ = set.remove(id);
                let remaining = set.len();
                drop(set);
                if remaining == 0 {
                    // Racy re-check under the entry lock: a concurrent
                    // register may have added a connection in between.
                    let _ = self
                        .by_user
                        .remove_if(&conn.user_id, |_, set| set.is_empty());
                }
                remaining
            }
            None => 0,
        };
        metrics::gauge!("connections_active").decrement(1.0);
        debug!(conn_id = %id, user_id = %conn.user_id, remaining, "connection unregistered");
        Some((conn, remaining))
    }

    /// Look up a connection by id.
    #[must_use]
    pub fn get(&self, id: &ConnectionId) -> Option<Arc<Connection>> {
        self.conns.get(id).map(|entry| entry.value().clone())
    }

    /// All live connections for a user.
    #[must_use]
    pub fn lookup_by_user(&self, user_id: &UserId) -> Vec<Arc<Connection>> {
        // Snapshot the id set under the shard lock, resolve after.
        let ids: Vec<ConnectionId> = match self.by_user.get(user_id) {
            Some(set) => set.iter().cloned().collect(),
            None => return Vec::new(),
        };
        ids.iter().filter_map(|id| self.get(id)).collect()
    }

    /// Record liveness for a connection.
    pub fn heartbeat(&self, id: &ConnectionId) -> bool {
        match self.conns.get(id) {
            Some(conn) => {
                conn.heartbeat();
                true
            }
            None => false,
        }
    }

    /// Number of live connections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.conns.len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }

    /// Snapshot of all connections (shutdown path).
    #[must_use]
    pub fn all(&self) -> Vec<Arc<Connection>> {
        self.conns.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Spawn the inactivity reaper.
    ///
    /// Every `interval`, connections idle past `timeout` are marked
    /// `TimedOut` and their close begins; the owning session task runs the
    /// actual cleanup when its cancel token trips.
    pub fn spawn_reaper(
        self: &Arc<Self>,
        interval: Duration,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let stale: Vec<Arc<Connection>> = registry
                            .conns
                            .iter()
                            .filter(|entry| entry.value().idle_for() > timeout)
                            .map(|entry| entry.value().clone())
                            .collect();
                        for conn in stale {
                            if conn.mark_timed_out() && conn.begin_close(CloseReason::Timeout) {
                                info!(conn_id = %conn.id, user_id = %conn.user_id, "heartbeat timeout, closing");
                                metrics::counter!("disconnections_total", "reason" => "timeout")
                                    .increment(1);
                            }
                        }
                    }
                }
            }
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
