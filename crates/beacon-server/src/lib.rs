//! # beacon-server
//!
//! The per-process real-time gateway.
//!
//! - **Connection registry**: sharded table of live connections, inactivity
//!   reaper, idempotent close via compare-and-swap on connection state
//! - **Presence tracker**: online/offline per user with a reconnect grace
//!   window; zero `user_status` events on a flap
//! - **Room manager**: local topic → member sets; authorized joins
//! - **Delivery transports**: WebSocket and SSE behind one envelope codec
//!   and one connection state machine
//! - **Fan-out**: bridge deliveries → local room members, no lock held
//!   across sends
//! - **HTTP surface**: `/ws`, `/events`, `/realtime/heartbeat`, `/status`,
//!   `/health`, `/metrics`
//! - **Graceful shutdown** via `CancellationToken`

#![deny(unsafe_code)]

pub mod config;
pub mod connection;
pub mod fanout;
pub mod metrics;
pub mod presence;
pub mod rooms;
pub mod server;
pub mod shutdown;
pub mod status;
pub mod transport;
