//! # beacon-core
//!
//! Shared vocabulary for the Beacon real-time gateway.
//!
//! - **Branded IDs**: newtype wrappers for connection, user, and event IDs
//! - **Room topics**: the typed multicast addresses connections can join
//! - **Error taxonomy**: gateway-wide error enum and WebSocket close codes
//! - **Collaborator traits**: the auth gate and room authorizer boundaries
//!   consumed (never reimplemented) by the gateway

#![deny(unsafe_code)]

pub mod auth;
pub mod errors;
pub mod ids;
pub mod topic;

pub use auth::{AuthDecision, AuthGate, RoomAuthorizer};
pub use errors::{GatewayError, Result};
pub use ids::{ConnectionId, EventId, UserId};
pub use topic::RoomTopic;
