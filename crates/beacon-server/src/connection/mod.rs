//! Per-connection state and the process-local connection registry.

pub mod conn;
pub mod registry;
pub mod state;

pub use conn::{CloseReason, Connection, TransportKind};
pub use registry::ConnectionRegistry;
pub use state::ConnectionState;
