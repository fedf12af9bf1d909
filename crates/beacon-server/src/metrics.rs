//! Prometheus metrics recorder and `/metrics` endpoint handler.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Install the Prometheus metrics recorder (global).
///
/// Returns the `PrometheusHandle` used to render the `/metrics` endpoint.
/// Must be called once at startup before any metrics are recorded.
pub fn install_recorder() -> PrometheusHandle {
    let builder = PrometheusBuilder::new();
    let handle = builder
        .install_recorder()
        .expect("failed to install metrics recorder");
    info!("prometheus metrics recorder installed");
    handle
}

/// Render Prometheus text format from the installed recorder.
#[must_use]
pub fn render(handle: &PrometheusHandle) -> String {
    handle.render()
}

// Metric name constants to avoid typos across crates.

/// Connections opened total (counter).
pub const CONNECTIONS_TOTAL: &str = "connections_total";
/// Live connections (gauge).
pub const CONNECTIONS_ACTIVE: &str = "connections_active";
/// Disconnections total (counter, labels: reason).
pub const DISCONNECTIONS_TOTAL: &str = "disconnections_total";
/// Slow consumers force-closed (counter).
pub const BACKPRESSURE_DISCONNECTS_TOTAL: &str = "backpressure_disconnects_total";
/// Malformed control frames (counter).
pub const PROTOCOL_ERRORS_TOTAL: &str = "protocol_errors_total";
/// Denied room joins (counter).
pub const JOINS_DENIED_TOTAL: &str = "joins_denied_total";
/// Live room memberships (gauge).
pub const ROOM_MEMBERSHIPS: &str = "room_memberships";
/// Envelopes delivered to local connections (counter).
pub const ENVELOPES_DELIVERED_TOTAL: &str = "envelopes_delivered_total";
/// Presence transitions (counter, labels: status).
pub const PRESENCE_TRANSITIONS_TOTAL: &str = "presence_transitions_total";
/// Dispatcher enqueues dropped (counter).
pub const DISPATCH_DROPPED_TOTAL: &str = "dispatch_dropped_total";
/// Envelopes published to the broker (counter).
pub const BRIDGE_PUBLISHED_TOTAL: &str = "bridge_published_total";
/// Outbound events dropped by the bounded buffer (counter).
pub const BRIDGE_DROPPED_EVENTS_TOTAL: &str = "bridge_dropped_events_total";
/// Inbound duplicates absorbed (counter).
pub const BRIDGE_DEDUPED_TOTAL: &str = "bridge_deduped_total";
/// Broker reconnects (counter).
pub const BRIDGE_RECONNECTS_TOTAL: &str = "bridge_reconnects_total";
