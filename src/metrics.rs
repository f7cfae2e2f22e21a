//! The two process-wide counters named in §6: a monotonic "connections made"
//! count and an "active connections" gauge. Both are commutative (the gauge
//! only ever moves by ±1) so no coordination beyond the `metrics` facade's own
//! atomics is required, matching the design note that these need no locks.

const CONNECTIONS_MADE: &str = "ss_relay_connections_made_total";
const ACTIVE_CONNECTIONS: &str = "ss_relay_active_connections";

/// Called once per accepted TCP connection or newly observed UDP peer.
pub fn record_connection_made() {
    metrics::counter!(CONNECTIONS_MADE, 1);
    metrics::increment_gauge!(ACTIVE_CONNECTIONS, 1.0);
}

/// Called exactly once per session teardown, paired with one prior
/// `record_connection_made`.
pub fn record_connection_closed() {
    metrics::decrement_gauge!(ACTIVE_CONNECTIONS, 1.0);
}
