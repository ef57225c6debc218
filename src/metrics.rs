//! Prometheus metrics exported by the relay.
//!
//! Four series, updated synchronously at the sites where the state they
//! mirror changes:
//!
//! - `collab_active_rooms` (gauge) — room-map size after every
//!   ensure/evict
//! - `collab_connected_clients` (gauge) — sum of socket-set sizes after
//!   every attach/detach
//! - `collab_updates_total` (counter) — updates applied to documents,
//!   local or bus origin
//! - `collab_messages_sent_total` (counter) — frames sent to client
//!   sockets
//!
//! Each relay instance owns its registry, so co-hosted instances (as in
//! the integration tests) report independently.

use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};

/// Metrics registry for one relay instance.
pub struct Metrics {
    registry: Registry,
    pub active_rooms: IntGauge,
    pub connected_clients: IntGauge,
    pub updates_total: IntCounter,
    pub messages_sent_total: IntCounter,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let active_rooms = IntGauge::new(
            "collab_active_rooms",
            "Number of rooms currently resident on this instance",
        )
        .expect("metric creation failed");
        let connected_clients = IntGauge::new(
            "collab_connected_clients",
            "Number of client sockets attached across all rooms",
        )
        .expect("metric creation failed");
        let updates_total = IntCounter::new(
            "collab_updates_total",
            "Total updates applied to room documents, regardless of origin",
        )
        .expect("metric creation failed");
        let messages_sent_total = IntCounter::new(
            "collab_messages_sent_total",
            "Total frames sent to client sockets",
        )
        .expect("metric creation failed");

        registry
            .register(Box::new(active_rooms.clone()))
            .expect("metric registration failed");
        registry
            .register(Box::new(connected_clients.clone()))
            .expect("metric registration failed");
        registry
            .register(Box::new(updates_total.clone()))
            .expect("metric registration failed");
        registry
            .register(Box::new(messages_sent_total.clone()))
            .expect("metric registration failed");

        Self {
            registry,
            active_rooms,
            connected_clients,
            updates_total,
            messages_sent_total,
        }
    }

    /// Render all series in the Prometheus text exposition format.
    pub fn encode(&self) -> String {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buffer) {
            log::error!("failed to encode metrics: {e}");
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_series_present_in_exposition() {
        let metrics = Metrics::new();
        let text = metrics.encode();

        assert!(text.contains("collab_active_rooms"));
        assert!(text.contains("collab_connected_clients"));
        assert!(text.contains("collab_updates_total"));
        assert!(text.contains("collab_messages_sent_total"));
    }

    #[test]
    fn test_counters_and_gauges_track_values() {
        let metrics = Metrics::new();
        metrics.active_rooms.set(3);
        metrics.connected_clients.set(7);
        metrics.updates_total.inc();
        metrics.messages_sent_total.inc_by(5);

        let text = metrics.encode();
        assert!(text.contains("collab_active_rooms 3"));
        assert!(text.contains("collab_connected_clients 7"));
        assert!(text.contains("collab_updates_total 1"));
        assert!(text.contains("collab_messages_sent_total 5"));
    }

    #[test]
    fn test_instances_do_not_share_registries() {
        let a = Metrics::new();
        let b = Metrics::new();
        a.active_rooms.set(9);

        assert!(a.encode().contains("collab_active_rooms 9"));
        assert!(b.encode().contains("collab_active_rooms 0"));
    }
}
