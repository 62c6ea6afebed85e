//! Node metrics.

use prometheus_client::{
    encoding::text::encode,
    metrics::{counter::Counter, gauge::Gauge},
    registry::Registry,
};

/// Counters and gauges of one node, exposed at `/metrics`.
pub struct Metrics {
    /// Requests forwarded to another node.
    pub forwarded: Counter,
    /// Requests served by a local committee.
    pub served: Counter,
    /// Notifications that exhausted their retries.
    pub notifications_failed: Counter,
    /// Membership changes applied through this node.
    pub membership_updates: Counter,
    pub joins: Counter,
    pub leaves: Counter,
    pub refused_leaves: Counter,
    /// Distinct peers in the network view.
    pub known_peers: Gauge,

    registry: Registry,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::init(Registry::with_prefix("overlay"))
    }
}

impl Metrics {
    /// Initialize metrics and register them with `registry`.
    pub fn init(mut registry: Registry) -> Self {
        let forwarded = Counter::default();
        let served = Counter::default();
        let notifications_failed = Counter::default();
        let membership_updates = Counter::default();
        let joins = Counter::default();
        let leaves = Counter::default();
        let refused_leaves = Counter::default();
        let known_peers = Gauge::default();

        registry.register(
            "forwarded",
            "Requests forwarded to another node",
            forwarded.clone(),
        );
        registry.register("served", "Requests served locally", served.clone());
        registry.register(
            "notifications_failed",
            "Notifications that exhausted their retries",
            notifications_failed.clone(),
        );
        registry.register(
            "membership_updates",
            "Membership changes applied through this node",
            membership_updates.clone(),
        );
        registry.register("joins", "Completed joins", joins.clone());
        registry.register("leaves", "Completed leaves", leaves.clone());
        registry.register(
            "refused_leaves",
            "Leaves refused to preserve quorum",
            refused_leaves.clone(),
        );
        registry.register(
            "known_peers",
            "Distinct peers in the network view",
            known_peers.clone(),
        );

        Self {
            forwarded,
            served,
            notifications_failed,
            membership_updates,
            joins,
            leaves,
            refused_leaves,
            known_peers,
            registry,
        }
    }

    /// Render every metric in the text exposition format.
    pub fn encode(&self) -> String {
        let mut buffer = String::new();
        if encode(&mut buffer, &self.registry).is_err() {
            return String::new();
        }
        buffer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode() {
        let metrics = Metrics::default();
        metrics.served.inc();
        metrics.known_peers.set(3);
        let encoded = metrics.encode();
        assert!(encoded.contains("overlay_served_total 1"));
        assert!(encoded.contains("overlay_known_peers 3"));
        assert!(encoded.ends_with("# EOF\n"));
    }
}
