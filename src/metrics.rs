//! Prometheus counters exposed via `GET /metrics`.

use prometheus::{Encoder, IntCounter, Registry, TextEncoder};

#[derive(Clone)]
pub struct Metrics {
    pub registry: Registry,
    /// Files stored through upload or store requests.
    pub uploads_total: IntCounter,
    /// Files served to readers.
    pub deliveries_total: IntCounter,
    /// Delete requests committed.
    pub deletions_total: IntCounter,
    /// Events applied from a parent server.
    pub replicated_events_total: IntCounter,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let uploads_total =
            IntCounter::new("stashd_uploads_total", "Files stored via upload or store").unwrap();
        let deliveries_total =
            IntCounter::new("stashd_deliveries_total", "Files served to readers").unwrap();
        let deletions_total =
            IntCounter::new("stashd_deletions_total", "Delete requests committed").unwrap();
        let replicated_events_total = IntCounter::new(
            "stashd_replicated_events_total",
            "Events applied from a parent server",
        )
        .unwrap();

        registry.register(Box::new(uploads_total.clone())).unwrap();
        registry.register(Box::new(deliveries_total.clone())).unwrap();
        registry.register(Box::new(deletions_total.clone())).unwrap();
        registry
            .register(Box::new(replicated_events_total.clone()))
            .unwrap();

        Self {
            registry,
            uploads_total,
            deliveries_total,
            deletions_total,
            replicated_events_total,
        }
    }

    /// Encode all metrics in Prometheus text format.
    pub fn encode(&self) -> String {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        let mut buf = Vec::new();
        encoder.encode(&families, &mut buf).unwrap();
        String::from_utf8(buf).unwrap()
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
    fn counters_register_and_encode() {
        let m = Metrics::new();
        m.uploads_total.inc();
        m.deliveries_total.inc();
        m.deliveries_total.inc();
        m.deletions_total.inc();

        let output = m.encode();
        assert!(output.contains("stashd_uploads_total 1"));
        assert!(output.contains("stashd_deliveries_total 2"));
        assert!(output.contains("stashd_deletions_total 1"));
        assert!(output.contains("stashd_replicated_events_total 0"));
    }
}
