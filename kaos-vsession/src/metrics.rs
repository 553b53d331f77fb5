//! Prometheus metrics for virtual sessions.
//!
//! # Example
//!
//! ```rust,ignore
//! use kaos_vsession::{Metrics, ServerBuilder};
//!
//! let metrics = Metrics::new()?;
//! let server = ServerBuilder::new().with_metrics(metrics.clone()).build()?;
//!
//! // Prometheus text format
//! let output = metrics.gather();
//! ```

use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};

/// Session layer metrics.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,

    // Sessions
    /// Sessions currently connected.
    pub sessions_active: IntGauge,
    /// Sessions created.
    pub sessions_total: IntCounter,
    /// Sessions that reached `disconnect`.
    pub disconnects: IntCounter,

    // Connections
    /// Physical connections currently attached.
    pub connections_attached: IntGauge,
    /// Connections closed for exceeding the per-session cap.
    pub admissions_rejected: IntCounter,
    /// Connections that closed or timed out before identifying.
    pub handshakes_abandoned: IntCounter,

    // Packets
    /// Packets handed to a transport.
    pub packets_dispatched: IntCounter,
    /// Packets moved to the retry queue.
    pub packets_retried: IntCounter,
    /// Inbound events delivered to listeners.
    pub packets_delivered: IntCounter,
    /// Inbound packets dropped as duplicates.
    pub duplicates_dropped: IntCounter,
    /// Dispatches reclaimed by the ack timeout.
    pub ack_timeouts: IntCounter,
}

fn gauge(registry: &Registry, name: &str, help: &str) -> prometheus::Result<IntGauge> {
    let gauge = IntGauge::new(name, help)?;
    registry.register(Box::new(gauge.clone()))?;
    Ok(gauge)
}

fn counter(registry: &Registry, name: &str, help: &str) -> prometheus::Result<IntCounter> {
    let counter = IntCounter::new(name, help)?;
    registry.register(Box::new(counter.clone()))?;
    Ok(counter)
}

impl Metrics {
    /// Create a new metrics instance with all metrics registered.
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();
        Ok(Self {
            sessions_active: gauge(&registry, "vsession_sessions_active", "Sessions currently connected")?,
            sessions_total: counter(&registry, "vsession_sessions_total", "Sessions created")?,
            disconnects: counter(&registry, "vsession_disconnects_total", "Sessions disconnected")?,
            connections_attached: gauge(
                &registry,
                "vsession_connections_attached",
                "Physical connections attached to sessions",
            )?,
            admissions_rejected: counter(
                &registry,
                "vsession_admissions_rejected_total",
                "Connections rejected at the per-session cap",
            )?,
            handshakes_abandoned: counter(
                &registry,
                "vsession_handshakes_abandoned_total",
                "Connections lost before identifying",
            )?,
            packets_dispatched: counter(&registry, "vsession_packets_dispatched_total", "Packets sent")?,
            packets_retried: counter(&registry, "vsession_packets_retried_total", "Packets queued for retry")?,
            packets_delivered: counter(
                &registry,
                "vsession_packets_delivered_total",
                "Inbound events delivered in order",
            )?,
            duplicates_dropped: counter(
                &registry,
                "vsession_duplicates_dropped_total",
                "Duplicate inbound packets dropped",
            )?,
            ack_timeouts: counter(&registry, "vsession_ack_timeouts_total", "Dispatches reclaimed after ack timeout")?,
            registry,
        })
    }

    /// Get the Prometheus registry.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Gather all metrics in Prometheus text format.
    pub fn gather(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if encoder.encode(&metric_families, &mut buffer).is_err() {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = Metrics::new().unwrap();
        metrics.sessions_active.set(3);
        metrics.packets_dispatched.inc_by(5);
        let output = metrics.gather();
        assert!(output.contains("vsession_sessions_active 3"));
        assert!(output.contains("vsession_packets_dispatched_total 5"));
    }
}
