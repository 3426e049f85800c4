//! ---
//! sbus_section: "02-messaging-ipc-data-model"
//! sbus_subsection: "module"
//! sbus_type: "source"
//! sbus_scope: "code"
//! sbus_description: "Envelope model, action dispatch, and wire transports."
//! sbus_version: "v0.0.0-prealpha"
//! sbus_owner: "tbd"
//! ---
use std::time::Duration;

use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry};
use tracing::debug;

use crate::envelope::Envelope;

/// Direction of the envelope movement, used for consistent logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeDirection {
    /// Envelope sent out on behalf of the local user.
    Outbound,
    /// Envelope received from a transport.
    Inbound,
    /// Reply produced by a query handler.
    Reply,
}

/// Emit a structured log entry for envelope activity.
pub fn log_envelope(direction: EnvelopeDirection, transport: &str, envelope: &Envelope) {
    debug!(
        direction = ?direction,
        transport,
        action = envelope.action(),
        origin = envelope.origin(),
        destination = envelope.destination(),
        content_keys = envelope.content().len(),
        metadata_keys = envelope.metadata().len(),
        "envelope activity"
    );
}

/// Prometheus metric handles for bus activity.
#[derive(Clone)]
pub struct BusMetrics {
    sent: IntCounter,
    received: IntCounter,
    dropped: IntCounter,
    handler_failures: IntCounterVec,
    handler_latency: Histogram,
}

impl BusMetrics {
    /// Register bus metrics with the provided registry.
    pub fn register(registry: &Registry) -> Result<Self, prometheus::Error> {
        let sent = IntCounter::with_opts(Opts::new(
            "sbus_envelopes_sent_total",
            "Envelopes handed to a transport",
        ))?;
        let received = IntCounter::with_opts(Opts::new(
            "sbus_envelopes_received_total",
            "Envelopes decoded from a transport",
        ))?;
        let dropped = IntCounter::with_opts(Opts::new(
            "sbus_envelopes_dropped_total",
            "Inbound payloads that could not be decoded or sends that failed",
        ))?;
        let handler_failures = IntCounterVec::new(
            Opts::new(
                "sbus_handler_failures_total",
                "Handler invocations that failed or timed out",
            ),
            &["action"],
        )?;
        let handler_latency = Histogram::with_opts(HistogramOpts::new(
            "sbus_handler_latency_seconds",
            "Time spent inside action handlers",
        ))?;

        registry.register(Box::new(sent.clone()))?;
        registry.register(Box::new(received.clone()))?;
        registry.register(Box::new(dropped.clone()))?;
        registry.register(Box::new(handler_failures.clone()))?;
        registry.register(Box::new(handler_latency.clone()))?;

        Ok(Self {
            sent,
            received,
            dropped,
            handler_failures,
            handler_latency,
        })
    }

    /// Record a sent envelope.
    pub fn observe_sent(&self) {
        self.sent.inc();
    }

    /// Record a received envelope.
    pub fn observe_received(&self) {
        self.received.inc();
    }

    /// Record a dropped payload.
    pub fn observe_dropped(&self) {
        self.dropped.inc();
    }

    /// Record a failed handler invocation.
    pub fn observe_handler_failure(&self, action: &str) {
        self.handler_failures.with_label_values(&[action]).inc();
    }

    /// Record handler latency.
    pub fn observe_handler_latency(&self, duration: Duration) {
        self.handler_latency.observe(duration.as_secs_f64());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_record_counts() {
        let registry = Registry::new();
        let metrics = BusMetrics::register(&registry).expect("register metrics");
        metrics.observe_sent();
        metrics.observe_received();
        metrics.observe_dropped();
        metrics.observe_handler_failure("CONSULTAR_ACAO");
        metrics.observe_handler_latency(Duration::from_millis(10));

        let families = registry.gather();
        assert!(families
            .iter()
            .any(|f| f.get_name() == "sbus_envelopes_sent_total"));
        let failures = families
            .iter()
            .find(|f| f.get_name() == "sbus_handler_failures_total")
            .expect("failure family");
        assert_eq!(failures.get_metric()[0].get_counter().get_value(), 1.0);
    }

    #[test]
    fn double_registration_is_rejected() {
        let registry = Registry::new();
        BusMetrics::register(&registry).expect("first registration");
        assert!(BusMetrics::register(&registry).is_err());
    }
}
