//! Prometheus metrics for the connection lifecycle
//!
//! The registry is owned by the host, which decides how (or whether) to
//! expose it. The handler takes an `Option<Arc<Metrics>>` and records
//! transitions, promotions, and diagnostics as they happen.

use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry};

/// All connection metrics in one place
#[derive(Clone)]
pub struct Metrics {
    pub registry: Registry,

    // Lifecycle counters
    pub connects_total: IntCounter,
    pub disconnects_total: IntCounter,
    pub state_transitions_total: IntCounterVec,
    pub promotions_total: IntCounterVec,
    pub diagnostics_total: IntCounterVec,

    // Time Connected was held back for the previous client's Leave
    pub leave_wait_seconds: Histogram,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let connects_total = IntCounter::with_opts(Opts::new(
            "opsync_connects_total",
            "Connections accepted from the transport since startup",
        ))
        .unwrap();

        let disconnects_total = IntCounter::with_opts(Opts::new(
            "opsync_disconnects_total",
            "Connection losses reported by the transport since startup",
        ))
        .unwrap();

        let state_transitions_total = IntCounterVec::new(
            Opts::new(
                "opsync_state_transitions_total",
                "Connection state transitions by target state",
            ),
            &["state"],
        )
        .unwrap();

        let promotions_total = IntCounterVec::new(
            Opts::new(
                "opsync_promotions_total",
                "Promotions to Connected by triggering source",
            ),
            &["source"],
        )
        .unwrap();

        let diagnostics_total = IntCounterVec::new(
            Opts::new(
                "opsync_connection_diagnostics_total",
                "Connection diagnostics by event name",
            ),
            &["event"],
        )
        .unwrap();

        let leave_wait_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "opsync_leave_wait_seconds",
                "Time a promotion waited for the previous client's Leave op",
            )
            .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 15.0, 60.0, 300.0]),
        )
        .unwrap();

        // Register all metrics
        registry
            .register(Box::new(connects_total.clone()))
            .unwrap();
        registry
            .register(Box::new(disconnects_total.clone()))
            .unwrap();
        registry
            .register(Box::new(state_transitions_total.clone()))
            .unwrap();
        registry
            .register(Box::new(promotions_total.clone()))
            .unwrap();
        registry
            .register(Box::new(diagnostics_total.clone()))
            .unwrap();
        registry
            .register(Box::new(leave_wait_seconds.clone()))
            .unwrap();

        Self {
            registry,
            connects_total,
            disconnects_total,
            state_transitions_total,
            promotions_total,
            diagnostics_total,
            leave_wait_seconds,
        }
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
    fn metrics_register_cleanly() {
        let metrics = Metrics::new();
        metrics.connects_total.inc();
        metrics
            .state_transitions_total
            .with_label_values(&["Connected"])
            .inc();
        metrics
            .promotions_total
            .with_label_values(&["timeout"])
            .inc();
        metrics.leave_wait_seconds.observe(0.3);

        let families = metrics.registry.gather();
        assert!(families.iter().any(|f| f.get_name() == "opsync_connects_total"));
        assert!(families
            .iter()
            .any(|f| f.get_name() == "opsync_leave_wait_seconds"));
    }
}
