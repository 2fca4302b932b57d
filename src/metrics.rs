//! Reconcile metrics
//!
//! Exposed in the Prometheus text format by the metrics server in `main.rs`.

use crate::error::Result;
use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder};
use std::time::Duration;

/// Outcome label for failed passes
pub const OUTCOME_ERROR: &str = "error";

/// Metrics recorded by the dispatcher
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    /// Passes by controller and outcome
    reconcile_total: IntCounterVec,
    /// Pass duration by controller
    reconcile_duration: HistogramVec,
}

impl Metrics {
    /// Create metrics registered in a fresh registry
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let reconcile_total = IntCounterVec::new(
            Opts::new("kit_reconcile_total", "Reconcile passes by controller and outcome"),
            &["controller", "outcome"],
        )?;
        let reconcile_duration = HistogramVec::new(
            HistogramOpts::new(
                "kit_reconcile_duration_seconds",
                "Duration of reconcile passes",
            )
            .buckets(vec![0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
            &["controller"],
        )?;

        registry.register(Box::new(reconcile_total.clone()))?;
        registry.register(Box::new(reconcile_duration.clone()))?;

        Ok(Self {
            registry,
            reconcile_total,
            reconcile_duration,
        })
    }

    /// Record one pass
    pub fn record(&self, controller: &str, outcome: &str, elapsed: Duration) {
        self.reconcile_total
            .with_label_values(&[controller, outcome])
            .inc();
        self.reconcile_duration
            .with_label_values(&[controller])
            .observe(elapsed.as_secs_f64());
    }

    /// Passes recorded so far for a controller and outcome
    pub fn reconcile_count(&self, controller: &str, outcome: &str) -> u64 {
        self.reconcile_total
            .with_label_values(&[controller, outcome])
            .get()
    }

    /// Encode every metric in the text exposition format
    pub fn encode(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| crate::error::Error::Internal(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_encode() {
        let metrics = Metrics::new().unwrap();
        metrics.record("autoscaling-group", "created", Duration::from_millis(20));
        metrics.record("autoscaling-group", "created", Duration::from_millis(30));
        metrics.record("nat-gateway", OUTCOME_ERROR, Duration::from_millis(5));

        assert_eq!(metrics.reconcile_count("autoscaling-group", "created"), 2);
        assert_eq!(metrics.reconcile_count("nat-gateway", OUTCOME_ERROR), 1);

        let text = metrics.encode().unwrap();
        assert!(text.contains("kit_reconcile_total"));
        assert!(text.contains("kit_reconcile_duration_seconds_bucket"));
    }
}
