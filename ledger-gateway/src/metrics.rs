//! Metrics collection for observability
//!
//! Prometheus metrics for monitoring the gateway. Each instance owns its
//! registry so several gateways can live in one process.
//!
//! # Metrics
//!
//! - `gateway_ledgers_processed_total` - Ledgers delivered to subscribers
//! - `gateway_ledgers_backfilled_total` - Ledgers fetched to fill gaps
//! - `gateway_gaps_unresolved_total` - Gaps that could not be backfilled
//! - `gateway_records_ingested_total` - Account records written
//! - `gateway_submissions_total` - Blobs handed to the network
//! - `gateway_resolutions_total{outcome}` - Terminal transaction outcomes
//! - `gateway_reconnect_attempts_total` - Session attempts after the first
//! - `gateway_connection_state` - Current connection state (numeric)
//! - `gateway_ledger_processing_seconds` - Time spent delivering one ledger

use crate::types::{ConnectionState, TransactionState};
use prometheus::{
    Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
};
use std::sync::Arc;

/// Metrics collector
#[derive(Clone)]
pub struct Metrics {
    /// Ledgers delivered to subscribers
    pub ledgers_processed: IntCounter,

    /// Ledgers fetched to fill gaps
    pub ledgers_backfilled: IntCounter,

    /// Gaps given up on
    pub gaps_unresolved: IntCounter,

    /// Account records written
    pub records_ingested: IntCounter,

    /// Submissions handed to the network
    pub submissions_total: IntCounter,

    /// Terminal outcomes by label
    pub resolutions: IntCounterVec,

    /// Reconnect attempts
    pub reconnect_attempts: IntCounter,

    /// Connection state gauge
    pub connection_state: IntGauge,

    /// Ledger delivery latency
    pub ledger_processing: Histogram,

    /// Prometheus registry
    pub registry: Arc<Registry>,
}

impl Metrics {
    /// Create new metrics collector
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let ledgers_processed = IntCounter::new(
            "gateway_ledgers_processed_total",
            "Ledgers delivered to subscribers",
        )?;
        registry.register(Box::new(ledgers_processed.clone()))?;

        let ledgers_backfilled = IntCounter::new(
            "gateway_ledgers_backfilled_total",
            "Ledgers fetched to fill gaps",
        )?;
        registry.register(Box::new(ledgers_backfilled.clone()))?;

        let gaps_unresolved = IntCounter::new(
            "gateway_gaps_unresolved_total",
            "Ledger gaps that could not be backfilled",
        )?;
        registry.register(Box::new(gaps_unresolved.clone()))?;

        let records_ingested = IntCounter::new(
            "gateway_records_ingested_total",
            "Account transaction records written",
        )?;
        registry.register(Box::new(records_ingested.clone()))?;

        let submissions_total = IntCounter::new(
            "gateway_submissions_total",
            "Signed blobs handed to the network",
        )?;
        registry.register(Box::new(submissions_total.clone()))?;

        let resolutions = IntCounterVec::new(
            Opts::new(
                "gateway_resolutions_total",
                "Pending transactions reaching a terminal state",
            ),
            &["outcome"],
        )?;
        registry.register(Box::new(resolutions.clone()))?;

        let reconnect_attempts = IntCounter::new(
            "gateway_reconnect_attempts_total",
            "Session attempts after a failure",
        )?;
        registry.register(Box::new(reconnect_attempts.clone()))?;

        let connection_state = IntGauge::new(
            "gateway_connection_state",
            "Connection state (0 disconnected .. 4 errored)",
        )?;
        registry.register(Box::new(connection_state.clone()))?;

        let ledger_processing = Histogram::with_opts(
            HistogramOpts::new(
                "gateway_ledger_processing_seconds",
                "Time spent delivering one ledger to subscribers",
            )
            .buckets(vec![0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.0]),
        )?;
        registry.register(Box::new(ledger_processing.clone()))?;

        Ok(Self {
            ledgers_processed,
            ledgers_backfilled,
            gaps_unresolved,
            records_ingested,
            submissions_total,
            resolutions,
            reconnect_attempts,
            connection_state,
            ledger_processing,
            registry,
        })
    }

    /// Record a terminal transition
    pub fn record_resolution(&self, state: &TransactionState) {
        self.resolutions.with_label_values(&[state.label()]).inc();
    }

    /// Update connection state gauge
    pub fn set_connection_state(&self, state: ConnectionState) {
        self.connection_state.set(state as i64);
    }

    /// Get metrics registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FailureReason;

    #[test]
    fn test_metrics_creation() {
        let metrics = Metrics::new().unwrap();
        assert_eq!(metrics.ledgers_processed.get(), 0);
        assert_eq!(metrics.submissions_total.get(), 0);
    }

    #[test]
    fn test_independent_registries() {
        let first = Metrics::new().unwrap();
        let second = Metrics::new().unwrap();
        first.records_ingested.inc_by(3);
        assert_eq!(first.records_ingested.get(), 3);
        assert_eq!(second.records_ingested.get(), 0);
    }

    #[test]
    fn test_record_resolution() {
        let metrics = Metrics::new().unwrap();
        metrics.record_resolution(&TransactionState::Validated);
        metrics.record_resolution(&TransactionState::Failed(FailureReason::Superseded));
        metrics.record_resolution(&TransactionState::Validated);

        assert_eq!(metrics.resolutions.with_label_values(&["validated"]).get(), 2);
        assert_eq!(metrics.resolutions.with_label_values(&["superseded"]).get(), 1);
    }

    #[test]
    fn test_connection_state_gauge() {
        let metrics = Metrics::new().unwrap();
        metrics.set_connection_state(ConnectionState::Confirmed);
        assert_eq!(metrics.connection_state.get(), 3);
        assert_eq!(metrics.registry().gather().len(), 9);
    }
}
