//! Metrics module
//!
//! Prometheus collectors for discovery runs and inventory changes, held in
//! a private registry so tests and embedders do not share global state.

use prometheus::{Encoder, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

use crate::error::{Error, Result};
use crate::inventory::ChangeSet;

/// Run outcome label values.
pub mod outcome {
    pub const COMMITTED: &str = "committed";
    pub const ABORTED: &str = "aborted";
    pub const CANCELLED: &str = "cancelled";
    pub const SUPERSEDED: &str = "superseded";
    pub const TIMED_OUT: &str = "timed_out";
    pub const STORE_ERROR: &str = "store_error";
}

#[derive(Debug, Clone)]
pub struct DiscoveryMetrics {
    registry: Registry,
    runs_total: IntCounterVec,
    active_runs: IntGauge,
    inventory_changes_total: IntCounterVec,
    fetch_failures_total: IntCounterVec,
}

fn metric_error(e: prometheus::Error) -> Error {
    Error::Internal(format!("metrics registration failed: {}", e))
}

impl DiscoveryMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let runs_total = IntCounterVec::new(
            Opts::new("hsm_discovery_runs_total", "Finished discovery runs by outcome"),
            &["outcome"],
        )
        .map_err(metric_error)?;
        let active_runs = IntGauge::new(
            "hsm_discovery_active_runs",
            "Discovery runs currently in flight",
        )
        .map_err(metric_error)?;
        let inventory_changes_total = IntCounterVec::new(
            Opts::new(
                "hsm_inventory_changes_total",
                "Committed component changes by kind of change",
            ),
            &["change"],
        )
        .map_err(metric_error)?;
        let fetch_failures_total = IntCounterVec::new(
            Opts::new(
                "hsm_fetch_failures_total",
                "Resources that failed to fetch or decode during discovery",
            ),
            &["kind"],
        )
        .map_err(metric_error)?;

        registry
            .register(Box::new(runs_total.clone()))
            .map_err(metric_error)?;
        registry
            .register(Box::new(active_runs.clone()))
            .map_err(metric_error)?;
        registry
            .register(Box::new(inventory_changes_total.clone()))
            .map_err(metric_error)?;
        registry
            .register(Box::new(fetch_failures_total.clone()))
            .map_err(metric_error)?;

        Ok(Self {
            registry,
            runs_total,
            active_runs,
            inventory_changes_total,
            fetch_failures_total,
        })
    }

    pub fn run_started(&self) {
        self.active_runs.inc();
    }

    pub fn run_finished(&self, outcome: &str) {
        self.active_runs.dec();
        self.runs_total.with_label_values(&[outcome]).inc();
    }

    pub fn record_changes(&self, changes: &ChangeSet) {
        for (label, count) in [
            ("added", changes.added.len()),
            ("changed", changes.changed.len()),
            ("removed", changes.removed.len()),
        ] {
            if count > 0 {
                self.inventory_changes_total
                    .with_label_values(&[label])
                    .inc_by(count as u64);
            }
        }
    }

    /// Add per-run resource failure counts.
    pub fn record_fetch_failures(&self, fetch_failed: usize, decode_failed: usize) {
        if fetch_failed > 0 {
            self.fetch_failures_total
                .with_label_values(&["fetch"])
                .inc_by(fetch_failed as u64);
        }
        if decode_failed > 0 {
            self.fetch_failures_total
                .with_label_values(&["decode"])
                .inc_by(decode_failed as u64);
        }
    }

    pub fn active_runs(&self) -> i64 {
        self.active_runs.get()
    }

    pub fn runs(&self, outcome: &str) -> u64 {
        self.runs_total.with_label_values(&[outcome]).get()
    }

    /// Text exposition of every collector.
    pub fn encode(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| Error::Internal(format!("metrics encoding failed: {}", e)))?;
        String::from_utf8(buffer).map_err(|e| Error::Internal(e.to_string()))
    }
}
