//! Prometheus metrics for settlement-service.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::Lazy;
use prometheus::{
    register_counter, register_counter_vec, register_histogram_vec, Counter, CounterVec,
    Encoder, HistogramVec, TextEncoder,
};
use std::sync::OnceLock;

/// Histogram for database query duration by operation.
pub static DB_QUERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "settlement_db_query_duration_seconds",
        "Database query duration in seconds",
        &["operation"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5]
    )
    .expect("Failed to register DB_QUERY_DURATION")
});

/// Counter for processed payments by direction and outcome.
pub static PAYMENTS_PROCESSED: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "settlement_payments_processed_total",
        "Total number of payments processed",
        &["direction", "outcome"]
    )
    .expect("Failed to register PAYMENTS_PROCESSED")
});

/// Counter for debt guard decisions.
pub static GUARD_DECISIONS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "settlement_guard_decisions_total",
        "Total number of debt guard evaluations",
        &["decision"]
    )
    .expect("Failed to register GUARD_DECISIONS")
});

/// Total commission realized for shop owners.
pub static COMMISSION_REALIZED: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "settlement_commission_realized_total",
        "Total commission realized across all shops"
    )
    .expect("Failed to register COMMISSION_REALIZED")
});

/// Counter for balance recomputations by role and whether the balance moved.
pub static BALANCE_RECOMPUTATIONS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "settlement_balance_recomputations_total",
        "Total number of balance recomputations",
        &["role", "changed"]
    )
    .expect("Failed to register BALANCE_RECOMPUTATIONS")
});

/// Counter for reconciliation findings by check.
pub static RECONCILIATION_DISCREPANCIES: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "settlement_reconciliation_discrepancies_total",
        "Total number of reconciliation discrepancies found",
        &["check"]
    )
    .expect("Failed to register RECONCILIATION_DISCREPANCIES")
});

/// Counter for errors.
pub static ERRORS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "settlement_errors_total",
        "Total number of errors",
        &["error_type"]
    )
    .expect("Failed to register ERRORS")
});

/// Recorder behind the `metrics` facade used by the HTTP middleware.
static HTTP_METRICS: OnceLock<Option<PrometheusHandle>> = OnceLock::new();

fn http_metrics() -> Option<&'static PrometheusHandle> {
    HTTP_METRICS
        .get_or_init(|| match PrometheusBuilder::new().install_recorder() {
            Ok(handle) => Some(handle),
            Err(e) => {
                tracing::warn!(error = %e, "HTTP metrics recorder not installed");
                None
            }
        })
        .as_ref()
}

/// Initialize all metrics (forces lazy initialization).
pub fn init_metrics() {
    http_metrics();
    Lazy::force(&DB_QUERY_DURATION);
    Lazy::force(&PAYMENTS_PROCESSED);
    Lazy::force(&GUARD_DECISIONS);
    Lazy::force(&COMMISSION_REALIZED);
    Lazy::force(&BALANCE_RECOMPUTATIONS);
    Lazy::force(&RECONCILIATION_DISCREPANCIES);
    Lazy::force(&ERRORS);
}

/// Get all metrics as Prometheus text format.
pub fn get_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    let mut output = String::from_utf8(buffer).unwrap_or_default();
    if let Some(handle) = http_metrics() {
        output.push_str(&handle.render());
    }
    output
}

/// Record an error.
pub fn record_error(error_type: &str) {
    ERRORS.with_label_values(&[error_type]).inc();
}

pub fn record_payment(direction: &str, outcome: &str) {
    PAYMENTS_PROCESSED
        .with_label_values(&[direction, outcome])
        .inc();
}

pub fn record_guard_decision(decision: &str) {
    GUARD_DECISIONS.with_label_values(&[decision]).inc();
}

pub fn record_commission(amount: f64) {
    if amount > 0.0 {
        COMMISSION_REALIZED.inc_by(amount);
    }
}

pub fn record_recompute(role: &str, changed: bool) {
    BALANCE_RECOMPUTATIONS
        .with_label_values(&[role, if changed { "true" } else { "false" }])
        .inc();
}

pub fn record_discrepancies(check: &str, count: usize) {
    if count > 0 {
        RECONCILIATION_DISCREPANCIES
            .with_label_values(&[check])
            .inc_by(count as f64);
    }
}
