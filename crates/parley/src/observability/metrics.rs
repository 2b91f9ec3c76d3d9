//! Metrics definitions for the Parley SDK.
//!
//! All metrics follow Prometheus naming conventions with a `parley_` prefix;
//! counters end in `_total`, duration histograms in `_seconds`. The embedding
//! process installs its own recorder/exporter; the SDK only records.
//!
//! # Cardinality
//!
//! Labels are bounded:
//! - `operation`: one value per exposed SDK operation (~15)
//! - `query`: one value per storage method (~25)
//! - `outcome`: success | error
//! - `category`: the bounded error taxonomy labels
//! - `kind`: the four context kinds

use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Record a storage query with its outcome and duration.
///
/// Metrics: `parley_store_queries_total`, `parley_store_query_seconds`
pub fn record_store_query(query: &'static str, outcome: &'static str, duration: Duration) {
    counter!("parley_store_queries_total", "query" => query, "outcome" => outcome).increment(1);
    histogram!("parley_store_query_seconds", "query" => query).record(duration.as_secs_f64());
}

/// Record an exposed SDK operation with its outcome and duration.
///
/// Metrics: `parley_operations_total`, `parley_operation_seconds`
pub fn record_operation(operation: &'static str, outcome: &'static str, duration: Duration) {
    counter!("parley_operations_total", "operation" => operation, "outcome" => outcome)
        .increment(1);
    histogram!("parley_operation_seconds", "operation" => operation)
        .record(duration.as_secs_f64());
}

/// Record a lock acquisition attempt.
///
/// Metric: `parley_lock_acquisitions_total`
pub fn record_lock_acquisition(outcome: &'static str, wait: Duration) {
    counter!("parley_lock_acquisitions_total", "outcome" => outcome).increment(1);
    histogram!("parley_lock_wait_seconds").record(wait.as_secs_f64());
}

/// Record a handler invocation.
///
/// Metric: `parley_handler_invocations_total`
/// Labels: `kind` (context kind), `mode` (sync | async), `outcome`
pub fn record_handler_invocation(kind: &'static str, mode: &'static str, outcome: &'static str) {
    counter!(
        "parley_handler_invocations_total",
        "kind" => kind,
        "mode" => mode,
        "outcome" => outcome
    )
    .increment(1);
}

/// Set the number of callers currently parked on a wait primitive.
///
/// Metric: `parley_parked_waiters`
pub fn set_parked_waiters(count: u64) {
    // u64 to f64 conversion is safe for realistic waiter counts (< 2^53)
    #[allow(clippy::cast_precision_loss)]
    gauge!("parley_parked_waiters").set(count as f64);
}

/// Record an emitted lifecycle event.
///
/// Metric: `parley_events_emitted_total`
pub fn record_event_emitted(kind: &'static str) {
    counter!("parley_events_emitted_total", "kind" => kind).increment(1);
}
