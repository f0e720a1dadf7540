//! Metrics for observability.
//!
//! Recorded through the `metrics` facade; install any recorder (for
//! example a Prometheus exporter) in the host binary to collect them.
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `docrepl_`:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track durations in seconds
//!
//! # Usage
//!
//! ```rust,no_run
//! use doc_replication_engine::metrics;
//! use std::time::Duration;
//!
//! metrics::record_rows_imported("app.users", "full", 1000);
//! metrics::record_event_applied("app.users", "insert", Duration::from_millis(3));
//! ```

use metrics::{counter, gauge, histogram};
use std::time::Duration;

// =============================================================================
// Import
// =============================================================================

/// Rows written by the bulk importer.
pub fn record_rows_imported(namespace: &str, mode: &str, count: u64) {
    counter!(
        "docrepl_import_rows_total",
        "namespace" => namespace.to_string(),
        "mode" => mode.to_string()
    )
    .increment(count);
}

/// One batch loaded (by COPY or by row fallback).
pub fn record_import_batch(namespace: &str, method: &str, duration: Duration) {
    counter!(
        "docrepl_import_batches_total",
        "namespace" => namespace.to_string(),
        "method" => method.to_string()
    )
    .increment(1);
    histogram!("docrepl_import_batch_duration_seconds", "namespace" => namespace.to_string())
        .record(duration.as_secs_f64());
}

/// COPY rejected a batch and row-level writes took over.
pub fn record_bulk_fallback(namespace: &str) {
    counter!("docrepl_import_bulk_fallbacks_total", "namespace" => namespace.to_string()).increment(1);
}

/// A document skipped during import.
pub fn record_row_skipped(namespace: &str, reason: &str) {
    counter!(
        "docrepl_import_rows_skipped_total",
        "namespace" => namespace.to_string(),
        "reason" => reason.to_string()
    )
    .increment(1);
}

/// Namespace import finished.
pub fn record_import_complete(namespace: &str, mode: &str, duration: Duration) {
    histogram!(
        "docrepl_import_duration_seconds",
        "namespace" => namespace.to_string(),
        "mode" => mode.to_string()
    )
    .record(duration.as_secs_f64());
}

// =============================================================================
// Change feed
// =============================================================================

/// One change applied to the target.
pub fn record_event_applied(namespace: &str, kind: &str, duration: Duration) {
    counter!(
        "docrepl_feed_events_applied_total",
        "namespace" => namespace.to_string(),
        "kind" => kind.to_string()
    )
    .increment(1);
    histogram!("docrepl_feed_apply_duration_seconds", "kind" => kind.to_string())
        .record(duration.as_secs_f64());
}

/// Change not applied (unknown namespace, delete policy, unrecognized...).
pub fn record_event_ignored(reason: &str) {
    counter!("docrepl_feed_events_ignored_total", "reason" => reason.to_string()).increment(1);
}

/// Delete or upsert that matched an unexpected number of rows.
pub fn record_row_count_anomaly(namespace: &str, operation: &str) {
    counter!(
        "docrepl_feed_row_count_anomalies_total",
        "namespace" => namespace.to_string(),
        "operation" => operation.to_string()
    )
    .increment(1);
}

/// Seconds between an event's cluster time and now.
pub fn set_feed_lag_seconds(lag_seconds: f64) {
    gauge!("docrepl_feed_lag_seconds").set(lag_seconds);
}

// =============================================================================
// Reconciliation
// =============================================================================

/// Rows removed by deletion reconciliation.
pub fn record_reconcile_deleted(namespace: &str, strategy: &str, count: u64) {
    counter!(
        "docrepl_reconcile_deleted_total",
        "namespace" => namespace.to_string(),
        "strategy" => strategy.to_string()
    )
    .increment(count);
}

/// Operation log entries scanned during log replay.
pub fn record_oplog_scanned(count: u64) {
    counter!("docrepl_reconcile_oplog_entries_total").increment(count);
}

/// Namespace skipped by reconciliation.
pub fn record_reconcile_skipped(namespace: &str, reason: &str) {
    counter!(
        "docrepl_reconcile_skipped_total",
        "namespace" => namespace.to_string(),
        "reason" => reason.to_string()
    )
    .increment(1);
}

// =============================================================================
// Cursor store
// =============================================================================

/// Record cursor flush batch (debounced writes).
pub fn record_cursor_flush(flushed: usize, errors: usize) {
    counter!("docrepl_cursor_flushes_total").increment(1);
    counter!("docrepl_cursor_flushed_count").increment(flushed as u64);
    if errors > 0 {
        counter!("docrepl_cursor_flush_errors_total").increment(errors as u64);
    }
}

/// Record cursor SQLite retry (for SQLITE_BUSY/SQLITE_LOCKED).
pub fn cursor_retries_total(operation: &str) {
    counter!("docrepl_cursor_retries_total", "operation" => operation.to_string()).increment(1);
}

// =============================================================================
// Engine
// =============================================================================

/// Record an error by component and kind.
pub fn record_error(component: &str, error_type: &str) {
    counter!(
        "docrepl_errors_total",
        "component" => component.to_string(),
        "error_type" => error_type.to_string()
    )
    .increment(1);
}

/// Number of namespaces under replication.
pub fn set_namespace_count(count: usize) {
    gauge!("docrepl_namespaces").set(count as f64);
}

/// Gauge for engine state.
pub fn set_engine_state(state: &str) {
    let value = match state {
        "Created" => 0.0,
        "Reconciling" => 1.0,
        "Importing" => 2.0,
        "Running" => 3.0,
        "ShuttingDown" => 4.0,
        "Stopped" => 5.0,
        "Failed" => 6.0,
        _ => -1.0,
    };
    gauge!("docrepl_engine_state").set(value);
}
