//! Metrics and observability utilities
//!
//! Prometheus-style metrics for the discovery engine with standardized
//! naming conventions. Without an installed recorder every call is a no-op.

use crate::db::models::QueueStatus;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram, Unit};

/// Metrics prefix for all CiteGraph metrics
pub const METRICS_PREFIX: &str = "citegraph";

/// Buckets for external API latency (in seconds)
pub const FETCH_BUCKETS: &[f64] = &[
    0.050,  // 50ms
    0.100,  // 100ms
    0.250,  // 250ms
    0.500,  // 500ms
    1.000,  // 1s
    2.000,  // 2s
    5.000,  // 5s
    10.00,  // 10s
    30.00,  // 30s
];

/// Register all metric descriptions
pub fn register_metrics() {
    describe_counter!(
        format!("{}_fetch_requests_total", METRICS_PREFIX),
        Unit::Count,
        "Bibliographic API fetches by outcome"
    );

    describe_histogram!(
        format!("{}_fetch_duration_seconds", METRICS_PREFIX),
        Unit::Seconds,
        "Bibliographic API fetch latency in seconds"
    );

    describe_counter!(
        format!("{}_papers_stored_total", METRICS_PREFIX),
        Unit::Count,
        "Paper rows created or refreshed"
    );

    describe_counter!(
        format!("{}_edges_recorded_total", METRICS_PREFIX),
        Unit::Count,
        "Citation edges newly inserted"
    );

    describe_counter!(
        format!("{}_neighbors_enqueued_total", METRICS_PREFIX),
        Unit::Count,
        "Neighbors newly added to the discovery queue"
    );

    describe_counter!(
        format!("{}_queue_transitions_total", METRICS_PREFIX),
        Unit::Count,
        "Queue state transitions by target state"
    );

    describe_counter!(
        format!("{}_leases_reclaimed_total", METRICS_PREFIX),
        Unit::Count,
        "Processing entries reclaimed after lease expiry"
    );

    describe_counter!(
        format!("{}_retry_budget_exhausted_total", METRICS_PREFIX),
        Unit::Count,
        "Entries that became terminally failed"
    );

    describe_gauge!(
        format!("{}_queue_depth", METRICS_PREFIX),
        Unit::Count,
        "Queue entries by status"
    );

    tracing::info!("Metrics registered");
}

/// Record one bibliographic fetch
pub fn record_fetch(duration_secs: f64, outcome: &str) {
    counter!(
        format!("{}_fetch_requests_total", METRICS_PREFIX),
        "outcome" => outcome.to_string()
    )
    .increment(1);

    histogram!(
        format!("{}_fetch_duration_seconds", METRICS_PREFIX),
        "outcome" => outcome.to_string()
    )
    .record(duration_secs);
}

/// Record the graph writes of one completed entry
pub fn record_discovery(papers: u64, edges: u64, enqueued: u64) {
    counter!(format!("{}_papers_stored_total", METRICS_PREFIX)).increment(papers);
    counter!(format!("{}_edges_recorded_total", METRICS_PREFIX)).increment(edges);
    counter!(format!("{}_neighbors_enqueued_total", METRICS_PREFIX)).increment(enqueued);
}

/// Record a queue state transition
pub fn record_transition(to: QueueStatus) {
    counter!(
        format!("{}_queue_transitions_total", METRICS_PREFIX),
        "to" => to.as_str()
    )
    .increment(1);
}

/// Record lease reclaim results
pub fn record_reclaim(requeued: u64, exhausted: u64) {
    counter!(format!("{}_leases_reclaimed_total", METRICS_PREFIX)).increment(requeued + exhausted);
    if exhausted > 0 {
        record_exhausted(exhausted);
    }
}

/// Record entries that ran out of retries
pub fn record_exhausted(count: u64) {
    counter!(format!("{}_retry_budget_exhausted_total", METRICS_PREFIX)).increment(count);
}

/// Publish queue depth per status
pub fn record_queue_depth(status: QueueStatus, depth: u64) {
    gauge!(
        format!("{}_queue_depth", METRICS_PREFIX),
        "status" => status.as_str()
    )
    .set(depth as f64);
}
