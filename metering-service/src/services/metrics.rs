//! Metrics module for metering-service.
//! Prometheus metrics for ingestion, limit decisions, provider reporting and webhooks.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::Lazy;
use prometheus::{
    histogram_opts, opts, register_histogram_vec, register_int_counter_vec, Encoder, HistogramVec,
    IntCounterVec, TextEncoder,
};
use std::sync::OnceLock;

/// Database query duration histogram
pub static DB_QUERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        histogram_opts!(
            "metering_db_query_duration_seconds",
            "Database query duration"
        ),
        &["operation"]
    )
    .expect("Failed to register DB_QUERY_DURATION")
});

/// Recorder for the `metrics` facade used by the HTTP middleware
pub static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Accepted usage records (per-tenant metering)
pub static USAGE_RECORDS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Limit evaluator decisions
pub static LIMIT_DECISIONS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Threshold events recorded
pub static THRESHOLD_EVENTS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Usage reports to the billing provider by outcome
pub static PROVIDER_REPORTS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Inbound webhook events by type and outcome
pub static WEBHOOK_EVENTS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Error counter for alerting
pub static ERRORS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Initialize all metrics. Safe to call more than once.
pub fn init_metrics() {
    METRICS_HANDLE.get_or_init(|| {
        PrometheusBuilder::new()
            .install_recorder()
            .expect("failed to install Prometheus recorder")
    });

    USAGE_RECORDS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "metering_usage_records_total",
                "Total accepted usage records by tenant"
            ),
            &["tenant_id"]
        )
        .expect("Failed to register USAGE_RECORDS_TOTAL")
    });

    LIMIT_DECISIONS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "metering_limit_decisions_total",
                "Limit evaluator decisions by action"
            ),
            &["action"]
        )
        .expect("Failed to register LIMIT_DECISIONS_TOTAL")
    });

    THRESHOLD_EVENTS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "metering_threshold_events_total",
                "Usage threshold events by type"
            ),
            &["event_type"]
        )
        .expect("Failed to register THRESHOLD_EVENTS_TOTAL")
    });

    PROVIDER_REPORTS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "metering_provider_reports_total",
                "Usage reports to the billing provider by outcome"
            ),
            &["outcome"]
        )
        .expect("Failed to register PROVIDER_REPORTS_TOTAL")
    });

    WEBHOOK_EVENTS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "metering_webhook_events_total",
                "Billing provider webhook events by type and outcome"
            ),
            &["event_type", "outcome"]
        )
        .expect("Failed to register WEBHOOK_EVENTS_TOTAL")
    });

    ERRORS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!("metering_errors_total", "Total errors by type for alerting"),
            &["error_type", "operation"]
        )
        .expect("Failed to register ERRORS_TOTAL")
    });

    // Force initialization of lazy statics
    let _ = &*DB_QUERY_DURATION;
}

/// Get metrics in Prometheus text format: HTTP metrics from the recorder
/// followed by the service registry.
pub fn get_metrics() -> String {
    let mut output = METRICS_HANDLE
        .get()
        .map(|handle| handle.render())
        .unwrap_or_default();

    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if encoder.encode(&metric_families, &mut buffer).is_ok() {
        if let Ok(custom_metrics) = String::from_utf8(buffer) {
            output.push_str(&custom_metrics);
        }
    }

    output
}

pub fn record_usage_accepted(tenant_id: &str) {
    if let Some(counter) = USAGE_RECORDS_TOTAL.get() {
        counter.with_label_values(&[tenant_id]).inc();
    }
}

pub fn record_limit_decision(action: &str) {
    if let Some(counter) = LIMIT_DECISIONS_TOTAL.get() {
        counter.with_label_values(&[action]).inc();
    }
}

pub fn record_threshold_event(event_type: &str) {
    if let Some(counter) = THRESHOLD_EVENTS_TOTAL.get() {
        counter.with_label_values(&[event_type]).inc();
    }
}

pub fn record_provider_report(outcome: &str) {
    if let Some(counter) = PROVIDER_REPORTS_TOTAL.get() {
        counter.with_label_values(&[outcome]).inc();
    }
}

pub fn record_webhook_event(event_type: &str, outcome: &str) {
    if let Some(counter) = WEBHOOK_EVENTS_TOTAL.get() {
        counter.with_label_values(&[event_type, outcome]).inc();
    }
}

/// Record an error for alerting.
pub fn record_error(error_type: &str, operation: &str) {
    if let Some(counter) = ERRORS_TOTAL.get() {
        counter.with_label_values(&[error_type, operation]).inc();
    }
}
