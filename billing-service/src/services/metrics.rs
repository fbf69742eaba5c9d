//! Prometheus metrics for billing-service.

use once_cell::sync::Lazy;
use prometheus::{
    histogram_opts, opts, register_counter_vec, register_histogram_vec, register_int_counter_vec,
    CounterVec, Encoder, HistogramVec, IntCounterVec, TextEncoder,
};
use std::sync::OnceLock;

/// Database query duration histogram
pub static DB_QUERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        histogram_opts!(
            "billing_db_query_duration_seconds",
            "Database query duration"
        ),
        &["operation"]
    )
    .expect("Failed to register DB_QUERY_DURATION")
});

/// Billing attempts by provider and outcome (approved, declined, transient, error)
pub static BILLING_ATTEMPTS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Billing runs by type and status
pub static BILLING_RUNS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Collected amount by currency
pub static PAYMENT_AMOUNT_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Subscription status transitions
pub static SUBSCRIPTION_TRANSITIONS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Webhook events by provider and result
pub static WEBHOOK_EVENTS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Provider call latency
pub static PROVIDER_REQUEST_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Error counter for alerting
pub static ERRORS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Initialize all metrics. Call once at startup.
pub fn init_metrics() {
    BILLING_ATTEMPTS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "billing_attempts_total",
                "Billing attempts by provider and outcome"
            ),
            &["provider", "outcome"]
        )
        .expect("Failed to register BILLING_ATTEMPTS_TOTAL")
    });

    BILLING_RUNS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!("billing_runs_total", "Total billing runs by type and status"),
            &["run_type", "status"]
        )
        .expect("Failed to register BILLING_RUNS_TOTAL")
    });

    PAYMENT_AMOUNT_TOTAL.get_or_init(|| {
        register_counter_vec!(
            opts!(
                "billing_payment_amount_total",
                "Total collected amount by currency and source"
            ),
            &["currency", "source"]
        )
        .expect("Failed to register PAYMENT_AMOUNT_TOTAL")
    });

    SUBSCRIPTION_TRANSITIONS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "billing_subscription_transitions_total",
                "Subscription status transitions"
            ),
            &["from", "to"]
        )
        .expect("Failed to register SUBSCRIPTION_TRANSITIONS_TOTAL")
    });

    WEBHOOK_EVENTS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!("billing_webhook_events_total", "Webhook events received"),
            &["provider", "result"]
        )
        .expect("Failed to register WEBHOOK_EVENTS_TOTAL")
    });

    // Provider APIs are slow compared to the database
    PROVIDER_REQUEST_DURATION.get_or_init(|| {
        register_histogram_vec!(
            histogram_opts!(
                "billing_provider_request_duration_seconds",
                "Payment provider call duration",
                vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]
            ),
            &["provider", "operation"]
        )
        .expect("Failed to register PROVIDER_REQUEST_DURATION")
    });

    ERRORS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!("billing_errors_total", "Total errors by type for alerting"),
            &["error_type", "operation"]
        )
        .expect("Failed to register ERRORS_TOTAL")
    });

    let _ = &*DB_QUERY_DURATION;
}

/// Get metrics in Prometheus text format.
pub fn get_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

pub fn record_billing_attempt(provider: &str, outcome: &str) {
    if let Some(counter) = BILLING_ATTEMPTS_TOTAL.get() {
        counter.with_label_values(&[provider, outcome]).inc();
    }
}

pub fn record_billing_run(run_type: &str, status: &str) {
    if let Some(counter) = BILLING_RUNS_TOTAL.get() {
        counter.with_label_values(&[run_type, status]).inc();
    }
}

/// Record a collected amount. `source` is subscription or order.
pub fn record_payment_amount(currency: &str, source: &str, amount: f64) {
    if let Some(counter) = PAYMENT_AMOUNT_TOTAL.get() {
        counter
            .with_label_values(&[currency, source])
            .inc_by(amount.abs());
    }
}

pub fn record_subscription_transition(from: &str, to: &str) {
    if from == to {
        return;
    }
    if let Some(counter) = SUBSCRIPTION_TRANSITIONS_TOTAL.get() {
        counter.with_label_values(&[from, to]).inc();
    }
}

pub fn record_webhook_event(provider: &str, result: &str) {
    if let Some(counter) = WEBHOOK_EVENTS_TOTAL.get() {
        counter.with_label_values(&[provider, result]).inc();
    }
}

pub fn record_provider_duration(provider: &str, operation: &str, duration_secs: f64) {
    if let Some(histogram) = PROVIDER_REQUEST_DURATION.get() {
        histogram
            .with_label_values(&[provider, operation])
            .observe(duration_secs);
    }
}

/// Record an error for alerting.
pub fn record_error(error_type: &str, operation: &str) {
    if let Some(counter) = ERRORS_TOTAL.get() {
        counter.with_label_values(&[error_type, operation]).inc();
    }
}
