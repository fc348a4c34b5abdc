use anyhow::Result;
use metrics::{describe_counter, describe_gauge, describe_histogram, Counter, Gauge, Histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
pub use metrics_exporter_prometheus::PrometheusHandle;
use once_cell::sync::OnceCell;

/// Global metrics handle to ensure single initialization
static METRICS_HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

/// Active WebSocket connections gauge
pub fn active_connections() -> Gauge {
    metrics::gauge!("active_connections")
}

/// Active REQ subscriptions gauge
pub fn active_subscriptions() -> Gauge {
    metrics::gauge!("active_subscriptions")
}

/// Total inbound events processed counter
pub fn inbound_events_processed() -> Counter {
    metrics::counter!("inbound_events_processed")
}

/// Accepted events by storage class
pub fn events_accepted(class: &'static str) -> Counter {
    metrics::counter!("events_accepted", "class" => class)
}

/// Rejected events by reason prefix
pub fn events_rejected(reason: &'static str) -> Counter {
    metrics::counter!("events_rejected", "reason" => reason)
}

pub fn rate_limit_denials() -> Counter {
    metrics::counter!("rate_limit_denials")
}

/// Connections dropped because their outbound queue was full
pub fn broadcast_overflows() -> Counter {
    metrics::counter!("broadcast_overflows")
}

pub fn admin_commands_applied(kind: &'static str) -> Counter {
    metrics::counter!("admin_commands_applied", "kind" => kind)
}

/// Event processing latency in milliseconds by storage class
pub fn event_latency(class: &'static str) -> Histogram {
    metrics::histogram!("event_latency_ms", "class" => class)
}

/// Sets up the Prometheus recorder and returns a handle that can be used
/// to expose the /metrics endpoint.
pub fn setup_metrics() -> Result<PrometheusHandle, anyhow::Error> {
    if let Some(handle) = METRICS_HANDLE.get() {
        return Ok(handle.clone());
    }

    METRICS_HANDLE
        .get_or_try_init(|| {
            describe_gauge!(
                "active_connections",
                "Number of active WebSocket connections"
            );
            describe_gauge!(
                "active_subscriptions",
                "Number of active REQ subscriptions across all connections"
            );
            describe_counter!(
                "inbound_events_processed",
                "Total number of inbound events processed"
            );
            describe_counter!("events_accepted", "Accepted events by storage class");
            describe_counter!("events_rejected", "Rejected events by reason prefix");
            describe_counter!(
                "rate_limit_denials",
                "Events refused by the per-source rate limiter"
            );
            describe_counter!(
                "broadcast_overflows",
                "Connections closed because their outbound queue overflowed"
            );
            describe_counter!(
                "admin_commands_applied",
                "Admin commands applied to the whitelist or event store"
            );
            describe_histogram!(
                "event_latency_ms",
                "Event processing latency in milliseconds by storage class"
            );

            let builder = PrometheusBuilder::new();
            let handle = builder.install_recorder()?;
            Ok(handle)
        })
        .cloned()
}

/// Label for a rejection reason, taken from its machine-readable prefix.
pub fn rejection_label(reason: &str) -> &'static str {
    match reason.split_once(':').map(|(prefix, _)| prefix) {
        Some("invalid") => "invalid",
        Some("blocked") => "blocked",
        Some("auth-required") => "auth_required",
        Some("rate-limited") => "rate_limited",
        Some("duplicate") => "duplicate",
        Some("unsupported") => "unsupported",
        _ => "error",
    }
}
