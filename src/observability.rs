use std::net::SocketAddr;

use tracing_subscriber::EnvFilter;

use crate::engine::Action;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: protocol requests handled. Labels: op, status.
pub const REQUESTS_TOTAL: &str = "slotwise_requests_total";

/// Histogram: request latency in seconds. Labels: op.
pub const REQUEST_DURATION_SECONDS: &str = "slotwise_request_duration_seconds";

// ── Scheduling ──────────────────────────────────────────────────

/// Counter: booking attempts. Labels: outcome (requested, conflict, rejected).
pub const BOOKINGS_TOTAL: &str = "slotwise_bookings_total";

/// Counter: applied state transitions. Labels: action.
pub const TRANSITIONS_TOTAL: &str = "slotwise_transitions_total";

/// Counter: transitions refused because the new time was taken. Labels: action.
pub const CONFLICTS_TOTAL: &str = "slotwise_conflicts_total";

/// Counter: appointments expired by the sweep.
pub const EXPIRED_TOTAL: &str = "slotwise_expired_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "slotwise_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "slotwise_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "slotwise_connections_rejected_total";

/// Counter: failed operator `hello`s.
pub const AUTH_FAILURES_TOTAL: &str = "slotwise_auth_failures_total";

/// Histogram: journal group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "slotwise_wal_flush_duration_seconds";

/// Histogram: records per group-commit flush.
pub const WAL_FLUSH_BATCH_SIZE: &str = "slotwise_wal_flush_batch_size";

/// Counter: appends abandoned after the write timeout.
pub const WAL_WRITE_TIMEOUTS_TOTAL: &str = "slotwise_wal_write_timeouts_total";

/// Counter: completed journal compactions.
pub const WAL_COMPACTIONS_TOTAL: &str = "slotwise_wal_compactions_total";

/// Install the fmt subscriber. `RUST_LOG` overrides the default `info` level.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init_metrics(port: Option<u16>) -> Result<(), Box<dyn std::error::Error>> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Short metric label for a state-machine action.
pub fn action_label(action: &Action) -> &'static str {
    match action {
        Action::ProposeTime { .. } => "propose",
        Action::AcceptAdjustment => "accept",
        Action::RejectAdjustment => "reject",
        Action::Approve => "approve",
        Action::RequestPayment { .. } => "request_payment",
        Action::PaymentReceived => "payment_received",
        Action::Expire => "expire",
        Action::Cancel => "cancel",
    }
}
