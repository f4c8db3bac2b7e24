use std::net::SocketAddr;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: booking operations executed. Labels: op, status.
pub const BOOKING_OPS_TOTAL: &str = "rota_booking_ops_total";

/// Counter: rule violations, by rule code.
pub const RULE_VIOLATIONS_TOTAL: &str = "rota_rule_violations_total";

/// Counter: administrative override actions, by action.
pub const OVERRIDES_TOTAL: &str = "rota_overrides_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: slots currently held by the engine.
pub const SLOTS_ACTIVE: &str = "rota_slots_active";

/// Counter: priority grants issued.
pub const GRANTS_ISSUED_TOTAL: &str = "rota_grants_issued_total";

/// Counter: priority grants consumed.
pub const GRANTS_CONSUMED_TOTAL: &str = "rota_grants_consumed_total";

/// Counter: grants and bypasses deleted by the expiry sweep.
pub const EXPIRED_SWEPT_TOTAL: &str = "rota_expired_swept_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "rota_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "rota_wal_flush_batch_size";

/// Install the Prometheus metrics exporter on the given port. No-op if port
/// is None.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .expect("failed to install Prometheus metrics exporter");
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
}
