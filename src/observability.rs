use std::net::SocketAddr;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: bookings created (reserve, reschedule, tentative confirm).
pub const RESERVATIONS_TOTAL: &str = "slotbook_reservations_total";

/// Counter: reservation attempts lost to contention (`SlotTaken`, `Conflict`).
pub const RESERVATION_CONFLICTS_TOTAL: &str = "slotbook_reservation_conflicts_total";

/// Counter: cancel/reschedule attempts rejected by the monthly quota.
pub const QUOTA_REJECTIONS_TOTAL: &str = "slotbook_quota_rejections_total";

// ── Reminder scheduler ──────────────────────────────────────────

/// Counter: reminders delivered and flagged.
pub const REMINDERS_SENT_TOTAL: &str = "slotbook_reminders_sent_total";

/// Counter: reminder deliveries that failed and will be retried.
pub const REMINDER_FAILURES_TOTAL: &str = "slotbook_reminder_failures_total";

// ── Alerting ────────────────────────────────────────────────────

/// Counter: slots observed with more than one confirmed booking. Any
/// non-zero value is a bug and should page.
pub const INTEGRITY_VIOLATIONS_TOTAL: &str = "slotbook_integrity_violations_total";

// ── WAL ─────────────────────────────────────────────────────────

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "slotbook_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "slotbook_wal_flush_batch_size";

/// Install the Prometheus exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .expect("failed to install Prometheus metrics exporter");
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
}
