use std::net::SocketAddr;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "roomd_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "roomd_query_duration_seconds";

/// Counter: reservations rejected by the overlap check.
pub const BOOKING_CONFLICTS_TOTAL: &str = "roomd_booking_conflicts_total";

/// Counter: in-progress bookings auto-completed by the sweeper.
pub const BOOKINGS_SWEPT_TOTAL: &str = "roomd_bookings_swept_total";

/// Counter: inbox notices delivered. Labels: kind.
pub const NOTICES_DELIVERED_TOTAL: &str = "roomd_notices_delivered_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "roomd_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "roomd_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "roomd_connections_rejected_total";

/// Gauge: number of active tenants (loaded engines).
pub const TENANTS_ACTIVE: &str = "roomd_tenants_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "roomd_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "roomd_wal_flush_batch_size";

/// Install the Prometheus exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertRoom { .. } => "insert_room",
        Command::UpdateRoom { .. } => "update_room",
        Command::DeleteRoom { .. } => "delete_room",
        Command::SelectRoom { .. } => "select_room",
        Command::SelectRooms { .. } => "select_rooms",
        Command::InsertBooking(_) => "insert_booking",
        Command::UpdateBookingStatus { .. } => "update_booking",
        Command::DeleteBooking { .. } => "delete_booking",
        Command::SelectBookings { .. } => "select_bookings",
        Command::Occupy { .. } => "occupy",
        Command::Unoccupy { .. } => "unoccupy",
        Command::SelectFreeWindows { .. } => "select_free_windows",
        Command::SelectNotifications { .. } => "select_notifications",
        Command::MarkNotificationsSeen { .. } => "mark_notifications_seen",
        Command::SelectSettings { .. } => "select_settings",
        Command::UpdateSettings { .. } => "update_settings",
        Command::ResetSettings { .. } => "reset_settings",
        Command::Listen { .. } => "listen",
        Command::Unlisten { .. } => "unlisten",
    }
}
