use std::net::SocketAddr;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

use crate::model::AllocationOutcome;
use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "parkline_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "parkline_query_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "parkline_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "parkline_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "parkline_connections_rejected_total";

/// Gauge: number of active tenants (loaded facilities).
pub const TENANTS_ACTIVE: &str = "parkline_tenants_active";

/// Gauge: occupied slots, summed over all tenants.
pub const SLOTS_OCCUPIED: &str = "parkline_slots_occupied";

// ── Domain metrics ──────────────────────────────────────────────

/// Counter: allocation attempts. Labels: outcome.
pub const ALLOCATIONS_TOTAL: &str = "parkline_allocations_total";

/// Counter: successful cancellations.
pub const CANCELLATIONS_TOTAL: &str = "parkline_cancellations_total";

/// Counter: vehicles that left their slot.
pub const DEPARTURES_TOTAL: &str = "parkline_departures_total";

/// Counter: rollback records popped. Labels: result (applied, skipped).
pub const ROLLBACK_RECORDS_TOTAL: &str = "parkline_rollback_records_total";

/// Counter: events dropped because a listener fell behind.
pub const NOTIFICATIONS_LAGGED_TOTAL: &str = "parkline_notifications_lagged_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
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
        Command::SubmitRequest { .. } => "submit_request",
        Command::CancelRequest { .. } => "cancel_request",
        Command::LeaveParking { .. } => "leave_parking",
        Command::Rollback { .. } => "rollback",
        Command::SelectZones => "select_zones",
        Command::SelectSlots { .. } => "select_slots",
        Command::SelectRequests { .. } => "select_requests",
        Command::SelectHistory => "select_history",
        Command::SelectAnalytics => "select_analytics",
        Command::SelectZoneUtilization => "select_zone_utilization",
        Command::Listen { .. } => "listen",
        Command::Unlisten { .. } => "unlisten",
        Command::UnlistenAll => "unlisten_all",
    }
}

pub fn outcome_label(outcome: &AllocationOutcome) -> &'static str {
    match outcome {
        AllocationOutcome::Allocated {
            cross_zone: false, ..
        } => "local",
        AllocationOutcome::Allocated {
            cross_zone: true, ..
        } => "cross_zone",
        AllocationOutcome::Failed(reason) => reason.as_str(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::AllocationFailure;

    #[test]
    fn outcome_labels() {
        let local = AllocationOutcome::Allocated {
            slot_id: 1,
            zone_id: 1,
            cross_zone: false,
        };
        let cross = AllocationOutcome::Allocated {
            slot_id: 3,
            zone_id: 2,
            cross_zone: true,
        };
        assert_eq!(outcome_label(&local), "local");
        assert_eq!(outcome_label(&cross), "cross_zone");
        assert_eq!(
            outcome_label(&AllocationOutcome::Failed(AllocationFailure::NoCapacity)),
            "no_capacity"
        );
    }

    #[test]
    fn init_without_port_is_noop() {
        assert!(init(None).is_ok());
    }
}
