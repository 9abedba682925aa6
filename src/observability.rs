use std::net::SocketAddr;

use crate::wire::Request;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: operations executed. Labels: op, status.
pub const OPERATIONS_TOTAL: &str = "medislot_operations_total";

/// Histogram: operation latency in seconds. Labels: op.
pub const OPERATION_DURATION_SECONDS: &str = "medislot_operation_duration_seconds";

/// Counter: booking notices handed to the notifier. Labels: outcome.
pub const NOTIFICATIONS_TOTAL: &str = "medislot_notifications_total";

// ── USE metrics (resource utilization) ──────────────────────────

pub const CONNECTIONS_ACTIVE: &str = "medislot_connections_active";
pub const CONNECTIONS_TOTAL: &str = "medislot_connections_total";
pub const CONNECTIONS_REJECTED_TOTAL: &str = "medislot_connections_rejected_total";

pub const WAL_FLUSH_DURATION_SECONDS: &str = "medislot_wal_flush_duration_seconds";

/// Histogram: events per group-commit flush.
pub const WAL_FLUSH_BATCH_SIZE: &str = "medislot_wal_flush_batch_size";

/// Counter: completed WAL compactions.
pub const WAL_COMPACTIONS_TOTAL: &str = "medislot_wal_compactions_total";

/// Install the Prometheus exporter on `port`. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), Box<dyn std::error::Error>> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Short label for a request, used as the `op` metric label.
pub fn request_label(req: &Request) -> &'static str {
    match req {
        Request::RegisterPatient { .. } => "register_patient",
        Request::RegisterDoctor { .. } => "register_doctor",
        Request::PublishSlot { .. } => "publish_slot",
        Request::SetSlotStatus { .. } => "set_slot_status",
        Request::GetPatient { .. } => "get_patient",
        Request::GetDoctor { .. } => "get_doctor",
        Request::GetSlot { .. } => "get_slot",
        Request::ListPatients => "list_patients",
        Request::ListDoctors => "list_doctors",
        Request::ListSlots { .. } => "list_slots",
        Request::CreateAppointment { .. } => "create_appointment",
        Request::BookAppointment { .. } => "book_appointment",
        Request::UpdateAppointment { .. } => "update_appointment",
        Request::CancelAppointment { .. } => "cancel_appointment",
        Request::DeleteAppointment { .. } => "delete_appointment",
        Request::GetAppointment { .. } => "get_appointment",
        Request::ListAppointments => "list_appointments",
        Request::AppointmentsForDoctor { .. } => "appointments_for_doctor",
        Request::AppointmentsForPatient { .. } => "appointments_for_patient",
        Request::AvailableForDoctor { .. } => "available_for_doctor",
    }
}
