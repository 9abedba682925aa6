use ulid::Ulid;

use crate::limits::MAX_NOTES_LEN;
use crate::model::*;

use super::{EngineError, Rejection};

pub(crate) fn validate_span(start: Timestamp, end: Timestamp) -> Result<Span, EngineError> {
    Span::try_new(start, end).ok_or(EngineError::InvalidState(Rejection::InvalidTimeRange))
}

pub(crate) fn validate_notes(notes: Option<&str>) -> Result<(), EngineError> {
    match notes {
        Some(n) if n.len() > MAX_NOTES_LEN => Err(EngineError::LimitExceeded("notes too long")),
        _ => Ok(()),
    }
}

/// The appointment must sit inside the slot's working window on the slot's date.
pub(crate) fn check_within_slot(slot: &ScheduleSlot, span: &Span) -> Result<(), EngineError> {
    if slot.window().contains_span(span) {
        Ok(())
    } else {
        Err(Rejection::OutsideWorkingHours.into())
    }
}

/// Reject `span` if it overlaps any appointment in the calendar other than
/// `ignore`. Every status counts, including open and cancelled appointments.
pub(crate) fn check_no_conflict(
    cal: &DoctorCalendar,
    span: &Span,
    ignore: Option<Ulid>,
) -> Result<(), EngineError> {
    match cal.overlapping(span).find(|a| Some(a.id) != ignore) {
        Some(existing) => Err(Rejection::TimeConflict(existing.id).into()),
        None => Ok(()),
    }
}

/// Patient present exactly when the status is a claimed one.
pub(crate) fn check_status_matches_patient(appointment: &Appointment) -> Result<(), EngineError> {
    if appointment.status.is_claimed() == appointment.patient_id.is_some() {
        Ok(())
    } else {
        Err(Rejection::StatusMismatch(appointment.status).into())
    }
}
