use std::fmt;

use ulid::Ulid;

use crate::model::AppointmentStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Patient,
    Doctor,
    Schedule,
    Appointment,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EntityKind::Patient => "patient",
            EntityKind::Doctor => "doctor",
            EntityKind::Schedule => "schedule",
            EntityKind::Appointment => "appointment",
        })
    }
}

/// Why a booking operation refused to change state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    InvalidTimeRange,
    /// The schedule exists but is published by a different doctor.
    ForeignSchedule(Ulid),
    ScheduleUnavailable,
    OutsideWorkingHours,
    /// Carries the id of the appointment already holding the time.
    TimeConflict(Ulid),
    AlreadyBooked,
    NotBooked,
    StatusMismatch(AppointmentStatus),
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::InvalidTimeRange => write!(f, "invalid time range: start must be before end"),
            Rejection::ForeignSchedule(id) => write!(f, "schedule {id} belongs to another doctor"),
            Rejection::ScheduleUnavailable => write!(f, "schedule unavailable"),
            Rejection::OutsideWorkingHours => write!(f, "time outside working hours"),
            Rejection::TimeConflict(id) => write!(f, "time slot conflict with appointment {id}"),
            Rejection::AlreadyBooked => write!(f, "slot already booked"),
            Rejection::NotBooked => write!(f, "appointment has no patient; delete it instead"),
            Rejection::StatusMismatch(status) => {
                if status.is_claimed() {
                    write!(f, "status {status} requires a patient")
                } else {
                    write!(f, "status {status} cannot carry a patient")
                }
            }
        }
    }
}

#[derive(Debug)]
pub enum EngineError {
    NotFound { kind: EntityKind, id: Ulid },
    AlreadyExists { kind: EntityKind, id: Ulid },
    InvalidState(Rejection),
    LimitExceeded(&'static str),
    Wal(String),
}

impl EngineError {
    pub fn not_found(kind: EntityKind, id: Ulid) -> Self {
        EngineError::NotFound { kind, id }
    }

    /// Short machine-readable tag, used on the wire and in metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::NotFound { .. } => "not_found",
            EngineError::AlreadyExists { .. } => "already_exists",
            EngineError::InvalidState(_) => "invalid_state",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::Wal(_) => "storage",
        }
    }
}

impl From<Rejection> for EngineError {
    fn from(r: Rejection) -> Self {
        EngineError::InvalidState(r)
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::NotFound { kind, id } => write!(f, "{kind} not found: {id}"),
            EngineError::AlreadyExists { kind, id } => write!(f, "{kind} already exists: {id}"),
            EngineError::InvalidState(reason) => write!(f, "{reason}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::Wal(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
