use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Clinic-local wall-clock time, the only instant type.
pub type Timestamp = NaiveDateTime;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: Timestamp,
    pub end: Timestamp,
}

impl Span {
    pub fn new(start: Timestamp, end: Timestamp) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    /// `None` unless `start < end`.
    pub fn try_new(start: Timestamp, end: Timestamp) -> Option<Self> {
        (start < end).then_some(Self { start, end })
    }

    /// Touching boundaries do not overlap: `[9, 10)` and `[10, 11)` are disjoint.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Returns true if `self` fully contains `other`.
    pub fn contains_span(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

// ── Directory records ─────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Patient {
    pub id: Ulid,
    pub name: String,
    /// Contact address, used as the notification destination.
    pub email: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Doctor {
    pub id: Ulid,
    pub name: String,
    pub department: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SlotStatus {
    Available,
    Booked,
}

impl fmt::Display for SlotStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SlotStatus::Available => write!(f, "Available"),
            SlotStatus::Booked => write!(f, "Booked"),
        }
    }
}

/// A doctor's declared working window on one calendar date.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleSlot {
    pub id: Ulid,
    pub doctor_id: Ulid,
    pub work_date: NaiveDate,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub status: SlotStatus,
}

impl ScheduleSlot {
    /// The slot's window as absolute timestamps on `work_date`.
    pub fn window(&self) -> Span {
        Span::new(
            self.work_date.and_time(self.start_time),
            self.work_date.and_time(self.end_time),
        )
    }
}

// ── Appointments ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AppointmentStatus {
    /// Open slot offered for booking; never has a patient.
    Available,
    Scheduled,
    Completed,
    #[serde(alias = "Từ chối lịch hẹn")]
    Cancelled,
}

impl AppointmentStatus {
    /// Claimed statuses are exactly those that carry a patient.
    pub fn is_claimed(self) -> bool {
        !matches!(self, AppointmentStatus::Available)
    }
}

impl fmt::Display for AppointmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            AppointmentStatus::Available => "Available",
            AppointmentStatus::Scheduled => "Scheduled",
            AppointmentStatus::Completed => "Completed",
            AppointmentStatus::Cancelled => "Cancelled",
        };
        f.write_str(label)
    }
}

/// Non-negative amount in minor units. Textual form is `"120.50"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Fee(u64);

impl Fee {
    pub fn from_cents(cents: u64) -> Self {
        Self(cents)
    }

    pub fn cents(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for Fee {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}", self.0 / 100, self.0 % 100)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeeParseError(String);

impl fmt::Display for FeeParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid fee: {}", self.0)
    }
}

impl std::error::Error for FeeParseError {}

impl FromStr for Fee {
    type Err = FeeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || FeeParseError(s.to_string());
        let (whole, frac) = match s.trim().split_once('.') {
            Some((w, f)) => (w, f),
            None => (s.trim(), ""),
        };
        if whole.is_empty() || !whole.bytes().all(|b| b.is_ascii_digit()) {
            return Err(bad());
        }
        if frac.len() > 2 || !frac.bytes().all(|b| b.is_ascii_digit()) {
            return Err(bad());
        }
        let units: u64 = whole.parse().map_err(|_| bad())?;
        let cents: u64 = match frac.len() {
            0 => 0,
            1 => frac.parse::<u64>().map_err(|_| bad())? * 10,
            _ => frac.parse().map_err(|_| bad())?,
        };
        units
            .checked_mul(100)
            .and_then(|c| c.checked_add(cents))
            .map(Fee)
            .ok_or_else(bad)
    }
}

impl TryFrom<String> for Fee {
    type Error = FeeParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Fee> for String {
    fn from(fee: Fee) -> String {
        fee.to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Appointment {
    pub id: Ulid,
    /// `None` for an open appointment.
    pub patient_id: Option<Ulid>,
    pub doctor_id: Ulid,
    pub schedule_id: Ulid,
    pub start: Timestamp,
    pub end: Timestamp,
    pub status: AppointmentStatus,
    pub notes: Option<String>,
    pub fee: Option<Fee>,
}

impl Appointment {
    pub fn span(&self) -> Span {
        Span::new(self.start, self.end)
    }

    pub fn is_open(&self) -> bool {
        self.patient_id.is_none()
    }
}

/// Sparse update. `None` leaves a field untouched; for nullable fields
/// `Some(None)` clears the value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppointmentPatch {
    pub start: Option<Timestamp>,
    pub end: Option<Timestamp>,
    pub status: Option<AppointmentStatus>,
    pub notes: Option<Option<String>>,
    pub fee: Option<Option<Fee>>,
}

impl AppointmentPatch {
    pub fn apply(&self, appointment: &mut Appointment) {
        if let Some(start) = self.start {
            appointment.start = start;
        }
        if let Some(end) = self.end {
            appointment.end = end;
        }
        if let Some(status) = self.status {
            appointment.status = status;
        }
        if let Some(notes) = &self.notes {
            appointment.notes = notes.clone();
        }
        if let Some(fee) = self.fee {
            appointment.fee = fee;
        }
    }

    pub fn moves_time(&self) -> bool {
        self.start.is_some() || self.end.is_some()
    }
}

/// Everything `create_appointment` needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewAppointment {
    pub id: Ulid,
    pub patient_id: Option<Ulid>,
    pub doctor_id: Ulid,
    pub schedule_id: Ulid,
    pub start: Timestamp,
    pub end: Timestamp,
    pub notes: Option<String>,
    pub fee: Option<Fee>,
}

// ── Per-doctor state ──────────────────────────────────────────────

/// One doctor's slots and appointments. All booking decisions for a doctor
/// are made while holding this calendar's write lock.
#[derive(Debug, Clone)]
pub struct DoctorCalendar {
    pub doctor_id: Ulid,
    pub slots: BTreeMap<Ulid, ScheduleSlot>,
    /// Sorted by `start`.
    pub appointments: Vec<Appointment>,
}

impl DoctorCalendar {
    pub fn new(doctor_id: Ulid) -> Self {
        Self {
            doctor_id,
            slots: BTreeMap::new(),
            appointments: Vec::new(),
        }
    }

    /// Insert maintaining sort order by start.
    pub fn insert_appointment(&mut self, appointment: Appointment) {
        let pos = self
            .appointments
            .partition_point(|a| a.start <= appointment.start);
        self.appointments.insert(pos, appointment);
    }

    pub fn remove_appointment(&mut self, id: Ulid) -> Option<Appointment> {
        let pos = self.appointments.iter().position(|a| a.id == id)?;
        Some(self.appointments.remove(pos))
    }

    /// Replace an appointment whose times may have changed.
    pub fn upsert_appointment(&mut self, appointment: Appointment) {
        self.remove_appointment(appointment.id);
        self.insert_appointment(appointment);
    }

    pub fn appointment(&self, id: &Ulid) -> Option<&Appointment> {
        self.appointments.iter().find(|a| a.id == *id)
    }

    /// Mutable access for edits that leave `start` untouched.
    pub fn appointment_mut(&mut self, id: &Ulid) -> Option<&mut Appointment> {
        self.appointments.iter_mut().find(|a| a.id == *id)
    }

    /// Appointments whose span overlaps `query`. Binary search skips
    /// everything starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Appointment> {
        let right_bound = self
            .appointments
            .partition_point(|a| a.start < query.end);
        self.appointments[..right_bound]
            .iter()
            .filter(move |a| a.end > query.start)
    }
}

/// WAL record format. One record per committed mutation, so a mutation
/// touching both an appointment and its slot is still atomic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    PatientRegistered {
        patient: Patient,
    },
    DoctorRegistered {
        doctor: Doctor,
    },
    SlotPublished {
        slot: ScheduleSlot,
    },
    SlotStatusChanged {
        id: Ulid,
        doctor_id: Ulid,
        status: SlotStatus,
    },
    AppointmentCreated {
        appointment: Appointment,
    },
    AppointmentBooked {
        id: Ulid,
        doctor_id: Ulid,
        patient_id: Ulid,
        notes: Option<String>,
    },
    AppointmentUpdated {
        appointment: Appointment,
    },
    AppointmentCancelled {
        id: Ulid,
        doctor_id: Ulid,
        schedule_id: Ulid,
    },
    AppointmentDeleted {
        id: Ulid,
        doctor_id: Ulid,
    },
}

impl Event {
    /// The calendar an event applies to. `None` for directory-level events.
    pub fn doctor_id(&self) -> Option<Ulid> {
        match self {
            Event::SlotPublished { slot } => Some(slot.doctor_id),
            Event::AppointmentCreated { appointment } | Event::AppointmentUpdated { appointment } => {
                Some(appointment.doctor_id)
            }
            Event::SlotStatusChanged { doctor_id, .. }
            | Event::AppointmentBooked { doctor_id, .. }
            | Event::AppointmentCancelled { doctor_id, .. }
            | Event::AppointmentDeleted { doctor_id, .. } => Some(*doctor_id),
            Event::PatientRegistered { .. } | Event::DoctorRegistered { .. } => None,
        }
    }
}
