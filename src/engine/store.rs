use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::RwLock;
use ulid::Ulid;

use crate::model::*;

use super::{EngineError, EntityKind, SharedCalendar};

/// In-memory registry of patients, doctors and per-doctor calendars, plus the
/// reverse indexes that route a slot or appointment id to its doctor.
pub struct Directory {
    patients: DashMap<Ulid, Patient>,
    doctors: DashMap<Ulid, Doctor>,
    calendars: DashMap<Ulid, SharedCalendar>,
    slot_owner: DashMap<Ulid, Ulid>,
    appointment_owner: DashMap<Ulid, Ulid>,
    /// Every id in use per kind, committed or claimed by a writer in flight.
    claimed: DashMap<(EntityKind, Ulid), ()>,
}

/// Exclusive hold on a new id. Dropping it without `keep` frees the id.
#[derive(Debug)]
pub struct IdClaim<'a> {
    claimed: &'a DashMap<(EntityKind, Ulid), ()>,
    key: (EntityKind, Ulid),
    kept: bool,
}

impl IdClaim<'_> {
    /// The id is now backed by a committed event.
    pub fn keep(mut self) {
        self.kept = true;
    }
}

impl Drop for IdClaim<'_> {
    fn drop(&mut self) {
        if !self.kept {
            self.claimed.remove(&self.key);
        }
    }
}

impl Default for Directory {
    fn default() -> Self {
        Self::new()
    }
}

impl Directory {
    pub fn new() -> Self {
        Self {
            patients: DashMap::new(),
            doctors: DashMap::new(),
            calendars: DashMap::new(),
            slot_owner: DashMap::new(),
            appointment_owner: DashMap::new(),
            claimed: DashMap::new(),
        }
    }

    // ── Lookups ──────────────────────────────────────────────

    pub fn find_patient(&self, id: &Ulid) -> Option<Patient> {
        self.patients.get(id).map(|e| e.value().clone())
    }

    pub fn find_doctor(&self, id: &Ulid) -> Option<Doctor> {
        self.doctors.get(id).map(|e| e.value().clone())
    }

    pub async fn find_schedule_slot(&self, id: &Ulid) -> Option<ScheduleSlot> {
        let cal = self.calendar(&self.slot_doctor(id)?)?;
        let guard = cal.read().await;
        guard.slots.get(id).cloned()
    }

    pub fn calendar(&self, doctor_id: &Ulid) -> Option<SharedCalendar> {
        self.calendars.get(doctor_id).map(|e| e.value().clone())
    }

    /// Snapshot of every calendar handle. Taken before any lock is awaited so
    /// no map guard is held across an await point.
    pub fn calendars(&self) -> Vec<SharedCalendar> {
        self.calendars.iter().map(|e| e.value().clone()).collect()
    }

    pub fn patients(&self) -> Vec<Patient> {
        let mut all: Vec<Patient> = self.patients.iter().map(|e| e.value().clone()).collect();
        all.sort_by_key(|p| p.id);
        all
    }

    pub fn doctors(&self) -> Vec<Doctor> {
        let mut all: Vec<Doctor> = self.doctors.iter().map(|e| e.value().clone()).collect();
        all.sort_by_key(|d| d.id);
        all
    }

    pub fn slot_doctor(&self, slot_id: &Ulid) -> Option<Ulid> {
        self.slot_owner.get(slot_id).map(|e| *e.value())
    }

    pub fn appointment_doctor(&self, appointment_id: &Ulid) -> Option<Ulid> {
        self.appointment_owner.get(appointment_id).map(|e| *e.value())
    }

    pub fn contains_patient(&self, id: &Ulid) -> bool {
        self.patients.contains_key(id)
    }

    /// Atomically take `id` for a new entity of `kind`.
    pub fn claim(&self, kind: EntityKind, id: Ulid) -> Result<IdClaim<'_>, EngineError> {
        match self.claimed.entry((kind, id)) {
            Entry::Occupied(_) => Err(EngineError::AlreadyExists { kind, id }),
            Entry::Vacant(vacant) => {
                vacant.insert(());
                Ok(IdClaim {
                    claimed: &self.claimed,
                    key: (kind, id),
                    kept: false,
                })
            }
        }
    }

    // ── Event application ────────────────────────────────────

    /// Apply a directory-level event (patient or doctor registration).
    pub(crate) fn register(&self, event: &Event) {
        match event {
            Event::PatientRegistered { patient } => {
                self.claimed.insert((EntityKind::Patient, patient.id), ());
                self.patients.insert(patient.id, patient.clone());
            }
            Event::DoctorRegistered { doctor } => {
                self.claimed.insert((EntityKind::Doctor, doctor.id), ());
                self.doctors.insert(doctor.id, doctor.clone());
                self.calendars
                    .entry(doctor.id)
                    .or_insert_with(|| Arc::new(RwLock::new(DoctorCalendar::new(doctor.id))));
            }
            _ => {}
        }
    }

    /// Apply a calendar event. Caller holds the calendar's write lock.
    pub(crate) fn apply_event(&self, cal: &mut DoctorCalendar, event: &Event) {
        match event {
            Event::SlotPublished { slot } => {
                self.claimed.insert((EntityKind::Schedule, slot.id), ());
                cal.slots.insert(slot.id, slot.clone());
                self.slot_owner.insert(slot.id, slot.doctor_id);
            }
            Event::SlotStatusChanged { id, status, .. } => {
                if let Some(slot) = cal.slots.get_mut(id) {
                    slot.status = *status;
                }
            }
            Event::AppointmentCreated { appointment } => {
                self.claimed
                    .insert((EntityKind::Appointment, appointment.id), ());
                cal.insert_appointment(appointment.clone());
                self.appointment_owner
                    .insert(appointment.id, appointment.doctor_id);
            }
            Event::AppointmentBooked {
                id,
                patient_id,
                notes,
                ..
            } => {
                if let Some(a) = cal.appointment_mut(id) {
                    a.patient_id = Some(*patient_id);
                    a.status = AppointmentStatus::Scheduled;
                    a.notes = notes.clone();
                }
            }
            Event::AppointmentUpdated { appointment } => {
                cal.upsert_appointment(appointment.clone());
            }
            Event::AppointmentCancelled {
                id, schedule_id, ..
            } => {
                if let Some(a) = cal.appointment_mut(id) {
                    a.status = AppointmentStatus::Cancelled;
                }
                if let Some(slot) = cal.slots.get_mut(schedule_id) {
                    slot.status = SlotStatus::Available;
                }
            }
            Event::AppointmentDeleted { id, .. } => {
                cal.remove_appointment(*id);
                self.appointment_owner.remove(id);
                self.claimed.remove(&(EntityKind::Appointment, *id));
            }
            Event::PatientRegistered { .. } | Event::DoctorRegistered { .. } => {}
        }
    }
}
