use ulid::Ulid;

use crate::model::*;

use super::{Engine, EngineError, EntityKind};

fn sort_by_start(appointments: &mut [Appointment]) {
    appointments.sort_by(|a, b| a.start.cmp(&b.start).then(a.id.cmp(&b.id)));
}

impl Engine {
    // ── Directory lookups ────────────────────────────────────

    pub fn find_patient(&self, id: &Ulid) -> Result<Patient, EngineError> {
        self.directory
            .find_patient(id)
            .ok_or(EngineError::not_found(EntityKind::Patient, *id))
    }

    pub fn find_doctor(&self, id: &Ulid) -> Result<Doctor, EngineError> {
        self.directory
            .find_doctor(id)
            .ok_or(EngineError::not_found(EntityKind::Doctor, *id))
    }

    pub async fn find_schedule_slot(&self, id: &Ulid) -> Result<ScheduleSlot, EngineError> {
        self.directory
            .find_schedule_slot(id)
            .await
            .ok_or(EngineError::not_found(EntityKind::Schedule, *id))
    }

    pub fn list_patients(&self) -> Vec<Patient> {
        self.directory.patients()
    }

    pub fn list_doctors(&self) -> Vec<Doctor> {
        self.directory.doctors()
    }

    /// The doctor's slots ordered by date then start time.
    pub async fn list_slots(&self, doctor_id: &Ulid) -> Result<Vec<ScheduleSlot>, EngineError> {
        let cal = self
            .directory
            .calendar(doctor_id)
            .ok_or(EngineError::not_found(EntityKind::Doctor, *doctor_id))?;
        let guard = cal.read().await;
        let mut slots: Vec<ScheduleSlot> = guard.slots.values().cloned().collect();
        slots.sort_by_key(|s| (s.work_date, s.start_time, s.id));
        Ok(slots)
    }

    // ── Appointment reads ────────────────────────────────────

    pub async fn get_appointment(&self, id: &Ulid) -> Result<Appointment, EngineError> {
        let not_found = || EngineError::not_found(EntityKind::Appointment, *id);
        let doctor_id = self.directory.appointment_doctor(id).ok_or_else(not_found)?;
        let cal = self.directory.calendar(&doctor_id).ok_or_else(not_found)?;
        let guard = cal.read().await;
        guard.appointment(id).cloned().ok_or_else(not_found)
    }

    pub async fn appointment_exists(&self, id: &Ulid) -> bool {
        self.get_appointment(id).await.is_ok()
    }

    /// Every appointment, ordered by start then id.
    pub async fn list_appointments(&self) -> Vec<Appointment> {
        let mut all = Vec::new();
        for cal in self.directory.calendars() {
            let guard = cal.read().await;
            all.extend(guard.appointments.iter().cloned());
        }
        sort_by_start(&mut all);
        all
    }

    /// A doctor's appointments in start order. Unknown doctors have none.
    pub async fn appointments_for_doctor(&self, doctor_id: &Ulid) -> Vec<Appointment> {
        let Some(cal) = self.directory.calendar(doctor_id) else {
            return Vec::new();
        };
        let guard = cal.read().await;
        guard.appointments.clone()
    }

    pub async fn appointments_for_patient(&self, patient_id: &Ulid) -> Vec<Appointment> {
        let mut found = Vec::new();
        for cal in self.directory.calendars() {
            let guard = cal.read().await;
            found.extend(
                guard
                    .appointments
                    .iter()
                    .filter(|a| a.patient_id == Some(*patient_id))
                    .cloned(),
            );
        }
        sort_by_start(&mut found);
        found
    }

    /// Open appointments a patient could still book with this doctor.
    pub async fn available_for_doctor(&self, doctor_id: &Ulid) -> Vec<Appointment> {
        let Some(cal) = self.directory.calendar(doctor_id) else {
            return Vec::new();
        };
        let guard = cal.read().await;
        guard
            .appointments
            .iter()
            .filter(|a| a.status == AppointmentStatus::Available)
            .cloned()
            .collect()
    }
}
