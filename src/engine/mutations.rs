use chrono::{NaiveDate, NaiveTime};
use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::notify::Notice;

use super::conflict::{
    check_no_conflict, check_status_matches_patient, check_within_slot, validate_notes,
    validate_span,
};
use super::{Engine, EngineError, EntityKind, Rejection};

impl Engine {
    // ── Directory registration ───────────────────────────────

    pub async fn register_patient(
        &self,
        id: Ulid,
        name: String,
        email: String,
    ) -> Result<Patient, EngineError> {
        if name.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("name too long"));
        }
        if email.len() > MAX_EMAIL_LEN {
            return Err(EngineError::LimitExceeded("email too long"));
        }
        let _commit = self.commit_gate.read().await;
        let claim = self.directory.claim(EntityKind::Patient, id)?;

        let patient = Patient { id, name, email };
        self.persist_and_register(&Event::PatientRegistered {
            patient: patient.clone(),
        })
        .await?;
        claim.keep();
        info!(%id, "patient registered");
        Ok(patient)
    }

    pub async fn register_doctor(
        &self,
        id: Ulid,
        name: String,
        department: Option<String>,
    ) -> Result<Doctor, EngineError> {
        if name.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("name too long"));
        }
        if let Some(d) = &department
            && d.len() > MAX_DEPARTMENT_LEN
        {
            return Err(EngineError::LimitExceeded("department too long"));
        }
        let _commit = self.commit_gate.read().await;
        let claim = self.directory.claim(EntityKind::Doctor, id)?;

        let doctor = Doctor {
            id,
            name,
            department,
        };
        self.persist_and_register(&Event::DoctorRegistered {
            doctor: doctor.clone(),
        })
        .await?;
        claim.keep();
        info!(%id, "doctor registered");
        Ok(doctor)
    }

    /// Publish a working window for a doctor. New slots are Available.
    pub async fn publish_slot(
        &self,
        id: Ulid,
        doctor_id: Ulid,
        work_date: NaiveDate,
        start_time: NaiveTime,
        end_time: NaiveTime,
    ) -> Result<ScheduleSlot, EngineError> {
        if start_time >= end_time {
            return Err(Rejection::InvalidTimeRange.into());
        }
        let _commit = self.commit_gate.read().await;
        let cal = self
            .directory
            .calendar(&doctor_id)
            .ok_or(EngineError::not_found(EntityKind::Doctor, doctor_id))?;
        let mut guard = cal.write().await;

        let claim = self.directory.claim(EntityKind::Schedule, id)?;
        if guard.slots.len() >= MAX_SLOTS_PER_DOCTOR {
            return Err(EngineError::LimitExceeded("too many slots for doctor"));
        }

        let slot = ScheduleSlot {
            id,
            doctor_id,
            work_date,
            start_time,
            end_time,
            status: SlotStatus::Available,
        };
        self.persist_and_apply(&mut guard, &Event::SlotPublished { slot: slot.clone() })
            .await?;
        claim.keep();
        Ok(slot)
    }

    /// Store-level slot status change, e.g. closing a slot to new appointments.
    pub async fn set_slot_status(
        &self,
        slot_id: Ulid,
        status: SlotStatus,
    ) -> Result<ScheduleSlot, EngineError> {
        let not_found = || EngineError::not_found(EntityKind::Schedule, slot_id);
        let _commit = self.commit_gate.read().await;
        let doctor_id = self.directory.slot_doctor(&slot_id).ok_or_else(not_found)?;
        let cal = self.directory.calendar(&doctor_id).ok_or_else(not_found)?;
        let mut guard = cal.write().await;
        if !guard.slots.contains_key(&slot_id) {
            return Err(not_found());
        }

        let event = Event::SlotStatusChanged {
            id: slot_id,
            doctor_id,
            status,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        guard.slots.get(&slot_id).cloned().ok_or_else(not_found)
    }

    // ── Appointment lifecycle ────────────────────────────────

    /// Create an appointment inside one of the doctor's slots. With a patient
    /// it starts Scheduled, otherwise it is an open Available appointment.
    pub async fn create_appointment(&self, req: NewAppointment) -> Result<Appointment, EngineError> {
        let span = validate_span(req.start, req.end)?;
        validate_notes(req.notes.as_deref())?;

        let _commit = self.commit_gate.read().await;
        if let Some(patient_id) = req.patient_id
            && !self.directory.contains_patient(&patient_id)
        {
            return Err(EngineError::not_found(EntityKind::Patient, patient_id));
        }
        let cal = self
            .directory
            .calendar(&req.doctor_id)
            .ok_or(EngineError::not_found(EntityKind::Doctor, req.doctor_id))?;
        let mut guard = cal.write().await;

        let slot = match guard.slots.get(&req.schedule_id) {
            Some(slot) => slot,
            None => {
                return Err(match self.directory.slot_doctor(&req.schedule_id) {
                    Some(_) => Rejection::ForeignSchedule(req.schedule_id).into(),
                    None => EngineError::not_found(EntityKind::Schedule, req.schedule_id),
                });
            }
        };
        if slot.status != SlotStatus::Available {
            return Err(Rejection::ScheduleUnavailable.into());
        }
        check_within_slot(slot, &span)?;
        check_no_conflict(&guard, &span, None)?;

        let claim = self.directory.claim(EntityKind::Appointment, req.id)?;
        if guard.appointments.len() >= MAX_APPOINTMENTS_PER_DOCTOR {
            return Err(EngineError::LimitExceeded("too many appointments for doctor"));
        }

        let status = match req.patient_id {
            Some(_) => AppointmentStatus::Scheduled,
            None => AppointmentStatus::Available,
        };
        let appointment = Appointment {
            id: req.id,
            patient_id: req.patient_id,
            doctor_id: req.doctor_id,
            schedule_id: req.schedule_id,
            start: req.start,
            end: req.end,
            status,
            notes: req.notes,
            fee: req.fee,
        };
        self.persist_and_apply(
            &mut guard,
            &Event::AppointmentCreated {
                appointment: appointment.clone(),
            },
        )
        .await?;
        claim.keep();
        info!(id = %appointment.id, doctor = %appointment.doctor_id, %status, "appointment created");
        Ok(appointment)
    }

    /// Attach a patient to an open appointment. Notes are replaced, even by `None`.
    pub async fn book_appointment(
        &self,
        id: Ulid,
        patient_id: Ulid,
        notes: Option<String>,
    ) -> Result<Appointment, EngineError> {
        validate_notes(notes.as_deref())?;
        let _commit = self.commit_gate.read().await;
        let mut guard = self.resolve_appointment_write(&id).await?;
        let current = guard
            .appointment(&id)
            .ok_or(EngineError::not_found(EntityKind::Appointment, id))?;
        if current.patient_id.is_some() {
            debug!(%id, "booking rejected: already booked");
            return Err(Rejection::AlreadyBooked.into());
        }
        let patient = self
            .directory
            .find_patient(&patient_id)
            .ok_or(EngineError::not_found(EntityKind::Patient, patient_id))?;

        let event = Event::AppointmentBooked {
            id,
            doctor_id: current.doctor_id,
            patient_id,
            notes,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        let booked = guard
            .appointment(&id)
            .cloned()
            .ok_or(EngineError::not_found(EntityKind::Appointment, id))?;
        drop(guard);
        drop(_commit);

        info!(%id, patient = %patient_id, "appointment booked");
        self.deliver(Notice::booked(&patient, &booked)).await;
        Ok(booked)
    }

    /// Apply a sparse patch. Overlap and working hours are only re-checked
    /// when strict updates are enabled.
    pub async fn update_appointment(
        &self,
        id: Ulid,
        patch: AppointmentPatch,
    ) -> Result<Appointment, EngineError> {
        if let Some(Some(notes)) = &patch.notes {
            validate_notes(Some(notes))?;
        }
        let _commit = self.commit_gate.read().await;
        let mut guard = self.resolve_appointment_write(&id).await?;
        let mut next = guard
            .appointment(&id)
            .cloned()
            .ok_or(EngineError::not_found(EntityKind::Appointment, id))?;
        patch.apply(&mut next);

        let span = validate_span(next.start, next.end)?;
        check_status_matches_patient(&next)?;
        if self.options.strict_updates && patch.moves_time() {
            let slot = guard
                .slots
                .get(&next.schedule_id)
                .ok_or(EngineError::not_found(EntityKind::Schedule, next.schedule_id))?;
            check_within_slot(slot, &span)?;
            check_no_conflict(&guard, &span, Some(id))?;
        }

        self.persist_and_apply(
            &mut guard,
            &Event::AppointmentUpdated {
                appointment: next.clone(),
            },
        )
        .await?;
        drop(guard);
        drop(_commit);

        info!(%id, status = %next.status, "appointment updated");
        self.notify_patient(&next, Notice::updated).await;
        Ok(next)
    }

    /// Cancel a booked appointment and release its slot in one commit.
    ///
    /// Only appointments with a patient can be cancelled: a Cancelled status
    /// always carries one. An open appointment is rejected with
    /// `Rejection::NotBooked` and should be deleted instead. Cancelling an
    /// already cancelled booking succeeds and releases the slot again.
    pub async fn cancel_appointment(&self, id: Ulid) -> Result<Appointment, EngineError> {
        let _commit = self.commit_gate.read().await;
        let mut guard = self.resolve_appointment_write(&id).await?;
        let current = guard
            .appointment(&id)
            .ok_or(EngineError::not_found(EntityKind::Appointment, id))?;
        if current.patient_id.is_none() {
            return Err(Rejection::NotBooked.into());
        }

        let event = Event::AppointmentCancelled {
            id,
            doctor_id: current.doctor_id,
            schedule_id: current.schedule_id,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        let cancelled = guard
            .appointment(&id)
            .cloned()
            .ok_or(EngineError::not_found(EntityKind::Appointment, id))?;
        drop(guard);
        drop(_commit);

        info!(%id, schedule = %cancelled.schedule_id, "appointment cancelled, slot released");
        self.notify_patient(&cancelled, Notice::cancelled).await;
        Ok(cancelled)
    }

    /// Hard removal. Fails with NotFound if the appointment does not exist.
    pub async fn delete_appointment(&self, id: Ulid) -> Result<(), EngineError> {
        let _commit = self.commit_gate.read().await;
        let mut guard = self.resolve_appointment_write(&id).await?;
        let event = Event::AppointmentDeleted {
            id,
            doctor_id: guard.doctor_id,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        info!(%id, "appointment deleted");
        Ok(())
    }
}
