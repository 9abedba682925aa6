mod conflict;
mod error;
mod mutations;
mod queries;
mod store;

pub use error::{EngineError, EntityKind, Rejection};
use store::Directory;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, oneshot, OwnedRwLockWriteGuard, RwLock};
use tracing::{error, warn};
use ulid::Ulid;

use crate::model::*;
use crate::notify::{Notice, Notifier};
use crate::observability;
use crate::wal::Wal;

pub type SharedCalendar = Arc<RwLock<DoctorCalendar>>;

// ── Group-commit WAL channel ─────────────────────────────

type AppendReply = oneshot::Sender<io::Result<()>>;

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: AppendReply,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Owns the WAL. Each wakeup drains every append already queued and commits
/// them with a single fsync; control commands run between batches.
async fn run_wal_writer(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                handle_control(&mut wal, other);
                continue;
            }
        };

        let mut batch = vec![(event, response)];
        let mut deferred = None;
        while let Ok(next) = rx.try_recv() {
            match next {
                WalCommand::Append { event, response } => batch.push((event, response)),
                other => {
                    deferred = Some(other);
                    break;
                }
            }
        }

        commit_batch(&mut wal, batch);
        if let Some(cmd) = deferred {
            handle_control(&mut wal, cmd);
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: Vec<(Event, AppendReply)>) {
    metrics::histogram!(observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = Instant::now();

    let result = wal.mark().and_then(|mark| {
        let written = batch
            .iter()
            .try_for_each(|(event, _)| wal.append_buffered(event))
            .and_then(|()| wal.flush_sync());
        if let Err(e) = written {
            // every caller is told the batch failed, so none of it may survive a replay
            if let Err(undo) = wal.rollback(mark) {
                error!("WAL rollback after failed batch also failed: {undo}");
            }
            return Err(e);
        }
        Ok(())
    });

    metrics::histogram!(observability::WAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());

    for (_, tx) in batch {
        let reply = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(reply);
    }
}

fn handle_control(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result =
                Wal::write_compact_file(wal.path(), &events).and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => commit_batch(wal, vec![(event, response)]),
    }
}

/// Behaviour switches for an engine instance.
#[derive(Debug, Clone, Copy, Default)]
pub struct EngineOptions {
    /// Re-run working-hours and overlap checks when an update moves an appointment.
    pub strict_updates: bool,
}

pub struct Engine {
    directory: Directory,
    wal_tx: mpsc::Sender<WalCommand>,
    notifier: Arc<dyn Notifier>,
    options: EngineOptions,
    /// Mutations hold this shared while they validate and commit; compaction
    /// takes it exclusively so its snapshot misses no committed event.
    commit_gate: RwLock<()>,
}

impl Engine {
    /// Replay the WAL at `wal_path` and start the writer task. Must be called
    /// from within a tokio runtime.
    pub fn new(
        wal_path: PathBuf,
        notifier: Arc<dyn Notifier>,
        options: EngineOptions,
    ) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(run_wal_writer(wal, wal_rx));

        let engine = Self {
            directory: Directory::new(),
            wal_tx,
            notifier,
            options,
            commit_gate: RwLock::new(()),
        };

        // Nothing else holds these calendars yet, so try_write never contends.
        for event in &events {
            let Some(doctor_id) = event.doctor_id() else {
                engine.directory.register(event);
                continue;
            };
            let Some(cal) = engine.directory.calendar(&doctor_id) else {
                warn!("replay: event for unknown doctor {doctor_id} skipped");
                continue;
            };
            let mut guard = cal
                .try_write()
                .map_err(|_| io::Error::other("replay: calendar lock contended"))?;
            engine.directory.apply_event(&mut guard, event);
        }

        tracing::info!(events = events.len(), path = %wal_path.display(), "WAL replayed");
        Ok(engine)
    }

    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::Wal("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Wal("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Wal(e.to_string()))
    }

    /// Make `event` durable, then apply it to the locked calendar.
    pub(super) async fn persist_and_apply(
        &self,
        cal: &mut DoctorCalendar,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        self.directory.apply_event(cal, event);
        Ok(())
    }

    /// Durable registration of a patient or doctor.
    pub(super) async fn persist_and_register(&self, event: &Event) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        self.directory.register(event);
        Ok(())
    }

    /// Route an appointment id to its doctor and take that calendar's write lock.
    pub(super) async fn resolve_appointment_write(
        &self,
        id: &Ulid,
    ) -> Result<OwnedRwLockWriteGuard<DoctorCalendar>, EngineError> {
        let not_found = || EngineError::not_found(EntityKind::Appointment, *id);
        let doctor_id = self.directory.appointment_doctor(id).ok_or_else(not_found)?;
        let cal = self.directory.calendar(&doctor_id).ok_or_else(not_found)?;
        let guard = cal.write_owned().await;
        // A delete may have won the race for the lock.
        if guard.appointment(id).is_none() {
            return Err(not_found());
        }
        Ok(guard)
    }

    /// Hand a notice to the notifier. Failures are logged and counted only.
    pub(super) async fn deliver(&self, notice: Notice) {
        match self.notifier.notify(&notice).await {
            Ok(()) => {
                metrics::counter!(observability::NOTIFICATIONS_TOTAL, "outcome" => "delivered")
                    .increment(1);
            }
            Err(e) => {
                metrics::counter!(observability::NOTIFICATIONS_TOTAL, "outcome" => "failed")
                    .increment(1);
                warn!(to = %notice.to, subject = %notice.subject, "notification failed: {e}");
            }
        }
    }

    /// Notify the appointment's patient, if it has one that still resolves.
    pub(super) async fn notify_patient(
        &self,
        appointment: &Appointment,
        build: fn(&Patient, &Appointment) -> Notice,
    ) {
        let Some(patient_id) = appointment.patient_id else {
            tracing::debug!(appointment = %appointment.id, "no patient attached, notice skipped");
            return;
        };
        match self.directory.find_patient(&patient_id) {
            Some(patient) => self.deliver(build(&patient, appointment)).await,
            None => warn!(%patient_id, "notice skipped: patient not found"),
        }
    }

    // ── Compaction ───────────────────────────────────────────

    /// Rewrite the WAL as the minimal event list that recreates current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _exclusive = self.commit_gate.write().await;

        let mut events = Vec::new();
        for patient in self.directory.patients() {
            events.push(Event::PatientRegistered { patient });
        }
        for doctor in self.directory.doctors() {
            events.push(Event::DoctorRegistered { doctor });
        }
        for cal in self.directory.calendars() {
            let guard = cal.read().await;
            for slot in guard.slots.values() {
                events.push(Event::SlotPublished { slot: slot.clone() });
            }
            for appointment in &guard.appointments {
                events.push(Event::AppointmentCreated {
                    appointment: appointment.clone(),
                });
            }
        }

        let count = events.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact {
                events,
                response: tx,
            })
            .await
            .map_err(|_| EngineError::Wal("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Wal("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Wal(e.to_string()))?;

        metrics::counter!(observability::WAL_COMPACTIONS_TOTAL).increment(1);
        tracing::info!(events = count, "WAL compacted");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
