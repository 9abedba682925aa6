use std::fmt;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::model::{Appointment, Patient};

const CHANNEL_CAPACITY: usize = 256;

/// One outbound message for a booking event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notice {
    pub to: String,
    pub subject: String,
    pub body: String,
}

impl Notice {
    fn for_patient(patient: &Patient, appointment: &Appointment, subject: &str, verb: &str) -> Self {
        Self {
            to: patient.email.clone(),
            subject: subject.to_string(),
            body: format!(
                "Your appointment on {} at {} has been {verb}",
                appointment.start.format("%Y-%m-%d"),
                appointment.start.format("%H:%M"),
            ),
        }
    }

    pub fn booked(patient: &Patient, appointment: &Appointment) -> Self {
        Self::for_patient(patient, appointment, "Appointment Booked", "booked")
    }

    pub fn updated(patient: &Patient, appointment: &Appointment) -> Self {
        Self::for_patient(patient, appointment, "Appointment Updated", "updated")
    }

    pub fn cancelled(patient: &Patient, appointment: &Appointment) -> Self {
        Self::for_patient(patient, appointment, "Appointment Cancelled", "cancelled")
    }
}

#[derive(Debug)]
pub enum NotifyError {
    Unreachable(String),
}

impl fmt::Display for NotifyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NotifyError::Unreachable(to) => write!(f, "destination unreachable: {to}"),
        }
    }
}

impl std::error::Error for NotifyError {}

/// Delivery channel for booking notices. Called after commit; errors are
/// reported but never undo the booking.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notice: &Notice) -> Result<(), NotifyError>;
}

/// In-process fan-out keyed by destination address.
pub struct NotifyHub {
    channels: DashMap<String, broadcast::Sender<Notice>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to notices for an address. Creates the channel if needed.
    pub fn subscribe(&self, address: &str) -> broadcast::Receiver<Notice> {
        let sender = self
            .channels
            .entry(address.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Deliver to current subscribers. No-op if nobody is listening.
    pub fn send(&self, notice: &Notice) {
        if let Some(sender) = self.channels.get(&notice.to) {
            let _ = sender.send(notice.clone());
        }
    }
}

#[async_trait]
impl Notifier for NotifyHub {
    async fn notify(&self, notice: &Notice) -> Result<(), NotifyError> {
        self.send(notice);
        Ok(())
    }
}
