//! Engine event notifications.
//!
//! Clients that used to poll the triage board can subscribe instead. Events
//! are broadcast; a slow subscriber lags and loses old events rather than
//! blocking the engine.

use crate::types::*;
use serde::Serialize;
use std::time::Duration;
use tokio::sync::broadcast;

/// Something observable happened inside the engine
#[derive(Clone, Debug, Serialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    PatientQueued {
        entry: WaitingEntry,
    },
    PatientWithdrawn {
        patient_id: PatientId,
    },
    AttentionStarted {
        appointment_id: AppointmentId,
        patient_id: PatientId,
        doctor_id: DoctorId,
        #[serde(with = "duration_secs")]
        duration: Duration,
    },
    /// A dequeued patient went back in line because no doctor was free
    CompensationReenqueue {
        entry: WaitingEntry,
    },
    AttentionFinished {
        appointment_id: AppointmentId,
        doctor_id: DoctorId,
        trigger: CompletionTrigger,
    },
    /// A completion fired for an appointment that had already left attention
    CompletionSkipped {
        appointment_id: AppointmentId,
        state: AppointmentState,
    },
    AppointmentCancelled {
        appointment_id: AppointmentId,
        previous: AppointmentState,
    },
    DoctorReleased {
        doctor_id: DoctorId,
    },
}

mod duration_secs {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }
}

/// Broadcast channel for [`EngineEvent`]s
#[derive(Clone, Debug)]
pub struct EventBus {
    sender: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }

    /// Publish to current subscribers; having none is not an error
    pub fn publish(&self, event: EngineEvent) {
        tracing::trace!(?event, "engine event");
        let _ = self.sender.send(event);
    }
}
