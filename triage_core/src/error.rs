//! Error types for the triage_core library.

use crate::types::{AppointmentId, AppointmentState, DoctorId, PatientId};
use std::fmt;
use std::io;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Kind of record a lookup failed for
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Entity {
    Patient,
    Doctor,
    Appointment,
    HistoryRecord,
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Entity::Patient => "patient",
            Entity::Doctor => "doctor",
            Entity::Appointment => "appointment",
            Entity::HistoryRecord => "history record",
        };
        f.write_str(name)
    }
}

/// Core error type for triage_core operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Patient is already waiting or already being attended
    #[error("Patient {0} is already queued or in attention")]
    AlreadyQueued(PatientId),

    /// Patient exists but is not in the waiting queue
    #[error("Patient {0} is not waiting in the triage queue")]
    NotQueued(PatientId),

    /// Nobody is waiting
    #[error("No patients waiting in the triage queue")]
    QueueEmpty,

    /// No free doctor matched; `requeued` names the patient put back in line
    #[error("No doctor available{}{}",
        .specialty.as_ref().map(|s| format!(" for specialty '{}'", s)).unwrap_or_default(),
        .requeued.map(|p| format!(" (patient {} returned to the queue)", p)).unwrap_or_default())]
    NoDoctorAvailable {
        specialty: Option<String>,
        requeued: Option<PatientId>,
    },

    /// Doctor is already bound to an attention
    #[error("Doctor {0} is busy")]
    DoctorBusy(DoctorId),

    /// Lookup failed
    #[error("{entity} {id} not found")]
    NotFound { entity: Entity, id: u64 },

    /// Only scheduled appointments may be edited
    #[error("Appointment {id} cannot be edited while {state}")]
    InvalidStateForEdit {
        id: AppointmentId,
        state: AppointmentState,
    },

    /// The lifecycle does not allow this move
    #[error("Appointment {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: AppointmentId,
        from: AppointmentState,
        to: AppointmentState,
    },

    /// A patient may hold only one scheduled or in-attention appointment
    #[error("Patient {patient} already has active appointment {existing}")]
    ActiveAppointmentExists {
        patient: PatientId,
        existing: AppointmentId,
    },

    /// IO error occurred
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// CSV error
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// TOML parsing error
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Configuration validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Backing store failure
    #[error("Store error: {0}")]
    Store(String),

    /// No async runtime to arm completion timers on
    #[error("Runtime error: {0}")]
    Runtime(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn patient_not_found(id: PatientId) -> Self {
        Error::NotFound {
            entity: Entity::Patient,
            id: id.0,
        }
    }

    pub fn doctor_not_found(id: DoctorId) -> Self {
        Error::NotFound {
            entity: Entity::Doctor,
            id: id.0,
        }
    }

    pub fn appointment_not_found(id: AppointmentId) -> Self {
        Error::NotFound {
            entity: Entity::Appointment,
            id: id.0,
        }
    }

    /// Steady-state conditions a caller is expected to hit during normal
    /// operation, as opposed to failures that deserve an alarm.
    pub fn is_expected(&self) -> bool {
        matches!(
            self,
            Error::QueueEmpty
                | Error::NoDoctorAvailable { .. }
                | Error::AlreadyQueued(_)
                | Error::NotQueued(_)
                | Error::DoctorBusy(_)
        )
    }
}
