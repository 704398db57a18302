//! Core domain types for the clinic triage engine.
//!
//! This module defines the fundamental types used throughout the system:
//! - Identifiers for patients, doctors and appointments
//! - Triage priority and appointment lifecycle state
//! - Patient, doctor and appointment records plus their field updates
//! - Waiting-queue entries and history snapshots

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

// ============================================================================
// Identifiers
// ============================================================================

macro_rules! record_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = std::num::ParseIntError;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                s.trim().parse().map($name)
            }
        }
    };
}

record_id!(
    /// Identity of a patient record in the patient store
    PatientId
);
record_id!(
    /// Identity of a doctor record in the doctor store
    DoctorId
);
record_id!(
    /// Identity of an appointment record in the appointment store
    AppointmentId
);

// ============================================================================
// Priority and State
// ============================================================================

/// Triage urgency tier.
///
/// Ordering follows the numeric code: `High` (1) sorts before `Medium` (2)
/// which sorts before `Low` (3), so the smallest value is the most urgent.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    High = 1,
    Medium = 2,
    Low = 3,
}

impl Priority {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Priority::High),
            2 => Some(Priority::Medium),
            3 => Some(Priority::Low),
            _ => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Priority::High => "High",
            Priority::Medium => "Medium",
            Priority::Low => "Low",
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Low
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "1" | "high" | "alta" => Ok(Priority::High),
            "2" | "medium" | "media" => Ok(Priority::Medium),
            "3" | "low" | "baja" => Ok(Priority::Low),
            _ => Err(format!(
                "Invalid priority: '{}'. Must be one of: high (1), medium (2), low (3)",
                value
            )),
        }
    }
}

/// Lifecycle state of an appointment
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AppointmentState {
    /// `P`: booked, not yet attended
    Scheduled,
    /// `E`: a doctor is attending the patient
    InAttention,
    /// `F`: attention completed
    Finished,
    /// `C`
    Cancelled,
    /// `R`: superseded by a new appointment at another date/time
    Rescheduled,
}

impl AppointmentState {
    /// Single-letter code used by the clinic's records
    pub fn code(self) -> char {
        match self {
            AppointmentState::Scheduled => 'P',
            AppointmentState::InAttention => 'E',
            AppointmentState::Finished => 'F',
            AppointmentState::Cancelled => 'C',
            AppointmentState::Rescheduled => 'R',
        }
    }

    pub fn from_code(code: char) -> Option<Self> {
        match code.to_ascii_uppercase() {
            'P' => Some(AppointmentState::Scheduled),
            'E' => Some(AppointmentState::InAttention),
            'F' => Some(AppointmentState::Finished),
            'C' => Some(AppointmentState::Cancelled),
            'R' => Some(AppointmentState::Rescheduled),
            _ => None,
        }
    }

    /// Scheduled or in attention
    pub fn is_active(self) -> bool {
        matches!(
            self,
            AppointmentState::Scheduled | AppointmentState::InAttention
        )
    }

    pub fn is_terminal(self) -> bool {
        !self.is_active()
    }

    /// Whether the lifecycle allows moving from `self` to `next`
    pub fn can_transition_to(self, next: AppointmentState) -> bool {
        use AppointmentState::*;
        matches!(
            (self, next),
            (Scheduled, InAttention)
                | (Scheduled, Rescheduled)
                | (Scheduled, Cancelled)
                | (InAttention, Finished)
                | (InAttention, Cancelled)
        )
    }
}

impl fmt::Display for AppointmentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AppointmentState::Scheduled => "scheduled",
            AppointmentState::InAttention => "in attention",
            AppointmentState::Finished => "finished",
            AppointmentState::Cancelled => "cancelled",
            AppointmentState::Rescheduled => "rescheduled",
        };
        write!(f, "{} ({})", name, self.code())
    }
}

// ============================================================================
// Patients and Doctors
// ============================================================================

/// A registered patient
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Patient {
    pub id: PatientId,
    pub first_name: String,
    pub last_name: String,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub priority: Priority,
    #[serde(default)]
    pub in_attention: bool,
}

impl Patient {
    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
    }
}

/// Fields required to register a patient
#[derive(Clone, Debug, Default)]
pub struct NewPatient {
    pub first_name: String,
    pub last_name: String,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub priority: Priority,
}

/// Partial patient update; `None` leaves a field untouched
#[derive(Clone, Debug, Default)]
pub struct PatientUpdate {
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub priority: Option<Priority>,
    pub in_attention: Option<bool>,
}

impl PatientUpdate {
    pub fn in_attention(value: bool) -> Self {
        Self {
            in_attention: Some(value),
            ..Self::default()
        }
    }

    pub fn apply(self, patient: &mut Patient) {
        if let Some(v) = self.first_name {
            patient.first_name = v;
        }
        if let Some(v) = self.last_name {
            patient.last_name = v;
        }
        if let Some(v) = self.phone {
            patient.phone = Some(v);
        }
        if let Some(v) = self.email {
            patient.email = Some(v);
        }
        if let Some(v) = self.priority {
            patient.priority = v;
        }
        if let Some(v) = self.in_attention {
            patient.in_attention = v;
        }
    }
}

/// A doctor whose `available` flag doubles as an exclusive attention lock
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Doctor {
    pub id: DoctorId,
    pub first_name: String,
    pub last_name: String,
    pub specialty: String,
    pub office: u32,
    pub available: bool,
}

impl Doctor {
    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
    }
}

/// Fields required to register a doctor
#[derive(Clone, Debug, Default)]
pub struct NewDoctor {
    pub first_name: String,
    pub last_name: String,
    pub specialty: String,
    pub office: u32,
}

/// Partial doctor update
#[derive(Clone, Debug, Default)]
pub struct DoctorUpdate {
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub specialty: Option<String>,
    pub office: Option<u32>,
    pub available: Option<bool>,
}

impl DoctorUpdate {
    pub fn apply(self, doctor: &mut Doctor) {
        if let Some(v) = self.first_name {
            doctor.first_name = v;
        }
        if let Some(v) = self.last_name {
            doctor.last_name = v;
        }
        if let Some(v) = self.specialty {
            doctor.specialty = v;
        }
        if let Some(v) = self.office {
            doctor.office = v;
        }
        if let Some(v) = self.available {
            doctor.available = v;
        }
    }
}

// ============================================================================
// Appointments
// ============================================================================

/// An appointment binding one patient to one doctor
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Appointment {
    pub id: AppointmentId,
    pub date: NaiveDate,
    pub time: NaiveTime,
    pub patient_id: PatientId,
    pub doctor_id: DoctorId,
    pub reason: String,
    pub state: AppointmentState,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// When the completion timer is expected to fire
    pub due_at: Option<DateTime<Utc>>,
}

/// Fields required to create an appointment
#[derive(Clone, Debug)]
pub struct NewAppointment {
    pub date: NaiveDate,
    pub time: NaiveTime,
    pub patient_id: PatientId,
    pub doctor_id: DoctorId,
    pub reason: String,
    pub state: AppointmentState,
    pub started_at: Option<DateTime<Utc>>,
    pub due_at: Option<DateTime<Utc>>,
}

/// Partial appointment update applied by the store
#[derive(Clone, Debug, Default)]
pub struct AppointmentUpdate {
    pub date: Option<NaiveDate>,
    pub time: Option<NaiveTime>,
    pub patient_id: Option<PatientId>,
    pub doctor_id: Option<DoctorId>,
    pub reason: Option<String>,
    pub state: Option<AppointmentState>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub due_at: Option<DateTime<Utc>>,
}

impl AppointmentUpdate {
    pub fn state(state: AppointmentState) -> Self {
        Self {
            state: Some(state),
            ..Self::default()
        }
    }

    pub fn apply(self, appointment: &mut Appointment) {
        if let Some(v) = self.date {
            appointment.date = v;
        }
        if let Some(v) = self.time {
            appointment.time = v;
        }
        if let Some(v) = self.patient_id {
            appointment.patient_id = v;
        }
        if let Some(v) = self.doctor_id {
            appointment.doctor_id = v;
        }
        if let Some(v) = self.reason {
            appointment.reason = v;
        }
        if let Some(v) = self.state {
            appointment.state = v;
        }
        if let Some(v) = self.started_at {
            appointment.started_at = Some(v);
        }
        if let Some(v) = self.finished_at {
            appointment.finished_at = Some(v);
        }
        if let Some(v) = self.due_at {
            appointment.due_at = Some(v);
        }
    }
}

/// Manual edit of a scheduled appointment
#[derive(Clone, Debug, Default)]
pub struct AppointmentEdit {
    pub date: Option<NaiveDate>,
    pub time: Option<NaiveTime>,
    pub patient_id: Option<PatientId>,
    pub doctor_id: Option<DoctorId>,
    pub reason: Option<String>,
}

impl From<AppointmentEdit> for AppointmentUpdate {
    fn from(edit: AppointmentEdit) -> Self {
        AppointmentUpdate {
            date: edit.date,
            time: edit.time,
            patient_id: edit.patient_id,
            doctor_id: edit.doctor_id,
            reason: edit.reason,
            ..AppointmentUpdate::default()
        }
    }
}

// ============================================================================
// Queue and History Types
// ============================================================================

/// A patient waiting for attention.
///
/// `sequence` grows monotonically with every enqueue and breaks ties
/// between patients of the same priority (oldest first).
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct WaitingEntry {
    pub patient_id: PatientId,
    pub priority: Priority,
    pub sequence: u64,
}

/// How an attention reached `Finished`
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CompletionTrigger {
    Timer,
    Manual,
    /// Rebuilt from a finished appointment found in the store
    Resync,
}

/// Immutable snapshot of a finished appointment
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct HistoryRecord {
    pub id: Uuid,
    pub appointment_id: AppointmentId,
    pub date: NaiveDate,
    pub time: NaiveTime,
    pub patient_id: PatientId,
    pub patient_name: String,
    pub doctor_id: DoctorId,
    pub doctor_name: String,
    pub specialty: String,
    pub reason: String,
    pub priority: Priority,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: DateTime<Utc>,
    pub trigger: CompletionTrigger,
}

impl HistoryRecord {
    /// Build a record from a finished appointment and the parties it bound
    pub fn snapshot(
        appointment: &Appointment,
        patient: &Patient,
        doctor: &Doctor,
        trigger: CompletionTrigger,
    ) -> Self {
        HistoryRecord {
            id: Uuid::new_v4(),
            appointment_id: appointment.id,
            date: appointment.date,
            time: appointment.time,
            patient_id: patient.id,
            patient_name: patient.full_name(),
            doctor_id: doctor.id,
            doctor_name: doctor.full_name(),
            specialty: doctor.specialty.clone(),
            reason: appointment.reason.clone(),
            priority: patient.priority,
            started_at: appointment.started_at,
            finished_at: appointment.finished_at.unwrap_or_else(Utc::now),
            trigger,
        }
    }
}
