//! Record stores for patients, doctors and appointments.
//!
//! The engine never owns persistence; it reads and writes records through
//! these traits. The in-memory implementations back the CLI (restored from
//! and saved to a [`ClinicSnapshot`](crate::snapshot::ClinicSnapshot)) and
//! the tests.

use crate::types::*;
use crate::{Error, Result};
use std::collections::BTreeMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Patient records
pub trait PatientStore: Send + Sync {
    fn insert(&self, patient: NewPatient) -> Result<Patient>;
    fn get(&self, id: PatientId) -> Result<Patient>;
    fn list(&self) -> Result<Vec<Patient>>;
    fn update(&self, id: PatientId, fields: PatientUpdate) -> Result<Patient>;
}

/// Doctor records
pub trait DoctorStore: Send + Sync {
    fn insert(&self, doctor: NewDoctor) -> Result<Doctor>;
    fn get(&self, id: DoctorId) -> Result<Doctor>;
    fn list(&self) -> Result<Vec<Doctor>>;
    fn update(&self, id: DoctorId, fields: DoctorUpdate) -> Result<Doctor>;

    /// Set `available` to `new` only if it currently equals `expected`.
    ///
    /// Returns whether the swap happened.
    fn set_available_if(&self, id: DoctorId, expected: bool, new: bool) -> Result<bool>;
}

/// Appointment records
pub trait AppointmentStore: Send + Sync {
    fn create(&self, appointment: NewAppointment) -> Result<Appointment>;
    fn get(&self, id: AppointmentId) -> Result<Appointment>;
    fn list(&self) -> Result<Vec<Appointment>>;
    fn update(&self, id: AppointmentId, fields: AppointmentUpdate) -> Result<Appointment>;

    /// Apply `fields` only if the current state is one of `expected`.
    ///
    /// Returns `None` when the state did not match.
    fn update_if_state(
        &self,
        id: AppointmentId,
        expected: &[AppointmentState],
        fields: AppointmentUpdate,
    ) -> Result<Option<Appointment>>;
}

// ============================================================================
// In-memory tables
// ============================================================================

/// Id-keyed records behind a lock, with a monotonically growing id counter
#[derive(Debug)]
struct Table<T> {
    inner: RwLock<TableInner<T>>,
}

#[derive(Debug)]
struct TableInner<T> {
    rows: BTreeMap<u64, T>,
    next_id: u64,
}

impl<T: Clone> Table<T> {
    fn from_rows(rows: impl IntoIterator<Item = (u64, T)>) -> Self {
        let rows: BTreeMap<u64, T> = rows.into_iter().collect();
        let next_id = rows.keys().next_back().map(|id| id + 1).unwrap_or(1);
        Self {
            inner: RwLock::new(TableInner { rows, next_id }),
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, TableInner<T>>> {
        self.inner
            .read()
            .map_err(|_| Error::Store("table lock poisoned".into()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, TableInner<T>>> {
        self.inner
            .write()
            .map_err(|_| Error::Store("table lock poisoned".into()))
    }

    fn insert_with(&self, build: impl FnOnce(u64) -> T) -> Result<T> {
        let mut table = self.write()?;
        let id = table.next_id;
        table.next_id += 1;
        let row = build(id);
        table.rows.insert(id, row.clone());
        Ok(row)
    }

    fn get(&self, id: u64) -> Result<Option<T>> {
        Ok(self.read()?.rows.get(&id).cloned())
    }

    fn list(&self) -> Result<Vec<T>> {
        Ok(self.read()?.rows.values().cloned().collect())
    }

    /// Mutate a row in place; `f` returns whether the change was applied
    fn modify<R>(&self, id: u64, f: impl FnOnce(&mut T) -> R) -> Result<Option<R>> {
        let mut table = self.write()?;
        Ok(table.rows.get_mut(&id).map(f))
    }
}

/// In-memory [`PatientStore`]
#[derive(Debug)]
pub struct MemoryPatientStore {
    table: Table<Patient>,
}

impl MemoryPatientStore {
    pub fn new() -> Self {
        Self::from_records(Vec::new())
    }

    pub fn from_records(patients: Vec<Patient>) -> Self {
        Self {
            table: Table::from_rows(patients.into_iter().map(|p| (p.id.0, p))),
        }
    }
}

impl Default for MemoryPatientStore {
    fn default() -> Self {
        Self::new()
    }
}

impl PatientStore for MemoryPatientStore {
    fn insert(&self, patient: NewPatient) -> Result<Patient> {
        self.table.insert_with(|id| Patient {
            id: PatientId(id),
            first_name: patient.first_name,
            last_name: patient.last_name,
            phone: patient.phone,
            email: patient.email,
            priority: patient.priority,
            in_attention: false,
        })
    }

    fn get(&self, id: PatientId) -> Result<Patient> {
        self.table
            .get(id.0)?
            .ok_or_else(|| Error::patient_not_found(id))
    }

    fn list(&self) -> Result<Vec<Patient>> {
        self.table.list()
    }

    fn update(&self, id: PatientId, fields: PatientUpdate) -> Result<Patient> {
        self.table
            .modify(id.0, |patient| {
                fields.apply(patient);
                patient.clone()
            })?
            .ok_or_else(|| Error::patient_not_found(id))
    }
}

/// In-memory [`DoctorStore`]
#[derive(Debug)]
pub struct MemoryDoctorStore {
    table: Table<Doctor>,
}

impl MemoryDoctorStore {
    pub fn new() -> Self {
        Self::from_records(Vec::new())
    }

    pub fn from_records(doctors: Vec<Doctor>) -> Self {
        Self {
            table: Table::from_rows(doctors.into_iter().map(|d| (d.id.0, d))),
        }
    }
}

impl Default for MemoryDoctorStore {
    fn default() -> Self {
        Self::new()
    }
}

impl DoctorStore for MemoryDoctorStore {
    fn insert(&self, doctor: NewDoctor) -> Result<Doctor> {
        self.table.insert_with(|id| Doctor {
            id: DoctorId(id),
            first_name: doctor.first_name,
            last_name: doctor.last_name,
            specialty: doctor.specialty,
            office: doctor.office,
            available: true,
        })
    }

    fn get(&self, id: DoctorId) -> Result<Doctor> {
        self.table
            .get(id.0)?
            .ok_or_else(|| Error::doctor_not_found(id))
    }

    fn list(&self) -> Result<Vec<Doctor>> {
        self.table.list()
    }

    fn update(&self, id: DoctorId, fields: DoctorUpdate) -> Result<Doctor> {
        self.table
            .modify(id.0, |doctor| {
                fields.apply(doctor);
                doctor.clone()
            })?
            .ok_or_else(|| Error::doctor_not_found(id))
    }

    fn set_available_if(&self, id: DoctorId, expected: bool, new: bool) -> Result<bool> {
        self.table
            .modify(id.0, |doctor| {
                if doctor.available == expected {
                    doctor.available = new;
                    true
                } else {
                    false
                }
            })?
            .ok_or_else(|| Error::doctor_not_found(id))
    }
}

/// In-memory [`AppointmentStore`]
#[derive(Debug)]
pub struct MemoryAppointmentStore {
    table: Table<Appointment>,
}

impl MemoryAppointmentStore {
    pub fn new() -> Self {
        Self::from_records(Vec::new())
    }

    pub fn from_records(appointments: Vec<Appointment>) -> Self {
        Self {
            table: Table::from_rows(appointments.into_iter().map(|a| (a.id.0, a))),
        }
    }
}

impl Default for MemoryAppointmentStore {
    fn default() -> Self {
        Self::new()
    }
}

impl AppointmentStore for MemoryAppointmentStore {
    fn create(&self, appointment: NewAppointment) -> Result<Appointment> {
        self.table.insert_with(|id| Appointment {
            id: AppointmentId(id),
            date: appointment.date,
            time: appointment.time,
            patient_id: appointment.patient_id,
            doctor_id: appointment.doctor_id,
            reason: appointment.reason,
            state: appointment.state,
            started_at: appointment.started_at,
            finished_at: None,
            due_at: appointment.due_at,
        })
    }

    fn get(&self, id: AppointmentId) -> Result<Appointment> {
        self.table
            .get(id.0)?
            .ok_or_else(|| Error::appointment_not_found(id))
    }

    fn list(&self) -> Result<Vec<Appointment>> {
        self.table.list()
    }

    fn update(&self, id: AppointmentId, fields: AppointmentUpdate) -> Result<Appointment> {
        self.table
            .modify(id.0, |appointment| {
                fields.apply(appointment);
                appointment.clone()
            })?
            .ok_or_else(|| Error::appointment_not_found(id))
    }

    fn update_if_state(
        &self,
        id: AppointmentId,
        expected: &[AppointmentState],
        fields: AppointmentUpdate,
    ) -> Result<Option<Appointment>> {
        self.table
            .modify(id.0, |appointment| {
                if expected.contains(&appointment.state) {
                    fields.apply(appointment);
                    Some(appointment.clone())
                } else {
                    None
                }
            })?
            .ok_or_else(|| Error::appointment_not_found(id))
    }
}
