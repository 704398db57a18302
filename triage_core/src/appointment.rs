//! Appointment lifecycle on top of the appointment store.
//!
//! Every state change is a compare-and-set against the store so that the
//! completion timer, a manual finish and a cancellation racing on the same
//! appointment resolve to exactly one winner.

use crate::store::AppointmentStore;
use crate::types::*;
use crate::{Error, Result};
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use std::sync::Arc;

/// Parameters for booking a regular appointment
#[derive(Clone, Debug)]
pub struct ScheduleRequest {
    pub date: NaiveDate,
    pub time: NaiveTime,
    pub patient_id: PatientId,
    pub doctor_id: DoctorId,
    pub reason: String,
}

/// Appointment state machine over a shared store
#[derive(Clone)]
pub struct AppointmentBook {
    store: Arc<dyn AppointmentStore>,
}

impl AppointmentBook {
    pub fn new(store: Arc<dyn AppointmentStore>) -> Self {
        Self { store }
    }

    pub fn get(&self, id: AppointmentId) -> Result<Appointment> {
        self.store.get(id)
    }

    pub fn list(&self) -> Result<Vec<Appointment>> {
        self.store.list()
    }

    pub fn list_in_state(&self, state: AppointmentState) -> Result<Vec<Appointment>> {
        Ok(self
            .store
            .list()?
            .into_iter()
            .filter(|a| a.state == state)
            .collect())
    }

    /// The patient's scheduled or in-attention appointment, if any
    pub fn active_for(&self, patient_id: PatientId) -> Result<Option<Appointment>> {
        Ok(self
            .store
            .list()?
            .into_iter()
            .find(|a| a.patient_id == patient_id && a.state.is_active()))
    }

    /// Book a `Scheduled` appointment
    pub fn schedule(&self, request: ScheduleRequest) -> Result<Appointment> {
        self.ensure_no_active(request.patient_id, None)?;

        let appointment = self.store.create(NewAppointment {
            date: request.date,
            time: request.time,
            patient_id: request.patient_id,
            doctor_id: request.doctor_id,
            reason: request.reason,
            state: AppointmentState::Scheduled,
            started_at: None,
            due_at: None,
        })?;

        tracing::info!(
            "Scheduled appointment {} for patient {} on {} {}",
            appointment.id,
            appointment.patient_id,
            appointment.date,
            appointment.time
        );
        Ok(appointment)
    }

    /// Put a patient in attention with `doctor`.
    ///
    /// The patient's scheduled appointment is promoted when one exists;
    /// otherwise a new appointment is created directly in attention.
    pub fn begin_attention(
        &self,
        patient: &Patient,
        doctor: &Doctor,
        started_at: DateTime<Utc>,
        due_at: DateTime<Utc>,
    ) -> Result<Appointment> {
        let default_reason = format!("Attention by priority: {}", patient.priority);

        match self.active_for(patient.id)? {
            Some(existing) if existing.state == AppointmentState::Scheduled => {
                let reason = if existing.reason.trim().is_empty() {
                    Some(default_reason)
                } else {
                    None
                };
                let update = AppointmentUpdate {
                    doctor_id: Some(doctor.id),
                    reason,
                    state: Some(AppointmentState::InAttention),
                    started_at: Some(started_at),
                    due_at: Some(due_at),
                    ..AppointmentUpdate::default()
                };
                self.store
                    .update_if_state(existing.id, &[AppointmentState::Scheduled], update)?
                    .ok_or_else(|| {
                        Error::Store(format!(
                            "appointment {} changed state while being promoted",
                            existing.id
                        ))
                    })
            }
            Some(existing) => Err(Error::ActiveAppointmentExists {
                patient: patient.id,
                existing: existing.id,
            }),
            None => {
                let local = started_at.with_timezone(&chrono::Local);
                self.store.create(NewAppointment {
                    date: local.date_naive(),
                    time: local.time(),
                    patient_id: patient.id,
                    doctor_id: doctor.id,
                    reason: default_reason,
                    state: AppointmentState::InAttention,
                    started_at: Some(started_at),
                    due_at: Some(due_at),
                })
            }
        }
    }

    /// Replace fields of a scheduled appointment
    pub fn edit(&self, id: AppointmentId, edit: AppointmentEdit) -> Result<Appointment> {
        let current = self.store.get(id)?;
        if current.state != AppointmentState::Scheduled {
            return Err(Error::InvalidStateForEdit {
                id,
                state: current.state,
            });
        }
        if let Some(patient_id) = edit.patient_id {
            self.ensure_no_active(patient_id, Some(id))?;
        }

        match self
            .store
            .update_if_state(id, &[AppointmentState::Scheduled], edit.into())?
        {
            Some(updated) => {
                tracing::info!("Edited appointment {}", id);
                Ok(updated)
            }
            None => {
                let state = self.store.get(id)?.state;
                Err(Error::InvalidStateForEdit { id, state })
            }
        }
    }

    /// Move a scheduled appointment to a new date/time.
    ///
    /// The original becomes `Rescheduled` (terminal) and a new `Scheduled`
    /// appointment carries the new slot. Returns `(old, new)`.
    pub fn reschedule(
        &self,
        id: AppointmentId,
        date: NaiveDate,
        time: NaiveTime,
    ) -> Result<(Appointment, Appointment)> {
        let old = self.transition(id, AppointmentState::Rescheduled, AppointmentUpdate::default())?;

        let new = self.store.create(NewAppointment {
            date,
            time,
            patient_id: old.patient_id,
            doctor_id: old.doctor_id,
            reason: old.reason.clone(),
            state: AppointmentState::Scheduled,
            started_at: None,
            due_at: None,
        })?;

        tracing::info!("Rescheduled appointment {} as {}", old.id, new.id);
        Ok((old, new))
    }

    /// Cancel a scheduled or in-attention appointment.
    ///
    /// Returns the appointment as it was before cancellation so callers can
    /// release what it held.
    pub fn cancel(&self, id: AppointmentId) -> Result<(AppointmentState, Appointment)> {
        let before = self.store.get(id)?;
        let cancelled = self.transition(id, AppointmentState::Cancelled, AppointmentUpdate::default())?;
        tracing::info!("Cancelled appointment {} (was {})", id, before.state);
        Ok((before.state, cancelled))
    }

    /// Finish an appointment that is still in attention.
    ///
    /// Returns `None` when it already left `InAttention`; nothing is written
    /// in that case.
    pub fn finish(&self, id: AppointmentId, finished_at: DateTime<Utc>) -> Result<Option<Appointment>> {
        let update = AppointmentUpdate {
            state: Some(AppointmentState::Finished),
            finished_at: Some(finished_at),
            ..AppointmentUpdate::default()
        };
        self.store
            .update_if_state(id, &[AppointmentState::InAttention], update)
    }

    /// Apply a lifecycle transition, checking it is legal from the current state
    fn transition(
        &self,
        id: AppointmentId,
        to: AppointmentState,
        mut update: AppointmentUpdate,
    ) -> Result<Appointment> {
        let current = self.store.get(id)?;
        if !current.state.can_transition_to(to) {
            return Err(Error::InvalidTransition {
                id,
                from: current.state,
                to,
            });
        }

        update.state = Some(to);
        self.store
            .update_if_state(id, &[current.state], update)?
            .ok_or_else(|| {
                let from = self
                    .store
                    .get(id)
                    .map(|a| a.state)
                    .unwrap_or(current.state);
                Error::InvalidTransition { id, from, to }
            })
    }

    fn ensure_no_active(&self, patient_id: PatientId, except: Option<AppointmentId>) -> Result<()> {
        match self.active_for(patient_id)? {
            Some(existing) if Some(existing.id) != except => Err(Error::ActiveAppointmentExists {
                patient: patient_id,
                existing: existing.id,
            }),
            _ => Ok(()),
        }
    }
}
