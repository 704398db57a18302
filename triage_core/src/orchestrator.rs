//! Attention orchestrator: the attend-next workflow and its completion.
//!
//! `attend_next` runs three steps under a single lock:
//! 1. Pop the most urgent waiting patient
//! 2. Claim a free doctor (re-queueing the patient if none is free)
//! 3. Put the patient's appointment in attention
//!
//! It then arms a one-shot completion timer and returns without waiting.
//! When the timer fires (or someone finishes the attention by hand) the
//! appointment is finished, the doctor released and a history record
//! pushed. Completion is state-checked so it happens at most once and never
//! touches an appointment that left attention in the meantime.

use crate::appointment::{AppointmentBook, ScheduleRequest};
use crate::config::{AttentionConfig, Config};
use crate::events::{EngineEvent, EventBus};
use crate::history::HistoryStack;
use crate::queue::PriorityQueue;
use crate::registry::DoctorRegistry;
use crate::snapshot::ClinicSnapshot;
use crate::store::*;
use crate::types::*;
use crate::{Error, Result};
use chrono::{NaiveDate, NaiveTime, Utc};
use rand::Rng;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::broadcast;

/// How long attentions last and which doctors attend-next may use
#[derive(Clone, Debug, PartialEq)]
pub struct AttentionPolicy {
    pub min_duration: Duration,
    pub max_duration: Duration,
    pub specialty: Option<String>,
}

impl AttentionPolicy {
    /// Pick a completion delay uniformly from the configured range
    pub fn pick_duration(&self) -> Duration {
        let min = self.min_duration.as_millis() as u64;
        let max = self.max_duration.as_millis() as u64;
        if max <= min {
            return self.min_duration;
        }
        Duration::from_millis(rand::thread_rng().gen_range(min..=max))
    }
}

impl Default for AttentionPolicy {
    fn default() -> Self {
        AttentionPolicy::from(&AttentionConfig::default())
    }
}

impl From<&AttentionConfig> for AttentionPolicy {
    fn from(config: &AttentionConfig) -> Self {
        let (min_duration, max_duration) = config.duration_range();
        AttentionPolicy {
            min_duration,
            max_duration,
            specialty: config.default_specialty.clone(),
        }
    }
}

/// Result of a successful attend-next
#[derive(Clone, Debug)]
pub struct Attention {
    pub appointment: Appointment,
    pub patient: Patient,
    pub doctor: Doctor,
    /// Delay until the completion timer fires
    pub duration: Duration,
}

/// One line of the triage board
#[derive(Clone, Debug)]
pub struct TriageRow {
    pub patient: Patient,
    /// Present while the patient is waiting
    pub entry: Option<WaitingEntry>,
}

impl TriageRow {
    pub fn in_attention(&self) -> bool {
        self.patient.in_attention
    }
}

/// What `recover` found after loading persisted state
#[derive(Clone, Debug, Default)]
pub struct RecoveryReport {
    /// Finished appointments added to history because they were missing
    pub resynced: usize,
    /// Appointments in attention with no completion timer armed
    pub unattended: Vec<Appointment>,
}

/// Builder for [`Orchestrator`]
pub struct OrchestratorBuilder {
    patients: Arc<dyn PatientStore>,
    doctors: Arc<dyn DoctorStore>,
    appointments: Arc<dyn AppointmentStore>,
    queue: PriorityQueue,
    history: HistoryStack,
    policy: AttentionPolicy,
    event_capacity: usize,
    runtime: Option<Handle>,
}

impl OrchestratorBuilder {
    pub fn new(
        patients: Arc<dyn PatientStore>,
        doctors: Arc<dyn DoctorStore>,
        appointments: Arc<dyn AppointmentStore>,
    ) -> Self {
        Self {
            patients,
            doctors,
            appointments,
            queue: PriorityQueue::new(),
            history: HistoryStack::new(),
            policy: AttentionPolicy::default(),
            event_capacity: 64,
            runtime: None,
        }
    }

    /// Start from in-memory stores filled from a snapshot
    pub fn from_snapshot(snapshot: ClinicSnapshot) -> Self {
        let queue = PriorityQueue::from_entries(snapshot.waiting, snapshot.next_sequence);
        let mut builder = Self::new(
            Arc::new(MemoryPatientStore::from_records(snapshot.patients)),
            Arc::new(MemoryDoctorStore::from_records(snapshot.doctors)),
            Arc::new(MemoryAppointmentStore::from_records(snapshot.appointments)),
        );
        builder.queue = queue;
        builder
    }

    pub fn config(mut self, config: &Config) -> Self {
        self.policy = AttentionPolicy::from(&config.attention);
        self.event_capacity = config.events.capacity;
        self
    }

    pub fn policy(mut self, policy: AttentionPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn history(mut self, history: HistoryStack) -> Self {
        self.history = history;
        self
    }

    pub fn runtime(mut self, handle: Handle) -> Self {
        self.runtime = Some(handle);
        self
    }

    /// Build the orchestrator.
    ///
    /// Completion timers run on the given runtime, or on the runtime this is
    /// called from.
    pub fn build(self) -> Result<Orchestrator> {
        let runtime = match self.runtime {
            Some(handle) => handle,
            None => Handle::try_current().map_err(|e| {
                Error::Runtime(format!("completion timers need a tokio runtime: {}", e))
            })?,
        };

        Ok(Orchestrator {
            inner: Arc::new(Inner {
                patients: self.patients,
                registry: DoctorRegistry::new(self.doctors),
                book: AppointmentBook::new(self.appointments),
                queue: Mutex::new(self.queue),
                history: RwLock::new(self.history),
                attend_lock: Mutex::new(()),
                timers: Mutex::new(HashSet::new()),
                policy: self.policy,
                events: EventBus::new(self.event_capacity),
                runtime,
            }),
        })
    }
}

/// Coordinates the queue, the doctor registry, appointments and history
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    patients: Arc<dyn PatientStore>,
    registry: DoctorRegistry,
    book: AppointmentBook,
    queue: Mutex<PriorityQueue>,
    history: RwLock<HistoryStack>,
    /// Serializes attend-next steps 1-3 with every other operation that
    /// creates active appointments, queues patients or frees doctors
    attend_lock: Mutex<()>,
    timers: Mutex<HashSet<AppointmentId>>,
    policy: AttentionPolicy,
    events: EventBus,
    runtime: Handle,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Orchestrator {
    pub fn patients(&self) -> &Arc<dyn PatientStore> {
        &self.inner.patients
    }

    pub fn registry(&self) -> &DoctorRegistry {
        &self.inner.registry
    }

    pub fn appointments(&self) -> &AppointmentBook {
        &self.inner.book
    }

    pub fn policy(&self) -> &AttentionPolicy {
        &self.inner.policy
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.inner.events.subscribe()
    }

    // ------------------------------------------------------------------
    // Triage queue
    // ------------------------------------------------------------------

    /// Put a registered patient in the waiting queue
    pub fn enqueue(&self, patient_id: PatientId) -> Result<WaitingEntry> {
        let _attend = lock(&self.inner.attend_lock);
        let patient = self.inner.patients.get(patient_id)?;
        let entry = lock(&self.inner.queue).enqueue(&patient)?;

        tracing::info!(
            "Patient {} ({}) waiting at priority {}",
            patient.id,
            patient.full_name(),
            patient.priority
        );
        self.inner
            .events
            .publish(EngineEvent::PatientQueued { entry });
        Ok(entry)
    }

    /// Take a patient out of the waiting queue
    pub fn withdraw(&self, patient_id: PatientId) -> Result<WaitingEntry> {
        self.inner.patients.get(patient_id)?;
        let entry = lock(&self.inner.queue)
            .remove(patient_id)
            .ok_or(Error::NotQueued(patient_id))?;
        tracing::info!("Patient {} withdrawn from the queue", patient_id);
        self.inner
            .events
            .publish(EngineEvent::PatientWithdrawn { patient_id });
        Ok(entry)
    }

    /// Re-triage a patient; a waiting patient keeps its arrival order
    pub fn set_priority(&self, patient_id: PatientId, priority: Priority) -> Result<Patient> {
        let patient = self.inner.patients.update(
            patient_id,
            PatientUpdate {
                priority: Some(priority),
                ..PatientUpdate::default()
            },
        )?;
        lock(&self.inner.queue).update_priority(patient_id, priority);
        Ok(patient)
    }

    /// Waiting entries in the order attend-next will take them
    pub fn waiting(&self) -> Vec<WaitingEntry> {
        lock(&self.inner.queue).list_ascending().collect()
    }

    /// Waiting patients (most urgent first) followed by those in attention
    pub fn triage_listing(&self) -> Result<Vec<TriageRow>> {
        let entries = self.waiting();
        let mut rows = Vec::with_capacity(entries.len());
        for entry in entries {
            match self.inner.patients.get(entry.patient_id) {
                Ok(patient) => rows.push(TriageRow {
                    patient,
                    entry: Some(entry),
                }),
                Err(Error::NotFound { .. }) => {
                    tracing::warn!("Queued patient {} no longer exists", entry.patient_id);
                }
                Err(e) => return Err(e),
            }
        }

        let mut attending: Vec<Patient> = self
            .inner
            .patients
            .list()?
            .into_iter()
            .filter(|p| p.in_attention)
            .collect();
        attending.sort_by_key(|p| (p.priority, p.id));
        rows.extend(attending.into_iter().map(|patient| TriageRow {
            patient,
            entry: None,
        }));
        Ok(rows)
    }

    // ------------------------------------------------------------------
    // Attend next
    // ------------------------------------------------------------------

    /// Attend the most urgent waiting patient with any free doctor allowed
    /// by the policy
    pub fn attend_next(&self) -> Result<Attention> {
        let specialty = self.inner.policy.specialty.clone();
        self.attend_next_for(specialty.as_deref())
    }

    /// Attend the most urgent waiting patient with a doctor of `specialty`
    pub fn attend_next_for(&self, specialty: Option<&str>) -> Result<Attention> {
        let result = self.inner.start_attention(specialty);

        match &result {
            Ok(attention) => {
                self.arm_completion(attention.appointment.id, attention.duration);
                tracing::info!(
                    "Patient {} ({}, {}) in attention with doctor {} as appointment {}, completes in {:.1}s",
                    attention.patient.id,
                    attention.patient.full_name(),
                    attention.patient.priority,
                    attention.doctor.full_name(),
                    attention.appointment.id,
                    attention.duration.as_secs_f64()
                );
                self.inner.events.publish(EngineEvent::AttentionStarted {
                    appointment_id: attention.appointment.id,
                    patient_id: attention.patient.id,
                    doctor_id: attention.doctor.id,
                    duration: attention.duration,
                });
            }
            Err(e) if e.is_expected() => tracing::info!("Attend-next: {}", e),
            Err(e) => tracing::error!("Attend-next failed: {}", e),
        }

        result
    }

    fn arm_completion(&self, appointment_id: AppointmentId, duration: Duration) {
        lock(&self.inner.timers).insert(appointment_id);

        let inner = Arc::clone(&self.inner);
        self.inner.runtime.spawn(async move {
            tokio::time::sleep(duration).await;
            lock(&inner.timers).remove(&appointment_id);
            if let Err(e) = inner.complete(appointment_id, CompletionTrigger::Timer) {
                tracing::error!(
                    "Completion timer for appointment {} failed: {}",
                    appointment_id,
                    e
                );
            }
        });
        tracing::debug!(
            "Armed completion timer for appointment {} ({:?})",
            appointment_id,
            duration
        );
    }

    /// Appointments whose completion timer is still pending
    pub fn armed_timers(&self) -> Vec<AppointmentId> {
        let mut ids: Vec<_> = lock(&self.inner.timers).iter().copied().collect();
        ids.sort();
        ids
    }

    /// Appointments in attention that no timer will ever finish
    pub fn unattended(&self) -> Result<Vec<Appointment>> {
        let armed = lock(&self.inner.timers).clone();
        Ok(self
            .inner
            .book
            .list_in_state(AppointmentState::InAttention)?
            .into_iter()
            .filter(|a| !armed.contains(&a.id))
            .collect())
    }

    // ------------------------------------------------------------------
    // Completion and manual overrides
    // ------------------------------------------------------------------

    /// Finish an attention now instead of waiting for its timer
    pub fn finish_now(&self, appointment_id: AppointmentId) -> Result<HistoryRecord> {
        match self
            .inner
            .complete(appointment_id, CompletionTrigger::Manual)?
        {
            Some(record) => Ok(record),
            None => {
                let state = self.inner.book.get(appointment_id)?.state;
                Err(Error::InvalidTransition {
                    id: appointment_id,
                    from: state,
                    to: AppointmentState::Finished,
                })
            }
        }
    }

    /// Free a doctor by hand.
    ///
    /// If the doctor is attending someone, that attention is finished first
    /// (which releases the doctor). Returns whether the doctor was busy.
    pub fn release_doctor(&self, doctor_id: DoctorId) -> Result<bool> {
        // Nobody may acquire the doctor between the lookup and the release
        let _attend = lock(&self.inner.attend_lock);

        let doctor = self.inner.registry.store().get(doctor_id)?;
        let holding = self
            .inner
            .book
            .list_in_state(AppointmentState::InAttention)?
            .into_iter()
            .find(|a| a.doctor_id == doctor_id);

        if let Some(appointment) = holding {
            // A `None` means the timer finished it first and already released
            // the doctor
            return Ok(self
                .inner
                .complete(appointment.id, CompletionTrigger::Manual)?
                .is_some());
        }

        let released = self.inner.registry.release(doctor.id)?;
        if released {
            tracing::info!("Doctor {} released manually", doctor.full_name());
            self.inner
                .events
                .publish(EngineEvent::DoctorReleased { doctor_id });
        }
        Ok(released)
    }

    /// Cancel an appointment; an attention in progress frees its doctor and
    /// patient, and its timer will find nothing to do
    pub fn cancel(&self, appointment_id: AppointmentId) -> Result<Appointment> {
        let (previous, cancelled) = self.inner.book.cancel(appointment_id)?;

        if previous == AppointmentState::InAttention {
            self.inner.registry.release(cancelled.doctor_id)?;
            self.inner
                .patients
                .update(cancelled.patient_id, PatientUpdate::in_attention(false))?;
        }

        self.inner.events.publish(EngineEvent::AppointmentCancelled {
            appointment_id,
            previous,
        });
        Ok(cancelled)
    }

    // ------------------------------------------------------------------
    // Appointment management
    // ------------------------------------------------------------------

    pub fn schedule(&self, request: ScheduleRequest) -> Result<Appointment> {
        let _attend = lock(&self.inner.attend_lock);
        self.inner.patients.get(request.patient_id)?;
        self.inner.registry.store().get(request.doctor_id)?;
        self.inner.book.schedule(request)
    }

    pub fn edit(&self, appointment_id: AppointmentId, edit: AppointmentEdit) -> Result<Appointment> {
        let _attend = lock(&self.inner.attend_lock);
        if let Some(patient_id) = edit.patient_id {
            self.inner.patients.get(patient_id)?;
        }
        if let Some(doctor_id) = edit.doctor_id {
            self.inner.registry.store().get(doctor_id)?;
        }
        self.inner.book.edit(appointment_id, edit)
    }

    pub fn reschedule(
        &self,
        appointment_id: AppointmentId,
        date: NaiveDate,
        time: NaiveTime,
    ) -> Result<(Appointment, Appointment)> {
        let _attend = lock(&self.inner.attend_lock);
        self.inner.book.reschedule(appointment_id, date, time)
    }

    // ------------------------------------------------------------------
    // History
    // ------------------------------------------------------------------

    /// Run `f` against the history stack without copying it
    pub fn with_history<R>(&self, f: impl FnOnce(&HistoryStack) -> R) -> R {
        let history = self
            .inner
            .history
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        f(&history)
    }

    /// All history records, most recent first
    pub fn history(&self) -> Vec<HistoryRecord> {
        self.with_history(|h| h.list().cloned().collect())
    }

    pub fn search_history(&self, pattern: &str) -> Vec<HistoryRecord> {
        self.with_history(|h| h.search(pattern).cloned().collect())
    }

    pub fn latest_history(&self) -> Option<HistoryRecord> {
        self.with_history(|h| h.latest().cloned())
    }

    pub fn find_history(&self, appointment_id: AppointmentId) -> Result<HistoryRecord> {
        self.with_history(|h| h.find(appointment_id).cloned())
            .ok_or(Error::NotFound {
                entity: crate::error::Entity::HistoryRecord,
                id: appointment_id.0,
            })
    }

    // ------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------

    /// Reconcile persisted state after a start.
    ///
    /// Finished appointments missing from history are added to it, and
    /// attentions left without a timer are reported.
    pub fn recover(&self) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::default();

        for appointment in self.inner.book.list_in_state(AppointmentState::Finished)? {
            let known = self.with_history(|h| h.contains(appointment.id));
            if known {
                continue;
            }
            let patient = self.inner.patients.get(appointment.patient_id);
            let doctor = self.inner.registry.store().get(appointment.doctor_id);
            match (patient, doctor) {
                (Ok(patient), Ok(doctor)) => {
                    let record = HistoryRecord::snapshot(
                        &appointment,
                        &patient,
                        &doctor,
                        CompletionTrigger::Resync,
                    );
                    self.inner.push_history(record)?;
                    report.resynced += 1;
                }
                _ => tracing::warn!(
                    "Finished appointment {} references missing records, not added to history",
                    appointment.id
                ),
            }
        }

        report.unattended = self.unattended()?;
        for appointment in &report.unattended {
            tracing::warn!(
                "Appointment {} is in attention without a completion timer (due {:?}); finish it manually",
                appointment.id,
                appointment.due_at
            );
        }

        if report.resynced > 0 {
            tracing::info!("Resynced {} finished appointments into history", report.resynced);
        }
        Ok(report)
    }

    /// Capture stores and queue for persistence
    pub fn snapshot(&self) -> Result<ClinicSnapshot> {
        let (waiting, next_sequence) = {
            let queue = lock(&self.inner.queue);
            (queue.list_ascending().collect(), queue.next_sequence())
        };
        Ok(ClinicSnapshot {
            patients: self.inner.patients.list()?,
            doctors: self.inner.registry.list()?,
            appointments: self.inner.book.list()?,
            waiting,
            next_sequence,
        })
    }
}

impl Inner {
    /// Steps 1-3 of attend-next under the attend lock
    fn start_attention(&self, specialty: Option<&str>) -> Result<Attention> {
        let _attend = lock(&self.attend_lock);

        let entry = lock(&self.queue).dequeue_highest()?;

        let patient = match self.patients.get(entry.patient_id) {
            Ok(patient) => patient,
            Err(e @ Error::NotFound { .. }) => {
                tracing::warn!(
                    "Dropping queued patient {}: record no longer exists",
                    entry.patient_id
                );
                return Err(e);
            }
            Err(e) => {
                lock(&self.queue).restore(entry);
                return Err(e);
            }
        };

        let preferred = self
            .book
            .active_for(patient.id)
            .ok()
            .flatten()
            .filter(|a| a.state == AppointmentState::Scheduled)
            .map(|a| a.doctor_id);

        let doctor = match self.registry.claim_free(specialty, preferred) {
            Ok(doctor) => doctor,
            Err(e) => {
                lock(&self.queue).restore(entry);
                tracing::warn!(
                    "CompensationReenqueue: patient {} returned to the queue at priority {} (sequence {}): {}",
                    entry.patient_id,
                    entry.priority,
                    entry.sequence,
                    e
                );
                self.events
                    .publish(EngineEvent::CompensationReenqueue { entry });
                return Err(match e {
                    Error::NoDoctorAvailable { specialty, .. } => Error::NoDoctorAvailable {
                        specialty,
                        requeued: Some(entry.patient_id),
                    },
                    other => other,
                });
            }
        };

        let duration = self.policy.pick_duration();
        let started_at = Utc::now();
        let due_at = started_at
            + chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::zero());

        let begun = self
            .book
            .begin_attention(&patient, &doctor, started_at, due_at)
            .and_then(|appointment| {
                let patient = self
                    .patients
                    .update(patient.id, PatientUpdate::in_attention(true))?;
                Ok((appointment, patient))
            });

        match begun {
            Ok((appointment, patient)) => Ok(Attention {
                appointment,
                patient,
                doctor,
                duration,
            }),
            Err(e) => {
                if let Err(release_err) = self.registry.release(doctor.id) {
                    tracing::error!(
                        "Failed to release doctor {} after aborted attention: {}",
                        doctor.id,
                        release_err
                    );
                }
                lock(&self.queue).restore(entry);
                tracing::warn!(
                    "CompensationReenqueue: patient {} returned to the queue after failed appointment step: {}",
                    entry.patient_id,
                    e
                );
                self.events
                    .publish(EngineEvent::CompensationReenqueue { entry });
                Err(e)
            }
        }
    }

    /// Finish an appointment still in attention.
    ///
    /// Returns `None`, changing nothing, when it already left attention.
    fn complete(
        &self,
        appointment_id: AppointmentId,
        trigger: CompletionTrigger,
    ) -> Result<Option<HistoryRecord>> {
        let appointment = match self.book.finish(appointment_id, Utc::now()) {
            Ok(Some(appointment)) => appointment,
            Ok(None) => {
                let state = self.book.get(appointment_id)?.state;
                tracing::info!(
                    "Completion ({:?}) for appointment {} skipped: appointment is {}",
                    trigger,
                    appointment_id,
                    state
                );
                self.events.publish(EngineEvent::CompletionSkipped {
                    appointment_id,
                    state,
                });
                return Ok(None);
            }
            Err(Error::NotFound { .. }) => {
                tracing::info!(
                    "Completion ({:?}) for appointment {} skipped: appointment no longer exists",
                    trigger,
                    appointment_id
                );
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        // The appointment is finished now; run every remaining step and
        // report the first failure afterwards. `recover` adds a missing
        // history record on the next start.
        let mut failure: Option<Error> = None;
        let mut note = |step: &str, e: Error| {
            tracing::error!(
                "Completion of appointment {}: {} failed: {}",
                appointment_id,
                step,
                e
            );
            failure.get_or_insert(e);
        };

        if let Err(e) = self.registry.release(appointment.doctor_id) {
            note("doctor release", e);
        }
        let patient = match self
            .patients
            .update(appointment.patient_id, PatientUpdate::in_attention(false))
        {
            Ok(patient) => Some(patient),
            Err(e) => {
                note("patient update", e);
                self.patients.get(appointment.patient_id).ok()
            }
        };
        let doctor = match self.registry.store().get(appointment.doctor_id) {
            Ok(doctor) => Some(doctor),
            Err(e) => {
                note("doctor lookup", e);
                None
            }
        };

        self.events.publish(EngineEvent::AttentionFinished {
            appointment_id: appointment.id,
            doctor_id: appointment.doctor_id,
            trigger,
        });

        let record = match (patient, doctor) {
            (Some(patient), Some(doctor)) => {
                let record = HistoryRecord::snapshot(&appointment, &patient, &doctor, trigger);
                match self.push_history(record.clone()) {
                    Ok(()) => Some(record),
                    Err(e) => {
                        note("history push", e);
                        None
                    }
                }
            }
            _ => None,
        };

        if let Some(e) = failure {
            return Err(e);
        }
        let record = record.ok_or_else(|| {
            Error::Other(format!("appointment {} finished without a record", appointment_id))
        })?;

        tracing::info!(
            "Appointment {} finished ({:?}): {} attended by {}",
            appointment.id,
            trigger,
            record.patient_name,
            record.doctor_name
        );
        Ok(Some(record))
    }

    fn push_history(&self, record: HistoryRecord) -> Result<()> {
        self.history
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::HistorySink;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Barrier;

    /// Appointment store whose next `slow_lists` listings return a stale
    /// view after a delay
    struct SlowAppointmentStore {
        inner: MemoryAppointmentStore,
        slow_lists: AtomicUsize,
        delay: Duration,
    }

    impl SlowAppointmentStore {
        fn new(delay: Duration) -> Self {
            Self {
                inner: MemoryAppointmentStore::new(),
                slow_lists: AtomicUsize::new(0),
                delay,
            }
        }

        fn slow_down(&self, lists: usize) {
            self.slow_lists.store(lists, Ordering::SeqCst);
        }
    }

    impl AppointmentStore for SlowAppointmentStore {
        fn create(&self, appointment: NewAppointment) -> Result<Appointment> {
            self.inner.create(appointment)
        }

        fn get(&self, id: AppointmentId) -> Result<Appointment> {
            self.inner.get(id)
        }

        fn list(&self) -> Result<Vec<Appointment>> {
            let rows = self.inner.list()?;
            let slow = self
                .slow_lists
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if slow {
                std::thread::sleep(self.delay);
            }
            Ok(rows)
        }

        fn update(&self, id: AppointmentId, fields: AppointmentUpdate) -> Result<Appointment> {
            self.inner.update(id, fields)
        }

        fn update_if_state(
            &self,
            id: AppointmentId,
            expected: &[AppointmentState],
            fields: AppointmentUpdate,
        ) -> Result<Option<Appointment>> {
            self.inner.update_if_state(id, expected, fields)
        }
    }

    struct BrokenSink;

    impl HistorySink for BrokenSink {
        fn append(&mut self, _record: &HistoryRecord) -> Result<()> {
            Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "disk full",
            )))
        }
    }

    fn policy(secs: u64) -> AttentionPolicy {
        AttentionPolicy {
            min_duration: Duration::from_secs(secs),
            max_duration: Duration::from_secs(secs),
            specialty: None,
        }
    }

    /// Orchestrator with the given doctors and patients (all registered, none queued)
    fn clinic(doctors: usize, patients: &[(&str, Priority)]) -> Orchestrator {
        clinic_with(
            doctors,
            patients,
            Arc::new(MemoryAppointmentStore::new()),
            HistoryStack::new(),
        )
    }

    fn clinic_with(
        doctors: usize,
        patients: &[(&str, Priority)],
        appointments: Arc<dyn AppointmentStore>,
        history: HistoryStack,
    ) -> Orchestrator {
        crate::logging::init_test();

        let patient_store = MemoryPatientStore::new();
        for (name, priority) in patients {
            let (first, last) = name.split_once(' ').unwrap_or((*name, "Test"));
            patient_store
                .insert(NewPatient {
                    first_name: first.into(),
                    last_name: last.into(),
                    priority: *priority,
                    ..NewPatient::default()
                })
                .unwrap();
        }

        let doctor_store = MemoryDoctorStore::new();
        for i in 0..doctors {
            doctor_store
                .insert(NewDoctor {
                    first_name: format!("Doctor{}", i + 1),
                    last_name: "Luna".into(),
                    specialty: "General".into(),
                    office: i as u32 + 1,
                })
                .unwrap();
        }

        OrchestratorBuilder::new(
            Arc::new(patient_store),
            Arc::new(doctor_store),
            appointments,
        )
        .policy(policy(45))
        .history(history)
        .build()
        .unwrap()
    }

    fn busy_doctors(orch: &Orchestrator) -> usize {
        orch.registry()
            .list()
            .unwrap()
            .iter()
            .filter(|d| !d.available)
            .count()
    }

    #[tokio::test]
    async fn test_attend_next_takes_patient_and_one_doctor() {
        let orch = clinic(2, &[("Ana García", Priority::Medium), ("Luis Pérez", Priority::High)]);
        orch.enqueue(PatientId(1)).unwrap();
        orch.enqueue(PatientId(2)).unwrap();

        let attention = orch.attend_next().unwrap();

        assert_eq!(attention.patient.id, PatientId(2));
        assert!(attention.patient.in_attention);
        assert!(orch.patients().get(PatientId(2)).unwrap().in_attention);
        assert_eq!(attention.appointment.state, AppointmentState::InAttention);
        assert_eq!(attention.appointment.doctor_id, attention.doctor.id);
        assert_eq!(attention.duration, Duration::from_secs(45));
        assert_eq!(busy_doctors(&orch), 1);
        assert_eq!(orch.waiting().len(), 1);
        assert_eq!(orch.armed_timers(), vec![attention.appointment.id]);
    }

    #[tokio::test]
    async fn test_queue_empty_is_reported() {
        let orch = clinic(1, &[]);
        assert!(matches!(orch.attend_next(), Err(Error::QueueEmpty)));
        assert_eq!(busy_doctors(&orch), 0);
    }

    #[tokio::test]
    async fn test_no_doctor_requeues_patient_at_original_position() {
        let orch = clinic(
            0,
            &[
                ("Ana García", Priority::Medium),
                ("Luis Pérez", Priority::High),
                ("Eva Sanz", Priority::Medium),
            ],
        );
        for id in 1..=3 {
            orch.enqueue(PatientId(id)).unwrap();
        }
        let before = orch.waiting();
        let mut events = orch.subscribe();

        let err = orch.attend_next().unwrap_err();

        assert!(matches!(
            err,
            Error::NoDoctorAvailable { requeued: Some(PatientId(2)), .. }
        ));
        assert_eq!(orch.waiting(), before);
        assert!(!orch.patients().get(PatientId(2)).unwrap().in_attention);
        assert!(orch.appointments().list().unwrap().is_empty());
        assert!(matches!(
            events.try_recv().unwrap(),
            EngineEvent::CompensationReenqueue { entry } if entry == before[0]
        ));
    }

    #[tokio::test]
    async fn test_patient_in_attention_cannot_be_requeued() {
        let orch = clinic(1, &[("Ana García", Priority::High)]);
        orch.enqueue(PatientId(1)).unwrap();
        assert!(matches!(
            orch.enqueue(PatientId(1)),
            Err(Error::AlreadyQueued(_))
        ));

        orch.attend_next().unwrap();
        assert!(matches!(
            orch.enqueue(PatientId(1)),
            Err(Error::AlreadyQueued(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_finishes_attention() {
        let orch = clinic(1, &[("Ana García", Priority::High)]);
        orch.enqueue(PatientId(1)).unwrap();
        let attention = orch.attend_next().unwrap();
        assert!(orch.history().is_empty());

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(orch.history().is_empty(), "finished before its timer fired");

        tokio::time::sleep(Duration::from_secs(16)).await;

        let appointment = orch.appointments().get(attention.appointment.id).unwrap();
        assert_eq!(appointment.state, AppointmentState::Finished);
        assert!(appointment.finished_at.is_some());
        assert!(orch.registry().store().get(attention.doctor.id).unwrap().available);
        assert!(!orch.patients().get(PatientId(1)).unwrap().in_attention);

        let history = orch.history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].appointment_id, attention.appointment.id);
        assert_eq!(history[0].trigger, CompletionTrigger::Timer);
        assert!(orch.armed_timers().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_before_timer_prevents_history() {
        let orch = clinic(1, &[("Ana García", Priority::High)]);
        orch.enqueue(PatientId(1)).unwrap();
        let attention = orch.attend_next().unwrap();

        orch.cancel(attention.appointment.id).unwrap();
        assert!(orch.registry().store().get(attention.doctor.id).unwrap().available);
        assert!(!orch.patients().get(PatientId(1)).unwrap().in_attention);

        tokio::time::sleep(Duration::from_secs(60)).await;

        assert_eq!(
            orch.appointments().get(attention.appointment.id).unwrap().state,
            AppointmentState::Cancelled
        );
        assert!(orch.history().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_finish_now_then_timer_is_noop() {
        let orch = clinic(1, &[("Ana García", Priority::High), ("Luis Pérez", Priority::Low)]);
        orch.enqueue(PatientId(1)).unwrap();
        orch.enqueue(PatientId(2)).unwrap();
        let first = orch.attend_next().unwrap();

        let record = orch.finish_now(first.appointment.id).unwrap();
        assert_eq!(record.trigger, CompletionTrigger::Manual);

        // The freed doctor takes the next patient before the first timer fires
        let second = orch.attend_next().unwrap();
        assert_eq!(second.doctor.id, first.doctor.id);

        tokio::time::sleep(Duration::from_secs(46)).await;

        // First timer fired as a no-op, second finished its own appointment
        let history = orch.history();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].appointment_id, second.appointment.id);
        assert_eq!(history[1].appointment_id, first.appointment.id);

        assert!(matches!(
            orch.finish_now(first.appointment.id),
            Err(Error::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_release_doctor_finishes_its_attention() {
        let orch = clinic(1, &[("Ana García", Priority::High)]);
        orch.enqueue(PatientId(1)).unwrap();
        let attention = orch.attend_next().unwrap();

        assert!(orch.release_doctor(attention.doctor.id).unwrap());
        assert_eq!(
            orch.appointments().get(attention.appointment.id).unwrap().state,
            AppointmentState::Finished
        );
        assert_eq!(orch.history().len(), 1);

        // Already free: no-op
        assert!(!orch.release_doctor(attention.doctor.id).unwrap());
    }

    #[tokio::test]
    async fn test_attend_promotes_scheduled_appointment_with_its_doctor() {
        let orch = clinic(2, &[("Ana García", Priority::Low)]);
        let scheduled = orch
            .schedule(ScheduleRequest {
                date: NaiveDate::from_ymd_opt(2024, 6, 10).unwrap(),
                time: NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
                patient_id: PatientId(1),
                doctor_id: DoctorId(2),
                reason: "Control".into(),
            })
            .unwrap();
        orch.enqueue(PatientId(1)).unwrap();

        let attention = orch.attend_next().unwrap();

        assert_eq!(attention.appointment.id, scheduled.id);
        assert_eq!(attention.doctor.id, DoctorId(2));
        assert_eq!(orch.appointments().list().unwrap().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_attend_with_single_doctor() {
        let orch = clinic(1, &[("Ana García", Priority::High), ("Luis Pérez", Priority::High)]);
        orch.enqueue(PatientId(1)).unwrap();
        orch.enqueue(PatientId(2)).unwrap();

        let barrier = Barrier::new(2);
        let results: Vec<Result<Attention>> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..2)
                .map(|_| {
                    s.spawn(|| {
                        barrier.wait();
                        orch.attend_next()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let successes: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
        assert_eq!(successes.len(), 1);
        assert_eq!(successes[0].doctor.id, DoctorId(1));
        assert_eq!(successes[0].patient.id, PatientId(1));

        let failure = results.iter().find_map(|r| r.as_ref().err()).unwrap();
        assert!(matches!(
            failure,
            Error::NoDoctorAvailable { requeued: Some(PatientId(2)), .. }
        ));
        assert_eq!(
            orch.waiting().iter().map(|e| e.patient_id).collect::<Vec<_>>(),
            vec![PatientId(2)]
        );
        assert_eq!(busy_doctors(&orch), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_schedule_racing_attend_keeps_one_active_appointment() {
        let store = Arc::new(SlowAppointmentStore::new(Duration::from_millis(20)));
        let orch = clinic_with(
            1,
            &[("Ana García", Priority::High)],
            store.clone(),
            HistoryStack::new(),
        );
        orch.enqueue(PatientId(1)).unwrap();
        store.slow_down(usize::MAX);

        let barrier = Barrier::new(2);
        let (attend, schedule) = std::thread::scope(|s| {
            let attend = s.spawn(|| {
                barrier.wait();
                orch.attend_next()
            });
            let schedule = s.spawn(|| {
                barrier.wait();
                orch.schedule(ScheduleRequest {
                    date: NaiveDate::from_ymd_opt(2024, 6, 10).unwrap(),
                    time: NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
                    patient_id: PatientId(1),
                    doctor_id: DoctorId(1),
                    reason: "Control".into(),
                })
            });
            (attend.join().unwrap(), schedule.join().unwrap())
        });
        store.slow_down(0);

        assert!(attend.is_ok());
        if let Err(e) = &schedule {
            assert!(matches!(e, Error::ActiveAppointmentExists { .. }), "{}", e);
        }
        let active: Vec<_> = orch
            .appointments()
            .list()
            .unwrap()
            .into_iter()
            .filter(|a| a.patient_id == PatientId(1) && a.state.is_active())
            .collect();
        assert_eq!(active.len(), 1, "{:?}", active);
        assert_eq!(active[0].state, AppointmentState::InAttention);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_release_doctor_keeps_reacquired_doctor_busy() {
        let store = Arc::new(SlowAppointmentStore::new(Duration::from_millis(100)));
        let orch = clinic_with(
            1,
            &[("Ana García", Priority::High), ("Luis Pérez", Priority::High)],
            store.clone(),
            HistoryStack::new(),
        );
        orch.enqueue(PatientId(1)).unwrap();
        orch.enqueue(PatientId(2)).unwrap();
        let first = orch.attend_next().unwrap();

        // The release sees the first attention in a stale listing while the
        // attention is finished and the doctor taken again
        store.slow_down(1);
        let (released, second) = std::thread::scope(|s| {
            let release = s.spawn(|| orch.release_doctor(first.doctor.id));
            let reattend = s.spawn(|| {
                std::thread::sleep(Duration::from_millis(40));
                orch.finish_now(first.appointment.id).unwrap();
                orch.attend_next()
            });
            (release.join().unwrap(), reattend.join().unwrap())
        });

        assert!(!released.unwrap());
        let second = second.unwrap();
        assert_eq!(second.doctor.id, first.doctor.id);
        assert_eq!(
            orch.appointments().get(second.appointment.id).unwrap().state,
            AppointmentState::InAttention
        );
        assert!(!orch.registry().store().get(first.doctor.id).unwrap().available);
    }

    #[tokio::test]
    async fn test_completion_frees_resources_when_history_write_fails() {
        let orch = clinic_with(
            1,
            &[("Ana García", Priority::High)],
            Arc::new(MemoryAppointmentStore::new()),
            HistoryStack::new().with_sink(Box::new(BrokenSink)),
        );
        orch.enqueue(PatientId(1)).unwrap();
        let attention = orch.attend_next().unwrap();

        assert!(matches!(
            orch.finish_now(attention.appointment.id),
            Err(Error::Io(_))
        ));

        assert_eq!(
            orch.appointments().get(attention.appointment.id).unwrap().state,
            AppointmentState::Finished
        );
        assert!(orch.registry().store().get(attention.doctor.id).unwrap().available);
        assert!(!orch.patients().get(PatientId(1)).unwrap().in_attention);
        assert!(orch.history().is_empty());
    }

    #[tokio::test]
    async fn test_triage_listing_shows_attention_state() {
        let orch = clinic(
            1,
            &[
                ("Ana García", Priority::Low),
                ("Luis Pérez", Priority::High),
                ("Eva Sanz", Priority::Medium),
            ],
        );
        for id in 1..=3 {
            orch.enqueue(PatientId(id)).unwrap();
        }
        orch.attend_next().unwrap();

        let rows = orch.triage_listing().unwrap();
        let view: Vec<(u64, bool)> = rows
            .iter()
            .map(|r| (r.patient.id.0, r.in_attention()))
            .collect();
        assert_eq!(view, vec![(3, false), (1, false), (2, true)]);
        assert!(rows[2].entry.is_none());
    }

    #[tokio::test]
    async fn test_set_priority_reorders_waiting_patient() {
        let orch = clinic(1, &[("Ana García", Priority::Low), ("Luis Pérez", Priority::Medium)]);
        orch.enqueue(PatientId(1)).unwrap();
        orch.enqueue(PatientId(2)).unwrap();

        orch.set_priority(PatientId(1), Priority::High).unwrap();
        assert_eq!(orch.waiting()[0].patient_id, PatientId(1));

        orch.withdraw(PatientId(1)).unwrap();
        assert_eq!(orch.waiting().len(), 1);
        assert!(matches!(
            orch.withdraw(PatientId(1)),
            Err(Error::NotQueued(PatientId(1)))
        ));
        assert!(matches!(
            orch.withdraw(PatientId(9)),
            Err(Error::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_history_search() {
        let orch = clinic(
            3,
            &[
                ("Ana García", Priority::High),
                ("Luis Pérez", Priority::High),
                ("José GARCÍA", Priority::High),
            ],
        );
        for id in 1..=3 {
            orch.enqueue(PatientId(id)).unwrap();
            let attention = orch.attend_next().unwrap();
            orch.finish_now(attention.appointment.id).unwrap();
        }

        let found: Vec<PatientId> = orch
            .search_history("garcía")
            .iter()
            .map(|r| r.patient_id)
            .collect();
        assert_eq!(found, vec![PatientId(3), PatientId(1)]);
        assert!(orch.search_history("martínez").is_empty());
        assert_eq!(orch.latest_history().unwrap().patient_id, PatientId(3));
    }

    #[tokio::test]
    async fn test_snapshot_restores_queue_and_reports_unattended() {
        let orch = clinic(1, &[("Ana García", Priority::High), ("Luis Pérez", Priority::Low)]);
        orch.enqueue(PatientId(1)).unwrap();
        orch.enqueue(PatientId(2)).unwrap();
        let attention = orch.attend_next().unwrap();

        let snapshot = orch.snapshot().unwrap();
        let restored = OrchestratorBuilder::from_snapshot(snapshot)
            .policy(policy(45))
            .build()
            .unwrap();

        assert_eq!(restored.waiting(), orch.waiting());
        let report = restored.recover().unwrap();
        assert_eq!(report.resynced, 0);
        assert_eq!(report.unattended.len(), 1);
        assert_eq!(report.unattended[0].id, attention.appointment.id);

        restored.finish_now(attention.appointment.id).unwrap();
        assert!(restored.unattended().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_recover_resyncs_finished_appointments() {
        let orch = clinic(1, &[("Ana García", Priority::High)]);
        orch.enqueue(PatientId(1)).unwrap();
        let attention = orch.attend_next().unwrap();
        orch.finish_now(attention.appointment.id).unwrap();

        // Fresh history, same stores: the finished appointment is missing
        let restored = OrchestratorBuilder::from_snapshot(orch.snapshot().unwrap())
            .build()
            .unwrap();
        let report = restored.recover().unwrap();

        assert_eq!(report.resynced, 1);
        assert_eq!(
            restored.find_history(attention.appointment.id).unwrap().trigger,
            CompletionTrigger::Resync
        );
        assert_eq!(restored.recover().unwrap().resynced, 0);
    }

    #[test]
    fn test_build_without_runtime_fails() {
        let result = OrchestratorBuilder::new(
            Arc::new(MemoryPatientStore::new()),
            Arc::new(MemoryDoctorStore::new()),
            Arc::new(MemoryAppointmentStore::new()),
        )
        .build();
        assert!(matches!(result, Err(Error::Runtime(_))));
    }

    #[test]
    fn test_pick_duration_within_range() {
        let default_policy = AttentionPolicy::default();
        for _ in 0..100 {
            let d = default_policy.pick_duration();
            assert!(d >= Duration::from_secs(30) && d <= Duration::from_secs(60));
        }
        assert_eq!(policy(5).pick_duration(), Duration::from_secs(5));
    }
}
