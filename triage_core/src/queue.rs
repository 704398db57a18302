//! Priority queue of patients waiting for attention.
//!
//! Entries are ordered by triage priority (High before Medium before Low)
//! and, within a tier, by arrival sequence. Keying a `BTreeMap` on
//! `(priority, sequence)` gives ordered pops and a non-mutating in-order
//! traversal for display from the same structure.

use crate::types::{Patient, PatientId, Priority, WaitingEntry};
use crate::{Error, Result};
use std::collections::{BTreeMap, HashMap};

/// Waiting patients ordered by urgency, then by arrival
#[derive(Debug, Default)]
pub struct PriorityQueue {
    ordered: BTreeMap<(Priority, u64), PatientId>,
    index: HashMap<PatientId, (Priority, u64)>,
    next_sequence: u64,
}

impl PriorityQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a queue from persisted entries.
    ///
    /// `next_sequence` is raised past every restored entry so new arrivals
    /// always sort after them.
    pub fn from_entries(entries: impl IntoIterator<Item = WaitingEntry>, next_sequence: u64) -> Self {
        let mut queue = Self {
            next_sequence,
            ..Self::default()
        };
        for entry in entries {
            queue.restore(entry);
        }
        queue
    }

    /// Add a patient with a fresh arrival sequence
    pub fn enqueue(&mut self, patient: &Patient) -> Result<WaitingEntry> {
        if patient.in_attention || self.contains(patient.id) {
            return Err(Error::AlreadyQueued(patient.id));
        }

        let entry = WaitingEntry {
            patient_id: patient.id,
            priority: patient.priority,
            sequence: self.next_sequence,
        };
        self.next_sequence += 1;
        self.insert(entry);

        tracing::debug!(
            "Queued patient {} at priority {} (sequence {})",
            entry.patient_id,
            entry.priority,
            entry.sequence
        );
        Ok(entry)
    }

    /// Put an entry back with its original sequence.
    ///
    /// Used to undo a dequeue: the patient regains its place ahead of anyone
    /// in the same tier who arrived later.
    pub fn restore(&mut self, entry: WaitingEntry) {
        self.remove(entry.patient_id);
        self.next_sequence = self.next_sequence.max(entry.sequence + 1);
        self.insert(entry);
    }

    pub fn peek_highest(&self) -> Option<WaitingEntry> {
        self.ordered
            .iter()
            .next()
            .map(|(&key, &patient_id)| Self::entry(key, patient_id))
    }

    pub fn dequeue_highest(&mut self) -> Result<WaitingEntry> {
        let (key, patient_id) = self.ordered.pop_first().ok_or(Error::QueueEmpty)?;
        self.index.remove(&patient_id);
        Ok(Self::entry(key, patient_id))
    }

    /// Waiting entries in the order `dequeue_highest` would return them.
    ///
    /// The iterator borrows the queue and can be requested again at any time.
    pub fn list_ascending(&self) -> impl Iterator<Item = WaitingEntry> + '_ {
        self.ordered
            .iter()
            .map(|(&key, &patient_id)| Self::entry(key, patient_id))
    }

    /// Take a patient out of line (withdrawn, deleted)
    pub fn remove(&mut self, patient_id: PatientId) -> Option<WaitingEntry> {
        let key = self.index.remove(&patient_id)?;
        self.ordered.remove(&key);
        Some(Self::entry(key, patient_id))
    }

    /// Move a waiting patient to another tier, keeping its arrival sequence
    pub fn update_priority(&mut self, patient_id: PatientId, priority: Priority) -> Option<WaitingEntry> {
        let mut entry = self.remove(patient_id)?;
        entry.priority = priority;
        self.insert(entry);
        Some(entry)
    }

    pub fn contains(&self, patient_id: PatientId) -> bool {
        self.index.contains_key(&patient_id)
    }

    pub fn position(&self, patient_id: PatientId) -> Option<usize> {
        self.list_ascending()
            .position(|entry| entry.patient_id == patient_id)
    }

    pub fn len(&self) -> usize {
        self.ordered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }

    pub fn next_sequence(&self) -> u64 {
        self.next_sequence
    }

    fn insert(&mut self, entry: WaitingEntry) {
        let key = (entry.priority, entry.sequence);
        self.ordered.insert(key, entry.patient_id);
        self.index.insert(entry.patient_id, key);
    }

    fn entry((priority, sequence): (Priority, u64), patient_id: PatientId) -> WaitingEntry {
        WaitingEntry {
            patient_id,
            priority,
            sequence,
        }
    }
}
