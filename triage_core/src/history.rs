//! History stack of finished attentions.
//!
//! Records are only ever appended. Listing walks them most recent first;
//! the underlying order is kept for audit and for the journal.

use crate::journal::{self, HistorySink, JsonlSink};
use crate::types::{AppointmentId, HistoryRecord};
use crate::Result;
use std::path::Path;

/// Append-only, most-recent-first log of finished appointments
#[derive(Default)]
pub struct HistoryStack {
    records: Vec<HistoryRecord>,
    sink: Option<Box<dyn HistorySink>>,
}

impl HistoryStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a stack backed by a JSONL journal, replaying what it holds
    pub fn open(journal_path: &Path) -> Result<Self> {
        let records = journal::read_records(journal_path)?;
        tracing::info!(
            "Loaded {} history records from {:?}",
            records.len(),
            journal_path
        );
        Ok(Self {
            records,
            sink: Some(Box::new(JsonlSink::new(journal_path))),
        })
    }

    pub fn with_sink(mut self, sink: Box<dyn HistorySink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Append a record.
    ///
    /// With a journal attached the record is written there first; it only
    /// becomes visible once persisted.
    pub fn push(&mut self, record: HistoryRecord) -> Result<()> {
        if let Some(sink) = self.sink.as_mut() {
            sink.append(&record)?;
        }
        tracing::debug!(
            "History now holds appointment {} ({})",
            record.appointment_id,
            record.patient_name
        );
        self.records.push(record);
        Ok(())
    }

    /// All records, most recent first
    pub fn list(&self) -> impl Iterator<Item = &HistoryRecord> + '_ {
        self.records.iter().rev()
    }

    /// Records whose patient name contains `pattern`, ignoring case.
    ///
    /// A blank pattern matches every record.
    pub fn search<'a>(&'a self, pattern: &str) -> impl Iterator<Item = &'a HistoryRecord> + 'a {
        let needle = pattern.trim().to_lowercase();
        self.list()
            .filter(move |r| r.patient_name.to_lowercase().contains(&needle))
    }

    /// The last record pushed
    pub fn latest(&self) -> Option<&HistoryRecord> {
        self.records.last()
    }

    pub fn find(&self, appointment_id: AppointmentId) -> Option<&HistoryRecord> {
        self.records
            .iter()
            .find(|r| r.appointment_id == appointment_id)
    }

    pub fn contains(&self, appointment_id: AppointmentId) -> bool {
        self.find(appointment_id).is_some()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
