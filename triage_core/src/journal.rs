//! Append-only journal of finished attentions.
//!
//! History records are appended to a JSONL (JSON Lines) file with file
//! locking so the CLI and a long-running process can share it safely.

use crate::{HistoryRecord, Result};
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

/// Destination for history records as they are pushed
pub trait HistorySink: Send + Sync {
    fn append(&mut self, record: &HistoryRecord) -> Result<()>;
}

/// JSONL-based history sink with file locking
pub struct JsonlSink {
    path: PathBuf,
}

impl JsonlSink {
    /// Create a new JSONL sink for the given path
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Ensure the parent directory exists
    fn ensure_parent_dir(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(())
    }
}

impl HistorySink for JsonlSink {
    fn append(&mut self, record: &HistoryRecord) -> Result<()> {
        self.ensure_parent_dir()?;

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;

        file.lock_exclusive()?;

        let mut writer = std::io::BufWriter::new(&file);
        let line = serde_json::to_string(record)?;
        writer.write_all(line.as_bytes())?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        drop(writer);

        file.sync_data()?;
        file.unlock()?;

        tracing::debug!(
            "Journaled history record for appointment {}",
            record.appointment_id
        );
        Ok(())
    }
}

/// Read all history records from a journal file, oldest first
pub fn read_records(path: &Path) -> Result<Vec<HistoryRecord>> {
    if !path.exists() {
        return Ok(Vec::new());
    }

    let file = File::open(path)?;
    file.lock_shared()?;

    let reader = BufReader::new(&file);
    let mut records = Vec::new();

    for (line_num, line_result) in reader.lines().enumerate() {
        let line = line_result?;
        if line.trim().is_empty() {
            continue;
        }

        match serde_json::from_str::<HistoryRecord>(&line) {
            Ok(record) => records.push(record),
            Err(e) => {
                tracing::warn!(
                    "Skipping malformed history record at line {}: {}",
                    line_num + 1,
                    e
                );
            }
        }
    }

    file.unlock()?;
    tracing::debug!("Read {} history records from journal", records.len());
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::*;
    use chrono::{NaiveDate, NaiveTime, Utc};
    use uuid::Uuid;

    fn record(appointment: u64, patient_name: &str) -> HistoryRecord {
        HistoryRecord {
            id: Uuid::new_v4(),
            appointment_id: AppointmentId(appointment),
            date: NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
            time: NaiveTime::from_hms_opt(8, 0, 0).unwrap(),
            patient_id: PatientId(1),
            patient_name: patient_name.into(),
            doctor_id: DoctorId(1),
            doctor_name: "Jorge Luna".into(),
            specialty: "General".into(),
            reason: "Fever".into(),
            priority: Priority::Medium,
            started_at: Some(Utc::now()),
            finished_at: Utc::now(),
            trigger: CompletionTrigger::Timer,
        }
    }

    #[test]
    fn test_append_and_read_in_order() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("history.jsonl");

        let mut sink = JsonlSink::new(&path);
        sink.append(&record(1, "Ana Ruiz")).unwrap();
        sink.append(&record(2, "Luis Pérez")).unwrap();

        let records = read_records(&path).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].appointment_id, AppointmentId(1));
        assert_eq!(records[1].patient_name, "Luis Pérez");
    }

    #[test]
    fn test_malformed_lines_are_skipped() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("history.jsonl");

        let mut sink = JsonlSink::new(&path);
        sink.append(&record(1, "Ana Ruiz")).unwrap();
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(file, "{{ not json").unwrap();
        drop(file);
        sink.append(&record(2, "Luis Pérez")).unwrap();

        let records = read_records(&path).unwrap();
        assert_eq!(records.len(), 2);
    }

    #[test]
    fn test_read_missing_journal() {
        let temp_dir = tempfile::tempdir().unwrap();
        let records = read_records(&temp_dir.path().join("missing.jsonl")).unwrap();
        assert!(records.is_empty());
    }
}
