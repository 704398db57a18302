//! CSV export of the attention history.
//!
//! Records are appended to a CSV file, writing headers only when the file is
//! new, and the file is fsynced before the count is reported.

use crate::{HistoryRecord, Result};
use std::fs::OpenOptions;
use std::path::Path;

/// A row in the CSV output
#[derive(Debug, serde::Serialize)]
struct CsvRow {
    id: String,
    appointment_id: u64,
    date: String,
    time: String,
    patient_id: u64,
    patient_name: String,
    doctor_id: u64,
    doctor_name: String,
    specialty: String,
    reason: String,
    priority: u8,
    started_at: Option<String>,
    finished_at: String,
    trigger: String,
}

impl From<&HistoryRecord> for CsvRow {
    fn from(record: &HistoryRecord) -> Self {
        CsvRow {
            id: record.id.to_string(),
            appointment_id: record.appointment_id.0,
            date: record.date.format("%Y-%m-%d").to_string(),
            time: record.time.format("%H:%M").to_string(),
            patient_id: record.patient_id.0,
            patient_name: record.patient_name.clone(),
            doctor_id: record.doctor_id.0,
            doctor_name: record.doctor_name.clone(),
            specialty: record.specialty.clone(),
            reason: record.reason.clone(),
            priority: record.priority.code(),
            started_at: record.started_at.map(|t| t.to_rfc3339()),
            finished_at: record.finished_at.to_rfc3339(),
            trigger: format!("{:?}", record.trigger).to_lowercase(),
        }
    }
}

/// Append history records to a CSV file and return how many were written
pub fn export_history_csv<'a>(
    records: impl IntoIterator<Item = &'a HistoryRecord>,
    csv_path: &Path,
) -> Result<usize> {
    if let Some(parent) = csv_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(csv_path)?;

    let needs_headers = file.metadata()?.len() == 0;

    let mut writer = csv::WriterBuilder::new()
        .has_headers(needs_headers)
        .from_writer(file);

    let mut count = 0;
    for record in records {
        writer.serialize(CsvRow::from(record))?;
        count += 1;
    }

    writer.flush()?;
    let file = writer
        .into_inner()
        .map_err(|e| crate::Error::Io(e.into_error()))?;
    file.sync_all()?;

    tracing::info!("Exported {} history records to {:?}", count, csv_path);
    Ok(count)
}
