//! Clinic snapshot persistence with file locking.
//!
//! The CLI keeps patients, doctors, appointments and the waiting queue in a
//! single JSON snapshot between invocations. Saves are atomic; loads are
//! lenient so a damaged file never blocks the clinic.

use crate::types::{Appointment, Doctor, Patient, WaitingEntry};
use crate::{Error, Result};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use tempfile::NamedTempFile;

/// Everything the orchestrator needs to resume
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct ClinicSnapshot {
    #[serde(default)]
    pub patients: Vec<Patient>,
    #[serde(default)]
    pub doctors: Vec<Doctor>,
    #[serde(default)]
    pub appointments: Vec<Appointment>,
    #[serde(default)]
    pub waiting: Vec<WaitingEntry>,
    #[serde(default)]
    pub next_sequence: u64,
}

impl ClinicSnapshot {
    /// Load a snapshot from a file with shared locking
    ///
    /// Returns an empty snapshot if the file doesn't exist.
    /// If the file is corrupted, logs a warning and returns an empty snapshot.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::info!("No snapshot found at {:?}, starting empty", path);
            return Ok(Self::default());
        }

        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) => {
                tracing::warn!("Unable to open snapshot {:?}: {}. Starting empty.", path, e);
                return Ok(Self::default());
            }
        };

        if let Err(e) = file.lock_shared() {
            tracing::warn!("Unable to lock snapshot {:?}: {}. Starting empty.", path, e);
            return Ok(Self::default());
        }

        let mut contents = String::new();
        let mut reader = std::io::BufReader::new(&file);
        if let Err(e) = reader.read_to_string(&mut contents) {
            let _ = file.unlock();
            tracing::warn!("Failed to read snapshot {:?}: {}. Starting empty.", path, e);
            return Ok(Self::default());
        }

        file.unlock()?;

        match serde_json::from_str::<ClinicSnapshot>(&contents) {
            Ok(snapshot) => {
                tracing::debug!(
                    "Loaded snapshot from {:?}: {} patients, {} doctors, {} appointments, {} waiting",
                    path,
                    snapshot.patients.len(),
                    snapshot.doctors.len(),
                    snapshot.appointments.len(),
                    snapshot.waiting.len()
                );
                Ok(snapshot)
            }
            Err(e) => {
                tracing::warn!("Failed to parse snapshot {:?}: {}. Starting empty.", path, e);
                Ok(Self::default())
            }
        }
    }

    /// Save the snapshot with exclusive locking
    ///
    /// Atomically writes by:
    /// 1. Writing to a temp file in the same directory
    /// 2. Syncing to disk
    /// 3. Renaming over the original
    pub fn save(&self, path: &Path) -> Result<()> {
        let parent = path.parent().ok_or_else(|| {
            Error::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "snapshot path missing parent",
            ))
        })?;
        std::fs::create_dir_all(parent)?;

        let temp = NamedTempFile::new_in(parent)?;
        temp.as_file().lock_exclusive()?;

        {
            let mut writer = std::io::BufWriter::new(temp.as_file());
            serde_json::to_writer_pretty(&mut writer, self)?;
            writer.flush()?;
        }

        temp.as_file().sync_all()?;
        temp.as_file().unlock()?;

        temp.persist(path).map_err(|e| Error::Io(e.error))?;

        tracing::debug!("Saved snapshot to {:?}", path);
        Ok(())
    }
}
