//! Doctor availability registry.
//!
//! A doctor's `available` flag is an exclusive lock. Acquire and release
//! are compare-and-set operations on the doctor store, so they never need
//! the orchestrator's attend lock.

use crate::store::DoctorStore;
use crate::types::{Doctor, DoctorId};
use crate::{Error, Result};
use std::sync::Arc;

/// Tracks which doctors are free and hands out exclusive attention locks
#[derive(Clone)]
pub struct DoctorRegistry {
    store: Arc<dyn DoctorStore>,
}

impl DoctorRegistry {
    pub fn new(store: Arc<dyn DoctorStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn DoctorStore> {
        &self.store
    }

    pub fn list(&self) -> Result<Vec<Doctor>> {
        self.store.list()
    }

    /// Free doctors, optionally restricted to a specialty (case-insensitive)
    pub fn list_free(&self, specialty: Option<&str>) -> Result<Vec<Doctor>> {
        Ok(self
            .store
            .list()?
            .into_iter()
            .filter(|d| d.available && matches_specialty(d, specialty))
            .collect())
    }

    /// Any free doctor matching the filter
    pub fn find_free(&self, specialty: Option<&str>) -> Result<Doctor> {
        self.list_free(specialty)?
            .into_iter()
            .next()
            .ok_or_else(|| Error::NoDoctorAvailable {
                specialty: specialty.map(str::to_string),
                requeued: None,
            })
    }

    /// Take the doctor's lock: `available` goes from true to false
    pub fn acquire(&self, id: DoctorId) -> Result<Doctor> {
        if self.store.set_available_if(id, true, false)? {
            tracing::debug!("Acquired doctor {}", id);
            self.store.get(id)
        } else {
            Err(Error::DoctorBusy(id))
        }
    }

    /// Give the doctor's lock back.
    ///
    /// Releasing a doctor that is already free is a no-op; the return value
    /// says whether anything changed.
    pub fn release(&self, id: DoctorId) -> Result<bool> {
        let released = self.store.set_available_if(id, false, true)?;
        if released {
            tracing::debug!("Released doctor {}", id);
        } else {
            tracing::debug!("Doctor {} already free, release ignored", id);
        }
        Ok(released)
    }

    /// Find and acquire a free doctor in one step.
    ///
    /// `preferred` is tried first when it is free and matches the filter.
    /// A candidate taken by a concurrent acquire is skipped in favour of
    /// the next one.
    pub fn claim_free(&self, specialty: Option<&str>, preferred: Option<DoctorId>) -> Result<Doctor> {
        let mut candidates = self.list_free(specialty)?;
        if let Some(preferred) = preferred {
            if let Some(pos) = candidates.iter().position(|d| d.id == preferred) {
                let doctor = candidates.remove(pos);
                candidates.insert(0, doctor);
            }
        }

        for candidate in candidates {
            match self.acquire(candidate.id) {
                Ok(doctor) => return Ok(doctor),
                Err(Error::DoctorBusy(id)) => {
                    tracing::debug!("Doctor {} taken concurrently, trying next", id);
                }
                Err(e) => return Err(e),
            }
        }

        Err(Error::NoDoctorAvailable {
            specialty: specialty.map(str::to_string),
            requeued: None,
        })
    }
}

fn matches_specialty(doctor: &Doctor, specialty: Option<&str>) -> bool {
    specialty
        .map(|s| doctor.specialty.trim().to_lowercase() == s.trim().to_lowercase())
        .unwrap_or(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryDoctorStore;
    use crate::types::NewDoctor;

    fn registry_with(specialties: &[&str]) -> DoctorRegistry {
        let store = MemoryDoctorStore::new();
        for (i, specialty) in specialties.iter().enumerate() {
            store
                .insert(NewDoctor {
                    first_name: format!("Doc{}", i + 1),
                    last_name: "House".into(),
                    specialty: specialty.to_string(),
                    office: i as u32 + 100,
                })
                .unwrap();
        }
        DoctorRegistry::new(Arc::new(store))
    }

    #[test]
    fn test_acquire_and_release() {
        let registry = registry_with(&["General"]);
        let doctor = registry.acquire(DoctorId(1)).unwrap();
        assert!(!doctor.available);

        assert!(matches!(registry.acquire(DoctorId(1)), Err(Error::DoctorBusy(_))));

        assert!(registry.release(DoctorId(1)).unwrap());
        assert!(registry.find_free(None).is_ok());
    }

    #[test]
    fn test_release_is_idempotent() {
        let registry = registry_with(&["General"]);
        assert!(!registry.release(DoctorId(1)).unwrap());
        assert!(!registry.release(DoctorId(1)).unwrap());
        assert!(registry.store().get(DoctorId(1)).unwrap().available);
    }

    #[test]
    fn test_unknown_doctor() {
        let registry = registry_with(&[]);
        assert!(matches!(
            registry.acquire(DoctorId(5)),
            Err(Error::NotFound { .. })
        ));
        assert!(matches!(
            registry.find_free(None),
            Err(Error::NoDoctorAvailable { .. })
        ));
    }

    #[test]
    fn test_specialty_filter() {
        let registry = registry_with(&["Cardiology", "Pediatrics"]);

        let doctor = registry.find_free(Some("pediatrics")).unwrap();
        assert_eq!(doctor.id, DoctorId(2));

        registry.acquire(DoctorId(2)).unwrap();
        let err = registry.find_free(Some("Pediatrics")).unwrap_err();
        assert!(matches!(
            err,
            Error::NoDoctorAvailable { specialty: Some(ref s), .. } if s == "Pediatrics"
        ));
    }

    #[test]
    fn test_claim_free_prefers_requested_doctor() {
        let registry = registry_with(&["General", "General", "General"]);

        let doctor = registry.claim_free(None, Some(DoctorId(3))).unwrap();
        assert_eq!(doctor.id, DoctorId(3));

        // Busy preferred doctor falls back to the first free one
        let doctor = registry.claim_free(None, Some(DoctorId(3))).unwrap();
        assert_eq!(doctor.id, DoctorId(1));

        registry.claim_free(None, None).unwrap();
        assert!(matches!(
            registry.claim_free(None, None),
            Err(Error::NoDoctorAvailable { .. })
        ));
    }
}
