//! In-process store.

use std::time::Duration;

use super::{AduCalcRow, ObservationLock, ResultStore, SaveSummary, TableStore, Tables};
use crate::aperture::ApertureAssignment;
use crate::error::Result;
use crate::results::FindResultSet;
use crate::{ObjInd, ObsInd};

/// A [`ResultStore`] that lives only as long as the process.
#[derive(Debug)]
pub struct MemoryStore {
    inner: TableStore,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: TableStore::new(Tables::default()),
        }
    }
}

fn no_commit(_: &Tables) -> Result<()> {
    Ok(())
}

impl ResultStore for MemoryStore {
    fn load_for_observation(&self, obsind: ObsInd) -> Result<Option<FindResultSet>> {
        self.inner.read(|t| t.load(obsind))
    }

    fn lock_observation(&self, obsind: ObsInd, wait: Duration) -> Result<ObservationLock> {
        self.inner.lock_observation(obsind, wait)
    }

    fn save_suppressing(
        &self,
        lock: &ObservationLock,
        set: &FindResultSet,
        replace: bool,
        suppressed: &[ObjInd],
    ) -> Result<(SaveSummary, Vec<ObjInd>)> {
        self.inner
            .save_suppressing(lock, set, replace, suppressed, no_commit)
    }

    fn save_photometry(&self, obsind: ObsInd, rows: &[AduCalcRow]) -> Result<usize> {
        self.inner.write(|t| t.save_photometry(obsind, rows), no_commit)
    }

    fn photometry(&self, obsind: ObsInd) -> Result<Vec<AduCalcRow>> {
        Ok(self.inner.read(|t| t.photometry(obsind)))
    }

    fn remove_object(&self, objind: ObjInd) -> Result<usize> {
        self.inner.write(|t| t.remove_object(objind), no_commit)
    }

    fn aperture(&self, objind: ObjInd) -> Result<Option<ApertureAssignment>> {
        Ok(self.inner.read(|t| t.aperture(objind)))
    }

    fn update_aperture(&self, objind: ObjInd, assignment: ApertureAssignment) -> Result<bool> {
        self.inner.write(|t| t.update_aperture(objind, assignment), no_commit)
    }

    fn row_count(&self, obsind: ObsInd) -> Result<usize> {
        Ok(self.inner.read(|t| t.row_count(obsind)))
    }
}
