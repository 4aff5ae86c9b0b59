//! Snapshot-file store.
//!
//! The whole table set is serialised with rkyv. Each commit writes a sibling
//! temporary file and renames it over the snapshot, so readers of the file
//! see either the previous or the new state.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use tracing::info;

use super::{AduCalcRow, ObservationLock, ResultStore, SaveSummary, TableStore, Tables};
use crate::aperture::ApertureAssignment;
use crate::error::{FindError, Result};
use crate::results::FindResultSet;
use crate::{ObjInd, ObsInd};

/// A [`ResultStore`] persisted to one rkyv snapshot file.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    inner: TableStore,
}

impl FileStore {
    /// Open the snapshot at `path`, starting empty if it does not exist yet.
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let tables = if path.exists() {
            let bytes = std::fs::read(&path)
                .with_context(|| format!("Failed to read result snapshot {}", path.display()))?;
            let tables = rkyv::from_bytes::<Tables, rkyv::rancor::Error>(&bytes)
                .map_err(|e| anyhow::anyhow!("rkyv deserialization failed: {}", e))
                .with_context(|| format!("Corrupt result snapshot {}", path.display()))?;
            info!(
                "Loaded result snapshot {}: {} observations, {} findresult rows",
                path.display(),
                tables.observations.len(),
                tables.findresults.len()
            );
            tables
        } else {
            Tables::default()
        };
        Ok(Self {
            path,
            inner: TableStore::new(tables),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn commit(&self, tables: &Tables) -> Result<()> {
        let bytes = rkyv::to_bytes::<rkyv::rancor::Error>(tables)
            .map_err(|e| FindError::Storage(format!("rkyv serialization failed: {e}")))?;
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        std::fs::write(&tmp, &bytes)
            .and_then(|_| std::fs::rename(&tmp, &self.path))
            .map_err(|e| FindError::Storage(format!("writing {}: {e}", self.path.display())))
    }
}

impl ResultStore for FileStore {
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
            .save_suppressing(lock, set, replace, suppressed, |t| self.commit(t))
    }

    fn save_photometry(&self, obsind: ObsInd, rows: &[AduCalcRow]) -> Result<usize> {
        self.inner
            .write(|t| t.save_photometry(obsind, rows), |t| self.commit(t))
    }

    fn photometry(&self, obsind: ObsInd) -> Result<Vec<AduCalcRow>> {
        Ok(self.inner.read(|t| t.photometry(obsind)))
    }

    fn remove_object(&self, objind: ObjInd) -> Result<usize> {
        self.inner.write(|t| t.remove_object(objind), |t| self.commit(t))
    }

    fn aperture(&self, objind: ObjInd) -> Result<Option<ApertureAssignment>> {
        Ok(self.inner.read(|t| t.aperture(objind)))
    }

    fn update_aperture(&self, objind: ObjInd, assignment: ApertureAssignment) -> Result<bool> {
        self.inner
            .write(|t| t.update_aperture(objind, assignment), |t| self.commit(t))
    }

    fn row_count(&self, obsind: ObsInd) -> Result<usize> {
        Ok(self.inner.read(|t| t.row_count(obsind)))
    }
}
