//! Result persistence.
//!
//! The store holds four row tables: one `observation` row per result set,
//! its `findresult` rows keyed by `(obsind, objind)`, the `aducalc`
//! photometry rows hanging off them, and long-lived per-object `aperture`
//! assignments. Every mutation is validated in full against a copy of the
//! tables and only then committed, so a failed call writes nothing.
//!
//! Writers of one observation are serialised by [`ObservationLock`]. A plain
//! [`ResultStore::save`] does not wait: if someone else is re-processing the
//! observation it fails with [`FindError::PersistenceConflict`].

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rkyv::{Archive, Deserialize, Serialize};
use tracing::{debug, warn};

use crate::aperture::ApertureAssignment;
use crate::error::{FindError, Result};
use crate::offset::PixelOffset;
use crate::results::{FindResult, FindResultSet, ObservationInfo};
use crate::{ObjInd, ObsInd};

mod file;
mod lock;
mod memory;

pub use file::FileStore;
pub use lock::ObservationLock;
pub use memory::MemoryStore;

use lock::LockTable;

// ── Row schema ──────────────────────────────────────────────────────────────

/// Per-observation header row.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
pub struct ObservationRow {
    pub obsind: ObsInd,
    pub filter: String,
    pub obsdate: String,
    pub nrows: u32,
    pub ncols: u32,
    pub vicinity: String,
    /// Object of the target entry.
    pub target: ObjInd,
    pub offset_row: f64,
    pub offset_col: f64,
}

#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
pub struct FindResultRow {
    pub obsind: ObsInd,
    pub objind: ObjInd,
    pub row: f64,
    pub col: f64,
    pub rdiff: f64,
    pub cdiff: f64,
    pub apsize: f64,
    pub adus: f64,
    pub radeg: f64,
    pub decdeg: f64,
    pub hide: bool,
}

/// One photometric measurement of a found object.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
pub struct AduCalcRow {
    pub obsind: ObsInd,
    pub objind: ObjInd,
    pub apsize: f64,
    pub adus: f64,
    pub npix: u32,
    pub sky: f64,
}

/// Long-lived aperture of one object.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
pub struct ApertureRow {
    pub objind: ObjInd,
    pub apsize: f64,
    pub nsamples: u32,
    pub stddev: f64,
}

impl ApertureRow {
    fn assignment(&self) -> ApertureAssignment {
        ApertureAssignment {
            apsize: self.apsize,
            nsamples: self.nsamples,
            stddev: self.stddev,
        }
    }
}

/// What a save did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SaveSummary {
    /// `findresult` rows written.
    pub written: usize,
    /// Previous `findresult` rows deleted or overwritten.
    pub replaced: usize,
    /// `aducalc` rows deleted along with replaced results.
    pub cascaded: usize,
    /// Results without a catalog object, which have no row key.
    pub skipped_unlinked: usize,
    /// Stored rows kept by an append and re-expressed against the new offset.
    pub rebased: usize,
    /// Rows deleted for objects suppressed along with the save.
    pub suppressed: usize,
}

// ── Store interface ─────────────────────────────────────────────────────────

/// Persistence for result sets, photometry and apertures.
pub trait ResultStore: Send + Sync {
    /// The stored result set of an observation, in canonical order.
    fn load_for_observation(&self, obsind: ObsInd) -> Result<Option<FindResultSet>>;

    /// Take the observation's writer lock, waiting at most `wait`.
    fn lock_observation(&self, obsind: ObsInd, wait: Duration) -> Result<ObservationLock>;

    /// Commit a result set while holding its observation lock.
    ///
    /// With `replace`, every prior `findresult` row of the observation and
    /// its `aducalc` rows are deleted first. Otherwise rows are merged by
    /// `(obsind, objind)`.
    fn save_locked(&self, lock: &ObservationLock, set: &FindResultSet, replace: bool) -> Result<SaveSummary> {
        self.save_suppressing(lock, set, replace, &[]).map(|(summary, _)| summary)
    }

    /// [`save_locked`](Self::save_locked), then delete every row of the
    /// `suppressed` objects, committed as one write.
    ///
    /// An object that is some observation's target keeps its rows and stays
    /// hidden instead. Returns the objects whose rows were deleted.
    fn save_suppressing(
        &self,
        lock: &ObservationLock,
        set: &FindResultSet,
        replace: bool,
        suppressed: &[ObjInd],
    ) -> Result<(SaveSummary, Vec<ObjInd>)>;

    /// Commit a result set, failing if another writer holds the observation.
    fn save(&self, set: &FindResultSet, replace: bool) -> Result<SaveSummary> {
        let lock = self.lock_observation(set.obsind(), Duration::ZERO)?;
        self.save_locked(&lock, set, replace)
    }

    /// Store photometry rows. Each must belong to an existing `findresult` row.
    fn save_photometry(&self, obsind: ObsInd, rows: &[AduCalcRow]) -> Result<usize>;

    fn photometry(&self, obsind: ObsInd) -> Result<Vec<AduCalcRow>>;

    /// Delete every row of a globally suppressed object.
    fn remove_object(&self, objind: ObjInd) -> Result<usize>;

    fn aperture(&self, objind: ObjInd) -> Result<Option<ApertureAssignment>>;

    /// Store `assignment` if it supersedes the current one. Returns whether it did.
    fn update_aperture(&self, objind: ObjInd, assignment: ApertureAssignment) -> Result<bool>;

    /// Number of `findresult` rows of an observation.
    fn row_count(&self, obsind: ObsInd) -> Result<usize>;
}

// ── Tables ──────────────────────────────────────────────────────────────────

/// All rows of a store, also the on-disk snapshot format.
#[derive(Debug, Clone, Default, PartialEq, Archive, Serialize, Deserialize)]
pub(crate) struct Tables {
    observations: Vec<ObservationRow>,
    findresults: Vec<FindResultRow>,
    aducalc: Vec<AduCalcRow>,
    apertures: Vec<ApertureRow>,
}

impl Tables {
    fn load(&self, obsind: ObsInd) -> Result<Option<FindResultSet>> {
        let Some(obs) = self.observations.iter().find(|o| o.obsind == obsind) else {
            return Ok(None);
        };
        let mut results: Vec<FindResult> = self
            .findresults
            .iter()
            .filter(|r| r.obsind == obsind)
            .map(|r| FindResult {
                obj: Some(r.objind),
                row: r.row,
                col: r.col,
                rdiff: r.rdiff,
                cdiff: r.cdiff,
                apsize: r.apsize,
                adus: r.adus,
                radeg: r.radeg,
                decdeg: r.decdeg,
                label: String::new(),
                hide: r.hide,
                istarget: r.objind == obs.target,
            })
            .collect();
        if let Some(pos) = results.iter().position(|r| r.istarget) {
            results.swap(0, pos);
        }
        let info = ObservationInfo::new(obs.obsind, &obs.filter, &obs.obsdate, &obs.vicinity);
        let set = FindResultSet::from_parts(
            info,
            obs.nrows as usize,
            obs.ncols as usize,
            PixelOffset::new(obs.offset_row, obs.offset_col),
            results,
        )?;
        Ok(Some(set))
    }

    fn save(&mut self, set: &FindResultSet, replace: bool) -> Result<SaveSummary> {
        let obsind = set.obsind();
        let target = set.target().obj.ok_or_else(|| {
            FindError::Configuration(format!(
                "observation {obsind}: target result has no catalog object"
            ))
        })?;

        let mut summary = SaveSummary::default();
        let mut rows = Vec::with_capacity(set.len());
        for r in set.results() {
            match r.obj {
                Some(objind) => rows.push(FindResultRow {
                    obsind,
                    objind,
                    row: r.row,
                    col: r.col,
                    rdiff: r.rdiff,
                    cdiff: r.cdiff,
                    apsize: r.apsize,
                    adus: r.adus,
                    radeg: r.radeg,
                    decdeg: r.decdeg,
                    hide: r.hide,
                }),
                None => summary.skipped_unlinked += 1,
            }
        }
        if summary.skipped_unlinked > 0 {
            warn!(
                "Observation {}: {} unlinked results not persisted",
                obsind, summary.skipped_unlinked
            );
        }

        if replace {
            let before = self.findresults.len();
            self.findresults.retain(|r| r.obsind != obsind);
            summary.replaced = before - self.findresults.len();
            let before = self.aducalc.len();
            self.aducalc.retain(|r| r.obsind != obsind);
            summary.cascaded = before - self.aducalc.len();
        } else {
            let before = self.findresults.len();
            self.findresults
                .retain(|old| old.obsind != obsind || !rows.iter().any(|new| new.objind == old.objind));
            summary.replaced = before - self.findresults.len();
            summary.rebased = self.rebase(obsind, set.offset());
        }
        summary.written = rows.len();
        self.findresults.extend(rows);

        let info = set.info();
        let header = ObservationRow {
            obsind,
            filter: info.filter.clone(),
            obsdate: info.obsdate.clone(),
            nrows: set.nrows as u32,
            ncols: set.ncols as u32,
            vicinity: info.vicinity.clone(),
            target,
            offset_row: set.offset().row,
            offset_col: set.offset().col,
        };
        match self.observations.iter_mut().find(|o| o.obsind == obsind) {
            Some(o) => *o = header,
            None => self.observations.push(header),
        }
        Ok(summary)
    }

    /// Re-express the stored rows of `obsind` against `offset`, keeping
    /// their absolute positions. A row of the previous target was measured
    /// against no offset at all.
    fn rebase(&mut self, obsind: ObsInd, offset: PixelOffset) -> usize {
        let Some(header) = self.observations.iter().find(|o| o.obsind == obsind) else {
            return 0;
        };
        let stored = PixelOffset::new(header.offset_row, header.offset_col);
        let old_target = header.target;
        let mut rebased = 0;
        for r in self.findresults.iter_mut().filter(|r| r.obsind == obsind) {
            let shift = if r.objind == old_target {
                offset
            } else {
                offset.minus(stored)
            };
            r.rdiff -= shift.row;
            r.cdiff -= shift.col;
            rebased += 1;
        }
        if rebased > 0 {
            debug!(
                "Observation {}: {} stored rows re-expressed for offset ({:.2}, {:.2})",
                obsind, rebased, offset.row, offset.col
            );
        }
        rebased
    }

    fn save_suppressing(
        &mut self,
        set: &FindResultSet,
        replace: bool,
        suppressed: &[ObjInd],
    ) -> Result<(SaveSummary, Vec<ObjInd>)> {
        let mut summary = self.save(set, replace)?;
        let mut removed = Vec::new();
        for &objind in suppressed {
            if let Some(obs) = self.observations.iter().find(|o| o.target == objind) {
                debug!(
                    "Object {} is the target of observation {}, hiding only",
                    objind, obs.obsind
                );
                continue;
            }
            summary.suppressed += self.delete_object(objind);
            removed.push(objind);
        }
        Ok((summary, removed))
    }

    fn save_photometry(&mut self, obsind: ObsInd, rows: &[AduCalcRow]) -> Result<usize> {
        for row in rows {
            if row.obsind != obsind {
                return Err(FindError::Storage(format!(
                    "photometry row for observation {} passed with observation {}",
                    row.obsind, obsind
                )));
            }
            if !self
                .findresults
                .iter()
                .any(|r| r.obsind == obsind && r.objind == row.objind)
            {
                return Err(FindError::Storage(format!(
                    "no findresult row for object {} in observation {}",
                    row.objind, obsind
                )));
            }
        }
        for row in rows {
            self.aducalc.retain(|r| {
                !(r.obsind == row.obsind && r.objind == row.objind && r.apsize == row.apsize)
            });
            self.aducalc.push(row.clone());
        }
        Ok(rows.len())
    }

    fn photometry(&self, obsind: ObsInd) -> Vec<AduCalcRow> {
        self.aducalc.iter().filter(|r| r.obsind == obsind).cloned().collect()
    }

    fn remove_object(&mut self, objind: ObjInd) -> Result<usize> {
        if let Some(obs) = self.observations.iter().find(|o| o.target == objind) {
            return Err(FindError::Configuration(format!(
                "object {} is the target of observation {} and cannot be removed",
                objind, obs.obsind
            )));
        }
        Ok(self.delete_object(objind))
    }

    fn delete_object(&mut self, objind: ObjInd) -> usize {
        let before = self.findresults.len() + self.aducalc.len();
        self.findresults.retain(|r| r.objind != objind);
        self.aducalc.retain(|r| r.objind != objind);
        before - self.findresults.len() - self.aducalc.len()
    }

    fn aperture(&self, objind: ObjInd) -> Option<ApertureAssignment> {
        self.apertures
            .iter()
            .find(|a| a.objind == objind)
            .map(ApertureRow::assignment)
    }

    fn update_aperture(&mut self, objind: ObjInd, assignment: ApertureAssignment) -> Result<bool> {
        if !(assignment.apsize > 0.0) {
            return Err(FindError::Configuration(format!(
                "aperture {} for object {} must be positive",
                assignment.apsize, objind
            )));
        }
        let prior = self.aperture(objind);
        if !assignment.supersedes(prior.as_ref()) {
            debug!(
                "Object {}: keeping aperture {:?} over {:?}",
                objind, prior, assignment
            );
            return Ok(false);
        }
        let row = ApertureRow {
            objind,
            apsize: assignment.apsize,
            nsamples: assignment.nsamples,
            stddev: assignment.stddev,
        };
        match self.apertures.iter_mut().find(|a| a.objind == objind) {
            Some(a) => *a = row,
            None => self.apertures.push(row),
        }
        Ok(true)
    }

    fn row_count(&self, obsind: ObsInd) -> usize {
        self.findresults.iter().filter(|r| r.obsind == obsind).count()
    }
}

// ── Shared store core ───────────────────────────────────────────────────────

/// Tables plus locks, shared by the concrete stores. Writes go to a copy that
/// is handed to `commit` and only installed when it succeeds.
#[derive(Debug)]
pub(crate) struct TableStore {
    tables: Mutex<Tables>,
    locks: Arc<LockTable>,
}

impl TableStore {
    fn new(tables: Tables) -> Self {
        Self {
            tables: Mutex::new(tables),
            locks: LockTable::shared(),
        }
    }

    fn read<R>(&self, f: impl FnOnce(&Tables) -> R) -> R {
        f(&*self.tables.lock())
    }

    fn write<R>(
        &self,
        f: impl FnOnce(&mut Tables) -> Result<R>,
        commit: impl FnOnce(&Tables) -> Result<()>,
    ) -> Result<R> {
        let mut guard = self.tables.lock();
        let mut staged = guard.clone();
        let out = f(&mut staged)?;
        commit(&staged)?;
        *guard = staged;
        Ok(out)
    }

    fn lock_observation(&self, obsind: ObsInd, wait: Duration) -> Result<ObservationLock> {
        self.locks.acquire(obsind, wait)
    }

    fn save_suppressing(
        &self,
        lock: &ObservationLock,
        set: &FindResultSet,
        replace: bool,
        suppressed: &[ObjInd],
        commit: impl FnOnce(&Tables) -> Result<()>,
    ) -> Result<(SaveSummary, Vec<ObjInd>)> {
        if lock.obsind() != set.obsind() || !self.locks.is_held_by(lock) {
            return Err(FindError::PersistenceConflict(set.obsind()));
        }
        let (summary, removed) = self.write(|t| t.save_suppressing(set, replace, suppressed), commit)?;
        debug!(
            "Observation {}: saved {} rows (replace={}, {} replaced, {} aducalc cascaded, {} rebased, {} suppressed)",
            set.obsind(),
            summary.written,
            replace,
            summary.replaced,
            summary.cascaded,
            summary.rebased,
            summary.suppressed
        );
        Ok((summary, removed))
    }
}
