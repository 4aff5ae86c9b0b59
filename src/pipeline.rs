//! Per-observation processing.
//!
//! The three caller entry points are [`search`], [`optimize`] and
//! [`persist`]. [`process_observation`] runs them in order for one frame,
//! holding the observation's writer lock throughout and stepping an
//! [`ObservationState`] so that no stage can run out of order.
//!
//! Candidate searches fan out over a bounded rayon pool. Every search only
//! reads the frame; results are joined before the single aggregation pass
//! mutates the result set.

use std::time::Duration;

use rayon::prelude::*;
use tracing::{debug, info, warn};

use crate::aperture::{optimize_set, ApertureParams};
use crate::catalog::{CatalogCache, CatalogLoader, CatalogObject, ObjectCatalog};
use crate::error::{FindError, Result, SearchFailure};
use crate::image::ImageSource;
use crate::offset::{OffsetChange, OffsetTracker, PixelOffset};
use crate::overlap::{resolve_overlaps, OverlapParams, OverlapResolution, Suppression};
use crate::results::{FindResultSet, ObservationInfo, ResultFilter};
use crate::search::{find_catalog_object, SearchParams};
use crate::store::{ObservationLock, ResultStore, SaveSummary};
use crate::{ObjInd, ObsInd};

// ── Configuration ───────────────────────────────────────────────────────────

/// Everything needed to process an observation.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub search: SearchParams,
    pub aperture: ApertureParams,
    pub overlap: OverlapParams,
    pub offset: OffsetTracker,
    /// What happens to the losing side of an aperture overlap.
    /// Default: `Suppression::Hide`
    pub suppression: Suppression,
    /// Candidate search threads. 0 lets rayon pick.
    /// Default: 0
    pub workers: usize,
    /// How long to wait for another writer of the same observation.
    /// Default: 5 s
    pub lock_wait: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            search: SearchParams::default(),
            aperture: ApertureParams::default(),
            overlap: OverlapParams::default(),
            offset: OffsetTracker::default(),
            suppression: Suppression::Hide,
            workers: 0,
            lock_wait: Duration::from_secs(5),
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<()> {
        self.search.validate()?;
        self.aperture.validate()?;
        self.overlap.validate()?;
        self.offset.validate()
    }

    fn pool(&self) -> Result<rayon::ThreadPool> {
        rayon::ThreadPoolBuilder::new()
            .num_threads(self.workers)
            .build()
            .map_err(|e| FindError::Configuration(format!("Failed to build search pool: {e}")))
    }
}

// ── Observation state machine ───────────────────────────────────────────────

/// Where an observation is in its processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObservationState {
    Empty,
    TargetFound,
    MatchingCandidates,
    OffsetReconciled,
    AperturesOptimized,
    OverlapResolved,
    Persisted,
    /// The target could not be found; nothing is stored.
    SearchFailed,
    /// Another writer owned the observation; nothing is stored.
    PersistenceConflict,
}

impl ObservationState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ObservationState::Persisted
                | ObservationState::SearchFailed
                | ObservationState::PersistenceConflict
        )
    }

    /// Move to `next`, or fail if the stage order does not allow it.
    ///
    /// Besides the forward path, a persisted observation may have its target
    /// re-found, which then goes straight to offset reconciliation.
    pub fn advance(self, next: ObservationState) -> Result<ObservationState> {
        use ObservationState::*;
        let legal = match (self, next) {
            (Empty, TargetFound) | (Empty, SearchFailed) => true,
            (TargetFound, MatchingCandidates) | (TargetFound, OffsetReconciled) => true,
            (MatchingCandidates, OffsetReconciled) => true,
            (OffsetReconciled, AperturesOptimized) | (OffsetReconciled, Persisted) => true,
            (AperturesOptimized, OverlapResolved) => true,
            (OverlapResolved, Persisted) => true,
            (Persisted, TargetFound) => true,
            (from, PersistenceConflict) => !from.is_terminal(),
            _ => false,
        };
        if !legal {
            return Err(FindError::Configuration(format!(
                "illegal observation transition {self:?} -> {next:?}"
            )));
        }
        Ok(next)
    }
}

// ── Reporting ───────────────────────────────────────────────────────────────

/// Candidate search bookkeeping for one observation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchStats {
    pub attempted: usize,
    pub found: usize,
    pub skipped: usize,
    pub failures: Vec<(ObjInd, SearchFailure)>,
}

/// Result of [`optimize`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OptimizeSummary {
    /// Chosen radius per result index.
    pub apertures: Vec<(usize, f64)>,
    /// Offset change from re-centring the target on its aperture.
    pub recentred: OffsetChange,
    pub overlaps: Vec<OverlapResolution>,
}

/// Everything [`process_observation`] did to one observation.
#[derive(Debug, Clone)]
pub struct ObservationOutcome {
    pub state: ObservationState,
    pub set: FindResultSet,
    pub stats: SearchStats,
    pub optimized: OptimizeSummary,
    pub saved: SaveSummary,
}

/// An observation that did not reach [`ObservationState::Persisted`].
///
/// Nothing of it was stored.
#[derive(Debug, thiserror::Error)]
#[error("observation {obsind} stopped at {state:?}: {error}")]
pub struct ObservationFailure {
    pub obsind: ObsInd,
    /// `SearchFailed` or `PersistenceConflict`, else the last stage reached.
    pub state: ObservationState,
    #[source]
    pub error: FindError,
}

/// One abandoned observation of a batch.
#[derive(Debug, Clone, PartialEq)]
pub struct FailedObservation {
    pub obsind: ObsInd,
    pub state: ObservationState,
    pub reason: String,
}

/// Summary of a batch of observations.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchReport {
    pub processed: usize,
    pub found: usize,
    pub skipped: usize,
    pub failed: Vec<FailedObservation>,
}

impl BatchReport {
    /// 0 when everything was processed, 1 when some observations failed,
    /// 2 when all of them did.
    pub fn exit_code(&self) -> i32 {
        match (self.processed, self.failed.len()) {
            (_, 0) => 0,
            (0, _) => 2,
            _ => 1,
        }
    }
}

// ── Stages ──────────────────────────────────────────────────────────────────

/// Find the target with no frame offset and start a result set from it.
pub fn find_target<I: ImageSource + ?Sized>(
    image: &I,
    catalog: &ObjectCatalog,
    info: ObservationInfo,
    params: &SearchParams,
) -> Result<FindResultSet> {
    params.validate()?;
    check_vicinity(catalog, catalog.target().id, &info.vicinity)?;
    let target = catalog.target();
    let found = find_catalog_object(image, target, PixelOffset::ZERO, params).map_err(|e| {
        warn!(
            "Observation {}: target {} ({}) not found: {}",
            info.obsind, target.id, target.label, e
        );
        FindError::Search(e)
    })?;
    info!(
        "Observation {}: target {} at ({:.2}, {:.2}), offset ({:.2}, {:.2})",
        info.obsind, target.id, found.row, found.col, found.rdiff, found.cdiff
    );
    FindResultSet::new(info, image.nrows(), image.ncols(), found)
}

/// Search every candidate of the catalog that can be on the frame and add
/// those found to `set`.
///
/// Predictions are shifted by the set's frame offset. A candidate that cannot
/// be found is counted and skipped.
pub fn match_candidates<I: ImageSource + ?Sized>(
    image: &I,
    catalog: &ObjectCatalog,
    set: &mut FindResultSet,
    config: &PipelineConfig,
) -> Result<SearchStats> {
    config.search.validate()?;
    check_vicinity(catalog, catalog.target().id, set.vicinity())?;
    let candidates = field_candidates(image, catalog, set.obsind());

    let offset = set.offset();
    let pool = config.pool()?;
    let outcomes: Vec<(ObjInd, std::result::Result<_, SearchFailure>)> = pool.install(|| {
        candidates
            .par_iter()
            .map(|obj| (obj.id, find_catalog_object(image, obj, offset, &config.search)))
            .collect()
    });

    let mut stats = SearchStats {
        attempted: outcomes.len(),
        ..Default::default()
    };
    for (id, outcome) in outcomes {
        match outcome {
            Ok(found) => {
                set.insert(found)?;
                stats.found += 1;
            }
            Err(e) => {
                warn!("Observation {}: skipping object {}: {}", set.obsind(), id, e);
                stats.skipped += 1;
                stats.failures.push((id, e));
            }
        }
    }
    set.canonicalize();
    info!(
        "Observation {}: {} of {} candidates found",
        set.obsind(),
        stats.found,
        stats.attempted
    );
    Ok(stats)
}

/// Target plus candidate search for one frame.
pub fn search<I: ImageSource + ?Sized>(
    image: &I,
    catalog: &ObjectCatalog,
    info: ObservationInfo,
    config: &PipelineConfig,
) -> Result<(FindResultSet, SearchStats)> {
    let mut set = find_target(image, catalog, info, &config.search)?;
    let stats = match_candidates(image, catalog, &mut set, config)?;
    Ok((set, stats))
}

/// Settle apertures, then resolve the overlaps they produce.
///
/// Re-centring the target moves the frame offset; candidates are
/// re-expressed against it before overlaps are checked.
pub fn optimize<I: ImageSource + ?Sized>(
    image: &I,
    set: &mut FindResultSet,
    config: &PipelineConfig,
) -> Result<OptimizeSummary> {
    let (apertures, recentred) = settle_apertures(image, set, config)?;
    let overlaps = resolve_overlaps(set, &config.overlap, config.suppression)?;
    Ok(OptimizeSummary {
        apertures,
        recentred,
        overlaps,
    })
}

/// Commit a set, failing if another writer holds its observation.
pub fn persist<S: ResultStore + ?Sized>(store: &S, set: &FindResultSet, replace: bool) -> Result<SaveSummary> {
    store.save(set, replace)
}

/// Run every stage for one frame and store the result.
///
/// On failure nothing is stored and the returned [`ObservationFailure`]
/// says where processing stopped.
pub fn process_observation<I, S>(
    image: &I,
    catalog: &ObjectCatalog,
    info: ObservationInfo,
    store: &S,
    config: &PipelineConfig,
    replace: bool,
) -> std::result::Result<ObservationOutcome, ObservationFailure>
where
    I: ImageSource + ?Sized,
    S: ResultStore + ?Sized,
{
    let obsind = info.obsind;
    let mut state = ObservationState::Empty;
    match run_stages(image, catalog, info, store, config, replace, &mut state) {
        Ok(outcome) => Ok(outcome),
        Err(error) => {
            let terminal = match &error {
                FindError::Search(_) => Some(ObservationState::SearchFailed),
                FindError::PersistenceConflict(_) => Some(ObservationState::PersistenceConflict),
                _ => None,
            };
            let state = terminal.and_then(|t| state.advance(t).ok()).unwrap_or(state);
            Err(ObservationFailure {
                obsind,
                state,
                error,
            })
        }
    }
}

fn run_stages<I, S>(
    image: &I,
    catalog: &ObjectCatalog,
    info: ObservationInfo,
    store: &S,
    config: &PipelineConfig,
    replace: bool,
    state: &mut ObservationState,
) -> Result<ObservationOutcome>
where
    I: ImageSource + ?Sized,
    S: ResultStore + ?Sized,
{
    config.validate()?;
    let obsind = info.obsind;
    let lock = acquire(store, obsind, config.lock_wait)?;

    let mut set = find_target(image, catalog, info, &config.search)?;
    *state = state.advance(ObservationState::TargetFound)?;

    *state = state.advance(ObservationState::MatchingCandidates)?;
    let stats = match_candidates(image, catalog, &mut set, config)?;

    let frame_offset = OffsetTracker::frame_offset(&set);
    config.offset.propagate(&mut set, frame_offset);
    *state = state.advance(ObservationState::OffsetReconciled)?;

    let (apertures, recentred) = settle_apertures(image, &mut set, config)?;
    *state = state.advance(ObservationState::AperturesOptimized)?;

    // Losers are hidden here; under `Remove` the store deletes them in the
    // same write as the save.
    let mut overlaps = resolve_overlaps(&mut set, &config.overlap, Suppression::Hide)?;
    let suppressed: Vec<ObjInd> = match config.suppression {
        Suppression::Remove => overlaps.iter().filter_map(|o| o.lost_obj).collect(),
        Suppression::Hide => Vec::new(),
    };
    *state = state.advance(ObservationState::OverlapResolved)?;

    let (saved, removed) = store.save_suppressing(&lock, &set, replace, &suppressed)?;
    for &obj in &removed {
        set.remove_where(&ResultFilter::Object(obj));
    }
    if !removed.is_empty() {
        // Indices of the resolutions no longer point into the set.
        overlaps.retain(|o| o.lost_obj.is_none_or(|obj| !removed.contains(&obj)));
        debug!("Observation {}: objects {:?} suppressed everywhere", obsind, removed);
    }
    *state = state.advance(ObservationState::Persisted)?;

    info!(
        "Observation {}: {} results stored ({} found, {} skipped, {} overlaps)",
        obsind,
        saved.written,
        stats.found,
        stats.skipped,
        overlaps.len()
    );
    Ok(ObservationOutcome {
        state: *state,
        set,
        stats,
        optimized: OptimizeSummary {
            apertures,
            recentred,
            overlaps,
        },
        saved,
    })
}

/// Search the target of a stored observation again and carry the new frame
/// offset through every stored result, committing both in one save.
pub fn refind_target<I, S>(
    image: &I,
    catalog: &ObjectCatalog,
    obsind: ObsInd,
    store: &S,
    config: &PipelineConfig,
) -> Result<(FindResultSet, OffsetChange)>
where
    I: ImageSource + ?Sized,
    S: ResultStore + ?Sized,
{
    config.validate()?;
    let lock = acquire(store, obsind, config.lock_wait)?;
    let mut set = store
        .load_for_observation(obsind)?
        .ok_or_else(|| FindError::Storage(format!("no stored results for observation {obsind}")))?;

    let mut state = ObservationState::Persisted.advance(ObservationState::TargetFound)?;
    check_vicinity(catalog, catalog.target().id, set.vicinity())?;
    let target = find_catalog_object(image, catalog.target(), PixelOffset::ZERO, &config.search)?;
    let change = config.offset.reconcile_target(&mut set, target)?;
    state = state.advance(ObservationState::OffsetReconciled)?;

    store.save_locked(&lock, &set, true)?;
    state.advance(ObservationState::Persisted)?;
    Ok((set, change))
}

/// Process a batch of frames, loading each vicinity once.
///
/// A failed observation is recorded and the batch moves on.
pub fn run_batch<'a, I, S, L>(
    frames: impl IntoIterator<Item = (&'a I, ObservationInfo)>,
    catalogs: &mut CatalogCache<L>,
    store: &S,
    config: &PipelineConfig,
    replace: bool,
) -> BatchReport
where
    I: ImageSource + ?Sized + 'a,
    S: ResultStore + ?Sized,
    L: CatalogLoader,
{
    let mut report = BatchReport::default();
    for (image, info) in frames {
        let obsind = info.obsind;
        let catalog = match catalogs.vicinity(&info.vicinity) {
            Ok(c) => c,
            Err(e) => {
                warn!("Observation {}: catalog unavailable: {:#}", obsind, e);
                report.failed.push(FailedObservation {
                    obsind,
                    state: ObservationState::Empty,
                    reason: format!("{e:#}"),
                });
                continue;
            }
        };
        match process_observation(image, &catalog, info, store, config, replace) {
            Ok(outcome) => {
                report.processed += 1;
                report.found += outcome.stats.found;
                report.skipped += outcome.stats.skipped;
            }
            Err(failure) => {
                warn!("{}", failure);
                report.failed.push(FailedObservation {
                    obsind,
                    state: failure.state,
                    reason: failure.error.to_string(),
                });
            }
        }
    }
    info!(
        "Batch done: {} processed, {} failed",
        report.processed,
        report.failed.len()
    );
    report
}

// ── Helpers ─────────────────────────────────────────────────────────────────

/// Optimize apertures and move the frame offset with the re-centred target.
fn settle_apertures<I: ImageSource + ?Sized>(
    image: &I,
    set: &mut FindResultSet,
    config: &PipelineConfig,
) -> Result<(Vec<(usize, f64)>, OffsetChange)> {
    let apertures = optimize_set(image, set, &config.aperture)?;
    let recentred = config.offset.propagate(set, OffsetTracker::frame_offset(set));
    Ok((apertures, recentred))
}

fn acquire<S: ResultStore + ?Sized>(store: &S, obsind: ObsInd, wait: Duration) -> Result<ObservationLock> {
    store.lock_observation(obsind, wait).inspect_err(|e| {
        warn!("Observation {}: {}", obsind, e);
    })
}

fn check_vicinity(catalog: &ObjectCatalog, objind: ObjInd, expected: &str) -> Result<()> {
    if catalog.vicinity() != expected {
        return Err(FindError::CatalogMismatch {
            objind,
            expected: expected.to_string(),
            found: catalog.vicinity().to_string(),
        });
    }
    Ok(())
}

/// Unsuppressed non-target objects, limited to the frame's cone when known.
fn field_candidates<'c, I: ImageSource + ?Sized>(
    image: &I,
    catalog: &'c ObjectCatalog,
    obsind: ObsInd,
) -> Vec<&'c CatalogObject> {
    let target = catalog.target().id;
    match image.field_of_view() {
        Some((ra, dec, radius)) => {
            let inside: Vec<&CatalogObject> = catalog
                .objects_in_cone(ra, dec, radius)
                .into_iter()
                .filter(|o| o.id != target && !o.suppressed)
                .collect();
            debug!(
                "Observation {}: {} of {} catalog objects inside the field",
                obsind,
                inside.len(),
                catalog.len()
            );
            inside
        }
        None => catalog.candidates().collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::results::tests::{info, result, sample_set};
    use crate::search::tests::gaussian_frame;
    use crate::store::MemoryStore;

    #[test]
    fn forward_path_is_legal() {
        use ObservationState::*;
        let mut state = Empty;
        for next in [
            TargetFound,
            MatchingCandidates,
            OffsetReconciled,
            AperturesOptimized,
            OverlapResolved,
            Persisted,
        ] {
            state = state.advance(next).unwrap();
        }
        assert!(state.is_terminal());
    }

    #[test]
    fn stages_cannot_be_skipped() {
        use ObservationState::*;
        assert!(Empty.advance(AperturesOptimized).is_err());
        assert!(TargetFound.advance(SearchFailed).is_err());
        assert!(OverlapResolved.advance(TargetFound).is_err());
        assert!(SearchFailed.advance(PersistenceConflict).is_err());
        assert!(MatchingCandidates.advance(PersistenceConflict).is_ok());
    }

    #[test]
    fn exit_codes() {
        let mut report = BatchReport::default();
        assert_eq!(report.exit_code(), 0);
        report.failed.push(FailedObservation {
            obsind: ObsInd(1),
            state: ObservationState::SearchFailed,
            reason: "x".to_string(),
        });
        assert_eq!(report.exit_code(), 2);
        report.processed = 3;
        assert_eq!(report.exit_code(), 1);
    }

    #[test]
    fn persist_refuses_locked_observation() {
        let store = MemoryStore::new();
        let set = sample_set();
        let _held = store.lock_observation(set.obsind(), Duration::ZERO).unwrap();
        assert!(matches!(
            persist(&store, &set, true),
            Err(FindError::PersistenceConflict(_))
        ));
    }

    #[test]
    fn optimize_moves_offset_with_target() {
        let frame = gaussian_frame(80, 80, 10.0, 1.5, &[(40.0, 40.0, 800.0), (20.0, 60.0, 400.0)]);
        let mut set = FindResultSet::new(info(), 80, 80, result(1, 39.0, 40.0, 3.0, 0.0)).unwrap();
        set.insert(result(2, 20.0, 60.0, 3.0, 0.0)).unwrap();

        let summary = optimize(&frame, &mut set, &PipelineConfig::default()).unwrap();

        assert_eq!(set.target().row, 40.0);
        assert_eq!(set.offset(), PixelOffset::new(1.0, 0.0));
        assert_eq!(set.offset(), OffsetTracker::frame_offset(&set));
        assert!(matches!(summary.recentred, OffsetChange::Applied { adjusted: 1, .. }));
        let candidate = set.get(1).unwrap();
        assert_eq!(candidate.row, 20.0);
        assert_eq!(candidate.row - candidate.rdiff - set.offset().row, 20.0);
    }

    #[test]
    fn invalid_config_rejected_up_front() {
        let config = PipelineConfig {
            search: SearchParams {
                shift_max: 0,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(FindError::Configuration(_))));
    }
}
