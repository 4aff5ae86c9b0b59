//! # apfind
//!
//! Object identification and aperture-photometry result management for
//! calibrated telescope frames.
//!
//! Given a frame and a catalog of objects expected near one target star,
//! `apfind` finds each object's true pixel centroid despite pointing error,
//! tracks the frame-wide pixel offset the target reveals, picks a per-object
//! aperture radius where the marginal flux gain drops below a cutoff, resolves
//! colliding apertures, and stores one replaceable result set per observation.
//!
//! ## Example
//!
//! ```no_run
//! use apfind::{pipeline, FrameImage, MemoryStore, ObjectCatalog, ObsInd, ObservationInfo, PipelineConfig};
//!
//! # fn frame() -> FrameImage { unimplemented!() }
//! # fn catalog() -> ObjectCatalog { unimplemented!() }
//! let image = frame();
//! let catalog = catalog();
//! let store = MemoryStore::new();
//! let config = PipelineConfig::default();
//! let info = ObservationInfo::new(ObsInd(42), "R", "2024-03-01T02:11:00", catalog.vicinity());
//!
//! let outcome = pipeline::process_observation(&image, &catalog, info, &store, &config, true).unwrap();
//! println!("{} found, {} skipped", outcome.stats.found, outcome.stats.skipped);
//! ```
//!
//! ## Processing stages
//!
//! 1. **Target search**: the target's displacement from its predicted pixel
//!    position defines the frame offset. Failure here ends the observation.
//! 2. **Candidate matching**: every other catalog object is searched in
//!    parallel on a bounded worker pool, starting from its prediction shifted
//!    by the frame offset. Individual failures are logged and skipped.
//! 3. **Offset reconciliation**: when the frame offset moves, every other
//!    result is re-expressed so its absolute position is unchanged.
//! 4. **Aperture optimisation**: the radius sweep picks the smallest radius
//!    whose marginal gain falls under the cutoff.
//! 5. **Overlap resolution**: colliding apertures lose their fainter member.
//! 6. **Persistence**: the set is committed atomically, optionally replacing
//!    (and cascading over) what was stored for the observation.

use std::fmt;

use rkyv::{Archive, Deserialize, Serialize};

pub mod aperture;
pub mod catalog;
mod error;
pub mod image;
pub mod offset;
pub mod overlap;
pub mod pipeline;
pub mod results;
pub mod search;
pub mod store;
pub mod wcs;

pub use aperture::{ApertureAssignment, ApertureCurve, ApertureParams, ApertureVotes};
pub use catalog::{CatalogCache, CatalogLoader, CatalogObject, ObjectCatalog};
pub use error::{FindError, Result, SearchFailure};
pub use image::{FrameImage, ImageSource};
pub use offset::{OffsetChange, OffsetTracker, PixelOffset};
pub use overlap::{ClashRule, OverlapParams, OverlapResolution, Suppression};
pub use pipeline::{
    BatchReport, FailedObservation, ObservationFailure, ObservationState, PipelineConfig, SearchStats,
};
pub use results::{FindResult, FindResultSet, ObservationInfo, ResultFilter};
pub use search::{BestAperture, SearchParams};
pub use store::{FileStore, MemoryStore, ObservationLock, ResultStore, SaveSummary};
pub use wcs::TanWcs;

/// Observation identity, the key of one result set.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Archive, Serialize, Deserialize,
)]
pub struct ObsInd(pub u32);

/// Catalog object identity.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Archive, Serialize, Deserialize,
)]
pub struct ObjInd(pub u32);

impl fmt::Display for ObsInd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for ObjInd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
