//! Error taxonomy for object finding and result persistence.

use thiserror::Error;

use crate::{ObjInd, ObsInd};

/// Why a single object could not be located on a frame.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SearchFailure {
    /// The search window around the predicted position leaves the trimmed frame.
    #[error("search window around ({row:.1}, {col:.1}) lies outside the trimmed frame")]
    OutOfBounds {
        /// Predicted row.
        row: f64,
        /// Predicted column.
        col: f64,
    },

    /// The best aperture never rose above the sky noise threshold.
    #[error("peak {peak:.1} does not clear sky threshold {threshold:.1}")]
    BelowThreshold {
        /// Brightest pixel inside the best aperture.
        peak: f64,
        /// `mean + sigma * std` for the frame.
        threshold: f64,
    },

    /// Sky-subtracted flux inside the aperture was not positive.
    #[error("no positive flux inside aperture")]
    NoFlux,

    /// The catalog object has no pixel position on this frame.
    #[error("object {0} does not project onto the frame")]
    NoProjection(ObjInd),
}

/// Errors produced while finding objects and managing result sets.
#[derive(Error, Debug)]
pub enum FindError {
    /// An object could not be located.
    #[error("search failed: {0}")]
    Search(#[from] SearchFailure),

    /// A candidate belongs to a different vicinity than the result set.
    #[error("object {objind} is in vicinity `{found}`, result set is `{expected}`")]
    CatalogMismatch {
        /// Offending object.
        objind: ObjInd,
        /// Vicinity of the result set.
        expected: String,
        /// Vicinity of the candidate.
        found: String,
    },

    /// Another writer holds the observation, or the write would be stale.
    #[error("observation {0} is locked by another writer")]
    PersistenceConflict(ObsInd),

    /// Invalid parameters, raised before any image or store access.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// Snapshot or row-level storage failure.
    #[error("storage error: {0}")]
    Storage(String),
}

pub type Result<T> = std::result::Result<T, FindError>;
