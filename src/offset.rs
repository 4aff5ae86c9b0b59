//! Frame-wide pixel offset tracking.
//!
//! Only the target search yields ground truth about pointing error: the
//! target's displacement from its predicted pixel position is the frame
//! offset. Candidate predictions are `wcs(ra, dec) + offset`, so whenever the
//! offset moves by `delta`, every candidate's `(rdiff, cdiff)` moves by
//! `-delta` and its absolute position stays put.

use tracing::{debug, info};

use crate::error::{FindError, Result};
use crate::results::{FindResult, FindResultSet};

/// A signed `(row, col)` displacement in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PixelOffset {
    pub row: f64,
    pub col: f64,
}

impl PixelOffset {
    pub const ZERO: PixelOffset = PixelOffset { row: 0.0, col: 0.0 };

    pub fn new(row: f64, col: f64) -> Self {
        Self { row, col }
    }

    pub fn magnitude(&self) -> f64 {
        self.row.hypot(self.col)
    }

    pub fn minus(&self, other: PixelOffset) -> PixelOffset {
        PixelOffset::new(self.row - other.row, self.col - other.col)
    }
}

/// What a propagation did to a result set.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum OffsetChange {
    /// The new offset was within epsilon of the old one.
    #[default]
    Unchanged,
    /// Candidates were re-expressed against the new offset.
    Applied {
        delta: PixelOffset,
        adjusted: usize,
    },
}

/// Applies frame offset corrections to a result set.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OffsetTracker {
    /// Offsets closer than this (pixels) to the current one are ignored.
    pub epsilon: f64,
}

impl Default for OffsetTracker {
    fn default() -> Self {
        Self { epsilon: 0.05 }
    }
}

impl OffsetTracker {
    pub fn new(epsilon: f64) -> Result<Self> {
        let tracker = Self { epsilon };
        tracker.validate()?;
        Ok(tracker)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.epsilon >= 0.0) || !self.epsilon.is_finite() {
            return Err(FindError::Configuration(format!(
                "offset epsilon must be a non-negative number, got {}",
                self.epsilon
            )));
        }
        Ok(())
    }

    /// The frame offset measured by the target.
    pub fn frame_offset(set: &FindResultSet) -> PixelOffset {
        let t = set.target();
        PixelOffset::new(t.rdiff, t.cdiff)
    }

    /// Move the set to `new_offset`, preserving every candidate's absolute position.
    pub fn propagate(&self, set: &mut FindResultSet, new_offset: PixelOffset) -> OffsetChange {
        let delta = new_offset.minus(set.offset());
        if delta.magnitude() <= self.epsilon {
            return OffsetChange::Unchanged;
        }

        let mut adjusted = 0;
        for r in set.candidates_mut() {
            r.rdiff -= delta.row;
            r.cdiff -= delta.col;
            adjusted += 1;
        }
        set.set_offset(new_offset);
        debug!(
            "Observation {}: offset moved by ({:.2}, {:.2}), {} candidates adjusted",
            set.obsind(),
            delta.row,
            delta.col,
            adjusted
        );
        OffsetChange::Applied { delta, adjusted }
    }

    /// Install a freshly searched target and propagate its displacement.
    ///
    /// Both happen on the owned set, so a single save commits them together.
    pub fn reconcile_target(
        &self,
        set: &mut FindResultSet,
        target: FindResult,
    ) -> Result<OffsetChange> {
        let new_offset = PixelOffset::new(target.rdiff, target.cdiff);
        set.replace_target(target)?;
        let change = self.propagate(set, new_offset);
        if let OffsetChange::Applied { delta, adjusted } = change {
            info!(
                "Observation {}: target re-found, offset now ({:.2}, {:.2}) after shift ({:.2}, {:.2}); {} results re-expressed",
                set.obsind(),
                new_offset.row,
                new_offset.col,
                delta.row,
                delta.col,
                adjusted
            );
        }
        Ok(change)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::results::tests::{info, result};

    /// Absolute positions implied by predictions `wcs + offset` for candidates.
    fn absolute(set: &FindResultSet, wcs: &[(f64, f64)]) -> Vec<(f64, f64)> {
        set.results()
            .iter()
            .zip(wcs)
            .map(|(r, &(wr, wc))| {
                if r.istarget {
                    r.absolute_from(wr, wc)
                } else {
                    r.absolute_from(wr + set.offset().row, wc + set.offset().col)
                }
            })
            .collect()
    }

    fn set_with_offset() -> (FindResultSet, Vec<(f64, f64)>) {
        let mut target = result(1, 51.0, 49.0, 4.0, 900.0);
        target.rdiff = 1.0;
        target.cdiff = -1.0;
        let mut set = FindResultSet::new(info(), 100, 100, target).unwrap();
        let mut a = result(2, 21.5, 29.0, 4.0, 100.0);
        a.rdiff = 0.5;
        a.cdiff = 0.0;
        set.insert(a).unwrap();
        let mut b = result(3, 80.0, 10.0, 4.0, 100.0);
        b.rdiff = -1.0;
        b.cdiff = 1.0;
        set.insert(b).unwrap();
        // WCS predictions: found - rdiff - offset for candidates.
        let wcs = vec![(50.0, 50.0), (20.0, 30.0), (80.0, 10.0)];
        (set, wcs)
    }

    #[test]
    fn offset_starts_from_target() {
        let (set, _) = set_with_offset();
        assert_eq!(set.offset(), PixelOffset::new(1.0, -1.0));
        assert_eq!(OffsetTracker::frame_offset(&set), set.offset());
    }

    #[test]
    fn propagation_preserves_absolute_positions() {
        let (mut set, wcs) = set_with_offset();
        let before = absolute(&set, &wcs);
        let tracker = OffsetTracker::default();
        let change = tracker.propagate(&mut set, PixelOffset::new(2.5, 0.5));
        assert!(matches!(change, OffsetChange::Applied { adjusted: 2, .. }));
        let after = absolute(&set, &wcs);
        for (b, a) in before.iter().skip(1).zip(after.iter().skip(1)) {
            assert!((b.0 - a.0).abs() < 1e-12 && (b.1 - a.1).abs() < 1e-12);
        }
        assert_eq!(set.results()[1].rdiff, 0.5 - 1.5);
        assert_eq!(set.results()[1].cdiff, 0.0 - 1.5);
    }

    #[test]
    fn tiny_offset_ignored() {
        let (mut set, _) = set_with_offset();
        let snapshot = set.clone();
        let change = OffsetTracker::new(0.1)
            .unwrap()
            .propagate(&mut set, PixelOffset::new(1.05, -1.0));
        assert_eq!(change, OffsetChange::Unchanged);
        assert_eq!(set, snapshot);
    }

    #[test]
    fn reconcile_target_moves_candidates() {
        let (mut set, wcs) = set_with_offset();
        let before = absolute(&set, &wcs);
        let mut refound = result(1, 53.0, 48.0, 4.0, 950.0);
        refound.rdiff = 3.0;
        refound.cdiff = -2.0;
        OffsetTracker::default()
            .reconcile_target(&mut set, refound)
            .unwrap();
        assert_eq!(set.offset(), PixelOffset::new(3.0, -2.0));
        assert!(set.target().istarget);
        assert_eq!(set.target().row, 53.0);
        let after = absolute(&set, &wcs);
        assert_eq!(before[1..], after[1..]);
        assert_eq!(after[0], (53.0, 48.0));
    }

    #[test]
    fn negative_epsilon_rejected() {
        assert!(OffsetTracker::new(-1.0).is_err());
        assert!(OffsetTracker::new(f64::NAN).is_err());
    }
}
