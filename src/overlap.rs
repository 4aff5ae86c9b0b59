//! Aperture collision detection and resolution.

use tracing::info;

use crate::error::{FindError, Result};
use crate::results::{FindResultSet, ResultFilter};
use crate::ObjInd;

/// When two apertures count as overlapping.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ClashRule {
    /// Clash when `distance < scale * (ap_i + ap_j) - tolerance`.
    RadiusSum { scale: f64, tolerance: f64 },
    /// Clash when centres are closer than a fixed pixel distance.
    FixedDistance(f64),
}

impl ClashRule {
    fn clashes(&self, distance: f64, ap_i: f64, ap_j: f64) -> bool {
        match *self {
            ClashRule::RadiusSum { scale, tolerance } => distance < scale * (ap_i + ap_j) - tolerance,
            ClashRule::FixedDistance(d) => distance < d,
        }
    }
}

/// Overlap detection configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OverlapParams {
    /// Default: apertures touching, `RadiusSum { scale: 1.0, tolerance: 0.0 }`.
    pub rule: ClashRule,
}

impl Default for OverlapParams {
    fn default() -> Self {
        Self {
            rule: ClashRule::RadiusSum {
                scale: 1.0,
                tolerance: 0.0,
            },
        }
    }
}

impl OverlapParams {
    pub fn validate(&self) -> Result<()> {
        let ok = match self.rule {
            ClashRule::RadiusSum { scale, tolerance } => {
                scale > 0.0 && scale.is_finite() && tolerance.is_finite()
            }
            ClashRule::FixedDistance(d) => d >= 0.0 && d.is_finite(),
        };
        if !ok {
            return Err(FindError::Configuration(format!(
                "invalid clash rule {:?}",
                self.rule
            )));
        }
        Ok(())
    }
}

/// How a losing entry is taken out of the set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Suppression {
    /// Keep the entry but mark it hidden.
    Hide,
    /// Drop the entry from the set.
    Remove,
}

/// One decided collision.
#[derive(Debug, Clone, PartialEq)]
pub struct OverlapResolution {
    /// Index of the surviving entry, as of before resolution.
    pub kept: usize,
    /// Index of the losing entry, as of before resolution.
    pub lost: usize,
    /// Object of the losing entry, for catalog-level suppression.
    pub lost_obj: Option<ObjInd>,
    pub distance: f64,
}

/// Every clashing pair `(i, j)` of visible entries, `i < j`, sorted.
pub fn overlap_check(set: &FindResultSet, params: &OverlapParams) -> Vec<(usize, usize)> {
    let visible = set.indices(&ResultFilter::Visible);
    let results = set.results();
    let mut pairs = Vec::new();
    for (k, &i) in visible.iter().enumerate() {
        for &j in &visible[k + 1..] {
            let (a, b) = (&results[i], &results[j]);
            if params.rule.clashes(a.distance_to(b), a.apsize, b.apsize) {
                pairs.push((i, j));
            }
        }
    }
    pairs
}

/// Resolve every clash by taking the weaker entry out.
///
/// The target always survives. Otherwise the smaller flux loses, the later
/// index on a tie. A pair whose member has already lost is skipped.
pub fn resolve_overlaps(
    set: &mut FindResultSet,
    params: &OverlapParams,
    suppression: Suppression,
) -> Result<Vec<OverlapResolution>> {
    params.validate()?;
    let pairs = overlap_check(set, params);
    let mut lost = vec![false; set.len()];
    let mut resolutions = Vec::new();

    for (i, j) in pairs {
        if lost[i] || lost[j] {
            continue;
        }
        let (a, b) = (&set.results()[i], &set.results()[j]);
        let (kept, loser) = if a.istarget || (!b.istarget && a.adus >= b.adus) {
            (i, j)
        } else {
            (j, i)
        };
        lost[loser] = true;
        resolutions.push(OverlapResolution {
            kept,
            lost: loser,
            lost_obj: set.results()[loser].obj,
            distance: a.distance_to(b),
        });
    }

    if resolutions.is_empty() {
        return Ok(resolutions);
    }

    match suppression {
        Suppression::Hide => {
            for res in &resolutions {
                set.set_hidden(res.lost, true);
            }
        }
        Suppression::Remove => {
            let mut keep = vec![true; set.len()];
            for res in &resolutions {
                keep[res.lost] = false;
            }
            set.retain_indices(&keep);
        }
    }
    set.relabel();

    info!(
        "Observation {}: {} overlapping apertures resolved ({:?})",
        set.obsind(),
        resolutions.len(),
        suppression
    );
    Ok(resolutions)
}
