//! Aperture radius selection.
//!
//! For one object the radius sweep evaluates the best fixed-radius flux
//! `adu(r)` for `r = r_min, r_min + step, …, r_max` and the marginal gain
//!
//! ```text
//! g(r) = 100 · (adu(r) − adu(r − step)) / adu(r)
//! ```
//!
//! The chosen radius is the smallest `r` with `g(r) < cutoff`. The sweep also
//! measures `adu(r_min − step)` when that radius is positive, so `r_min`
//! itself can be chosen. Lowering the cutoff can only move the choice outward.
//!
//! Long-lived apertures are voted on across observations with
//! [`ApertureVotes`]; the resulting [`ApertureAssignment`] carries enough
//! confidence information for [`ApertureAssignment::supersedes`] to refuse
//! replacing a better-supported prior.

use std::collections::BTreeMap;

use tracing::debug;

use crate::error::{FindError, Result};
use crate::image::ImageSource;
use crate::results::{FindResult, FindResultSet, ResultFilter};
use crate::search::find_best_col_row;

/// Radius sweep configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ApertureParams {
    /// Smallest radius tried, pixels.
    pub r_min: f64,
    /// Largest radius tried, pixels.
    pub r_max: f64,
    /// Radius increment, pixels.
    pub r_step: f64,
    /// Marginal gain, in percent, below which the aperture has converged.
    /// Default: 2.0
    pub cutoff_percent: f64,
    /// Integer shift allowed when re-centring each radius.
    pub shift_max: i32,
}

impl Default for ApertureParams {
    fn default() -> Self {
        Self {
            r_min: 2.0,
            r_max: 15.0,
            r_step: 1.0,
            cutoff_percent: 2.0,
            shift_max: 1,
        }
    }
}

impl ApertureParams {
    pub fn validate(&self) -> Result<()> {
        if !(self.r_min > 0.0) || !(self.r_max >= self.r_min) {
            return Err(FindError::Configuration(format!(
                "aperture range {}..{} is invalid",
                self.r_min, self.r_max
            )));
        }
        if !(self.r_step > 0.0) {
            return Err(FindError::Configuration(format!(
                "aperture step must be positive, got {}",
                self.r_step
            )));
        }
        if self.shift_max < 0 {
            return Err(FindError::Configuration(format!(
                "aperture shift_max must not be negative, got {}",
                self.shift_max
            )));
        }
        if !self.cutoff_percent.is_finite() {
            return Err(FindError::Configuration("cutoff must be finite".to_string()));
        }
        Ok(())
    }

    fn radii(&self) -> Vec<f64> {
        let n = ((self.r_max - self.r_min) / self.r_step + 1e-9).floor() as usize;
        (0..=n).map(|i| self.r_min + i as f64 * self.r_step).collect()
    }

    /// Radius one step inside the sweep, if there is one.
    fn baseline_radius(&self) -> Option<f64> {
        Some(self.r_min - self.r_step).filter(|r| *r > 0.0)
    }
}

/// Flux as a function of aperture radius for one object.
#[derive(Debug, Clone, PartialEq)]
pub struct ApertureCurve {
    pub radii: Vec<f64>,
    pub adus: Vec<f64>,
    /// `adu(r_min − step)`, when that radius is positive.
    pub baseline: Option<f64>,
}

impl ApertureCurve {
    /// Marginal gain in percent at each radius. A radius with non-positive
    /// flux has none, as does the first one without a baseline.
    pub fn gains(&self) -> Vec<Option<f64>> {
        let mut out = Vec::with_capacity(self.adus.len());
        let mut previous = self.baseline;
        for &adu in &self.adus {
            out.push(previous.filter(|_| adu > 0.0).map(|p| 100.0 * (adu - p) / adu));
            previous = Some(adu);
        }
        out
    }

    /// Smallest radius whose gain is under `cutoff_percent`, else the largest radius.
    pub fn choose_radius(&self, cutoff_percent: f64) -> f64 {
        self.gains()
            .iter()
            .zip(&self.radii)
            .find(|(g, _)| g.is_some_and(|g| g < cutoff_percent))
            .map(|(_, &r)| r)
            .or_else(|| self.radii.last().copied())
            .unwrap_or(0.0)
    }
}

/// Evaluate `adu(r)` around a result's position for every radius in the sweep.
pub fn sweep<I: ImageSource + ?Sized>(image: &I, result: &FindResult, params: &ApertureParams) -> ApertureCurve {
    let adu = |r: f64| find_best_col_row(image, result.col, result.row, r, params.shift_max).adu_sum;
    let radii = params.radii();
    let adus = radii.iter().map(|&r| adu(r)).collect();
    ApertureCurve {
        radii,
        adus,
        baseline: params.baseline_radius().map(adu),
    }
}

/// Settle one result on its optimal aperture.
///
/// Sets `apsize`, moves the result to the best integer shift for that radius
/// (carrying `rdiff`/`cdiff` along) and stores the flux measured there.
/// Returns the chosen radius.
pub fn optimize_result<I: ImageSource + ?Sized>(
    image: &I,
    result: &mut FindResult,
    params: &ApertureParams,
) -> f64 {
    let curve = sweep(image, result, params);
    let apsize = curve.choose_radius(params.cutoff_percent);
    let best = find_best_col_row(image, result.col, result.row, apsize, params.shift_max);
    result.rdiff += best.row - result.row;
    result.cdiff += best.col - result.col;
    result.row = best.row;
    result.col = best.col;
    result.apsize = apsize;
    result.adus = best.adu_sum;
    apsize
}

/// Optimize every visible result of a set.
///
/// Returns the chosen radius per result index; hidden entries are left alone.
pub fn optimize_set<I: ImageSource + ?Sized>(
    image: &I,
    set: &mut FindResultSet,
    params: &ApertureParams,
) -> Result<Vec<(usize, f64)>> {
    params.validate()?;
    let mut chosen = Vec::new();
    for idx in set.indices(&ResultFilter::Visible) {
        let mut apsize = 0.0;
        set.update(idx, |r| apsize = optimize_result(image, r, params))?;
        if let Some(r) = set.get(idx) {
            debug!("Result {} ({:?}): aperture {:.1}, {:.1} ADU", r.label, r.obj, apsize, r.adus);
        }
        chosen.push((idx, apsize));
    }
    Ok(chosen)
}

/// An aperture established from many observations.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ApertureAssignment {
    pub apsize: f64,
    /// Number of votes behind the assignment.
    pub nsamples: u32,
    /// Spread of the votes, pixels.
    pub stddev: f64,
}

impl ApertureAssignment {
    /// Whether this assignment may replace `prior`.
    ///
    /// It may when there is no prior, when it rests on strictly more votes,
    /// or on as many votes with no larger spread.
    pub fn supersedes(&self, prior: Option<&ApertureAssignment>) -> bool {
        match prior {
            None => true,
            Some(p) => {
                self.nsamples > p.nsamples
                    || (self.nsamples == p.nsamples && self.stddev <= p.stddev)
            }
        }
    }
}

/// Histogram of radius votes for one object.
#[derive(Debug, Clone, PartialEq)]
pub struct ApertureVotes {
    step: f64,
    bins: BTreeMap<i64, u32>,
    count: u32,
    sum: f64,
    sum_sq: f64,
}

impl ApertureVotes {
    pub fn new(step: f64) -> Result<Self> {
        if !(step > 0.0) {
            return Err(FindError::Configuration(format!(
                "vote bin width must be positive, got {step}"
            )));
        }
        Ok(Self {
            step,
            bins: BTreeMap::new(),
            count: 0,
            sum: 0.0,
            sum_sq: 0.0,
        })
    }

    pub fn add(&mut self, apsize: f64) {
        let bin = (apsize / self.step).round() as i64;
        *self.bins.entry(bin).or_insert(0) += 1;
        self.count += 1;
        self.sum += apsize;
        self.sum_sq += apsize * apsize;
    }

    pub fn len(&self) -> u32 {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Most voted radius (ties go to the smaller one) with count and spread.
    pub fn assignment(&self) -> Option<ApertureAssignment> {
        let mut best: Option<(i64, u32)> = None;
        for (&bin, &n) in &self.bins {
            if best.is_none_or(|(_, bn)| n > bn) {
                best = Some((bin, n));
            }
        }
        let (bin, _) = best?;
        let n = self.count as f64;
        let mean = self.sum / n;
        let var = (self.sum_sq / n - mean * mean).max(0.0);
        Some(ApertureAssignment {
            apsize: bin as f64 * self.step,
            nsamples: self.count,
            stddev: var.sqrt(),
        })
    }
}
