//! Centroid search for objects already known to be near a predicted position.
//!
//! The search has two halves:
//! 1. [`find_best_col_row`] slides a fixed circular aperture over every
//!    integer offset within `shift_max` and keeps the one with the largest
//!    sky-subtracted sum. It is pure and read-only, so any number of searches
//!    may run against the same frame in parallel.
//! 2. [`find_object`] takes that integer position, checks the peak clears the
//!    sky noise, refines the centroid from sky-subtracted intensity moments
//!    (with a quadratic peak fit when it agrees), and measures the final flux.

use std::cmp::Ordering;

use nalgebra::{Matrix2, Vector2};
use tracing::debug;

use crate::catalog::CatalogObject;
use crate::error::{FindError, Result, SearchFailure};
use crate::image::ImageSource;
use crate::offset::PixelOffset;
use crate::results::FindResult;

/// Parameters for a single-object search.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchParams {
    /// Largest integer pixel shift searched in each axis. Must be positive.
    pub shift_max: i32,
    /// A peak must exceed `mean + sky_sigma_threshold * std`.
    /// Default: 5.0
    pub sky_sigma_threshold: f64,
    /// Border pixels excluded from the search window.
    /// Default: 0
    pub trim: usize,
    /// Aperture radius used when the catalog has no hint.
    /// Default: 4.0
    pub default_apsize: f64,
}

impl Default for SearchParams {
    fn default() -> Self {
        Self {
            shift_max: 10,
            sky_sigma_threshold: 5.0,
            trim: 0,
            default_apsize: 4.0,
        }
    }
}

impl SearchParams {
    pub fn validate(&self) -> Result<()> {
        if self.shift_max <= 0 {
            return Err(FindError::Configuration(format!(
                "shift_max must be positive, got {}",
                self.shift_max
            )));
        }
        if !(self.default_apsize > 0.0) {
            return Err(FindError::Configuration(format!(
                "default aperture must be positive, got {}",
                self.default_apsize
            )));
        }
        if !self.sky_sigma_threshold.is_finite() {
            return Err(FindError::Configuration(
                "sky sigma threshold must be finite".to_string(),
            ));
        }
        Ok(())
    }
}

/// Outcome of a fixed-radius aperture search.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BestAperture {
    pub col: f64,
    pub row: f64,
    /// Sky-subtracted flux inside the aperture.
    pub adu_sum: f64,
    pub pixel_count: usize,
    /// Brightest raw pixel inside the aperture.
    pub peak: f64,
}

/// Sky-subtracted flux and pixel count of a circular aperture.
///
/// A pixel belongs to the aperture when its centre is within `apsize`.
/// Pixels outside the frame and non-finite pixels are skipped.
pub fn aperture_sum<I: ImageSource + ?Sized>(image: &I, col: f64, row: f64, apsize: f64) -> (f64, usize) {
    let (sum, npix, _) = aperture_stats(image, col, row, apsize);
    (sum, npix)
}

fn aperture_stats<I: ImageSource + ?Sized>(image: &I, col: f64, row: f64, apsize: f64) -> (f64, usize, f64) {
    let sky = image.mean_val();
    let r2 = apsize * apsize;
    let reach = apsize.ceil() as isize + 1;
    let (rc, cc) = (row.round() as isize, col.round() as isize);

    let mut sum = 0.0;
    let mut npix = 0usize;
    let mut peak = f64::NEG_INFINITY;
    for r in (rc - reach)..=(rc + reach) {
        let dr = r as f64 - row;
        for c in (cc - reach)..=(cc + reach) {
            let dc = c as f64 - col;
            if dr * dr + dc * dc > r2 {
                continue;
            }
            if let Some(v) = finite_pixel(image, r, c) {
                sum += v - sky;
                npix += 1;
                peak = peak.max(v);
            }
        }
    }
    (sum, npix, peak)
}

/// For a fixed aperture, the integer shift within `shift_max` that maximises flux.
///
/// Ties go to the smaller shift, then to row-major order, so the result is
/// deterministic.
pub fn find_best_col_row<I: ImageSource + ?Sized>(
    image: &I,
    col: f64,
    row: f64,
    apsize: f64,
    shift_max: i32,
) -> BestAperture {
    let mut best: Option<(BestAperture, i32)> = None;
    for dr in -shift_max..=shift_max {
        for dc in -shift_max..=shift_max {
            let (c, r) = (col + dc as f64, row + dr as f64);
            let (adu_sum, pixel_count, peak) = aperture_stats(image, c, r, apsize);
            let dist = dr * dr + dc * dc;
            let candidate = BestAperture {
                col: c,
                row: r,
                adu_sum,
                pixel_count,
                peak,
            };
            let keep = best.as_ref().is_some_and(|(b, bd)| {
                b.adu_sum.total_cmp(&adu_sum).then(dist.cmp(bd)) != Ordering::Less
            });
            if !keep {
                best = Some((candidate, dist));
            }
        }
    }
    // shift_max >= 0 always yields at least the zero shift.
    best.map(|(b, _)| b).unwrap_or(BestAperture {
        col,
        row,
        adu_sum: 0.0,
        pixel_count: 0,
        peak: f64::NEG_INFINITY,
    })
}

/// Locate one object near `(predicted_row, predicted_col)`.
///
/// `apsize` overrides the aperture; otherwise the catalog hint, then the
/// default, is used. The returned result carries `rdiff`/`cdiff` against the
/// given prediction and the sky position of the catalog object (or, without
/// one, nothing meaningful: zeros).
pub fn find_object<I: ImageSource + ?Sized>(
    image: &I,
    predicted_row: f64,
    predicted_col: f64,
    obj: Option<&CatalogObject>,
    apsize: Option<f64>,
    params: &SearchParams,
) -> std::result::Result<FindResult, SearchFailure> {
    let apsize = apsize
        .or_else(|| obj.and_then(|o| o.aperture_hint))
        .filter(|a| *a > 0.0)
        .unwrap_or(params.default_apsize);

    let shift = params.shift_max as f64;
    let trim = params.trim as f64;
    let max_row = image.nrows() as f64 - 1.0 - trim;
    let max_col = image.ncols() as f64 - 1.0 - trim;
    if !predicted_row.is_finite()
        || !predicted_col.is_finite()
        || predicted_row - shift < trim
        || predicted_col - shift < trim
        || predicted_row + shift > max_row
        || predicted_col + shift > max_col
    {
        return Err(SearchFailure::OutOfBounds {
            row: predicted_row,
            col: predicted_col,
        });
    }

    let start_row = predicted_row.round();
    let start_col = predicted_col.round();
    let best = find_best_col_row(image, start_col, start_row, apsize, params.shift_max);

    let threshold = image.mean_val() + params.sky_sigma_threshold * image.std_val();
    if !(best.peak > threshold) {
        return Err(SearchFailure::BelowThreshold {
            peak: best.peak,
            threshold,
        });
    }

    let (row, col) = refine_centroid(image, best.row, best.col, apsize).ok_or(SearchFailure::NoFlux)?;
    let (adus, _) = aperture_sum(image, col, row, apsize);

    debug!(
        "Found {:?} at ({:.2}, {:.2}), predicted ({:.2}, {:.2}), {:.1} ADU in r={:.1}",
        obj.map(|o| o.id),
        row,
        col,
        predicted_row,
        predicted_col,
        adus,
        apsize
    );

    Ok(FindResult {
        obj: obj.map(|o| o.id),
        row,
        col,
        rdiff: row - predicted_row,
        cdiff: col - predicted_col,
        apsize,
        adus,
        radeg: obj.map_or(0.0, |o| o.ra_deg),
        decdeg: obj.map_or(0.0, |o| o.dec_deg),
        label: String::new(),
        hide: false,
        istarget: false,
    })
}

/// Predict a catalog object's pixel position and search for it.
///
/// The prediction is the frame projection of the object's coordinates plus
/// `offset`; pass [`PixelOffset::ZERO`] for the target itself.
pub fn find_catalog_object<I: ImageSource + ?Sized>(
    image: &I,
    obj: &CatalogObject,
    offset: PixelOffset,
    params: &SearchParams,
) -> std::result::Result<FindResult, SearchFailure> {
    let (col, row) = image
        .coords_to_pix(obj.ra_deg, obj.dec_deg)
        .ok_or(SearchFailure::NoProjection(obj.id))?;
    find_object(image, row + offset.row, col + offset.col, Some(obj), None, params)
}

/// Sky-subtracted intensity centroid over the aperture around an integer
/// position, replaced by a quadratic fit of the 3×3 peak neighbourhood when
/// the two agree to within half a pixel.
fn refine_centroid<I: ImageSource + ?Sized>(image: &I, row: f64, col: f64, apsize: f64) -> Option<(f64, f64)> {
    let sky = image.mean_val();
    let r2 = apsize * apsize;
    let reach = apsize.ceil() as isize;
    let (rc, cc) = (row.round() as isize, col.round() as isize);

    let mut sum_r = 0.0;
    let mut sum_c = 0.0;
    let mut sum_i = 0.0;
    let mut peak = (rc, cc, f64::NEG_INFINITY);
    for r in (rc - reach)..=(rc + reach) {
        for c in (cc - reach)..=(cc + reach) {
            let (dr, dc) = ((r - rc) as f64, (c - cc) as f64);
            if dr * dr + dc * dc > r2 {
                continue;
            }
            let Some(v) = finite_pixel(image, r, c) else { continue };
            let v = v - sky;
            if v > peak.2 {
                peak = (r, c, v);
            }
            let w = v.max(0.0);
            sum_r += dr * w;
            sum_c += dc * w;
            sum_i += w;
        }
    }
    if sum_i <= 0.0 {
        return None;
    }

    let ybar = rc as f64 + sum_r / sum_i;
    let xbar = cc as f64 + sum_c / sum_i;

    let (pr, pc, _) = peak;
    if let Some((qy, qx)) = quadratic_vertex(image, pr, pc) {
        if (qx - xbar).powi(2) + (qy - ybar).powi(2) < 0.25 {
            return Some((qy, qx));
        }
    }
    Some((ybar, xbar))
}

fn finite_pixel<I: ImageSource + ?Sized>(image: &I, row: isize, col: isize) -> Option<f64> {
    image.pixel(row, col).map(f64::from).filter(|v| v.is_finite())
}

/// Vertex of the quadratic surface through the 3×3 patch centred on
/// `(row, col)`, when it is a maximum within half a pixel of the centre.
fn quadratic_vertex<I: ImageSource + ?Sized>(image: &I, row: isize, col: isize) -> Option<(f64, f64)> {
    let at = |dr: isize, dc: isize| finite_pixel(image, row + dr, col + dc);
    let centre = at(0, 0)?;
    let (up, down) = (at(-1, 0)?, at(1, 0)?);
    let (left, right) = (at(0, -1)?, at(0, 1)?);
    let cross = (at(1, 1)? - at(1, -1)? - at(-1, 1)? + at(-1, -1)?) / 4.0;

    // Gradient and Hessian in (col, row) order.
    let gradient = Vector2::new((right - left) / 2.0, (down - up) / 2.0);
    let hessian = Matrix2::new(right + left - 2.0 * centre, cross, cross, down + up - 2.0 * centre);
    if hessian.determinant().abs() <= 1e-10 {
        return None;
    }
    let step = -(hessian.try_inverse()? * gradient);
    if step.x.abs() > 0.5 || step.y.abs() > 0.5 {
        return None;
    }
    Some((row as f64 + step.y, col as f64 + step.x))
}
