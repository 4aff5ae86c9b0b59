//! Gnomonic (TAN) world coordinate system for a single frame.
//!
//! Pixel convention matches FITS: columns along x, rows along y, and the
//! reference pixel `crpix` is given as `(col, row)` in zero-based pixel
//! coordinates. The CD matrix maps pixel offsets to tangent-plane degrees.

use nalgebra::{Matrix2, Vector2, Vector3};

use crate::catalog::radec_to_uvec;

/// Orthonormal frame at a tangent point: east, north and the boresight.
#[derive(Debug, Clone, Copy, PartialEq)]
struct TangentBasis {
    east: Vector3<f64>,
    north: Vector3<f64>,
    axis: Vector3<f64>,
}

impl TangentBasis {
    fn at(ra_deg: f64, dec_deg: f64) -> Self {
        let (ra, dec) = (ra_deg.to_radians(), dec_deg.to_radians());
        let (sin_ra, cos_ra) = ra.sin_cos();
        let (sin_dec, cos_dec) = dec.sin_cos();
        Self {
            east: Vector3::new(-sin_ra, cos_ra, 0.0),
            north: Vector3::new(-sin_dec * cos_ra, -sin_dec * sin_ra, cos_dec),
            axis: radec_to_uvec(ra, dec),
        }
    }

    /// Standard coordinates `(xi, eta)` in radians, or `None` on or behind
    /// the plane.
    fn project(&self, dir: &Vector3<f64>) -> Option<Vector2<f64>> {
        let depth = dir.dot(&self.axis);
        if depth <= 1e-12 {
            return None;
        }
        Some(Vector2::new(dir.dot(&self.east), dir.dot(&self.north)) / depth)
    }

    fn deproject(&self, plane: &Vector2<f64>) -> Vector3<f64> {
        (self.axis + self.east * plane.x + self.north * plane.y).normalize()
    }
}

/// A TAN projection with a linear CD matrix.
#[derive(Debug, Clone, PartialEq)]
pub struct TanWcs {
    /// Reference sky position `[ra, dec]` in degrees.
    pub crval_deg: [f64; 2],
    /// Reference pixel `[col, row]`.
    pub crpix: [f64; 2],
    /// Degrees of tangent plane per pixel.
    pub cd: Matrix2<f64>,
    cd_inv: Matrix2<f64>,
    basis: TangentBasis,
}

impl TanWcs {
    /// Build a projection. Returns `None` when the CD matrix is singular.
    pub fn new(crval_deg: [f64; 2], crpix: [f64; 2], cd: Matrix2<f64>) -> Option<Self> {
        let cd_inv = cd.try_inverse()?;
        Some(Self {
            crval_deg,
            crpix,
            cd,
            cd_inv,
            basis: TangentBasis::at(crval_deg[0], crval_deg[1]),
        })
    }

    /// North-up, east-left projection with square pixels of `scale_arcsec`.
    pub fn north_up(crval_deg: [f64; 2], crpix: [f64; 2], scale_arcsec: f64) -> Option<Self> {
        let s = scale_arcsec / 3600.0;
        Self::new(crval_deg, crpix, Matrix2::new(-s, 0.0, 0.0, s))
    }

    /// Mean pixel side in degrees.
    pub fn pixel_scale_deg(&self) -> f64 {
        self.cd.determinant().abs().sqrt()
    }

    /// Sky position in degrees to `(col, row)`.
    pub fn world_to_pixel(&self, ra_deg: f64, dec_deg: f64) -> Option<(f64, f64)> {
        let dir = radec_to_uvec(ra_deg.to_radians(), dec_deg.to_radians());
        let plane = self.basis.project(&dir)?.map(f64::to_degrees);
        let p = self.cd_inv * plane;
        Some((p.x + self.crpix[0], p.y + self.crpix[1]))
    }

    /// `(col, row)` to sky position in degrees, RA wrapped to `[0, 360)`.
    pub fn pixel_to_world(&self, col: f64, row: f64) -> (f64, f64) {
        let plane = (self.cd * Vector2::new(col - self.crpix[0], row - self.crpix[1])).map(f64::to_radians);
        let dir = self.basis.deproject(&plane);
        let ra = dir.y.atan2(dir.x).to_degrees().rem_euclid(360.0);
        let dec = dir.z.clamp(-1.0, 1.0).asin().to_degrees();
        (ra, dec)
    }
}
