//! Calibrated frames as seen by the search engine.
//!
//! The engine never parses FITS itself. Anything that can hand out a
//! row-major flux array, a sky level and a sky-to-pixel mapping implements
//! [`ImageSource`]. [`FrameImage`] is the in-memory implementation used by
//! the pipeline and the tests.

use crate::wcs::TanWcs;

/// Read-only access to a calibrated frame.
///
/// Implementations are shared across the search worker pool, hence `Sync`.
pub trait ImageSource: Sync {
    /// Number of pixel rows.
    fn nrows(&self) -> usize;
    /// Number of pixel columns.
    fn ncols(&self) -> usize;
    /// Row-major flux values, `nrows * ncols` long.
    fn data(&self) -> &[f32];
    /// Sky level per pixel.
    fn mean_val(&self) -> f64;
    /// Sky noise per pixel.
    fn std_val(&self) -> f64;
    /// Sky position in degrees to `(col, row)`, or `None` if it does not project.
    fn coords_to_pix(&self, ra_deg: f64, dec_deg: f64) -> Option<(f64, f64)>;

    /// Sky cone `(ra, dec, radius)` in degrees covering the frame, if known.
    /// Lets callers skip catalog objects that cannot be on it.
    fn field_of_view(&self) -> Option<(f64, f64, f64)> {
        None
    }

    /// Flux at a pixel, or `None` outside the frame.
    #[inline]
    fn pixel(&self, row: isize, col: isize) -> Option<f32> {
        if row < 0 || col < 0 {
            return None;
        }
        let (r, c) = (row as usize, col as usize);
        if r >= self.nrows() || c >= self.ncols() {
            return None;
        }
        Some(self.data()[r * self.ncols() + c])
    }
}

/// An owned frame with an optional TAN projection.
#[derive(Debug, Clone)]
pub struct FrameImage {
    nrows: usize,
    ncols: usize,
    data: Vec<f32>,
    mean: f64,
    std: f64,
    wcs: Option<TanWcs>,
}

impl FrameImage {
    /// Wrap row-major pixels, estimating the sky level from the data.
    pub fn new(data: Vec<f32>, nrows: usize, ncols: usize) -> anyhow::Result<Self> {
        anyhow::ensure!(
            data.len() == nrows * ncols,
            "Pixel data length ({}) does not match rows*cols ({}x{}={})",
            data.len(),
            nrows,
            ncols,
            nrows * ncols
        );
        let (mean, std) = estimate_sky(&data, DEFAULT_CLIP_ITERATIONS, DEFAULT_CLIP_FACTOR);
        Ok(Self {
            nrows,
            ncols,
            data,
            mean,
            std,
            wcs: None,
        })
    }

    /// Override the estimated sky statistics.
    pub fn with_sky(mut self, mean: f64, std: f64) -> Self {
        self.mean = mean;
        self.std = std;
        self
    }

    /// Attach a world coordinate system.
    pub fn with_wcs(mut self, wcs: TanWcs) -> Self {
        self.wcs = Some(wcs);
        self
    }

    pub fn wcs(&self) -> Option<&TanWcs> {
        self.wcs.as_ref()
    }

    /// `(col, row)` to sky position in degrees.
    pub fn pix_to_coords(&self, col: f64, row: f64) -> Option<(f64, f64)> {
        self.wcs.as_ref().map(|w| w.pixel_to_world(col, row))
    }

    /// Load a calibrated frame from a grayscale image file.
    ///
    /// 16-bit and float images keep their native scale; anything else goes
    /// through 8-bit luma.
    #[cfg(feature = "image")]
    pub fn open(path: impl AsRef<std::path::Path>) -> anyhow::Result<Self> {
        use anyhow::Context;
        use image::GenericImageView;

        let img = image::open(path.as_ref())
            .with_context(|| format!("Failed to open frame: {}", path.as_ref().display()))?;
        let (width, height) = img.dimensions();
        let data = to_grayscale_f32(&img);
        Self::new(data, height as usize, width as usize)
    }
}

impl ImageSource for FrameImage {
    fn nrows(&self) -> usize {
        self.nrows
    }

    fn ncols(&self) -> usize {
        self.ncols
    }

    fn data(&self) -> &[f32] {
        &self.data
    }

    fn mean_val(&self) -> f64 {
        self.mean
    }

    fn std_val(&self) -> f64 {
        self.std
    }

    fn coords_to_pix(&self, ra_deg: f64, dec_deg: f64) -> Option<(f64, f64)> {
        self.wcs.as_ref()?.world_to_pixel(ra_deg, dec_deg)
    }

    fn field_of_view(&self) -> Option<(f64, f64, f64)> {
        let wcs = self.wcs.as_ref()?;
        let (ra, dec) = wcs.pixel_to_world((self.ncols as f64 - 1.0) / 2.0, (self.nrows as f64 - 1.0) / 2.0);
        let half_diagonal = 0.5 * (self.nrows as f64).hypot(self.ncols as f64);
        Some((ra, dec, half_diagonal * wcs.pixel_scale_deg()))
    }
}

const DEFAULT_CLIP_ITERATIONS: usize = 5;
const DEFAULT_CLIP_FACTOR: f64 = 3.0;

/// Estimate sky level and noise.
///
/// The median is the level. Noise comes from the pixels at or below the
/// median, sigma-clipped, since sources only bias the distribution upward.
pub fn estimate_sky(pixels: &[f32], clip_iterations: usize, clip_factor: f64) -> (f64, f64) {
    let mut values: Vec<f64> = pixels
        .iter()
        .copied()
        .filter(|v| v.is_finite())
        .map(f64::from)
        .collect();
    if values.is_empty() {
        return (0.0, 0.0);
    }

    values.sort_unstable_by(f64::total_cmp);
    let n = values.len();
    let median = if n % 2 == 0 {
        (values[n / 2 - 1] + values[n / 2]) / 2.0
    } else {
        values[n / 2]
    };

    let mut low_half: Vec<f64> = values.into_iter().filter(|&v| v <= median).collect();

    let mut sigma = 0.0;
    for _ in 0..clip_iterations {
        if low_half.is_empty() {
            break;
        }
        let mean_low = low_half.iter().sum::<f64>() / low_half.len() as f64;
        // Mirror the lower half about the median to recover a full-width sigma.
        let var = low_half.iter().map(|&v| (v - median).powi(2)).sum::<f64>()
            / low_half.len() as f64;
        sigma = var.sqrt();
        if sigma < 1e-10 {
            break;
        }
        let lo = mean_low - clip_factor * sigma;
        let before = low_half.len();
        low_half.retain(|&v| v >= lo);
        if low_half.len() == before {
            break;
        }
    }

    (median, sigma)
}

#[cfg(feature = "image")]
fn to_grayscale_f32(img: &image::DynamicImage) -> Vec<f32> {
    use image::DynamicImage;
    match img {
        DynamicImage::ImageLuma16(g) => g.as_raw().iter().map(|&v| v as f32).collect(),
        DynamicImage::ImageLumaA16(g) => g.pixels().map(|p| p.0[0] as f32).collect(),
        DynamicImage::ImageRgb32F(rgb) => rgb
            .pixels()
            .map(|p| {
                let [r, g, b] = p.0;
                0.2126 * r + 0.7152 * g + 0.0722 * b
            })
            .collect(),
        _ => img.to_luma8().as_raw().iter().map(|&v| v as f32).collect(),
    }
}
