//! Catalog objects grouped by vicinity, with a spherical cell index for
//! cone queries and a batch-scoped lookup cache.
//!
//! Coordinates are assumed already corrected to the observation epoch.
//!
//! The index partitions the sphere into `3 * nside` bins in `z = sin(dec)` and
//! `4 * nside` bins in right ascension. A cone query visits only the cells the
//! cone can touch, then filters exactly with a dot-product threshold.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::f64::consts::{PI, TAU};
use std::sync::Arc;

use nalgebra::Vector3;

use crate::error::{FindError, Result};
use crate::ObjInd;

const INDEX_NSIDE: u32 = 16;

/// One object expected somewhere near the vicinity's target.
#[derive(Debug, Clone, PartialEq)]
pub struct CatalogObject {
    pub id: ObjInd,
    /// Display name, e.g. a designation.
    pub label: String,
    pub ra_deg: f64,
    pub dec_deg: f64,
    /// Preferred aperture radius in pixels, if one has been established.
    pub aperture_hint: Option<f64>,
    /// Known or suspected variable.
    pub variable: bool,
    /// Globally suppressed objects are never searched.
    pub suppressed: bool,
}

impl CatalogObject {
    pub fn new(id: ObjInd, label: impl Into<String>, ra_deg: f64, dec_deg: f64) -> Self {
        Self {
            id,
            label: label.into(),
            ra_deg,
            dec_deg,
            aperture_hint: None,
            variable: false,
            suppressed: false,
        }
    }

    pub fn with_aperture_hint(mut self, apsize: f64) -> Self {
        self.aperture_hint = Some(apsize);
        self
    }

    pub fn uvec(&self) -> Vector3<f64> {
        radec_to_uvec(self.ra_deg.to_radians(), self.dec_deg.to_radians())
    }
}

/// All catalog objects of one vicinity, the target included.
#[derive(Debug, Clone)]
pub struct ObjectCatalog {
    vicinity: String,
    target: ObjInd,
    objects: Vec<CatalogObject>,
    by_id: HashMap<ObjInd, usize>,
    index: SkyIndex,
}

impl ObjectCatalog {
    /// Build a vicinity catalog. The target must be present and ids unique.
    pub fn new(
        vicinity: impl Into<String>,
        target: ObjInd,
        objects: Vec<CatalogObject>,
    ) -> Result<Self> {
        let vicinity = vicinity.into();
        let mut by_id = HashMap::with_capacity(objects.len());
        for (idx, obj) in objects.iter().enumerate() {
            if by_id.insert(obj.id, idx).is_some() {
                return Err(FindError::Configuration(format!(
                    "duplicate object {} in vicinity `{}`",
                    obj.id, vicinity
                )));
            }
        }
        if !by_id.contains_key(&target) {
            return Err(FindError::Configuration(format!(
                "target {} not in vicinity `{}`",
                target, vicinity
            )));
        }
        let index = SkyIndex::new(INDEX_NSIDE, &objects);
        Ok(Self {
            vicinity,
            target,
            objects,
            by_id,
            index,
        })
    }

    pub fn vicinity(&self) -> &str {
        &self.vicinity
    }

    pub fn target(&self) -> &CatalogObject {
        &self.objects[self.by_id[&self.target]]
    }

    pub fn get(&self, id: ObjInd) -> Option<&CatalogObject> {
        self.by_id.get(&id).map(|&idx| &self.objects[idx])
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn objects(&self) -> &[CatalogObject] {
        &self.objects
    }

    /// Non-target objects that are not suppressed, in catalog order.
    pub fn candidates(&self) -> impl Iterator<Item = &CatalogObject> {
        self.objects
            .iter()
            .filter(move |o| o.id != self.target && !o.suppressed)
    }

    /// Mark an object as globally suppressed. The target cannot be suppressed.
    pub fn suppress(&mut self, id: ObjInd) -> bool {
        if id == self.target {
            return false;
        }
        match self.by_id.get(&id) {
            Some(&idx) => {
                self.objects[idx].suppressed = true;
                true
            }
            None => false,
        }
    }

    /// Objects within `radius_deg` of a sky position, in catalog order.
    pub fn objects_in_cone(&self, ra_deg: f64, dec_deg: f64, radius_deg: f64) -> Vec<&CatalogObject> {
        let dir = radec_to_uvec(ra_deg.to_radians(), dec_deg.to_radians());
        self.index
            .query(&self.objects, dir, radius_deg.to_radians())
            .into_iter()
            .map(|idx| &self.objects[idx])
            .collect()
    }
}

/// Source of vicinity catalogs, typically a database query.
pub trait CatalogLoader {
    fn load_vicinity(&self, vicinity: &str) -> anyhow::Result<ObjectCatalog>;
}

/// Per-batch memo of loaded vicinities.
///
/// Owned by whoever runs the batch and dropped with it, so catalog edits
/// made between batches are always seen.
pub struct CatalogCache<L> {
    loader: L,
    loaded: HashMap<String, Arc<ObjectCatalog>>,
}

impl<L: CatalogLoader> CatalogCache<L> {
    pub fn new(loader: L) -> Self {
        Self {
            loader,
            loaded: HashMap::new(),
        }
    }

    /// Fetch a vicinity, loading it on first use.
    pub fn vicinity(&mut self, name: &str) -> anyhow::Result<Arc<ObjectCatalog>> {
        match self.loaded.entry(name.to_string()) {
            Entry::Occupied(e) => Ok(Arc::clone(e.get())),
            Entry::Vacant(e) => {
                let catalog = Arc::new(self.loader.load_vicinity(name)?);
                tracing::debug!("Loaded vicinity `{}` ({} objects)", name, catalog.len());
                Ok(Arc::clone(e.insert(catalog)))
            }
        }
    }

    /// Look an object up among the vicinities loaded so far.
    pub fn object(&self, id: ObjInd) -> Option<&CatalogObject> {
        self.loaded.values().find_map(|c| c.get(id))
    }

    pub fn loaded(&self) -> usize {
        self.loaded.len()
    }
}

// ── Spherical cell index ────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct SkyIndex {
    n_lat: u32,
    n_lon: u32,
    cell_offsets: Vec<u32>,
    object_indices: Vec<u32>,
}

impl SkyIndex {
    fn new(nside: u32, objects: &[CatalogObject]) -> Self {
        let n_lat = 3 * nside;
        let n_lon = 4 * nside;
        let n_cells = (n_lat * n_lon) as usize;

        let mut bins: Vec<Vec<u32>> = vec![Vec::new(); n_cells];
        for (idx, obj) in objects.iter().enumerate() {
            let cell = cell_for_radec(n_lat, n_lon, obj.ra_deg.to_radians(), obj.dec_deg.to_radians());
            bins[cell as usize].push(idx as u32);
        }

        let mut cell_offsets = Vec::with_capacity(n_cells + 1);
        let mut object_indices = Vec::with_capacity(objects.len());
        cell_offsets.push(0);
        for bin in bins {
            object_indices.extend(bin);
            cell_offsets.push(object_indices.len() as u32);
        }

        Self {
            n_lat,
            n_lon,
            cell_offsets,
            object_indices,
        }
    }

    fn query(&self, objects: &[CatalogObject], dir: Vector3<f64>, radius_rad: f64) -> Vec<usize> {
        if objects.is_empty() {
            return Vec::new();
        }
        let radius = radius_rad.clamp(0.0, PI);
        let cos_radius = radius.cos();
        let lon_step = TAU / self.n_lon as f64;

        let dec0 = dir.z.clamp(-1.0, 1.0).asin();
        let dec_lo = dec0 - radius;
        let dec_hi = dec0 + radius;
        let z_min = dec_lo.max(-PI / 2.0).sin();
        let z_max = dec_hi.min(PI / 2.0).sin();
        let covers_pole = dec_lo <= -PI / 2.0 || dec_hi >= PI / 2.0;

        let mut phi = dir.y.atan2(dir.x);
        if phi < 0.0 {
            phi += TAU;
        }

        let mut out = Vec::new();
        let z_step = 2.0 / self.n_lat as f64;
        for lat_bin in z_to_lat_bin(self.n_lat, z_min)..=z_to_lat_bin(self.n_lat, z_max) {
            let zc = -1.0 + (lat_bin as f64 + 0.5) * z_step;
            let cos_dec = zc.clamp(-1.0, 1.0).asin().cos().abs().max(1e-6);
            let half_span = (radius / cos_dec).min(PI) + lon_step;

            if covers_pole || 2.0 * half_span >= TAU {
                for lon_bin in 0..self.n_lon {
                    self.collect(objects, lat_bin, lon_bin, dir, cos_radius, &mut out);
                }
                continue;
            }

            let start = phi_to_lon_bin(self.n_lon, (phi - half_span).rem_euclid(TAU));
            let end = phi_to_lon_bin(self.n_lon, (phi + half_span).rem_euclid(TAU));
            if start <= end {
                for lon_bin in start..=end {
                    self.collect(objects, lat_bin, lon_bin, dir, cos_radius, &mut out);
                }
            } else {
                for lon_bin in (start..self.n_lon).chain(0..=end) {
                    self.collect(objects, lat_bin, lon_bin, dir, cos_radius, &mut out);
                }
            }
        }

        out.sort_unstable();
        out.dedup();
        out
    }

    fn collect(
        &self,
        objects: &[CatalogObject],
        lat_bin: u32,
        lon_bin: u32,
        dir: Vector3<f64>,
        cos_radius: f64,
        out: &mut Vec<usize>,
    ) {
        let cell = (lat_bin * self.n_lon + lon_bin) as usize;
        let start = self.cell_offsets[cell] as usize;
        let end = self.cell_offsets[cell + 1] as usize;
        for &idx in &self.object_indices[start..end] {
            let idx = idx as usize;
            if dir.dot(&objects[idx].uvec()) >= cos_radius {
                out.push(idx);
            }
        }
    }
}

fn cell_for_radec(n_lat: u32, n_lon: u32, ra_rad: f64, dec_rad: f64) -> u32 {
    let lat_bin = z_to_lat_bin(n_lat, dec_rad.sin());
    let lon_bin = phi_to_lon_bin(n_lon, ra_rad.rem_euclid(TAU));
    lat_bin * n_lon + lon_bin
}

fn z_to_lat_bin(n_lat: u32, z: f64) -> u32 {
    let u = (z.clamp(-1.0, 1.0) + 1.0) * 0.5;
    ((u * n_lat as f64).floor() as u32).min(n_lat - 1)
}

fn phi_to_lon_bin(n_lon: u32, phi: f64) -> u32 {
    let u = (phi / TAU).clamp(0.0, 1.0);
    ((u * n_lon as f64).floor() as u32).min(n_lon - 1)
}

pub(crate) fn radec_to_uvec(ra_rad: f64, dec_rad: f64) -> Vector3<f64> {
    let (sin_ra, cos_ra) = ra_rad.sin_cos();
    let (sin_dec, cos_dec) = dec_rad.sin_cos();
    Vector3::new(cos_dec * cos_ra, cos_dec * sin_ra, sin_dec)
}
