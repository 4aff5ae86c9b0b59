//! Find results for one observation.
//!
//! A [`FindResultSet`] is created from its target result and always keeps it
//! at index 0. Candidates are appended or replaced by object id. Labels are
//! short display keys: `T` for the target, then `A`, `B`, … `Z`, `AA`, …
//! for visible candidates in set order.

use crate::error::{FindError, Result};
use crate::offset::PixelOffset;
use crate::{ObjInd, ObsInd};

/// Label of the target entry.
pub const TARGET_LABEL: &str = "T";

/// One located object.
#[derive(Debug, Clone, PartialEq)]
pub struct FindResult {
    /// Catalog object this result belongs to, if any.
    pub obj: Option<ObjInd>,
    /// Found pixel row.
    pub row: f64,
    /// Found pixel column.
    pub col: f64,
    /// Found minus predicted row.
    pub rdiff: f64,
    /// Found minus predicted column.
    pub cdiff: f64,
    /// Aperture radius in pixels.
    pub apsize: f64,
    /// Sky-subtracted flux inside the aperture.
    pub adus: f64,
    pub radeg: f64,
    pub decdeg: f64,
    pub label: String,
    pub hide: bool,
    pub istarget: bool,
}

impl FindResult {
    /// Absolute position `(row, col)` implied by a prediction and the stored offsets.
    pub fn absolute_from(&self, predicted_row: f64, predicted_col: f64) -> (f64, f64) {
        (predicted_row + self.rdiff, predicted_col + self.cdiff)
    }

    /// Distance in pixels between two result centres.
    pub fn distance_to(&self, other: &FindResult) -> f64 {
        (self.row - other.row).hypot(self.col - other.col)
    }

    fn check(&self) -> Result<()> {
        if !(self.apsize > 0.0) || !self.apsize.is_finite() {
            return Err(FindError::Configuration(format!(
                "aperture {} for object {:?} must be positive",
                self.apsize, self.obj
            )));
        }
        Ok(())
    }
}

/// Observation metadata carried by a result set.
#[derive(Debug, Clone, PartialEq)]
pub struct ObservationInfo {
    pub obsind: ObsInd,
    pub filter: String,
    pub obsdate: String,
    pub vicinity: String,
}

impl ObservationInfo {
    pub fn new(
        obsind: ObsInd,
        filter: impl Into<String>,
        obsdate: impl Into<String>,
        vicinity: impl Into<String>,
    ) -> Self {
        Self {
            obsind,
            filter: filter.into(),
            obsdate: obsdate.into(),
            vicinity: vicinity.into(),
        }
    }
}

/// Selection predicate over results.
///
/// Filters compose with [`and`](ResultFilter::and), [`or`](ResultFilter::or)
/// and [`not`](ResultFilter::not) instead of threading flags through calls.
#[derive(Debug, Clone, PartialEq)]
pub enum ResultFilter {
    All,
    Visible,
    Hidden,
    Target,
    /// Everything but the target.
    Candidates,
    /// Results linked to a catalog object.
    Linked,
    Object(ObjInd),
    And(Box<ResultFilter>, Box<ResultFilter>),
    Or(Box<ResultFilter>, Box<ResultFilter>),
    Not(Box<ResultFilter>),
}

impl ResultFilter {
    pub fn matches(&self, r: &FindResult) -> bool {
        match self {
            ResultFilter::All => true,
            ResultFilter::Visible => !r.hide,
            ResultFilter::Hidden => r.hide,
            ResultFilter::Target => r.istarget,
            ResultFilter::Candidates => !r.istarget,
            ResultFilter::Linked => r.obj.is_some(),
            ResultFilter::Object(id) => r.obj == Some(*id),
            ResultFilter::And(a, b) => a.matches(r) && b.matches(r),
            ResultFilter::Or(a, b) => a.matches(r) || b.matches(r),
            ResultFilter::Not(a) => !a.matches(r),
        }
    }

    pub fn and(self, other: ResultFilter) -> ResultFilter {
        ResultFilter::And(Box::new(self), Box::new(other))
    }

    pub fn or(self, other: ResultFilter) -> ResultFilter {
        ResultFilter::Or(Box::new(self), Box::new(other))
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(self) -> ResultFilter {
        ResultFilter::Not(Box::new(self))
    }
}

/// The ordered results of one observation.
#[derive(Debug, Clone, PartialEq)]
pub struct FindResultSet {
    info: ObservationInfo,
    pub nrows: usize,
    pub ncols: usize,
    offset: PixelOffset,
    results: Vec<FindResult>,
}

impl FindResultSet {
    /// Start a set from its target.
    ///
    /// The target's own `(rdiff, cdiff)` becomes the frame offset.
    pub fn new(info: ObservationInfo, nrows: usize, ncols: usize, mut target: FindResult) -> Result<Self> {
        target.check()?;
        target.istarget = true;
        target.hide = false;
        let offset = PixelOffset::new(target.rdiff, target.cdiff);
        let mut set = Self {
            info,
            nrows,
            ncols,
            offset,
            results: vec![target],
        };
        set.relabel();
        Ok(set)
    }

    /// Rebuild a set from stored parts without altering offsets.
    pub(crate) fn from_parts(
        info: ObservationInfo,
        nrows: usize,
        ncols: usize,
        offset: PixelOffset,
        results: Vec<FindResult>,
    ) -> Result<Self> {
        let ntargets = results.iter().filter(|r| r.istarget).count();
        if ntargets != 1 || !results.first().is_some_and(|r| r.istarget) {
            return Err(FindError::Storage(format!(
                "observation {} has {} target rows",
                info.obsind, ntargets
            )));
        }
        let mut set = Self {
            info,
            nrows,
            ncols,
            offset,
            results,
        };
        set.canonicalize();
        Ok(set)
    }

    pub fn info(&self) -> &ObservationInfo {
        &self.info
    }

    pub fn obsind(&self) -> ObsInd {
        self.info.obsind
    }

    pub fn vicinity(&self) -> &str {
        &self.info.vicinity
    }

    /// Frame offset currently applied to candidate predictions.
    pub fn offset(&self) -> PixelOffset {
        self.offset
    }

    pub(crate) fn set_offset(&mut self, offset: PixelOffset) {
        self.offset = offset;
    }

    pub fn target(&self) -> &FindResult {
        &self.results[0]
    }

    pub fn results(&self) -> &[FindResult] {
        &self.results
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn get(&self, idx: usize) -> Option<&FindResult> {
        self.results.get(idx)
    }

    pub fn iter_filtered<'a>(&'a self, filter: &'a ResultFilter) -> impl Iterator<Item = &'a FindResult> + 'a {
        self.results.iter().filter(move |r| filter.matches(r))
    }

    /// Indices of results matching `filter`, in set order.
    pub fn indices(&self, filter: &ResultFilter) -> Vec<usize> {
        self.results
            .iter()
            .enumerate()
            .filter(|(_, r)| filter.matches(r))
            .map(|(i, _)| i)
            .collect()
    }

    /// Object ids of linked results matching `filter`.
    pub fn object_ids(&self, filter: &ResultFilter) -> Vec<ObjInd> {
        self.iter_filtered(filter).filter_map(|r| r.obj).collect()
    }

    pub fn position_of(&self, obj: ObjInd) -> Option<usize> {
        self.results.iter().position(|r| r.obj == Some(obj))
    }

    /// Add a candidate, replacing any existing result for the same object.
    ///
    /// Returns the index the candidate landed at.
    pub fn insert(&mut self, mut result: FindResult) -> Result<usize> {
        result.check()?;
        if result.istarget {
            return Err(FindError::Configuration(
                "a result set holds exactly one target; use replace_target".to_string(),
            ));
        }
        if result.obj.is_some() && result.obj == self.target().obj {
            return Err(FindError::Configuration(format!(
                "object {:?} is this set's target",
                result.obj
            )));
        }
        result.label.clear();
        let idx = match result.obj.and_then(|id| self.position_of(id)) {
            Some(idx) => {
                self.results[idx] = result;
                idx
            }
            None => {
                self.results.push(result);
                self.results.len() - 1
            }
        };
        self.relabel();
        Ok(idx)
    }

    /// Swap in a new target result and return the previous one.
    ///
    /// Candidate offsets are not touched; see
    /// [`OffsetTracker::reconcile_target`](crate::OffsetTracker::reconcile_target).
    pub(crate) fn replace_target(&mut self, mut target: FindResult) -> Result<FindResult> {
        target.check()?;
        target.istarget = true;
        target.hide = false;
        target.label = TARGET_LABEL.to_string();
        Ok(std::mem::replace(&mut self.results[0], target))
    }

    /// Mutable access to candidates only, so the target can never be displaced.
    pub(crate) fn candidates_mut(&mut self) -> impl Iterator<Item = &mut FindResult> {
        self.results.iter_mut().skip(1)
    }

    /// Edit one entry in place.
    ///
    /// Target-ness cannot be changed, the target stays visible, and an edit
    /// that would give two entries the same object is rejected. Labels are
    /// derived, so the set is relabelled afterwards.
    pub fn update<F>(&mut self, idx: usize, f: F) -> Result<()>
    where
        F: FnOnce(&mut FindResult),
    {
        let Some(entry) = self.results.get(idx) else {
            return Err(FindError::Configuration(format!("no result at index {idx}")));
        };
        let mut edited = entry.clone();
        f(&mut edited);
        edited.istarget = entry.istarget;
        if edited.istarget {
            edited.hide = false;
        }
        edited.check()?;
        if let Some(id) = edited.obj {
            if let Some(other) = self.position_of(id).filter(|&other| other != idx) {
                return Err(FindError::Configuration(format!(
                    "object {id} already belongs to result {other}"
                )));
            }
        }
        self.results[idx] = edited;
        self.relabel();
        Ok(())
    }

    /// Hide or show a candidate. The target is always visible.
    pub fn set_hidden(&mut self, idx: usize, hide: bool) -> bool {
        match self.results.get_mut(idx) {
            Some(r) if !r.istarget => {
                r.hide = hide;
                self.relabel();
                true
            }
            _ => false,
        }
    }

    /// Remove candidates matching `filter`. The target is never removed.
    pub fn remove_where(&mut self, filter: &ResultFilter) -> Vec<FindResult> {
        let mut removed = Vec::new();
        let mut kept = Vec::with_capacity(self.results.len());
        for r in self.results.drain(..) {
            if !r.istarget && filter.matches(&r) {
                removed.push(r);
            } else {
                kept.push(r);
            }
        }
        self.results = kept;
        if !removed.is_empty() {
            self.relabel();
        }
        removed
    }

    /// Keep only entries whose flag in `keep` is set. The target always stays.
    pub(crate) fn retain_indices(&mut self, keep: &[bool]) {
        let mut idx = 0;
        self.results.retain(|r| {
            let k = r.istarget || keep.get(idx).copied().unwrap_or(true);
            idx += 1;
            k
        });
        self.relabel();
    }

    /// Sort candidates by object id (unlinked last, by position) and relabel.
    pub fn canonicalize(&mut self) {
        self.results[1..].sort_by(|a, b| match (a.obj, b.obj) {
            (Some(x), Some(y)) => x.cmp(&y),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => a.row.total_cmp(&b.row).then(a.col.total_cmp(&b.col)),
        });
        self.relabel();
    }

    /// Assign display labels. Hidden candidates get no label.
    pub fn relabel(&mut self) {
        let mut next = 0usize;
        for r in self.results.iter_mut() {
            if r.istarget {
                r.label = TARGET_LABEL.to_string();
            } else if r.hide {
                r.label.clear();
            } else {
                r.label = alpha_label(next);
                next += 1;
            }
        }
    }
}

/// Spreadsheet-style letters: 0 → A, 25 → Z, 26 → AA.
fn alpha_label(mut n: usize) -> String {
    let mut out = Vec::new();
    loop {
        out.push(b'A' + (n % 26) as u8);
        if n < 26 {
            break;
        }
        n = n / 26 - 1;
    }
    out.reverse();
    String::from_utf8_lossy(&out).into_owned()
}
