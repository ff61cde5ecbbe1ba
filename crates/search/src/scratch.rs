//! Reusable scratch buffers for interaction lists.

use crate::error::SearchError;
use crate::physics::PairGeometry;

/// Regulariser added to pair distances before inversion.
pub const SMALL_NUMBER: f32 = 1.0e-20;

/// Arena of parallel neighbour arrays, reserved once per stage and refilled
/// for every subject particle.
#[derive(Debug, Default)]
pub struct NeighbourScratch<const D: usize> {
    neiblist: Vec<usize>,
    drmag: Vec<f32>,
    invdrmag: Vec<f32>,
    dr: Vec<[f32; D]>,
}

impl<const D: usize> NeighbourScratch<D> {
    /// Create empty scratch space.
    pub fn new() -> Self {
        Self {
            neiblist: Vec::new(),
            drmag: Vec::new(),
            invdrmag: Vec::new(),
            dr: Vec::new(),
        }
    }

    /// Clear and make room for `capacity` neighbours without reallocating
    /// inside the particle loop.
    pub fn prepare(&mut self, capacity: usize) -> Result<(), SearchError> {
        self.clear();
        reserve(&mut self.neiblist, capacity, "neighbour list")?;
        reserve(&mut self.drmag, capacity, "distance")?;
        reserve(&mut self.invdrmag, capacity, "inverse distance")?;
        reserve(&mut self.dr, capacity, "direction")?;
        Ok(())
    }

    /// Forget the current list, keeping the allocations.
    pub fn clear(&mut self) {
        self.neiblist.clear();
        self.drmag.clear();
        self.invdrmag.clear();
        self.dr.clear();
    }

    /// Append neighbour `j` at relative position `draux` (from the subject).
    #[inline]
    pub fn push_pair(&mut self, j: usize, draux: [f32; D], drsqd: f32) {
        let drmag = drsqd.sqrt();
        let invdrmag = 1.0 / (drmag + SMALL_NUMBER);
        self.neiblist.push(j);
        self.drmag.push(drmag);
        self.invdrmag.push(invdrmag);
        self.dr.push(draux.map(|x| x * invdrmag));
    }

    /// Append neighbour `j` without geometry (gravity lists).
    #[inline]
    pub fn push_index(&mut self, j: usize) {
        self.neiblist.push(j);
    }

    /// Indices collected so far.
    pub fn neiblist(&self) -> &[usize] {
        &self.neiblist
    }

    /// View of the collected list and geometry.
    pub fn pairs(&self) -> PairGeometry<'_, D> {
        PairGeometry {
            neiblist: &self.neiblist,
            drmag: &self.drmag,
            invdrmag: &self.invdrmag,
            dr: &self.dr,
        }
    }
}

/// Reserve room for `capacity` elements, reporting allocation failure instead
/// of aborting.
pub(crate) fn reserve<T>(
    buffer: &mut Vec<T>,
    capacity: usize,
    what: &'static str,
) -> Result<(), SearchError> {
    let additional = capacity.saturating_sub(buffer.len());
    buffer
        .try_reserve_exact(additional)
        .map_err(|_| SearchError::ScratchAllocation { what, count: capacity })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_pair_precomputes_unit_direction() {
        let mut scratch = NeighbourScratch::<2>::new();
        scratch.prepare(4).unwrap();
        scratch.push_pair(7, [3.0, 4.0], 25.0);

        let pairs = scratch.pairs();
        assert_eq!(pairs.neiblist, &[7]);
        assert!((pairs.drmag[0] - 5.0).abs() < 1e-6);
        assert!((pairs.invdrmag[0] - 0.2).abs() < 1e-6);
        assert!((pairs.dr[0][0] - 0.6).abs() < 1e-6);
        assert!((pairs.dr[0][1] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn zero_separation_is_finite() {
        let mut scratch = NeighbourScratch::<3>::new();
        scratch.push_pair(0, [0.0; 3], 0.0);
        let pairs = scratch.pairs();
        assert!(pairs.invdrmag[0].is_finite());
        assert_eq!(pairs.dr[0], [0.0; 3]);
    }

    #[test]
    fn prepare_clears_previous_list() {
        let mut scratch = NeighbourScratch::<1>::new();
        scratch.push_index(1);
        scratch.prepare(8).unwrap();
        assert!(scratch.pairs().is_empty());
    }
}
