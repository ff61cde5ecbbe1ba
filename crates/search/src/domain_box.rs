//! Axis-aligned boxes used for domain ownership and ghost overlap tests.

use crate::particle::Particle;

/// Stand-in for an unbounded extent on open axes.
pub const BIG_NUMBER: f32 = 1.0e20;

/// Axis-aligned box in `D` dimensions.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DomainBox<const D: usize> {
    /// Lower corner
    pub boxmin: [f32; D],
    /// Upper corner
    pub boxmax: [f32; D],
}

impl<const D: usize> DomainBox<D> {
    /// Create a box from its corners.
    pub fn new(boxmin: [f32; D], boxmax: [f32; D]) -> Self {
        Self { boxmin, boxmax }
    }

    /// Box covering all of space (up to `BIG_NUMBER`).
    pub fn unbounded() -> Self {
        Self {
            boxmin: [-BIG_NUMBER; D],
            boxmax: [BIG_NUMBER; D],
        }
    }

    /// Inverted box that contains and overlaps nothing; the identity of
    /// [`DomainBox::enclose`].
    pub fn empty() -> Self {
        Self {
            boxmin: [f32::MAX; D],
            boxmax: [f32::MIN; D],
        }
    }

    /// Grow this box to cover `other` as well.
    pub fn enclose(&mut self, other: &Self) {
        for k in 0..D {
            self.boxmin[k] = self.boxmin[k].min(other.boxmin[k]);
            self.boxmax[k] = self.boxmax[k].max(other.boxmax[k]);
        }
    }

    /// Width along axis `k`.
    pub fn extent(&self, k: usize) -> f32 {
        self.boxmax[k] - self.boxmin[k]
    }

    /// `true` if any axis has zero or negative width.
    pub fn is_degenerate(&self) -> bool {
        (0..D).any(|k| self.extent(k) <= 0.0)
    }

    /// Half-open ownership test: `boxmin <= r < boxmax` on every axis.
    ///
    /// Two boxes sharing a face never both contain a point.
    #[inline]
    pub fn contains(&self, r: &[f32; D]) -> bool {
        (0..D).all(|k| r[k] >= self.boxmin[k] && r[k] < self.boxmax[k])
    }

    /// Closed test: does the cube `r ± radius` touch this box?
    #[inline]
    pub fn overlaps_sphere(&self, r: &[f32; D], radius: f32) -> bool {
        (0..D).all(|k| r[k] + radius >= self.boxmin[k] && r[k] - radius <= self.boxmax[k])
    }

    /// Closed box-box overlap test.
    pub fn overlaps(&self, other: &Self) -> bool {
        (0..D).all(|k| self.boxmax[k] >= other.boxmin[k] && self.boxmin[k] <= other.boxmax[k])
    }

    /// Copy grown by `margin` on every side.
    pub fn expanded(&self, margin: f32) -> Self {
        Self {
            boxmin: self.boxmin.map(|x| x - margin),
            boxmax: self.boxmax.map(|x| x + margin),
        }
    }
}

/// Does the particle's position lie inside `domain`?
#[inline]
pub fn particle_in_box<const D: usize>(particle: &Particle<D>, domain: &DomainBox<D>) -> bool {
    domain.contains(&particle.r)
}

/// Does the particle's interaction envelope (`r ± hrange`) touch `region`?
#[inline]
pub fn particle_box_overlap<const D: usize>(
    particle: &Particle<D>,
    region: &DomainBox<D>,
    hrange: f32,
) -> bool {
    region.overlaps_sphere(&particle.r, hrange)
}
