//! Physics delegates injected into the neighbour search.
//!
//! The search decides which particles interact; the delegates decide what
//! the interaction does. Implementations live outside this crate.

use crate::particle::{Particle, StarParticle};

/// Gather pool handed to the smoothing-length solver.
///
/// All slices are parallel. The pool holds every live particle, the subject
/// included, so the solver can add the self-contribution to the density.
#[derive(Debug, Clone, Copy)]
pub struct PropertyCandidates<'a> {
    /// Buffer index of each candidate
    pub indices: &'a [usize],
    /// Candidate masses
    pub mass: &'a [f32],
    /// Candidate mass * internal energy
    pub mass_energy: &'a [f32],
    /// Candidate gravitational potentials
    pub gpot: &'a [f32],
    /// Squared distance from the subject to each candidate
    pub drsqd: &'a [f32],
}

impl PropertyCandidates<'_> {
    /// Number of candidates.
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    /// `true` if the pool is empty.
    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }
}

/// Interaction list with precomputed pair geometry.
///
/// `dr[k]` is the unit vector from the subject towards `neiblist[k]`.
#[derive(Debug, Clone, Copy)]
pub struct PairGeometry<'a, const D: usize> {
    /// Neighbour buffer indices
    pub neiblist: &'a [usize],
    /// Pair distances
    pub drmag: &'a [f32],
    /// Regularised inverse pair distances
    pub invdrmag: &'a [f32],
    /// Unit direction vectors
    pub dr: &'a [[f32; D]],
}

impl<const D: usize> PairGeometry<'_, D> {
    /// Number of neighbours.
    pub fn len(&self) -> usize {
        self.neiblist.len()
    }

    /// `true` if there are no neighbours.
    pub fn is_empty(&self) -> bool {
        self.neiblist.is_empty()
    }
}

/// SPH property and force kernels.
///
/// Every method receives a private copy of the subject (`particle`) which
/// the search writes back into the buffer after the call. `neighbours` is
/// the full local buffer (or a snapshot of it for the derivative stages).
pub trait SphPhysics<const D: usize>: Sync {
    /// Solve for the smoothing length and gather properties of particle `i`.
    /// Returns `false` if no valid smoothing length was found.
    fn compute_h(
        &self,
        i: usize,
        max_range: f32,
        candidates: &PropertyCandidates<'_>,
        particle: &mut Particle<D>,
        stars: &[StarParticle<D>],
    ) -> bool;

    /// Hydrodynamical forces between `particle` and its neighbours.
    fn compute_hydro_forces(
        &self,
        i: usize,
        pairs: &PairGeometry<'_, D>,
        particle: &mut Particle<D>,
        neighbours: &[Particle<D>],
    );

    /// Self-gravity between `particle` and the listed particles.
    fn compute_grav_forces(
        &self,
        i: usize,
        neiblist: &[usize],
        particle: &mut Particle<D>,
        neighbours: &[Particle<D>],
    );

    /// Combined hydro and self-gravity forces.
    fn compute_hydro_grav_forces(
        &self,
        i: usize,
        neiblist: &[usize],
        particle: &mut Particle<D>,
        neighbours: &[Particle<D>],
    );

    /// Gradients needed by the Godunov (Riemann solver) scheme.
    fn compute_derivatives(
        &self,
        i: usize,
        pairs: &PairGeometry<'_, D>,
        particle: &mut Particle<D>,
        neighbours: &[Particle<D>],
    );

    /// Compressional heating rate. May add to the `dudt` of the subject and
    /// of any listed neighbour in `neighbours`.
    fn compute_neib_dudt(
        &self,
        i: usize,
        pairs: &PairGeometry<'_, D>,
        particle: &mut Particle<D>,
        neighbours: &mut [Particle<D>],
    );

    /// Gravitational pull of the point-mass bodies on `particle`.
    fn compute_star_grav_forces(&self, stars: &[StarParticle<D>], particle: &mut Particle<D>);
}

/// Point-mass (N-body) side of the star/gas coupling.
pub trait NbodyPhysics<const D: usize> {
    /// Direct summation of the gas forces acting on `star`.
    fn calculate_direct_sph_forces(
        &self,
        star: &mut StarParticle<D>,
        neiblist: &[usize],
        particles: &[Particle<D>],
    );
}
