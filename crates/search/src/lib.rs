//! SPH Neighbour Search
//!
//! This crate decides which particle pairs interact and hands them to
//! injected physics delegates. It does not implement any force law.
//!
//! # Modules
//! - [`particle`] -- SPH particles, point-mass bodies and the real+ghost buffer.
//! - [`brute_force`] -- O(N^2) reference implementation of [`NeighbourSearch`].
//! - [`physics`] -- delegate traits for property solvers and force kernels.
//! - [`kernel`] -- smoothing kernel extent and self-potential.
//! - [`domain_box`] -- ownership and overlap tests against domain boxes.
//! - [`exchange`] -- ghost-export and transfer selection for the distributed layer.

#![warn(missing_docs)]

pub mod brute_force;
pub mod domain_box;
pub mod error;
pub mod exchange;
pub mod kernel;
pub mod particle;
pub mod physics;
pub mod scratch;

pub use brute_force::BruteForceSearch;
pub use domain_box::{DomainBox, BIG_NUMBER};
pub use error::SearchError;
pub use exchange::{interaction_box, ExportPlan, TransferPlan};
pub use kernel::{M4Kernel, SmoothingKernel};
pub use particle::{Particle, ParticleBuffer, ParticleType, StarParticle};
pub use physics::{NbodyPhysics, PairGeometry, PropertyCandidates, SphPhysics};

use serde::{Deserialize, Serialize};
use std::sync::Arc;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Available neighbour search implementations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SearchBackend {
    /// Direct summation over all particles
    BruteForce,
    /// Hierarchical tree search (provided by a separate crate)
    Tree,
}

/// Neighbour search settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    /// Which implementation to build
    #[serde(default = "default_backend")]
    pub backend: SearchBackend,
    /// Multiplier on the kernel extent used by the range tests
    #[serde(default = "default_kern_fac")]
    pub kern_fac: f32,
    /// Compact dead particles out of the buffer in `build_tree`
    #[serde(default)]
    pub purge_dead_on_build: bool,
}

fn default_backend() -> SearchBackend {
    SearchBackend::BruteForce
}

fn default_kern_fac() -> f32 {
    1.0
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            kern_fac: default_kern_fac(),
            purge_dead_on_build: false,
        }
    }
}

// ---------------------------------------------------------------------------
// NeighbourSearch trait
// ---------------------------------------------------------------------------

/// Arguments of the structural build step. Tree searches use them to decide
/// between a full rebuild and a restock; brute force ignores them.
#[derive(Debug, Clone, Copy, Default)]
pub struct TreeBuildRequest {
    /// Force a full rebuild
    pub rebuild: bool,
    /// Current integer time
    pub step: u64,
    /// Full rebuild cadence
    pub build_every: u64,
    /// Restock cadence
    pub stock_every: u64,
    /// Smallest physical timestep
    pub timestep: f32,
}

/// Outcome of the smoothing-length stage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PropertiesReport {
    /// Number of particles handed to the solver
    pub processed: usize,
    /// Particles for which the solver reported failure, ascending
    pub invalid: Vec<usize>,
}

/// Contract shared by every neighbour search backend.
///
/// Each stage consumes the whole local buffer and mutates active, live
/// particles only. Stages that end a particle's work for the step clear
/// its `active` flag.
pub trait NeighbourSearch<const D: usize>: Send {
    /// Build (or restock) the search structure. Must precede the property
    /// and force stages.
    fn build_tree(
        &mut self,
        request: &TreeBuildRequest,
        particles: &mut ParticleBuffer<D>,
    ) -> Result<(), SearchError>;

    /// Refresh per-cell active counters.
    fn update_active_particle_counters(&mut self, particles: &ParticleBuffer<D>);

    /// Smoothing lengths and gather properties for all active particles.
    fn update_all_sph_properties(
        &mut self,
        particles: &mut ParticleBuffer<D>,
        physics: &dyn SphPhysics<D>,
        stars: &[StarParticle<D>],
    ) -> Result<PropertiesReport, SearchError>;

    /// Hydro forces using the gather-or-scatter range test.
    fn update_all_sph_hydro_forces(
        &mut self,
        particles: &mut ParticleBuffer<D>,
        physics: &dyn SphPhysics<D>,
        stars: &[StarParticle<D>],
    ) -> Result<usize, SearchError>;

    /// Combined hydro and self-gravity forces.
    fn update_all_sph_forces(
        &mut self,
        particles: &mut ParticleBuffer<D>,
        physics: &dyn SphPhysics<D>,
        stars: &[StarParticle<D>],
    ) -> Result<usize, SearchError>;

    /// Self-gravity forces.
    fn update_all_sph_grav_forces(
        &mut self,
        particles: &mut ParticleBuffer<D>,
        physics: &dyn SphPhysics<D>,
        stars: &[StarParticle<D>],
    ) -> Result<usize, SearchError>;

    /// Gradients for the Godunov scheme.
    fn update_all_sph_derivatives(
        &mut self,
        particles: &mut ParticleBuffer<D>,
        physics: &dyn SphPhysics<D>,
    ) -> Result<usize, SearchError>;

    /// Compressional heating rates with symmetric pair contributions.
    fn update_all_sph_dudt(
        &mut self,
        particles: &mut ParticleBuffer<D>,
        physics: &dyn SphPhysics<D>,
    ) -> Result<usize, SearchError>;

    /// Gas forces on the active point-mass bodies.
    fn update_all_star_gas_forces(
        &mut self,
        particles: &ParticleBuffer<D>,
        stars: &mut [StarParticle<D>],
        nbody: &dyn NbodyPhysics<D>,
    ) -> Result<usize, SearchError>;

    /// Bounding box of the interaction envelopes of the live real particles.
    /// Peers export ghosts against it.
    fn interaction_box(&self, particles: &ParticleBuffer<D>) -> DomainBox<D> {
        exchange::interaction_box(particles.real(), self.hrange_factor())
    }

    /// Ghost copies to send to each overlapping process, selected against
    /// the processes' interaction boxes.
    fn find_ghost_particles_to_export(
        &self,
        particles: &ParticleBuffer<D>,
        overlapping_nodes: &[usize],
        regions: &[DomainBox<D>],
    ) -> ExportPlan;

    /// Particles now owned by another process.
    fn find_particles_to_transfer(
        &self,
        particles: &ParticleBuffer<D>,
        potential_nodes: &[usize],
        domains: &[DomainBox<D>],
    ) -> TransferPlan;

    /// Kernel extent factor (`kern_fac * kern_range`); a particle interacts
    /// out to this multiple of its smoothing length.
    fn hrange_factor(&self) -> f32;
}

/// Build the search backend selected by `config`.
pub fn create_search<const D: usize>(
    config: &SearchConfig,
    kernel: Arc<dyn SmoothingKernel>,
) -> Result<Box<dyn NeighbourSearch<D>>, SearchError> {
    match config.backend {
        SearchBackend::BruteForce => {
            tracing::info!("Creating brute-force neighbour search ({}D)", D);
            Ok(Box::new(BruteForceSearch::new(config, kernel)))
        }
        SearchBackend::Tree => Err(SearchError::UnsupportedBackend(SearchBackend::Tree)),
    }
}
