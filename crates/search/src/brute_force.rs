//! Brute-force neighbour search.
//!
//! Every stage scans the whole local buffer for every active particle, so
//! the cost is O(N^2). This is the reference implementation that tree
//! searches are validated against, and the fastest option for small N.

use std::sync::Arc;

use rayon::prelude::*;

use crate::domain_box::{DomainBox, BIG_NUMBER};
use crate::error::SearchError;
use crate::exchange::{self, ExportPlan, TransferPlan};
use crate::kernel::SmoothingKernel;
use crate::particle::{Particle, ParticleBuffer, StarParticle};
use crate::physics::{NbodyPhysics, PropertyCandidates, SphPhysics};
use crate::scratch::{reserve, NeighbourScratch};
use crate::{NeighbourSearch, PropertiesReport, SearchConfig, TreeBuildRequest};

/// Direct-summation implementation of [`NeighbourSearch`].
pub struct BruteForceSearch<const D: usize> {
    kernel: Arc<dyn SmoothingKernel>,
    kern_fac: f32,
    purge_dead_on_build: bool,
    scratch: NeighbourScratch<D>,
}

/// Which gravity delegate a direct-summation gravity stage calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GravityStage {
    HydroGrav,
    Grav,
}

impl<const D: usize> BruteForceSearch<D> {
    /// Create a brute-force search using `kernel` for range and self-potential.
    pub fn new(config: &SearchConfig, kernel: Arc<dyn SmoothingKernel>) -> Self {
        Self {
            kernel,
            kern_fac: config.kern_fac,
            purge_dead_on_build: config.purge_dead_on_build,
            scratch: NeighbourScratch::new(),
        }
    }

    /// Shared body of the two direct-summation gravity stages.
    fn update_gravity_stage(
        &mut self,
        particles: &mut ParticleBuffer<D>,
        physics: &dyn SphPhysics<D>,
        stars: &[StarParticle<D>],
        stage: GravityStage,
    ) -> Result<usize, SearchError> {
        let nreal = particles.real_count();
        self.scratch.prepare(nreal)?;
        let wpot0 = self.kernel.wpot(0.0);
        let mut processed = 0;

        for i in 0..nreal {
            let mut subject = particles.all()[i];
            if !subject.active || !subject.is_live() {
                continue;
            }

            subject.zero_accumulators();

            // Self-contribution to the gravitational potential
            subject.gpot += subject.m * subject.invh * wpot0;

            // Every other live real particle; pair symmetry is left to the kernel
            self.scratch.clear();
            for (j, pj) in particles.real().iter().enumerate() {
                if j != i && pj.is_live() {
                    self.scratch.push_index(j);
                }
            }

            match stage {
                GravityStage::HydroGrav => physics.compute_hydro_grav_forces(
                    i,
                    self.scratch.neiblist(),
                    &mut subject,
                    particles.all(),
                ),
                GravityStage::Grav => physics.compute_grav_forces(
                    i,
                    self.scratch.neiblist(),
                    &mut subject,
                    particles.all(),
                ),
            }
            physics.compute_star_grav_forces(stars, &mut subject);

            for k in 0..D {
                subject.a[k] += subject.agrav[k];
            }
            subject.active = false;
            particles.all_mut()[i] = subject;
            processed += 1;
        }

        tracing::debug!("{:?} gravity stage: {} particles", stage, processed);
        Ok(processed)
    }
}

impl<const D: usize> NeighbourSearch<D> for BruteForceSearch<D> {
    fn build_tree(
        &mut self,
        _request: &TreeBuildRequest,
        particles: &mut ParticleBuffer<D>,
    ) -> Result<(), SearchError> {
        // No tree to build; this is only the point where dead particles may go.
        if self.purge_dead_on_build {
            let purged = particles.delete_dead_particles();
            if purged > 0 {
                tracing::debug!("Purged {} dead particles, {} live remain", purged, particles.live_count());
            }
        }
        tracing::trace!(
            "Brute-force search over {} real and {} ghost particles",
            particles.real_count(),
            particles.ghost_count()
        );
        Ok(())
    }

    fn update_active_particle_counters(&mut self, _particles: &ParticleBuffer<D>) {}

    fn update_all_sph_properties(
        &mut self,
        particles: &mut ParticleBuffer<D>,
        physics: &dyn SphPhysics<D>,
        stars: &[StarParticle<D>],
    ) -> Result<PropertiesReport, SearchError> {
        let ntot = particles.len();
        let _span = tracing::info_span!("update_all_sph_properties", ntot).entered();

        // Gather pool: every live particle, real and ghost
        let mut indices = Vec::new();
        let mut mass = Vec::new();
        let mut mass_energy = Vec::new();
        let mut gpot = Vec::new();
        let mut positions: Vec<[f32; D]> = Vec::new();
        reserve(&mut indices, ntot, "candidate index")?;
        reserve(&mut mass, ntot, "candidate mass")?;
        reserve(&mut mass_energy, ntot, "candidate mass-energy")?;
        reserve(&mut gpot, ntot, "candidate potential")?;
        reserve(&mut positions, ntot, "candidate position")?;

        for (j, p) in particles.all().iter().enumerate() {
            if !p.is_live() {
                continue;
            }
            indices.push(j);
            mass.push(p.m);
            mass_energy.push(p.m * p.u);
            gpot.push(p.gpot);
            positions.push(p.r);
        }
        let nneib = indices.len();

        // Each task owns its particle slot and a private distance array.
        let outcomes = particles
            .real_mut()
            .par_iter_mut()
            .enumerate()
            .filter(|(_, p)| p.active && p.is_live())
            .map_init(Vec::<f32>::new, |drsqd, (i, particle)| -> Result<Option<usize>, SearchError> {
                drsqd.clear();
                reserve(drsqd, nneib, "squared distance")?;
                let rp = particle.r;
                drsqd.extend(positions.iter().map(|rj| {
                    let dr = relative(&rp, rj);
                    dot(&dr, &dr)
                }));

                let candidates = PropertyCandidates {
                    indices: &indices,
                    mass: &mass,
                    mass_energy: &mass_energy,
                    gpot: &gpot,
                    drsqd: drsqd.as_slice(),
                };
                let ok = physics.compute_h(i, BIG_NUMBER, &candidates, particle, stars);
                Ok((!ok).then_some(i))
            })
            .collect::<Result<Vec<Option<usize>>, SearchError>>()?;

        let processed = outcomes.len();
        let mut invalid: Vec<usize> = outcomes.into_iter().flatten().collect();
        invalid.sort_unstable();

        if !invalid.is_empty() {
            tracing::warn!(
                "Smoothing length solver failed for {} of {} particles",
                invalid.len(),
                processed
            );
        }
        tracing::debug!("Properties computed for {} particles ({} candidates)", processed, nneib);

        Ok(PropertiesReport { processed, invalid })
    }

    fn update_all_sph_hydro_forces(
        &mut self,
        particles: &mut ParticleBuffer<D>,
        physics: &dyn SphPhysics<D>,
        stars: &[StarParticle<D>],
    ) -> Result<usize, SearchError> {
        let nreal = particles.real_count();
        self.scratch.prepare(particles.len())?;
        let hrange_factor = self.hrange_factor();
        let mut processed = 0;

        for i in 0..nreal {
            let mut subject = particles.all()[i];
            if !subject.active || !subject.is_live() {
                continue;
            }

            subject.zero_accumulators();

            // Gather (own range) or scatter (neighbour's range)
            let hrangesqdi = (hrange_factor * subject.h).powi(2);
            collect_pairs(&mut self.scratch, i, &subject, particles.all(), |_, pj, drsqd| {
                let hrangesqdj = (hrange_factor * pj.h).powi(2);
                drsqd < hrangesqdi || drsqd < hrangesqdj
            });

            physics.compute_hydro_forces(i, &self.scratch.pairs(), &mut subject, particles.all());
            physics.compute_star_grav_forces(stars, &mut subject);

            subject.active = false;
            particles.all_mut()[i] = subject;
            processed += 1;
        }

        tracing::debug!("Hydro forces computed for {} particles", processed);
        Ok(processed)
    }

    fn update_all_sph_forces(
        &mut self,
        particles: &mut ParticleBuffer<D>,
        physics: &dyn SphPhysics<D>,
        stars: &[StarParticle<D>],
    ) -> Result<usize, SearchError> {
        self.update_gravity_stage(particles, physics, stars, GravityStage::HydroGrav)
    }

    fn update_all_sph_grav_forces(
        &mut self,
        particles: &mut ParticleBuffer<D>,
        physics: &dyn SphPhysics<D>,
        stars: &[StarParticle<D>],
    ) -> Result<usize, SearchError> {
        self.update_gravity_stage(particles, physics, stars, GravityStage::Grav)
    }

    fn update_all_sph_derivatives(
        &mut self,
        particles: &mut ParticleBuffer<D>,
        physics: &dyn SphPhysics<D>,
    ) -> Result<usize, SearchError> {
        let nreal = particles.real_count();
        let neibpart = snapshot(particles.all())?;
        self.scratch.prepare(neibpart.len())?;
        let kern_range = self.kernel.kern_range();
        let mut processed = 0;

        for i in 0..nreal {
            let mut subject = particles.all()[i];
            if !subject.active || !subject.is_live() {
                continue;
            }

            let hrangesqd = (kern_range * subject.h).powi(2);
            collect_pairs(&mut self.scratch, i, &subject, &neibpart, |_, _, drsqd| {
                drsqd < hrangesqd
            });

            physics.compute_derivatives(i, &self.scratch.pairs(), &mut subject, &neibpart);
            particles.all_mut()[i] = subject;
            processed += 1;
        }

        Ok(processed)
    }

    fn update_all_sph_dudt(
        &mut self,
        particles: &mut ParticleBuffer<D>,
        physics: &dyn SphPhysics<D>,
    ) -> Result<usize, SearchError> {
        let nreal = particles.real_count();
        let hrange_factor = self.hrange_factor();

        // Neighbour-side contributions land here first and are merged at the end.
        let mut neibpart = snapshot(particles.all())?;
        for neib in &mut neibpart {
            neib.dudt = 0.0;
        }
        self.scratch.prepare(neibpart.len())?;
        let mut processed = 0;

        for i in 0..nreal {
            let mut subject = particles.all()[i];
            if !subject.active || !subject.is_live() {
                continue;
            }

            // Each pair once: later particles always, earlier ones only when
            // they are inactive (they never visited this particle).
            let hrangesqdi = (hrange_factor * subject.h).powi(2);
            collect_pairs(&mut self.scratch, i, &subject, particles.all(), |j, pj, drsqd| {
                let hrangesqdj = (hrange_factor * pj.h).powi(2);
                (drsqd < hrangesqdi || drsqd < hrangesqdj) && (j > i || !pj.active)
            });

            physics.compute_neib_dudt(i, &self.scratch.pairs(), &mut subject, &mut neibpart);
            particles.all_mut()[i] = subject;
            processed += 1;
        }

        // Fold neighbour contributions into active real particles only
        for (j, neib) in neibpart.iter().enumerate().take(nreal) {
            if neib.active {
                particles.all_mut()[j].dudt += neib.dudt;
            }
        }

        Ok(processed)
    }

    fn update_all_star_gas_forces(
        &mut self,
        particles: &ParticleBuffer<D>,
        stars: &mut [StarParticle<D>],
        nbody: &dyn NbodyPhysics<D>,
    ) -> Result<usize, SearchError> {
        self.scratch.prepare(particles.real_count())?;
        for (j, p) in particles.real().iter().enumerate() {
            if p.is_live() {
                self.scratch.push_index(j);
            }
        }

        let mut processed = 0;
        for star in stars.iter_mut().filter(|s| s.active) {
            nbody.calculate_direct_sph_forces(star, self.scratch.neiblist(), particles.all());
            processed += 1;
        }
        Ok(processed)
    }

    fn find_ghost_particles_to_export(
        &self,
        particles: &ParticleBuffer<D>,
        overlapping_nodes: &[usize],
        regions: &[DomainBox<D>],
    ) -> ExportPlan {
        exchange::find_ghost_particles_to_export(
            particles.real(),
            self.hrange_factor(),
            overlapping_nodes,
            regions,
        )
    }

    fn find_particles_to_transfer(
        &self,
        particles: &ParticleBuffer<D>,
        potential_nodes: &[usize],
        domains: &[DomainBox<D>],
    ) -> TransferPlan {
        exchange::find_particles_to_transfer(particles.real(), potential_nodes, domains)
    }

    fn hrange_factor(&self) -> f32 {
        self.kern_fac * self.kernel.kern_range()
    }
}

/// Refill `scratch` with every live `j != i` accepted by `accept(j, pj, drsqd)`.
fn collect_pairs<const D: usize, F>(
    scratch: &mut NeighbourScratch<D>,
    i: usize,
    subject: &Particle<D>,
    candidates: &[Particle<D>],
    mut accept: F,
) where
    F: FnMut(usize, &Particle<D>, f32) -> bool,
{
    scratch.clear();
    for (j, pj) in candidates.iter().enumerate() {
        if j == i || !pj.is_live() {
            continue;
        }
        let draux = relative(&subject.r, &pj.r);
        let drsqd = dot(&draux, &draux);
        if accept(j, pj, drsqd) {
            scratch.push_pair(j, draux, drsqd);
        }
    }
}

/// Copy of the buffer used as a read-only (or accumulate-only) neighbour set.
fn snapshot<const D: usize>(particles: &[Particle<D>]) -> Result<Vec<Particle<D>>, SearchError> {
    let mut copy = Vec::new();
    reserve(&mut copy, particles.len(), "neighbour snapshot")?;
    copy.extend_from_slice(particles);
    Ok(copy)
}

#[inline]
fn relative<const D: usize>(from: &[f32; D], to: &[f32; D]) -> [f32; D] {
    std::array::from_fn(|k| to[k] - from[k])
}

#[inline]
fn dot<const D: usize>(a: &[f32; D], b: &[f32; D]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_and_dot() {
        let dr = relative(&[1.0, 1.0, 1.0], &[2.0, 3.0, 4.0]);
        assert_eq!(dr, [1.0, 2.0, 3.0]);
        assert_eq!(dot(&dr, &dr), 14.0);
    }

    #[test]
    fn collect_pairs_skips_self_and_dead() {
        let mut candidates: Vec<Particle<1>> =
            (0..4).map(|i| Particle::new([i as f32], 1.0, 1.0)).collect();
        candidates[2].kill();
        let mut scratch = NeighbourScratch::new();
        collect_pairs(&mut scratch, 1, &candidates[1], &candidates, |_, _, _| true);
        assert_eq!(scratch.neiblist(), &[0, 3]);
    }

    #[test]
    fn purge_on_build_is_opt_in() {
        let mut buffer = ParticleBuffer::from_particles(vec![
            Particle::new([0.0], 1.0, 1.0),
            Particle::new([1.0], 1.0, 1.0),
        ]);
        buffer.all_mut()[0].kill();

        let kernel: Arc<dyn SmoothingKernel> = Arc::new(crate::M4Kernel);
        let mut keep = BruteForceSearch::<1>::new(&SearchConfig::default(), kernel.clone());
        keep.build_tree(&TreeBuildRequest::default(), &mut buffer).unwrap();
        assert_eq!(buffer.len(), 2);

        let config = SearchConfig {
            purge_dead_on_build: true,
            ..SearchConfig::default()
        };
        let mut purge = BruteForceSearch::<1>::new(&config, kernel);
        purge.build_tree(&TreeBuildRequest::default(), &mut buffer).unwrap();
        assert_eq!(buffer.len(), 1);
        assert_eq!(buffer.real()[0].r, [1.0]);
    }
}
