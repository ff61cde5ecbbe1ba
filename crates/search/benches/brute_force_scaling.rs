//! Brute-force scaling benchmark.
//!
//! Times the properties and hydro stages for growing particle counts. The
//! physics delegate does no work, so the numbers are pure search cost.
//!
//! Run with: cargo bench -p search --bench brute_force_scaling

use std::sync::Arc;
use std::time::Instant;

use search::{
    create_search, M4Kernel, PairGeometry, Particle, ParticleBuffer, PropertyCandidates,
    SearchConfig, SphPhysics, StarParticle,
};

struct NullPhysics;

impl SphPhysics<3> for NullPhysics {
    fn compute_h(
        &self,
        _i: usize,
        _max_range: f32,
        candidates: &PropertyCandidates<'_>,
        particle: &mut Particle<3>,
        _stars: &[StarParticle<3>],
    ) -> bool {
        particle.rho = candidates.len() as f32;
        true
    }

    fn compute_hydro_forces(
        &self,
        _i: usize,
        pairs: &PairGeometry<'_, 3>,
        particle: &mut Particle<3>,
        _neighbours: &[Particle<3>],
    ) {
        particle.levelneib = pairs.len() as i32;
    }

    fn compute_grav_forces(&self, _: usize, _: &[usize], _: &mut Particle<3>, _: &[Particle<3>]) {}

    fn compute_hydro_grav_forces(
        &self,
        _: usize,
        _: &[usize],
        _: &mut Particle<3>,
        _: &[Particle<3>],
    ) {
    }

    fn compute_derivatives(
        &self,
        _: usize,
        _: &PairGeometry<'_, 3>,
        _: &mut Particle<3>,
        _: &[Particle<3>],
    ) {
    }

    fn compute_neib_dudt(
        &self,
        _: usize,
        _: &PairGeometry<'_, 3>,
        _: &mut Particle<3>,
        _: &mut [Particle<3>],
    ) {
    }

    fn compute_star_grav_forces(&self, _: &[StarParticle<3>], _: &mut Particle<3>) {}
}

/// Particle lattice in the unit cube with roughly `target_count` particles.
fn create_particle_cube(target_count: usize) -> ParticleBuffer<3> {
    let n_per_axis = (target_count as f32).cbrt().ceil() as usize;
    let spacing = 1.0 / n_per_axis as f32;
    let h = 1.2 * spacing;
    let mass = 1.0 / (n_per_axis * n_per_axis * n_per_axis) as f32;

    let mut particles = Vec::with_capacity(n_per_axis.pow(3));
    for ix in 0..n_per_axis {
        for iy in 0..n_per_axis {
            for iz in 0..n_per_axis {
                let r = [
                    (ix as f32 + 0.5) * spacing,
                    (iy as f32 + 0.5) * spacing,
                    (iz as f32 + 0.5) * spacing,
                ];
                particles.push(Particle::new(r, mass, h));
            }
        }
    }
    ParticleBuffer::from_particles(particles)
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    println!("=== Brute-force Scaling ===\n");
    println!(
        "{:>10} {:>14} {:>14} {:>14}",
        "Particles", "props (ms)", "hydro (ms)", "pairs/s"
    );

    let mut search = match create_search::<3>(&SearchConfig::default(), Arc::new(M4Kernel)) {
        Ok(search) => search,
        Err(e) => {
            eprintln!("failed to create search: {e}");
            return;
        }
    };

    for &n in &[512, 1_000, 4_096, 8_000] {
        let mut buffer = create_particle_cube(n);
        let actual_n = buffer.len();

        let start = Instant::now();
        if let Err(e) = search.update_all_sph_properties(&mut buffer, &NullPhysics, &[]) {
            eprintln!("properties stage failed at N={actual_n}: {e}");
            return;
        }
        let props_ms = start.elapsed().as_secs_f64() * 1e3;

        let start = Instant::now();
        if let Err(e) = search.update_all_sph_hydro_forces(&mut buffer, &NullPhysics, &[]) {
            eprintln!("hydro stage failed at N={actual_n}: {e}");
            return;
        }
        let hydro_s = start.elapsed().as_secs_f64();

        let pairs_per_sec = (actual_n * actual_n) as f64 / hydro_s;
        println!(
            "{:>10} {:>14.2} {:>14.2} {:>14.3e}",
            actual_n,
            props_ms,
            hydro_s * 1e3,
            pairs_per_sec
        );
    }
}
