//! Multi-rank decomposition cycles over the in-process thread group.
//!
//! Every rank runs on its own thread with its own controller, particle
//! buffer and search, exactly as separate processes would.

use std::sync::{Arc, Mutex};
use std::thread;

use decomposition::{
    CyclePhase, DecompositionConfig, DomainController, DomainError, LocalProcessGroup,
    ProcessGroup,
};
use search::{
    create_search, M4Kernel, NeighbourSearch, PairGeometry, Particle, ParticleBuffer,
    PropertyCandidates, SphPhysics, StarParticle,
};

/// Run `body` once per rank, each on its own thread, and collect the results by rank.
fn run_ranks<T: Send>(size: usize, body: impl Fn(Box<dyn ProcessGroup>) -> T + Sync) -> Vec<T> {
    let groups = LocalProcessGroup::create(size);
    let body = &body;
    thread::scope(|s| {
        let handles: Vec<_> = groups
            .into_iter()
            .map(|group| s.spawn(move || body(Box::new(group))))
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    })
}

fn strip_config() -> DecompositionConfig {
    DecompositionConfig::new(vec![0.0, 0.0], vec![10.0, 5.0])
}

/// 100 particles along y = 2.5 at x = 0.05, 0.15, ..., 9.95, with h = 0.12.
fn particle_row() -> ParticleBuffer<2> {
    ParticleBuffer::from_particles(
        (0..100)
            .map(|i| {
                let mut p = Particle::new([0.05 + 0.1 * i as f32, 2.5], 1.0, 0.12);
                p.iorig = i;
                p
            })
            .collect(),
    )
}

fn brute_force(config: &DecompositionConfig) -> Box<dyn NeighbourSearch<2>> {
    create_search::<2>(&config.neighbour_search, Arc::new(M4Kernel)).unwrap()
}

/// Controller, search and this rank's starting particles (rank 0 holds everything).
fn start_rank(
    group: Box<dyn ProcessGroup>,
    config: &DecompositionConfig,
) -> (DomainController<2>, Box<dyn NeighbourSearch<2>>, ParticleBuffer<2>) {
    let controller = DomainController::<2>::new(group, config).unwrap();
    let particles = if controller.rank() == 0 {
        particle_row()
    } else {
        ParticleBuffer::new()
    };
    (controller, brute_force(config), particles)
}

#[test]
fn initial_tree_splits_row_between_two_ranks() {
    let config = strip_config();
    let results = run_ranks(2, |group| {
        let (mut controller, search, mut particles) = start_rank(group, &config);
        controller
            .create_load_balancing_tree(&mut particles, search.as_ref())
            .unwrap();

        let domain = *controller.own_domain().unwrap();
        let inside = particles.real().iter().all(|p| domain.contains(&p.r));
        (particles.real_count(), domain, inside, controller.phase())
    });

    assert_eq!(results[0].0, 50);
    assert_eq!(results[1].0, 50);
    assert!((results[0].1.boxmax[0] - 5.0).abs() < 1e-4);
    assert_eq!(results[0].1.boxmax[0], results[1].1.boxmin[0]);
    assert!(results.iter().all(|r| r.2));
    assert!(results.iter().all(|r| r.3 == CyclePhase::Balanced));
}

#[test]
fn transfer_then_ghost_exchange() {
    let config = strip_config();
    let results = run_ranks(2, |group| {
        let (mut controller, search, mut particles) = start_rank(group, &config);
        controller
            .create_load_balancing_tree(&mut particles, search.as_ref())
            .unwrap();

        // Rank 0 pushes its right-most particle just past the shared face.
        if controller.rank() == 0 {
            let last = particles
                .real_mut()
                .iter_mut()
                .max_by(|a, b| a.r[0].total_cmp(&b.r[0]))
                .unwrap();
            last.r[0] = 5.1;
        }

        let summary = controller
            .transfer_particles_to_node(&mut particles, search.as_ref())
            .unwrap();
        let ghosts = controller
            .update_ghost_particles(&mut particles, search.as_ref())
            .unwrap();

        let mut ghost_x: Vec<f32> = particles.ghosts().iter().map(|p| p.r[0]).collect();
        ghost_x.sort_by(f32::total_cmp);
        (summary, particles.real_count(), ghosts, ghost_x)
    });

    let (summary0, real0, ghosts0, ghost_x0) = &results[0];
    let (summary1, real1, ghosts1, ghost_x1) = &results[1];

    assert_eq!((summary0.sent, summary0.received), (1, 0));
    assert_eq!((summary1.sent, summary1.received), (0, 1));
    assert_eq!((*real0, *real1), (49, 51));

    // hrange = 2 * 0.12. Rank 0's particles reach x = 5.09 and rank 1's
    // reach back to x = 4.81; ghosts are the particles whose own envelope
    // touches the other side's reach.
    assert_eq!(*ghosts0, 4);
    assert_eq!(*ghosts1, 3);
    assert!((ghost_x0[0] - 5.05).abs() < 1e-4);
    assert!((ghost_x0[3] - 5.25).abs() < 1e-4);
    assert!((ghost_x1[0] - 4.65).abs() < 1e-4);
}

/// Records the neighbour positions each hydro subject is given.
#[derive(Default)]
struct HydroNeighbours {
    seen: Mutex<Vec<(f32, Vec<f32>)>>,
}

impl SphPhysics<2> for HydroNeighbours {
    fn compute_h(
        &self,
        _i: usize,
        _max_range: f32,
        _candidates: &PropertyCandidates<'_>,
        _particle: &mut Particle<2>,
        _stars: &[StarParticle<2>],
    ) -> bool {
        true
    }

    fn compute_hydro_forces(
        &self,
        _i: usize,
        pairs: &PairGeometry<'_, 2>,
        particle: &mut Particle<2>,
        neighbours: &[Particle<2>],
    ) {
        let mut xs: Vec<f32> = pairs.neiblist.iter().map(|&j| neighbours[j].r[0]).collect();
        xs.sort_by(f32::total_cmp);
        self.seen.lock().unwrap().push((particle.r[0], xs));
    }

    fn compute_grav_forces(&self, _: usize, _: &[usize], _: &mut Particle<2>, _: &[Particle<2>]) {}

    fn compute_hydro_grav_forces(&self, _: usize, _: &[usize], _: &mut Particle<2>, _: &[Particle<2>]) {}

    fn compute_derivatives(&self, _: usize, _: &PairGeometry<'_, 2>, _: &mut Particle<2>, _: &[Particle<2>]) {}

    fn compute_neib_dudt(&self, _: usize, _: &PairGeometry<'_, 2>, _: &mut Particle<2>, _: &mut [Particle<2>]) {}

    fn compute_star_grav_forces(&self, _: &[StarParticle<2>], _: &mut Particle<2>) {}
}

#[test]
fn wide_particle_still_sees_narrow_neighbour_across_the_face() {
    // x = 4.9 reaches 2 * 1.0 and gathers from x = 6.0, whose own reach of
    // 2 * 0.1 stops well short of the split at 5.45.
    let config = strip_config();
    let results = run_ranks(2, |group| {
        let mut controller = DomainController::<2>::new(group, &config).unwrap();
        let mut search = brute_force(&config);
        let mut particles = if controller.rank() == 0 {
            ParticleBuffer::from_particles(vec![
                Particle::new([4.9, 2.5], 1.0, 1.0),
                Particle::new([6.0, 2.5], 1.0, 0.1),
            ])
        } else {
            ParticleBuffer::new()
        };
        controller
            .create_load_balancing_tree(&mut particles, search.as_ref())
            .unwrap();
        let split = controller.domains()[0].boxmax[0];

        let ghosts = controller
            .update_ghost_particles(&mut particles, search.as_ref())
            .unwrap();
        let physics = HydroNeighbours::default();
        search
            .update_all_sph_hydro_forces(&mut particles, &physics, &[])
            .unwrap();
        let seen = physics.seen.into_inner().unwrap();
        (split, ghosts, seen)
    });

    assert!((results[0].0 - 5.45).abs() < 1e-4);
    assert_eq!(results[0].1, 1);
    assert_eq!(results[1].1, 1);

    // Same lists as a single rank holding both particles
    assert_eq!(results[0].2, vec![(4.9, vec![6.0])]);
    assert_eq!(results[1].2, vec![(6.0, vec![4.9])]);
}

#[test]
fn skewed_work_triggers_rebalance_and_transfer() {
    let config = strip_config();
    let results = run_ranks(2, |group| {
        let (mut controller, search, mut particles) = start_rank(group, &config);
        controller
            .create_load_balancing_tree(&mut particles, search.as_ref())
            .unwrap();

        // Off-cadence steps never communicate.
        assert!(!controller.load_balancing(5, &particles).unwrap());

        if controller.rank() == 1 {
            for p in particles.real_mut() {
                p.level = 3;
            }
        }
        let changed = controller.load_balancing(16, &particles).unwrap();
        let phase = controller.phase();
        let repeat = controller.load_balancing(32, &particles);

        controller
            .transfer_particles_to_node(&mut particles, search.as_ref())
            .unwrap();
        let domain = *controller.own_domain().unwrap();
        let inside = particles.real().iter().all(|p| domain.contains(&p.r));

        (changed, phase, matches!(repeat, Err(DomainError::Protocol(_))), particles.real_count(), domain, inside)
    });

    for (changed, phase, repeat_rejected, _, _, inside) in &results {
        assert!(*changed);
        assert_eq!(*phase, CyclePhase::TransferPending);
        assert!(*repeat_rejected);
        assert!(*inside);
    }
    assert_eq!(results[0].3, 72);
    assert_eq!(results[1].3, 28);
    assert!((results[0].4.boxmax[0] - 7.2).abs() < 1e-3);
}

#[test]
fn four_ranks_share_a_cube_lattice() {
    let config = DecompositionConfig::new(vec![0.0; 3], vec![1.0; 3]);
    let results = run_ranks(4, |group| {
        let mut controller = DomainController::<3>::new(group, &config).unwrap();
        let search = create_search::<3>(&config.neighbour_search, Arc::new(M4Kernel)).unwrap();

        let mut particles = ParticleBuffer::new();
        if controller.rank() == 0 {
            for i in 0..8 {
                for j in 0..8 {
                    for k in 0..8 {
                        let r = [i, j, k].map(|n| (n as f32 + 0.5) / 8.0);
                        particles.push(Particle::new(r, 1.0 / 512.0, 0.1));
                    }
                }
            }
        }

        controller
            .create_load_balancing_tree(&mut particles, search.as_ref())
            .unwrap();
        let domain = *controller.own_domain().unwrap();
        let inside = particles.real().iter().all(|p| domain.contains(&p.r));
        (particles.real_count(), inside, controller.domains().to_vec())
    });

    assert!(results.iter().all(|(count, inside, _)| *count == 128 && *inside));
    // Every rank agrees on the decomposition
    assert!(results.iter().all(|(_, _, domains)| domains == &results[0].2));
}

#[test]
fn single_rank_owns_everything() {
    let config = strip_config();
    let results = run_ranks(1, |group| {
        let (mut controller, search, mut particles) = start_rank(group, &config);
        controller
            .create_load_balancing_tree(&mut particles, search.as_ref())
            .unwrap();
        let summary = controller
            .transfer_particles_to_node(&mut particles, search.as_ref())
            .unwrap();
        let ghosts = controller
            .update_ghost_particles(&mut particles, search.as_ref())
            .unwrap();
        (particles.real_count(), summary.sent + summary.received, ghosts)
    });
    assert_eq!(results, vec![(100, 0, 0)]);
}

#[test]
fn operations_before_the_tree_are_rejected() {
    let config = strip_config();
    let results = run_ranks(1, |group| {
        let (mut controller, search, mut particles) = start_rank(group, &config);
        let transfer = controller.transfer_particles_to_node(&mut particles, search.as_ref());
        let ghosts = controller.update_ghost_particles(&mut particles, search.as_ref());
        let balance = controller.load_balancing(0, &particles);
        [
            matches!(transfer, Err(DomainError::Protocol(_))),
            matches!(ghosts, Err(DomainError::Protocol(_))),
            matches!(balance, Err(DomainError::Protocol(_))),
        ]
    });
    assert_eq!(results, vec![[true; 3]]);
}

#[test]
fn worker_must_start_empty() {
    let config = strip_config();
    let results = run_ranks(2, |group| {
        let (mut controller, search, _) = start_rank(group, &config);
        // Both ranks hold the full row
        let mut particles = particle_row();
        controller.create_load_balancing_tree(&mut particles, search.as_ref())
    });
    assert!(matches!(results[1], Err(DomainError::Protocol(_))));
}

#[test]
fn transport_verification_at_startup() {
    let mut config = strip_config();
    config.verify_transport = true;
    let results = run_ranks(2, |group| DomainController::<2>::new(group, &config).map(|c| c.size()));
    assert!(results.iter().all(|r| matches!(r, Ok(2))));
}

#[test]
fn invalid_box_is_rejected_before_startup() {
    let config = DecompositionConfig::new(vec![0.0, 0.0], vec![0.0, 5.0]);
    let results = run_ranks(1, |group| DomainController::<2>::new(group, &config).err());
    assert!(matches!(results[0], Some(DomainError::Config(_))));
}
