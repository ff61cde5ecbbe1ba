//! Particle selection for the distributed layer: ghosts to export and
//! particles to transfer after domain boundaries move.

use crate::domain_box::{particle_box_overlap, particle_in_box, DomainBox};
use crate::particle::Particle;

/// Ghost references to export, one list per process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExportPlan {
    /// `per_node[rank]` lists buffer indices to copy to `rank`.
    pub per_node: Vec<Vec<usize>>,
}

impl ExportPlan {
    /// Total number of exported copies.
    pub fn total(&self) -> usize {
        self.per_node.iter().map(Vec::len).sum()
    }
}

/// Ownership transfers, one list per destination plus the global removal
/// list. Every index appears at most once across all of `per_node`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferPlan {
    /// `per_node[rank]` lists buffer indices moving to `rank`.
    pub per_node: Vec<Vec<usize>>,
    /// Every index in `per_node`, in selection order.
    pub all: Vec<usize>,
}

/// Bounding box of the interaction envelopes (`r ± hrange_factor * h`) of
/// every live particle. [`DomainBox::empty`] when there is none.
///
/// Any particle that one of these particles gathers from, or that scatters
/// onto one of them, has an envelope touching this box.
pub fn interaction_box<const D: usize>(particles: &[Particle<D>], hrange_factor: f32) -> DomainBox<D> {
    let mut hbox = DomainBox::empty();
    for particle in particles.iter().filter(|p| p.is_live()) {
        hbox.enclose(&DomainBox::new(particle.r, particle.r).expanded(hrange_factor * particle.h));
    }
    hbox
}

/// List every live particle whose envelope (`r ± hrange_factor * h`) touches
/// the interaction box of one of `overlapping_nodes`. A particle may be
/// listed for several nodes.
pub fn find_ghost_particles_to_export<const D: usize>(
    particles: &[Particle<D>],
    hrange_factor: f32,
    overlapping_nodes: &[usize],
    regions: &[DomainBox<D>],
) -> ExportPlan {
    let mut per_node = vec![Vec::new(); regions.len()];

    for (i, particle) in particles.iter().enumerate() {
        if !particle.is_live() {
            continue;
        }
        let hrange = hrange_factor * particle.h;
        for &node in overlapping_nodes {
            if particle_box_overlap(particle, &regions[node], hrange) {
                per_node[node].push(i);
            }
        }
    }

    ExportPlan { per_node }
}

/// Assign every live particle lying inside one of the `potential_nodes`
/// domains to the first such node. Particles matching none stay put.
pub fn find_particles_to_transfer<const D: usize>(
    particles: &[Particle<D>],
    potential_nodes: &[usize],
    domains: &[DomainBox<D>],
) -> TransferPlan {
    let mut plan = TransferPlan {
        per_node: vec![Vec::new(); domains.len()],
        all: Vec::new(),
    };

    for (i, particle) in particles.iter().enumerate() {
        if !particle.is_live() {
            continue;
        }
        let destination = potential_nodes
            .iter()
            .copied()
            .find(|&node| particle_in_box(particle, &domains[node]));
        if let Some(node) = destination {
            plan.per_node[node].push(i);
            plan.all.push(i);
        }
    }

    plan
}
