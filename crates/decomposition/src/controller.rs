//! Domain controller: builds the decomposition, balances it and moves
//! particles between ranks.
//!
//! Rank 0 acts as [`Coordinator`] (owns the balancing tree and makes every
//! decision); the other ranks are [`Worker`]s that report and follow. All
//! operations are collectives: every rank must call them in the same order.

use search::{DomainBox, NeighbourSearch, Particle, ParticleBuffer};

use crate::config::{DecompositionConfig, LoadBalancingConfig, SimulationBox};
use crate::error::DomainError;
use crate::process::{MessageTag, ProcessContext, ProcessGroup};
use crate::transport::{self, WorkSample};
use crate::tree::{BalancingTree, LoadSample};

/// Where the controller is in the decomposition cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CyclePhase {
    /// No tree built yet
    Uninitialised,
    /// Every particle is on the rank that owns its position
    Balanced,
    /// Boxes moved; particles must be transferred before the next balance
    TransferPending,
}

/// Particle counts moved by one transfer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferSummary {
    /// Particles sent to other ranks
    pub sent: usize,
    /// Particles adopted from other ranks
    pub received: usize,
}

/// State shared by both roles.
pub struct DomainState<const D: usize> {
    context: ProcessContext,
    simbox: SimulationBox<D>,
    balancing: LoadBalancingConfig,
    domains: Vec<DomainBox<D>>,
}

impl<const D: usize> DomainState<D> {
    fn group(&mut self) -> &mut dyn ProcessGroup {
        self.context.group_mut()
    }

    fn set_domains(&mut self, domains: Vec<DomainBox<D>>) -> Result<(), DomainError> {
        if domains.len() != self.context.size() {
            return Err(DomainError::Protocol(format!(
                "received {} domain boxes for {} ranks",
                domains.len(),
                self.context.size()
            )));
        }
        self.domains = domains;
        Ok(())
    }
}

/// Rank-specific half of the tree and balancing collectives.
pub trait DomainRole<const D: usize>: Send {
    /// Build (coordinator) or receive (worker) the initial decomposition
    /// and particle distribution.
    fn create_load_balancing_tree(
        &mut self,
        state: &mut DomainState<D>,
        particles: &mut ParticleBuffer<D>,
        search: &dyn NeighbourSearch<D>,
    ) -> Result<(), DomainError>;

    /// Exchange work samples and new boxes. Returns `true` if the boxes moved.
    fn load_balancing(
        &mut self,
        state: &mut DomainState<D>,
        particles: &ParticleBuffer<D>,
    ) -> Result<bool, DomainError>;
}

/// Rank 0.
pub struct Coordinator<const D: usize> {
    tree: Option<BalancingTree<D>>,
}

/// Every other rank.
pub struct Worker;

fn work_samples<const D: usize>(particles: &ParticleBuffer<D>) -> Vec<LoadSample<D>> {
    particles
        .real()
        .iter()
        .filter(|p| p.is_live())
        .map(|p| LoadSample {
            r: p.r,
            work: 2.0_f32.powi(p.level),
        })
        .collect()
}

fn others(rank: usize, size: usize) -> Vec<usize> {
    (0..size).filter(|&r| r != rank).collect()
}

fn gather_particles<const D: usize>(particles: &ParticleBuffer<D>, indices: &[usize]) -> Vec<Particle<D>> {
    indices.iter().map(|&i| particles.all()[i]).collect()
}

impl<const D: usize> DomainRole<D> for Coordinator<D> {
    fn create_load_balancing_tree(
        &mut self,
        state: &mut DomainState<D>,
        particles: &mut ParticleBuffer<D>,
        search: &dyn NeighbourSearch<D>,
    ) -> Result<(), DomainError> {
        let size = state.context.size();
        particles.clear_ghosts();

        // Initial partition: every particle weighs the same
        let mut samples: Vec<LoadSample<D>> = work_samples(particles)
            .into_iter()
            .map(|s| LoadSample { work: 1.0, ..s })
            .collect();

        let mut tree = BalancingTree::build(
            state.simbox.root_box(),
            state.simbox.finite_box(),
            size,
        )?;
        tree.load(&mut samples);
        let domains = tree.leaf_boxes();
        let depth = tree.depth();
        self.tree = Some(tree);

        state
            .group()
            .broadcast(0, MessageTag::Boxes, transport::encode_boxes(&domains))?;
        state.set_domains(domains)?;

        let plan = search.find_particles_to_transfer(particles, &others(0, size), &state.domains);
        for rank in 1..size {
            let batch = gather_particles(particles, &plan.per_node[rank]);
            let payload = state.context.datatype().encode_particles(&batch);
            state.group().send(rank, MessageTag::InitialParticles, payload)?;
        }
        particles.remove_real(&plan.all);

        tracing::info!(
            "Load balancing tree of depth {} built for {} ranks; distributed {} particles, {} kept on rank 0",
            depth,
            size,
            plan.all.len(),
            particles.real_count()
        );
        Ok(())
    }

    fn load_balancing(
        &mut self,
        state: &mut DomainState<D>,
        particles: &ParticleBuffer<D>,
    ) -> Result<bool, DomainError> {
        let size = state.context.size();
        let mut samples = work_samples(particles);
        for rank in 1..size {
            let payload = state.group().recv(rank, MessageTag::WorkSamples)?;
            samples.extend(
                transport::decode::<WorkSample>(&payload)?
                    .iter()
                    .map(|s| LoadSample {
                        r: s.position(),
                        work: s.work,
                    }),
            );
        }

        let tree = self.tree.as_mut().ok_or_else(|| {
            DomainError::Protocol("coordinator has no balancing tree".to_string())
        })?;
        let adjusted = tree.rebalance(&mut samples, state.balancing.imbalance_threshold);

        // Empty payload: no change. Otherwise the level, then the boxes.
        let mut payload = Vec::new();
        if let Some(level) = adjusted {
            let domains = tree.leaf_boxes();
            payload.extend_from_slice(&level.to_le_bytes());
            payload.extend(transport::encode_boxes(&domains));
            tracing::info!("Rebalanced domains from tree level {}", level);
            state.set_domains(domains)?;
        }
        state.group().broadcast(0, MessageTag::Rebalance, payload)?;

        Ok(adjusted.is_some())
    }
}

impl<const D: usize> DomainRole<D> for Worker {
    fn create_load_balancing_tree(
        &mut self,
        state: &mut DomainState<D>,
        particles: &mut ParticleBuffer<D>,
        _search: &dyn NeighbourSearch<D>,
    ) -> Result<(), DomainError> {
        if !particles.is_empty() {
            return Err(DomainError::Protocol(format!(
                "rank {} must start with an empty particle buffer (holds {})",
                state.context.rank(),
                particles.len()
            )));
        }

        let payload = state.group().broadcast(0, MessageTag::Boxes, Vec::new())?;
        state.set_domains(transport::decode_boxes(&payload)?)?;

        let payload = state.group().recv(0, MessageTag::InitialParticles)?;
        let received = state.context.datatype().decode_particles::<D>(&payload)?;
        tracing::debug!("Rank {} received {} initial particles", state.context.rank(), received.len());
        particles.extend_real(received);
        Ok(())
    }

    fn load_balancing(
        &mut self,
        state: &mut DomainState<D>,
        particles: &ParticleBuffer<D>,
    ) -> Result<bool, DomainError> {
        let samples: Vec<WorkSample> = work_samples(particles)
            .iter()
            .map(|s| WorkSample::new(&s.r, s.work))
            .collect();
        state
            .group()
            .send(0, MessageTag::WorkSamples, transport::encode(&samples))?;

        let payload = state.group().broadcast(0, MessageTag::Rebalance, Vec::new())?;
        if payload.is_empty() {
            return Ok(false);
        }
        if payload.len() < 4 {
            return Err(DomainError::Transport(format!(
                "rebalance payload of {} bytes",
                payload.len()
            )));
        }
        let (level, boxes) = payload.split_at(4);
        let level = u32::from_le_bytes([level[0], level[1], level[2], level[3]]);
        tracing::debug!("Rank {} adopting domains rebalanced at level {}", state.context.rank(), level);
        state.set_domains(transport::decode_boxes(boxes)?)?;
        Ok(true)
    }
}

/// Per-rank driver of the decomposition cycle.
pub struct DomainController<const D: usize> {
    state: DomainState<D>,
    role: Box<dyn DomainRole<D>>,
    phase: CyclePhase,
}

impl<const D: usize> DomainController<D> {
    /// Validate `config`, start up on `group` and pick this rank's role.
    pub fn new(group: Box<dyn ProcessGroup>, config: &DecompositionConfig) -> Result<Self, DomainError> {
        let simbox = config.validate::<D>()?;
        let context = ProcessContext::initialise::<D>(group, config.verify_transport)?;

        let role: Box<dyn DomainRole<D>> = if context.rank() == 0 {
            Box::new(Coordinator { tree: None })
        } else {
            Box::new(Worker)
        };

        Ok(Self {
            state: DomainState {
                context,
                simbox,
                balancing: config.load_balancing.clone(),
                domains: Vec::new(),
            },
            role,
            phase: CyclePhase::Uninitialised,
        })
    }

    /// This rank.
    pub fn rank(&self) -> usize {
        self.state.context.rank()
    }

    /// Number of ranks.
    pub fn size(&self) -> usize {
        self.state.context.size()
    }

    /// Current position in the decomposition cycle.
    pub fn phase(&self) -> CyclePhase {
        self.phase
    }

    /// Domain box of every rank (empty before the tree is built).
    pub fn domains(&self) -> &[DomainBox<D>] {
        &self.state.domains
    }

    /// This rank's domain box.
    pub fn own_domain(&self) -> Option<&DomainBox<D>> {
        self.state.domains.get(self.rank())
    }

    /// Validated simulation box.
    pub fn simulation_box(&self) -> &SimulationBox<D> {
        &self.state.simbox
    }

    /// Build the balancing tree on rank 0 from its particles and hand every
    /// other rank its domain and its particles. Workers must start empty.
    pub fn create_load_balancing_tree(
        &mut self,
        particles: &mut ParticleBuffer<D>,
        search: &dyn NeighbourSearch<D>,
    ) -> Result<(), DomainError> {
        let result = self
            .role
            .create_load_balancing_tree(&mut self.state, particles, search);
        self.check(result)?;
        self.phase = CyclePhase::Balanced;
        Ok(())
    }

    /// On cadence steps, re-split overloaded subtrees. Returns `true` if the
    /// boxes moved, after which [`Self::transfer_particles_to_node`] must run.
    pub fn load_balancing(&mut self, step: u64, particles: &ParticleBuffer<D>) -> Result<bool, DomainError> {
        match self.phase {
            CyclePhase::Uninitialised => {
                return Err(DomainError::Protocol(
                    "load balancing before the tree was built".to_string(),
                ))
            }
            CyclePhase::TransferPending => {
                return Err(DomainError::Protocol(
                    "load balancing while a particle transfer is pending".to_string(),
                ))
            }
            CyclePhase::Balanced => {}
        }
        if step % self.state.balancing.every != 0 {
            return Ok(false);
        }

        let result = self.role.load_balancing(&mut self.state, particles);
        let changed = self.check(result)?;
        if changed {
            self.phase = CyclePhase::TransferPending;
        }
        Ok(changed)
    }

    /// Send every particle that now lies in another rank's box to that rank
    /// and adopt the particles sent here. Ghosts are dropped first.
    pub fn transfer_particles_to_node(
        &mut self,
        particles: &mut ParticleBuffer<D>,
        search: &dyn NeighbourSearch<D>,
    ) -> Result<TransferSummary, DomainError> {
        self.require_tree("particle transfer")?;
        let result = self.exchange_transfers(particles, search);
        let summary = self.check(result)?;
        self.phase = CyclePhase::Balanced;
        Ok(summary)
    }

    /// Replace the ghosts with fresh copies of every particle on another
    /// rank that one of this rank's particles may interact with: its
    /// envelope reaches the interaction box of this rank's particles.
    /// Returns the number of ghosts received.
    pub fn update_ghost_particles(
        &mut self,
        particles: &mut ParticleBuffer<D>,
        search: &dyn NeighbourSearch<D>,
    ) -> Result<usize, DomainError> {
        self.require_tree("ghost exchange")?;
        if self.phase == CyclePhase::TransferPending {
            return Err(DomainError::Protocol(
                "ghost exchange while a particle transfer is pending".to_string(),
            ));
        }
        let result = self.exchange_ghosts(particles, search);
        self.check(result)
    }

    /// Release the process context and hand back the group.
    pub fn finalize(self) -> Box<dyn ProcessGroup> {
        self.state.context.finalize()
    }

    fn require_tree(&self, operation: &str) -> Result<(), DomainError> {
        if self.phase == CyclePhase::Uninitialised {
            return Err(DomainError::Protocol(format!(
                "{operation} before the tree was built"
            )));
        }
        Ok(())
    }

    /// Abort the group on communication failures so no rank blocks forever.
    fn check<T>(&mut self, result: Result<T, DomainError>) -> Result<T, DomainError> {
        if let Err(e) = &result {
            if !matches!(e, DomainError::Aborted) {
                tracing::error!("Rank {}: {}", self.rank(), e);
                self.state.context.group().abort(&e.to_string());
            }
        }
        result
    }

    fn exchange_transfers(
        &mut self,
        particles: &mut ParticleBuffer<D>,
        search: &dyn NeighbourSearch<D>,
    ) -> Result<TransferSummary, DomainError> {
        let rank = self.rank();
        let peers = others(rank, self.size());
        particles.clear_ghosts();

        let plan = search.find_particles_to_transfer(particles, &peers, &self.state.domains);

        let outside = particles
            .real()
            .iter()
            .filter(|p| p.is_live() && !self.state.domains[rank].contains(&p.r))
            .count()
            .saturating_sub(plan.all.len());
        if outside > 0 {
            tracing::warn!("Rank {}: {} particles lie outside every domain box", rank, outside);
        }

        for &peer in &peers {
            let batch = gather_particles(particles, &plan.per_node[peer]);
            let payload = self.state.context.datatype().encode_particles(&batch);
            self.state.group().send(peer, MessageTag::Transfer, payload)?;
        }
        let sent = particles.remove_real(&plan.all).len();

        let mut received = 0;
        for &peer in &peers {
            let payload = self.state.group().recv(peer, MessageTag::Transfer)?;
            let incoming = self.state.context.datatype().decode_particles::<D>(&payload)?;
            received += incoming.len();
            particles.extend_real(incoming);
        }

        tracing::debug!("Rank {} transferred: {} out, {} in", rank, sent, received);
        Ok(TransferSummary { sent, received })
    }

    fn exchange_ghosts(
        &mut self,
        particles: &mut ParticleBuffer<D>,
        search: &dyn NeighbourSearch<D>,
    ) -> Result<usize, DomainError> {
        let rank = self.rank();
        let peers = others(rank, self.size());
        particles.clear_ghosts();

        // Interaction boxes of every rank, indexed by rank
        let own_hbox = search.interaction_box(particles);
        let gathered = self
            .state
            .group()
            .allgather(MessageTag::InteractionBoxes, transport::encode_boxes(&[own_hbox]))?;
        let mut hboxes = Vec::with_capacity(gathered.len());
        for payload in &gathered {
            match transport::decode_boxes::<D>(payload)?.as_slice() {
                [hbox] => hboxes.push(*hbox),
                boxes => {
                    return Err(DomainError::Protocol(format!(
                        "expected one interaction box, received {}",
                        boxes.len()
                    )))
                }
            }
        }
        let overlapping: Vec<usize> = peers
            .iter()
            .copied()
            .filter(|&peer| own_hbox.overlaps(&hboxes[peer]))
            .collect();

        let plan = search.find_ghost_particles_to_export(particles, &overlapping, &hboxes);
        for &peer in &peers {
            let batch = gather_particles(particles, &plan.per_node[peer]);
            let payload = self.state.context.datatype().encode_particles(&batch);
            self.state.group().send(peer, MessageTag::Ghosts, payload)?;
        }

        let mut received = 0;
        for &peer in &peers {
            let payload = self.state.group().recv(peer, MessageTag::Ghosts)?;
            for ghost in self.state.context.datatype().decode_particles::<D>(&payload)? {
                particles.push_ghost(ghost);
                received += 1;
            }
        }

        tracing::debug!("Rank {} ghosts: {} exported, {} imported", rank, plan.total(), received);
        Ok(received)
    }
}
