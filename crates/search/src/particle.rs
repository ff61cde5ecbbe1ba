//! Particle data structures: SPH gas particles, external point-mass bodies
//! and the real-plus-ghost particle buffer shared by every search stage.

/// Particle type discriminator.
///
/// `Dead` marks a particle that has been logically deleted but whose slot is
/// kept so that indices stay stable until the next purge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum ParticleType {
    /// Live gas particle
    #[default]
    Gas = 0,
    /// Logically deleted particle
    Dead = 1,
}

impl ParticleType {
    /// Decode the wire value written by `ParticleType as u8`.
    pub fn from_repr(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Gas),
            1 => Some(Self::Dead),
            _ => None,
        }
    }
}

/// A single SPH particle in `D` dimensions.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Particle<const D: usize> {
    /// Liveness tag
    pub ptype: ParticleType,
    /// Participates in the current step
    pub active: bool,
    /// Time-step level (block time-stepping)
    pub level: i32,
    /// Highest level of any neighbour
    pub levelneib: i32,
    /// Original particle id
    pub iorig: u32,
    /// Position
    pub r: [f32; D],
    /// Velocity
    pub v: [f32; D],
    /// Hydro acceleration accumulator
    pub a: [f32; D],
    /// Gravitational acceleration accumulator
    pub agrav: [f32; D],
    /// Smoothing length
    pub h: f32,
    /// 1 / h
    pub invh: f32,
    /// Mass
    pub m: f32,
    /// Specific internal energy
    pub u: f32,
    /// Compressional heating rate
    pub dudt: f32,
    /// Density
    pub rho: f32,
    /// Gravitational potential
    pub gpot: f32,
    /// Gravitational potential energy
    pub gpe: f32,
}

impl<const D: usize> Particle<D> {
    /// Create an active gas particle at rest.
    pub fn new(r: [f32; D], m: f32, h: f32) -> Self {
        let mut particle = Self {
            r,
            m,
            active: true,
            ..Self::default()
        };
        particle.set_h(h);
        particle
    }

    /// `false` once the particle has been logically deleted.
    #[inline]
    pub fn is_live(&self) -> bool {
        self.ptype != ParticleType::Dead
    }

    /// Mark the particle as deleted. The slot is reclaimed by the next purge.
    pub fn kill(&mut self) {
        self.ptype = ParticleType::Dead;
        self.active = false;
    }

    /// Set the smoothing length, keeping `invh` consistent.
    pub fn set_h(&mut self, h: f32) {
        self.h = h;
        self.invh = if h > 0.0 { 1.0 / h } else { 0.0 };
    }

    /// Zero every accumulator written by the force stages.
    pub fn zero_accumulators(&mut self) {
        self.a = [0.0; D];
        self.agrav = [0.0; D];
        self.gpot = 0.0;
        self.gpe = 0.0;
        self.dudt = 0.0;
        self.levelneib = 0;
    }
}

impl<const D: usize> Default for Particle<D> {
    fn default() -> Self {
        Self {
            ptype: ParticleType::Gas,
            active: false,
            level: 0,
            levelneib: 0,
            iorig: 0,
            r: [0.0; D],
            v: [0.0; D],
            a: [0.0; D],
            agrav: [0.0; D],
            h: 0.0,
            invh: 0.0,
            m: 0.0,
            u: 0.0,
            dudt: 0.0,
            rho: 0.0,
            gpot: 0.0,
            gpe: 0.0,
        }
    }
}

/// External point-mass body (star or sink) interacting with the gas.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StarParticle<const D: usize> {
    /// Position
    pub r: [f32; D],
    /// Velocity
    pub v: [f32; D],
    /// Acceleration accumulator
    pub a: [f32; D],
    /// Mass
    pub m: f32,
    /// Gravitational softening length
    pub h: f32,
    /// Gravitational potential
    pub gpot: f32,
    /// Participates in the current step
    pub active: bool,
}

impl<const D: usize> StarParticle<D> {
    /// Create an active point mass at rest.
    pub fn new(r: [f32; D], m: f32, h: f32) -> Self {
        Self {
            r,
            v: [0.0; D],
            a: [0.0; D],
            m,
            h,
            gpot: 0.0,
            active: true,
        }
    }
}

/// Local particle storage: `real_count()` authoritative particles followed by
/// read-only ghost copies imported from other processes.
///
/// Every index handed out by the search stages refers to a slot of
/// [`ParticleBuffer::all`]. Indices below `real_count()` are real particles.
#[derive(Debug, Clone)]
pub struct ParticleBuffer<const D: usize> {
    particles: Vec<Particle<D>>,
    nreal: usize,
}

impl<const D: usize> ParticleBuffer<D> {
    /// Create an empty buffer.
    pub fn new() -> Self {
        Self {
            particles: Vec::new(),
            nreal: 0,
        }
    }

    /// Create a buffer holding `particles` as real particles.
    pub fn from_particles(particles: Vec<Particle<D>>) -> Self {
        let nreal = particles.len();
        Self { particles, nreal }
    }

    /// Real plus ghost particle count.
    pub fn len(&self) -> usize {
        self.particles.len()
    }

    /// `true` if the buffer holds neither real nor ghost particles.
    pub fn is_empty(&self) -> bool {
        self.particles.is_empty()
    }

    /// Number of real (owned) particles.
    pub fn real_count(&self) -> usize {
        self.nreal
    }

    /// Number of ghost particles.
    pub fn ghost_count(&self) -> usize {
        self.particles.len() - self.nreal
    }

    /// Number of real particles that are not dead.
    pub fn live_count(&self) -> usize {
        self.real().iter().filter(|p| p.is_live()).count()
    }

    /// Real and ghost particles.
    pub fn all(&self) -> &[Particle<D>] {
        &self.particles
    }

    /// Mutable access to real and ghost particles.
    pub fn all_mut(&mut self) -> &mut [Particle<D>] {
        &mut self.particles
    }

    /// Real particles only.
    pub fn real(&self) -> &[Particle<D>] {
        &self.particles[..self.nreal]
    }

    /// Mutable real particles only.
    pub fn real_mut(&mut self) -> &mut [Particle<D>] {
        &mut self.particles[..self.nreal]
    }

    /// Ghost particles only.
    pub fn ghosts(&self) -> &[Particle<D>] {
        &self.particles[self.nreal..]
    }

    /// Append a real particle. Existing ghosts stay behind the real block.
    pub fn push(&mut self, particle: Particle<D>) {
        self.particles.insert(self.nreal, particle);
        self.nreal += 1;
    }

    /// Append real particles. Existing ghosts stay behind the real block.
    pub fn extend_real<I>(&mut self, particles: I)
    where
        I: IntoIterator<Item = Particle<D>>,
    {
        let incoming: Vec<Particle<D>> = particles.into_iter().collect();
        let added = incoming.len();
        self.particles.splice(self.nreal..self.nreal, incoming);
        self.nreal += added;
    }

    /// Append a ghost copy.
    pub fn push_ghost(&mut self, particle: Particle<D>) {
        self.particles.push(particle);
    }

    /// Drop every ghost copy.
    pub fn clear_ghosts(&mut self) {
        self.particles.truncate(self.nreal);
    }

    /// Drop everything.
    pub fn clear(&mut self) {
        self.particles.clear();
        self.nreal = 0;
    }

    /// Remove the real particles at `indices` (any order, no duplicates) and
    /// return them in ascending index order. Ghosts are kept.
    pub fn remove_real(&mut self, indices: &[usize]) -> Vec<Particle<D>> {
        if indices.is_empty() {
            return Vec::new();
        }
        let mut remove = vec![false; self.nreal];
        for &i in indices {
            debug_assert!(i < self.nreal, "index {i} is not a real particle");
            remove[i] = true;
        }

        let mut removed = Vec::with_capacity(indices.len());
        let mut kept = Vec::with_capacity(self.particles.len() - indices.len());
        for (i, particle) in self.particles.drain(..).enumerate() {
            if i < remove.len() && remove[i] {
                removed.push(particle);
            } else {
                kept.push(particle);
            }
        }
        self.particles = kept;
        self.nreal -= removed.len();
        removed
    }

    /// Remove dead real particles (and dead ghosts), compacting the buffer.
    /// Returns the number of purged real particles.
    pub fn delete_dead_particles(&mut self) -> usize {
        let nreal = self.nreal;
        let mut purged = 0;
        let mut index = 0;
        self.particles.retain(|p| {
            let keep = p.is_live();
            if !keep && index < nreal {
                purged += 1;
            }
            index += 1;
            keep
        });
        self.nreal -= purged;
        purged
    }
}

impl<const D: usize> Default for ParticleBuffer<D> {
    fn default() -> Self {
        Self::new()
    }
}
