//! Distributed domain decomposition for the SPH neighbour search.
//!
//! Rank 0 partitions space with a balancing tree (one leaf box per rank),
//! distributes the particles, and periodically re-splits the tree when the
//! work per rank drifts apart. Particles that leave a rank's box are
//! transferred to their new owner; particles near a box face are exported
//! to neighbouring ranks as read-only ghosts.
//!
//! # Modules
//! - [`config`] -- JSON configuration and simulation box validation.
//! - [`process`] -- process group trait, in-process thread group, startup context.
//! - [`transport`] -- fixed-layout wire records.
//! - [`tree`] -- the balancing tree.
//! - [`controller`] -- coordinator/worker roles and the per-rank controller.

#![warn(missing_docs)]

pub mod config;
pub mod controller;
pub mod error;
pub mod process;
pub mod transport;
pub mod tree;

pub use config::{BoundaryType, DecompositionConfig, LoadBalancingConfig, SimulationBox};
pub use controller::{CyclePhase, DomainController, DomainRole, TransferSummary};
pub use error::DomainError;
pub use process::{LocalProcessGroup, MessageTag, ProcessContext, ProcessGroup};
pub use transport::{ParticleDatatype, ParticleRecord};
pub use tree::{BalancingTree, LoadSample};
