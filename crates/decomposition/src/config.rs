//! Configuration parsing and validation for the domain decomposition

use std::fs;
use std::path::Path;

use search::{DomainBox, SearchConfig, BIG_NUMBER};
use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// Decomposition configuration, one JSON document shared by every rank.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecompositionConfig {
    /// Simulation box corners
    pub simulation_box: BoxBounds,
    /// Boundary condition per box face
    #[serde(default)]
    pub boundaries: Boundaries,
    /// Neighbour search settings
    #[serde(default)]
    pub neighbour_search: SearchConfig,
    /// Load balancing cadence and tolerance
    #[serde(default)]
    pub load_balancing: LoadBalancingConfig,
    /// Check the particle record layout between ranks 0 and 1 at startup
    #[serde(default)]
    pub verify_transport: bool,
}

/// Simulation box corners. Length must match the dimensionality.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoxBounds {
    /// Minimum corner
    pub min: Vec<f32>,
    /// Maximum corner
    pub max: Vec<f32>,
}

/// Boundary condition of one box face
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BoundaryType {
    /// Particles may leave; the root domain extends to infinity
    #[default]
    Open,
    /// Wraps to the opposite face
    Periodic,
    /// Reflecting wall
    Mirror,
}

/// Boundary conditions for all six faces. Faces beyond the
/// dimensionality are ignored.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Boundaries {
    /// X lower face
    #[serde(default)]
    pub x_lhs: BoundaryType,
    /// X upper face
    #[serde(default)]
    pub x_rhs: BoundaryType,
    /// Y lower face
    #[serde(default)]
    pub y_lhs: BoundaryType,
    /// Y upper face
    #[serde(default)]
    pub y_rhs: BoundaryType,
    /// Z lower face
    #[serde(default)]
    pub z_lhs: BoundaryType,
    /// Z upper face
    #[serde(default)]
    pub z_rhs: BoundaryType,
}

impl Boundaries {
    fn lhs(&self) -> [BoundaryType; 3] {
        [self.x_lhs, self.y_lhs, self.z_lhs]
    }

    fn rhs(&self) -> [BoundaryType; 3] {
        [self.x_rhs, self.y_rhs, self.z_rhs]
    }
}

/// Load balancing settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadBalancingConfig {
    /// Check the balance every this many steps
    #[serde(default = "default_balance_every")]
    pub every: u64,
    /// Relative left/right work deviation that triggers a re-split
    #[serde(default = "default_imbalance_threshold")]
    pub imbalance_threshold: f32,
}

fn default_balance_every() -> u64 {
    16
}

fn default_imbalance_threshold() -> f32 {
    0.1
}

impl Default for LoadBalancingConfig {
    fn default() -> Self {
        Self {
            every: default_balance_every(),
            imbalance_threshold: default_imbalance_threshold(),
        }
    }
}

/// Validated simulation box in `D` dimensions.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimulationBox<const D: usize> {
    /// Lower corner
    pub boxmin: [f32; D],
    /// Upper corner
    pub boxmax: [f32; D],
    /// Lower face boundaries
    pub lhs: [BoundaryType; D],
    /// Upper face boundaries
    pub rhs: [BoundaryType; D],
}

impl<const D: usize> SimulationBox<D> {
    /// The box with open faces pushed out to `±BIG_NUMBER`. This is the
    /// root of the balancing tree, so particles leaving through an open face
    /// still have an owner.
    pub fn root_box(&self) -> DomainBox<D> {
        let mut root = self.finite_box();
        for k in 0..D {
            if self.lhs[k] == BoundaryType::Open {
                root.boxmin[k] = -BIG_NUMBER;
            }
            if self.rhs[k] == BoundaryType::Open {
                root.boxmax[k] = BIG_NUMBER;
            }
        }
        root
    }

    /// The configured corners.
    pub fn finite_box(&self) -> DomainBox<D> {
        DomainBox::new(self.boxmin, self.boxmax)
    }
}

impl DecompositionConfig {
    /// Configuration with the given box corners and defaults for everything else.
    pub fn new(min: Vec<f32>, max: Vec<f32>) -> Self {
        Self {
            simulation_box: BoxBounds { min, max },
            boundaries: Boundaries::default(),
            neighbour_search: SearchConfig::default(),
            load_balancing: LoadBalancingConfig::default(),
            verify_transport: false,
        }
    }

    /// Load configuration from a JSON file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, DomainError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| DomainError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&contents)
    }

    /// Parse configuration from a JSON string
    pub fn from_json_str(contents: &str) -> Result<Self, DomainError> {
        Ok(serde_json::from_str(contents)?)
    }

    /// Validate the configuration for `D` dimensions and return the box.
    pub fn validate<const D: usize>(&self) -> Result<SimulationBox<D>, DomainError> {
        if D == 0 || D > 3 {
            return Err(DomainError::Config(format!(
                "dimensionality must be 1, 2 or 3 (got {D})"
            )));
        }

        let bounds = &self.simulation_box;
        if bounds.min.len() != D || bounds.max.len() != D {
            return Err(DomainError::Config(format!(
                "simulation_box needs {D} components per corner (got {} and {})",
                bounds.min.len(),
                bounds.max.len()
            )));
        }

        let mut boxmin = [0.0; D];
        let mut boxmax = [0.0; D];
        for k in 0..D {
            boxmin[k] = bounds.min[k];
            boxmax[k] = bounds.max[k];
            if !boxmin[k].is_finite() || !boxmax[k].is_finite() {
                return Err(DomainError::Config(format!("simulation_box axis {k} is not finite")));
            }
            if boxmin[k] >= boxmax[k] {
                return Err(DomainError::Config(format!(
                    "simulation_box axis {k} has zero or negative extent ({} >= {})",
                    boxmin[k], boxmax[k]
                )));
            }
        }

        let lhs_all = self.boundaries.lhs();
        let rhs_all = self.boundaries.rhs();
        let lhs: [BoundaryType; D] = std::array::from_fn(|k| lhs_all[k]);
        let rhs: [BoundaryType; D] = std::array::from_fn(|k| rhs_all[k]);
        for k in 0..D {
            let lhs_periodic = lhs[k] == BoundaryType::Periodic;
            let rhs_periodic = rhs[k] == BoundaryType::Periodic;
            if lhs_periodic != rhs_periodic {
                return Err(DomainError::Config(format!(
                    "periodic boundaries must be paired on axis {k}"
                )));
            }
        }

        if self.load_balancing.every == 0 {
            return Err(DomainError::Config(
                "load_balancing.every must be at least 1".to_string(),
            ));
        }
        let threshold = self.load_balancing.imbalance_threshold;
        if !threshold.is_finite() || threshold < 0.0 {
            return Err(DomainError::Config(
                "load_balancing.imbalance_threshold must be a non-negative number".to_string(),
            ));
        }
        let kern_fac = self.neighbour_search.kern_fac;
        if !kern_fac.is_finite() || kern_fac <= 0.0 {
            return Err(DomainError::Config(
                "neighbour_search.kern_fac must be positive".to_string(),
            ));
        }

        Ok(SimulationBox {
            boxmin,
            boxmax,
            lhs,
            rhs,
        })
    }
}
