//! World configuration, fixed at structure-construction time.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::constants::*;
use crate::error::ConfigError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorldConfig {
    /// Edge length of the world cube, in nm. The world spans `origin ± world_dimension / 2`.
    pub world_dimension: f32,
    /// Center of the world cube.
    pub origin: [f32; 3],
    pub coarse_voxel_width: f32,
    /// Fine voxels per coarse-voxel edge.
    pub fine_grid_dimension: u32,
    /// Size of the memory slot pool.
    pub memory_slot_count: u32,
    pub max_atoms_per_voxel: u32,
    pub max_references_per_slot: u32,
    /// Size of the atom address space.
    pub atom_capacity: u32,
    pub max_transaction_atoms: u32,
}

impl Default for WorldConfig {
    fn default() -> Self {
        Self {
            world_dimension: 64.0,
            origin: [0.0; 3],
            coarse_voxel_width: COARSE_VOXEL_WIDTH,
            fine_grid_dimension: FINE_GRID_DIMENSION,
            memory_slot_count: 1024,
            max_atoms_per_voxel: MAX_ATOMS_PER_VOXEL,
            max_references_per_slot: MAX_REFERENCES_PER_SLOT,
            atom_capacity: 1 << 20,
            max_transaction_atoms: MAX_TRANSACTION_ATOMS,
        }
    }
}

impl WorldConfig {
    /// Parse a config from RON text and validate it.
    pub fn from_ron_str(ron_str: &str) -> Result<Self, ConfigError> {
        let options = ron::Options::default();
        let config: WorldConfig = options
            .from_str(ron_str)
            .map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::IoError {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        Self::from_ron_str(&text)
    }

    pub fn to_ron_string(&self) -> Result<String, ConfigError> {
        ron::ser::to_string_pretty(self, ron::ser::PrettyConfig::default())
            .map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if !(self.coarse_voxel_width.is_finite() && self.coarse_voxel_width > 0.0) {
            return invalid(format!(
                "coarse_voxel_width must be positive, got {}",
                self.coarse_voxel_width
            ));
        }
        if !(self.world_dimension.is_finite() && self.world_dimension > 0.0) {
            return invalid(format!(
                "world_dimension must be positive, got {}",
                self.world_dimension
            ));
        }
        let voxels = self.world_dimension / self.coarse_voxel_width;
        let group_span = (2 * VOXEL_GROUP_SIZE) as f32;
        if voxels.fract() != 0.0 || (voxels % group_span) != 0.0 {
            return invalid(format!(
                "world_dimension {} must be a multiple of {} coarse voxels",
                self.world_dimension, group_span
            ));
        }
        if voxels as u32 > MAX_GRID_DIMENSION {
            return invalid(format!(
                "grid dimension {} exceeds {}",
                voxels, MAX_GRID_DIMENSION
            ));
        }
        if self.origin.iter().any(|c| !c.is_finite()) {
            return invalid("origin must be finite".to_string());
        }
        if !self.fine_grid_dimension.is_power_of_two()
            || !(2..=16).contains(&self.fine_grid_dimension)
        {
            return invalid(format!(
                "fine_grid_dimension must be a power of two in 2..=16, got {}",
                self.fine_grid_dimension
            ));
        }
        if self.memory_slot_count == 0 {
            return invalid("memory_slot_count must be at least 1".to_string());
        }
        if self.max_atoms_per_voxel == 0 || self.max_atoms_per_voxel > MAX_ATOMS_PER_VOXEL_LIMIT {
            return invalid(format!(
                "max_atoms_per_voxel must be in 1..={}, got {}",
                MAX_ATOMS_PER_VOXEL_LIMIT, self.max_atoms_per_voxel
            ));
        }
        if self.max_references_per_slot == 0
            || self.max_references_per_slot > MAX_REFERENCES_PER_SLOT_LIMIT
        {
            return invalid(format!(
                "max_references_per_slot must be in 1..={}, got {}",
                MAX_REFERENCES_PER_SLOT_LIMIT, self.max_references_per_slot
            ));
        }
        if self.atom_capacity == 0 || self.atom_capacity == u32::MAX {
            return invalid(format!("atom_capacity {} is out of range", self.atom_capacity));
        }
        if self.max_transaction_atoms == 0 {
            return invalid("max_transaction_atoms must be at least 1".to_string());
        }
        Ok(())
    }

    /// Coarse voxels along each axis.
    pub fn grid_dimension(&self) -> u32 {
        (self.world_dimension / self.coarse_voxel_width) as u32
    }

    pub fn voxel_count(&self) -> u32 {
        let dim = self.grid_dimension();
        dim * dim * dim
    }

    /// Voxel groups along each axis.
    pub fn group_dimension(&self) -> u32 {
        self.grid_dimension() / VOXEL_GROUP_SIZE
    }

    pub fn group_count(&self) -> u32 {
        let dim = self.group_dimension();
        dim * dim * dim
    }

    pub fn fine_voxel_width(&self) -> f32 {
        self.coarse_voxel_width / self.fine_grid_dimension as f32
    }

    pub fn fine_voxels_per_slot(&self) -> u32 {
        let dim = self.fine_grid_dimension;
        dim * dim * dim
    }
}
