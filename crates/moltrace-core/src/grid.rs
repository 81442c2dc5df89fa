//! Voxel Grid Indexer: pure addressing math between world positions,
//! coarse voxels, fine voxels and flat indices.

use glam::{IVec3, UVec3, Vec3};

use crate::config::WorldConfig;
use crate::constants::{ENCODED_AXIS_BITS, VOXEL_GROUP_SIZE};
use crate::types::VoxelCoords;

const AXIS_MASK: u32 = (1 << ENCODED_AXIS_BITS) - 1;

/// Row-major flattening of a non-negative 3D coordinate within a cube of `dimension`.
pub fn linear_address(coords: IVec3, dimension: u32) -> u32 {
    debug_assert!(coords.cmpge(IVec3::ZERO).all());
    debug_assert!(coords.cmplt(IVec3::splat(dimension as i32)).all());
    let d = dimension;
    coords.z as u32 * d * d + coords.y as u32 * d + coords.x as u32
}

/// Inverse of [`linear_address`].
pub fn delinearize(address: u32, dimension: u32) -> IVec3 {
    let d = dimension;
    IVec3::new(
        (address % d) as i32,
        ((address / d) % d) as i32,
        (address / (d * d)) as i32,
    )
}

/// Addressing for one world configuration. Copyable, holds no mutable state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VoxelGrid {
    origin: Vec3,
    coarse_width: f32,
    dimension: u32,
    fine_dimension: u32,
    fine_width: f32,
}

impl VoxelGrid {
    pub fn new(config: &WorldConfig) -> Self {
        Self {
            origin: Vec3::from_array(config.origin),
            coarse_width: config.coarse_voxel_width,
            dimension: config.grid_dimension(),
            fine_dimension: config.fine_grid_dimension,
            fine_width: config.fine_voxel_width(),
        }
    }

    /// Coarse voxels along each axis.
    pub fn dimension(&self) -> u32 {
        self.dimension
    }

    pub fn voxel_count(&self) -> u32 {
        self.dimension * self.dimension * self.dimension
    }

    pub fn fine_dimension(&self) -> u32 {
        self.fine_dimension
    }

    pub fn fine_voxel_count(&self) -> u32 {
        self.fine_dimension * self.fine_dimension * self.fine_dimension
    }

    pub fn coarse_width(&self) -> f32 {
        self.coarse_width
    }

    pub fn fine_width(&self) -> f32 {
        self.fine_width
    }

    pub fn origin(&self) -> Vec3 {
        self.origin
    }

    fn half(&self) -> i32 {
        (self.dimension / 2) as i32
    }

    /// Lower corner of the world cube.
    pub fn world_min(&self) -> Vec3 {
        self.origin - Vec3::splat(self.half() as f32 * self.coarse_width)
    }

    /// Upper corner of the world cube (exclusive).
    pub fn world_max(&self) -> Vec3 {
        self.origin + Vec3::splat(self.half() as f32 * self.coarse_width)
    }

    pub fn contains_position(&self, position: Vec3) -> bool {
        position.cmpge(self.world_min()).all() && position.cmplt(self.world_max()).all()
    }

    pub fn in_bounds(&self, coords: VoxelCoords) -> bool {
        let h = self.half();
        coords.cmpge(IVec3::splat(-h)).all() && coords.cmplt(IVec3::splat(h)).all()
    }

    /// Floor-divide by the coarse width, relative to the world center.
    pub fn coarse_voxel_of(&self, position: Vec3) -> VoxelCoords {
        ((position - self.origin) / self.coarse_width)
            .floor()
            .as_ivec3()
    }

    pub fn voxel_lower_corner(&self, coords: VoxelCoords) -> Vec3 {
        self.origin + coords.as_vec3() * self.coarse_width
    }

    /// Fine voxel of a position expressed relative to its coarse voxel's lower corner.
    pub fn fine_voxel_of(&self, position_within_coarse: Vec3) -> IVec3 {
        let max = self.fine_dimension as i32 - 1;
        (position_within_coarse / self.fine_width)
            .floor()
            .as_ivec3()
            .clamp(IVec3::ZERO, IVec3::splat(max))
    }

    /// Non-negative grid indices of an in-bounds voxel.
    pub fn grid_indices(&self, coords: VoxelCoords) -> UVec3 {
        (coords + IVec3::splat(self.half())).as_uvec3()
    }

    pub fn coords_of_indices(&self, indices: UVec3) -> VoxelCoords {
        indices.as_ivec3() - IVec3::splat(self.half())
    }

    /// Pack voxel coordinates into one word: `z << 20 | y << 10 | x` on grid indices.
    pub fn encode(&self, coords: VoxelCoords) -> u32 {
        let g = self.grid_indices(coords);
        (g.z << (2 * ENCODED_AXIS_BITS)) | (g.y << ENCODED_AXIS_BITS) | g.x
    }

    pub fn decode(&self, encoded: u32) -> VoxelCoords {
        let g = UVec3::new(
            encoded & AXIS_MASK,
            (encoded >> ENCODED_AXIS_BITS) & AXIS_MASK,
            (encoded >> (2 * ENCODED_AXIS_BITS)) & AXIS_MASK,
        );
        self.coords_of_indices(g)
    }

    /// Index into dense per-voxel arrays.
    pub fn dense_index(&self, coords: VoxelCoords) -> u32 {
        linear_address(self.grid_indices(coords).as_ivec3(), self.dimension)
    }

    pub fn coords_of_dense_index(&self, index: u32) -> VoxelCoords {
        self.coords_of_indices(delinearize(index, self.dimension).as_uvec3())
    }

    /// Voxel groups along each axis.
    pub fn group_dimension(&self) -> u32 {
        self.dimension / VOXEL_GROUP_SIZE
    }

    pub fn group_count(&self) -> u32 {
        let d = self.group_dimension();
        d * d * d
    }

    /// Dense index of the voxel group containing `coords`.
    pub fn group_index(&self, coords: VoxelCoords) -> u32 {
        let g = self.grid_indices(coords).as_ivec3() / VOXEL_GROUP_SIZE as i32;
        linear_address(g, self.group_dimension())
    }

    /// Index of a fine voxel within its coarse voxel.
    pub fn fine_address(&self, fine: IVec3) -> u32 {
        linear_address(fine, self.fine_dimension)
    }
}
