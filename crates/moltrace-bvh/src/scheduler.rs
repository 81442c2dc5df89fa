//! Rebuild scheduler: dirty marks and compaction into the per-frame work list.
//!
//! Dirty bits are stored group-major: each voxel group of 4x4x4 coarse
//! voxels owns two consecutive 32-bit words. Marking a voxel also marks its
//! group, and the first marker of a group appends it to the group list, so
//! compaction only visits groups touched this frame.

use glam::IVec3;

use moltrace_core::constants::{VOXELS_PER_GROUP, VOXEL_GROUP_SIZE};
use moltrace_core::grid::{delinearize, linear_address, VoxelGrid};
use moltrace_core::types::VoxelCoords;

use crate::compute::{dispatch, DeviceBuffer};

const WORDS_PER_GROUP: usize = (VOXELS_PER_GROUP / 32) as usize;

pub struct RebuildScheduler {
    grid: VoxelGrid,
    dirty_bits: DeviceBuffer,
    group_marks: DeviceBuffer,
    group_list: DeviceBuffer,
    group_list_count: DeviceBuffer,
    /// Encoded coordinates of dirty voxels; the count word is the indirect dispatch argument.
    work_list: DeviceBuffer,
    work_count: DeviceBuffer,
}

impl RebuildScheduler {
    pub fn new(grid: VoxelGrid) -> Self {
        let groups = grid.group_count() as usize;
        let voxels = grid.voxel_count() as usize;
        Self {
            grid,
            dirty_bits: DeviceBuffer::new("dirty_bits", groups * WORDS_PER_GROUP),
            group_marks: DeviceBuffer::new("group_marks", groups),
            group_list: DeviceBuffer::new("dirty_groups", groups),
            group_list_count: DeviceBuffer::new("dirty_group_count", 1),
            work_list: DeviceBuffer::new("work_list", voxels),
            work_count: DeviceBuffer::new("work_count", 1),
        }
    }

    fn bit_address(&self, coords: VoxelCoords) -> (u32, usize, u32) {
        let group = self.grid.group_index(coords);
        let local_coords = self.grid.grid_indices(coords).as_ivec3() % VOXEL_GROUP_SIZE as i32;
        let local = linear_address(local_coords, VOXEL_GROUP_SIZE);
        let word = group as usize * WORDS_PER_GROUP + (local / 32) as usize;
        (group, word, 1 << (local % 32))
    }

    /// Flag a voxel for rebuild. Safe to call from many workers at once.
    pub fn mark(&self, coords: VoxelCoords) {
        debug_assert!(self.grid.in_bounds(coords));
        let (group, word, bit) = self.bit_address(coords);
        self.dirty_bits.fetch_or(word, bit);
        if self.group_marks.fetch_or(group as usize, 1) == 0 {
            let slot = self.group_list_count.fetch_add(0, 1);
            self.group_list.store(slot as usize, group);
        }
    }

    pub fn is_marked(&self, coords: VoxelCoords) -> bool {
        let (_, word, bit) = self.bit_address(coords);
        self.dirty_bits.load(word) & bit != 0
    }

    /// Compact marked voxels into the work list. Returns the work count.
    ///
    /// One worker per touched group: it counts its dirty bits, reserves a
    /// run of the work list with one fetch-add, and writes its voxels there.
    pub fn compact(&self) -> u32 {
        self.work_count.store(0, 0);
        let group_dim = self.grid.group_dimension();
        dispatch(self.group_list_count.load(0), |i| {
            let group = self.group_list.load(i as usize);
            let base_word = group as usize * WORDS_PER_GROUP;
            let words: [u32; WORDS_PER_GROUP] =
                std::array::from_fn(|w| self.dirty_bits.load(base_word + w));
            let total: u32 = words.iter().map(|w| w.count_ones()).sum();
            if total == 0 {
                return;
            }
            let mut offset = self.work_count.fetch_add(0, total);
            let group_origin = delinearize(group, group_dim) * VOXEL_GROUP_SIZE as i32;
            for (w, &bits) in words.iter().enumerate() {
                let mut remaining = bits;
                while remaining != 0 {
                    let bit = remaining.trailing_zeros();
                    remaining &= remaining - 1;
                    let local = w as u32 * 32 + bit;
                    let indices = group_origin + delinearize(local, VOXEL_GROUP_SIZE);
                    let coords = self.grid.coords_of_indices(indices.as_uvec3());
                    self.work_list.store(offset as usize, self.grid.encode(coords));
                    offset += 1;
                }
            }
        });
        self.work_count.load(0)
    }

    pub fn work_count(&self) -> u32 {
        self.work_count.load(0)
    }

    /// Encoded coordinates of this frame's dirty voxels, in unspecified order.
    pub fn work_list(&self) -> Vec<u32> {
        self.work_list.read_range(0, self.work_count() as usize)
    }

    pub fn dirty_voxels(&self) -> Vec<VoxelCoords> {
        self.work_list()
            .into_iter()
            .map(|encoded| self.grid.decode(encoded))
            .collect()
    }

    /// Dense indices of groups touched this frame.
    pub fn touched_groups(&self) -> Vec<u32> {
        self.group_list
            .read_range(0, self.group_list_count.load(0) as usize)
    }

    /// Clear marks of the groups touched since the last reset.
    pub fn reset(&self) {
        dispatch(self.group_list_count.load(0), |i| {
            let group = self.group_list.load(i as usize);
            for w in 0..WORDS_PER_GROUP {
                self.dirty_bits.store(group as usize * WORDS_PER_GROUP + w, 0);
            }
            self.group_marks.store(group as usize, 0);
        });
        self.group_list_count.store(0, 0);
        self.work_count.store(0, 0);
    }
}

/// Coarse voxel of a group-local offset; exposed for traversal code.
pub fn group_voxel(grid: &VoxelGrid, group: u32, local: IVec3) -> VoxelCoords {
    let origin = delinearize(group, grid.group_dimension()) * VOXEL_GROUP_SIZE as i32;
    grid.coords_of_indices((origin + local).as_uvec3())
}

#[cfg(test)]
mod tests {
    use super::*;
    use moltrace_core::WorldConfig;
    use std::collections::HashSet;

    fn grid() -> VoxelGrid {
        VoxelGrid::new(&WorldConfig {
            world_dimension: 32.0,
            ..WorldConfig::default()
        })
    }

    #[test]
    fn test_mark_and_compact() {
        let scheduler = RebuildScheduler::new(grid());
        let voxels = [
            IVec3::new(0, 0, 0),
            IVec3::new(1, 0, 0),
            IVec3::new(-8, -8, -8),
            IVec3::new(7, 7, 7),
        ];
        for v in voxels {
            scheduler.mark(v);
        }
        // Duplicate marks collapse.
        scheduler.mark(IVec3::ZERO);
        assert_eq!(scheduler.compact(), 4);
        let got: HashSet<_> = scheduler.dirty_voxels().into_iter().collect();
        let want: HashSet<_> = voxels.into_iter().collect();
        assert_eq!(got, want);
        assert_eq!(scheduler.touched_groups().len(), 3);
    }

    #[test]
    fn test_concurrent_marks() {
        let grid = grid();
        let scheduler = RebuildScheduler::new(grid);
        dispatch(grid.voxel_count() * 2, |i| {
            let coords = grid.coords_of_dense_index(i % grid.voxel_count());
            if coords.x % 3 == 0 {
                scheduler.mark(coords);
            }
        });
        let expected = (0..grid.voxel_count())
            .filter(|&i| grid.coords_of_dense_index(i).x % 3 == 0)
            .count() as u32;
        assert_eq!(scheduler.compact(), expected);
        let unique: HashSet<_> = scheduler.work_list().into_iter().collect();
        assert_eq!(unique.len() as u32, expected);
        assert_eq!(scheduler.touched_groups().len() as u32, grid.group_count());
    }

    #[test]
    fn test_reset_clears_everything() {
        let scheduler = RebuildScheduler::new(grid());
        scheduler.mark(IVec3::new(3, -2, 1));
        scheduler.compact();
        scheduler.reset();
        assert!(!scheduler.is_marked(IVec3::new(3, -2, 1)));
        assert_eq!(scheduler.work_count(), 0);
        assert!(scheduler.touched_groups().is_empty());
        assert_eq!(scheduler.compact(), 0);
    }

    #[test]
    fn test_empty_frame_compacts_to_nothing() {
        let scheduler = RebuildScheduler::new(grid());
        assert_eq!(scheduler.compact(), 0);
        assert!(scheduler.dirty_voxels().is_empty());
    }

    #[test]
    fn test_group_voxel() {
        let grid = grid();
        let coords = IVec3::new(5, -3, 0);
        let group = grid.group_index(coords);
        let local = grid.grid_indices(coords).as_ivec3() % 4;
        assert_eq!(group_voxel(&grid, group, local), coords);
    }
}
