//! Read-only handle over a finished structure, handed to query consumers.

use glam::Vec3;

use moltrace_core::grid::VoxelGrid;
use moltrace_core::types::{Atom, AtomId, VoxelCoords};
use moltrace_core::ElementTable;

use crate::allocator::SlotAllocator;
use crate::atoms::AtomTable;
use crate::memory::{FineRange, MemorySlots, SlotHeader};

/// Borrowing the builder immutably keeps queries and rebuilds from interleaving.
#[derive(Clone, Copy)]
pub struct StructureView<'a> {
    pub(crate) grid: &'a VoxelGrid,
    pub(crate) elements: &'a ElementTable,
    pub(crate) atoms: &'a AtomTable,
    pub(crate) allocator: &'a SlotAllocator,
    pub(crate) memory: &'a MemorySlots,
    pub(crate) frame_id: u32,
}

/// Host copy of one voxel's slot.
#[derive(Debug, Clone, PartialEq)]
pub struct SlotContents {
    pub slot: u32,
    pub header: SlotHeader,
    pub atom_ids: Vec<AtomId>,
    pub fine_ranges: Vec<FineRange>,
}

impl<'a> StructureView<'a> {
    pub fn grid(&self) -> &'a VoxelGrid {
        self.grid
    }

    pub fn elements(&self) -> &'a ElementTable {
        self.elements
    }

    /// Frame whose rebuild produced this structure.
    pub fn frame_id(&self) -> u32 {
        self.frame_id
    }

    pub fn slot_of(&self, coords: VoxelCoords) -> Option<u32> {
        if !self.grid.in_bounds(coords) {
            return None;
        }
        self.allocator.assigned_slot(self.grid.dense_index(coords))
    }

    /// True if any voxel of the coarse voxel's group owns a slot.
    pub fn group_occupied(&self, coords: VoxelCoords) -> bool {
        self.grid.in_bounds(coords)
            && self.allocator.group_slot_count(self.grid.group_index(coords)) > 0
    }

    pub fn header(&self, slot: u32) -> SlotHeader {
        self.memory.header(slot)
    }

    pub fn fine_range(&self, slot: u32, fine: u32) -> FineRange {
        self.memory.fine_range(slot, fine)
    }

    /// Atom ID referenced at `index` of a fine range.
    pub fn reference(&self, slot: u32, index: u32) -> AtomId {
        let local = self.memory.small_ref(slot, index);
        self.memory.large_ref(slot, local as u32)
    }

    pub fn atom(&self, id: AtomId) -> Option<Atom> {
        self.atoms.get(id)
    }

    /// Slots of overflowed or skipped voxels may still name atoms removed
    /// since their last commit; those must be ignored.
    pub fn is_occupied(&self, id: AtomId) -> bool {
        id < self.atoms.capacity() && self.atoms.is_occupied(id)
    }

    pub fn position(&self, id: AtomId) -> Vec3 {
        self.atoms.position(id)
    }

    pub fn radius(&self, id: AtomId) -> f32 {
        self.elements.radius(self.atoms.element(id))
    }

    pub fn slot_contents(&self, coords: VoxelCoords) -> Option<SlotContents> {
        let slot = self.slot_of(coords)?;
        let fine_count = self.memory.fine_count() as u32;
        Some(SlotContents {
            slot,
            header: self.memory.header(slot),
            atom_ids: self.memory.atom_ids(slot),
            fine_ranges: (0..fine_count)
                .map(|f| self.memory.fine_range(slot, f))
                .collect(),
        })
    }

    pub fn atom_count(&self, coords: VoxelCoords) -> u32 {
        self.slot_of(coords)
            .map(|slot| self.memory.header(slot).atom_count)
            .unwrap_or(0)
    }
}
