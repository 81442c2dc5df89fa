//! Per-frame compute passes. Each `dispatch_*` function is one dispatch;
//! consecutive calls are separated by the device-wide barrier.

pub mod add;
pub mod rebuild;
pub mod remove;

use moltrace_core::grid::VoxelGrid;
use moltrace_core::types::{Atom, AtomId};
use moltrace_core::{ElementTable, WorldConfig};

use crate::allocator::SlotAllocator;
use crate::atoms::AtomTable;
use crate::crash::CrashBuffer;
use crate::memory::MemorySlots;
use crate::scheduler::RebuildScheduler;

pub use add::Binning;
pub use rebuild::{VoxelBuild, VoxelStatus};

/// Everything a pass may touch during one frame.
pub struct FrameContext<'a> {
    pub config: &'a WorldConfig,
    pub grid: &'a VoxelGrid,
    pub elements: &'a ElementTable,
    pub atoms: &'a AtomTable,
    pub allocator: &'a SlotAllocator,
    pub scheduler: &'a RebuildScheduler,
    pub memory: &'a MemorySlots,
    pub crash: &'a CrashBuffer,
    pub binning: &'a Binning,
    pub frame_id: u32,
}

/// Host-written copy of one frame's transaction. Moved entries precede
/// added entries in the inserted arrays.
#[derive(Debug, Clone, Default)]
pub struct TransactionUpload {
    pub removed_ids: Vec<AtomId>,
    pub inserted_ids: Vec<AtomId>,
    pub inserted_atoms: Vec<Atom>,
    pub moved_count: usize,
}

impl TransactionUpload {
    pub fn clear(&mut self) {
        self.removed_ids.clear();
        self.inserted_ids.clear();
        self.inserted_atoms.clear();
        self.moved_count = 0;
    }

    pub fn moved_ids(&self) -> &[AtomId] {
        &self.inserted_ids[..self.moved_count]
    }

    pub fn added_count(&self) -> usize {
        self.inserted_ids.len() - self.moved_count
    }
}
