//! Memory slot pool: fixed-size regions holding one coarse voxel's references.
//!
//! Per slot:
//!   header words   [atom_count, large_count, small_count, reserved, fine_header * F]
//!   large list     u32 atom IDs, `max_atoms_per_voxel` entries
//!   small list     u16 indices into the large list, `max_references_per_slot` entries
//!
//! A fine header packs `offset_begin | offset_end << 16`; zero marks an empty fine voxel.

use moltrace_core::WorldConfig;

use crate::compute::{DeviceBuffer, DeviceBuffer16};

pub const SLOT_HEADER_WORDS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SlotHeader {
    pub atom_count: u32,
    /// Entries in the large (32-bit) list.
    pub large_count: u32,
    /// Entries in the small (16-bit) list.
    pub small_count: u32,
}

/// Range of a fine voxel in its slot's small list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FineRange {
    pub begin: u16,
    pub end: u16,
}

impl FineRange {
    pub fn pack(self) -> u32 {
        self.begin as u32 | ((self.end as u32) << 16)
    }

    pub fn unpack(word: u32) -> Self {
        Self {
            begin: (word & 0xFFFF) as u16,
            end: (word >> 16) as u16,
        }
    }

    pub fn len(&self) -> u32 {
        self.end.saturating_sub(self.begin) as u32
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.begin
    }
}

/// Host copy of one slot, comparable byte for byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotSnapshot {
    pub header_words: Vec<u32>,
    pub large: Vec<u32>,
    pub small: Vec<u16>,
}

pub struct MemorySlots {
    headers: DeviceBuffer,
    large: DeviceBuffer,
    small: DeviceBuffer16,
    slot_count: u32,
    fine_count: usize,
    header_stride: usize,
    large_stride: usize,
    small_stride: usize,
}

impl MemorySlots {
    pub fn new(config: &WorldConfig) -> Self {
        let slot_count = config.memory_slot_count;
        let fine_count = config.fine_voxels_per_slot() as usize;
        let header_stride = SLOT_HEADER_WORDS + fine_count;
        let large_stride = config.max_atoms_per_voxel as usize;
        let small_stride = config.max_references_per_slot as usize;
        let n = slot_count as usize;
        let slots = Self {
            headers: DeviceBuffer::new("slot_headers", n * header_stride),
            large: DeviceBuffer::new("slot_references_32", n * large_stride),
            small: DeviceBuffer16::new("slot_references_16", n * small_stride),
            slot_count,
            fine_count,
            header_stride,
            large_stride,
            small_stride,
        };
        log::info!(
            "MemorySlots: {} slots, {} fine voxels each, {:.1} MB",
            slot_count,
            fine_count,
            slots.size_bytes() as f64 / (1024.0 * 1024.0)
        );
        slots
    }

    pub fn slot_count(&self) -> u32 {
        self.slot_count
    }

    pub fn fine_count(&self) -> usize {
        self.fine_count
    }

    pub fn header_stride(&self) -> usize {
        self.header_stride
    }

    pub fn large_capacity(&self) -> usize {
        self.large_stride
    }

    pub fn small_capacity(&self) -> usize {
        self.small_stride
    }

    pub fn size_bytes(&self) -> u64 {
        self.headers.size_bytes() + self.large.size_bytes() + self.small.size_bytes()
    }

    pub fn headers_buffer(&self) -> &DeviceBuffer {
        &self.headers
    }

    pub fn large_buffer(&self) -> &DeviceBuffer {
        &self.large
    }

    pub fn small_buffer(&self) -> &DeviceBuffer16 {
        &self.small
    }

    fn header_base(&self, slot: u32) -> usize {
        debug_assert!(slot < self.slot_count, "slot {slot} out of range");
        slot as usize * self.header_stride
    }

    pub fn header(&self, slot: u32) -> SlotHeader {
        let base = self.header_base(slot);
        SlotHeader {
            atom_count: self.headers.load(base),
            large_count: self.headers.load(base + 1),
            small_count: self.headers.load(base + 2),
        }
    }

    pub(crate) fn write_header(&self, slot: u32, header: SlotHeader) {
        let base = self.header_base(slot);
        self.headers.store(base, header.atom_count);
        self.headers.store(base + 1, header.large_count);
        self.headers.store(base + 2, header.small_count);
    }

    pub fn fine_range(&self, slot: u32, fine: u32) -> FineRange {
        debug_assert!((fine as usize) < self.fine_count);
        let base = self.header_base(slot) + SLOT_HEADER_WORDS;
        FineRange::unpack(self.headers.load(base + fine as usize))
    }

    pub(crate) fn write_fine_word(&self, slot: u32, fine: u32, word: u32) {
        debug_assert!((fine as usize) < self.fine_count);
        let base = self.header_base(slot) + SLOT_HEADER_WORDS;
        self.headers.store(base + fine as usize, word);
    }

    pub fn large_ref(&self, slot: u32, index: u32) -> u32 {
        debug_assert!((index as usize) < self.large_stride);
        self.large
            .load(slot as usize * self.large_stride + index as usize)
    }

    pub(crate) fn write_large_ref(&self, slot: u32, index: u32, atom_id: u32) {
        debug_assert!((index as usize) < self.large_stride, "large list overrun");
        self.large
            .store(slot as usize * self.large_stride + index as usize, atom_id);
    }

    pub fn small_ref(&self, slot: u32, index: u32) -> u16 {
        debug_assert!((index as usize) < self.small_stride);
        self.small
            .load(slot as usize * self.small_stride + index as usize)
    }

    pub(crate) fn write_small_ref(&self, slot: u32, index: u32, local: u16) {
        debug_assert!((index as usize) < self.small_stride, "small list overrun");
        self.small
            .store(slot as usize * self.small_stride + index as usize, local);
    }

    /// Atom IDs in the slot's large list.
    pub fn atom_ids(&self, slot: u32) -> Vec<u32> {
        let count = self.header(slot).large_count as usize;
        self.large
            .read_range(slot as usize * self.large_stride, count)
    }

    /// Atom IDs referenced by one fine voxel.
    pub fn fine_atom_ids(&self, slot: u32, fine: u32) -> Vec<u32> {
        let range = self.fine_range(slot, fine);
        (range.begin..range.end)
            .map(|i| self.large_ref(slot, self.small_ref(slot, i as u32) as u32))
            .collect()
    }

    /// Zero the header region so the slot reads as empty.
    pub(crate) fn clear(&self, slot: u32) {
        let base = self.header_base(slot);
        for i in 0..self.header_stride {
            self.headers.store(base + i, 0);
        }
    }

    pub fn snapshot(&self, slot: u32) -> SlotSnapshot {
        SlotSnapshot {
            header_words: self
                .headers
                .read_range(self.header_base(slot), self.header_stride),
            large: self
                .large
                .read_range(slot as usize * self.large_stride, self.large_stride),
            small: self
                .small
                .read_range(slot as usize * self.small_stride, self.small_stride),
        }
    }
}
