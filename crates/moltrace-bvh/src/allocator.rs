//! Memory slot allocator: keeps "voxel has atoms" and "voxel owns one slot" in bijection.
//!
//! Releases and claims run in separate passes. Within a release pass the
//! free-list cursor only grows; within a claim pass it only shrinks, so the
//! compare-and-swap pop cannot observe a recycled entry.

use moltrace_core::constants::UNASSIGNED_SLOT;

use crate::compute::DeviceBuffer;

pub struct SlotAllocator {
    /// Per coarse voxel (dense index): slot ID or `UNASSIGNED_SLOT`.
    assigned_slot_ids: DeviceBuffer,
    /// Per slot: dense index of the owning voxel or `UNASSIGNED_SLOT`.
    slot_owners: DeviceBuffer,
    /// Per voxel group: number of member voxels that own a slot.
    group_slot_counts: DeviceBuffer,
    free_list: DeviceBuffer,
    /// Number of valid entries at the front of `free_list`.
    free_cursor: DeviceBuffer,
    slot_count: u32,
}

impl SlotAllocator {
    pub fn new(slot_count: u32, voxel_count: u32, group_count: u32) -> Self {
        let allocator = Self {
            assigned_slot_ids: DeviceBuffer::filled(
                "assigned_slot_ids",
                voxel_count as usize,
                UNASSIGNED_SLOT,
            ),
            slot_owners: DeviceBuffer::filled("slot_owners", slot_count as usize, UNASSIGNED_SLOT),
            group_slot_counts: DeviceBuffer::new("group_slot_counts", group_count as usize),
            free_list: DeviceBuffer::new("free_slots", slot_count as usize),
            free_cursor: DeviceBuffer::new("free_cursor", 1),
            slot_count,
        };
        allocator.reset();
        allocator
    }

    /// Return every slot to the pool. Slot 0 is handed out first.
    pub fn reset(&self) {
        self.assigned_slot_ids.fill(UNASSIGNED_SLOT);
        self.slot_owners.fill(UNASSIGNED_SLOT);
        self.group_slot_counts.fill(0);
        for i in 0..self.slot_count {
            self.free_list
                .store(i as usize, self.slot_count - 1 - i);
        }
        self.free_cursor.store(0, self.slot_count);
    }

    pub fn slot_count(&self) -> u32 {
        self.slot_count
    }

    pub fn free_count(&self) -> u32 {
        self.free_cursor.load(0)
    }

    pub fn assigned_count(&self) -> u32 {
        self.slot_count - self.free_count()
    }

    pub fn assigned_slot(&self, dense: u32) -> Option<u32> {
        match self.assigned_slot_ids.load(dense as usize) {
            UNASSIGNED_SLOT => None,
            slot => Some(slot),
        }
    }

    pub fn slot_owner(&self, slot: u32) -> Option<u32> {
        match self.slot_owners.load(slot as usize) {
            UNASSIGNED_SLOT => None,
            dense => Some(dense),
        }
    }

    pub fn group_slot_count(&self, group: u32) -> u32 {
        self.group_slot_counts.load(group as usize)
    }

    pub fn assigned_slot_ids(&self) -> &DeviceBuffer {
        &self.assigned_slot_ids
    }

    pub fn group_slot_counts(&self) -> &DeviceBuffer {
        &self.group_slot_counts
    }

    /// Pop a free slot for `dense`. Only valid inside a claim pass.
    pub(crate) fn claim(&self, dense: u32, group: u32) -> Option<u32> {
        debug_assert!(self.assigned_slot(dense).is_none());
        let mut cursor = self.free_cursor.load(0);
        loop {
            if cursor == 0 {
                return None;
            }
            match self.free_cursor.compare_exchange(0, cursor, cursor - 1) {
                Ok(_) => break,
                Err(actual) => cursor = actual,
            }
        }
        let slot = self.free_list.load(cursor as usize - 1);
        self.assigned_slot_ids.store(dense as usize, slot);
        self.slot_owners.store(slot as usize, dense);
        self.group_slot_counts.fetch_add(group as usize, 1);
        Some(slot)
    }

    /// Push the slot of `dense` back to the pool. Only valid inside a release pass.
    pub(crate) fn release(&self, dense: u32, group: u32) -> Option<u32> {
        let slot = self.assigned_slot(dense)?;
        self.assigned_slot_ids.store(dense as usize, UNASSIGNED_SLOT);
        self.slot_owners.store(slot as usize, UNASSIGNED_SLOT);
        self.group_slot_counts.fetch_sub(group as usize, 1);
        let index = self.free_cursor.fetch_add(0, 1);
        debug_assert!(index < self.slot_count, "free list overflow");
        self.free_list.store(index as usize, slot);
        Some(slot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compute::dispatch;
    use std::collections::HashSet;

    #[test]
    fn test_claim_release_reuse() {
        let allocator = SlotAllocator::new(2, 64, 1);
        assert_eq!(allocator.claim(10, 0), Some(0));
        assert_eq!(allocator.claim(11, 0), Some(1));
        assert_eq!(allocator.claim(12, 0), None);
        assert_eq!(allocator.free_count(), 0);

        assert_eq!(allocator.release(10, 0), Some(0));
        assert_eq!(allocator.assigned_slot(10), None);
        assert_eq!(allocator.slot_owner(0), None);
        assert_eq!(allocator.claim(12, 0), Some(0));
        assert_eq!(allocator.slot_owner(0), Some(12));
        assert_eq!(allocator.group_slot_count(0), 2);
    }

    #[test]
    fn test_release_unassigned_is_noop() {
        let allocator = SlotAllocator::new(2, 8, 1);
        assert_eq!(allocator.release(3, 0), None);
        assert_eq!(allocator.free_count(), 2);
    }

    #[test]
    fn test_concurrent_claims_never_alias() {
        let allocator = SlotAllocator::new(500, 1000, 1);
        dispatch(1000, |dense| {
            allocator.claim(dense, 0);
        });
        let mut seen = HashSet::new();
        let mut assigned = 0;
        for dense in 0..1000 {
            if let Some(slot) = allocator.assigned_slot(dense) {
                assert!(seen.insert(slot), "slot {slot} assigned twice");
                assert_eq!(allocator.slot_owner(slot), Some(dense));
                assigned += 1;
            }
        }
        assert_eq!(assigned, 500);
        assert_eq!(allocator.free_count(), 0);
    }

    #[test]
    fn test_concurrent_release_then_claim() {
        let allocator = SlotAllocator::new(64, 128, 1);
        dispatch(64, |dense| {
            allocator.claim(dense, 0);
        });
        dispatch(32, |dense| {
            allocator.release(dense, 0);
        });
        assert_eq!(allocator.free_count(), 32);
        dispatch(32, |i| {
            allocator.claim(64 + i, 0);
        });
        let slots: HashSet<u32> = (0..128)
            .filter_map(|d| allocator.assigned_slot(d))
            .collect();
        assert_eq!(slots.len(), 64);
    }

    #[test]
    fn test_reset() {
        let allocator = SlotAllocator::new(4, 8, 2);
        allocator.claim(0, 1);
        allocator.reset();
        assert_eq!(allocator.free_count(), 4);
        assert_eq!(allocator.assigned_slot(0), None);
        assert_eq!(allocator.group_slot_count(1), 0);
        assert_eq!(allocator.claim(5, 0), Some(0));
    }
}
