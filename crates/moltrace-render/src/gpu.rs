//! GPU mirror of the structure, read by the ray-query kernel.
//!
//! Buffers are allocated once from the world configuration. After each
//! frame only the slots rebuilt that frame, the assignment-map entries of
//! dirty voxels, their group counters, and every atom the transaction
//! touched are written. Removed atoms are rewritten with the occupancy bit
//! clear so stale slot lists cannot reach them. Small references are
//! stored two per word, low half first.

use moltrace_bvh::{BvhBuilder, FrameReport};
use moltrace_core::types::{GpuAtom, Transaction};

use moltrace_bvh::memory::MemorySlots;

/// Per-slot strides of the GPU buffers, in 32-bit words.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotLayout {
    pub header_words: u32,
    pub large_words: u32,
    pub small_words: u32,
}

impl SlotLayout {
    pub fn of(memory: &MemorySlots) -> Self {
        Self {
            header_words: memory.header_stride() as u32,
            large_words: memory.large_capacity() as u32,
            small_words: memory.small_capacity().div_ceil(2) as u32,
        }
    }

    pub fn header_byte_offset(&self, slot: u32) -> u64 {
        slot as u64 * self.header_words as u64 * 4
    }

    pub fn large_byte_offset(&self, slot: u32) -> u64 {
        slot as u64 * self.large_words as u64 * 4
    }

    pub fn small_byte_offset(&self, slot: u32) -> u64 {
        slot as u64 * self.small_words as u64 * 4
    }
}

/// Pack 16-bit references two per word, the even index in the low half.
pub fn pack_u16_pairs(values: &[u16]) -> Vec<u32> {
    let mut words = vec![0u32; values.len().div_ceil(2)];
    for (i, &v) in values.iter().enumerate() {
        words[i / 2] |= (v as u32) << (16 * (i % 2));
    }
    words
}

/// Sort and dedup `indices`, returning `(start, len)` runs of consecutive values.
pub fn contiguous_runs(indices: &mut Vec<u32>) -> Vec<(u32, u32)> {
    indices.sort_unstable();
    indices.dedup();
    let mut runs: Vec<(u32, u32)> = Vec::new();
    for &i in indices.iter() {
        match runs.last_mut() {
            Some((start, len)) if *start + *len == i => *len += 1,
            _ => runs.push((i, 1)),
        }
    }
    runs
}

pub struct StructureBuffers {
    assigned_slots: wgpu::Buffer,
    group_counts: wgpu::Buffer,
    headers: wgpu::Buffer,
    large_refs: wgpu::Buffer,
    small_refs: wgpu::Buffer,
    atoms: wgpu::Buffer,
    layout: SlotLayout,
}

fn storage_buffer(device: &wgpu::Device, label: &'static str, size: u64) -> wgpu::Buffer {
    let max = device.limits().max_storage_buffer_binding_size as u64;
    if size > max {
        log::warn!(
            "StructureBuffers: '{}' needs {} bytes, device binding limit is {}",
            label,
            size,
            max
        );
    }
    device.create_buffer(&wgpu::BufferDescriptor {
        label: Some(label),
        size: size.max(4),
        usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
        mapped_at_creation: false,
    })
}

impl StructureBuffers {
    pub fn new(device: &wgpu::Device, builder: &BvhBuilder) -> Self {
        let grid = builder.grid();
        let memory = builder.memory();
        let layout = SlotLayout::of(memory);
        let slots = memory.slot_count() as u64;

        let assigned_bytes = grid.voxel_count() as u64 * 4;
        let group_bytes = grid.group_count() as u64 * 4;
        let header_bytes = slots * layout.header_words as u64 * 4;
        let large_bytes = slots * layout.large_words as u64 * 4;
        let small_bytes = slots * layout.small_words as u64 * 4;
        let atom_bytes = builder.atoms().capacity() as u64 * std::mem::size_of::<GpuAtom>() as u64;

        log::info!(
            "StructureBuffers: {} slots, {} MB slot memory, {} MB atoms",
            slots,
            (header_bytes + large_bytes + small_bytes) / (1024 * 1024),
            atom_bytes / (1024 * 1024),
        );

        Self {
            assigned_slots: storage_buffer(device, "assigned-slots", assigned_bytes),
            group_counts: storage_buffer(device, "group-slot-counts", group_bytes),
            headers: storage_buffer(device, "slot-headers", header_bytes),
            large_refs: storage_buffer(device, "large-refs", large_bytes),
            small_refs: storage_buffer(device, "small-refs", small_bytes),
            atoms: storage_buffer(device, "atoms", atom_bytes),
            layout,
        }
    }

    pub fn layout(&self) -> SlotLayout {
        self.layout
    }

    pub fn assigned_slots(&self) -> &wgpu::Buffer {
        &self.assigned_slots
    }

    pub fn group_counts(&self) -> &wgpu::Buffer {
        &self.group_counts
    }

    pub fn headers(&self) -> &wgpu::Buffer {
        &self.headers
    }

    pub fn large_refs(&self) -> &wgpu::Buffer {
        &self.large_refs
    }

    pub fn small_refs(&self) -> &wgpu::Buffer {
        &self.small_refs
    }

    pub fn atoms(&self) -> &wgpu::Buffer {
        &self.atoms
    }

    /// Write the whole structure. Used at startup and after a full rebuild.
    pub fn upload_all(&self, queue: &wgpu::Queue, builder: &BvhBuilder) {
        let allocator = builder.allocator();
        queue.write_buffer(
            &self.assigned_slots,
            0,
            bytemuck::cast_slice(&allocator.assigned_slot_ids().snapshot()),
        );
        queue.write_buffer(
            &self.group_counts,
            0,
            bytemuck::cast_slice(&allocator.group_slot_counts().snapshot()),
        );
        queue.write_buffer(&self.atoms, 0, bytemuck::cast_slice(&builder.atoms().gpu_atoms()));
        for slot in 0..allocator.slot_count() {
            if allocator.slot_owner(slot).is_some() {
                self.upload_slot(queue, builder.memory(), slot);
            }
        }
    }

    /// Write what one frame changed.
    pub fn upload_frame(
        &self,
        queue: &wgpu::Queue,
        builder: &BvhBuilder,
        tx: &Transaction,
        report: &FrameReport,
    ) {
        let grid = builder.grid();
        let allocator = builder.allocator();

        let mut dense = report.dirty_voxels.clone();
        for (start, len) in contiguous_runs(&mut dense) {
            let entries = allocator
                .assigned_slot_ids()
                .read_range(start as usize, len as usize);
            queue.write_buffer(&self.assigned_slots, start as u64 * 4, bytemuck::cast_slice(&entries));
        }

        let mut groups: Vec<u32> = report
            .dirty_voxels
            .iter()
            .map(|&d| grid.group_index(grid.coords_of_dense_index(d)))
            .collect();
        for (start, len) in contiguous_runs(&mut groups) {
            let counts = allocator
                .group_slot_counts()
                .read_range(start as usize, len as usize);
            queue.write_buffer(&self.group_counts, start as u64 * 4, bytemuck::cast_slice(&counts));
        }

        let mut ids = touched_atoms(tx);
        let stride = std::mem::size_of::<GpuAtom>() as u64;
        for (start, len) in contiguous_runs(&mut ids) {
            let records: Vec<GpuAtom> = (start..start + len)
                .map(|id| builder.atoms().mirror_record(id))
                .collect();
            queue.write_buffer(&self.atoms, start as u64 * stride, bytemuck::cast_slice(&records));
        }

        for &slot in &report.rebuilt_slots {
            self.upload_slot(queue, builder.memory(), slot);
        }
    }

    fn upload_slot(&self, queue: &wgpu::Queue, memory: &MemorySlots, slot: u32) {
        let header = memory.header(slot);
        let stride = memory.header_stride();
        let words = memory
            .headers_buffer()
            .read_range(slot as usize * stride, stride);
        queue.write_buffer(
            &self.headers,
            self.layout.header_byte_offset(slot),
            bytemuck::cast_slice(&words),
        );

        if header.large_count > 0 {
            let large = memory.atom_ids(slot);
            queue.write_buffer(
                &self.large_refs,
                self.layout.large_byte_offset(slot),
                bytemuck::cast_slice(&large),
            );
        }
        if header.small_count > 0 {
            let small = memory.small_buffer().read_range(
                slot as usize * memory.small_capacity(),
                header.small_count as usize,
            );
            queue.write_buffer(
                &self.small_refs,
                self.layout.small_byte_offset(slot),
                bytemuck::cast_slice(&pack_u16_pairs(&small)),
            );
        }
    }
}

/// Atoms whose mirror record changes: removals clear the occupancy bit.
fn touched_atoms(tx: &Transaction) -> Vec<u32> {
    tx.removed_ids
        .iter()
        .chain(&tx.moved_ids)
        .chain(&tx.added_ids)
        .copied()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use moltrace_core::WorldConfig;

    #[test]
    fn test_pack_pairs_low_half_first() {
        assert_eq!(pack_u16_pairs(&[1, 2, 3]), vec![0x0002_0001, 0x0000_0003]);
        assert!(pack_u16_pairs(&[]).is_empty());
    }

    #[test]
    fn test_contiguous_runs() {
        let mut v = vec![7, 3, 4, 5, 9, 3, 10];
        assert_eq!(contiguous_runs(&mut v), vec![(3, 3), (7, 1), (9, 2)]);
        assert!(contiguous_runs(&mut Vec::new()).is_empty());
    }

    #[test]
    fn test_removed_atoms_are_reuploaded() {
        let mut tx = Transaction::default();
        tx.remove(4);
        tx.add(5, moltrace_core::types::Atom::new(glam::Vec3::ZERO, 6));
        let mut ids = touched_atoms(&tx);
        assert_eq!(contiguous_runs(&mut ids), vec![(4, 2)]);
    }

    #[test]
    fn test_layout_rounds_small_list_to_words() {
        let config = WorldConfig {
            world_dimension: 16.0,
            memory_slot_count: 2,
            max_references_per_slot: 1001,
            ..WorldConfig::default()
        };
        let memory = MemorySlots::new(&config);
        let layout = SlotLayout::of(&memory);
        assert_eq!(layout.small_words, 501);
        assert_eq!(layout.header_words, 4 + 512);
        assert_eq!(layout.small_byte_offset(1), 501 * 4);
        assert_eq!(layout.large_byte_offset(2), 2 * 3072 * 4);
    }
}
