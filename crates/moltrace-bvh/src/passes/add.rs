//! Insert pass and per-voxel binning of inserted atoms.
//!
//! Binning is a histogram, scan and scatter over coarse voxels: each atom
//! takes a relative offset from its voxel's counter, each dirty voxel then
//! reserves a run of the incoming buffer, and each atom writes itself into
//! its voxel's run.

use glam::Vec3;

use moltrace_core::types::AtomId;

use super::{FrameContext, TransactionUpload};
use crate::compute::{dispatch, DeviceBuffer};

pub struct Binning {
    incoming_counts: DeviceBuffer,
    incoming_base: DeviceBuffer,
    relative_offsets: DeviceBuffer,
    incoming_ids: DeviceBuffer,
    incoming_cursor: DeviceBuffer,
}

impl Binning {
    pub fn new(voxel_count: u32, atom_capacity: u32) -> Self {
        Self {
            incoming_counts: DeviceBuffer::new("incoming_counts", voxel_count as usize),
            incoming_base: DeviceBuffer::new("incoming_base", voxel_count as usize),
            relative_offsets: DeviceBuffer::new("relative_offsets", atom_capacity as usize),
            incoming_ids: DeviceBuffer::new("incoming_ids", atom_capacity as usize),
            incoming_cursor: DeviceBuffer::new("incoming_cursor", 1),
        }
    }

    pub fn incoming_count(&self, dense: u32) -> u32 {
        self.incoming_counts.load(dense as usize)
    }

    /// Atoms binned into a voxel this frame, in unspecified order.
    pub fn incoming(&self, dense: u32) -> Vec<AtomId> {
        let count = self.incoming_count(dense) as usize;
        if count == 0 {
            return Vec::new();
        }
        let base = self.incoming_base.load(dense as usize) as usize;
        self.incoming_ids.read_range(base, count)
    }

    /// Zero the counters of the given voxels.
    pub fn reset(&self, dense_indices: &[u32]) {
        dispatch(dense_indices.len() as u32, |i| {
            self.incoming_counts.store(dense_indices[i as usize] as usize, 0);
        });
        self.incoming_cursor.store(0, 0);
    }
}

/// Write moved and added atoms into the table, with motion vectors and insert marks.
pub fn dispatch_insert(ctx: &FrameContext, upload: &TransactionUpload) {
    dispatch(upload.inserted_ids.len() as u32, |i| {
        let i = i as usize;
        let id = upload.inserted_ids[i];
        let atom = upload.inserted_atoms[i];
        let motion = if i < upload.moved_count {
            ctx.atoms.position(id) - atom.position
        } else {
            Vec3::ZERO
        };
        ctx.atoms.write(id, atom);
        ctx.atoms.set_motion_vector(id, motion);
        ctx.atoms.set_occupied(id, true);
        ctx.atoms.mark_inserted(id, ctx.frame_id);
    });
}

/// Count atoms per destination voxel and mark those voxels dirty.
pub fn dispatch_bin(ctx: &FrameContext, ids: &[AtomId]) {
    let binning = ctx.binning;
    dispatch(ids.len() as u32, |i| {
        let coords = ctx.grid.coarse_voxel_of(ctx.atoms.position(ids[i as usize]));
        let dense = ctx.grid.dense_index(coords);
        let relative = binning.incoming_counts.fetch_add(dense as usize, 1);
        binning.relative_offsets.store(i as usize, relative);
        ctx.scheduler.mark(coords);
    });
}

/// Reserve each dirty voxel's run of the incoming buffer.
pub fn dispatch_reserve(ctx: &FrameContext, work_list: &[u32]) {
    let binning = ctx.binning;
    dispatch(work_list.len() as u32, |e| {
        let coords = ctx.grid.decode(work_list[e as usize]);
        let dense = ctx.grid.dense_index(coords) as usize;
        let count = binning.incoming_counts.load(dense);
        if count > 0 {
            let base = binning.incoming_cursor.fetch_add(0, count);
            binning.incoming_base.store(dense, base);
        }
    });
}

/// Write each binned atom into its voxel's run.
pub fn dispatch_scatter(ctx: &FrameContext, ids: &[AtomId]) {
    let binning = ctx.binning;
    dispatch(ids.len() as u32, |i| {
        let id = ids[i as usize];
        let coords = ctx.grid.coarse_voxel_of(ctx.atoms.position(id));
        let dense = ctx.grid.dense_index(coords) as usize;
        let slot = binning.incoming_base.load(dense) + binning.relative_offsets.load(i as usize);
        binning.incoming_ids.store(slot as usize, id);
    });
}
