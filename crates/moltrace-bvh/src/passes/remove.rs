use glam::Vec3;

use super::{FrameContext, TransactionUpload};
use crate::compute::dispatch;

/// Mark the voxels that removed and moved atoms leave, and vacate removed slots.
///
/// Reads positions before the insert pass overwrites them.
pub fn dispatch_remove(ctx: &FrameContext, upload: &TransactionUpload) {
    let removed = &upload.removed_ids;
    let moved = upload.moved_ids();
    let count = (removed.len() + moved.len()) as u32;

    dispatch(count, |i| {
        let i = i as usize;
        let (id, vacate) = if i < removed.len() {
            (removed[i], true)
        } else {
            (moved[i - removed.len()], false)
        };
        let coords = ctx.grid.coarse_voxel_of(ctx.atoms.position(id));
        ctx.scheduler.mark(coords);
        if vacate {
            ctx.atoms.set_occupied(id, false);
            ctx.atoms.set_motion_vector(id, Vec3::ZERO);
        }
    });
}
