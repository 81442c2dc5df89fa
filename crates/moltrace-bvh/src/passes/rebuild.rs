//! Reference-list builder: one cooperative group per dirty coarse voxel.
//!
//! Sizing (gather, Phase I, Phase II) runs before any slot is released or
//! claimed, so an overflowing voxel never touches its slot. A voxel checks
//! the crash buffer once, when its sizing starts; after that it is in flight
//! and runs to completion, writing only its own slot. Scatter
//! (Phase III) and finalization (Phase IV) build the new lists in group
//! memory and commit them to the slot in one step.
//!
//! Positions are taken relative to the voxel's lower corner and measured in
//! fine-voxel units.

use glam::{IVec3, Vec3};
use std::sync::atomic::{AtomicU32, Ordering};

use moltrace_core::types::{AtomId, CrashCode, VoxelCoords};

use super::FrameContext;
use crate::compute::{dispatch_groups, exclusive_scan, Workgroup};
use crate::memory::{FineRange, SlotHeader};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoxelStatus {
    /// Not yet sized.
    Pending,
    /// Halted by an earlier crash report.
    Skipped,
    /// No atoms remain; the slot, if any, is released.
    Empty,
    /// Capacity exceeded; slot contents left as they were.
    Overflow,
    /// Sized and within capacity.
    Ready,
    /// Needed a slot but none was free; its atoms stay unindexed.
    Unassigned,
    /// New lists written to the slot.
    Committed,
}

/// Group-local state of one dirty voxel's rebuild.
#[derive(Debug, Clone)]
pub struct VoxelBuild {
    pub coords: VoxelCoords,
    pub dense: u32,
    pub group: u32,
    pub status: VoxelStatus,
    pub slot: Option<u32>,
    pub claimed: bool,
    pub released: bool,
    /// Live atom IDs in ascending order. Index = local index.
    atoms: Vec<AtomId>,
    /// Per atom: center and radius in fine-voxel units.
    spheres: Vec<(Vec3, f32)>,
    /// Phase II exclusive offsets per fine voxel.
    offsets: Vec<u32>,
    /// Phase II total (conservative reference count).
    reserved: u32,
}

impl VoxelBuild {
    pub fn new(ctx: &FrameContext, encoded: u32) -> Self {
        let coords = ctx.grid.decode(encoded);
        Self {
            coords,
            dense: ctx.grid.dense_index(coords),
            group: ctx.grid.group_index(coords),
            status: VoxelStatus::Pending,
            slot: None,
            claimed: false,
            released: false,
            atoms: Vec::new(),
            spheres: Vec::new(),
            offsets: Vec::new(),
            reserved: 0,
        }
    }

    pub fn atom_count(&self) -> usize {
        self.atoms.len()
    }

    fn release_scratch(&mut self) {
        self.atoms = Vec::new();
        self.spheres = Vec::new();
        self.offsets = Vec::new();
    }
}

/// Fine voxels a sphere's bounding box covers, as `[min, max)` clamped to the grid.
pub fn fine_cuboid(center: Vec3, radius: f32, fine_dim: u32) -> (IVec3, IVec3) {
    let min = (center - Vec3::splat(radius))
        .floor()
        .as_ivec3()
        .max(IVec3::ZERO);
    let max = (center + Vec3::splat(radius))
        .ceil()
        .as_ivec3()
        .min(IVec3::splat(fine_dim as i32));
    (min, max)
}

/// Exact sphere / unit-cube overlap in fine-voxel units.
pub fn sphere_overlaps_cell(center: Vec3, radius: f32, cell: IVec3) -> bool {
    let lo = cell.as_vec3();
    let nearest = center.clamp(lo, lo + Vec3::ONE);
    (center - nearest).length_squared() <= radius * radius
}

fn for_each_cell(min: IVec3, max: IVec3, mut body: impl FnMut(IVec3)) {
    for z in min.z..max.z {
        for y in min.y..max.y {
            for x in min.x..max.x {
                body(IVec3::new(x, y, z));
            }
        }
    }
}

/// Collect each voxel's live atoms and size its reference list (Phases I and II).
pub fn dispatch_size(ctx: &FrameContext, builds: &mut [VoxelBuild]) {
    dispatch_groups(builds, |group, build| size_voxel(ctx, group, build));
}

fn size_voxel(ctx: &FrameContext, group: &Workgroup, build: &mut VoxelBuild) {
    if !ctx.crash.is_ok() {
        build.status = VoxelStatus::Skipped;
        return;
    }
    let coords = build.coords;
    build.slot = ctx.allocator.assigned_slot(build.dense);

    // Survivors of the current list: still occupied, still here, and not
    // re-inserted this frame (those arrive through the incoming run).
    let mut atoms = Vec::new();
    if let Some(slot) = build.slot {
        let count = ctx.memory.header(slot).large_count;
        group.strided(count, |i| {
            let id = ctx.memory.large_ref(slot, i);
            if ctx.atoms.is_occupied(id)
                && !ctx.atoms.inserted_in(id, ctx.frame_id)
                && ctx.grid.coarse_voxel_of(ctx.atoms.position(id)) == coords
            {
                atoms.push(id);
            }
        });
    }
    atoms.extend(ctx.binning.incoming(build.dense));
    atoms.sort_unstable();

    let indices = ctx.grid.grid_indices(coords);
    if atoms.is_empty() {
        build.status = VoxelStatus::Empty;
        return;
    }
    if atoms.len() > ctx.config.max_atoms_per_voxel as usize {
        ctx.crash
            .report_voxel(CrashCode::TooManyAtoms, ctx.frame_id, indices, atoms.len() as u32);
        build.status = VoxelStatus::Overflow;
        return;
    }

    let lower = ctx.grid.voxel_lower_corner(coords);
    let fine_width = ctx.grid.fine_width();
    let fine_dim = ctx.grid.fine_dimension();
    let fine_count = ctx.grid.fine_voxel_count();

    let mut spheres = vec![(Vec3::ZERO, 0.0); atoms.len()];
    group.strided(atoms.len() as u32, |k| {
        let id = atoms[k as usize];
        let center = (ctx.atoms.position(id) - lower) / fine_width;
        let radius = ctx.elements.radius(ctx.atoms.element(id)) / fine_width;
        spheres[k as usize] = (center, radius);
    });

    // Phase I: conservative per-fine-voxel histogram.
    let counters: Vec<AtomicU32> = (0..fine_count).map(|_| AtomicU32::new(0)).collect();
    group.strided(atoms.len() as u32, |k| {
        let (center, radius) = spheres[k as usize];
        let (min, max) = fine_cuboid(center, radius, fine_dim);
        for_each_cell(min, max, |cell| {
            let fine = ctx.grid.fine_address(cell) as usize;
            counters[fine].fetch_add(1, Ordering::Relaxed);
        });
    });

    // Phase II: scan and capacity check.
    let mut offsets: Vec<u32> = counters.into_iter().map(AtomicU32::into_inner).collect();
    let reserved = exclusive_scan(group, &mut offsets);
    if reserved > ctx.config.max_references_per_slot {
        ctx.crash
            .report_voxel(CrashCode::TooManyReferences, ctx.frame_id, indices, reserved);
        build.status = VoxelStatus::Overflow;
        return;
    }

    build.atoms = atoms;
    build.spheres = spheres;
    build.offsets = offsets;
    build.reserved = reserved;
    build.status = VoxelStatus::Ready;
}

/// Return slots of voxels that became empty.
pub fn dispatch_release(ctx: &FrameContext, builds: &mut [VoxelBuild]) {
    dispatch_groups(builds, |_, build| {
        if build.status != VoxelStatus::Empty {
            return;
        }
        if let Some(slot) = ctx.allocator.release(build.dense, build.group) {
            ctx.memory.clear(slot);
            build.released = true;
        }
        build.slot = None;
        build.release_scratch();
    });
}

/// Give a slot to every sized voxel that lacks one.
pub fn dispatch_claim(ctx: &FrameContext, builds: &mut [VoxelBuild]) {
    dispatch_groups(builds, |_, build| {
        if build.status != VoxelStatus::Ready || build.slot.is_some() {
            return;
        }
        match ctx.allocator.claim(build.dense, build.group) {
            Some(slot) => {
                build.slot = Some(slot);
                build.claimed = true;
            }
            None => {
                let indices = ctx.grid.grid_indices(build.coords);
                ctx.crash.report_voxel(
                    CrashCode::OutOfMemory,
                    ctx.frame_id,
                    indices,
                    build.atom_count() as u32,
                );
                build.status = VoxelStatus::Unassigned;
                build.release_scratch();
            }
        }
    });
}

/// Exact overlap, scatter and header finalization (Phases III and IV), then commit.
pub fn dispatch_scatter(ctx: &FrameContext, builds: &mut [VoxelBuild]) {
    dispatch_groups(builds, |group, build| {
        if build.status == VoxelStatus::Ready {
            scatter_voxel(ctx, group, build);
        }
        build.release_scratch();
    });
}

fn scatter_voxel(ctx: &FrameContext, group: &Workgroup, build: &mut VoxelBuild) {
    let Some(slot) = build.slot else {
        return;
    };
    let fine_dim = ctx.grid.fine_dimension();
    let fine_count = ctx.grid.fine_voxel_count();

    // Phase III: the scanned offsets become bump allocators.
    let bump: Vec<AtomicU32> = build.offsets.iter().map(|&o| AtomicU32::new(o)).collect();
    let mut staged = vec![0u16; build.reserved as usize];
    group.strided(build.atoms.len() as u32, |k| {
        let (center, radius) = build.spheres[k as usize];
        let (min, max) = fine_cuboid(center, radius, fine_dim);
        for_each_cell(min, max, |cell| {
            if sphere_overlaps_cell(center, radius, cell) {
                let fine = ctx.grid.fine_address(cell) as usize;
                let at = bump[fine].fetch_add(1, Ordering::Relaxed) as usize;
                staged[at] = k as u16;
            }
        });
    });

    // Phase IV: exact ranges, compacted so they tile the small list.
    let ends: Vec<u32> = bump.into_iter().map(AtomicU32::into_inner).collect();
    let mut begins: Vec<u32> = (0..fine_count as usize)
        .map(|f| ends[f] - build.offsets[f])
        .collect();
    let small_count = exclusive_scan(group, &mut begins);

    let mut compacted = vec![0u16; small_count as usize];
    let mut fine_words = vec![0u32; fine_count as usize];
    group.strided(fine_count, |f| {
        let f = f as usize;
        let len = (ends[f] - build.offsets[f]) as usize;
        if len == 0 {
            return;
        }
        let dst = begins[f] as usize;
        let src = build.offsets[f] as usize;
        let run = &mut compacted[dst..dst + len];
        run.copy_from_slice(&staged[src..src + len]);
        run.sort_unstable();
        fine_words[f] = FineRange {
            begin: dst as u16,
            end: (dst + len) as u16,
        }
        .pack();
    });

    // Commit.
    let atom_count = build.atoms.len() as u32;
    group.strided(atom_count, |k| {
        ctx.memory.write_large_ref(slot, k, build.atoms[k as usize]);
    });
    group.strided(small_count, |i| {
        ctx.memory.write_small_ref(slot, i, compacted[i as usize]);
    });
    group.strided(fine_count, |f| {
        ctx.memory.write_fine_word(slot, f, fine_words[f as usize]);
    });
    ctx.memory.write_header(
        slot,
        SlotHeader {
            atom_count,
            large_count: atom_count,
            small_count,
        },
    );
    build.status = VoxelStatus::Committed;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cuboid_clamped_to_grid() {
        let (min, max) = fine_cuboid(Vec3::new(0.0, 4.5, 7.9), 0.57, 8);
        assert_eq!(min, IVec3::new(0, 3, 7));
        assert_eq!(max, IVec3::new(1, 6, 8));
    }

    #[test]
    fn test_cuboid_interior() {
        let (min, max) = fine_cuboid(Vec3::splat(4.5), 0.4, 8);
        assert_eq!(min, IVec3::splat(4));
        assert_eq!(max, IVec3::splat(5));
    }

    #[test]
    fn test_exact_test_rejects_box_corner() {
        // Center at a cell corner with small radius: diagonal cells overlap
        // the bounding box but the sphere reaches them only at the corner point.
        let center = Vec3::splat(2.0);
        let radius = 0.5;
        assert!(sphere_overlaps_cell(center, radius, IVec3::splat(1)));
        assert!(sphere_overlaps_cell(center, radius, IVec3::splat(2)));

        let center = Vec3::new(2.5, 2.5, 2.5);
        let radius = 0.6;
        // Face neighbor: within 0.5 of its face.
        assert!(sphere_overlaps_cell(center, radius, IVec3::new(3, 2, 2)));
        // Corner neighbor: nearest point is sqrt(0.75) ≈ 0.87 away.
        assert!(!sphere_overlaps_cell(center, radius, IVec3::new(3, 3, 3)));
    }

    #[test]
    fn test_exact_test_inside_cell() {
        assert!(sphere_overlaps_cell(Vec3::splat(0.5), 0.01, IVec3::ZERO));
        assert!(!sphere_overlaps_cell(Vec3::splat(0.5), 0.01, IVec3::new(1, 0, 0)));
    }
}
