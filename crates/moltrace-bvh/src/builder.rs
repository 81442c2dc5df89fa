//! Per-frame orchestration of the structure build.
//!
//! Frame order: validate, forget last frame's scratch, upload, remove,
//! insert, bin, compact, reserve, scatter incoming, size, release, claim,
//! scatter references. Only validation can fail; device-side conditions are
//! reported through the crash buffer.

use std::time::Instant;

use glam::Vec3;

use moltrace_core::constants::FRAMES_IN_FLIGHT;
use moltrace_core::error::{ConfigError, TransactionError};
use moltrace_core::grid::VoxelGrid;
use moltrace_core::types::{AtomId, Transaction, VoxelCoords};
use moltrace_core::{ElementTable, WorldConfig};

use crate::allocator::SlotAllocator;
use crate::atoms::AtomTable;
use crate::compute::dispatch;
use crate::crash::{CrashBuffer, CrashRecord};
use crate::memory::MemorySlots;
use crate::passes::{add, rebuild, remove};
use crate::passes::{Binning, FrameContext, TransactionUpload, VoxelBuild, VoxelStatus};
use crate::ring::FrameRing;
use crate::scheduler::RebuildScheduler;
use crate::view::StructureView;

/// Wall-clock time per pass, in milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PassTimings {
    pub upload_ms: f64,
    pub remove_ms: f64,
    pub insert_ms: f64,
    pub schedule_ms: f64,
    pub size_ms: f64,
    pub allocate_ms: f64,
    pub scatter_ms: f64,
    pub total_ms: f64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrameReport {
    pub frame_id: u32,
    pub removed: u32,
    pub moved: u32,
    pub added: u32,
    /// Dense indices of this frame's dirty voxels.
    pub dirty_voxels: Vec<u32>,
    pub slots_claimed: u32,
    pub slots_released: u32,
    pub voxels_committed: u32,
    pub voxels_skipped: u32,
    /// Slots whose contents changed this frame.
    pub rebuilt_slots: Vec<u32>,
    pub timings: PassTimings,
    pub crash: Option<CrashRecord>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StructureStats {
    pub occupied_atoms: u32,
    pub assigned_slots: u32,
    pub free_slots: u32,
    pub total_atom_references: u64,
    pub total_fine_references: u64,
}

fn elapsed_ms(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1000.0
}

pub struct BvhBuilder {
    config: WorldConfig,
    grid: VoxelGrid,
    elements: ElementTable,
    atoms: AtomTable,
    allocator: SlotAllocator,
    scheduler: RebuildScheduler,
    memory: MemorySlots,
    crash: CrashBuffer,
    binning: Binning,
    uploads: FrameRing<TransactionUpload>,
    crash_snapshots: FrameRing<Option<CrashRecord>>,
    frame_id: u32,
    /// Atoms whose motion vectors are cleared next frame.
    previous_moved: Vec<AtomId>,
    /// Dense indices whose binning counters are cleared next frame.
    previous_dirty: Vec<u32>,
}

impl BvhBuilder {
    pub fn new(config: WorldConfig, elements: ElementTable) -> Result<Self, ConfigError> {
        config.validate()?;
        let grid = VoxelGrid::new(&config);
        log::info!(
            "BvhBuilder: {}^3 coarse voxels, {} memory slots, {} atom capacity",
            grid.dimension(),
            config.memory_slot_count,
            config.atom_capacity
        );
        Ok(Self {
            atoms: AtomTable::new(config.atom_capacity),
            allocator: SlotAllocator::new(
                config.memory_slot_count,
                grid.voxel_count(),
                grid.group_count(),
            ),
            scheduler: RebuildScheduler::new(grid),
            memory: MemorySlots::new(&config),
            crash: CrashBuffer::new(),
            binning: Binning::new(grid.voxel_count(), config.atom_capacity),
            uploads: FrameRing::new(FRAMES_IN_FLIGHT, TransactionUpload::default),
            crash_snapshots: FrameRing::new(FRAMES_IN_FLIGHT, || None),
            frame_id: 0,
            previous_moved: Vec::new(),
            previous_dirty: Vec::new(),
            grid,
            elements,
            config,
        })
    }

    pub fn config(&self) -> &WorldConfig {
        &self.config
    }

    pub fn grid(&self) -> &VoxelGrid {
        &self.grid
    }

    pub fn elements(&self) -> &ElementTable {
        &self.elements
    }

    pub fn atoms(&self) -> &AtomTable {
        &self.atoms
    }

    pub fn memory(&self) -> &MemorySlots {
        &self.memory
    }

    pub fn allocator(&self) -> &SlotAllocator {
        &self.allocator
    }

    /// ID the next frame will carry.
    pub fn frame_id(&self) -> u32 {
        self.frame_id
    }

    /// Dirty voxels of the last frame.
    pub fn dirty_voxels(&self) -> Vec<VoxelCoords> {
        self.scheduler.dirty_voxels()
    }

    pub fn view(&self) -> StructureView<'_> {
        StructureView {
            grid: &self.grid,
            elements: &self.elements,
            atoms: &self.atoms,
            allocator: &self.allocator,
            memory: &self.memory,
            frame_id: self.frame_id.wrapping_sub(1),
        }
    }

    /// Current crash record, if any worker reported one.
    pub fn read_crash_record(&self) -> Option<CrashRecord> {
        self.crash.read()
    }

    /// Crash record as observed at the end of `frame_id`, while that frame is still in the ring.
    pub fn frame_crash_record(&self, frame_id: u32) -> Option<CrashRecord> {
        let age = self.frame_id.wrapping_sub(frame_id);
        if age == 0 || age as usize > self.crash_snapshots.depth() {
            return None;
        }
        *self.crash_snapshots.get(frame_id)
    }

    /// Re-arm the crash buffer between frames.
    pub fn clear_crash_record(&mut self) {
        self.crash.clear();
    }

    pub fn stats(&self) -> StructureStats {
        let mut stats = StructureStats {
            occupied_atoms: self.atoms.occupied_count(),
            assigned_slots: self.allocator.assigned_count(),
            free_slots: self.allocator.free_count(),
            ..StructureStats::default()
        };
        for slot in 0..self.allocator.slot_count() {
            if self.allocator.slot_owner(slot).is_some() {
                let header = self.memory.header(slot);
                stats.total_atom_references += header.large_count as u64;
                stats.total_fine_references += header.small_count as u64;
            }
        }
        stats
    }

    fn context(&self, frame_id: u32) -> FrameContext<'_> {
        FrameContext {
            config: &self.config,
            grid: &self.grid,
            elements: &self.elements,
            atoms: &self.atoms,
            allocator: &self.allocator,
            scheduler: &self.scheduler,
            memory: &self.memory,
            crash: &self.crash,
            binning: &self.binning,
            frame_id,
        }
    }

    /// Clear last frame's scratch by revisiting last frame's lists.
    fn forget_idle_state(&mut self) {
        self.binning.reset(&self.previous_dirty);
        self.scheduler.reset();
        let atoms = &self.atoms;
        let moved = &self.previous_moved;
        dispatch(moved.len() as u32, |i| {
            atoms.set_motion_vector(moved[i as usize], Vec3::ZERO);
        });
        self.previous_dirty.clear();
        self.previous_moved.clear();
    }

    /// Apply one transaction and rebuild every voxel it touches.
    ///
    /// Invalid transactions are rejected before anything is modified.
    pub fn update(&mut self, tx: &Transaction) -> Result<FrameReport, TransactionError> {
        let frame_start = Instant::now();
        let frame_id = self.frame_id;
        if let Err(e) = self
            .atoms
            .validate(tx, &self.grid, self.config.max_transaction_atoms)
        {
            log::warn!("Frame {}: transaction rejected: {}", frame_id, e);
            return Err(e);
        }
        self.forget_idle_state();
        if !self.crash.is_ok() {
            log::warn!(
                "Frame {}: crash record still set, voxel rebuilds are halted",
                frame_id
            );
        }

        let mut timings = PassTimings::default();
        let start = Instant::now();
        let upload = self.uploads.get_mut(frame_id);
        upload.clear();
        upload.removed_ids.extend_from_slice(&tx.removed_ids);
        upload.inserted_ids.extend_from_slice(&tx.moved_ids);
        upload.inserted_ids.extend_from_slice(&tx.added_ids);
        upload.inserted_atoms.extend_from_slice(&tx.moved_atoms);
        upload.inserted_atoms.extend_from_slice(&tx.added_atoms);
        upload.moved_count = tx.moved_ids.len();
        timings.upload_ms = elapsed_ms(start);

        let mut report = {
            let ctx = self.context(frame_id);
            let upload = self.uploads.get(frame_id);

            let start = Instant::now();
            remove::dispatch_remove(&ctx, upload);
            timings.remove_ms = elapsed_ms(start);

            let start = Instant::now();
            add::dispatch_insert(&ctx, upload);
            timings.insert_ms = elapsed_ms(start);

            Self::build_dirty(&ctx, &upload.inserted_ids, &mut timings)
        };

        report.frame_id = frame_id;
        report.removed = tx.removed_ids.len() as u32;
        report.moved = tx.moved_ids.len() as u32;
        report.added = tx.added_ids.len() as u32;
        self.previous_moved.extend_from_slice(&tx.moved_ids);
        timings.total_ms = elapsed_ms(frame_start);
        report.timings = timings;
        Ok(self.finish_frame(report))
    }

    /// Discard the structure and re-derive every occupied voxel from the atom table.
    ///
    /// Clears the crash record first; this is the corrective action after
    /// allocator exhaustion or overflow.
    pub fn rebuild_from_scratch(&mut self) -> FrameReport {
        let frame_start = Instant::now();
        let frame_id = self.frame_id;
        self.forget_idle_state();
        self.crash.clear();
        self.allocator.reset();
        let memory = &self.memory;
        dispatch(memory.slot_count(), |slot| memory.clear(slot));

        let mut timings = PassTimings::default();
        let ids = self.atoms.occupied_ids();
        let mut report = {
            let ctx = self.context(frame_id);
            Self::build_dirty(&ctx, &ids, &mut timings)
        };
        report.frame_id = frame_id;
        report.added = ids.len() as u32;
        timings.total_ms = elapsed_ms(frame_start);
        report.timings = timings;
        log::info!(
            "Frame {}: full rebuild of {} atoms into {} voxels",
            frame_id,
            ids.len(),
            report.dirty_voxels.len()
        );
        self.finish_frame(report)
    }

    /// Schedule and rebuild the voxels touched by `inserted` plus any already marked.
    fn build_dirty(ctx: &FrameContext, inserted: &[AtomId], timings: &mut PassTimings) -> FrameReport {
        let start = Instant::now();
        add::dispatch_bin(ctx, inserted);
        ctx.scheduler.compact();
        let work_list = ctx.scheduler.work_list();
        add::dispatch_reserve(ctx, &work_list);
        add::dispatch_scatter(ctx, inserted);
        timings.schedule_ms = elapsed_ms(start);

        let mut builds: Vec<VoxelBuild> = work_list
            .iter()
            .map(|&encoded| VoxelBuild::new(ctx, encoded))
            .collect();

        let start = Instant::now();
        rebuild::dispatch_size(ctx, &mut builds);
        timings.size_ms = elapsed_ms(start);

        let start = Instant::now();
        rebuild::dispatch_release(ctx, &mut builds);
        rebuild::dispatch_claim(ctx, &mut builds);
        timings.allocate_ms = elapsed_ms(start);

        let start = Instant::now();
        rebuild::dispatch_scatter(ctx, &mut builds);
        timings.scatter_ms = elapsed_ms(start);

        let mut report = FrameReport {
            dirty_voxels: builds.iter().map(|b| b.dense).collect(),
            ..FrameReport::default()
        };
        for build in &builds {
            report.slots_claimed += build.claimed as u32;
            report.slots_released += build.released as u32;
            match build.status {
                VoxelStatus::Committed => {
                    report.voxels_committed += 1;
                    report.rebuilt_slots.extend(build.slot);
                }
                VoxelStatus::Skipped => report.voxels_skipped += 1,
                _ => {}
            }
        }
        report
    }

    fn finish_frame(&mut self, mut report: FrameReport) -> FrameReport {
        let frame_id = self.frame_id;
        report.crash = self.crash.read();
        *self.crash_snapshots.get_mut(frame_id) = report.crash;
        if let Some(record) = report.crash {
            log::warn!("Crash record: {}", record.describe(&self.config));
        }
        log::debug!(
            "Frame {}: -{} ~{} +{}, {} dirty, {} claimed, {} released, {:.3} ms",
            frame_id,
            report.removed,
            report.moved,
            report.added,
            report.dirty_voxels.len(),
            report.slots_claimed,
            report.slots_released,
            report.timings.total_ms
        );
        self.previous_dirty.extend_from_slice(&report.dirty_voxels);
        self.frame_id = self.frame_id.wrapping_add(1);
        report
    }
}
