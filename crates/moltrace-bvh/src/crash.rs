//! Crash/diagnostics buffer: first-error-wins reporting from parallel workers.
//!
//! Word layout:
//!   [0]    lock / error code (1 = ok, 0 = a worker is writing context)
//!   [1..5] context words
//!   [5]    frame ID at report time
//!   [6..8] spare

use glam::{IVec3, UVec3};

use moltrace_core::constants::CRASH_BUFFER_WORDS;
use moltrace_core::grid::VoxelGrid;
use moltrace_core::types::{CrashCode, VoxelCoords};
use moltrace_core::WorldConfig;

use crate::compute::DeviceBuffer;

const LOCK_WORD: usize = 0;
const CONTEXT_WORD: usize = 1;
const FRAME_WORD: usize = 5;
const LOCKED: u32 = 0;

/// A fatal structural condition as reported by the first worker to see one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrashRecord {
    pub code: CrashCode,
    /// Grid indices of the voxel (x, y, z), then a code-specific count.
    pub context: [u32; 4],
    pub frame_id: u32,
}

impl CrashRecord {
    pub fn from_words(words: &[u32]) -> Option<Self> {
        match CrashCode::from_u32(*words.get(LOCK_WORD)?) {
            None | Some(CrashCode::Ok) => None,
            Some(code) => Some(Self {
                code,
                context: [
                    words[CONTEXT_WORD],
                    words[CONTEXT_WORD + 1],
                    words[CONTEXT_WORD + 2],
                    words[CONTEXT_WORD + 3],
                ],
                frame_id: words[FRAME_WORD],
            }),
        }
    }

    pub fn voxel_indices(&self) -> UVec3 {
        UVec3::new(self.context[0], self.context[1], self.context[2])
    }

    pub fn voxel_coords(&self, grid: &VoxelGrid) -> VoxelCoords {
        grid.coords_of_indices(self.voxel_indices())
    }

    /// The code-specific count: atoms of the voxel left without a slot,
    /// atoms over the limit, or references needed.
    pub fn count(&self) -> u32 {
        self.context[3]
    }

    /// Human-readable report naming the voxel's world-space bounds.
    pub fn describe(&self, config: &WorldConfig) -> String {
        let grid = VoxelGrid::new(config);
        let coords = self.voxel_coords(&grid);
        let lower = grid.voxel_lower_corner(coords);
        let upper = grid.voxel_lower_corner(coords + IVec3::ONE);
        let location = format!(
            "voxel {:?} spanning ({:.2}, {:.2}, {:.2}) to ({:.2}, {:.2}, {:.2})",
            coords.to_array(),
            lower.x,
            lower.y,
            lower.z,
            upper.x,
            upper.y,
            upper.z
        );
        match self.code {
            CrashCode::OutOfMemory => format!(
"frame {}: out of memory slots; {} needed a slot for {} atoms, all {} slots in use",
                self.frame_id,
                location,
                self.count(),
                config.memory_slot_count
            ),
            CrashCode::TooManyAtoms => format!(
                "frame {}: too many atoms; {} holds {} atoms, limit {}",
                self.frame_id,
                location,
                self.count(),
                config.max_atoms_per_voxel
            ),
            CrashCode::TooManyReferences => format!(
                "frame {}: too many references; {} needs {} references, limit {}",
                self.frame_id,
                location,
                self.count(),
                config.max_references_per_slot
            ),
            CrashCode::Ok => format!("frame {}: no error", self.frame_id),
        }
    }
}

/// Shared diagnostics buffer checked by every pass before slot writes.
pub struct CrashBuffer {
    words: DeviceBuffer,
}

impl Default for CrashBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl CrashBuffer {
    pub fn new() -> Self {
        let words = DeviceBuffer::new("crash_buffer", CRASH_BUFFER_WORDS);
        words.store(LOCK_WORD, CrashCode::Ok as u32);
        Self { words }
    }

    /// True while no worker has reported an error.
    pub fn is_ok(&self) -> bool {
        self.words.load_acquire(LOCK_WORD) == CrashCode::Ok as u32
    }

    /// Take the buffer for writing. Only one caller ever succeeds until `clear`.
    pub fn acquire_lock(&self) -> bool {
        self.words
            .compare_exchange(LOCK_WORD, CrashCode::Ok as u32, LOCKED)
            .is_ok()
    }

    /// Record a condition if no other worker got there first.
    /// Returns true when this report is the one recorded.
    pub fn report(&self, code: CrashCode, frame_id: u32, context: [u32; 4]) -> bool {
        debug_assert!(code != CrashCode::Ok);
        if !self.acquire_lock() {
            return false;
        }
        for (i, value) in context.iter().enumerate() {
            self.words.store(CONTEXT_WORD + i, *value);
        }
        self.words.store(FRAME_WORD, frame_id);
        self.words.store_release(LOCK_WORD, code as u32);
        true
    }

    /// Convenience for voxel-scoped conditions.
    pub fn report_voxel(&self, code: CrashCode, frame_id: u32, indices: UVec3, count: u32) -> bool {
        self.report(code, frame_id, [indices.x, indices.y, indices.z, count])
    }

    /// Host readback. `None` while the sentinel is intact.
    pub fn read(&self) -> Option<CrashRecord> {
        CrashRecord::from_words(&self.words.snapshot())
    }

    pub fn clear(&self) {
        self.words.fill(0);
        self.words.store(LOCK_WORD, CrashCode::Ok as u32);
    }

    pub fn words(&self) -> Vec<u32> {
        self.words.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compute::dispatch;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_fresh_buffer_is_ok() {
        let crash = CrashBuffer::new();
        assert!(crash.is_ok());
        assert_eq!(crash.read(), None);
        assert_eq!(crash.words()[0], 1);
    }

    #[test]
    fn test_first_report_wins() {
        let crash = CrashBuffer::new();
        assert!(crash.report(CrashCode::TooManyAtoms, 7, [1, 2, 3, 4000]));
        assert!(!crash.report(CrashCode::OutOfMemory, 8, [9, 9, 9, 0]));
        let record = crash.read().unwrap();
        assert_eq!(record.code, CrashCode::TooManyAtoms);
        assert_eq!(record.context, [1, 2, 3, 4000]);
        assert_eq!(record.frame_id, 7);
        assert!(!crash.is_ok());
    }

    #[test]
    fn test_concurrent_reports_record_exactly_one() {
        let crash = CrashBuffer::new();
        let winners = AtomicU32::new(0);
        dispatch(4096, |id| {
            if crash.report(CrashCode::TooManyReferences, 1, [id, id, id, id]) {
                winners.fetch_add(1, Ordering::Relaxed);
            }
        });
        assert_eq!(winners.load(Ordering::Relaxed), 1);
        let record = crash.read().unwrap();
        // Context is never torn between two reporters.
        let c = record.context;
        assert!(c[0] == c[1] && c[1] == c[2] && c[2] == c[3]);
    }

    #[test]
    fn test_clear_restores_sentinel() {
        let crash = CrashBuffer::new();
        crash.report(CrashCode::OutOfMemory, 3, [0; 4]);
        crash.clear();
        assert!(crash.is_ok());
        assert!(crash.report(CrashCode::TooManyAtoms, 4, [0; 4]));
    }

    #[test]
    fn test_describe_names_voxel_bounds() {
        let config = WorldConfig {
            world_dimension: 32.0,
            ..WorldConfig::default()
        };
        let record = CrashRecord {
            code: CrashCode::TooManyAtoms,
            context: [8, 8, 8, 25_000],
            frame_id: 12,
        };
        let text = record.describe(&config);
        assert!(text.contains("frame 12"));
        assert!(text.contains("(0.00, 0.00, 0.00) to (2.00, 2.00, 2.00)"));
        assert!(text.contains("25000 atoms"));
        assert!(text.contains("limit 3072"));
    }

    #[test]
    fn test_describe_out_of_memory_names_stranded_atoms() {
        let config = WorldConfig {
            world_dimension: 32.0,
            memory_slot_count: 2,
            ..WorldConfig::default()
        };
        let record = CrashRecord {
            code: CrashCode::OutOfMemory,
            context: [9, 8, 8, 37],
            frame_id: 3,
        };
        let text = record.describe(&config);
        assert!(text.contains("(2.00, 0.00, 0.00) to (4.00, 2.00, 2.00)"));
        assert!(text.contains("for 37 atoms"));
        assert!(text.contains("all 2 slots in use"));
    }
}
