//! Single source of truth for shared constants.
//! These values are used by both Rust and WGSL. The ray-query kernel
//! receives them through a generated preamble.

/// Default edge length of a coarse voxel (memory slot region), in nm.
pub const COARSE_VOXEL_WIDTH: f32 = 2.0;

/// Default number of fine voxels along each edge of a coarse voxel.
pub const FINE_GRID_DIMENSION: u32 = 8;

/// Fine voxels per coarse voxel at the default grid (8^3).
pub const FINE_VOXELS_PER_SLOT: u32 =
    FINE_GRID_DIMENSION * FINE_GRID_DIMENSION * FINE_GRID_DIMENSION;

/// Default edge length of a fine voxel (2.0 / 8), in nm.
pub const FINE_VOXEL_WIDTH: f32 = COARSE_VOXEL_WIDTH / FINE_GRID_DIMENSION as f32;

/// Default cap on the number of atoms whose centers lie in one coarse voxel.
pub const MAX_ATOMS_PER_VOXEL: u32 = 3072;

/// Default cap on the 16-bit reference list of one memory slot.
pub const MAX_REFERENCES_PER_SLOT: u32 = 20_480;

/// Hard ceiling on atoms per voxel: local indices are stored as u16.
pub const MAX_ATOMS_PER_VOXEL_LIMIT: u32 = 1 << 16;

/// Hard ceiling on references per slot: fine headers store u16 offsets.
pub const MAX_REFERENCES_PER_SLOT_LIMIT: u32 = u16::MAX as u32;

/// Coarse voxels per voxel-group edge. Groups are the unit of occupancy marks.
pub const VOXEL_GROUP_SIZE: u32 = 4;

/// Coarse voxels per voxel group (4^3).
pub const VOXELS_PER_GROUP: u32 = VOXEL_GROUP_SIZE * VOXEL_GROUP_SIZE * VOXEL_GROUP_SIZE;

/// Bits per axis in an encoded voxel coordinate. Limits grids to 1024 voxels per axis.
pub const ENCODED_AXIS_BITS: u32 = 10;

/// Largest coarse grid dimension representable by the encoding.
pub const MAX_GRID_DIMENSION: u32 = 1 << ENCODED_AXIS_BITS;

/// Sentinel in the assigned-slot map: voxel owns no memory slot.
pub const UNASSIGNED_SLOT: u32 = u32::MAX;

/// Set in the packed word of a GPU-mirror atom record while its slot is occupied.
pub const ATOM_OCCUPIED_BIT: u32 = 1 << 31;

/// Sentinel for "no atom" in query results.
pub const NO_ATOM: u32 = u32::MAX;

/// Workers per cooperative group in the compute passes.
pub const WORKGROUP_SIZE: u32 = 128;

/// Frames that may be in flight at once. Per-frame buffers form a ring of this depth.
pub const FRAMES_IN_FLIGHT: usize = 3;

/// Default cap on removed IDs, and separately on moved + added IDs, per transaction.
pub const MAX_TRANSACTION_ATOMS: u32 = 1 << 20;

/// Radius used for element codes missing from the element table, in nm.
pub const FALLBACK_RADIUS: f32 = 0.15;

/// Words in the crash buffer: lock/code, four context words, frame ID, two spare.
pub const CRASH_BUFFER_WORDS: usize = 8;
