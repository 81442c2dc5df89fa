use glam::{IVec3, Vec3};
use std::collections::HashSet;

use crate::error::TransactionError;

/// Stable index into the atom slot table.
pub type AtomId = u32;

/// Coarse voxel coordinate, signed and relative to the world center.
pub type VoxelCoords = IVec3;

/// A single atom as submitted by the scene-update collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Atom {
    pub position: Vec3,
    pub element: u8,
    pub flags: u8,
}

impl Atom {
    pub fn new(position: Vec3, element: u8) -> Self {
        Self {
            position,
            element,
            flags: 0,
        }
    }

    /// Pack into the four-word device representation.
    pub fn to_gpu(self) -> GpuAtom {
        GpuAtom {
            position: self.position.to_array(),
            packed: self.element as u32 | ((self.flags as u32) << 8),
        }
    }
}

/// Device-side atom record. Must match `Atom` in ray_query.wgsl.
///
/// `packed` layout: element code in bits [0:7], flags in bits [8:15]. The
/// GPU mirror also sets `ATOM_OCCUPIED_BIT` on occupied records.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct GpuAtom {
    pub position: [f32; 3],
    pub packed: u32,
}

impl GpuAtom {
    pub fn element(&self) -> u8 {
        (self.packed & 0xFF) as u8
    }

    pub fn flags(&self) -> u8 {
        ((self.packed >> 8) & 0xFF) as u8
    }

    pub fn to_atom(self) -> Atom {
        Atom {
            position: Vec3::from_array(self.position),
            element: self.element(),
            flags: self.flags(),
        }
    }
}

/// Net per-frame diff of the atom slot table.
///
/// `moved_atoms[i]` is the new state of `moved_ids[i]`; likewise for added.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Transaction {
    pub removed_ids: Vec<AtomId>,
    pub moved_ids: Vec<AtomId>,
    pub moved_atoms: Vec<Atom>,
    pub added_ids: Vec<AtomId>,
    pub added_atoms: Vec<Atom>,
}

impl Transaction {
    pub fn is_empty(&self) -> bool {
        self.removed_ids.is_empty() && self.moved_ids.is_empty() && self.added_ids.is_empty()
    }

    pub fn add(&mut self, id: AtomId, atom: Atom) {
        self.added_ids.push(id);
        self.added_atoms.push(atom);
    }

    pub fn relocate(&mut self, id: AtomId, atom: Atom) {
        self.moved_ids.push(id);
        self.moved_atoms.push(atom);
    }

    pub fn remove(&mut self, id: AtomId) {
        self.removed_ids.push(id);
    }

    /// Change in occupied-slot count once applied.
    pub fn occupancy_delta(&self) -> i64 {
        self.added_ids.len() as i64 - self.removed_ids.len() as i64
    }

    /// Check the invariants that do not depend on table state: matching
    /// lengths, per-frame size limits, and disjoint ID categories.
    pub fn validate_shape(&self, max_atoms: u32) -> Result<(), TransactionError> {
        if self.moved_ids.len() != self.moved_atoms.len() {
            return Err(TransactionError::LengthMismatch {
                category: "moved",
                ids: self.moved_ids.len(),
                atoms: self.moved_atoms.len(),
            });
        }
        if self.added_ids.len() != self.added_atoms.len() {
            return Err(TransactionError::LengthMismatch {
                category: "added",
                ids: self.added_ids.len(),
                atoms: self.added_atoms.len(),
            });
        }
        if self.removed_ids.len() > max_atoms as usize {
            return Err(TransactionError::TooLarge {
                count: self.removed_ids.len(),
                max: max_atoms,
            });
        }
        let inserted = self.moved_ids.len() + self.added_ids.len();
        if inserted > max_atoms as usize {
            return Err(TransactionError::TooLarge {
                count: inserted,
                max: max_atoms,
            });
        }

        let mut seen = HashSet::with_capacity(self.removed_ids.len() + inserted);
        let all = self
            .removed_ids
            .iter()
            .chain(self.moved_ids.iter())
            .chain(self.added_ids.iter());
        for &id in all {
            if !seen.insert(id) {
                return Err(TransactionError::DuplicateId(id));
            }
        }
        Ok(())
    }
}

/// Error codes stored in slot 0 of the crash buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum CrashCode {
    /// Sentinel: workers may proceed.
    Ok = 1,
    /// No free memory slot for a newly non-empty coarse voxel.
    OutOfMemory = 2,
    /// Atom count of one coarse voxel exceeds the large-list capacity.
    TooManyAtoms = 3,
    /// Reference count of one coarse voxel exceeds the small-list capacity.
    TooManyReferences = 4,
}

impl CrashCode {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            1 => Some(Self::Ok),
            2 => Some(Self::OutOfMemory),
            3 => Some(Self::TooManyAtoms),
            4 => Some(Self::TooManyReferences),
            _ => None,
        }
    }

    /// Allocator-class conditions leave the voxel unassigned.
    pub fn is_allocator(self) -> bool {
        self == Self::OutOfMemory
    }

    /// Overflow-class conditions abort one voxel's rebuild.
    pub fn is_overflow(self) -> bool {
        matches!(self, Self::TooManyAtoms | Self::TooManyReferences)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gpu_atom_size() {
        assert_eq!(std::mem::size_of::<GpuAtom>(), 16);
    }

    #[test]
    fn test_gpu_atom_packing() {
        let atom = Atom {
            position: Vec3::new(1.0, -2.0, 3.5),
            element: 79,
            flags: 0x5A,
        };
        let gpu = atom.to_gpu();
        assert_eq!(gpu.element(), 79);
        assert_eq!(gpu.flags(), 0x5A);
        assert_eq!(gpu.to_atom(), atom);
    }

    #[test]
    fn test_empty_transaction() {
        let tx = Transaction::default();
        assert!(tx.is_empty());
        assert!(tx.validate_shape(16).is_ok());
        assert_eq!(tx.occupancy_delta(), 0);
    }

    #[test]
    fn test_length_mismatch_rejected() {
        let mut tx = Transaction::default();
        tx.moved_ids.push(3);
        let err = tx.validate_shape(16).unwrap_err();
        assert!(matches!(
            err,
            TransactionError::LengthMismatch {
                category: "moved",
                ids: 1,
                atoms: 0
            }
        ));
    }

    #[test]
    fn test_duplicate_across_categories_rejected() {
        let mut tx = Transaction::default();
        tx.remove(7);
        tx.add(7, Atom::new(Vec3::ZERO, 6));
        assert!(matches!(
            tx.validate_shape(16),
            Err(TransactionError::DuplicateId(7))
        ));
    }

    #[test]
    fn test_duplicate_within_category_rejected() {
        let mut tx = Transaction::default();
        tx.add(2, Atom::new(Vec3::ZERO, 6));
        tx.add(2, Atom::new(Vec3::ONE, 6));
        assert!(matches!(
            tx.validate_shape(16),
            Err(TransactionError::DuplicateId(2))
        ));
    }

    #[test]
    fn test_size_limit() {
        let mut tx = Transaction::default();
        for id in 0..5 {
            tx.add(id, Atom::new(Vec3::ZERO, 1));
        }
        assert!(tx.validate_shape(5).is_ok());
        tx.relocate(9, Atom::new(Vec3::ZERO, 1));
        assert!(matches!(
            tx.validate_shape(5),
            Err(TransactionError::TooLarge { count: 6, max: 5 })
        ));
    }

    #[test]
    fn test_occupancy_delta() {
        let mut tx = Transaction::default();
        tx.add(0, Atom::default());
        tx.add(1, Atom::default());
        tx.relocate(2, Atom::default());
        tx.remove(3);
        assert_eq!(tx.occupancy_delta(), 1);
    }

    #[test]
    fn test_crash_code_classes() {
        for code in [
            CrashCode::Ok,
            CrashCode::OutOfMemory,
            CrashCode::TooManyAtoms,
            CrashCode::TooManyReferences,
        ] {
            assert_eq!(CrashCode::from_u32(code as u32), Some(code));
        }
        assert_eq!(CrashCode::from_u32(0), None);
        assert!(CrashCode::OutOfMemory.is_allocator());
        assert!(CrashCode::TooManyAtoms.is_overflow());
        assert!(CrashCode::TooManyReferences.is_overflow());
        assert!(!CrashCode::Ok.is_overflow());
    }
}
