//! Device-side atom table: the address space the build passes read.

use glam::Vec3;

use moltrace_core::constants::ATOM_OCCUPIED_BIT;
use moltrace_core::error::TransactionError;
use moltrace_core::grid::VoxelGrid;
use moltrace_core::types::{Atom, AtomId, GpuAtom, Transaction};

use crate::compute::DeviceBuffer;

const ATOM_WORDS: usize = 4;
const MOTION_WORDS: usize = 3;

pub struct AtomTable {
    /// Four words per atom, laid out as [`GpuAtom`].
    atoms: DeviceBuffer,
    occupied: DeviceBuffer,
    /// `previous - current` position for atoms moved this frame.
    motion_vectors: DeviceBuffer,
    /// Frame tag + 1 of the last frame that moved or added the atom.
    transaction_marks: DeviceBuffer,
    occupied_count: DeviceBuffer,
    capacity: u32,
}

impl AtomTable {
    pub fn new(capacity: u32) -> Self {
        let n = capacity as usize;
        let table = Self {
            atoms: DeviceBuffer::new("atoms", n * ATOM_WORDS),
            occupied: DeviceBuffer::new("atoms_occupied", n),
            motion_vectors: DeviceBuffer::new("motion_vectors", n * MOTION_WORDS),
            transaction_marks: DeviceBuffer::new("transaction_marks", n),
            occupied_count: DeviceBuffer::new("occupied_count", 1),
            capacity,
        };
        log::info!(
            "AtomTable: capacity {} atoms, {:.1} MB",
            capacity,
            table.size_bytes() as f64 / (1024.0 * 1024.0)
        );
        table
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn size_bytes(&self) -> u64 {
        self.atoms.size_bytes()
            + self.occupied.size_bytes()
            + self.motion_vectors.size_bytes()
            + self.transaction_marks.size_bytes()
    }

    pub fn occupied_count(&self) -> u32 {
        self.occupied_count.load(0)
    }

    #[inline]
    pub fn is_occupied(&self, id: AtomId) -> bool {
        self.occupied.load(id as usize) != 0
    }

    pub(crate) fn set_occupied(&self, id: AtomId, occupied: bool) {
        let was = self.occupied.load(id as usize) != 0;
        if was == occupied {
            return;
        }
        self.occupied.store(id as usize, occupied as u32);
        if occupied {
            self.occupied_count.fetch_add(0, 1);
        } else {
            self.occupied_count.fetch_sub(0, 1);
        }
    }

    /// Raw record, readable whether or not the slot is occupied.
    #[inline]
    pub fn record(&self, id: AtomId) -> GpuAtom {
        let base = id as usize * ATOM_WORDS;
        GpuAtom {
            position: [
                self.atoms.load_f32(base),
                self.atoms.load_f32(base + 1),
                self.atoms.load_f32(base + 2),
            ],
            packed: self.atoms.load(base + 3),
        }
    }

    #[inline]
    pub fn position(&self, id: AtomId) -> Vec3 {
        Vec3::from_array(self.record(id).position)
    }

    #[inline]
    pub fn element(&self, id: AtomId) -> u8 {
        self.record(id).element()
    }

    /// The atom in an occupied slot.
    pub fn get(&self, id: AtomId) -> Option<Atom> {
        if id >= self.capacity || !self.is_occupied(id) {
            return None;
        }
        Some(self.record(id).to_atom())
    }

    pub(crate) fn write(&self, id: AtomId, atom: Atom) {
        let gpu = atom.to_gpu();
        let base = id as usize * ATOM_WORDS;
        self.atoms.store_f32(base, gpu.position[0]);
        self.atoms.store_f32(base + 1, gpu.position[1]);
        self.atoms.store_f32(base + 2, gpu.position[2]);
        self.atoms.store(base + 3, gpu.packed);
    }

    pub fn motion_vector(&self, id: AtomId) -> Vec3 {
        let base = id as usize * MOTION_WORDS;
        Vec3::new(
            self.motion_vectors.load_f32(base),
            self.motion_vectors.load_f32(base + 1),
            self.motion_vectors.load_f32(base + 2),
        )
    }

    pub(crate) fn set_motion_vector(&self, id: AtomId, motion: Vec3) {
        let base = id as usize * MOTION_WORDS;
        self.motion_vectors.store_f32(base, motion.x);
        self.motion_vectors.store_f32(base + 1, motion.y);
        self.motion_vectors.store_f32(base + 2, motion.z);
    }

    pub(crate) fn mark_inserted(&self, id: AtomId, frame_id: u32) {
        self.transaction_marks
            .store(id as usize, frame_id.wrapping_add(1));
    }

    /// True if the atom was moved or added in `frame_id`.
    #[inline]
    pub fn inserted_in(&self, id: AtomId, frame_id: u32) -> bool {
        self.transaction_marks.load(id as usize) == frame_id.wrapping_add(1)
    }

    /// Occupied IDs in ascending order.
    pub fn occupied_ids(&self) -> Vec<AtomId> {
        (0..self.capacity).filter(|&id| self.is_occupied(id)).collect()
    }

    /// Record as mirrored to the GPU, with the occupancy bit.
    pub fn mirror_record(&self, id: AtomId) -> GpuAtom {
        let mut record = self.record(id);
        if self.is_occupied(id) {
            record.packed |= ATOM_OCCUPIED_BIT;
        }
        record
    }

    /// Full mirror array for upload.
    pub fn gpu_atoms(&self) -> Vec<GpuAtom> {
        (0..self.capacity).map(|id| self.mirror_record(id)).collect()
    }

    /// Check a transaction against the current table. Nothing is modified.
    pub fn validate(
        &self,
        tx: &Transaction,
        grid: &VoxelGrid,
        max_transaction_atoms: u32,
    ) -> Result<(), TransactionError> {
        tx.validate_shape(max_transaction_atoms)?;

        let in_range = |id: AtomId| {
            if id >= self.capacity {
                Err(TransactionError::IdOutOfRange {
                    id,
                    capacity: self.capacity,
                })
            } else {
                Ok(())
            }
        };
        let in_bounds = |id: AtomId, atom: &Atom| {
            if grid.contains_position(atom.position) {
                Ok(())
            } else {
                Err(TransactionError::OutOfBounds {
                    id,
                    position: atom.position.to_array(),
                })
            }
        };

        for &id in tx.removed_ids.iter().chain(tx.moved_ids.iter()) {
            in_range(id)?;
            if !self.is_occupied(id) {
                return Err(TransactionError::NotOccupied(id));
            }
        }
        for &id in &tx.added_ids {
            in_range(id)?;
            if self.is_occupied(id) {
                return Err(TransactionError::AlreadyOccupied(id));
            }
        }
        for (id, atom) in tx
            .moved_ids
            .iter()
            .zip(&tx.moved_atoms)
            .chain(tx.added_ids.iter().zip(&tx.added_atoms))
        {
            in_bounds(*id, atom)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use moltrace_core::WorldConfig;

    fn grid() -> VoxelGrid {
        VoxelGrid::new(&WorldConfig {
            world_dimension: 32.0,
            ..WorldConfig::default()
        })
    }

    fn carbon(x: f32) -> Atom {
        Atom::new(Vec3::new(x, 0.5, 0.5), 6)
    }

    #[test]
    fn test_write_and_read_back() {
        let table = AtomTable::new(4);
        table.write(2, carbon(1.5));
        table.set_occupied(2, true);
        assert_eq!(table.get(2), Some(carbon(1.5)));
        assert_eq!(table.get(1), None);
        assert_eq!(table.occupied_count(), 1);
        assert_eq!(table.occupied_ids(), vec![2]);
    }

    #[test]
    fn test_mirror_record_carries_occupancy() {
        let table = AtomTable::new(2);
        table.write(0, carbon(1.5));
        table.set_occupied(0, true);
        table.write(1, carbon(2.5));
        assert_eq!(table.mirror_record(0).packed & ATOM_OCCUPIED_BIT, ATOM_OCCUPIED_BIT);
        assert_eq!(table.mirror_record(0).element(), 6);
        assert_eq!(table.mirror_record(1).packed & ATOM_OCCUPIED_BIT, 0);
        table.set_occupied(0, false);
        assert_eq!(table.gpu_atoms()[0].packed & ATOM_OCCUPIED_BIT, 0);
    }

    #[test]
    fn test_set_occupied_is_idempotent_for_count() {
        let table = AtomTable::new(2);
        table.set_occupied(0, true);
        table.set_occupied(0, true);
        assert_eq!(table.occupied_count(), 1);
        table.set_occupied(0, false);
        table.set_occupied(0, false);
        assert_eq!(table.occupied_count(), 0);
    }

    #[test]
    fn test_inserted_marks_are_frame_scoped() {
        let table = AtomTable::new(2);
        table.mark_inserted(1, 5);
        assert!(table.inserted_in(1, 5));
        assert!(!table.inserted_in(1, 6));
        assert!(!table.inserted_in(0, 5));
    }

    #[test]
    fn test_validate_rejects_remove_of_vacant() {
        let table = AtomTable::new(4);
        let mut tx = Transaction::default();
        tx.remove(1);
        assert_eq!(
            table.validate(&tx, &grid(), 16),
            Err(TransactionError::NotOccupied(1))
        );
    }

    #[test]
    fn test_validate_rejects_add_of_occupied() {
        let table = AtomTable::new(4);
        table.set_occupied(3, true);
        let mut tx = Transaction::default();
        tx.add(3, carbon(0.0));
        assert_eq!(
            table.validate(&tx, &grid(), 16),
            Err(TransactionError::AlreadyOccupied(3))
        );
    }

    #[test]
    fn test_validate_rejects_out_of_range_and_bounds() {
        let table = AtomTable::new(4);
        let mut tx = Transaction::default();
        tx.add(4, carbon(0.0));
        assert!(matches!(
            table.validate(&tx, &grid(), 16),
            Err(TransactionError::IdOutOfRange { id: 4, capacity: 4 })
        ));

        let mut tx = Transaction::default();
        tx.add(0, carbon(100.0));
        assert!(matches!(
            table.validate(&tx, &grid(), 16),
            Err(TransactionError::OutOfBounds { id: 0, .. })
        ));

        let mut tx = Transaction::default();
        tx.add(0, carbon(f32::NAN));
        assert!(table.validate(&tx, &grid(), 16).is_err());
    }

    #[test]
    fn test_motion_vector_roundtrip() {
        let table = AtomTable::new(1);
        table.set_motion_vector(0, Vec3::new(-0.5, 0.25, 0.0));
        assert_eq!(table.motion_vector(0), Vec3::new(-0.5, 0.25, 0.0));
    }
}
