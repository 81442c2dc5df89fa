use moltrace_core::error::TransactionError;
use moltrace_core::types::{Atom, AtomId, Transaction};

/// Host-side atom slot table.
///
/// Edits are free-form between frames; [`AtomStore::register_changes`]
/// diffs the table against the last registered state and emits one
/// transaction describing the net change.
pub struct AtomStore {
    atoms: Vec<Atom>,
    occupied: Vec<bool>,
    /// State as of the last `register_changes`.
    registered_atoms: Vec<Atom>,
    registered_occupied: Vec<bool>,
    /// IDs edited since the last `register_changes`, deduplicated by `edited`.
    edit_list: Vec<AtomId>,
    edited: Vec<bool>,
    occupied_count: u32,
    /// Lowest ID that may be vacant.
    vacant_hint: u32,
}

impl AtomStore {
    pub fn new(capacity: u32) -> Self {
        let n = capacity as usize;
        Self {
            atoms: vec![Atom::default(); n],
            occupied: vec![false; n],
            registered_atoms: vec![Atom::default(); n],
            registered_occupied: vec![false; n],
            edit_list: Vec::new(),
            edited: vec![false; n],
            occupied_count: 0,
            vacant_hint: 0,
        }
    }

    pub fn capacity(&self) -> u32 {
        self.atoms.len() as u32
    }

    /// Number of occupied slots.
    pub fn len(&self) -> u32 {
        self.occupied_count
    }

    pub fn is_empty(&self) -> bool {
        self.occupied_count == 0
    }

    pub fn get(&self, id: AtomId) -> Option<Atom> {
        let i = id as usize;
        match self.occupied.get(i) {
            Some(true) => Some(self.atoms[i]),
            _ => None,
        }
    }

    fn check_range(&self, id: AtomId) -> Result<usize, TransactionError> {
        if id >= self.capacity() {
            return Err(TransactionError::IdOutOfRange {
                id,
                capacity: self.capacity(),
            });
        }
        Ok(id as usize)
    }

    fn mark_edited(&mut self, i: usize) {
        if !self.edited[i] {
            self.edited[i] = true;
            self.edit_list.push(i as AtomId);
        }
    }

    /// Write an atom into a slot, occupying it. Returns the previous atom if any.
    pub fn set(&mut self, id: AtomId, atom: Atom) -> Result<Option<Atom>, TransactionError> {
        let i = self.check_range(id)?;
        let previous = self.get(id);
        if previous.is_none() {
            self.occupied[i] = true;
            self.occupied_count += 1;
        }
        self.atoms[i] = atom;
        self.mark_edited(i);
        Ok(previous)
    }

    /// Occupy the lowest vacant slot. Returns `None` when the table is full.
    pub fn push(&mut self, atom: Atom) -> Option<AtomId> {
        let start = self.vacant_hint as usize;
        let offset = self.occupied[start..].iter().position(|&o| !o)?;
        let id = (start + offset) as AtomId;
        self.vacant_hint = id + 1;
        self.set(id, atom).ok()?;
        Some(id)
    }

    /// Vacate a slot. Returns the atom it held.
    pub fn remove(&mut self, id: AtomId) -> Result<Option<Atom>, TransactionError> {
        let i = self.check_range(id)?;
        let previous = self.get(id);
        if previous.is_some() {
            self.occupied[i] = false;
            self.occupied_count -= 1;
            self.vacant_hint = self.vacant_hint.min(id);
            self.mark_edited(i);
        }
        Ok(previous)
    }

    /// Occupied atoms in ID order.
    pub fn iter(&self) -> impl Iterator<Item = (AtomId, Atom)> + '_ {
        self.occupied
            .iter()
            .enumerate()
            .filter(|(_, &o)| o)
            .map(|(i, _)| (i as AtomId, self.atoms[i]))
    }

    /// Net diff since the previous call, with IDs in ascending order.
    ///
    /// An atom added and removed within one frame produces nothing. An
    /// atom rewritten with identical contents produces nothing.
    pub fn register_changes(&mut self) -> Transaction {
        let mut edits = std::mem::take(&mut self.edit_list);
        edits.sort_unstable();

        let mut tx = Transaction::default();
        for &id in &edits {
            let i = id as usize;
            self.edited[i] = false;
            match (self.registered_occupied[i], self.occupied[i]) {
                (false, true) => tx.add(id, self.atoms[i]),
                (true, false) => tx.remove(id),
                (true, true) if self.registered_atoms[i] != self.atoms[i] => {
                    tx.relocate(id, self.atoms[i])
                }
                _ => {}
            }
            self.registered_occupied[i] = self.occupied[i];
            self.registered_atoms[i] = self.atoms[i];
        }

        if !tx.is_empty() {
            log::debug!(
                "AtomStore: registered +{} ~{} -{}",
                tx.added_ids.len(),
                tx.moved_ids.len(),
                tx.removed_ids.len()
            );
        }
        edits.clear();
        self.edit_list = edits;
        tx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;

    fn carbon(x: f32) -> Atom {
        Atom::new(Vec3::new(x, 0.0, 0.0), 6)
    }

    #[test]
    fn test_empty_registers_nothing() {
        let mut store = AtomStore::new(8);
        assert!(store.register_changes().is_empty());
    }

    #[test]
    fn test_add_then_move_then_remove() {
        let mut store = AtomStore::new(8);
        store.set(3, carbon(1.0)).unwrap();
        let tx = store.register_changes();
        assert_eq!(tx.added_ids, vec![3]);
        assert_eq!(tx.added_atoms, vec![carbon(1.0)]);

        store.set(3, carbon(2.0)).unwrap();
        let tx = store.register_changes();
        assert_eq!(tx.moved_ids, vec![3]);
        assert!(tx.added_ids.is_empty());

        store.remove(3).unwrap();
        let tx = store.register_changes();
        assert_eq!(tx.removed_ids, vec![3]);
        assert!(store.is_empty());
    }

    #[test]
    fn test_add_and_remove_same_frame_cancels() {
        let mut store = AtomStore::new(8);
        store.set(1, carbon(0.0)).unwrap();
        store.remove(1).unwrap();
        assert!(store.register_changes().is_empty());
    }

    #[test]
    fn test_identical_rewrite_is_not_a_move() {
        let mut store = AtomStore::new(8);
        store.set(0, carbon(0.5)).unwrap();
        store.register_changes();
        store.set(0, carbon(0.5)).unwrap();
        assert!(store.register_changes().is_empty());
    }

    #[test]
    fn test_push_fills_lowest_vacant() {
        let mut store = AtomStore::new(3);
        assert_eq!(store.push(carbon(0.0)), Some(0));
        assert_eq!(store.push(carbon(0.0)), Some(1));
        store.remove(0).unwrap();
        assert_eq!(store.push(carbon(0.0)), Some(0));
        assert_eq!(store.push(carbon(0.0)), Some(2));
        assert_eq!(store.push(carbon(0.0)), None);
        assert_eq!(store.len(), 3);
    }

    #[test]
    fn test_out_of_range() {
        let mut store = AtomStore::new(2);
        assert_eq!(
            store.set(2, carbon(0.0)),
            Err(TransactionError::IdOutOfRange { id: 2, capacity: 2 })
        );
    }

    #[test]
    fn test_changes_sorted_by_id() {
        let mut store = AtomStore::new(16);
        for id in [9, 2, 5] {
            store.set(id, carbon(id as f32)).unwrap();
        }
        let tx = store.register_changes();
        assert_eq!(tx.added_ids, vec![2, 5, 9]);
        assert_eq!(tx.occupancy_delta(), 3);
    }

    #[test]
    fn test_iter_occupied() {
        let mut store = AtomStore::new(4);
        store.set(1, carbon(1.0)).unwrap();
        store.set(3, carbon(3.0)).unwrap();
        let ids: Vec<_> = store.iter().map(|(id, _)| id).collect();
        assert_eq!(ids, vec![1, 3]);
    }
}
