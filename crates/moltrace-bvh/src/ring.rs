/// Fixed-depth ring of per-frame resources indexed by `frame_id % depth`.
///
/// The host writes the entry of the frame it is recording; entries of the
/// other in-flight frames are left alone.
pub struct FrameRing<T> {
    entries: Vec<T>,
}

impl<T> FrameRing<T> {
    pub fn new(depth: usize, mut init: impl FnMut() -> T) -> Self {
        debug_assert!(depth > 0);
        Self {
            entries: (0..depth).map(|_| init()).collect(),
        }
    }

    pub fn depth(&self) -> usize {
        self.entries.len()
    }

    pub fn get(&self, frame_id: u32) -> &T {
        &self.entries[frame_id as usize % self.entries.len()]
    }

    pub fn get_mut(&mut self, frame_id: u32) -> &mut T {
        let depth = self.entries.len();
        &mut self.entries[frame_id as usize % depth]
    }
}
