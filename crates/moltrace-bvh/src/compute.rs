//! Software model of the compute device the build passes run on.
//!
//! Device memory is word-addressed and every access is atomic, so passes
//! share buffers across workers through `&self`. A dispatch launches
//! independent workers on the rayon pool and returns once all of them have
//! finished; that return is the device-wide barrier between dependent passes.
//! Within a cooperative group, lanes run phase by phase and each
//! [`Workgroup::phase`] call ends with a group barrier.

use rayon::prelude::*;
use std::sync::atomic::{AtomicU16, AtomicU32, Ordering};

use moltrace_core::constants::WORKGROUP_SIZE;

/// A buffer of 32-bit words in device memory.
pub struct DeviceBuffer {
    label: &'static str,
    words: Vec<AtomicU32>,
}

impl DeviceBuffer {
    pub fn new(label: &'static str, len: usize) -> Self {
        Self::filled(label, len, 0)
    }

    pub fn filled(label: &'static str, len: usize, value: u32) -> Self {
        Self {
            label,
            words: (0..len).map(|_| AtomicU32::new(value)).collect(),
        }
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    pub fn size_bytes(&self) -> u64 {
        self.words.len() as u64 * 4
    }

    #[inline]
    pub fn load(&self, index: usize) -> u32 {
        self.words[index].load(Ordering::Relaxed)
    }

    #[inline]
    pub fn store(&self, index: usize, value: u32) {
        self.words[index].store(value, Ordering::Relaxed);
    }

    #[inline]
    pub fn load_f32(&self, index: usize) -> f32 {
        f32::from_bits(self.load(index))
    }

    #[inline]
    pub fn store_f32(&self, index: usize, value: f32) {
        self.store(index, value.to_bits());
    }

    /// Returns the previous value.
    #[inline]
    pub fn fetch_add(&self, index: usize, value: u32) -> u32 {
        self.words[index].fetch_add(value, Ordering::Relaxed)
    }

    #[inline]
    pub fn fetch_sub(&self, index: usize, value: u32) -> u32 {
        self.words[index].fetch_sub(value, Ordering::Relaxed)
    }

    #[inline]
    pub fn fetch_or(&self, index: usize, value: u32) -> u32 {
        self.words[index].fetch_or(value, Ordering::Relaxed)
    }

    /// Returns `Ok(previous)` on success, `Err(actual)` otherwise.
    #[inline]
    pub fn compare_exchange(&self, index: usize, current: u32, new: u32) -> Result<u32, u32> {
        self.words[index].compare_exchange(current, new, Ordering::AcqRel, Ordering::Acquire)
    }

    /// Store with release ordering, publishing earlier relaxed writes.
    #[inline]
    pub fn store_release(&self, index: usize, value: u32) {
        self.words[index].store(value, Ordering::Release);
    }

    #[inline]
    pub fn load_acquire(&self, index: usize) -> u32 {
        self.words[index].load(Ordering::Acquire)
    }

    pub fn fill(&self, value: u32) {
        self.words
            .par_iter()
            .for_each(|w| w.store(value, Ordering::Relaxed));
    }

    /// Host readback of a range.
    pub fn read_range(&self, start: usize, len: usize) -> Vec<u32> {
        self.words[start..start + len]
            .iter()
            .map(|w| w.load(Ordering::Relaxed))
            .collect()
    }

    pub fn snapshot(&self) -> Vec<u32> {
        self.read_range(0, self.words.len())
    }
}

/// A buffer of 16-bit words in device memory.
pub struct DeviceBuffer16 {
    label: &'static str,
    words: Vec<AtomicU16>,
}

impl DeviceBuffer16 {
    pub fn new(label: &'static str, len: usize) -> Self {
        Self {
            label,
            words: (0..len).map(|_| AtomicU16::new(0)).collect(),
        }
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    pub fn size_bytes(&self) -> u64 {
        self.words.len() as u64 * 2
    }

    #[inline]
    pub fn load(&self, index: usize) -> u16 {
        self.words[index].load(Ordering::Relaxed)
    }

    #[inline]
    pub fn store(&self, index: usize, value: u16) {
        self.words[index].store(value, Ordering::Relaxed);
    }

    pub fn read_range(&self, start: usize, len: usize) -> Vec<u16> {
        self.words[start..start + len]
            .iter()
            .map(|w| w.load(Ordering::Relaxed))
            .collect()
    }
}

/// Launch `count` independent workers.
pub fn dispatch<F>(count: u32, kernel: F)
where
    F: Fn(u32) + Sync + Send,
{
    (0..count).into_par_iter().for_each(kernel);
}

/// Launch one cooperative group per item, each owning its item exclusively.
pub fn dispatch_groups<T, F>(items: &mut [T], kernel: F)
where
    T: Send,
    F: Fn(&Workgroup, &mut T) + Sync + Send,
{
    let group = Workgroup::new(WORKGROUP_SIZE);
    items.par_iter_mut().for_each(|item| kernel(&group, item));
}

/// A cooperative group of lanes sharing group-local memory.
#[derive(Debug, Clone, Copy)]
pub struct Workgroup {
    size: u32,
}

impl Workgroup {
    pub fn new(size: u32) -> Self {
        debug_assert!(size.is_power_of_two());
        Self { size }
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    /// Every lane runs `body`; the call returns after the group barrier.
    pub fn phase(&self, mut body: impl FnMut(u32)) {
        for lane in 0..self.size {
            body(lane);
        }
    }

    /// Lanes split `count` items with a stride of the group size.
    pub fn strided(&self, count: u32, mut body: impl FnMut(u32)) {
        let size = self.size;
        self.phase(|lane| {
            let mut item = lane;
            while item < count {
                body(item);
                item += size;
            }
        });
    }
}

/// Exclusive prefix sum over `values` in place, returning the total.
///
/// Each lane reduces a contiguous run of values, the lane totals are
/// scanned across the group in log2(size) barrier-separated steps, and
/// each lane then carries its scanned offset back into its run.
pub fn exclusive_scan(group: &Workgroup, values: &mut [u32]) -> u32 {
    let size = group.size() as usize;
    let len = values.len();
    let per_lane = len.div_ceil(size);
    let run = |lane: usize| {
        let start = (lane * per_lane).min(len);
        let end = (start + per_lane).min(len);
        start..end
    };

    let mut lane_sums = vec![0u32; size];
    group.phase(|lane| {
        let lane = lane as usize;
        lane_sums[lane] = values[run(lane)].iter().sum();
    });

    // Hillis-Steele inclusive scan over lane totals.
    let mut scratch = vec![0u32; size];
    let mut stride = 1;
    while stride < size {
        group.phase(|lane| {
            let lane = lane as usize;
            scratch[lane] = if lane >= stride {
                lane_sums[lane] + lane_sums[lane - stride]
            } else {
                lane_sums[lane]
            };
        });
        std::mem::swap(&mut lane_sums, &mut scratch);
        stride *= 2;
    }

    let total = lane_sums[size - 1];
    group.phase(|lane| {
        let lane = lane as usize;
        let range = run(lane);
        let run_sum: u32 = values[range.clone()].iter().sum();
        let mut carry = lane_sums[lane] - run_sum;
        for v in &mut values[range] {
            let count = *v;
            *v = carry;
            carry += count;
        }
    });
    total
}
