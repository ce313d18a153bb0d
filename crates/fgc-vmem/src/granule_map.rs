//! Granule Map - Flat Per-Granule Metadata Table
//!
//! Maps a granule-aligned heap offset to one word of metadata. The table is
//! a single anonymous mapping, so a map covering a 16TB offset space only
//! costs physical memory for the slots actually touched.
//!
//! ```text
//! offset:  0        2M       4M       6M       8M
//!          ├────────┼────────┼────────┼────────┤
//! slot:    [   0   ][   1   ][   2   ][   3   ]      index = offset >> granule_shift
//! ```
//!
//! Every slot is an `AtomicUsize`. Plain `get`/`put` are relaxed; readers
//! that race with a publisher use `get_acquire` against `release_put` and
//! see either the previous value or the complete new one.

use memmap2::{MmapMut, MmapOptions};
use std::marker::PhantomData;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Value storable in a granule slot
///
/// The all-zero word is the empty sentinel a fresh map is filled with.
pub trait GranuleValue: Copy {
    fn to_word(self) -> usize;
    fn from_word(word: usize) -> Self;
}

impl GranuleValue for usize {
    fn to_word(self) -> usize {
        self
    }

    fn from_word(word: usize) -> Self {
        word
    }
}

impl GranuleValue for Option<NonZeroUsize> {
    fn to_word(self) -> usize {
        self.map_or(0, NonZeroUsize::get)
    }

    fn from_word(word: usize) -> Self {
        NonZeroUsize::new(word)
    }
}

/// GranuleMap - offset indexed metadata table
pub struct GranuleMap<T: GranuleValue> {
    granule_shift: u32,
    len: usize,
    slots: *const AtomicUsize,
    // Owns the memory behind `slots`.
    _storage: MmapMut,
    _marker: PhantomData<T>,
}

// SAFETY: slots are only ever accessed through atomics.
unsafe impl<T: GranuleValue + Send> Send for GranuleMap<T> {}
unsafe impl<T: GranuleValue + Sync> Sync for GranuleMap<T> {}

impl<T: GranuleValue> GranuleMap<T> {
    /// Create a map covering `[0, max_offset)`
    ///
    /// # Panics
    /// If `granule_size` is not a power of two or `max_offset` is not
    /// granule aligned.
    pub fn new(max_offset: usize, granule_size: usize) -> Self {
        assert!(granule_size.is_power_of_two(), "Invalid granule size");
        assert!(max_offset % granule_size == 0, "Misaligned max offset");

        let granule_shift = granule_size.trailing_zeros();
        let len = max_offset >> granule_shift;
        let bytes = (len * std::mem::size_of::<AtomicUsize>()).max(1);

        let mut storage = MmapOptions::new()
            .len(bytes)
            .map_anon()
            .unwrap_or_else(|e| {
                panic!(
                    "Failed to allocate granule map ({} entries): {}",
                    len, e
                )
            });

        // Anonymous memory is zero-filled, which is a valid AtomicUsize
        // holding the empty sentinel.
        let slots = storage.as_mut_ptr() as *const AtomicUsize;

        Self {
            granule_shift,
            len,
            slots,
            _storage: storage,
            _marker: PhantomData,
        }
    }

    fn slot(&self, offset: usize) -> &AtomicUsize {
        let index = offset >> self.granule_shift;
        assert!(
            index < self.len,
            "Invalid index: offset {:#x} beyond max offset {:#x}",
            offset,
            self.max_offset()
        );
        // SAFETY: index is bounds checked and the mapping lives as long as self.
        unsafe { &*self.slots.add(index) }
    }

    /// Number of granule slots
    pub fn granule_count(&self) -> usize {
        self.len
    }

    /// Granule size in bytes
    pub fn granule_size(&self) -> usize {
        1 << self.granule_shift
    }

    /// First offset not covered by the map
    pub fn max_offset(&self) -> usize {
        self.len << self.granule_shift
    }

    pub fn get(&self, offset: usize) -> T {
        T::from_word(self.slot(offset).load(Ordering::Relaxed))
    }

    pub fn put(&self, offset: usize, value: T) {
        self.slot(offset).store(value.to_word(), Ordering::Relaxed);
    }

    /// Fill every slot in `[offset, offset + size)` with `value`
    pub fn put_range(&self, offset: usize, size: usize, value: T) {
        assert!(
            size & (self.granule_size() - 1) == 0,
            "Misaligned size {:#x}",
            size
        );

        let word = value.to_word();
        let mut current = offset;
        let end = offset + size;
        while current < end {
            self.slot(current).store(word, Ordering::Relaxed);
            current += self.granule_size();
        }
    }

    pub fn get_acquire(&self, offset: usize) -> T {
        T::from_word(self.slot(offset).load(Ordering::Acquire))
    }

    pub fn release_put(&self, offset: usize, value: T) {
        self.slot(offset).store(value.to_word(), Ordering::Release);
    }

    /// Iterate over `(offset, value)` for every slot
    pub fn iter(&self) -> impl Iterator<Item = (usize, T)> + '_ {
        (0..self.len).map(move |index| {
            let offset = index << self.granule_shift;
            (offset, self.get(offset))
        })
    }
}
