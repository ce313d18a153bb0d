//! Range Allocator - Free List of Virtual Address Ranges
//!
//! Keeps the free sub-ranges of one reserved region, sorted by start and
//! never adjacent (touching ranges are merged on free).
//!
//! ```text
//! reserved:  ├──────────────────────────────────────────────────────┤
//! free:      [ small ][ ......... used ......... ][     large     ]
//!              ▲                                          ▲
//!              alloc_from_front                  alloc_from_back
//! ```
//!
//! Every structural change of a free range is reported to the registered
//! [`RangeCallbacks`] *before* the range is modified, so an observer sees the
//! range as it was plus the size of the change. The allocator itself knows
//! nothing about what the observer does with it.
//!
//! Not thread-safe: callers serialize every mutation (and the observer work
//! it triggers) behind one lock.

use super::range::VirtualMemory;
use std::collections::BTreeMap;

/// Callback fired with the affected free range
pub type RangeCallback = Box<dyn Fn(&VirtualMemory) + Send + Sync>;

/// Callback fired with the affected free range and the size of the change
pub type ResizeCallback = Box<dyn Fn(&VirtualMemory, usize) + Send + Sync>;

/// Observers of free range changes
#[derive(Default)]
pub struct RangeCallbacks {
    /// A new free range appeared
    pub on_create: Option<RangeCallback>,
    /// A free range was allocated in full
    pub on_destroy: Option<RangeCallback>,
    /// A free range gained `size` bytes below its start
    pub on_grow_front: Option<ResizeCallback>,
    /// A free range gained `size` bytes past its end
    pub on_grow_back: Option<ResizeCallback>,
    /// `size` bytes were allocated from the start of a free range
    pub on_shrink_front: Option<ResizeCallback>,
    /// `size` bytes were allocated from the end of a free range
    pub on_shrink_back: Option<ResizeCallback>,
}

/// RangeAllocator - first/last fit over sorted free ranges
#[derive(Default)]
pub struct RangeAllocator {
    /// start -> size
    free: BTreeMap<usize, usize>,
    callbacks: RangeCallbacks,
}

impl RangeAllocator {
    /// Create an allocator with no free space
    pub fn new() -> Self {
        Self::default()
    }

    /// Install observers, replacing any previous ones
    pub fn register_callbacks(&mut self, callbacks: RangeCallbacks) {
        self.callbacks = callbacks;
    }

    /// Lowest free address, if any
    pub fn peek_low_address(&self) -> Option<usize> {
        self.free.keys().next().copied()
    }

    /// Total free bytes
    pub fn free_bytes(&self) -> usize {
        self.free.values().sum()
    }

    /// Free ranges in address order
    pub fn free_ranges(&self) -> impl Iterator<Item = VirtualMemory> + '_ {
        self.free
            .iter()
            .map(|(&start, &size)| VirtualMemory::new(start, size))
    }

    /// Allocate `size` bytes from the lowest range that fits
    pub fn alloc_from_front(&mut self, size: usize) -> Option<usize> {
        let (start, area_size) = self
            .free
            .iter()
            .find(|(_, &area_size)| area_size >= size)
            .map(|(&start, &area_size)| (start, area_size))?;

        if area_size == size {
            self.destroy(start);
        } else {
            self.shrink_from_front(start, size);
        }
        Some(start)
    }

    /// Allocate up to `size` bytes from the lowest range
    ///
    /// Returns the start and the number of bytes actually handed out.
    pub fn alloc_from_front_at_most(&mut self, size: usize) -> Option<(usize, usize)> {
        let (&start, &area_size) = self.free.iter().next()?;

        if area_size <= size {
            self.destroy(start);
            Some((start, area_size))
        } else {
            self.shrink_from_front(start, size);
            Some((start, size))
        }
    }

    /// Allocate `size` bytes from the end of the highest range that fits
    pub fn alloc_from_back(&mut self, size: usize) -> Option<usize> {
        let (start, area_size) = self
            .free
            .iter()
            .rev()
            .find(|(_, &area_size)| area_size >= size)
            .map(|(&start, &area_size)| (start, area_size))?;

        if area_size == size {
            self.destroy(start);
            Some(start)
        } else {
            let new_start = self.shrink_from_back(start, size);
            Some(new_start)
        }
    }

    /// Allocate up to `size` bytes from the end of the highest range
    pub fn alloc_from_back_at_most(&mut self, size: usize) -> Option<(usize, usize)> {
        let (&start, &area_size) = self.free.iter().next_back()?;

        if area_size <= size {
            self.destroy(start);
            Some((start, area_size))
        } else {
            let new_start = self.shrink_from_back(start, size);
            Some((new_start, size))
        }
    }

    /// Return `[start, start + size)` to the free list
    ///
    /// # Panics
    /// If the range overlaps a free range.
    pub fn free(&mut self, start: usize, size: usize) {
        let end = start + size;

        let prev = self
            .free
            .range(..start)
            .next_back()
            .map(|(&s, &len)| (s, len));
        let next = self.free.range(start..).next().map(|(&s, &len)| (s, len));

        if let Some((prev_start, prev_size)) = prev {
            assert!(prev_start + prev_size <= start, "Freeing a free range");
        }
        if let Some((next_start, _)) = next {
            assert!(end <= next_start, "Freeing a free range");
        }

        let joins_prev = prev.filter(|&(s, len)| s + len == start);
        let joins_next = next.filter(|&(s, _)| s == end);

        match (joins_prev, joins_next) {
            (Some((prev_start, _)), Some((next_start, next_size))) => {
                // The next range is absorbed without a destroy notification;
                // the grow covers its bytes.
                self.grow_from_back(prev_start, size + next_size);
                self.free.remove(&next_start);
            }
            (Some((prev_start, _)), None) => {
                self.grow_from_back(prev_start, size);
            }
            (None, Some((next_start, _))) => {
                self.grow_from_front(next_start, size);
            }
            (None, None) => {
                self.create(start, size);
            }
        }
    }

    fn area(&self, start: usize) -> VirtualMemory {
        VirtualMemory::new(start, self.free[&start])
    }

    fn create(&mut self, start: usize, size: usize) {
        self.free.insert(start, size);
        if let Some(callback) = &self.callbacks.on_create {
            callback(&VirtualMemory::new(start, size));
        }
    }

    fn destroy(&mut self, start: usize) {
        let area = self.area(start);
        if let Some(callback) = &self.callbacks.on_destroy {
            callback(&area);
        }
        self.free.remove(&start);
    }

    fn shrink_from_front(&mut self, start: usize, size: usize) {
        let area = self.area(start);
        if let Some(callback) = &self.callbacks.on_shrink_front {
            callback(&area, size);
        }
        self.free.remove(&start);
        self.free.insert(start + size, area.size() - size);
    }

    fn shrink_from_back(&mut self, start: usize, size: usize) -> usize {
        let area = self.area(start);
        if let Some(callback) = &self.callbacks.on_shrink_back {
            callback(&area, size);
        }
        self.free.insert(start, area.size() - size);
        area.end() - size
    }

    fn grow_from_front(&mut self, start: usize, size: usize) {
        let area = self.area(start);
        if let Some(callback) = &self.callbacks.on_grow_front {
            callback(&area, size);
        }
        self.free.remove(&start);
        self.free.insert(start - size, area.size() + size);
    }

    fn grow_from_back(&mut self, start: usize, size: usize) {
        let area = self.area(start);
        if let Some(callback) = &self.callbacks.on_grow_back {
            callback(&area, size);
        }
        self.free.insert(start, area.size() + size);
    }
}
