//! Placeholders - Ledger and Free Range Tiling Policy
//!
//! A placeholder reserves address space without any backing. The layer keeps
//! one invariant over every reserved region:
//!
//! ```text
//! offsets:   [ free ............ ][G][G][G][ free ...... ][G]
//! OS state:  [ one placeholder   ][V][V][P][ placeholder ][V]
//!                                  ▲        ▲
//!                                  view     granule placeholder, allocated
//!                                           but not mapped
//! ```
//!
//! Free ranges are covered by exactly one placeholder each. Allocated ranges
//! are cut into granule-sized placeholders, because a view can only replace
//! a placeholder of exactly its own size.
//!
//! [`PlaceholderLedger`] records placeholders and views and enforces the
//! replacement rules of the Windows placeholder API. On unix it is the only
//! place those rules exist; on Windows it shadows the kernel.
//!
//! [`PlaceholderCallbacks`] turns range allocator notifications into
//! split/coalesce calls that keep the invariant.

use crate::memory::{RangeCallback, RangeCallbacks, ResizeCallback, VirtualMemory};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

/// Placeholder rule violations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlaceholderError {
    #[error("Range {addr:#x}+{size:#x} overlaps an existing reservation")]
    Overlap { addr: usize, size: usize },

    #[error("Range {addr:#x}+{size:#x} is not a strict sub-range of one placeholder")]
    NotSubRange { addr: usize, size: usize },

    #[error("Range {addr:#x}+{size:#x} is not tiled by adjacent placeholders")]
    NotTiled { addr: usize, size: usize },

    #[error("No placeholder at exactly {addr:#x}+{size:#x}")]
    NoExactPlaceholder { addr: usize, size: usize },

    #[error("No view at exactly {addr:#x}+{size:#x}")]
    NoExactView { addr: usize, size: usize },
}

/// Record of placeholders and mapped views
#[derive(Debug, Default, Clone)]
pub struct PlaceholderLedger {
    placeholders: BTreeMap<usize, usize>,
    views: BTreeMap<usize, usize>,
}

impl PlaceholderLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn overlaps(map: &BTreeMap<usize, usize>, addr: usize, size: usize) -> bool {
        let end = addr + size;
        if let Some((&start, &len)) = map.range(..addr).next_back() {
            if start + len > addr {
                return true;
            }
        }
        map.range(addr..end).next().is_some()
    }

    fn containing(&self, addr: usize) -> Option<(usize, usize)> {
        self.placeholders
            .range(..=addr)
            .next_back()
            .map(|(&start, &len)| (start, len))
            .filter(|&(start, len)| addr < start + len)
    }

    /// Install one placeholder over fresh address space
    pub fn reserve(&mut self, addr: usize, size: usize) -> Result<(), PlaceholderError> {
        if Self::overlaps(&self.placeholders, addr, size) || Self::overlaps(&self.views, addr, size)
        {
            return Err(PlaceholderError::Overlap { addr, size });
        }
        self.placeholders.insert(addr, size);
        Ok(())
    }

    /// Release exactly one placeholder
    pub fn unreserve(&mut self, addr: usize, size: usize) -> Result<(), PlaceholderError> {
        match self.placeholders.get(&addr) {
            Some(&len) if len == size => {
                self.placeholders.remove(&addr);
                Ok(())
            }
            _ => Err(PlaceholderError::NoExactPlaceholder { addr, size }),
        }
    }

    /// Cut `[addr, addr + size)` out of the placeholder containing it
    ///
    /// The range must be a strict sub-range; splitting a placeholder at its
    /// own bounds is rejected.
    pub fn split(&mut self, addr: usize, size: usize) -> Result<(), PlaceholderError> {
        let (start, len) = self
            .containing(addr)
            .ok_or(PlaceholderError::NotSubRange { addr, size })?;
        let end = start + len;

        if size == 0 || addr + size > end || (addr == start && size == len) {
            return Err(PlaceholderError::NotSubRange { addr, size });
        }

        self.placeholders.remove(&start);
        if start < addr {
            self.placeholders.insert(start, addr - start);
        }
        self.placeholders.insert(addr, size);
        if addr + size < end {
            self.placeholders.insert(addr + size, end - (addr + size));
        }
        Ok(())
    }

    /// Merge the adjacent placeholders exactly tiling `[addr, addr + size)`
    pub fn coalesce(&mut self, addr: usize, size: usize) -> Result<(), PlaceholderError> {
        let end = addr + size;
        let mut cursor = addr;
        let mut pieces = Vec::new();

        while cursor < end {
            match self.placeholders.get(&cursor) {
                Some(&len) if cursor + len <= end => {
                    pieces.push(cursor);
                    cursor += len;
                }
                _ => return Err(PlaceholderError::NotTiled { addr, size }),
            }
        }

        for start in pieces {
            self.placeholders.remove(&start);
        }
        self.placeholders.insert(addr, size);
        Ok(())
    }

    /// Replace the placeholder at exactly `[addr, addr + size)` with a view
    pub fn replace_with_view(&mut self, addr: usize, size: usize) -> Result<(), PlaceholderError> {
        match self.placeholders.get(&addr) {
            Some(&len) if len == size => {
                self.placeholders.remove(&addr);
                self.views.insert(addr, size);
                Ok(())
            }
            _ => Err(PlaceholderError::NoExactPlaceholder { addr, size }),
        }
    }

    /// Replace the view at exactly `[addr, addr + size)` with a placeholder
    pub fn restore_placeholder(&mut self, addr: usize, size: usize) -> Result<(), PlaceholderError> {
        match self.views.get(&addr) {
            Some(&len) if len == size => {
                self.views.remove(&addr);
                self.placeholders.insert(addr, size);
                Ok(())
            }
            _ => Err(PlaceholderError::NoExactView { addr, size }),
        }
    }

    fn intersecting(
        map: &BTreeMap<usize, usize>,
        addr: usize,
        size: usize,
    ) -> Vec<(usize, usize)> {
        let end = addr + size;
        let mut result = Vec::new();
        if let Some((&start, &len)) = map.range(..addr).next_back() {
            if start + len > addr {
                result.push((start, len));
            }
        }
        result.extend(map.range(addr..end).map(|(&start, &len)| (start, len)));
        result
    }

    /// Placeholders intersecting `[addr, addr + size)`
    pub fn placeholders(&self, addr: usize, size: usize) -> Vec<(usize, usize)> {
        Self::intersecting(&self.placeholders, addr, size)
    }

    /// Views intersecting `[addr, addr + size)`
    pub fn views(&self, addr: usize, size: usize) -> Vec<(usize, usize)> {
        Self::intersecting(&self.views, addr, size)
    }

    pub fn placeholder_count(&self) -> usize {
        self.placeholders.len()
    }

    pub fn view_count(&self) -> usize {
        self.views.len()
    }
}

/// Placeholder split/coalesce primitives
///
/// Failures are not reported back: an implementation that cannot honor a
/// call has hit a broken invariant and must not return.
pub trait PlaceholderOps: Send + Sync {
    fn split_placeholder(&self, addr: usize, size: usize);
    fn coalesce_placeholders(&self, addr: usize, size: usize);
}

/// Tiling policy applied to every heap view of a free range
pub struct PlaceholderCallbacks {
    ops: Arc<dyn PlaceholderOps>,
    view_bits: Vec<usize>,
    granule_size: usize,
}

impl PlaceholderCallbacks {
    /// `view_bits` are OR-ed onto heap offsets to address each view
    pub fn new(ops: Arc<dyn PlaceholderOps>, view_bits: Vec<usize>, granule_size: usize) -> Self {
        Self {
            ops,
            view_bits,
            granule_size,
        }
    }

    fn split_placeholder(&self, start: usize, size: usize) {
        for &bit in &self.view_bits {
            self.ops.split_placeholder(start | bit, size);
        }
    }

    fn coalesce_placeholders(&self, start: usize, size: usize) {
        for &bit in &self.view_bits {
            self.ops.coalesce_placeholders(start | bit, size);
        }
    }

    /// Cut the single placeholder `[start, start + size)` into granules
    fn split_into_granules(&self, start: usize, size: usize) {
        assert!(size % self.granule_size == 0, "Must be granule aligned");

        // The last granule is what remains once the others are cut off;
        // splitting it would name a whole placeholder.
        let last = start + size - self.granule_size;
        let mut addr = start;
        while addr < last {
            self.split_placeholder(addr, self.granule_size);
            addr += self.granule_size;
        }
    }

    /// A new free range becomes one placeholder
    pub fn on_create(&self, range: &VirtualMemory) {
        if range.size() > self.granule_size {
            self.coalesce_placeholders(range.start(), range.size());
        }
    }

    /// A free range allocated in full becomes granule placeholders
    pub fn on_destroy(&self, range: &VirtualMemory) {
        self.split_into_granules(range.start(), range.size());
    }

    pub fn on_shrink_front(&self, range: &VirtualMemory, size: usize) {
        if range.size() > size {
            self.split_placeholder(range.start(), size);
        }
        self.split_into_granules(range.start(), size);
    }

    pub fn on_shrink_back(&self, range: &VirtualMemory, size: usize) {
        let start = range.end() - size;
        if range.size() > size {
            self.split_placeholder(start, size);
        }
        self.split_into_granules(start, size);
    }

    pub fn on_grow_front(&self, range: &VirtualMemory, size: usize) {
        self.coalesce_placeholders(range.start() - size, range.size() + size);
    }

    pub fn on_grow_back(&self, range: &VirtualMemory, size: usize) {
        self.coalesce_placeholders(range.start(), range.size() + size);
    }

    /// Wrap the policy as range allocator observers
    pub fn into_callbacks(self) -> RangeCallbacks {
        let policy = Arc::new(self);

        let p = policy.clone();
        let on_create: RangeCallback = Box::new(move |r| p.on_create(r));
        let p = policy.clone();
        let on_destroy: RangeCallback = Box::new(move |r| p.on_destroy(r));
        let p = policy.clone();
        let on_grow_front: ResizeCallback = Box::new(move |r, s| p.on_grow_front(r, s));
        let p = policy.clone();
        let on_grow_back: ResizeCallback = Box::new(move |r, s| p.on_grow_back(r, s));
        let p = policy.clone();
        let on_shrink_front: ResizeCallback = Box::new(move |r, s| p.on_shrink_front(r, s));
        let p = policy;
        let on_shrink_back: ResizeCallback = Box::new(move |r, s| p.on_shrink_back(r, s));

        RangeCallbacks {
            on_create: Some(on_create),
            on_destroy: Some(on_destroy),
            on_grow_front: Some(on_grow_front),
            on_grow_back: Some(on_grow_back),
            on_shrink_front: Some(on_shrink_front),
            on_shrink_back: Some(on_shrink_back),
        }
    }
}
