//! Virtual Memory Manager
//!
//! ============================================================================
//! OVERVIEW
//! ============================================================================
//!
//! Reserves the heap's address space in every heap view and hands out
//! ranges of heap offsets:
//! - Reserve address space for all views at once
//! - Fall back to a union of smaller reservations when needed
//! - Allocate small ranges low, large ranges high
//!
//! ============================================================================
//! STARTUP
//! ============================================================================
//!
//! ```text
//! Uninitialized ──► validate capacity ──► Reserving ──► Initialized
//!                          │                   │
//!                          └──────► Failed ◄───┘        (terminal)
//! ```
//!
//! Reservation size per view is `min(capacity × ratio, limit)`, where the
//! limit is the smaller of the offset space and the process address space
//! allowance. One contiguous range is tried first, probing up to 8192
//! evenly spaced bases:
//!
//! ```text
//! offset space:  0 ─────────────────────────────────────────── offset_max
//! candidates:    ▲   ▲   ▲   ▲   ▲   ▲   ▲ ...   (increment = unused / 8192)
//! ```
//!
//! When no candidate works, the request is split in halves recursively
//! (never below 1% of the request) and whatever can be reserved is kept.
//! Every candidate reserves all views at the same offset, and a candidate
//! that fails in one view is rolled back in the others.

use crate::address::{heap_view_limit, AddressLayout};
use crate::error::{Result, VmemError};
use crate::logging::{diag, Diagnostics};
use crate::mapper::{PlaceholderCallbacks, PlaceholderOps};
use crate::memory::{RangeAllocator, VirtualMemory};
use crate::util::constants::{MAX_RESERVE_ATTEMPTS, MIN_DISCONTIGUOUS_DIVISOR, MB};
use crate::util::Alignment;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

/// Address space primitives used for reservation
///
/// Implemented by the real backends and by test doubles that simulate
/// reservation failures.
pub trait ViewReserver {
    /// Reserve exactly `[addr, addr + size)`
    fn reserve(&self, addr: usize, size: usize) -> bool;

    /// Undo a reservation made by `reserve`
    fn unreserve(&self, addr: usize, size: usize);

    /// Release a reserved range, whatever was mapped into it since
    fn release(&self, addr: usize, size: usize) {
        self.unreserve(addr, size);
    }

    /// Placeholder primitives, for backends that tile free ranges
    fn placeholder_ops(&self) -> Option<Arc<dyn PlaceholderOps>> {
        None
    }
}

/// Lifecycle of the manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ReservationState {
    Uninitialized,
    Reserving,
    Initialized,
    Failed,
}

impl fmt::Display for ReservationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Outcome of address space reservation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AddressSpaceReport {
    /// One reservation covers the whole request
    pub contiguous: bool,
    /// The process address space limit cut the request
    pub restricted: bool,
    /// Everything requested was reserved
    pub complete: bool,
    /// Bytes requested per view
    pub requested: usize,
    /// Bytes reserved per view
    pub reserved: usize,
    pub heap_views: usize,
    /// Number of separate reservations
    pub pieces: usize,
}

impl AddressSpaceReport {
    pub fn type_summary(&self) -> String {
        format!(
            "{}/{}/{}",
            if self.contiguous { "Contiguous" } else { "Discontiguous" },
            if self.restricted { "Restricted" } else { "Unrestricted" },
            if self.complete { "Complete" } else { "Degraded" }
        )
    }
}

/// VirtualMemoryManager - multi-view reservation and range allocation
pub struct VirtualMemoryManager<R: ViewReserver> {
    reserver: R,
    layout: AddressLayout,
    virtual_to_physical_ratio: usize,
    allocator: RangeAllocator,
    state: ReservationState,
    pieces: Vec<VirtualMemory>,
    report: Option<AddressSpaceReport>,
    diagnostics: Diagnostics,
}

impl<R: ViewReserver> VirtualMemoryManager<R> {
    pub fn new(
        reserver: R,
        layout: AddressLayout,
        virtual_to_physical_ratio: usize,
        diagnostics: Diagnostics,
    ) -> Self {
        Self {
            reserver,
            layout,
            virtual_to_physical_ratio,
            allocator: RangeAllocator::new(),
            state: ReservationState::Uninitialized,
            pieces: Vec::new(),
            report: None,
            diagnostics,
        }
    }

    pub fn state(&self) -> ReservationState {
        self.state
    }

    pub fn is_initialized(&self) -> bool {
        self.state == ReservationState::Initialized
    }

    pub fn layout(&self) -> &AddressLayout {
        &self.layout
    }

    pub fn reserver(&self) -> &R {
        &self.reserver
    }

    /// Reserved bytes per view
    pub fn reserved(&self) -> usize {
        self.pieces.iter().map(VirtualMemory::size).sum()
    }

    /// Reserved offset ranges
    pub fn pieces(&self) -> &[VirtualMemory] {
        &self.pieces
    }

    pub fn report(&self) -> Option<&AddressSpaceReport> {
        self.report.as_ref()
    }

    pub fn allocator(&self) -> &RangeAllocator {
        &self.allocator
    }

    /// Run startup, reporting success as a flag
    pub fn reserve_all(&mut self, max_capacity: usize) -> bool {
        self.try_reserve_all(max_capacity).is_ok()
    }

    /// Run startup
    ///
    /// Any failure leaves the manager in the `Failed` state for good.
    pub fn try_reserve_all(&mut self, max_capacity: usize) -> Result<()> {
        if self.state != ReservationState::Uninitialized {
            return Err(VmemError::InvalidState {
                expected: ReservationState::Uninitialized.to_string(),
                actual: self.state.to_string(),
            });
        }

        let offset_max = self.layout.offset_max();
        if max_capacity > offset_max {
            diag!(
                self.diagnostics,
                Error,
                "Heap too large (max supported heap size is {}M)",
                offset_max / MB
            );
            self.state = ReservationState::Failed;
            return Err(VmemError::HeapTooLarge {
                requested: max_capacity,
                max: offset_max,
            });
        }

        self.state = ReservationState::Reserving;

        let reserved = self.reserve(max_capacity);
        if reserved < max_capacity {
            diag!(
                self.diagnostics,
                Error,
                "Failed to reserve enough address space for heap"
            );
            self.state = ReservationState::Failed;
            return Err(VmemError::ReservationFailed {
                requested: max_capacity,
                reserved,
            });
        }

        self.install_placeholder_callbacks();
        self.state = ReservationState::Initialized;
        Ok(())
    }

    /// Reserve the address space, returning bytes reserved per view
    fn reserve(&mut self, max_capacity: usize) -> usize {
        let granule_size = self.layout.granule_size();
        let offset_max = self.layout.offset_max();
        let limit = offset_max.min(heap_view_limit(granule_size, self.layout.heap_views()));
        let size = max_capacity
            .saturating_mul(self.virtual_to_physical_ratio)
            .min(limit);
        let size = Alignment::align_down(size, granule_size);

        let mut reserved = size;
        let contiguous = self.reserve_contiguous(size);
        if !contiguous {
            diag!(
                self.diagnostics,
                Warn,
                "Contiguous reservation of {}M failed, trying discontiguous",
                size / MB
            );
            reserved = self.reserve_discontiguous(size);
        }

        let report = AddressSpaceReport {
            contiguous,
            restricted: limit != offset_max,
            complete: reserved == size,
            requested: size,
            reserved,
            heap_views: self.layout.heap_views(),
            pieces: self.pieces.len(),
        };

        diag!(
            self.diagnostics,
            Info,
            "Address Space Type: {}",
            report.type_summary()
        );
        diag!(
            self.diagnostics,
            Info,
            "Address Space Size: {}M x {} = {}M",
            reserved / MB,
            report.heap_views,
            (reserved * report.heap_views) / MB
        );

        self.report = Some(report);
        reserved
    }

    /// Reserve `[start, start + size)` in every view, or in none
    fn reserve_views(&mut self, start: usize, size: usize) -> bool {
        let addresses: Vec<usize> = self
            .layout
            .views()
            .map(|view| self.layout.view_address(start, view))
            .collect();

        for (i, &addr) in addresses.iter().enumerate() {
            if !self.reserver.reserve(addr, size) {
                for &reserved in &addresses[..i] {
                    self.reserver.unreserve(reserved, size);
                }
                return false;
            }
        }

        self.pieces.push(VirtualMemory::new(start, size));
        self.allocator.free(start, size);
        true
    }

    fn reserve_contiguous(&mut self, size: usize) -> bool {
        let granule_size = self.layout.granule_size();
        let offset_max = self.layout.offset_max();

        // Evenly spaced candidates over the unused part of the offset space
        let unused = offset_max - size;
        let increment = Alignment::align_up(unused / MAX_RESERVE_ATTEMPTS, granule_size)
            .max(granule_size);

        let mut start = 0;
        while start + size <= offset_max {
            if self.reserve_views(start, size) {
                return true;
            }
            start += increment;
        }

        false
    }

    fn reserve_discontiguous(&mut self, size: usize) -> usize {
        let granule_size = self.layout.granule_size();
        let offset_max = self.layout.offset_max();

        // Pieces below 1% of the request are not worth the address space
        let min_range = Alignment::align_up(size / MIN_DISCONTIGUOUS_DIVISOR, granule_size);

        let mut start = 0;
        let mut reserved = 0;
        while reserved < size && start < offset_max {
            let remaining = (size - reserved).min(offset_max - start);
            reserved += self.reserve_discontiguous_range(start, remaining, min_range);
            start += remaining;
        }

        reserved
    }

    fn reserve_discontiguous_range(&mut self, start: usize, size: usize, min_range: usize) -> usize {
        if size < min_range {
            return 0;
        }

        if self.reserve_views(start, size) {
            return size;
        }

        let half = size / 2;
        if half < min_range {
            return 0;
        }

        let first_part = Alignment::align_down(half, self.layout.granule_size());
        let second_part = size - first_part;
        self.reserve_discontiguous_range(start, first_part, min_range)
            + self.reserve_discontiguous_range(start + first_part, second_part, min_range)
    }

    /// Keep placeholders in sync with free ranges from now on
    fn install_placeholder_callbacks(&mut self) {
        let Some(ops) = self.reserver.placeholder_ops() else {
            return;
        };

        let policy = PlaceholderCallbacks::new(
            ops,
            self.layout.view_bits(),
            self.layout.granule_size(),
        );

        // Adjacent reservations were merged into single free ranges before
        // the policy existed; give each free range its single placeholder.
        let free: Vec<VirtualMemory> = self.allocator.free_ranges().collect();
        for range in &free {
            let pieces = self
                .pieces
                .iter()
                .filter(|piece| range.contains(piece.start()))
                .count();
            if pieces > 1 {
                policy.on_create(range);
            }
        }

        self.allocator.register_callbacks(policy.into_callbacks());
    }

    /// Allocate a range of heap offsets
    ///
    /// Returns the null range when the manager is not initialized or the
    /// space is exhausted.
    pub fn alloc(&mut self, size: usize, force_low_address: bool) -> VirtualMemory {
        self.check_size(size);
        if !self.is_initialized() {
            return VirtualMemory::null();
        }

        // Small ranges are recycled often and stay low, large ranges go high
        let start = if force_low_address || size <= self.layout.granule_size() {
            self.allocator.alloc_from_front(size)
        } else {
            self.allocator.alloc_from_back(size)
        };

        match start {
            Some(start) => VirtualMemory::new(start, size),
            None => VirtualMemory::null(),
        }
    }

    pub fn free(&mut self, range: VirtualMemory) {
        if range.is_null() {
            self.diagnostics.fatal("Freeing the null range");
        }
        self.check_size(range.size());
        if !Alignment::is_aligned(range.start(), self.layout.granule_size()) {
            self.diagnostics.fatal(&format!(
                "Range start {:#x} is not aligned to the granule size {:#x}",
                range.start(),
                self.layout.granule_size()
            ));
        }
        self.allocator.free(range.start(), range.size());
    }

    // Placeholder callbacks split at range boundaries, so a bad size must
    // fail before the allocator runs them
    fn check_size(&self, size: usize) {
        let granule_size = self.layout.granule_size();
        if size == 0 || !Alignment::is_aligned(size, granule_size) {
            self.diagnostics.fatal(&format!(
                "Range size {:#x} is not aligned to the granule size {:#x}",
                size, granule_size
            ));
        }
    }
}

impl<R: ViewReserver> Drop for VirtualMemoryManager<R> {
    fn drop(&mut self) {
        for piece in &self.pieces {
            for view in self.layout.views() {
                let addr = self.layout.view_address(piece.start(), view);
                self.reserver.release(addr, piece.size());
            }
        }
    }
}

impl<R: ViewReserver> fmt::Debug for VirtualMemoryManager<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtualMemoryManager")
            .field("state", &self.state)
            .field("reserved", &self.reserved())
            .field("pieces", &self.pieces.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::{panic_on_fatal, LogLevel, MemoryLogger};
    use parking_lot::Mutex;

    const G: usize = 2 * 1024 * 1024;

    /// Accepts reservations up to `max_size` bytes, anywhere
    struct FakeReserver {
        max_size: usize,
        attempts: Mutex<Vec<(usize, usize)>>,
        live: Mutex<Vec<(usize, usize)>>,
    }

    impl FakeReserver {
        fn new(max_size: usize) -> Self {
            Self {
                max_size,
                attempts: Mutex::new(Vec::new()),
                live: Mutex::new(Vec::new()),
            }
        }
    }

    impl ViewReserver for &FakeReserver {
        fn reserve(&self, addr: usize, size: usize) -> bool {
            self.attempts.lock().push((addr, size));
            if size > self.max_size {
                return false;
            }
            self.live.lock().push((addr, size));
            true
        }

        fn unreserve(&self, addr: usize, size: usize) {
            let mut live = self.live.lock();
            let index = live.iter().position(|&r| r == (addr, size)).unwrap();
            live.swap_remove(index);
        }
    }

    fn diagnostics() -> (Arc<MemoryLogger>, Diagnostics) {
        let logger = Arc::new(MemoryLogger::default());
        (logger.clone(), Diagnostics::new(logger, panic_on_fatal))
    }

    // 4GB offset space, 1GB reservation per view for 64MB at ratio 16
    fn layout() -> AddressLayout {
        AddressLayout::new(32, G, 3)
    }

    #[test]
    fn test_contiguous_reservation() {
        let reserver = FakeReserver::new(usize::MAX);
        let (logger, diagnostics) = diagnostics();
        let mut manager = VirtualMemoryManager::new(&reserver, layout(), 16, diagnostics);

        assert!(manager.reserve_all(64 * MB));
        assert_eq!(manager.state(), ReservationState::Initialized);
        assert_eq!(manager.reserved(), 1024 * MB);
        assert_eq!(manager.pieces().len(), 1);
        assert_eq!(reserver.live.lock().len(), 3);
        assert!(logger.contains(LogLevel::Info, "Contiguous/Unrestricted/Complete"));
    }

    #[test]
    fn test_discontiguous_fallback() {
        let size = 1024 * MB;
        let reserver = FakeReserver::new(size / 2);
        let (logger, diagnostics) = diagnostics();
        let mut manager = VirtualMemoryManager::new(&reserver, layout(), 16, diagnostics);

        assert!(manager.reserve_all(64 * MB));

        let report = manager.report().unwrap().clone();
        assert!(!report.contiguous);
        assert!(report.complete);
        assert_eq!(manager.reserved(), size);
        assert_eq!(manager.pieces().len(), 2);

        let min_range = size / 100;
        let min_range = Alignment::align_up(min_range, G);
        assert!(reserver.attempts.lock().iter().all(|&(_, s)| s >= min_range));
        assert!(logger.contains(LogLevel::Info, "Discontiguous"));

        // Adjacent pieces act as one free range
        assert_eq!(manager.allocator().free_ranges().count(), 1);
    }

    #[test]
    fn test_degraded_reservation_fails_startup() {
        let reserver = FakeReserver::new(0);
        let (logger, diagnostics) = diagnostics();
        let mut manager = VirtualMemoryManager::new(&reserver, layout(), 16, diagnostics);

        let err = manager.try_reserve_all(64 * MB).unwrap_err();

        assert!(matches!(err, VmemError::ReservationFailed { reserved: 0, .. }));
        assert_eq!(manager.state(), ReservationState::Failed);
        assert!(logger.contains(LogLevel::Error, "Failed to reserve enough address space"));
        assert!(manager.alloc(G, false).is_null());
        // The floor bounds the search
        assert!(reserver
            .attempts
            .lock()
            .iter()
            .all(|&(_, s)| s >= Alignment::align_up(1024 * MB / 100, G)));
    }

    #[test]
    fn test_heap_too_large() {
        let reserver = FakeReserver::new(usize::MAX);
        let (logger, diagnostics) = diagnostics();
        let mut manager = VirtualMemoryManager::new(&reserver, layout(), 16, diagnostics);

        let err = manager.try_reserve_all(8 * 1024 * MB).unwrap_err();

        assert!(matches!(err, VmemError::HeapTooLarge { .. }));
        assert_eq!(manager.state(), ReservationState::Failed);
        assert!(reserver.attempts.lock().is_empty());
        assert!(logger.contains(LogLevel::Error, "Heap too large"));
    }

    #[test]
    fn test_failed_is_terminal() {
        let reserver = FakeReserver::new(0);
        let (_logger, diagnostics) = diagnostics();
        let mut manager = VirtualMemoryManager::new(&reserver, layout(), 16, diagnostics);

        assert!(!manager.reserve_all(64 * MB));
        let err = manager.try_reserve_all(64 * MB).unwrap_err();
        assert!(err.is_bug());
        assert_eq!(manager.state(), ReservationState::Failed);
    }

    #[test]
    fn test_alloc_placement() {
        let reserver = FakeReserver::new(usize::MAX);
        let (_logger, diagnostics) = diagnostics();
        let mut manager = VirtualMemoryManager::new(&reserver, layout(), 16, diagnostics);
        assert!(manager.reserve_all(64 * MB));

        let small = manager.alloc(G, false);
        let large = manager.alloc(4 * G, false);
        let forced = manager.alloc(4 * G, true);

        assert_eq!(small.start(), 0);
        assert_eq!(large.end(), 1024 * MB);
        assert_eq!(forced.start(), G);

        manager.free(small);
        manager.free(large);
        manager.free(forced);
        assert_eq!(manager.allocator().free_bytes(), 1024 * MB);
    }

    #[test]
    fn test_drop_releases_every_view() {
        let reserver = FakeReserver::new(usize::MAX);
        let (_logger, diagnostics) = diagnostics();
        {
            let mut manager = VirtualMemoryManager::new(&reserver, layout(), 16, diagnostics);
            assert!(manager.reserve_all(64 * MB));
        }
        assert!(reserver.live.lock().is_empty());
    }

    #[test]
    #[should_panic(expected = "not aligned")]
    fn test_misaligned_alloc_is_fatal() {
        let reserver = FakeReserver::new(usize::MAX);
        let (_logger, diagnostics) = diagnostics();
        let mut manager = VirtualMemoryManager::new(&reserver, layout(), 16, diagnostics);
        assert!(manager.reserve_all(64 * MB));

        manager.alloc(G + 4096, true);
    }

    #[test]
    #[should_panic(expected = "not aligned")]
    fn test_empty_alloc_is_fatal() {
        let reserver = FakeReserver::new(usize::MAX);
        let (_logger, diagnostics) = diagnostics();
        let mut manager = VirtualMemoryManager::new(&reserver, layout(), 16, diagnostics);
        assert!(manager.reserve_all(64 * MB));

        manager.alloc(0, false);
    }

    #[test]
    #[should_panic(expected = "Freeing the null range")]
    fn test_free_null_range_is_fatal() {
        let reserver = FakeReserver::new(usize::MAX);
        let (_logger, diagnostics) = diagnostics();
        let mut manager = VirtualMemoryManager::new(&reserver, layout(), 16, diagnostics);
        assert!(manager.reserve_all(64 * MB));

        manager.free(VirtualMemory::null());
    }
}
