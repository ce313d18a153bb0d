//! Test Utilities for the Virtual Memory Test Suite
//!
//! Provides:
//! - Small heap configurations that reserve quickly
//! - Recording diagnostics with a panicking fatal hook
//! - A simulated address space whose reservations can be refused
//!
//! ============================================================================
//! Heaps built here stay small so parallel tests can each find their own
//! address space.
//! ============================================================================

#![allow(dead_code)]

use fgc_vmem::mapper::{PlaceholderLedger, PlaceholderOps};
use fgc_vmem::{
    Diagnostics, HeapMemory, MemoryLogger, ViewReserver, VirtualMemory, VmemConfig,
};
use parking_lot::Mutex;
use std::sync::Arc;

/// Granule size used throughout the tests (2MB)
pub const GRANULE: usize = 2 * 1024 * 1024;

/// Default heap capacity for tests (64MB)
pub const DEFAULT_CAPACITY: usize = 64 * 1024 * 1024;

/// ============================================================================
/// CONFIGURATION AND DIAGNOSTICS
/// ============================================================================

/// Small-pages configuration with the given capacity
pub fn test_config(max_capacity: usize) -> VmemConfig {
    VmemConfig {
        granule_size: GRANULE,
        max_capacity,
        ..Default::default()
    }
}

/// Diagnostics that record everything and panic on fatal errors
pub fn recording_diagnostics() -> (Arc<MemoryLogger>, Diagnostics) {
    let logger = Arc::new(MemoryLogger::default());
    let diagnostics = Diagnostics::new(logger.clone(), fgc_vmem::logging::panic_on_fatal);
    (logger, diagnostics)
}

/// Heap memory fixture with recorded diagnostics
pub struct HeapFixture {
    pub heap: HeapMemory,
    pub logger: Arc<MemoryLogger>,
}

impl HeapFixture {
    pub fn new(config: VmemConfig) -> Self {
        let (logger, diagnostics) = recording_diagnostics();
        let heap = HeapMemory::with_diagnostics(config, diagnostics)
            .expect("heap memory should initialize with a small capacity");
        Self { heap, logger }
    }

    pub fn with_defaults() -> Self {
        Self::new(test_config(DEFAULT_CAPACITY))
    }

    /// Allocate, commit and map a range into every view
    pub fn map_new_range(&self, size: usize) -> VirtualMemory {
        let range = self.heap.alloc_range(size, false);
        assert!(!range.is_null(), "offset space exhausted");
        assert_eq!(self.heap.commit(range.start(), size), size);
        self.heap.map_all_views(range.start(), size);
        range
    }

    /// Undo `map_new_range`
    pub fn release_range(&self, range: VirtualMemory) {
        self.heap.unmap_all_views(range.start(), range.size());
        assert_eq!(self.heap.uncommit(range.start(), range.size()), range.size());
        self.heap.free_range(range);
    }
}

/// ============================================================================
/// SIMULATED ADDRESS SPACE
/// ============================================================================

struct SimulatedState {
    ledger: Mutex<PlaceholderLedger>,
    max_reservation: usize,
    denied: Mutex<Vec<(usize, usize)>>,
    attempts: Mutex<Vec<(usize, usize)>>,
}

impl PlaceholderOps for SimulatedState {
    fn split_placeholder(&self, addr: usize, size: usize) {
        self.ledger
            .lock()
            .split(addr, size)
            .unwrap_or_else(|e| panic!("split rejected: {}", e));
    }

    fn coalesce_placeholders(&self, addr: usize, size: usize) {
        self.ledger
            .lock()
            .coalesce(addr, size)
            .unwrap_or_else(|e| panic!("coalesce rejected: {}", e));
    }
}

/// Address space kept entirely in a placeholder ledger
///
/// Refuses reservations larger than `max_reservation` and any reservation
/// touching a denied range.
#[derive(Clone)]
pub struct SimulatedAddressSpace {
    state: Arc<SimulatedState>,
}

impl SimulatedAddressSpace {
    pub fn new(max_reservation: usize) -> Self {
        Self {
            state: Arc::new(SimulatedState {
                ledger: Mutex::new(PlaceholderLedger::new()),
                max_reservation,
                denied: Mutex::new(Vec::new()),
                attempts: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(usize::MAX)
    }

    /// Refuse every reservation intersecting `[addr, addr + size)`
    pub fn deny(&self, addr: usize, size: usize) {
        self.state.denied.lock().push((addr, size));
    }

    /// Every reservation attempted so far, refused ones included
    pub fn attempts(&self) -> Vec<(usize, usize)> {
        self.state.attempts.lock().clone()
    }

    pub fn placeholders(&self, addr: usize, size: usize) -> Vec<(usize, usize)> {
        self.state.ledger.lock().placeholders(addr, size)
    }

    pub fn placeholder_count(&self) -> usize {
        self.state.ledger.lock().placeholder_count()
    }
}

impl ViewReserver for SimulatedAddressSpace {
    fn reserve(&self, addr: usize, size: usize) -> bool {
        self.state.attempts.lock().push((addr, size));

        if size > self.state.max_reservation {
            return false;
        }
        let denied = self
            .state
            .denied
            .lock()
            .iter()
            .any(|&(start, len)| addr < start + len && start < addr + size);
        if denied {
            return false;
        }

        self.state.ledger.lock().reserve(addr, size).is_ok()
    }

    fn unreserve(&self, addr: usize, size: usize) {
        self.state
            .ledger
            .lock()
            .unreserve(addr, size)
            .unwrap_or_else(|e| panic!("unreserve rejected: {}", e));
    }

    fn release(&self, addr: usize, size: usize) {
        let mut ledger = self.state.ledger.lock();
        for (start, len) in ledger.placeholders(addr, size) {
            ledger
                .unreserve(start, len)
                .unwrap_or_else(|e| panic!("release rejected: {}", e));
        }
    }

    fn placeholder_ops(&self) -> Option<Arc<dyn PlaceholderOps>> {
        Some(self.state.clone() as Arc<dyn PlaceholderOps>)
    }
}

/// ============================================================================
/// TILING ASSERTIONS
/// ============================================================================

/// Check that placeholders tile the reservation exactly
///
/// Every free range must be one placeholder, every allocated range must be
/// cut into granule placeholders, in each view.
pub fn assert_tiled<F>(
    placeholders: F,
    view_bits: &[usize],
    free: &[VirtualMemory],
    allocated: &[VirtualMemory],
) where
    F: Fn(usize, usize) -> Vec<(usize, usize)>,
{
    for &bit in view_bits {
        for range in free {
            let addr = range.start() | bit;
            assert_eq!(
                placeholders(addr, range.size()),
                vec![(addr, range.size())],
                "free range {:?} is not a single placeholder",
                range
            );
        }

        for range in allocated {
            let addr = range.start() | bit;
            let expected: Vec<(usize, usize)> = (0..range.size() / GRANULE)
                .map(|i| (addr + i * GRANULE, GRANULE))
                .collect();
            assert_eq!(
                placeholders(addr, range.size()),
                expected,
                "allocated range {:?} is not granule tiled",
                range
            );
        }
    }
}
