//! Address Space Reservation Tests
//!
//! Startup either reserves at least the heap capacity in every view or
//! fails for good. Refused reservations are simulated.

mod common;

use common::{recording_diagnostics, test_config, SimulatedAddressSpace, GRANULE};
use fgc_vmem::util::Alignment;
use fgc_vmem::{
    AddressLayout, HeapMemory, LogLevel, ReservationState, VirtualMemoryManager, VmemError,
};

const MB: usize = 1024 * 1024;

// 4GB offset space
fn layout() -> AddressLayout {
    AddressLayout::new(32, GRANULE, 3)
}

/// Contiguous refusal everywhere falls back to smaller pieces
///
/// **Invariant verified:** Pieces sum to at most the request and no
/// attempt goes below 1% of it
#[test]
fn test_discontiguous_fallback() {
    let (logger, diagnostics) = recording_diagnostics();
    let requested = 1024 * MB;
    let space = SimulatedAddressSpace::new(requested / 4);
    let mut manager = VirtualMemoryManager::new(space.clone(), layout(), 16, diagnostics);

    assert!(manager.reserve_all(64 * MB));

    let min_range = Alignment::align_up(requested / 100, GRANULE);
    let reserved = manager.reserved();
    assert!(reserved >= min_range && reserved <= requested);
    assert!(manager.pieces().iter().all(|p| p.size() >= min_range));
    assert!(space.attempts().iter().all(|&(_, size)| size >= min_range));

    let report = manager.report().unwrap();
    assert!(!report.contiguous);
    assert_eq!(report.pieces, manager.pieces().len());
    assert!(logger.contains(LogLevel::Warn, "trying discontiguous"));
    assert!(logger.contains(LogLevel::Info, "Discontiguous/"));
}

/// Degraded reservation still succeeds when it covers the capacity
#[test]
fn test_degraded_reservation_above_capacity() {
    let (logger, diagnostics) = recording_diagnostics();
    let space = SimulatedAddressSpace::new(64 * MB);
    // Marked0 addresses past offset 512MB are taken
    space.deny((1 << 32) + 512 * MB, 3584 * MB);
    let mut manager = VirtualMemoryManager::new(space, layout(), 16, diagnostics);

    assert!(manager.reserve_all(64 * MB));
    assert_eq!(manager.reserved(), 512 * MB);
    assert!(!manager.report().unwrap().complete);
    assert!(logger.contains(LogLevel::Info, "Degraded"));
}

/// A candidate refused in one view is rolled back in the others
#[test]
fn test_partial_candidate_rolled_back() {
    let (_logger, diagnostics) = recording_diagnostics();
    let space = SimulatedAddressSpace::unlimited();
    let layout = layout();
    // Marked1 view of the first 512MB is taken
    space.deny(1 << 33, 512 * MB);
    let mut manager = VirtualMemoryManager::new(space.clone(), layout, 16, diagnostics);

    assert!(manager.reserve_all(64 * MB));

    let piece = manager.pieces()[0];
    assert_eq!(piece.start(), 512 * MB);
    assert!(manager.report().unwrap().contiguous);
    // No Marked0 reservation left behind below the accepted candidate
    assert!(space.placeholders(1 << 32, 512 * MB).is_empty());
    assert_eq!(space.placeholder_count(), 3);
}

/// Nothing reservable fails startup and stays failed
#[test]
fn test_reservation_failure_is_terminal() {
    let (logger, diagnostics) = recording_diagnostics();
    let space = SimulatedAddressSpace::new(0);
    let mut manager = VirtualMemoryManager::new(space.clone(), layout(), 16, diagnostics);

    match manager.try_reserve_all(64 * MB) {
        Err(VmemError::ReservationFailed { requested, reserved }) => {
            assert_eq!(requested, 64 * MB);
            assert_eq!(reserved, 0);
        }
        other => panic!("unexpected result: {:?}", other),
    }
    assert_eq!(manager.state(), ReservationState::Failed);
    assert!(manager.alloc(GRANULE, false).is_null());
    assert!(!manager.reserve_all(64 * MB));
    assert_eq!(space.placeholder_count(), 0);
    assert!(logger.contains(LogLevel::Error, "Failed to reserve enough address space"));
}

/// Capacity beyond the offset space fails before any reservation
#[test]
fn test_heap_too_large() {
    let (logger, diagnostics) = recording_diagnostics();
    let mut config = test_config(8 * 1024 * 1024 * MB);
    config.address_offset_bits = Some(42);

    let err = HeapMemory::with_diagnostics(config, diagnostics).unwrap_err();

    assert!(matches!(err, VmemError::HeapTooLarge { .. }));
    assert!(err.is_recoverable());
    assert!(logger.contains(LogLevel::Error, "Heap too large"));
}

/// Invalid configuration never reaches the OS
#[test]
fn test_invalid_config_rejected() {
    let mut config = test_config(64 * MB);
    config.granule_size = 3 * MB;

    let err = HeapMemory::new(config).unwrap_err();
    assert!(matches!(err, VmemError::Configuration(_)));
}
