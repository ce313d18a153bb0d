//! End-to-End Scenario at a Fixed Address
//!
//! Kept alone in its own test binary: the fixed address below is inside
//! the Remapped view of heaps built by the other suites.

#![cfg(unix)]

mod common;

use common::{recording_diagnostics, GRANULE};
use fgc_vmem::memory::{read_value, write_value};
use fgc_vmem::{AddressLayout, BackingContext, HeapView, LogLevel, ViewReserver, VmemConfig};

/// Reserve, commit, map, write, remap into another view, read back
///
/// **Invariant verified:** Two views of one offset are the same memory
#[test]
fn test_two_views_of_one_granule() {
    let (logger, diagnostics) = recording_diagnostics();
    let config = VmemConfig {
        granule_size: GRANULE,
        max_capacity: 16 * GRANULE,
        ..Default::default()
    };

    // Marked0 of offset 0 sits at 0x1000_0000_0000 with 44 offset bits
    let layout = AddressLayout::new(44, GRANULE, 2);
    let first = layout.view_address(0, HeapView::Marked0);
    let second = layout.view_address(0, HeapView::Marked1);
    assert_eq!(first, 0x1000_0000_0000);

    let context = BackingContext::create(&config, &diagnostics).unwrap();
    let backing = context.create_backing(config.max_capacity, diagnostics.clone());

    assert!(context.reserve(first, GRANULE));
    assert_eq!(backing.commit(0, GRANULE), GRANULE);

    backing.map(first, GRANULE, 0);
    unsafe {
        write_value::<u64>(first + 0x10, 0x0123_4567_89ab_cdef);
        assert_eq!(read_value::<u64>(first + 0x10), 0x0123_4567_89ab_cdef);
    }
    backing.unmap(first, GRANULE);

    assert!(context.reserve(second, GRANULE));
    backing.map(second, GRANULE, 0);
    unsafe {
        assert_eq!(read_value::<u64>(second + 0x10), 0x0123_4567_89ab_cdef);
    }
    backing.unmap(second, GRANULE);

    context.release(first, GRANULE);
    context.release(second, GRANULE);
    assert_eq!(backing.uncommit(0, GRANULE), GRANULE);

    assert!(logger.contains(LogLevel::Trace, "Committing memory"));
    assert!(logger.contains(LogLevel::Trace, "Mapping memory"));
}
