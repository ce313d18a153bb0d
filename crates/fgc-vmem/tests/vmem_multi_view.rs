//! Multi-View Mapping Tests
//!
//! The same committed offsets mapped into several heap views must behave
//! as one piece of memory seen through several addresses.

#![cfg(unix)]

mod common;

use common::{test_config, HeapFixture, GRANULE};
use fgc_vmem::memory::{read_value, write_value};
use fgc_vmem::{HeapView, LogLevel, ReservationState};

/// Writes through one view are visible through every other view
#[test]
fn test_writes_visible_in_all_views() {
    let fixture = HeapFixture::with_defaults();
    let heap = &fixture.heap;

    let range = fixture.map_new_range(2 * GRANULE);
    let offset = range.start() + GRANULE + 0x40;

    unsafe {
        write_value::<u64>(heap.view_address(offset, HeapView::Marked0), 0xdead_beef);
        assert_eq!(
            read_value::<u64>(heap.view_address(offset, HeapView::Marked1)),
            0xdead_beef
        );
        assert_eq!(
            read_value::<u64>(heap.view_address(offset, HeapView::Remapped)),
            0xdead_beef
        );

        write_value::<u64>(heap.view_address(offset, HeapView::Remapped), 7);
        assert_eq!(read_value::<u64>(heap.view_address(offset, HeapView::Marked0)), 7);
    }

    fixture.release_range(range);
}

/// Remapping a view keeps the memory; uncommit and recommit does not
#[test]
fn test_remap_keeps_contents() {
    let fixture = HeapFixture::with_defaults();
    let heap = &fixture.heap;

    let range = fixture.map_new_range(GRANULE);
    let marked0 = heap.view_address(range.start(), HeapView::Marked0);
    let remapped = heap.view_address(range.start(), HeapView::Remapped);

    unsafe { write_value::<u64>(marked0 + 0x10, 0x1234) };

    heap.unmap_view(remapped, GRANULE);
    heap.map_view(remapped, GRANULE, range.start());
    unsafe { assert_eq!(read_value::<u64>(remapped + 0x10), 0x1234) };

    heap.unmap_all_views(range.start(), GRANULE);
    heap.uncommit(range.start(), GRANULE);
    assert_eq!(heap.commit(range.start(), GRANULE), GRANULE);
    heap.map_all_views(range.start(), GRANULE);
    unsafe { assert_eq!(read_value::<u64>(marked0 + 0x10), 0) };

    fixture.release_range(range);
}

/// Distinct offsets never alias
#[test]
fn test_distinct_offsets_are_independent() {
    let fixture = HeapFixture::with_defaults();
    let heap = &fixture.heap;

    let first = fixture.map_new_range(GRANULE);
    let second = fixture.map_new_range(GRANULE);
    assert_ne!(first.start(), second.start());

    unsafe {
        write_value::<u64>(heap.view_address(first.start(), HeapView::Marked0), 1);
        write_value::<u64>(heap.view_address(second.start(), HeapView::Marked0), 2);
        assert_eq!(read_value::<u64>(heap.view_address(first.start(), HeapView::Remapped)), 1);
        assert_eq!(read_value::<u64>(heap.view_address(second.start(), HeapView::Remapped)), 2);
    }

    fixture.release_range(first);
    fixture.release_range(second);
}

/// A single-view heap maps only Marked0
#[test]
fn test_single_view_heap() {
    let mut config = test_config(32 * 1024 * 1024);
    config.heap_views = 1;
    let fixture = HeapFixture::new(config);

    assert_eq!(fixture.heap.layout().view_bits().len(), 1);

    let range = fixture.map_new_range(GRANULE);
    let addr = fixture.heap.view_address(range.start(), HeapView::Marked0);
    unsafe {
        write_value::<u32>(addr, 99);
        assert_eq!(read_value::<u32>(addr), 99);
    }
    fixture.release_range(range);
}

/// Pretouch faults in mapped memory without changing it
#[test]
fn test_pretouch_preserves_contents() {
    let fixture = HeapFixture::with_defaults();
    let heap = &fixture.heap;

    let range = fixture.map_new_range(4 * GRANULE);
    let addr = heap.view_address(range.start(), HeapView::Marked1);

    unsafe {
        write_value::<u64>(addr + 3 * GRANULE, 0xabcd);
        heap.pretouch(addr, range.size());
        assert_eq!(read_value::<u64>(addr + 3 * GRANULE), 0xabcd);
    }
    assert!(fixture.logger.contains(LogLevel::Debug, "Pretouching"));

    fixture.release_range(range);
}

/// Stats reflect reservation and commit, and serialize to JSON
#[test]
fn test_stats_snapshot() {
    let fixture = HeapFixture::with_defaults();
    let heap = &fixture.heap;

    let range = fixture.map_new_range(2 * GRANULE);
    let stats = heap.stats();

    assert_eq!(stats.state, ReservationState::Initialized);
    assert_eq!(stats.committed, 2 * GRANULE);
    assert_eq!(stats.heap_views, 3);
    assert!(stats.reserved >= stats.max_capacity);
    assert_eq!(stats.free_offsets, stats.reserved - 2 * GRANULE);
    assert!(!stats.large_pages);
    assert!(stats.address_space.as_ref().unwrap().complete);

    let json = serde_json::to_string(&stats).unwrap();
    assert!(json.contains("\"committed\":4194304"));

    fixture.release_range(range);
    assert_eq!(heap.stats().committed, 0);
    assert!(fixture.logger.contains(LogLevel::Info, "Address Space Type"));
}
