//! Commit/Uncommit Tests
//!
//! Commit may fall short but never overshoots, and whatever was committed
//! can always be uncommitted in full.

#![cfg(unix)]

mod common;

use common::{recording_diagnostics, test_config, HeapFixture, GRANULE};
use fgc_vmem::{BackingContext, PhysicalMemoryBacking};
use quickcheck::{QuickCheck, TestResult};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const CAPACITY_GRANULES: usize = 32;

fn small_pages_backing() -> (BackingContext, PhysicalMemoryBacking) {
    let (_logger, diagnostics) = recording_diagnostics();
    let config = test_config(CAPACITY_GRANULES * GRANULE);
    let context = BackingContext::create(&config, &diagnostics).unwrap();
    let backing = context.create_backing(config.max_capacity, diagnostics);
    (context, backing)
}

/// Committed bytes never exceed the request; the prefix uncommits in full
#[test]
fn test_commit_uncommit_conservation() {
    fn prop(start: u8, len: u8) -> TestResult {
        let start = start as usize % CAPACITY_GRANULES;
        let len = len as usize % (CAPACITY_GRANULES - start);
        if len == 0 {
            return TestResult::discard();
        }

        let (_context, backing) = small_pages_backing();
        let offset = start * GRANULE;
        let length = len * GRANULE;

        let committed = backing.commit(offset, length);
        if committed > length || committed % GRANULE != 0 {
            return TestResult::failed();
        }
        if backing.uncommit(offset, committed) != committed {
            return TestResult::failed();
        }

        TestResult::from_bool(backing.committed() == 0)
    }

    QuickCheck::new()
        .tests(25)
        .quickcheck(prop as fn(u8, u8) -> TestResult);
}

/// Interleaved commits and uncommits keep the byte counter exact
#[test]
fn test_committed_counter_tracks_granules() {
    let (_context, backing) = small_pages_backing();
    let mut rng = StdRng::seed_from_u64(0x5eed);
    let mut committed = vec![false; CAPACITY_GRANULES];

    for _ in 0..200 {
        let granule = rng.gen_range(0..CAPACITY_GRANULES);
        let offset = granule * GRANULE;

        if committed[granule] {
            assert_eq!(backing.uncommit(offset, GRANULE), GRANULE);
        } else {
            assert_eq!(backing.commit(offset, GRANULE), GRANULE);
        }
        committed[granule] = !committed[granule];

        let expected = committed.iter().filter(|&&c| c).count() * GRANULE;
        assert_eq!(backing.committed(), expected);
        assert_eq!(backing.is_committed(offset), committed[granule]);
    }
}

/// Uncommitting memory that was never committed is fatal
#[test]
#[should_panic(expected = "is not committed")]
fn test_uncommit_of_uncommitted_is_fatal() {
    let (_context, backing) = small_pages_backing();
    backing.uncommit(0, GRANULE);
}

/// Commit state survives mapping and is independent of views
#[test]
fn test_heap_commit_without_mapping() {
    let fixture = HeapFixture::new(test_config(32 * 1024 * 1024));
    let heap = &fixture.heap;

    let range = heap.alloc_range(4 * GRANULE, false);
    assert_eq!(heap.commit(range.start(), range.size()), range.size());
    assert!(heap.backing().is_committed(range.start() + 3 * GRANULE));
    assert!(heap.uncommit_enabled());

    assert_eq!(heap.uncommit(range.start(), range.size()), range.size());
    heap.free_range(range);
    assert_eq!(heap.stats().committed, 0);
}
