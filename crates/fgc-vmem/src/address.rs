//! Address Layout - Heap Offsets and Heap Views
//!
//! Every heap granule has one offset in `[0, offset_max)` and one virtual
//! address per heap view. A view address is the offset with that view's bit
//! set, right above the offset bits:
//!
//! ```text
//! 64-bit view address (offset_bits = 42):
//! ┌────────────┬─────┬─────┬─────┬──────────────────────┐
//! │  Unused    │ Rem │ M1  │ M0  │     Heap offset      │
//! │  63-45     │ 44  │ 43  │ 42  │       41-0           │
//! └────────────┴─────┴─────┴─────┴──────────────────────┘
//! ```
//!
//! The same physical granule mapped at all three addresses lets the
//! collector tell pointer colors apart without touching object headers.

use crate::config::VmemConfig;
use crate::util::constants::MAX_VIRT_MEM_FRACTION;
use crate::util::Alignment;
use serde::Serialize;

/// Heap view, in reservation order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum HeapView {
    Marked0,
    Marked1,
    Remapped,
}

impl HeapView {
    pub const ALL: [HeapView; 3] = [HeapView::Marked0, HeapView::Marked1, HeapView::Remapped];

    pub fn index(self) -> usize {
        self as usize
    }
}

/// AddressLayout - offset space geometry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressLayout {
    offset_bits: u32,
    granule_size: usize,
    heap_views: usize,
}

impl AddressLayout {
    pub fn new(offset_bits: u32, granule_size: usize, heap_views: usize) -> Self {
        assert!(
            (1..=HeapView::ALL.len()).contains(&heap_views),
            "Invalid number of heap views"
        );
        assert!(offset_bits as usize + heap_views <= 47, "View bits out of range");
        Self {
            offset_bits,
            granule_size,
            heap_views,
        }
    }

    pub fn from_config(config: &VmemConfig) -> Self {
        Self::new(
            config.effective_offset_bits(),
            config.granule_size,
            config.heap_views,
        )
    }

    pub fn offset_bits(&self) -> u32 {
        self.offset_bits
    }

    /// First offset past the addressable heap
    pub fn offset_max(&self) -> usize {
        1 << self.offset_bits
    }

    pub fn granule_size(&self) -> usize {
        self.granule_size
    }

    pub fn heap_views(&self) -> usize {
        self.heap_views
    }

    /// Active views in reservation order
    pub fn views(&self) -> impl Iterator<Item = HeapView> {
        HeapView::ALL.into_iter().take(self.heap_views)
    }

    pub fn view_bit(&self, view: HeapView) -> usize {
        1 << (self.offset_bits as usize + view.index())
    }

    pub fn view_bits(&self) -> Vec<usize> {
        self.views().map(|view| self.view_bit(view)).collect()
    }

    pub fn view_address(&self, offset: usize, view: HeapView) -> usize {
        debug_assert!(offset < self.offset_max(), "Offset out of range");
        offset | self.view_bit(view)
    }

    pub fn offset_of(&self, addr: usize) -> usize {
        addr & (self.offset_max() - 1)
    }

    /// View whose bit is set in `addr`, if exactly one active view matches
    pub fn view_of(&self, addr: usize) -> Option<HeapView> {
        let mut matching = self.views().filter(|&view| addr & self.view_bit(view) != 0);
        let view = matching.next()?;
        match matching.next() {
            Some(_) => None,
            None => Some(view),
        }
    }
}

lazy_static::lazy_static! {
    static ref ADDRESS_SPACE_LIMIT: usize = query_address_space_limit();
}

#[cfg(unix)]
fn query_address_space_limit() -> usize {
    let mut limit = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    let res = unsafe { libc::getrlimit(libc::RLIMIT_AS, &mut limit) };
    if res != 0 || limit.rlim_cur == libc::RLIM_INFINITY {
        return usize::MAX;
    }
    usize::try_from(limit.rlim_cur).unwrap_or(usize::MAX)
}

#[cfg(not(unix))]
fn query_address_space_limit() -> usize {
    usize::MAX
}

/// Virtual address space the process may use
pub fn address_space_limit() -> usize {
    *ADDRESS_SPACE_LIMIT
}

/// Most address space one heap view may take
///
/// All views together take at most half of the process limit.
pub fn heap_view_limit(granule_size: usize, heap_views: usize) -> usize {
    let limit = address_space_limit() / MAX_VIRT_MEM_FRACTION / heap_views;
    Alignment::align_up(limit, granule_size)
}
