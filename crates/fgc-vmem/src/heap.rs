//! Heap Memory - Upward Interface to the Collector
//!
//! `HeapMemory` ties the two managers together:
//! - [`VirtualMemoryManager`] hands out heap offset ranges
//! - [`PhysicalMemoryBacking`] commits memory behind offsets and maps it
//!   into heap views
//!
//! Typical page lifecycle as driven by the collector:
//!
//! ```text
//! alloc_range ──► commit ──► map_all_views ──► ... ──► unmap_all_views ──► uncommit ──► free_range
//! ```
//!
//! Range allocation and the placeholder changes it triggers happen under
//! one lock. Commit and mapping of disjoint offsets need no lock.

use crate::address::{AddressLayout, HeapView};
use crate::backing::{BackingContext, PhysicalMemoryBacking};
use crate::config::VmemConfig;
use crate::error::Result;
use crate::logging::{diag, Diagnostics};
use crate::memory::{touch_pages, VirtualMemory};
use crate::util::debug::format_megabytes;
use crate::virtual_memory::{AddressSpaceReport, ReservationState, VirtualMemoryManager};
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Snapshot of heap memory usage
#[derive(Debug, Clone, Serialize)]
pub struct MemoryStats {
    pub max_capacity: usize,
    pub granule_size: usize,
    pub heap_views: usize,
    pub large_pages: bool,
    /// Reserved bytes per view
    pub reserved: usize,
    pub committed: usize,
    /// Unallocated bytes of reserved offset space
    pub free_offsets: usize,
    pub state: ReservationState,
    pub address_space: Option<AddressSpaceReport>,
}

/// HeapMemory - reservation, commit and view mapping for one heap
///
/// # Examples
///
/// ```rust,no_run
/// use fgc_vmem::{HeapMemory, HeapView, VmemConfig};
///
/// fn main() -> Result<(), fgc_vmem::VmemError> {
///     let heap = HeapMemory::new(VmemConfig {
///         max_capacity: 64 * 1024 * 1024,
///         ..Default::default()
///     })?;
///
///     let granule = heap.config().granule_size;
///     let range = heap.alloc_range(granule, false);
///     assert_eq!(heap.commit(range.start(), range.size()), granule);
///     heap.map_all_views(range.start(), range.size());
///
///     let addr = heap.view_address(range.start(), HeapView::Remapped);
///     unsafe { *(addr as *mut u64) = 42 };
///
///     heap.unmap_all_views(range.start(), range.size());
///     heap.uncommit(range.start(), range.size());
///     heap.free_range(range);
///     Ok(())
/// }
/// ```
pub struct HeapMemory {
    config: VmemConfig,
    layout: AddressLayout,
    // Dropped before the backing: views go away before their memory
    manager: Mutex<VirtualMemoryManager<BackingContext>>,
    backing: PhysicalMemoryBacking,
    context: BackingContext,
    diagnostics: Diagnostics,
}

impl HeapMemory {
    /// Create heap memory reporting to the `log` facade
    pub fn new(config: VmemConfig) -> Result<Self> {
        Self::with_diagnostics(config, Diagnostics::default())
    }

    /// Create heap memory with an explicit diagnostics context
    ///
    /// Reserves the whole address space up front. Fails when the
    /// configuration is invalid, the capacity cannot be addressed, or not
    /// enough address space could be reserved.
    pub fn with_diagnostics(config: VmemConfig, diagnostics: Diagnostics) -> Result<Self> {
        config.validate()?;

        let context = BackingContext::create(&config, &diagnostics)?;
        let layout = AddressLayout::from_config(&config);

        let mut manager = VirtualMemoryManager::new(
            context.clone(),
            layout,
            config.virtual_to_physical_ratio,
            diagnostics.clone(),
        );
        manager.try_reserve_all(config.max_capacity)?;

        let backing = context.create_backing(config.max_capacity, diagnostics.clone());

        diag!(
            diagnostics,
            Info,
            "Heap memory initialized: capacity {}, granule {}, {} views, {} pages",
            format_megabytes(config.max_capacity),
            format_megabytes(config.granule_size),
            layout.heap_views(),
            if context.is_large_pages() { "large" } else { "small" }
        );

        Ok(Self {
            config,
            layout,
            manager: Mutex::new(manager),
            backing,
            context,
            diagnostics,
        })
    }

    pub fn config(&self) -> &VmemConfig {
        &self.config
    }

    pub fn layout(&self) -> &AddressLayout {
        &self.layout
    }

    pub fn backing(&self) -> &PhysicalMemoryBacking {
        &self.backing
    }

    /// OS resources behind reservation and backing
    pub fn context(&self) -> &BackingContext {
        &self.context
    }

    /// Whether the heap-capacity manager may return memory to the OS
    pub fn uncommit_enabled(&self) -> bool {
        self.config.uncommit && self.backing.uncommit_supported()
    }

    /// Allocate a range of heap offsets, null when exhausted
    pub fn alloc_range(&self, size: usize, force_low_address: bool) -> VirtualMemory {
        self.manager.lock().alloc(size, force_low_address)
    }

    pub fn free_range(&self, range: VirtualMemory) {
        self.manager.lock().free(range);
    }

    /// Unallocated offset ranges, lowest first
    pub fn free_ranges(&self) -> Vec<VirtualMemory> {
        self.manager.lock().allocator().free_ranges().collect()
    }

    /// Commit memory behind `[offset, offset + length)`
    ///
    /// Returns the bytes committed from `offset` on, which may fall short.
    pub fn commit(&self, offset: usize, length: usize) -> usize {
        self.backing.commit(offset, length)
    }

    pub fn uncommit(&self, offset: usize, length: usize) -> usize {
        self.backing.uncommit(offset, length)
    }

    /// Map committed offsets at a view address
    pub fn map_view(&self, addr: usize, size: usize, offset: usize) {
        self.backing.map(addr, size, offset);
    }

    pub fn unmap_view(&self, addr: usize, size: usize) {
        self.backing.unmap(addr, size);
    }

    pub fn view_address(&self, offset: usize, view: HeapView) -> usize {
        self.layout.view_address(offset, view)
    }

    /// Map `[offset, offset + size)` into every heap view
    pub fn map_all_views(&self, offset: usize, size: usize) {
        for view in self.layout.views() {
            self.map_view(self.view_address(offset, view), size, offset);
        }
    }

    pub fn unmap_all_views(&self, offset: usize, size: usize) {
        for view in self.layout.views() {
            self.unmap_view(self.view_address(offset, view), size);
        }
    }

    /// Fault in every page of a mapped range using all CPUs
    ///
    /// Workers claim granule-sized chunks until the range is done.
    ///
    /// # Safety
    ///
    /// `[addr, addr + size)` must be mapped readable and writable for the
    /// whole call.
    pub unsafe fn pretouch(&self, addr: usize, size: usize) {
        let page_size = page_size::get();
        let chunk = self.config.granule_size;
        let end = addr + size;
        let workers = num_cpus::get().min(size.div_ceil(chunk)).max(1);
        let cursor = AtomicUsize::new(addr);

        diag!(
            self.diagnostics,
            Debug,
            "Pretouching {} with {} workers",
            format_megabytes(size),
            workers
        );

        std::thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| loop {
                    let start = cursor.fetch_add(chunk, Ordering::Relaxed);
                    if start >= end {
                        break;
                    }
                    let len = chunk.min(end - start);
                    // SAFETY: the caller keeps the range mapped.
                    unsafe { touch_pages(start, len, page_size) };
                });
            }
        });
    }

    /// Reservation state and memory usage
    pub fn stats(&self) -> MemoryStats {
        let manager = self.manager.lock();
        MemoryStats {
            max_capacity: self.config.max_capacity,
            granule_size: self.config.granule_size,
            heap_views: self.layout.heap_views(),
            large_pages: self.backing.is_large_pages(),
            reserved: manager.reserved(),
            committed: self.backing.committed(),
            free_offsets: manager.allocator().free_bytes(),
            state: manager.state(),
            address_space: manager.report().cloned(),
        }
    }
}

impl fmt::Debug for HeapMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeapMemory")
            .field("layout", &self.layout)
            .field("manager", &*self.manager.lock())
            .field("backing", &self.backing)
            .finish()
    }
}
