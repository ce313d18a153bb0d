//! # FGC VMem - Virtual Memory Substrate for a Colored-Pointer Collector
//!
//! `fgc-vmem` reserves the heap's address space, commits physical memory
//! granule by granule and maps the same physical memory at several virtual
//! addresses (heap views) at once.
//!
//! ## Overview
//!
//! - **Multi-View Reservation**: Every heap offset is reserved in up to three views
//!   (Marked0, Marked1, Remapped) at addresses that differ only in one bit
//! - **Contiguous First**: One range is tried first, a union of smaller ranges after
//! - **Placeholders**: Free address space stays tiled by placeholders that views
//!   replace exactly, mirroring the Windows placeholder API on every platform
//! - **Granule Commit**: Memory is committed and returned in granules (2MB default)
//! - **Two Backends**: Pageable backing objects per granule, or locked large pages
//!   from a shared page pool
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use fgc_vmem::{HeapMemory, HeapView, VmemConfig};
//!
//! fn main() -> Result<(), fgc_vmem::VmemError> {
//!     let heap = HeapMemory::new(VmemConfig {
//!         max_capacity: 256 * 1024 * 1024, // 256MB
//!         ..Default::default()
//!     })?;
//!
//!     // Take a range of heap offsets and back it with memory
//!     let size = 4 * heap.config().granule_size;
//!     let range = heap.alloc_range(size, false);
//!     assert_eq!(heap.commit(range.start(), size), size);
//!
//!     // The same memory, visible in all views
//!     heap.map_all_views(range.start(), size);
//!     let marked0 = heap.view_address(range.start(), HeapView::Marked0);
//!     let remapped = heap.view_address(range.start(), HeapView::Remapped);
//!     unsafe {
//!         *(marked0 as *mut u64) = 42;
//!         assert_eq!(*(remapped as *const u64), 42);
//!     }
//!
//!     heap.unmap_all_views(range.start(), size);
//!     heap.uncommit(range.start(), size);
//!     heap.free_range(range);
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                      HeapMemory                          │
//! │  ┌──────────────────────────┐  ┌──────────────────────┐ │
//! │  │  VirtualMemoryManager     │  │ PhysicalMemoryBacking│ │
//! │  │  - multi-view reservation │  │ - commit / uncommit  │ │
//! │  │  - RangeAllocator         │  │ - map / unmap views  │ │
//! │  └────────────┬─────────────┘  └──────────┬───────────┘ │
//! │               │  PlaceholderCallbacks      │ GranuleMap  │
//! └───────────────┼────────────────────────────┼─────────────┘
//!                 ▼                            ▼
//!        ┌──────────────────────────────────────────────┐
//!        │  Mapper (small pages) │ SharedPagePool (large)│
//!        └──────────────────────────────────────────────┘
//!                          OS primitives
//! ```
//!
//! ## Failures
//!
//! Startup problems come back as [`VmemError`]. At run time, running out of
//! memory or address space is an ordinary return value (a null range, a
//! short commit). A failed OS call that should never fail goes to the
//! [`FatalHook`](logging::FatalHook), which aborts the process by default.
//!
//! ## Platform Support
//!
//! | Platform | Backing objects | Placeholders |
//! |----------|-----------------|--------------|
//! | Linux | `memfd_create`, `fallocate` | recorded in the ledger |
//! | macOS / BSD | `shm_open`, `ftruncate` | recorded in the ledger |
//! | Windows | `CreateFileMapping` (`SEC_RESERVE`) | `VirtualAlloc2` placeholders |
//!
//! ## Modules
//!
//! - [`address`]: Heap offsets, heap views and the address space limit
//! - [`backing`]: Physical memory backends and the shared page pool
//! - [`config`]: Configuration parameters and validation
//! - [`error`]: Error types
//! - [`granule_map`]: Per-granule metadata table
//! - [`heap`]: Upward interface to the collector
//! - [`logging`]: Diagnostic sink and fatal hook
//! - [`mapper`]: OS primitives for placeholders, backing objects and views
//! - [`memory`]: Range descriptors, range allocator and page touching
//! - [`virtual_memory`]: Address space reservation
//! - [`util`]: Alignment and formatting helpers

// Configuration and errors
pub mod config;
pub mod error;
pub mod logging;

// Address space
pub mod address;
pub mod memory;
pub mod virtual_memory;

// Physical memory
pub mod backing;
pub mod granule_map;
pub mod mapper;

// Collector-facing interface
pub mod heap;

// Utilities
pub mod util;

// Re-export main types for convenience
pub use address::{AddressLayout, HeapView};
pub use backing::{BackingContext, PhysicalMemoryBacking, SharedPagePool};
pub use config::VmemConfig;
pub use error::{Result, VmemError};
pub use granule_map::{GranuleMap, GranuleValue};
pub use heap::{HeapMemory, MemoryStats};
pub use logging::{DiagnosticSink, Diagnostics, LogLevel, LogSink, MemoryLogger};
pub use mapper::{Mapper, PhysicalHandle};
pub use memory::{RangeAllocator, VirtualMemory};
pub use virtual_memory::{AddressSpaceReport, ReservationState, ViewReserver, VirtualMemoryManager};

/// Crate version string from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
