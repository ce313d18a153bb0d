//! Physical Memory Backing - Committed Memory of the Heap Offset Space
//!
//! The backing owns the physical memory behind heap offsets. Memory is
//! committed and uncommitted by offset, then mapped into as many heap views
//! as the collector wants.
//!
//! Two backends, picked once at startup:
//!
//! ```text
//! Small pages:  offset ──► GranuleMap<PhysicalHandle> ──► one backing object per granule
//! Large pages:  offset ──► GranuleMap<PageFrame> ──► SharedPagePool (locked pages)
//! ```
//!
//! The reserving side of each backend is exposed through [`BackingContext`],
//! which the virtual memory manager uses as its [`ViewReserver`].

pub mod large_pages;
pub mod pool;
pub mod small_pages;

pub use large_pages::LargePagesBacking;
pub use pool::{PageFrame, SharedPagePool};
pub use small_pages::SmallPagesBacking;

use crate::config::VmemConfig;
use crate::error::Result;
use crate::logging::{diag, Diagnostics};
use crate::mapper::{Mapper, PlaceholderOps};
use crate::util::debug::format_range;
use crate::util::Alignment;
use crate::virtual_memory::ViewReserver;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// OS resources shared by reservation and backing
#[derive(Clone, Debug)]
pub enum BackingContext {
    SmallPages(Arc<Mapper>),
    LargePages(Arc<SharedPagePool>),
}

impl BackingContext {
    /// Set up the OS side for `config`
    ///
    /// Large pages need their pool before any address space is reserved.
    pub fn create(config: &VmemConfig, diagnostics: &Diagnostics) -> Result<Self> {
        if config.use_large_pages {
            let pool = SharedPagePool::create(
                config.max_capacity,
                config.granule_size,
                diagnostics.clone(),
            )?;
            Ok(BackingContext::LargePages(Arc::new(pool)))
        } else {
            let mapper = Mapper::new(config.granule_size, diagnostics.clone());
            mapper.ensure_backing_capacity(config.max_capacity / config.granule_size);
            Ok(BackingContext::SmallPages(Arc::new(mapper)))
        }
    }

    pub fn granule_size(&self) -> usize {
        match self {
            BackingContext::SmallPages(mapper) => mapper.granule_size(),
            BackingContext::LargePages(pool) => pool.granule_size(),
        }
    }

    pub fn is_large_pages(&self) -> bool {
        matches!(self, BackingContext::LargePages(_))
    }

    /// Backing for offsets `[0, max_capacity)`
    pub fn create_backing(&self, max_capacity: usize, diagnostics: Diagnostics) -> PhysicalMemoryBacking {
        let backend = match self {
            BackingContext::SmallPages(mapper) => Backend::SmallPages(SmallPagesBacking::new(
                mapper.clone(),
                max_capacity,
                diagnostics.clone(),
            )),
            BackingContext::LargePages(pool) => Backend::LargePages(LargePagesBacking::new(
                pool.clone(),
                max_capacity,
                diagnostics.clone(),
            )),
        };

        PhysicalMemoryBacking {
            backend,
            granule_size: self.granule_size(),
            committed: AtomicUsize::new(0),
            diagnostics,
        }
    }
}

impl ViewReserver for BackingContext {
    fn reserve(&self, addr: usize, size: usize) -> bool {
        let res = match self {
            BackingContext::SmallPages(mapper) => mapper.reserve(addr, size),
            BackingContext::LargePages(pool) => pool.reserve(addr, size),
        };
        res == Some(addr)
    }

    fn unreserve(&self, addr: usize, size: usize) {
        match self {
            BackingContext::SmallPages(mapper) => mapper.unreserve(addr, size),
            BackingContext::LargePages(pool) => pool.unreserve(addr, size),
        }
    }

    fn release(&self, addr: usize, size: usize) {
        match self {
            BackingContext::SmallPages(mapper) => mapper.release(addr, size),
            BackingContext::LargePages(pool) => pool.release(addr, size),
        }
    }

    fn placeholder_ops(&self) -> Option<Arc<dyn PlaceholderOps>> {
        match self {
            BackingContext::SmallPages(mapper) => Some(mapper.clone() as Arc<dyn PlaceholderOps>),
            // Pool reservations are never split
            BackingContext::LargePages(_) => None,
        }
    }
}

enum Backend {
    SmallPages(SmallPagesBacking),
    LargePages(LargePagesBacking),
}

/// PhysicalMemoryBacking - commit, uncommit and view mapping by offset
pub struct PhysicalMemoryBacking {
    backend: Backend,
    granule_size: usize,
    committed: AtomicUsize,
    diagnostics: Diagnostics,
}

impl PhysicalMemoryBacking {
    fn check_aligned(&self, what: &str, value: usize) {
        if !Alignment::is_aligned(value, self.granule_size) {
            self.diagnostics.fatal(&format!(
                "{} {:#x} is not aligned to the granule size {:#x}",
                what, value, self.granule_size
            ));
        }
    }

    pub fn granule_size(&self) -> usize {
        self.granule_size
    }

    pub fn is_large_pages(&self) -> bool {
        matches!(self.backend, Backend::LargePages(_))
    }

    /// Large pages stay pinned until shutdown
    pub fn uncommit_supported(&self) -> bool {
        !self.is_large_pages()
    }

    /// Bytes currently committed
    pub fn committed(&self) -> usize {
        self.committed.load(Ordering::Relaxed)
    }

    pub fn is_committed(&self, offset: usize) -> bool {
        match &self.backend {
            Backend::SmallPages(backing) => backing.is_committed(offset),
            Backend::LargePages(backing) => backing.is_committed(offset),
        }
    }

    /// Commit `[offset, offset + length)`, returning the committed prefix
    ///
    /// A short count means the OS ran out; the prefix stays committed and
    /// must be uncommitted by the caller.
    pub fn commit(&self, offset: usize, length: usize) -> usize {
        self.check_aligned("Commit offset", offset);
        self.check_aligned("Commit length", length);

        diag!(
            self.diagnostics,
            Trace,
            "Committing memory: {}",
            format_range(offset, length)
        );

        let committed = match &self.backend {
            Backend::SmallPages(backing) => backing.commit(offset, length),
            Backend::LargePages(backing) => backing.commit(offset, length),
        };

        if committed < length {
            diag!(
                self.diagnostics,
                Debug,
                "Committed {} of {} bytes at {:#x}",
                committed,
                length,
                offset
            );
        }

        self.committed.fetch_add(committed, Ordering::Relaxed);
        committed
    }

    /// Uncommit `[offset, offset + length)`, which must be fully committed
    pub fn uncommit(&self, offset: usize, length: usize) -> usize {
        self.check_aligned("Uncommit offset", offset);
        self.check_aligned("Uncommit length", length);

        diag!(
            self.diagnostics,
            Trace,
            "Uncommitting memory: {}",
            format_range(offset, length)
        );

        let uncommitted = match &self.backend {
            Backend::SmallPages(backing) => backing.uncommit(offset, length),
            Backend::LargePages(backing) => backing.uncommit(offset, length),
        };

        self.committed.fetch_sub(uncommitted, Ordering::Relaxed);
        uncommitted
    }

    /// Map committed `[offset, offset + size)` at view address `addr`
    pub fn map(&self, addr: usize, size: usize, offset: usize) {
        self.check_aligned("Map address", addr);
        self.check_aligned("Map size", size);
        self.check_aligned("Map offset", offset);

        diag!(
            self.diagnostics,
            Trace,
            "Mapping memory: {} at offset {:#x}",
            format_range(addr, size),
            offset
        );

        match &self.backend {
            Backend::SmallPages(backing) => backing.map(addr, size, offset),
            Backend::LargePages(backing) => backing.map(addr, size, offset),
        }
    }

    pub fn unmap(&self, addr: usize, size: usize) {
        self.check_aligned("Unmap address", addr);
        self.check_aligned("Unmap size", size);

        diag!(
            self.diagnostics,
            Trace,
            "Unmapping memory: {}",
            format_range(addr, size)
        );

        match &self.backend {
            Backend::SmallPages(backing) => backing.unmap(addr, size),
            Backend::LargePages(backing) => backing.unmap(addr, size),
        }
    }
}

impl Drop for PhysicalMemoryBacking {
    fn drop(&mut self) {
        let released = match &self.backend {
            Backend::SmallPages(backing) => backing.release_all(),
            Backend::LargePages(backing) => backing.release_all(),
        };

        if released > 0 {
            diag!(
                self.diagnostics,
                Debug,
                "Released {} committed bytes at shutdown",
                released
            );
        }
    }
}

impl fmt::Debug for PhysicalMemoryBacking {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PhysicalMemoryBacking")
            .field("large_pages", &self.is_large_pages())
            .field("granule_size", &self.granule_size)
            .field("committed", &self.committed())
            .finish()
    }
}
