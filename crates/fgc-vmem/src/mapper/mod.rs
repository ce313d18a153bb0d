//! Physical Memory Mapper - OS Facing Primitives
//!
//! ============================================================================
//! OVERVIEW
//! ============================================================================
//!
//! The mapper is the only component that talks to the OS for the small-page
//! backend. It offers three groups of primitives:
//!
//! - Address space: reserve / unreserve placeholders, split / coalesce them
//! - Backing objects: one granule of pageable memory per handle, created
//!   reserved-only and committed separately
//! - Views: replace a granule placeholder with a mapping of a backing object,
//!   and restore the placeholder afterwards
//!
//! ============================================================================
//! PLATFORMS
//! ============================================================================
//!
//! ```text
//!                 Windows                          Unix
//! reserve         VirtualAlloc2(PLACEHOLDER)       mmap(PROT_NONE, NORESERVE)
//! split           VirtualFree(PRESERVE)            ledger only
//! coalesce        VirtualFree(COALESCE)            ledger only
//! backing         CreateFileMapping(SEC_RESERVE)   memfd / shm_open + ftruncate
//! commit          scratch view + VirtualAlloc2     fallocate, scratch view fallback
//! map view        MapViewOfFile3(REPLACE)          mmap(MAP_SHARED | MAP_FIXED)
//! unmap view      UnmapViewOfFile2(PRESERVE)       mmap(PROT_NONE | MAP_FIXED)
//! ```
//!
//! On both platforms every placeholder change first goes through the
//! [`PlaceholderLedger`], so a broken tiling is caught the same way
//! everywhere.
//!
//! ============================================================================
//! FAILURES
//! ============================================================================
//!
//! Expected failures (reservation refused, backing object or commit refused)
//! return `None`/`false` and are logged. Everything else fails only when an
//! invariant is broken and goes to the fatal hook with the OS error.

pub mod placeholder;

#[cfg(unix)]
pub(crate) mod unix;
#[cfg(unix)]
use unix as os;

#[cfg(windows)]
pub(crate) mod windows;
#[cfg(windows)]
use windows as os;

pub use placeholder::{PlaceholderCallbacks, PlaceholderError, PlaceholderLedger, PlaceholderOps};

use crate::granule_map::GranuleValue;
use crate::logging::{diag, Diagnostics};
use crate::util::debug::format_range;
use parking_lot::Mutex;
use std::fmt;
use std::num::NonZeroUsize;

/// Opaque handle of one physical backing object
///
/// Never zero, so an empty granule slot can hold `None`.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PhysicalHandle(NonZeroUsize);

impl PhysicalHandle {
    pub(crate) fn new(raw: NonZeroUsize) -> Self {
        Self(raw)
    }

    pub(crate) fn from_raw(raw: usize) -> Option<Self> {
        NonZeroUsize::new(raw).map(Self)
    }

    pub(crate) fn raw(self) -> usize {
        self.0.get()
    }
}

impl fmt::Debug for PhysicalHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysicalHandle({:#x})", self.0)
    }
}

impl GranuleValue for Option<PhysicalHandle> {
    fn to_word(self) -> usize {
        self.map_or(0, PhysicalHandle::raw)
    }

    fn from_word(word: usize) -> Self {
        PhysicalHandle::from_raw(word)
    }
}

/// Mapper - placeholder, backing object and view primitives
pub struct Mapper {
    granule_size: usize,
    ledger: Mutex<PlaceholderLedger>,
    diagnostics: Diagnostics,
}

impl Mapper {
    pub fn new(granule_size: usize, diagnostics: Diagnostics) -> Self {
        Self {
            granule_size,
            ledger: Mutex::new(PlaceholderLedger::new()),
            diagnostics,
        }
    }

    pub fn granule_size(&self) -> usize {
        self.granule_size
    }

    fn fatal_ledger(&self, what: &str, err: PlaceholderError) -> ! {
        self.diagnostics.fatal(&format!("{}: {}", what, err))
    }

    fn fatal_os(&self, what: &str, addr: usize, size: usize, err: std::io::Error) -> ! {
        self.diagnostics
            .fatal(&format!("{} {}: {}", what, format_range(addr, size), err))
    }

    /// Reserve `[addr, addr + size)` as one placeholder
    ///
    /// Returns `None` when the OS refuses or places the reservation
    /// elsewhere. An `addr` of zero accepts any placement.
    pub fn reserve(&self, addr: usize, size: usize) -> Option<usize> {
        let res = match os::reserve(addr, size) {
            Ok(res) => res,
            Err(err) => {
                diag!(
                    self.diagnostics,
                    Trace,
                    "Reserve failed {}: {}",
                    format_range(addr, size),
                    err
                );
                return None;
            }
        };

        if addr != 0 && res != addr {
            // Hint not honored, give the range back
            if let Err(err) = os::unreserve(res, size) {
                self.fatal_os("Failed to unreserve memory", res, size, err);
            }
            return None;
        }

        if let Err(err) = self.ledger.lock().reserve(res, size) {
            self.fatal_ledger("Failed to record reservation", err);
        }

        diag!(self.diagnostics, Trace, "Reserved {}", format_range(res, size));
        Some(res)
    }

    /// Release exactly one placeholder
    pub fn unreserve(&self, addr: usize, size: usize) {
        if let Err(err) = self.ledger.lock().unreserve(addr, size) {
            self.fatal_ledger("Failed to unreserve memory", err);
        }
        if let Err(err) = os::unreserve(addr, size) {
            self.fatal_os("Failed to unreserve memory", addr, size, err);
        }
        diag!(self.diagnostics, Trace, "Unreserved {}", format_range(addr, size));
    }

    /// Make room for `granules` live backing objects
    ///
    /// Each committed granule keeps one file open on unix, so the soft
    /// open-file limit is raised to the hard limit. A limit still below
    /// `granules` caps how much can be committed and is reported.
    pub fn ensure_backing_capacity(&self, granules: usize) {
        #[cfg(unix)]
        {
            match os::raise_file_limit() {
                Ok(limit) if limit < granules as u64 => diag!(
                    self.diagnostics,
                    Warn,
                    "Open file limit {} is below the {} granules of the heap, commit will fall short",
                    limit,
                    granules
                ),
                Ok(limit) => diag!(self.diagnostics, Debug, "Open file limit: {}", limit),
                Err(err) => diag!(
                    self.diagnostics,
                    Warn,
                    "Failed to raise the open file limit ({})",
                    err
                ),
            }
        }
        #[cfg(not(unix))]
        {
            let _ = granules;
        }
    }

    /// Create a reserved-only backing object of `size` bytes
    pub fn create_physical_backing(&self, size: usize) -> Option<PhysicalHandle> {
        match os::create_backing(size) {
            Ok(handle) => Some(handle),
            Err(err) => {
                diag!(
                    self.diagnostics,
                    Error,
                    "Failed to create physical backing ({})",
                    err
                );
                None
            }
        }
    }

    /// Commit the pages behind a backing object
    pub fn commit_physical_backing(&self, handle: PhysicalHandle, size: usize) -> bool {
        match os::commit_backing(handle, size) {
            Ok(()) => true,
            Err(err) => {
                diag!(self.diagnostics, Error, "Failed to commit memory ({})", err);
                false
            }
        }
    }

    /// Create and commit in one step, closing the object if commit fails
    pub fn create_and_commit_physical_backing(&self, size: usize) -> Option<PhysicalHandle> {
        let handle = self.create_physical_backing(size)?;

        if !self.commit_physical_backing(handle, size) {
            self.close_physical_backing(handle);
            return None;
        }

        Some(handle)
    }

    pub fn close_physical_backing(&self, handle: PhysicalHandle) {
        if let Err(err) = os::close_backing(handle) {
            self.diagnostics
                .fatal(&format!("Failed to close handle {:?}: {}", handle, err));
        }
    }

    /// Replace the placeholder at exactly `[addr, addr + size)` with a view
    pub fn map_view(&self, handle: PhysicalHandle, file_offset: usize, addr: usize, size: usize) {
        if let Err(err) = self.ledger.lock().replace_with_view(addr, size) {
            self.fatal_ledger("Failed to map view", err);
        }
        if let Err(err) = os::map_view(handle, file_offset, addr, size) {
            self.fatal_os("Failed to map view", addr, size, err);
        }
    }

    /// Replace the view at exactly `[addr, addr + size)` with a placeholder
    pub fn unmap_view(&self, addr: usize, size: usize) {
        if let Err(err) = self.ledger.lock().restore_placeholder(addr, size) {
            self.fatal_ledger("Failed to unmap view", err);
        }
        if let Err(err) = os::unmap_view(addr, size) {
            self.fatal_os("Failed to unmap view", addr, size, err);
        }
    }

    pub fn split_placeholder(&self, addr: usize, size: usize) {
        if let Err(err) = self.ledger.lock().split(addr, size) {
            self.fatal_ledger("Failed to split placeholder", err);
        }
        if let Err(err) = os::split_placeholder(addr, size) {
            self.fatal_os("Failed to split placeholder", addr, size, err);
        }
    }

    pub fn coalesce_placeholders(&self, addr: usize, size: usize) {
        if let Err(err) = self.ledger.lock().coalesce(addr, size) {
            self.fatal_ledger("Failed to coalesce placeholders", err);
        }
        if let Err(err) = os::coalesce_placeholders(addr, size) {
            self.fatal_os("Failed to coalesce placeholders", addr, size, err);
        }
    }

    /// Placeholders intersecting `[addr, addr + size)`
    pub fn placeholders(&self, addr: usize, size: usize) -> Vec<(usize, usize)> {
        self.ledger.lock().placeholders(addr, size)
    }

    /// Mapped views intersecting `[addr, addr + size)`
    pub fn views(&self, addr: usize, size: usize) -> Vec<(usize, usize)> {
        self.ledger.lock().views(addr, size)
    }

    /// Give back every view and placeholder inside `[addr, addr + size)`
    pub fn release(&self, addr: usize, size: usize) {
        let views = self.views(addr, size);
        for (start, len) in views {
            self.unmap_view(start, len);
        }

        let placeholders = self.placeholders(addr, size);
        for (start, len) in placeholders {
            self.unreserve(start, len);
        }
    }
}

impl PlaceholderOps for Mapper {
    fn split_placeholder(&self, addr: usize, size: usize) {
        Mapper::split_placeholder(self, addr, size);
    }

    fn coalesce_placeholders(&self, addr: usize, size: usize) {
        Mapper::coalesce_placeholders(self, addr, size);
    }
}

impl fmt::Debug for Mapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ledger = self.ledger.lock();
        f.debug_struct("Mapper")
            .field("granule_size", &self.granule_size)
            .field("placeholders", &ledger.placeholder_count())
            .field("views", &ledger.view_count())
            .finish()
    }
}
