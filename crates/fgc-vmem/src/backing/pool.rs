//! Shared Page Pool - Pinned Physical Frames for Large Pages
//!
//! One pool object owns all physical memory of the large-page backend.
//! Address space is attached to the pool directly (no placeholders), and
//! granule-sized frames are taken from and returned to the pool as the heap
//! commits and uncommits.
//!
//! ```text
//! pool:    [ f0 ][ f1 ][ f2 ][ f3 ][ f4 ][ ... ]      frames, granule sized
//!             │           │
//!             ▼           ▼
//! views:   0x0400_0000_0000 + offset            (one or more heap views)
//! ```
//!
//! Windows: an AWE section; frames are physical page numbers from
//! `AllocateUserPhysicalPages`, bound with `MapUserPhysicalPages`.
//! Unix: one shared-memory file, huge-page backed when the kernel can
//! provide huge pages, otherwise regular pages. Frames are file offsets.

use crate::error::Result;
use crate::granule_map::GranuleValue;
use crate::logging::{diag, Diagnostics};
use crate::util::debug::{format_megabytes, format_range};
use std::fmt;
use std::num::NonZeroUsize;

/// One granule-sized frame of the pool
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageFrame(NonZeroUsize);

impl PageFrame {
    fn from_index(index: usize) -> Self {
        Self(NonZeroUsize::MIN.saturating_add(index))
    }

    fn index(self) -> usize {
        self.0.get() - 1
    }
}

impl fmt::Debug for PageFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PageFrame({})", self.index())
    }
}

impl GranuleValue for Option<PageFrame> {
    fn to_word(self) -> usize {
        self.map_or(0, |frame| frame.0.get())
    }

    fn from_word(word: usize) -> Self {
        NonZeroUsize::new(word).map(PageFrame)
    }
}

/// SharedPagePool - physical frames for the large-page backend
pub struct SharedPagePool {
    granule_size: usize,
    capacity: usize,
    diagnostics: Diagnostics,
    inner: imp::Pool,
}

impl SharedPagePool {
    /// Create a pool able to hold `capacity` bytes of frames
    ///
    /// Runs before any address space is reserved.
    pub fn create(capacity: usize, granule_size: usize, diagnostics: Diagnostics) -> Result<Self> {
        let inner = imp::Pool::create(capacity, granule_size, &diagnostics)?;

        diag!(
            diagnostics,
            Debug,
            "Shared page pool: {} ({} pages)",
            format_megabytes(capacity),
            if inner.huge_pages() { "huge" } else { "regular" }
        );

        Ok(Self {
            granule_size,
            capacity,
            diagnostics,
            inner,
        })
    }

    pub fn granule_size(&self) -> usize {
        self.granule_size
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Whether frames are backed by OS large pages
    pub fn huge_pages(&self) -> bool {
        self.inner.huge_pages()
    }

    /// Reserve `[addr, addr + size)` attached to the pool
    pub fn reserve(&self, addr: usize, size: usize) -> Option<usize> {
        let res = self.inner.reserve(addr, size)?;

        if addr != 0 && res != addr {
            self.unreserve(res, size);
            return None;
        }

        Some(res)
    }

    pub fn unreserve(&self, addr: usize, size: usize) {
        if let Err(err) = self.inner.unreserve(addr, size) {
            self.diagnostics.fatal(&format!(
                "Failed to unreserve memory {}: {}",
                format_range(addr, size),
                err
            ));
        }
    }

    /// Take up to `count` frames from the pool
    ///
    /// Returns fewer frames when the OS cannot provide more; every returned
    /// frame is fully allocated.
    pub fn allocate_frames(&self, count: usize) -> Vec<PageFrame> {
        let frames = self.inner.allocate(count, self.granule_size);

        if frames.len() < count {
            diag!(
                self.diagnostics,
                Debug,
                "Page pool satisfied {} of {} frames",
                frames.len(),
                count
            );
        }

        frames
    }

    pub fn free_frames(&self, frames: &[PageFrame]) {
        if let Err(err) = self.inner.free(frames, self.granule_size) {
            self.diagnostics
                .fatal(&format!("Failed to free page frames: {}", err));
        }
    }

    /// Bind `frames` to consecutive granules starting at `addr`
    pub fn map_frames(&self, addr: usize, frames: &[PageFrame]) {
        if let Err(err) = self.inner.map(addr, frames, self.granule_size) {
            self.diagnostics.fatal(&format!(
                "Failed to map page frames {}: {}",
                format_range(addr, frames.len() * self.granule_size),
                err
            ));
        }
    }

    /// Unbind `count` granules starting at `addr`
    pub fn unmap_frames(&self, addr: usize, count: usize) {
        let size = count * self.granule_size;
        if let Err(err) = self.inner.unmap(addr, size) {
            self.diagnostics.fatal(&format!(
                "Failed to unmap page frames {}: {}",
                format_range(addr, size),
                err
            ));
        }
    }

    /// Drop every binding in `[addr, addr + size)` and the reservation
    pub fn release(&self, addr: usize, size: usize) {
        self.unmap_frames(addr, size / self.granule_size);
        self.unreserve(addr, size);
    }
}

impl fmt::Debug for SharedPagePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedPagePool")
            .field("capacity", &self.capacity)
            .field("granule_size", &self.granule_size)
            .field("huge_pages", &self.huge_pages())
            .finish()
    }
}

#[cfg(unix)]
mod imp {
    use super::PageFrame;
    use crate::error::{Result, VmemError};
    use crate::logging::{diag, Diagnostics};
    use crate::mapper::unix as os;
    use parking_lot::Mutex;
    use std::io;
    use std::os::unix::io::RawFd;

    pub(super) struct Pool {
        fd: RawFd,
        huge: bool,
        /// Frame indices, lowest on top
        free: Mutex<Vec<usize>>,
    }

    fn open(capacity: usize, granule_size: usize, flags: libc::c_uint) -> io::Result<RawFd> {
        let fd = os::create_file(c"fgc-vmem-pool", flags)?;

        let probe = os::resize_file(fd, capacity)
            .and_then(|_| os::commit_file_range(fd, 0, granule_size))
            .and_then(|_| os::release_file_range(fd, 0, granule_size));

        if let Err(err) = probe {
            let _ = os::close_file(fd);
            return Err(err);
        }
        Ok(fd)
    }

    #[cfg(target_os = "linux")]
    fn open_huge(capacity: usize, granule_size: usize) -> io::Result<RawFd> {
        open(capacity, granule_size, libc::MFD_HUGETLB)
    }

    #[cfg(not(target_os = "linux"))]
    fn open_huge(_capacity: usize, _granule_size: usize) -> io::Result<RawFd> {
        Err(io::Error::from(io::ErrorKind::Unsupported))
    }

    impl Pool {
        pub(super) fn create(
            capacity: usize,
            granule_size: usize,
            diagnostics: &Diagnostics,
        ) -> Result<Self> {
            let (fd, huge) = match open_huge(capacity, granule_size) {
                Ok(fd) => (fd, true),
                Err(err) => {
                    diag!(
                        diagnostics,
                        Warn,
                        "Huge pages not available ({}), using regular pages",
                        err
                    );
                    let fd = open(capacity, granule_size, 0)
                        .map_err(|e| VmemError::LargePagesUnavailable(e.to_string()))?;
                    (fd, false)
                }
            };

            let frames = capacity / granule_size;
            Ok(Self {
                fd,
                huge,
                free: Mutex::new((0..frames).rev().collect()),
            })
        }

        pub(super) fn huge_pages(&self) -> bool {
            self.huge
        }

        pub(super) fn reserve(&self, addr: usize, size: usize) -> Option<usize> {
            os::reserve(addr, size).ok()
        }

        pub(super) fn unreserve(&self, addr: usize, size: usize) -> io::Result<()> {
            os::unreserve(addr, size)
        }

        pub(super) fn allocate(&self, count: usize, granule_size: usize) -> Vec<PageFrame> {
            let mut free = self.free.lock();
            let mut frames = Vec::with_capacity(count);

            while frames.len() < count {
                let Some(index) = free.pop() else {
                    break;
                };
                if os::commit_file_range(self.fd, index * granule_size, granule_size).is_err() {
                    free.push(index);
                    break;
                }
                frames.push(PageFrame::from_index(index));
            }

            frames
        }

        pub(super) fn free(&self, frames: &[PageFrame], granule_size: usize) -> io::Result<()> {
            let mut free = self.free.lock();
            for frame in frames {
                os::release_file_range(self.fd, frame.index() * granule_size, granule_size)?;
                free.push(frame.index());
            }
            Ok(())
        }

        pub(super) fn map(
            &self,
            addr: usize,
            frames: &[PageFrame],
            granule_size: usize,
        ) -> io::Result<()> {
            for (i, frame) in frames.iter().enumerate() {
                os::map_file(
                    self.fd,
                    frame.index() * granule_size,
                    addr + i * granule_size,
                    granule_size,
                )?;
            }
            Ok(())
        }

        pub(super) fn unmap(&self, addr: usize, size: usize) -> io::Result<()> {
            os::unmap_file(addr, size)
        }
    }

    impl Drop for Pool {
        fn drop(&mut self) {
            let _ = os::close_file(self.fd);
        }
    }
}

#[cfg(windows)]
mod imp {
    use super::PageFrame;
    use crate::error::{Result, VmemError};
    use crate::logging::Diagnostics;
    use std::io;
    use std::ptr;
    use windows_sys::Win32::Foundation::{CloseHandle, HANDLE, INVALID_HANDLE_VALUE};
    use windows_sys::Win32::System::Memory::{
        AllocateUserPhysicalPages, CreateFileMapping2, FreeUserPhysicalPages,
        GetLargePageMinimum, MapUserPhysicalPages, MemExtendedParameterUserPhysicalHandle,
        MemSectionExtendedParameterUserPhysicalFlags, VirtualAlloc2, VirtualFree,
        FILE_MAP_READ, FILE_MAP_WRITE, MEM_EXTENDED_PARAMETER, MEM_PHYSICAL, MEM_RELEASE,
        MEM_RESERVE, PAGE_READWRITE, SEC_LARGE_PAGES, SEC_RESERVE,
    };
    use windows_sys::Win32::System::Threading::GetCurrentProcess;

    pub(super) struct Pool {
        section: HANDLE,
    }

    // SAFETY: the section handle is process wide.
    unsafe impl Send for Pool {}
    unsafe impl Sync for Pool {}

    fn parameter(kind: i32) -> MEM_EXTENDED_PARAMETER {
        let mut param: MEM_EXTENDED_PARAMETER = unsafe { std::mem::zeroed() };
        param.Anonymous1._bitfield = kind as u64;
        param
    }

    fn pfns(frames: &[PageFrame]) -> Vec<usize> {
        frames.iter().map(|f| f.index()).collect()
    }

    impl Pool {
        pub(super) fn create(
            capacity: usize,
            granule_size: usize,
            _diagnostics: &Diagnostics,
        ) -> Result<Self> {
            let large_page = unsafe { GetLargePageMinimum() };
            if large_page == 0 || granule_size != large_page {
                return Err(VmemError::LargePagesUnavailable(format!(
                    "granule size {} does not match the large page size {}",
                    granule_size, large_page
                )));
            }

            let mut param = parameter(MemSectionExtendedParameterUserPhysicalFlags);
            let section = unsafe {
                CreateFileMapping2(
                    INVALID_HANDLE_VALUE,
                    ptr::null(),
                    FILE_MAP_WRITE | FILE_MAP_READ,
                    PAGE_READWRITE,
                    SEC_RESERVE | SEC_LARGE_PAGES,
                    capacity as u64,
                    ptr::null(),
                    &mut param,
                    1,
                )
            };
            if section == 0 {
                return Err(VmemError::LargePagesUnavailable(format!(
                    "Failed to create shared AWE section ({})",
                    io::Error::last_os_error()
                )));
            }

            Ok(Self { section })
        }

        pub(super) fn huge_pages(&self) -> bool {
            true
        }

        pub(super) fn reserve(&self, addr: usize, size: usize) -> Option<usize> {
            let mut param = parameter(MemExtendedParameterUserPhysicalHandle);
            param.Anonymous2.Handle = self.section;

            let res = unsafe {
                VirtualAlloc2(
                    GetCurrentProcess(),
                    addr as *const _,
                    size,
                    MEM_RESERVE | MEM_PHYSICAL,
                    PAGE_READWRITE,
                    &mut param,
                    1,
                )
            };
            if res.is_null() {
                return None;
            }
            Some(res as usize)
        }

        pub(super) fn unreserve(&self, addr: usize, _size: usize) -> io::Result<()> {
            let res = unsafe { VirtualFree(addr as *mut _, 0, MEM_RELEASE) };
            if res == 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        }

        pub(super) fn allocate(&self, count: usize, _granule_size: usize) -> Vec<PageFrame> {
            let mut pfns = vec![0usize; count];
            let mut npages = count;

            let res =
                unsafe { AllocateUserPhysicalPages(self.section, &mut npages, pfns.as_mut_ptr()) };
            if res == 0 {
                return Vec::new();
            }

            pfns.truncate(npages);
            pfns.into_iter().map(PageFrame::from_index).collect()
        }

        pub(super) fn free(&self, frames: &[PageFrame], _granule_size: usize) -> io::Result<()> {
            let pfns = pfns(frames);
            let mut npages = pfns.len();
            let res = unsafe { FreeUserPhysicalPages(self.section, &mut npages, pfns.as_ptr()) };
            if res == 0 || npages != pfns.len() {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        }

        pub(super) fn map(
            &self,
            addr: usize,
            frames: &[PageFrame],
            _granule_size: usize,
        ) -> io::Result<()> {
            let pfns = pfns(frames);
            let res = unsafe { MapUserPhysicalPages(addr as *const _, pfns.len(), pfns.as_ptr()) };
            if res == 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        }

        pub(super) fn unmap(&self, addr: usize, size: usize) -> io::Result<()> {
            let npages = size / unsafe { GetLargePageMinimum() };
            let res = unsafe { MapUserPhysicalPages(addr as *const _, npages, ptr::null()) };
            if res == 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        }
    }

    impl Drop for Pool {
        fn drop(&mut self) {
            unsafe { CloseHandle(self.section) };
        }
    }
}
