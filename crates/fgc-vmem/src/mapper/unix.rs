//! Unix implementation of the mapper primitives
//!
//! Reservations are inaccessible anonymous mappings. Backing objects are
//! anonymous shared-memory files, so the same pages can be mapped at several
//! addresses. Placeholder splits and coalesces have no kernel counterpart.

use super::PhysicalHandle;
use memmap2::MmapOptions;
use std::fs::File;
use std::io;
use std::mem::ManuallyDrop;
use std::num::NonZeroUsize;
use std::os::unix::io::{FromRawFd, RawFd};

#[cfg(target_os = "linux")]
const NORESERVE: libc::c_int = libc::MAP_NORESERVE;
#[cfg(not(target_os = "linux"))]
const NORESERVE: libc::c_int = 0;

const RESERVE_FLAGS: libc::c_int = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | NORESERVE;

fn handle_to_fd(handle: PhysicalHandle) -> RawFd {
    (handle.raw() - 1) as RawFd
}

fn fd_to_handle(fd: RawFd) -> PhysicalHandle {
    // fd 0 must stay distinguishable from the empty slot
    PhysicalHandle::new(NonZeroUsize::MIN.saturating_add(fd as usize))
}

pub(crate) fn reserve(addr: usize, size: usize) -> io::Result<usize> {
    let res = unsafe {
        libc::mmap(
            addr as *mut libc::c_void,
            size,
            libc::PROT_NONE,
            RESERVE_FLAGS,
            -1,
            0,
        )
    };
    if res == libc::MAP_FAILED {
        return Err(io::Error::last_os_error());
    }
    Ok(res as usize)
}

pub(crate) fn unreserve(addr: usize, size: usize) -> io::Result<()> {
    let res = unsafe { libc::munmap(addr as *mut libc::c_void, size) };
    if res != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(target_os = "linux")]
pub(crate) fn create_file(name: &std::ffi::CStr, flags: libc::c_uint) -> io::Result<RawFd> {
    let fd = unsafe { libc::memfd_create(name.as_ptr(), libc::MFD_CLOEXEC | flags) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(fd)
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn create_file(name: &std::ffi::CStr, _flags: libc::c_uint) -> io::Result<RawFd> {
    use std::ffi::CString;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static SEQUENCE: AtomicUsize = AtomicUsize::new(0);

    let unique = format!(
        "/{}-{}-{}",
        name.to_string_lossy(),
        std::process::id(),
        SEQUENCE.fetch_add(1, Ordering::Relaxed)
    );
    let unique = CString::new(unique).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

    let fd = unsafe {
        libc::shm_open(
            unique.as_ptr(),
            libc::O_RDWR | libc::O_CREAT | libc::O_EXCL,
            0o600 as libc::c_uint,
        )
    };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    // Anonymous from here on
    unsafe { libc::shm_unlink(unique.as_ptr()) };
    Ok(fd)
}

/// Raise the soft open-file limit to the hard limit
///
/// Every committed granule holds one open file. Returns the soft limit in
/// effect afterwards, `u64::MAX` when unlimited.
pub(crate) fn raise_file_limit() -> io::Result<u64> {
    let mut limit = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    if unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut limit) } != 0 {
        return Err(io::Error::last_os_error());
    }

    if limit.rlim_cur < limit.rlim_max {
        let raised = libc::rlimit {
            rlim_cur: limit.rlim_max,
            rlim_max: limit.rlim_max,
        };
        // Refused above OPEN_MAX on macOS, the old limit stays
        if unsafe { libc::setrlimit(libc::RLIMIT_NOFILE, &raised) } == 0 {
            limit = raised;
        }
    }

    if limit.rlim_cur == libc::RLIM_INFINITY {
        Ok(u64::MAX)
    } else {
        Ok(limit.rlim_cur as u64)
    }
}

pub(crate) fn resize_file(fd: RawFd, size: usize) -> io::Result<()> {
    let res = unsafe { libc::ftruncate(fd, size as libc::off_t) };
    if res != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

pub(crate) fn close_file(fd: RawFd) -> io::Result<()> {
    let res = unsafe { libc::close(fd) };
    if res != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Touch every page of the file range through a temporary shared view
fn commit_through_scratch_view(fd: RawFd, offset: usize, len: usize) -> io::Result<()> {
    // The file stays owned by the caller
    let file = ManuallyDrop::new(unsafe { File::from_raw_fd(fd) });
    let mut scratch = unsafe {
        MmapOptions::new()
            .offset(offset as u64)
            .len(len)
            .map_mut(&*file)?
    };
    unsafe {
        crate::memory::touch_pages(scratch.as_mut_ptr() as usize, len, page_size::get());
    }
    Ok(())
}

/// Allocate the pages of `[offset, offset + len)` in a shared-memory file
#[cfg(target_os = "linux")]
pub(crate) fn commit_file_range(fd: RawFd, offset: usize, len: usize) -> io::Result<()> {
    let res = unsafe { libc::fallocate(fd, 0, offset as libc::off_t, len as libc::off_t) };
    if res == 0 {
        return Ok(());
    }

    let err = io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::EOPNOTSUPP) | Some(libc::ENOSYS) => {
            commit_through_scratch_view(fd, offset, len)
        }
        _ => Err(err),
    }
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn commit_file_range(fd: RawFd, offset: usize, len: usize) -> io::Result<()> {
    commit_through_scratch_view(fd, offset, len)
}

/// Return the pages of `[offset, offset + len)` to the kernel
#[cfg(target_os = "linux")]
pub(crate) fn release_file_range(fd: RawFd, offset: usize, len: usize) -> io::Result<()> {
    let mode = libc::FALLOC_FL_PUNCH_HOLE | libc::FALLOC_FL_KEEP_SIZE;
    let res = unsafe { libc::fallocate(fd, mode, offset as libc::off_t, len as libc::off_t) };
    if res != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn release_file_range(_fd: RawFd, _offset: usize, _len: usize) -> io::Result<()> {
    Ok(())
}

pub(crate) fn create_backing(size: usize) -> io::Result<PhysicalHandle> {
    let fd = create_file(c"fgc-vmem", 0)?;

    if let Err(err) = resize_file(fd, size) {
        let _ = close_file(fd);
        return Err(err);
    }

    Ok(fd_to_handle(fd))
}

pub(crate) fn commit_backing(handle: PhysicalHandle, size: usize) -> io::Result<()> {
    commit_file_range(handle_to_fd(handle), 0, size)
}

pub(crate) fn close_backing(handle: PhysicalHandle) -> io::Result<()> {
    close_file(handle_to_fd(handle))
}

/// Map `[offset, offset + size)` of a file at exactly `addr`
pub(crate) fn map_file(fd: RawFd, offset: usize, addr: usize, size: usize) -> io::Result<()> {
    let res = unsafe {
        libc::mmap(
            addr as *mut libc::c_void,
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED | libc::MAP_FIXED,
            fd,
            offset as libc::off_t,
        )
    };
    if res == libc::MAP_FAILED {
        return Err(io::Error::last_os_error());
    }
    if res as usize != addr {
        return Err(io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            "mapping placed at a different address",
        ));
    }
    Ok(())
}

/// Turn `[addr, addr + size)` back into an inaccessible reservation
pub(crate) fn unmap_file(addr: usize, size: usize) -> io::Result<()> {
    let res = unsafe {
        libc::mmap(
            addr as *mut libc::c_void,
            size,
            libc::PROT_NONE,
            RESERVE_FLAGS | libc::MAP_FIXED,
            -1,
            0,
        )
    };
    if res == libc::MAP_FAILED {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

pub(crate) fn map_view(
    handle: PhysicalHandle,
    file_offset: usize,
    addr: usize,
    size: usize,
) -> io::Result<()> {
    map_file(handle_to_fd(handle), file_offset, addr, size)
}

pub(crate) fn unmap_view(addr: usize, size: usize) -> io::Result<()> {
    unmap_file(addr, size)
}

pub(crate) fn split_placeholder(_addr: usize, _size: usize) -> io::Result<()> {
    Ok(())
}

pub(crate) fn coalesce_placeholders(_addr: usize, _size: usize) -> io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_encoding_keeps_fd_zero() {
        let handle = fd_to_handle(0);
        assert_eq!(handle.raw(), 1);
        assert_eq!(handle_to_fd(handle), 0);
    }

    #[test]
    fn test_backing_file_commit() {
        let size = 4 * page_size::get();
        let handle = create_backing(size).unwrap();

        commit_backing(handle, size).unwrap();
        commit_through_scratch_view(handle_to_fd(handle), 0, size).unwrap();

        close_backing(handle).unwrap();
    }

    #[test]
    fn test_raise_file_limit_never_lowers() {
        let mut limit = libc::rlimit {
            rlim_cur: 0,
            rlim_max: 0,
        };
        assert_eq!(unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut limit) }, 0);

        let raised = raise_file_limit().unwrap();
        assert!(raised >= limit.rlim_cur as u64);
    }
}
