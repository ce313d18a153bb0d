//! Windows implementation of the mapper primitives
//!
//! Placeholders are real kernel objects here (`VirtualAlloc2` with
//! `MEM_RESERVE_PLACEHOLDER`). Backing objects are paging-file sections
//! created with `SEC_RESERVE`, so they are not charged against the commit
//! limit until committed through a scratch view.

use super::PhysicalHandle;
use std::io;
use std::ptr;
use windows_sys::Win32::Foundation::{CloseHandle, HANDLE, INVALID_HANDLE_VALUE};
use windows_sys::Win32::System::Memory::{
    CreateFileMappingW, MapViewOfFile3, UnmapViewOfFile2, VirtualAlloc2, VirtualFree,
    MEMORY_MAPPED_VIEW_ADDRESS, MEM_COALESCE_PLACEHOLDERS, MEM_COMMIT, MEM_PRESERVE_PLACEHOLDER,
    MEM_RELEASE, MEM_REPLACE_PLACEHOLDER, MEM_RESERVE, MEM_RESERVE_PLACEHOLDER, PAGE_NOACCESS,
    PAGE_READWRITE, SEC_RESERVE,
};
use windows_sys::Win32::System::Threading::GetCurrentProcess;

fn to_handle(handle: PhysicalHandle) -> HANDLE {
    handle.raw() as HANDLE
}

pub(crate) fn reserve(addr: usize, size: usize) -> io::Result<usize> {
    let res = unsafe {
        VirtualAlloc2(
            GetCurrentProcess(),
            addr as *const _,
            size,
            MEM_RESERVE | MEM_RESERVE_PLACEHOLDER,
            PAGE_NOACCESS,
            ptr::null_mut(),
            0,
        )
    };
    if res.is_null() {
        return Err(io::Error::last_os_error());
    }
    Ok(res as usize)
}

pub(crate) fn unreserve(addr: usize, _size: usize) -> io::Result<()> {
    let res = unsafe { VirtualFree(addr as *mut _, 0, MEM_RELEASE) };
    if res == 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

pub(crate) fn create_backing(size: usize) -> io::Result<PhysicalHandle> {
    let handle = unsafe {
        CreateFileMappingW(
            INVALID_HANDLE_VALUE,
            ptr::null(),
            PAGE_READWRITE | SEC_RESERVE,
            (size as u64 >> 32) as u32,
            size as u32,
            ptr::null(),
        )
    };
    PhysicalHandle::from_raw(handle as usize).ok_or_else(io::Error::last_os_error)
}

fn map_view_no_placeholder(handle: HANDLE, file_offset: usize, size: usize) -> io::Result<usize> {
    let view = unsafe {
        MapViewOfFile3(
            handle,
            GetCurrentProcess(),
            ptr::null(),
            file_offset as u64,
            size,
            0,
            PAGE_READWRITE,
            ptr::null_mut(),
            0,
        )
    };
    if view.Value.is_null() {
        return Err(io::Error::last_os_error());
    }
    Ok(view.Value as usize)
}

fn unmap_view_no_placeholder(addr: usize) -> io::Result<()> {
    let view = MEMORY_MAPPED_VIEW_ADDRESS {
        Value: addr as *mut _,
    };
    let res = unsafe { UnmapViewOfFile2(GetCurrentProcess(), view, 0) };
    if res == 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Commit a section through a temporary view
pub(crate) fn commit_backing(handle: PhysicalHandle, size: usize) -> io::Result<()> {
    let addr = map_view_no_placeholder(to_handle(handle), 0, size)?;

    let res = unsafe {
        VirtualAlloc2(
            GetCurrentProcess(),
            addr as *const _,
            size,
            MEM_COMMIT,
            PAGE_READWRITE,
            ptr::null_mut(),
            0,
        )
    };
    let commit = if res as usize == addr {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    };

    unmap_view_no_placeholder(addr)?;
    commit
}

pub(crate) fn close_backing(handle: PhysicalHandle) -> io::Result<()> {
    let res = unsafe { CloseHandle(to_handle(handle)) };
    if res == 0 {
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
    let view = unsafe {
        MapViewOfFile3(
            to_handle(handle),
            GetCurrentProcess(),
            addr as *const _,
            file_offset as u64,
            size,
            MEM_REPLACE_PLACEHOLDER,
            PAGE_READWRITE,
            ptr::null_mut(),
            0,
        )
    };
    if view.Value as usize != addr {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

pub(crate) fn unmap_view(addr: usize, _size: usize) -> io::Result<()> {
    let view = MEMORY_MAPPED_VIEW_ADDRESS {
        Value: addr as *mut _,
    };
    let res = unsafe { UnmapViewOfFile2(GetCurrentProcess(), view, MEM_PRESERVE_PLACEHOLDER) };
    if res == 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

pub(crate) fn split_placeholder(addr: usize, size: usize) -> io::Result<()> {
    let res = unsafe { VirtualFree(addr as *mut _, size, MEM_RELEASE | MEM_PRESERVE_PLACEHOLDER) };
    if res == 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

pub(crate) fn coalesce_placeholders(addr: usize, size: usize) -> io::Result<()> {
    let res = unsafe { VirtualFree(addr as *mut _, size, MEM_RELEASE | MEM_COALESCE_PLACEHOLDERS) };
    if res == 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
