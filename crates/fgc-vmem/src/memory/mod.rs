//! Memory - Range Bookkeeping and Raw Page Access
//!
//! This module holds the address-range side of the layer:
//! - [`VirtualMemory`]: ownership-free `(start, size)` descriptor
//! - [`RangeAllocator`]: free list of ranges inside a reservation
//!
//! It also provides the raw page touching used to pretouch mapped views and
//! to force allocation of backing pages.
//!
//! # Safety
//!
//! The page functions are `unsafe` because they operate on raw addresses.
//! The caller must ensure that:
//! - The whole range is mapped readable and writable
//! - No other mapping change races with the call

pub mod range;
pub mod range_allocator;

pub use range::VirtualMemory;
pub use range_allocator::{RangeAllocator, RangeCallback, RangeCallbacks, ResizeCallback};

use std::sync::atomic::{AtomicUsize, Ordering};

/// Touch one word in every OS page of `[addr, addr + size)`
///
/// Uses an atomic add of zero, so contents written concurrently by other
/// threads are preserved while the kernel still has to provide a writable
/// page.
///
/// # Safety
///
/// - `[addr, addr + size)` must be mapped readable and writable
/// - `addr` must be word aligned
///
/// # Example
///
/// ```rust
/// use fgc_vmem::memory::touch_pages;
///
/// let mut buffer = vec![7usize; 1024];
/// unsafe {
///     touch_pages(buffer.as_mut_ptr() as usize, 1024 * 8, 4096);
/// }
/// assert!(buffer.iter().all(|&w| w == 7));
/// ```
#[inline]
pub unsafe fn touch_pages(addr: usize, size: usize, page_size: usize) {
    let end = addr + size;
    let mut current = addr;
    while current < end {
        let word = &*(current as *const AtomicUsize);
        word.fetch_add(0, Ordering::Relaxed);
        current += page_size;
    }
}

/// Write a value at an address
///
/// # Safety
///
/// - `addr` must be valid for writes and aligned for `T`
#[inline]
pub unsafe fn write_value<T: Copy>(addr: usize, value: T) {
    std::ptr::write_volatile(addr as *mut T, value);
}

/// Read a value from an address
///
/// # Safety
///
/// - `addr` must be valid for reads and aligned for `T`
#[inline]
pub unsafe fn read_value<T: Copy>(addr: usize) -> T {
    std::ptr::read_volatile(addr as *const T)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_touch_preserves_contents() {
        let mut buffer = vec![0xABCDusize; 4096];
        unsafe {
            touch_pages(buffer.as_mut_ptr() as usize, buffer.len() * 8, 4096);
        }
        assert!(buffer.iter().all(|&w| w == 0xABCD));
    }

    #[test]
    fn test_read_write_value() {
        let mut slot = 0u64;
        let addr = &mut slot as *mut u64 as usize;
        unsafe {
            write_value(addr, 0x1234_5678u64);
            assert_eq!(read_value::<u64>(addr), 0x1234_5678);
        }
    }
}
