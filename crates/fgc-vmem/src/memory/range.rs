//! Virtual memory range descriptor

use serde::Serialize;
use std::fmt;

/// VirtualMemory - `(start, size)` over a reserved region
///
/// Purely descriptive: creating or dropping one never touches the OS. The
/// null range (`start == usize::MAX`) reports a failed allocation.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct VirtualMemory {
    start: usize,
    size: usize,
}

impl VirtualMemory {
    /// Create a range descriptor
    pub const fn new(start: usize, size: usize) -> Self {
        Self { start, size }
    }

    /// The null range
    pub const fn null() -> Self {
        Self {
            start: usize::MAX,
            size: 0,
        }
    }

    pub fn is_null(&self) -> bool {
        self.start == usize::MAX
    }

    pub fn start(&self) -> usize {
        self.start
    }

    pub fn end(&self) -> usize {
        self.start + self.size
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Check if `offset` falls inside the range
    pub fn contains(&self, offset: usize) -> bool {
        !self.is_null() && offset >= self.start && offset < self.end()
    }
}

impl fmt::Debug for VirtualMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            return write!(f, "VirtualMemory(null)");
        }
        write!(f, "VirtualMemory({:#x}..{:#x})", self.start, self.end())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_range() {
        let null = VirtualMemory::null();
        assert!(null.is_null());
        assert_eq!(null.size(), 0);
        assert!(!null.contains(0));
        assert!(!VirtualMemory::new(0, 4096).is_null());
    }

    #[test]
    fn test_contains_is_end_exclusive() {
        let range = VirtualMemory::new(0x2000, 0x2000);
        assert!(range.contains(0x2000));
        assert!(range.contains(0x3fff));
        assert!(!range.contains(0x4000));
    }
}
