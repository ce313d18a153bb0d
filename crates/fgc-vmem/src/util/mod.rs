//! Util Module - Shared Utilities
//!
//! Utilities and helper functions used throughout the memory layer.

pub mod alignment;
pub mod debug;

pub use alignment::Alignment;

/// Size constants
pub mod constants {
    /// 1 Megabyte
    pub const MB: usize = 1024 * 1024;
    /// 1 Gigabyte
    pub const GB: usize = 1024 * 1024 * 1024;
    /// 1 Terabyte
    pub const TB: usize = 1024 * GB;

    /// Default granule size: 2MB
    pub const DEFAULT_GRANULE_SIZE: usize = 2 * MB;

    /// Candidate base addresses probed for a contiguous reservation
    pub const MAX_RESERVE_ATTEMPTS: usize = 8192;

    /// Smallest discontiguous piece, as a fraction of the request (1%)
    pub const MIN_DISCONTIGUOUS_DIVISOR: usize = 100;

    /// Share of the process address space limit the heap views may use (1/2)
    pub const MAX_VIRT_MEM_FRACTION: usize = 2;
}
