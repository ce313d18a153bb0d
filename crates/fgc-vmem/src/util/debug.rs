//! Debug Utilities
//!
//! Formatting helpers for diagnostics.

use super::constants::MB;

/// Format an address the way every diagnostic prints it
pub fn format_address(address: usize) -> String {
    format!("0x{:016X}", address)
}

/// Format an address range as `start + size`
pub fn format_range(start: usize, size: usize) -> String {
    format!("{} + {:#x}", format_address(start), size)
}

/// Format a byte count in whole megabytes
pub fn format_megabytes(bytes: usize) -> String {
    format!("{}M", bytes / MB)
}
