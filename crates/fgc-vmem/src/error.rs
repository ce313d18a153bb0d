//! Error Module - Virtual Memory Error Types
//!
//! Only startup and configuration problems are reported as errors. Expected
//! runtime outcomes (partial commit, a failed reservation candidate) are plain
//! return values, and broken invariants go through the fatal hook in
//! [`crate::logging`].
//!
//! # Error Categories
//!
//! ## Startup Errors
//! - `HeapTooLarge` - Capacity exceeds the addressable offset range
//! - `ReservationFailed` - Not enough address space could be reserved
//! - `LargePagesUnavailable` - Shared page pool could not be created
//!
//! ## Configuration Errors
//! - `Configuration` - Invalid configuration
//! - `InvalidState` - Operation in the wrong lifecycle state

use crate::config::ConfigError;
use thiserror::Error;

/// Main error type for virtual memory operations
///
/// # Examples
///
/// ```rust
/// use fgc_vmem::VmemError;
///
/// fn report(err: VmemError) {
///     match err {
///         VmemError::ReservationFailed { requested, reserved } => {
///             eprintln!("reserved {} of {} bytes", reserved, requested);
///         }
///         other => eprintln!("startup failed: {}", other),
///     }
/// }
/// ```
#[derive(Debug, Error)]
pub enum VmemError {
    /// Requested capacity cannot be addressed by the offset space
    ///
    /// **When returned:** `max_capacity` exceeds the maximum heap offset
    ///
    /// **Recovery strategy:** Lower the heap capacity or widen the offset bits
    #[error("Heap too large: requested {requested} bytes, max supported {max} bytes")]
    HeapTooLarge { requested: usize, max: usize },

    /// Address space reservation did not reach the requested capacity
    ///
    /// **When returned:** Both contiguous and discontiguous reservation fell short
    ///
    /// **Recovery strategy:** Cannot recover - report a startup failure
    #[error("Failed to reserve enough address space: requested {requested} bytes, reserved {reserved} bytes")]
    ReservationFailed { requested: usize, reserved: usize },

    /// Shared physical page pool unavailable
    ///
    /// **When returned:** Large pages requested but the OS refused the pool
    ///
    /// **Recovery strategy:** Restart without large pages or grant the
    /// lock-memory privilege
    #[error("Large pages unavailable: {0}")]
    LargePagesUnavailable(String),

    /// Configuration error
    ///
    /// **When returned:** `VmemConfig::validate` rejected the configuration
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),

    /// Invalid lifecycle state
    ///
    /// **When returned:** Operation requires a state the manager is not in
    ///
    /// **Recovery strategy:** Cannot recover - indicates a caller bug
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },
}

impl VmemError {
    /// Check if retrying with a different configuration can succeed
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            VmemError::HeapTooLarge { .. }
                | VmemError::LargePagesUnavailable(_)
                | VmemError::Configuration(_)
        )
    }

    /// Check if this error indicates a bug in the caller
    pub fn is_bug(&self) -> bool {
        matches!(self, VmemError::InvalidState { .. })
    }
}

/// Result type alias for virtual memory operations
pub type Result<T> = std::result::Result<T, VmemError>;
