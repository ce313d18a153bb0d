//! Configuration Module - Memory Layer Parameters
//!
//! Manages all configuration inputs consumed by the virtual memory layer.
//! The uncommit delay is only carried here; the heap-capacity manager above
//! this layer decides when to call `uncommit`.

use crate::util::constants::{DEFAULT_GRANULE_SIZE, GB, TB};
use std::time::Duration;

/// Maximum number of heap views (Marked0, Marked1, Remapped)
pub const MAX_HEAP_VIEWS: usize = 3;

/// Smallest supported address offset width (4TB)
pub const MIN_ADDRESS_OFFSET_BITS: u32 = 42;

/// Largest supported address offset width (16TB)
pub const MAX_ADDRESS_OFFSET_BITS: u32 = 44;

/// Configuration for the virtual memory layer
///
/// # Examples
///
/// ```rust
/// use fgc_vmem::VmemConfig;
///
/// let config = VmemConfig {
///     max_capacity: 256 * 1024 * 1024,
///     use_large_pages: false,
///     ..Default::default()
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct VmemConfig {
    /// Granule size in bytes
    ///
    /// Unit of every commit, uncommit, map and unmap. Must be a power of two.
    /// Default: 2MB
    pub granule_size: usize,

    /// Maximum heap capacity in bytes
    ///
    /// Size of the physical offset space. Must be granule aligned.
    /// Default: 1GB
    pub max_capacity: usize,

    /// Number of heap views reserved for every heap offset
    ///
    /// Views are taken in order Marked0, Marked1, Remapped.
    /// Default: 3
    pub heap_views: usize,

    /// Back the heap with locked large pages from a shared page pool
    ///
    /// Requires the lock-memory privilege on Windows. Uncommit is
    /// implicitly disabled in this mode.
    /// Default: false
    pub use_large_pages: bool,

    /// Virtual address space reserved per byte of heap capacity
    ///
    /// Oversubscription lets the collector allocate fresh virtual ranges
    /// while old ones are still mapped.
    /// Default: 16
    pub virtual_to_physical_ratio: usize,

    /// Allow memory to be returned to the OS
    ///
    /// Default: true
    pub uncommit: bool,

    /// Minimum time memory stays committed but unused before it may be
    /// uncommitted by the heap-capacity manager
    ///
    /// Default: 300 seconds
    pub uncommit_delay: Duration,

    /// Width of the heap offset space in bits
    ///
    /// If None, derived from `max_capacity * virtual_to_physical_ratio` and
    /// clamped to 42..=44 bits. View bits sit right above the offset bits.
    /// Default: None
    pub address_offset_bits: Option<u32>,
}

impl Default for VmemConfig {
    fn default() -> Self {
        VmemConfig {
            granule_size: DEFAULT_GRANULE_SIZE,
            max_capacity: GB,
            heap_views: MAX_HEAP_VIEWS,
            use_large_pages: false,
            virtual_to_physical_ratio: 16,
            uncommit: true,
            uncommit_delay: Duration::from_secs(300),
            address_offset_bits: None,
        }
    }
}

impl VmemConfig {
    /// Validate configuration
    ///
    /// Checks if all values are in valid ranges.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use fgc_vmem::VmemConfig;
    ///
    /// let config = VmemConfig {
    ///     granule_size: 3 * 1024 * 1024,
    ///     ..Default::default()
    /// };
    /// assert!(config.validate().is_err());
    /// ```
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.granule_size.is_power_of_two() {
            return Err(ConfigError::InvalidGranuleSize(format!(
                "granule_size {} must be a power of two",
                self.granule_size
            )));
        }

        if self.granule_size < page_size::get() {
            return Err(ConfigError::InvalidGranuleSize(format!(
                "granule_size {} must be at least the OS page size",
                self.granule_size
            )));
        }

        if self.max_capacity == 0 || self.max_capacity % self.granule_size != 0 {
            return Err(ConfigError::InvalidCapacity(format!(
                "max_capacity {} must be a non-zero multiple of the granule size",
                self.max_capacity
            )));
        }

        if self.heap_views == 0 || self.heap_views > MAX_HEAP_VIEWS {
            return Err(ConfigError::InvalidHeapViews(format!(
                "heap_views must be between 1 and {}",
                MAX_HEAP_VIEWS
            )));
        }

        if self.virtual_to_physical_ratio == 0 {
            return Err(ConfigError::InvalidRatio(
                "virtual_to_physical_ratio must be > 0".to_string(),
            ));
        }

        if let Some(bits) = self.address_offset_bits {
            // View bits must stay inside a 47-bit user address space.
            let highest_view_bit = bits as usize + self.heap_views - 1;
            if highest_view_bit >= 47 || (1usize << bits) < self.granule_size {
                return Err(ConfigError::InvalidOffsetBits(format!(
                    "address_offset_bits {} leaves no room for {} views",
                    bits, self.heap_views
                )));
            }
        }

        Ok(())
    }

    /// Granule size as a shift
    pub fn granule_shift(&self) -> u32 {
        self.granule_size.trailing_zeros()
    }

    /// Width of the heap offset space in bits
    ///
    /// Mirrors the x86_64 layout: the offset space is the next power of two of
    /// the reserved size, clamped to [42, 44] bits.
    pub fn effective_offset_bits(&self) -> u32 {
        if let Some(bits) = self.address_offset_bits {
            return bits;
        }

        let wanted = self
            .max_capacity
            .saturating_mul(self.virtual_to_physical_ratio)
            .checked_next_power_of_two()
            .unwrap_or(16 * TB);
        wanted
            .trailing_zeros()
            .clamp(MIN_ADDRESS_OFFSET_BITS, MAX_ADDRESS_OFFSET_BITS)
    }

    /// Build configuration from environment variables
    ///
    /// Overrides defaults with environment variables:
    /// - FGC_VMEM_MAX_CAPACITY
    /// - FGC_VMEM_GRANULE_SIZE
    /// - FGC_VMEM_LARGE_PAGES
    /// - FGC_VMEM_UNCOMMIT
    /// - FGC_VMEM_UNCOMMIT_DELAY_SECS
    ///
    /// A value that does not parse is an error rather than a silent default.
    ///
    /// # Examples
    ///
    /// ```bash
    /// export FGC_VMEM_MAX_CAPACITY=4294967296  # 4GB
    /// export FGC_VMEM_LARGE_PAGES=1
    /// ```
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    /// Build configuration from any variable source
    pub fn from_vars<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(size) =
            parse_var(&lookup, "FGC_VMEM_MAX_CAPACITY", |v| v.parse::<usize>().ok())?
        {
            config.max_capacity = size;
        }
        if let Some(size) =
            parse_var(&lookup, "FGC_VMEM_GRANULE_SIZE", |v| v.parse::<usize>().ok())?
        {
            config.granule_size = size;
        }
        if let Some(flag) = parse_var(&lookup, "FGC_VMEM_LARGE_PAGES", parse_flag)? {
            config.use_large_pages = flag;
        }
        if let Some(flag) = parse_var(&lookup, "FGC_VMEM_UNCOMMIT", parse_flag)? {
            config.uncommit = flag;
        }
        if let Some(secs) =
            parse_var(&lookup, "FGC_VMEM_UNCOMMIT_DELAY_SECS", |v| v.parse::<u64>().ok())?
        {
            config.uncommit_delay = Duration::from_secs(secs);
        }

        Ok(config)
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value {
        "1" => Some(true),
        "0" => Some(false),
        v if v.eq_ignore_ascii_case("true") => Some(true),
        v if v.eq_ignore_ascii_case("false") => Some(false),
        _ => None,
    }
}

fn parse_var<F, T>(
    lookup: &F,
    name: &str,
    parse: impl Fn(&str) -> Option<T>,
) -> Result<Option<T>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        None => Ok(None),
        Some(value) => match parse(value.trim()) {
            Some(parsed) => Ok(Some(parsed)),
            None => Err(ConfigError::InvalidEnvironment(name.to_string(), value)),
        },
    }
}

/// Error types for configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid granule size: {0}")]
    InvalidGranuleSize(String),

    #[error("Invalid capacity: {0}")]
    InvalidCapacity(String),

    #[error("Invalid heap views: {0}")]
    InvalidHeapViews(String),

    #[error("Invalid virtual to physical ratio: {0}")]
    InvalidRatio(String),

    #[error("Invalid address offset bits: {0}")]
    InvalidOffsetBits(String),

    #[error("Invalid environment variable {0}={1:?}")]
    InvalidEnvironment(String, String),
}
