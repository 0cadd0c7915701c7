//! Error Module - Heapwatch Error Types
//!
//! Defines all error types used in heapwatch.
//!
//! # Error Categories
//!
//! ## Setup Errors (recoverable, returned as `HeapWatchError`)
//! - `Configuration` - Invalid configuration
//! - `MemoryMapping` - Reserving table or heap memory failed
//! - `InvalidBounds` - Heap bounds update would break the ordering invariant
//! - `InvalidArgument` - Invalid function argument
//! - `OutOfMemory` - Reference heap segment exhausted
//!
//! ## Terminal Errors (`FatalError`)
//! - `CapacityOverflow` - Validation queue capacity cannot be represented
//! - `HeapCorruption` - Object validation failed at an interop boundary
//!
//! The write barrier itself has no error path.

use crate::config::ConfigError;
use crate::validation::ValidationError;
use thiserror::Error;

/// Main error type for recoverable heapwatch operations
///
/// # Examples
///
/// ```rust
/// use heapwatch::error::HeapWatchError;
///
/// fn handle_error(err: HeapWatchError) {
///     match err {
///         HeapWatchError::InvalidBounds { .. } => {
///             eprintln!("collector published inconsistent bounds: {}", err);
///         }
///         _ => {
///             eprintln!("Other error: {}", err);
///         }
///     }
/// }
/// ```
#[derive(Debug, Error)]
pub enum HeapWatchError {
    /// Configuration rejected by `HeapWatchConfig::validate`
    ///
    /// **When returned:** Building barrier state from an invalid config
    ///
    /// **Recovery strategy:** Fix the configuration
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),

    /// Memory mapping failed
    ///
    /// **When returned:** Anonymous mapping for a table, shadow heap or
    /// heap segment could not be created
    ///
    /// **Recovery strategy:** Retry with a smaller reservation or terminate
    #[error("Memory mapping failed: {0}")]
    MemoryMapping(String),

    /// Heap bounds violate `lowest <= ephemeral_low <= ephemeral_high <= highest`
    /// or leave the reserved range
    ///
    /// **When returned:** Collector publishes new bounds
    ///
    /// **Recovery strategy:** Cannot recover - indicates collector bug
    #[error(
        "Invalid heap bounds: lowest={lowest:#x} ephemeral=[{ephemeral_low:#x}, {ephemeral_high:#x}) highest={highest:#x}"
    )]
    InvalidBounds {
        lowest: usize,
        ephemeral_low: usize,
        ephemeral_high: usize,
        highest: usize,
    },

    /// Invalid argument
    ///
    /// **When returned:** Function argument fails validation
    ///
    /// **Example scenarios:**
    /// - Range outside the reserved heap range
    /// - Size not a power of two
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Reference heap segment exhausted
    ///
    /// **When returned:** Bump allocation in a `HeapSegment` does not fit
    ///
    /// **Recovery strategy:** Use a larger segment
    #[error("Out of memory: requested {requested} bytes, available {available} bytes")]
    OutOfMemory { requested: usize, available: usize },

    /// Unknown method table
    ///
    /// **When returned:** Allocating an object with an unregistered type
    #[error("Unknown method table: {0:#x}")]
    UnknownMethodTable(usize),

    /// Runtime used before initialization
    #[error("Runtime not initialized")]
    NotInitialized,
}

impl HeapWatchError {
    /// Check if this error is recoverable
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            HeapWatchError::OutOfMemory { .. } | HeapWatchError::MemoryMapping(_)
        )
    }

    /// Check if this error indicates a bug in the caller
    pub fn is_bug(&self) -> bool {
        matches!(
            self,
            HeapWatchError::InvalidBounds { .. } | HeapWatchError::NotInitialized
        )
    }
}

/// Result type alias for heapwatch operations
pub type Result<T> = std::result::Result<T, HeapWatchError>;

/// Terminal failure
///
/// Raised when continuing would be unsound. There is no conversion into
/// `HeapWatchError`; the only consumer is a [`FatalHandler`].
#[derive(Debug, Error)]
pub enum FatalError {
    /// Validation queue capacity cannot be represented
    #[error("Byref validation list capacity overflow while growing from {len} entries")]
    CapacityOverflow { len: usize },

    /// Managed heap corruption detected at an interop boundary
    #[error("{message}")]
    HeapCorruption {
        message: String,
        #[source]
        cause: ValidationError,
    },
}

/// Handler invoked on a [`FatalError`]; must not return
pub type FatalHandler = fn(&FatalError) -> !;

/// Default fatal handler: log and abort the process
pub fn abort_on_fatal(err: &FatalError) -> ! {
    log::error!("fatal error: {}", err);
    if let FatalError::HeapCorruption { cause, .. } = err {
        log::error!("validation failure: {}", cause);
    }
    crate::logging::log_event(crate::logging::WatchEvent::Fatal {
        message: err.to_string(),
    });
    std::process::abort()
}
