//! Configuration Module - Barrier and Validation Parameters
//!
//! Manages all configuration parameters for heapwatch.
//! Table granularity trades scan precision against table footprint;
//! the validation limit trades memory against forced collections.

use crate::barrier::BarrierKind;
use serde::{Deserialize, Serialize};

/// Main configuration for heapwatch
///
/// Most parameters have sensible defaults.
///
/// # Examples
///
/// ```rust
/// use heapwatch::{BarrierKind, HeapWatchConfig};
///
/// // Use default configuration
/// let config = HeapWatchConfig::default();
///
/// // Server-style barrier without an ephemeral filter
/// let config = HeapWatchConfig {
///     barrier_kind: BarrierKind::Server,
///     ..Default::default()
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeapWatchConfig {
    /// Bytes covered by one card table entry
    ///
    /// Must be a power of two.
    /// Default: 2KB
    pub card_size: usize,

    /// Bytes covered by one card bundle entry
    ///
    /// Must be a power of two and at least `card_size`.
    /// Default: 2MB
    pub card_bundle_size: usize,

    /// Bytes covered by one write watch entry
    ///
    /// Default: OS page size
    pub write_watch_page_size: usize,

    /// Barrier flavor installed at startup
    ///
    /// Default: `PostGrow`
    pub barrier_kind: BarrierKind,

    /// Maintain the card bundle table
    ///
    /// Requires the `card-bundles` feature.
    /// Default: true when compiled in
    pub card_bundles: bool,

    /// Maintain the write watch table
    ///
    /// Requires the `write-watch` feature.
    /// Default: true when compiled in
    pub write_watch: bool,

    /// Maintain the shadow heap
    ///
    /// Requires the `shadow-heap` feature.
    /// Default: true when compiled in
    pub shadow_heap: bool,

    /// Pending byref validations that force a collection when exceeded
    ///
    /// Default: 512K entries
    pub max_byref_validation_entries: usize,

    /// Extra method-table values tolerated in the header of the object that
    /// follows a validated object
    ///
    /// Null and the free-object method table are always tolerated.
    /// Default: empty
    pub transitional_headers: Vec<usize>,

    /// Enable verbose event logging
    ///
    /// Default: false
    pub verbose: bool,
}

impl Default for HeapWatchConfig {
    fn default() -> Self {
        HeapWatchConfig {
            // Tables
            card_size: DEFAULT_CARD_SIZE,
            card_bundle_size: DEFAULT_CARD_BUNDLE_SIZE,
            write_watch_page_size: page_size::get(),

            // Barrier
            barrier_kind: BarrierKind::PostGrow,
            card_bundles: cfg!(feature = "card-bundles"),
            write_watch: cfg!(feature = "write-watch"),
            shadow_heap: cfg!(feature = "shadow-heap"),

            // Validation
            max_byref_validation_entries: BYREF_VALIDATION_LIST_MAX_SIZE,
            transitional_headers: Vec::new(),

            // Debug
            verbose: false,
        }
    }
}

impl HeapWatchConfig {
    /// Validate configuration
    ///
    /// Checks that granularities are powers of two and that every enabled
    /// table was compiled in.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use heapwatch::HeapWatchConfig;
    ///
    /// let config = HeapWatchConfig {
    ///     card_size: 3000,  // Invalid!
    ///     ..Default::default()
    /// };
    ///
    /// assert!(config.validate().is_err());
    /// ```
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.card_size.is_power_of_two() || self.card_size < MIN_CARD_SIZE {
            return Err(ConfigError::InvalidCardSize(format!(
                "card_size must be a power of two >= {}, got {}",
                MIN_CARD_SIZE, self.card_size
            )));
        }

        if !self.card_bundle_size.is_power_of_two() || self.card_bundle_size < self.card_size {
            return Err(ConfigError::InvalidBundleSize(format!(
                "card_bundle_size must be a power of two >= card_size, got {}",
                self.card_bundle_size
            )));
        }

        if !self.write_watch_page_size.is_power_of_two()
            || self.write_watch_page_size < std::mem::size_of::<usize>()
        {
            return Err(ConfigError::InvalidPageSize(format!(
                "write_watch_page_size must be a power of two, got {}",
                self.write_watch_page_size
            )));
        }

        if self.max_byref_validation_entries == 0 {
            return Err(ConfigError::InvalidValidationLimit(
                "max_byref_validation_entries must be > 0".to_string(),
            ));
        }

        if self.card_bundles && !cfg!(feature = "card-bundles") {
            return Err(ConfigError::FeatureNotCompiled("card-bundles"));
        }

        if self.write_watch && !cfg!(feature = "write-watch") {
            return Err(ConfigError::FeatureNotCompiled("write-watch"));
        }

        if self.shadow_heap && !cfg!(feature = "shadow-heap") {
            return Err(ConfigError::FeatureNotCompiled("shadow-heap"));
        }

        Ok(())
    }

    /// Build configuration from environment variables
    ///
    /// Overrides defaults with environment variables:
    /// - HEAPWATCH_CARD_SIZE
    /// - HEAPWATCH_BUNDLE_SIZE
    /// - HEAPWATCH_BARRIER_KIND (`pregrow`, `postgrow`, `server`)
    /// - HEAPWATCH_CARD_BUNDLES
    /// - HEAPWATCH_WRITE_WATCH
    /// - HEAPWATCH_BYREF_MAX
    /// - HEAPWATCH_VERBOSE
    ///
    /// # Examples
    ///
    /// ```bash
    /// export HEAPWATCH_CARD_SIZE=512
    /// export HEAPWATCH_BARRIER_KIND=server
    /// export HEAPWATCH_VERBOSE=1
    /// ```
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("HEAPWATCH_CARD_SIZE") {
            if let Ok(size) = val.parse::<usize>() {
                config.card_size = size;
            }
        }

        if let Ok(val) = std::env::var("HEAPWATCH_BUNDLE_SIZE") {
            if let Ok(size) = val.parse::<usize>() {
                config.card_bundle_size = size;
            }
        }

        if let Ok(val) = std::env::var("HEAPWATCH_BARRIER_KIND") {
            if let Some(kind) = BarrierKind::from_name(&val) {
                config.barrier_kind = kind;
            }
        }

        if let Ok(val) = std::env::var("HEAPWATCH_CARD_BUNDLES") {
            config.card_bundles = parse_flag(&val);
        }

        if let Ok(val) = std::env::var("HEAPWATCH_WRITE_WATCH") {
            config.write_watch = parse_flag(&val);
        }

        if let Ok(val) = std::env::var("HEAPWATCH_BYREF_MAX") {
            if let Ok(max) = val.parse::<usize>() {
                config.max_byref_validation_entries = max;
            }
        }

        if let Ok(val) = std::env::var("HEAPWATCH_VERBOSE") {
            config.verbose = parse_flag(&val);
        }

        config
    }

    /// Log2 of `card_size`
    pub fn card_shift(&self) -> u32 {
        self.card_size.trailing_zeros()
    }

    /// Log2 of `card_bundle_size`
    pub fn card_bundle_shift(&self) -> u32 {
        self.card_bundle_size.trailing_zeros()
    }

    /// Log2 of `write_watch_page_size`
    pub fn write_watch_shift(&self) -> u32 {
        self.write_watch_page_size.trailing_zeros()
    }
}

/// Error types for configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid card size: {0}")]
    InvalidCardSize(String),

    #[error("Invalid card bundle size: {0}")]
    InvalidBundleSize(String),

    #[error("Invalid write watch page size: {0}")]
    InvalidPageSize(String),

    #[error("Invalid validation limit: {0}")]
    InvalidValidationLimit(String),

    #[error("Feature `{0}` is enabled in config but not compiled in")]
    FeatureNotCompiled(&'static str),
}

// ============================================================================
// CONSTANTS & HELPERS
// ============================================================================

const KB: usize = 1024;
const MB: usize = 1024 * 1024;

/// Default card span: 2KB
pub const DEFAULT_CARD_SIZE: usize = 2 * KB;

/// Default card bundle span: 2MB
pub const DEFAULT_CARD_BUNDLE_SIZE: usize = 2 * MB;

/// Smallest card span accepted
pub const MIN_CARD_SIZE: usize = 64;

/// Pending byref validations before a collection is forced
pub const BYREF_VALIDATION_LIST_MAX_SIZE: usize = 512 * KB;

fn parse_flag(val: &str) -> bool {
    val == "1" || val.eq_ignore_ascii_case("true")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = HeapWatchConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.card_size, 2048);
        assert_eq!(config.card_shift(), 11);
        assert_eq!(config.card_bundle_shift(), 21);
        assert_eq!(config.barrier_kind, BarrierKind::PostGrow);
    }

    #[test]
    fn test_invalid_card_size() {
        let config = HeapWatchConfig {
            card_size: 3000,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidCardSize(_))
        ));
    }

    #[test]
    fn test_bundle_smaller_than_card() {
        let config = HeapWatchConfig {
            card_size: 4096,
            card_bundle_size: 2048,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidBundleSize(_))
        ));
    }

    #[test]
    fn test_zero_validation_limit() {
        let config = HeapWatchConfig {
            max_byref_validation_entries: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[cfg(not(feature = "shadow-heap"))]
    #[test]
    fn test_shadow_heap_requires_feature() {
        let config = HeapWatchConfig {
            shadow_heap: true,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::FeatureNotCompiled("shadow-heap"))
        ));
    }

    #[test]
    fn test_config_serde_round_trip() {
        let config = HeapWatchConfig {
            barrier_kind: BarrierKind::Server,
            transitional_headers: vec![0xdead_0000],
            ..Default::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"barrier_kind\":\"server\""));
        let back: HeapWatchConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: HeapWatchConfig =
            serde_json::from_str(r#"{"barrier_kind": "pregrow", "card_size": 512}"#).unwrap();
        assert_eq!(config.barrier_kind, BarrierKind::PreGrow);
        assert_eq!(config.card_size, 512);
        assert_eq!(
            config.max_byref_validation_entries,
            BYREF_VALIDATION_LIST_MAX_SIZE
        );
    }
}
