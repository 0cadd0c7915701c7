//! # Heapwatch - Write Barrier and Interop Heap Validation
//!
//! Heapwatch provides the mutator-side half of a generational collector's
//! old-to-young tracking, plus a debugging aid that catches managed heap
//! corruption introduced by native code reached through interop.
//!
//! ## Overview
//!
//! - **Card Marking**: Every reference store into the heap may dirty the card
//!   covering the written slot, so the collector can find old-to-young
//!   pointers without scanning the whole old generation
//! - **Card Bundles**: A coarse summary over the card table that lets the
//!   collector skip large clean stretches (`card-bundles` feature)
//! - **Write Watch**: Page-granularity dirty tracking for incremental and
//!   concurrent scanning (`write-watch` feature)
//! - **Shadow Heap**: A debug mirror of reference slots used to catch stores
//!   that bypass the barrier (`shadow-heap` and `barrier-check` features)
//! - **Byref Validation**: Pointers handed to native code are queued and
//!   their containing objects validated at the next safepoint
//!
//! ## Quick Start
//!
//! ```rust
//! use heapwatch::object::{TypeInfo, TypeRegistry};
//! use heapwatch::{HeapWatchConfig, WriteBarrier};
//! use std::sync::Arc;
//!
//! fn main() -> heapwatch::Result<()> {
//!     let types = Arc::new(TypeRegistry::new());
//!     let node = types.register(TypeInfo::with_fields("App.Node", 2, &[0]))?;
//!
//!     let runtime = heapwatch::init_with_config(HeapWatchConfig::default(), 64 * 1024, types)?;
//!     let parent = runtime.segment().allocate(node, 0)?;
//!     let child = runtime.segment().allocate(node, 0)?;
//!
//!     // Store `child` into the first field of `parent`
//!     unsafe {
//!         runtime
//!             .barrier()
//!             .write((parent.address() + 8) as *mut usize, child.address());
//!     }
//!     assert!(runtime.barrier_state().cards().is_dirty(parent.address()));
//!
//!     // Native code got a byref into `parent`; check it at the next safepoint
//!     runtime.validator().validate_byref(parent.address() + 8, None, 0);
//!     runtime.collect();
//!     assert!(runtime.validator().queue().is_empty());
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                    Mutator Threads                       │
//! │                                                          │
//! │   reference store            interop call                │
//! │         │                          │                     │
//! │         ▼                          ▼                     │
//! │  ┌──────────────┐        ┌───────────────────┐          │
//! │  │ WriteBarrier │        │ ByrefValidation-  │          │
//! │  │  (no locks)  │        │ Queue (append)    │          │
//! │  └──────┬───────┘        └─────────┬─────────┘          │
//! └─────────┼──────────────────────────┼────────────────────┘
//!           │ reads bounds once        │ over limit:
//!           ▼                          │ request_collection
//! ┌──────────────────────┐             │
//! │ HeapBounds           │             │
//! │ CardTable            │             │
//! │ CardBundleTable      │             │
//! │ WriteWatchTable      │             │
//! │ ShadowHeap           │             │
//! └──────────┬───────────┘             │
//!            │                         ▼
//! ┌──────────┼─────────────────────────────────────────────┐
//! │          ▼          Collector (world stopped)           │
//! │  clear cards, reset bundles,   SafepointValidator::drain│
//! │  harvest write watch,          validates every queued   │
//! │  publish new bounds            byref, then empties it   │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! ### Barrier Flavors
//!
//! | Kind | Card dirtied when |
//! |------|-------------------|
//! | `PreGrow` | value >= ephemeral_low |
//! | `PostGrow` | ephemeral_low <= value < ephemeral_high |
//! | `Server` | always |
//!
//! ## Safety
//!
//! The barrier entry points are `unsafe`: the destination must be a valid,
//! aligned reference slot. Collector-side table maintenance takes a
//! [`WorldStopped`] token, which can only be produced by
//! [`Safepoint::stop_the_world`] or by asserting it with
//! [`WorldStopped::assume`].
//!
//! ## Modules
//!
//! - [`barrier`]: Card, bundle and write watch tables and the write barrier
//! - [`config`]: Table granularities, barrier flavor and validation limit
//! - [`error`]: Recoverable errors and terminal failures
//! - [`heap`]: Heap bounds and the reference heap segment
//! - [`logging`]: Event logging
//! - [`object`]: Object layout and the method table registry
//! - [`runtime`]: Wiring of heap, barrier and validator
//! - [`safepoint`]: Safepoint coordination and the world-stopped token
//! - [`validation`]: Byref validation queue and object validator

// Core modules
pub mod config;
pub mod error;

// Heap model
pub mod heap;
pub mod object;

// Barrier and validation
pub mod barrier;
pub mod validation;

// Runtime and monitoring
pub mod logging;
pub mod runtime;
pub mod safepoint;

// Re-export main types for convenience
pub use barrier::{BarrierKind, BarrierState, CardMarkingBarrier, WriteBarrier};
pub use config::{ConfigError, HeapWatchConfig};
pub use error::{abort_on_fatal, FatalError, FatalHandler, HeapWatchError, Result};
pub use heap::{HeapBounds, HeapSegment};
pub use object::{MethodIdentity, ObjectRef, TypeInfo, TypeRegistry};
pub use runtime::Runtime;
pub use safepoint::{Safepoint, WorldStopped};
pub use validation::{ByrefValidationQueue, HeapInspector, SafepointValidator};

use std::sync::Arc;

/// Heapwatch version string from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize heapwatch with default configuration
///
/// Maps a heap segment of `heap_size` bytes, builds the barrier tables over
/// it and wires validation to it. Only the free object type is registered.
///
/// # Examples
///
/// ```rust
/// let runtime = heapwatch::init(1024 * 1024)?;
/// assert_eq!(runtime.segment().collection_count(), 0);
/// # Ok::<(), heapwatch::HeapWatchError>(())
/// ```
pub fn init(heap_size: usize) -> Result<Arc<Runtime>> {
    Runtime::new(
        HeapWatchConfig::default(),
        heap_size,
        Arc::new(TypeRegistry::new()),
    )
}

/// Initialize heapwatch with custom configuration and types
///
/// # Examples
///
/// ```rust
/// use heapwatch::{BarrierKind, HeapWatchConfig, TypeRegistry};
/// use std::sync::Arc;
///
/// let config = HeapWatchConfig {
///     barrier_kind: BarrierKind::Server,
///     max_byref_validation_entries: 1024,
///     ..Default::default()
/// };
///
/// let runtime = heapwatch::init_with_config(config, 1024 * 1024, Arc::new(TypeRegistry::new()))?;
/// assert_eq!(runtime.barrier_state().kind(), BarrierKind::Server);
/// # Ok::<(), heapwatch::HeapWatchError>(())
/// ```
pub fn init_with_config(
    config: HeapWatchConfig,
    heap_size: usize,
    types: Arc<TypeRegistry>,
) -> Result<Arc<Runtime>> {
    Runtime::new(config, heap_size, types)
}
