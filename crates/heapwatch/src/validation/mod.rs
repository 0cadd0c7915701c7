//! Validation Module - Heap corruption detection at interop boundaries
//!
//! Native code reached through interop can write through raw pointers into
//! the managed heap without any barrier. Two entry points catch the damage:
//!
//! - **Deferred** ([`ByrefValidationQueue::enqueue`]): a byref handed to
//!   native code is remembered and checked at the next safepoint by
//!   [`SafepointValidator::drain`]. Resolving the containing object races
//!   with allocation, so it cannot be done on the calling thread.
//! - **Immediate** ([`SafepointValidator::validate`]): a pinned object is
//!   checked right away.
//!
//! A failed check is terminal: the message names the interop method (or
//! `CALLI` when none is known) and the fatal handler runs.

pub mod object;
pub mod queue;
pub mod validator;

pub use object::{object_size, ObjectValidator, ValidateOptions};
pub use queue::{ByrefValidationEntry, ByrefValidationQueue};
pub use validator::SafepointValidator;

use crate::object::{MethodIdentity, ObjectRef, TypeRegistry, WORD};
use thiserror::Error;

/// HeapInspector - heap queries supplied by the collector
///
/// Implementations must only return objects whose header, method table
/// and length words are readable.
pub trait HeapInspector: Send + Sync {
    /// `addr` lies in memory owned by the heap and is safe to read
    fn is_heap_pointer(&self, addr: usize) -> bool;

    /// Object whose allocation contains `addr`
    ///
    /// Only sound while the world is stopped.
    fn containing_object(&self, addr: usize) -> Option<ObjectRef>;

    /// Object that follows `obj` in address order, if any
    fn next_object(&self, obj: ObjectRef) -> Option<ObjectRef>;

    /// End of the allocated part of the segment holding `obj`
    fn allocated_end(&self, obj: ObjectRef) -> Option<usize>;

    /// A background collection may be sweeping concurrently
    fn is_concurrent_gc_in_progress(&self) -> bool;

    /// Run (or schedule and wait for) a collection; called without locks held
    fn request_collection(&self);

    /// Number of sync block slots; valid indices are `1..capacity`
    fn sync_block_capacity(&self) -> usize;

    /// Registered method tables
    fn type_registry(&self) -> &TypeRegistry;
}

/// Why an object failed validation
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("null object")]
    NullObject,

    #[error("object {0:#x} is misaligned")]
    Misaligned(usize),

    #[error("object {0:#x} is outside the heap")]
    OutsideHeap(usize),

    #[error("object {0:#x} has a null method table")]
    NullMethodTable(usize),

    #[error("object {0:#x} is a free object")]
    FreeObject(usize),

    #[error("object {object:#x} has unknown method table {method_table:#x}")]
    UnknownMethodTable { object: usize, method_table: usize },

    #[error("object {object:#x} has invalid size {size:?}")]
    BadSize { object: usize, size: Option<usize> },

    #[error("object {object:#x} ends at {end:#x}, past allocated end {allocated_end:#x}")]
    ExtendsPastSegment {
        object: usize,
        end: usize,
        allocated_end: usize,
    },

    #[error("object {object:#x} has invalid reference {value:#x} at offset {offset:#x}")]
    BadReference {
        object: usize,
        offset: usize,
        value: usize,
    },

    #[error("object {object:#x} has invalid sync block index in header {header:#x}")]
    BadSyncBlock { object: usize, header: usize },
}

/// Method to blame for a call
///
/// With no explicit method, a delegate `this` names its invoke method.
pub fn resolve_interop_method(
    inspector: &dyn HeapInspector,
    this: usize,
    method: Option<MethodIdentity>,
) -> Option<MethodIdentity> {
    if method.is_some() || this == 0 {
        return method;
    }
    if this % WORD != 0 || !inspector.is_heap_pointer(this) {
        return None;
    }

    let this = ObjectRef::new(this)?;
    // SAFETY: heap pointers are readable and `this` is aligned.
    let mt = unsafe { this.load_method_table() };
    inspector
        .type_registry()
        .lookup(mt)
        .and_then(|info| info.invoke_method.clone())
}

/// Diagnostic naming the likely culprit
///
/// ```rust
/// use heapwatch::object::MethodIdentity;
/// use heapwatch::validation::format_validation_message;
///
/// let method = MethodIdentity::new("App.Native", "Fill");
/// assert_eq!(
///     format_validation_message(Some(&method)),
///     "Detected managed heap corruption, likely culprit is interop call through method 'App.Native.Fill'."
/// );
/// ```
pub fn format_validation_message(method: Option<&MethodIdentity>) -> String {
    const PREFIX: &str = "Detected managed heap corruption, likely culprit is interop call through ";
    match method {
        // Only CALLI has no method
        None => format!("{}CALLI.", PREFIX),
        Some(method) => format!("{}method '{}'.", PREFIX, method),
    }
}
