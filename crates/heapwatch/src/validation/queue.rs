//! Byref Validation Queue - Deferred validation requests
//!
//! Interop stubs append `(pointer, method)` pairs; the collector drains
//! them at the next safepoint. The lock is held only for the append and
//! is never held while a collection is requested.
//!
//! Backpressure: once more than `max_entries` requests are pending, the
//! enqueuing thread requests a collection before returning, so the queue
//! is drained instead of growing without bound.

use super::HeapInspector;
use crate::error::{abort_on_fatal, FatalError, FatalHandler};
use crate::logging::{log_event, WatchEvent};
use crate::object::MethodIdentity;
use crate::safepoint::WorldStopped;
use parking_lot::{Mutex, MutexGuard};
use std::sync::Arc;

/// One pending validation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ByrefValidationEntry {
    /// Byref handed to native code
    pub pointer: usize,
    /// Interop method, `None` for CALLI
    pub method: Option<MethodIdentity>,
}

/// ByrefValidationQueue - growable list guarded on append
pub struct ByrefValidationQueue {
    entries: Mutex<Vec<ByrefValidationEntry>>,
    max_entries: usize,
    inspector: Arc<dyn HeapInspector>,
    fatal: FatalHandler,
}

impl ByrefValidationQueue {
    pub fn new(inspector: Arc<dyn HeapInspector>, max_entries: usize) -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            max_entries,
            inspector,
            fatal: abort_on_fatal,
        }
    }

    /// Replace the handler run on capacity overflow
    pub fn with_fatal_handler(mut self, fatal: FatalHandler) -> Self {
        self.fatal = fatal;
        self
    }

    /// Remember `pointer` for validation at the next safepoint
    ///
    /// Pointers outside the heap are ignored.
    pub fn enqueue(&self, pointer: usize, method: Option<MethodIdentity>) {
        if !self.inspector.is_heap_pointer(pointer) {
            return;
        }

        let pending = {
            let mut entries = self.entries.lock();
            if entries.len() == entries.capacity() {
                if let Err(len) = grow(&mut entries) {
                    drop(entries);
                    (self.fatal)(&FatalError::CapacityOverflow { len });
                }
            }
            entries.push(ByrefValidationEntry { pointer, method });
            entries.len()
        };

        if pending > self.max_entries {
            log::warn!(
                "{} pending byref validations exceed limit {}, forcing collection",
                pending,
                self.max_entries
            );
            log_event(WatchEvent::BackpressureCollection {
                pending,
                limit: self.max_entries,
            });
            self.inspector.request_collection();
        }
    }

    /// Visit every pending entry in enqueue order, then empty the queue
    ///
    /// The queue is emptied even if `visit` unwinds.
    pub fn drain_with(
        &self,
        _stopped: &WorldStopped<'_>,
        mut visit: impl FnMut(&ByrefValidationEntry),
    ) -> usize {
        let entries = ClearOnDrop(self.entries.lock());
        for entry in entries.0.iter() {
            visit(entry);
        }
        entries.0.len()
    }

    /// Pending entries
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Allocated slots; never shrinks
    pub fn capacity(&self) -> usize {
        self.entries.lock().capacity()
    }

    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    /// Copy of the pending entries
    pub fn snapshot(&self) -> Vec<ByrefValidationEntry> {
        self.entries.lock().clone()
    }
}

impl std::fmt::Debug for ByrefValidationQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ByrefValidationQueue")
            .field("len", &self.len())
            .field("max_entries", &self.max_entries)
            .finish()
    }
}

/// Next capacity: `len * 2 + 1`
pub(crate) fn grown_capacity(len: usize) -> Option<usize> {
    len.checked_mul(2)?.checked_add(1)
}

/// Grow a full queue; returns the current length on failure
fn grow(entries: &mut Vec<ByrefValidationEntry>) -> Result<(), usize> {
    let len = entries.len();
    let capacity = grown_capacity(len).ok_or(len)?;
    entries.try_reserve_exact(capacity - len).map_err(|_| len)
}

struct ClearOnDrop<'a>(MutexGuard<'a, Vec<ByrefValidationEntry>>);

impl Drop for ClearOnDrop<'_> {
    fn drop(&mut self) {
        self.0.clear();
    }
}
