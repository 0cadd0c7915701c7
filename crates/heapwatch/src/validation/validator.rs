//! Safepoint Validator - Drains the byref queue and validates objects
//!
//! For each queued byref, in enqueue order:
//! 1. Resolve the containing object
//! 2. Validate it deeply, including its sync block
//! 3. Validate the object that follows it, unless that object's method
//!    table word is null, the free marker or a configured transitional
//!    value. The word is read once: a background sweep may be flipping
//!    it between free and live while we look.
//!
//! Any failure is fatal. The queue is empty after every pass.

use super::object::{object_size, ObjectValidator, ValidateOptions};
use super::queue::{ByrefValidationEntry, ByrefValidationQueue};
use super::{format_validation_message, resolve_interop_method, HeapInspector, ValidationError};
use crate::config::HeapWatchConfig;
use crate::error::{abort_on_fatal, FatalError, FatalHandler};
use crate::logging::{log_event, WatchEvent};
use crate::object::{MethodIdentity, ObjectRef};
use crate::safepoint::WorldStopped;
use std::sync::Arc;
use std::time::Instant;

const PRIMARY: ValidateOptions = ValidateOptions {
    deep: true,
    verify_sync_block: true,
};

// The next object may be dead, and a dead object's sync block may already
// have been released.
const FOLLOWING: ValidateOptions = ValidateOptions {
    deep: true,
    verify_sync_block: false,
};

/// SafepointValidator - deferred and immediate object validation
///
/// # Examples
///
/// ```rust
/// use heapwatch::heap::HeapSegment;
/// use heapwatch::object::{TypeInfo, TypeRegistry};
/// use heapwatch::safepoint::Safepoint;
/// use heapwatch::{HeapWatchConfig, SafepointValidator};
/// use std::sync::Arc;
///
/// let types = Arc::new(TypeRegistry::new());
/// let node = types.register(TypeInfo::with_fields("App.Node", 2, &[0])).unwrap();
/// let segment = Arc::new(HeapSegment::new(64 * 1024, types).unwrap());
/// let validator = SafepointValidator::new(segment.clone(), &HeapWatchConfig::default());
///
/// let obj = segment.allocate(node, 0).unwrap();
/// validator.validate_byref(obj.address() + 8, None, 0);
/// assert_eq!(validator.queue().len(), 1);
///
/// let safepoint = Safepoint::new(0);
/// validator.drain(&safepoint.stop_the_world());
/// assert!(validator.queue().is_empty());
/// ```
pub struct SafepointValidator {
    inspector: Arc<dyn HeapInspector>,
    queue: ByrefValidationQueue,
    transitional_headers: Vec<usize>,
    fatal: FatalHandler,
}

impl SafepointValidator {
    pub fn new(inspector: Arc<dyn HeapInspector>, config: &HeapWatchConfig) -> Self {
        let queue =
            ByrefValidationQueue::new(Arc::clone(&inspector), config.max_byref_validation_entries);
        Self {
            inspector,
            queue,
            transitional_headers: config.transitional_headers.clone(),
            fatal: abort_on_fatal,
        }
    }

    /// Replace the handler run on corruption or queue overflow
    pub fn with_fatal_handler(mut self, fatal: FatalHandler) -> Self {
        self.queue = self.queue.with_fatal_handler(fatal);
        self.fatal = fatal;
        self
    }

    pub fn queue(&self) -> &ByrefValidationQueue {
        &self.queue
    }

    pub fn inspector(&self) -> &Arc<dyn HeapInspector> {
        &self.inspector
    }

    /// Queue a byref handed to native code
    ///
    /// `this` is the delegate object for delegate calls, 0 otherwise.
    pub fn validate_byref(&self, pointer: usize, method: Option<MethodIdentity>, this: usize) {
        if !self.inspector.is_heap_pointer(pointer) {
            return;
        }
        let method = resolve_interop_method(self.inspector.as_ref(), this, method);
        self.queue.enqueue(pointer, method);
    }

    /// Validate every queued byref
    ///
    /// Runs the fatal handler on the first failure. The queue is empty
    /// afterwards either way.
    pub fn drain(&self, stopped: &WorldStopped<'_>) {
        let started = Instant::now();

        let entries = self.queue.drain_with(stopped, |entry| {
            if let Err(cause) = self.validate_entry(entry) {
                self.fail(cause, entry.pointer, entry.method.as_ref());
            }
        });

        if entries > 0 {
            let duration_us = started.elapsed().as_micros() as u64;
            log::info!("validated {} byrefs in {} us", entries, duration_us);
            log_event(WatchEvent::ValidationPass {
                entries,
                duration_us,
            });
        }
    }

    /// Validate a pinned object now
    ///
    /// The following object is skipped while a background collection runs,
    /// since its sweep may turn a dead neighbour into free space under us.
    pub fn validate(&self, object: usize, method: Option<MethodIdentity>, this: usize) {
        if object == 0 {
            return;
        }

        let check_next = !self.inspector.is_concurrent_gc_in_progress();
        if let Err(cause) = self.validate_object(object, check_next) {
            let method = resolve_interop_method(self.inspector.as_ref(), this, method);
            self.fail(cause, object, method.as_ref());
        }
    }

    /// Trace an object pinned for an interop call
    pub fn log_pinned_argument(&self, target: Option<&MethodIdentity>, object: usize) {
        if object == 0 {
            return;
        }
        let size = object_size(self.inspector.as_ref(), object).unwrap_or(0);

        let method = target.map(|m| m.to_string());
        match &method {
            Some(method) => log::trace!(
                "managed object {:#x} with size {:#x} pinned for interop to method {}",
                object,
                size,
                method
            ),
            None => log::trace!(
                "managed object {:#x} pinned for interop with size {:#x}",
                object,
                size
            ),
        }
        log_event(WatchEvent::PinnedArgument {
            object,
            size,
            method,
        });
    }

    /// A byref with no containing object (such as one past the end of the
    /// newest allocation) has nothing to validate
    fn validate_entry(&self, entry: &ByrefValidationEntry) -> Result<(), ValidationError> {
        match self.inspector.containing_object(entry.pointer) {
            Some(obj) => self.validate_object(obj.address(), true),
            None => {
                log::trace!("byref {:#x} has no containing object", entry.pointer);
                Ok(())
            }
        }
    }

    fn validate_object(&self, object: usize, check_next: bool) -> Result<(), ValidationError> {
        let validator = ObjectValidator::new(self.inspector.as_ref());
        validator.validate(object, PRIMARY)?;

        if !check_next {
            return Ok(());
        }

        let Some(obj) = ObjectRef::new(object) else {
            return Ok(());
        };
        if let Some(next) = self.inspector.next_object(obj) {
            // SAFETY: the inspector only returns objects with readable headers.
            let mt = unsafe { next.load_method_table() };
            if !self.is_transitional(mt) {
                validator.validate_with_method_table(next, mt, FOLLOWING)?;
            }
        }
        Ok(())
    }

    /// Method table values a sweeping collector may leave in the next object
    fn is_transitional(&self, mt: usize) -> bool {
        mt == 0
            || self.inspector.type_registry().is_free(mt)
            || self.transitional_headers.contains(&mt)
    }

    fn fail(&self, cause: ValidationError, pointer: usize, method: Option<&MethodIdentity>) -> ! {
        let message = format_validation_message(method);
        let culprit = method.map_or_else(|| "CALLI".to_string(), |m| m.to_string());

        log::error!("{} ({})", message, cause);
        log_event(WatchEvent::CorruptionDetected { pointer, culprit });

        (self.fatal)(&FatalError::HeapCorruption { message, cause })
    }
}

impl std::fmt::Debug for SafepointValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SafepointValidator")
            .field("queue", &self.queue)
            .field("transitional_headers", &self.transitional_headers)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::HeapSegment;
    use crate::object::{TypeInfo, TypeRegistry, WORD};

    fn panic_on_fatal(err: &FatalError) -> ! {
        panic!("{}", err)
    }

    fn setup() -> (Arc<HeapSegment>, SafepointValidator, crate::object::MethodTable) {
        let types = Arc::new(TypeRegistry::new());
        let node = types
            .register(TypeInfo::with_fields("App.Node", 2, &[0]))
            .unwrap();
        let seg = Arc::new(HeapSegment::new(64 * 1024, types).unwrap());
        let validator = SafepointValidator::new(seg.clone(), &HeapWatchConfig::default())
            .with_fatal_handler(panic_on_fatal);
        (seg, validator, node)
    }

    #[test]
    fn test_drain_valid_heap() {
        let (seg, validator, node) = setup();
        let a = seg.allocate(node, 0).unwrap();
        let b = seg.allocate(node, 0).unwrap();
        seg.write_word(a.address() + WORD, b.address()).unwrap();

        validator.validate_byref(a.address() + WORD, None, 0);
        validator.validate_byref(b.address() + 2 * WORD, None, 0);
        validator.drain(&unsafe { WorldStopped::assume() });
        assert!(validator.queue().is_empty());
    }

    #[test]
    fn test_immediate_null_is_ignored() {
        let (_seg, validator, _) = setup();
        validator.validate(0, None, 0);
    }

    #[test]
    fn test_transitional_values() {
        let (seg, validator, _) = setup();
        assert!(validator.is_transitional(0));
        assert!(validator.is_transitional(seg.types().free_method_table().address()));
        assert!(!validator.is_transitional(0xbad0));
    }

    #[test]
    fn test_immediate_corruption_is_fatal() {
        let (seg, validator, node) = setup();
        let a = seg.allocate(node, 0).unwrap();
        seg.write_word(a.address(), 0xbad0).unwrap();

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            validator.validate(a.address(), Some(MethodIdentity::new("App.Native", "Poke")), 0);
        }));
        let payload = result.unwrap_err();
        let message = payload.downcast_ref::<String>().unwrap();
        assert_eq!(
            message,
            "Detected managed heap corruption, likely culprit is interop call through method 'App.Native.Poke'."
        );
    }
}
