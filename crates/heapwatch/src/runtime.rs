//! Runtime - Wiring of heap, barrier and validator
//!
//! A `Runtime` owns one reference heap segment together with the barrier
//! tables that cover it, the byref validator that inspects it and the
//! safepoint used to stop mutators. Collection requests raised by the
//! validation queue come back here through the segment's collection hook.

use crate::barrier::{BarrierState, CardMarkingBarrier};
use crate::config::HeapWatchConfig;
use crate::error::{abort_on_fatal, FatalHandler, Result};
use crate::heap::HeapSegment;
use crate::logging::{configure_logger, LogLevel, WatchLoggerConfig};
use crate::object::TypeRegistry;
use crate::safepoint::Safepoint;
use crate::validation::SafepointValidator;
use std::sync::{Arc, Weak};

/// Runtime - process-facing aggregate
pub struct Runtime {
    config: HeapWatchConfig,
    segment: Arc<HeapSegment>,
    state: Arc<BarrierState>,
    barrier: CardMarkingBarrier,
    validator: SafepointValidator,
    safepoint: Safepoint,
}

impl Runtime {
    /// Create a runtime over a fresh segment of `heap_size` bytes
    pub fn new(
        config: HeapWatchConfig,
        heap_size: usize,
        types: Arc<TypeRegistry>,
    ) -> Result<Arc<Self>> {
        Self::with_fatal_handler(config, heap_size, types, abort_on_fatal)
    }

    /// Same as [`Runtime::new`] with a custom fatal handler
    pub fn with_fatal_handler(
        config: HeapWatchConfig,
        heap_size: usize,
        types: Arc<TypeRegistry>,
        fatal: FatalHandler,
    ) -> Result<Arc<Self>> {
        config.validate()?;

        if config.verbose {
            configure_logger(WatchLoggerConfig {
                level: LogLevel::Debug,
                console: true,
                ..Default::default()
            });
        }

        let segment = Arc::new(HeapSegment::new(heap_size, types)?);
        let state = Arc::new(BarrierState::new(&config, segment.base(), segment.end())?);
        let barrier = CardMarkingBarrier::new(Arc::clone(&state));
        let validator =
            SafepointValidator::new(segment.clone(), &config).with_fatal_handler(fatal);

        let runtime = Arc::new_cyclic(|weak: &Weak<Runtime>| {
            let weak = weak.clone();
            segment.set_collection_hook(Arc::new(move || {
                if let Some(runtime) = weak.upgrade() {
                    runtime.collect();
                }
            }));

            Runtime {
                config,
                segment,
                state,
                barrier,
                validator,
                safepoint: Safepoint::new(0),
            }
        });

        log::debug!(
            "heapwatch runtime over [{:#x}, {:#x})",
            runtime.segment.base(),
            runtime.segment.end()
        );

        Ok(runtime)
    }

    pub fn config(&self) -> &HeapWatchConfig {
        &self.config
    }

    pub fn segment(&self) -> &Arc<HeapSegment> {
        &self.segment
    }

    pub fn barrier_state(&self) -> &Arc<BarrierState> {
        &self.state
    }

    pub fn barrier(&self) -> &CardMarkingBarrier {
        &self.barrier
    }

    pub fn validator(&self) -> &SafepointValidator {
        &self.validator
    }

    /// Safepoint; `total_threads` counts mutators other than the thread
    /// that stops the world
    pub fn safepoint(&self) -> &Safepoint {
        &self.safepoint
    }

    /// Stop the world and run the validation pass
    ///
    /// Runs on the mutator whose enqueue crossed the validation limit. If
    /// another thread already stopped the world, this one parks at that
    /// safepoint instead and returns once the pass is over.
    pub fn collect(&self) {
        match self.safepoint.try_stop_the_world() {
            Some(stopped) => self.validator.drain(&stopped),
            None => {
                log::debug!("collection already in progress, parking");
                self.safepoint.poll();
            }
        }
    }

    /// Publish a new ephemeral range
    pub fn set_ephemeral_range(&self, low: usize, high: usize) -> Result<()> {
        let stopped = self.safepoint.stop_the_world();
        self.state.bounds().set_ephemeral_range(&stopped, low, high)
    }

    /// Clear cards over `[start, end)`
    pub fn clear_cards(&self, start: usize, end: usize) -> usize {
        let stopped = self.safepoint.stop_the_world();
        self.state.clear_cards(&stopped, start, end)
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("segment", &self.segment)
            .field("state", &self.state)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::barrier::WriteBarrier;
    use crate::object::{TypeInfo, WORD};
    use crate::validation::HeapInspector;

    #[test]
    fn test_backpressure_collection_drains_queue() {
        let config = HeapWatchConfig {
            max_byref_validation_entries: 2,
            ..Default::default()
        };
        let types = Arc::new(TypeRegistry::new());
        let node = types.register(TypeInfo::with_fields("App.Node", 2, &[0])).unwrap();
        let runtime = Runtime::new(config, 64 * 1024, types).unwrap();

        let obj = runtime.segment().allocate(node, 0).unwrap();
        let validator = runtime.validator();
        validator.validate_byref(obj.address() + WORD, None, 0);
        validator.validate_byref(obj.address() + WORD, None, 0);
        assert_eq!(validator.queue().len(), 2);

        validator.validate_byref(obj.address() + WORD, None, 0);
        assert_eq!(runtime.segment().collection_count(), 1);
        assert!(validator.queue().is_empty());
    }

    #[test]
    fn test_barrier_covers_segment() {
        let types = Arc::new(TypeRegistry::new());
        let node = types.register(TypeInfo::with_fields("App.Node", 2, &[0])).unwrap();
        let runtime = Runtime::new(HeapWatchConfig::default(), 64 * 1024, types).unwrap();

        let a = runtime.segment().allocate(node, 0).unwrap();
        let b = runtime.segment().allocate(node, 0).unwrap();
        unsafe {
            runtime
                .barrier()
                .write((a.address() + WORD) as *mut usize, b.address());
        }

        assert!(runtime.barrier_state().cards().is_dirty(a.address()));
        assert_eq!(runtime.clear_cards(runtime.segment().base(), runtime.segment().end()), 1);
        assert!(runtime.segment().is_heap_pointer(b.address()));
    }
}
