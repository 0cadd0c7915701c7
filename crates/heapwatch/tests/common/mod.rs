//! Test Utilities for the Heapwatch Test Suite
//!
//! Fixtures build a real runtime over a mapped segment so every test runs
//! the same barrier tables and validator that production code does.
//!
//! ============================================================================
//! Fatal handlers panic here instead of aborting so tests can observe them.
//! ============================================================================

#![allow(dead_code)]

use heapwatch::object::{MethodIdentity, MethodTable, TypeInfo, TypeRegistry};
use heapwatch::safepoint::WorldStopped;
use heapwatch::{FatalError, HeapWatchConfig, Runtime};
use std::sync::Arc;

/// Default segment size for tests (256KB)
pub const DEFAULT_HEAP_SIZE: usize = 256 * 1024;

/// Bytes per reference slot
pub const WORD: usize = std::mem::size_of::<usize>();

/// Fatal handler that unwinds with the error message
pub fn panic_on_fatal(err: &FatalError) -> ! {
    panic!("{}", err)
}

/// Proof token for single-threaded tests
pub fn stopped() -> WorldStopped<'static> {
    // SAFETY: integration tests drive mutator and collector from one thread.
    unsafe { WorldStopped::assume() }
}

/// ============================================================================
/// RUNTIME FIXTURE
/// ============================================================================

/// Test fixture holding a runtime and its registered types
pub struct WatchFixture {
    pub runtime: Arc<Runtime>,
    pub types: Arc<TypeRegistry>,

    /// Two reference fields, the first at offset `WORD`
    pub node: MethodTable,

    /// Array of references
    pub refs: MethodTable,

    /// Array of bytes
    pub bytes: MethodTable,

    /// Delegate whose invoke method is `App.Callback.Invoke`
    pub callback: MethodTable,
}

impl WatchFixture {
    /// Create fixture with default configuration
    ///
    /// **Bug this finds:** Configuration validation bugs, table setup failures
    pub fn with_defaults() -> Self {
        Self::with_config(HeapWatchConfig::default())
    }

    /// Create fixture with custom configuration
    ///
    /// **Bug this finds:** Table granularity bugs, limit handling
    pub fn with_config(config: HeapWatchConfig) -> Self {
        let types = Arc::new(TypeRegistry::new());
        let node = types
            .register(TypeInfo::with_fields("App.Node", 2, &[0, 1]))
            .expect("node type should register");
        let refs = types
            .register(TypeInfo::reference_array("System.Object[]"))
            .expect("reference array type should register");
        let bytes = types
            .register(TypeInfo::array("System.Byte[]", 1))
            .expect("byte array type should register");
        let callback = types
            .register(
                TypeInfo::with_fields("App.Callback", 2, &[0])
                    .delegate(MethodIdentity::new("App.Callback", "Invoke")),
            )
            .expect("delegate type should register");

        let runtime = Runtime::with_fatal_handler(
            config,
            DEFAULT_HEAP_SIZE,
            Arc::clone(&types),
            panic_on_fatal,
        )
        .expect("runtime initialization should succeed with valid config");
        runtime.segment().set_sync_block_capacity(64);

        Self {
            runtime,
            types,
            node,
            refs,
            bytes,
            callback,
        }
    }

    /// Segment base address
    pub fn base(&self) -> usize {
        self.runtime.segment().base()
    }

    /// Allocate a node
    pub fn node(&self) -> usize {
        self.runtime
            .segment()
            .allocate(self.node, 0)
            .expect("segment should have room")
            .address()
    }

    /// Allocate a reference array of `len` elements
    pub fn reference_array(&self, len: usize) -> usize {
        self.runtime
            .segment()
            .allocate(self.refs, len)
            .expect("segment should have room")
            .address()
    }

    /// Allocate a byte array of `len` elements
    pub fn byte_array(&self, len: usize) -> usize {
        self.runtime
            .segment()
            .allocate(self.bytes, len)
            .expect("segment should have room")
            .address()
    }

    /// Allocate a delegate instance
    pub fn delegate(&self) -> usize {
        self.runtime
            .segment()
            .allocate(self.callback, 0)
            .expect("segment should have room")
            .address()
    }

    /// Set a reference field without going through the barrier
    pub fn poke(&self, addr: usize, value: usize) {
        self.runtime
            .segment()
            .write_word(addr, value)
            .expect("address should be an allocated word");
    }

    /// Read an allocated word
    pub fn peek(&self, addr: usize) -> usize {
        self.runtime
            .segment()
            .read_word(addr)
            .expect("address should be an allocated word")
    }

    /// Run `f` and return the fatal message it raised
    ///
    /// **Bug this finds:** Corruption that goes unreported
    pub fn expect_fatal(&self, f: impl FnOnce()) -> String {
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(f));
        let payload = result.expect_err("fatal handler should have run");
        match payload.downcast::<String>() {
            Ok(message) => *message,
            Err(payload) => payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .unwrap_or_default(),
        }
    }
}
