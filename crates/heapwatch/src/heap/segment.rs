//! Heap Segment - Bump-allocated reference heap
//!
//! A single contiguous segment that lays out objects exactly as the
//! collector would, so the barrier and the validator can be driven end to
//! end. It never collects; `request_collection` only counts requests and
//! runs an optional hook.
//!
//! ```text
//! base                                   top                    end
//!  ├─ obj ─┼─ obj ─┼─ free ─┼─ obj ─┤     │                      │
//!  └──────────── allocated ─────────┘     └──── unallocated ─────┘
//! ```

use super::mapping::MemoryMapping;
use crate::error::{HeapWatchError, Result};
use crate::object::{
    MethodTable, ObjectRef, TypeRegistry, HEADER_SIZE, MIN_OBJECT_SIZE, WORD,
};
use crate::validation::HeapInspector;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Callback run when a collection is requested
pub type CollectionHook = Arc<dyn Fn() + Send + Sync>;

/// HeapSegment - reference implementation of [`HeapInspector`]
pub struct HeapSegment {
    mapping: MemoryMapping,

    /// Next allocation address
    top: AtomicUsize,

    types: Arc<TypeRegistry>,

    /// Highest valid sync block index plus one
    sync_block_capacity: AtomicUsize,

    concurrent_gc: AtomicBool,

    collections: AtomicUsize,

    collection_hook: Mutex<Option<CollectionHook>>,
}

impl HeapSegment {
    /// Map a segment of at least `capacity` bytes
    pub fn new(capacity: usize, types: Arc<TypeRegistry>) -> Result<Self> {
        let mapping = MemoryMapping::anonymous(capacity)?;
        let top = AtomicUsize::new(mapping.base());

        Ok(Self {
            mapping,
            top,
            types,
            sync_block_capacity: AtomicUsize::new(0),
            concurrent_gc: AtomicBool::new(false),
            collections: AtomicUsize::new(0),
            collection_hook: Mutex::new(None),
        })
    }

    /// First byte of the segment
    #[inline]
    pub fn base(&self) -> usize {
        self.mapping.base()
    }

    /// One past the last reserved byte
    #[inline]
    pub fn end(&self) -> usize {
        self.mapping.end()
    }

    /// One past the last allocated byte
    #[inline]
    pub fn top(&self) -> usize {
        self.top.load(Ordering::Acquire)
    }

    pub fn types(&self) -> &Arc<TypeRegistry> {
        &self.types
    }

    /// Allocate an object; `length` is ignored for non-array types
    pub fn allocate(&self, mt: MethodTable, length: usize) -> Result<ObjectRef> {
        let info = self
            .types
            .lookup(mt.address())
            .ok_or(HeapWatchError::UnknownMethodTable(mt.address()))?;
        let length = if info.is_array() { length } else { 0 };
        let size = info
            .object_size(length)
            .ok_or(HeapWatchError::OutOfMemory {
                requested: usize::MAX,
                available: self.end() - self.top(),
            })?;

        let start = self.bump(size)?;
        let obj = ObjectRef::new(start + HEADER_SIZE)
            .ok_or_else(|| HeapWatchError::MemoryMapping("null segment".to_string()))?;

        if info.is_array() {
            self.store(obj.address() + WORD, length, Ordering::Relaxed);
        }
        self.store(obj.address(), mt.address(), Ordering::Release);
        Ok(obj)
    }

    fn bump(&self, size: usize) -> Result<usize> {
        let end = self.end();
        self.top
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |top| {
                top.checked_add(size).filter(|&new_top| new_top <= end)
            })
            .map_err(|top| HeapWatchError::OutOfMemory {
                requested: size,
                available: end - top,
            })
    }

    /// Turn a live object into a free object of the same size
    pub fn make_free(&self, obj: ObjectRef) -> Result<()> {
        let size = self
            .object_size(obj)
            .ok_or(HeapWatchError::UnknownMethodTable(self.method_table_of(obj)))?;
        self.store(obj.address() + WORD, size - MIN_OBJECT_SIZE, Ordering::Relaxed);
        self.store(
            obj.address(),
            self.types.free_method_table().address(),
            Ordering::Release,
        );
        Ok(())
    }

    /// Overwrite any allocated word
    ///
    /// Stands in for native code writing through a raw pointer, so no
    /// barrier is applied.
    pub fn write_word(&self, addr: usize, value: usize) -> Result<()> {
        if !self.is_allocated_word(addr) {
            return Err(HeapWatchError::InvalidArgument(format!(
                "{:#x} is not an allocated word",
                addr
            )));
        }
        self.store(addr, value, Ordering::Release);
        Ok(())
    }

    /// Read any allocated word
    pub fn read_word(&self, addr: usize) -> Option<usize> {
        if !self.is_allocated_word(addr) {
            return None;
        }
        // SAFETY: checked mapped and aligned above.
        Some(unsafe { ObjectRef::new(addr)?.load_word(0) })
    }

    /// Set an object's header word
    pub fn set_header(&self, obj: ObjectRef, header: usize) -> Result<()> {
        self.write_word(obj.allocation_start(), header)
    }

    pub fn set_sync_block_capacity(&self, capacity: usize) {
        self.sync_block_capacity.store(capacity, Ordering::Release);
    }

    /// Mark a background collection as running or finished
    pub fn set_concurrent_gc(&self, in_progress: bool) {
        self.concurrent_gc.store(in_progress, Ordering::Release);
    }

    /// Collections requested so far
    pub fn collection_count(&self) -> usize {
        self.collections.load(Ordering::Acquire)
    }

    /// Run `hook` on every collection request
    pub fn set_collection_hook(&self, hook: CollectionHook) {
        *self.collection_hook.lock() = Some(hook);
    }

    fn is_allocated_word(&self, addr: usize) -> bool {
        addr >= self.base() && addr + WORD <= self.top() && addr % WORD == 0
    }

    fn store(&self, addr: usize, value: usize, order: Ordering) {
        debug_assert!(self.mapping.contains(addr));
        // SAFETY: callers pass addresses inside the mapping, word aligned.
        unsafe { AtomicUsize::from_ptr(addr as *mut usize).store(value, order) }
    }

    fn method_table_of(&self, obj: ObjectRef) -> usize {
        self.read_word(obj.address()).unwrap_or(0)
    }

    /// Size of a well-formed allocated object
    fn object_size(&self, obj: ObjectRef) -> Option<usize> {
        if !self.is_allocated_word(obj.allocation_start())
            || !self.is_allocated_word(obj.address() + WORD)
        {
            return None;
        }
        let info = self.types.lookup(self.read_word(obj.address())?)?;
        let length = if info.is_array() {
            self.read_word(obj.address() + WORD)?
        } else {
            0
        };
        info.object_size(length)
    }
}

impl HeapInspector for HeapSegment {
    fn is_heap_pointer(&self, addr: usize) -> bool {
        self.mapping.contains(addr)
    }

    fn containing_object(&self, addr: usize) -> Option<ObjectRef> {
        let top = self.top();
        if addr < self.base() || addr >= top {
            return None;
        }

        let mut cur = self.base();
        while cur < top {
            let obj = ObjectRef::new(cur + HEADER_SIZE)?;
            match self.object_size(obj) {
                Some(size) if cur + size <= addr => cur += size,
                // Contains `addr`, or cannot be sized and so cannot be skipped
                _ => return Some(obj),
            }
        }
        None
    }

    fn next_object(&self, obj: ObjectRef) -> Option<ObjectRef> {
        let next = obj.allocation_start().checked_add(self.object_size(obj)?)?;
        if next + MIN_OBJECT_SIZE > self.top() {
            return None;
        }
        ObjectRef::new(next + HEADER_SIZE)
    }

    fn allocated_end(&self, obj: ObjectRef) -> Option<usize> {
        if obj.address() >= self.base() && obj.address() < self.top() {
            Some(self.top())
        } else {
            None
        }
    }

    fn is_concurrent_gc_in_progress(&self) -> bool {
        self.concurrent_gc.load(Ordering::Acquire)
    }

    fn request_collection(&self) {
        self.collections.fetch_add(1, Ordering::AcqRel);
        let hook = self.collection_hook.lock().clone();
        if let Some(hook) = hook {
            hook();
        }
    }

    fn sync_block_capacity(&self) -> usize {
        self.sync_block_capacity.load(Ordering::Acquire)
    }

    fn type_registry(&self) -> &TypeRegistry {
        &self.types
    }
}

impl std::fmt::Debug for HeapSegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeapSegment")
            .field("base", &format_args!("{:#x}", self.base()))
            .field("top", &format_args!("{:#x}", self.top()))
            .field("end", &format_args!("{:#x}", self.end()))
            .finish()
    }
}
