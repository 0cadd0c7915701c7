//! Object Model - Layout of managed objects
//!
//! Object Layout (64-bit words):
//! ┌─────────────────────────────────────────┐
//! │        Header Word (8 bytes)            │  <- obj - 8
//! │  - Bit 27: hash or sync block index     │
//! │  - Bit 26: value is a hash code         │
//! │  - Bits 0-25: sync block index          │
//! ├─────────────────────────────────────────┤
//! │     Method Table Pointer (8 bytes)      │  <- obj (object reference)
//! ├─────────────────────────────────────────┤
//! │  Length (8 bytes, array-like types)     │  <- obj + 8
//! ├─────────────────────────────────────────┤
//! │              Payload                    │
//! └─────────────────────────────────────────┘
//!
//! Object size = base_size + component_size * length, rounded up to 8 bytes.
//! `base_size` includes the header word.

pub mod registry;

pub use registry::{MethodTable, TypeInfo, TypeRegistry};

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Machine word size
pub const WORD: usize = std::mem::size_of::<usize>();

/// Size of the header word that precedes the method table pointer
pub const HEADER_SIZE: usize = WORD;

/// Object alignment (bytes)
pub const OBJECT_ALIGNMENT: usize = 8;

/// Smallest legal object: header, method table, one payload word
pub const MIN_OBJECT_SIZE: usize = 3 * WORD;

/// Header word is a hash code or a sync block index
pub const BIT_SBLK_IS_HASH_OR_SYNCBLKINDEX: usize = 0x0800_0000;

/// Header word holds a hash code
pub const BIT_SBLK_IS_HASHCODE: usize = 0x0400_0000;

/// Sync block index bits
pub const SYNCBLOCK_INDEX_MASK: usize = (1 << 26) - 1;

/// Round up to object alignment
#[inline]
pub fn align_object(size: usize) -> Option<usize> {
    size.checked_add(OBJECT_ALIGNMENT - 1)
        .map(|s| s & !(OBJECT_ALIGNMENT - 1))
}

/// Reference to a managed object (address of its method table word)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectRef(usize);

impl ObjectRef {
    /// Wrap an address; returns `None` for null
    pub fn new(address: usize) -> Option<Self> {
        if address == 0 {
            None
        } else {
            Some(Self(address))
        }
    }

    /// Object address
    #[inline]
    pub fn address(self) -> usize {
        self.0
    }

    /// Address of the first byte of the allocation (header word)
    #[inline]
    pub fn allocation_start(self) -> usize {
        self.0.wrapping_sub(HEADER_SIZE)
    }

    /// Load the method table word once
    ///
    /// # Safety
    /// The object address must be readable and word aligned.
    #[inline]
    pub unsafe fn load_method_table(self) -> usize {
        // SAFETY: caller guarantees the word is mapped and aligned.
        unsafe { AtomicUsize::from_ptr(self.0 as *mut usize).load(Ordering::Acquire) }
    }

    /// Load the header word
    ///
    /// # Safety
    /// The word before the object must be readable.
    #[inline]
    pub unsafe fn load_header(self) -> usize {
        // SAFETY: caller guarantees the word is mapped and aligned.
        unsafe { AtomicUsize::from_ptr(self.allocation_start() as *mut usize).load(Ordering::Acquire) }
    }

    /// Load the array length word
    ///
    /// # Safety
    /// The object must be array-like and readable.
    #[inline]
    pub unsafe fn load_length(self) -> usize {
        // SAFETY: caller guarantees the word is mapped and aligned.
        unsafe { AtomicUsize::from_ptr((self.0 + WORD) as *mut usize).load(Ordering::Relaxed) }
    }

    /// Load the word at `offset` from the object address
    ///
    /// # Safety
    /// `address + offset` must be readable and word aligned.
    #[inline]
    pub unsafe fn load_word(self, offset: usize) -> usize {
        // SAFETY: caller guarantees the word is mapped and aligned.
        unsafe { AtomicUsize::from_ptr((self.0 + offset) as *mut usize).load(Ordering::Relaxed) }
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Identity of a managed method, used to name interop call sites
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodIdentity {
    /// Fully qualified declaring type
    pub type_name: String,
    /// Method name
    pub method_name: String,
}

impl MethodIdentity {
    pub fn new(type_name: impl Into<String>, method_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            method_name: method_name.into(),
        }
    }

    /// Parse `Namespace.Type.Method`; the last segment is the method
    pub fn parse(qualified: &str) -> Self {
        match qualified.rsplit_once('.') {
            Some((ty, method)) => Self::new(ty, method),
            None => Self::new("", qualified),
        }
    }
}

impl fmt::Display for MethodIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.type_name.is_empty() {
            f.write_str(&self.method_name)
        } else {
            write!(f, "{}.{}", self.type_name, self.method_name)
        }
    }
}
