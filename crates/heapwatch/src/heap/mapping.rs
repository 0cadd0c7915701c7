//! Memory Mapping - Anonymous mappings via memmap2
//!
//! Every table, the shadow heap and the reference heap segment live in an
//! anonymous, zero-initialized mapping. Mutators and the collector touch
//! the memory concurrently, so it is exposed as atomic slices rather than
//! `&mut [u8]`.

use crate::error::{HeapWatchError, Result};
use memmap2::{MmapMut, MmapOptions};
use std::sync::atomic::{AtomicU8, AtomicUsize};

/// Round up to the OS page size
pub fn align_to_page(size: usize) -> usize {
    let page = page_size::get();
    size.max(1).div_ceil(page) * page
}

/// Anonymous read/write mapping
pub struct MemoryMapping {
    /// Keeps the mapping alive; accessed only through `base`
    _mmap: MmapMut,

    /// Base address
    base: usize,

    /// Size in bytes, page aligned
    size: usize,
}

impl MemoryMapping {
    /// Create a zero-filled anonymous mapping of at least `size` bytes
    pub fn anonymous(size: usize) -> Result<Self> {
        let aligned_size = align_to_page(size);

        let mut mmap = MmapOptions::new()
            .len(aligned_size)
            .map_anon()
            .map_err(|e| {
                HeapWatchError::MemoryMapping(format!(
                    "failed to map {} bytes: {}",
                    aligned_size, e
                ))
            })?;

        let base = mmap.as_mut_ptr() as usize;

        Ok(Self {
            _mmap: mmap,
            base,
            size: aligned_size,
        })
    }

    #[inline]
    pub fn base(&self) -> usize {
        self.base
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// One past the last mapped byte
    #[inline]
    pub fn end(&self) -> usize {
        self.base + self.size
    }

    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.base && addr < self.end()
    }

    /// View as bytes
    pub fn as_atomic_bytes(&self) -> &[AtomicU8] {
        // SAFETY: the mapping is live for `&self`, readable and writable,
        // and `AtomicU8` has the layout of `u8`.
        unsafe { std::slice::from_raw_parts(self.base as *const AtomicU8, self.size) }
    }

    /// View as machine words
    pub fn as_atomic_words(&self) -> &[AtomicUsize] {
        // SAFETY: page alignment satisfies `AtomicUsize` alignment and the
        // mapping is live for `&self`.
        unsafe {
            std::slice::from_raw_parts(
                self.base as *const AtomicUsize,
                self.size / std::mem::size_of::<usize>(),
            )
        }
    }
}

impl std::fmt::Debug for MemoryMapping {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryMapping")
            .field("base", &format_args!("{:#x}", self.base))
            .field("size", &self.size)
            .finish()
    }
}
