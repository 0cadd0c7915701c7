//! Byte Map - One byte per fixed-size address granule
//!
//! Shared backing for the card, card bundle and write watch tables.
//! Entry `i` covers `[origin + (i << shift), origin + ((i + 1) << shift))`.
//! Entries are one-way flags for mutators: the barrier only ever sets them,
//! and only the collector clears them.

use crate::error::{HeapWatchError, Result};
use crate::heap::MemoryMapping;
use std::ops::Range;
use std::sync::atomic::{AtomicU8, Ordering};

pub struct ByteMap {
    mapping: MemoryMapping,
    origin: usize,
    limit: usize,
    shift: u32,
    entries: usize,
}

impl ByteMap {
    /// Map covering `[origin, limit)` with `1 << shift` bytes per entry
    pub fn new(origin: usize, limit: usize, shift: u32) -> Result<Self> {
        if origin >= limit || shift >= usize::BITS {
            return Err(HeapWatchError::InvalidArgument(format!(
                "cannot cover [{:#x}, {:#x}) with shift {}",
                origin, limit, shift
            )));
        }

        let granule = 1usize << shift;
        let entries = (limit - origin).div_ceil(granule);
        let mapping = MemoryMapping::anonymous(entries)?;

        Ok(Self {
            mapping,
            origin,
            limit,
            shift,
            entries,
        })
    }

    #[inline(always)]
    fn bytes(&self) -> &[AtomicU8] {
        &self.mapping.as_atomic_bytes()[..self.entries]
    }

    /// Entry index for an address inside the covered range
    #[inline(always)]
    pub fn index_of(&self, addr: usize) -> usize {
        (addr - self.origin) >> self.shift
    }

    /// First address covered by an entry
    #[inline]
    pub fn entry_start(&self, index: usize) -> usize {
        self.origin + (index << self.shift)
    }

    #[inline]
    pub fn covers(&self, addr: usize) -> bool {
        addr >= self.origin && addr < self.limit
    }

    /// Entries overlapping `[start, end)`, clamped to the covered range
    pub fn index_range(&self, start: usize, end: usize) -> Range<usize> {
        let start = start.max(self.origin);
        let end = end.min(self.limit);
        if start >= end {
            return 0..0;
        }
        let granule = 1usize << self.shift;
        let first = (start - self.origin) >> self.shift;
        let last = (end - self.origin).div_ceil(granule);
        first..last
    }

    #[inline(always)]
    pub fn get(&self, index: usize) -> u8 {
        self.bytes()[index].load(Ordering::Acquire)
    }

    /// Store `value` unless the entry already holds it
    ///
    /// Every writer stores the same sentinel, so racing writers agree and
    /// no read-modify-write is needed.
    #[inline(always)]
    pub fn set(&self, index: usize, value: u8) {
        let entry = &self.bytes()[index];
        if entry.load(Ordering::Relaxed) != value {
            entry.store(value, Ordering::Release);
        }
    }

    /// Set every entry in `range`
    pub fn set_range(&self, range: Range<usize>, value: u8) {
        for index in range {
            self.set(index, value);
        }
    }

    /// Reset entries in `range` to zero; returns how many were nonzero
    pub fn clear_range(&self, range: Range<usize>) -> usize {
        let mut cleared = 0;
        for entry in &self.bytes()[range] {
            if entry.swap(0, Ordering::AcqRel) != 0 {
                cleared += 1;
            }
        }
        cleared
    }

    /// Indices in `range` holding a nonzero value
    pub fn set_indices(&self, range: Range<usize>) -> impl Iterator<Item = usize> + '_ {
        range.filter(move |&index| self.get(index) != 0)
    }

    /// Number of entries
    #[inline]
    pub fn len(&self) -> usize {
        self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries == 0
    }

    #[inline]
    pub fn shift(&self) -> u32 {
        self.shift
    }

    #[inline]
    pub fn origin(&self) -> usize {
        self.origin
    }
}

impl std::fmt::Debug for ByteMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ByteMap")
            .field("origin", &format_args!("{:#x}", self.origin))
            .field("limit", &format_args!("{:#x}", self.limit))
            .field("shift", &self.shift)
            .field("entries", &self.entries)
            .finish()
    }
}
