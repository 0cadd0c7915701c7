//! Write Watch - Page-granularity touched map
//!
//! Set by the barrier on the first store into a page since the last
//! reset. The collector harvests and resets pages between passes to find
//! what changed during a concurrent phase.

use super::byte_map::ByteMap;
use crate::error::Result;

/// Page value: written since last reset
pub const PAGE_TOUCHED: u8 = 0xFF;

/// WriteWatchTable - one entry per page
#[derive(Debug)]
pub struct WriteWatchTable {
    map: ByteMap,
}

impl WriteWatchTable {
    pub fn new(reserved_low: usize, reserved_high: usize, page_shift: u32) -> Result<Self> {
        Ok(Self {
            map: ByteMap::new(reserved_low, reserved_high, page_shift)?,
        })
    }

    #[inline(always)]
    pub fn page_index(&self, addr: usize) -> usize {
        self.map.index_of(addr)
    }

    /// Record a store into the page covering `addr`
    #[inline(always)]
    pub fn touch(&self, addr: usize) {
        self.map.set(self.map.index_of(addr), PAGE_TOUCHED);
    }

    /// Record stores into every page overlapping `[start, end)`
    pub fn touch_range(&self, start: usize, end: usize) {
        self.map.set_range(self.map.index_range(start, end), PAGE_TOUCHED);
    }

    #[inline]
    pub fn is_touched(&self, addr: usize) -> bool {
        self.map.covers(addr) && self.map.get(self.map.index_of(addr)) != 0
    }

    /// Start addresses of touched pages overlapping `[start, end)`
    pub fn touched_pages(&self, start: usize, end: usize) -> Vec<usize> {
        self.map
            .set_indices(self.map.index_range(start, end))
            .map(|index| self.map.entry_start(index))
            .collect()
    }

    /// Collect touched pages in `[start, end)` and reset them
    pub fn get_and_reset(&self, start: usize, end: usize) -> Vec<usize> {
        let pages = self.touched_pages(start, end);
        self.map.clear_range(self.map.index_range(start, end));
        pages
    }

    pub fn page_size(&self) -> usize {
        1 << self.map.shift()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}
