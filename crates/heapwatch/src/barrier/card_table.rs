//! Card Table - Byte-per-card dirty map
//!
//! One byte per `card_size` span of the reserved range. A card is dirty if
//! a reference into the ephemeral range may have been stored in its span
//! since the collector last cleared it. Extra dirty cards cost scan time;
//! a missing one loses a live object.

use super::byte_map::ByteMap;
use crate::error::Result;

/// Card value: nothing to scan
pub const CARD_CLEAN: u8 = 0;

/// Card value: scan this span
pub const CARD_DIRTY: u8 = 0xFF;

/// CardTable - fine-grained dirty map
#[derive(Debug)]
pub struct CardTable {
    map: ByteMap,
}

impl CardTable {
    /// Table over `[reserved_low, reserved_high)` with `1 << card_shift` byte cards
    pub fn new(reserved_low: usize, reserved_high: usize, card_shift: u32) -> Result<Self> {
        Ok(Self {
            map: ByteMap::new(reserved_low, reserved_high, card_shift)?,
        })
    }

    /// Card index covering `addr`
    ///
    /// Indices count from the start of the reserved range the table was
    /// built over, not from the currently published `lowest` bound. The
    /// heap bounds move inside the reservation without re-basing the table,
    /// so a card keeps its index for the life of the table.
    #[inline(always)]
    pub fn card_index(&self, addr: usize) -> usize {
        self.map.index_of(addr)
    }

    /// Dirty the card covering `addr`
    #[inline(always)]
    pub fn mark(&self, addr: usize) {
        self.map.set(self.map.index_of(addr), CARD_DIRTY);
    }

    /// Dirty every card overlapping `[start, end)`
    pub fn mark_range(&self, start: usize, end: usize) {
        self.map.set_range(self.map.index_range(start, end), CARD_DIRTY);
    }

    #[inline]
    pub fn is_dirty(&self, addr: usize) -> bool {
        self.map.covers(addr) && self.is_dirty_index(self.map.index_of(addr))
    }

    #[inline]
    pub fn is_dirty_index(&self, index: usize) -> bool {
        self.map.get(index) == CARD_DIRTY
    }

    /// Any dirty card among `range` (card indices)
    pub fn any_dirty(&self, range: std::ops::Range<usize>) -> bool {
        self.map.set_indices(range).next().is_some()
    }

    /// Clear cards overlapping `[start, end)`; returns how many were dirty
    pub fn clear_range(&self, start: usize, end: usize) -> usize {
        self.map.clear_range(self.map.index_range(start, end))
    }

    /// Start addresses of dirty cards overlapping `[start, end)`
    pub fn dirty_cards(&self, start: usize, end: usize) -> impl Iterator<Item = usize> + '_ {
        self.map
            .set_indices(self.map.index_range(start, end))
            .map(move |index| self.map.entry_start(index))
    }

    #[inline]
    pub fn card_size(&self) -> usize {
        1 << self.map.shift()
    }

    #[inline]
    pub fn card_shift(&self) -> u32 {
        self.map.shift()
    }

    /// Number of cards
    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}
