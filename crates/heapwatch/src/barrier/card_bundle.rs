//! Card Bundles - Coarse summary over the card table
//!
//! One byte per `card_bundle_size` span. A bundle is dirty whenever any
//! card it covers is dirty, so the collector can skip clean bundles
//! without reading their cards.

use super::byte_map::ByteMap;
use super::card_table::CardTable;
use crate::error::Result;
use std::ops::Range;

/// Bundle value: at least one card may be dirty
pub const BUNDLE_DIRTY: u8 = 0xFF;

/// CardBundleTable - one entry per bundle span
#[derive(Debug)]
pub struct CardBundleTable {
    map: ByteMap,
}

impl CardBundleTable {
    pub fn new(reserved_low: usize, reserved_high: usize, bundle_shift: u32) -> Result<Self> {
        Ok(Self {
            map: ByteMap::new(reserved_low, reserved_high, bundle_shift)?,
        })
    }

    #[inline(always)]
    pub fn bundle_index(&self, addr: usize) -> usize {
        self.map.index_of(addr)
    }

    /// Dirty the bundle covering `addr`
    #[inline(always)]
    pub fn mark(&self, addr: usize) {
        self.map.set(self.map.index_of(addr), BUNDLE_DIRTY);
    }

    /// Dirty every bundle overlapping `[start, end)`
    pub fn mark_range(&self, start: usize, end: usize) {
        self.map.set_range(self.map.index_range(start, end), BUNDLE_DIRTY);
    }

    #[inline]
    pub fn is_dirty(&self, addr: usize) -> bool {
        self.map.covers(addr) && self.is_dirty_index(self.map.index_of(addr))
    }

    #[inline]
    pub fn is_dirty_index(&self, index: usize) -> bool {
        self.map.get(index) == BUNDLE_DIRTY
    }

    /// Start addresses of dirty bundles overlapping `[start, end)`
    pub fn dirty_bundles(&self, start: usize, end: usize) -> impl Iterator<Item = usize> + '_ {
        self.map
            .set_indices(self.map.index_range(start, end))
            .map(move |index| self.map.entry_start(index))
    }

    /// Card indices covered by a bundle
    pub fn card_range(&self, index: usize, cards: &CardTable) -> Range<usize> {
        let per_bundle = self.map.shift() - cards.card_shift();
        let first = index << per_bundle;
        let last = ((index + 1) << per_bundle).min(cards.len());
        first..last
    }

    /// Clear bundles overlapping `[start, end)`; returns how many were dirty
    pub fn clear_range(&self, start: usize, end: usize) -> usize {
        self.map.clear_range(self.map.index_range(start, end))
    }

    /// Clear every dirty bundle whose cards are all clean
    ///
    /// Must only run while mutators are stopped, otherwise a card dirtied
    /// between the card scan and the bundle clear would be orphaned.
    pub fn clear_if_cards_clean(&self, cards: &CardTable) -> usize {
        let mut cleared = 0;
        for index in 0..self.map.len() {
            if self.is_dirty_index(index) && !cards.any_dirty(self.card_range(index, cards)) {
                cleared += self.map.clear_range(index..index + 1);
            }
        }
        cleared
    }

    pub fn bundle_size(&self) -> usize {
        1 << self.map.shift()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}
