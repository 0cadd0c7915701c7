//! Barrier State - Heap bounds plus every side table
//!
//! One `BarrierState` exists per reserved heap range. Mutators reach it
//! through a [`CardMarkingBarrier`](super::CardMarkingBarrier); the
//! collector uses the methods here to read and reset the tables. Methods
//! that clear or reset take `&WorldStopped`.

use super::card_table::CardTable;
#[cfg(feature = "card-bundles")]
use super::card_bundle::CardBundleTable;
#[cfg(feature = "shadow-heap")]
use super::shadow::{ShadowHeap, ShadowReport};
#[cfg(feature = "write-watch")]
use super::write_watch::WriteWatchTable;
use super::BarrierKind;
use crate::config::HeapWatchConfig;
use crate::error::Result;
use crate::heap::HeapBounds;
use crate::logging::{log_event, WatchEvent};
use crate::safepoint::WorldStopped;
use std::sync::atomic::{AtomicBool, Ordering};

/// BarrierState - shared between the barrier and the collector
pub struct BarrierState {
    kind: BarrierKind,

    bounds: HeapBounds,

    cards: CardTable,

    #[cfg(feature = "card-bundles")]
    bundles: CardBundleTable,

    #[cfg(feature = "card-bundles")]
    bundles_enabled: AtomicBool,

    #[cfg(feature = "write-watch")]
    write_watch: WriteWatchTable,

    write_watch_enabled: AtomicBool,

    #[cfg(feature = "shadow-heap")]
    shadow: Option<ShadowHeap>,
}

impl BarrierState {
    /// Build tables covering `[reserved_low, reserved_high)`
    ///
    /// # Examples
    ///
    /// ```rust
    /// use heapwatch::{BarrierState, HeapWatchConfig};
    ///
    /// let state = BarrierState::new(&HeapWatchConfig::default(), 0x10_0000, 0x20_0000).unwrap();
    /// assert_eq!(state.cards().len(), 512);
    /// ```
    pub fn new(config: &HeapWatchConfig, reserved_low: usize, reserved_high: usize) -> Result<Self> {
        config.validate()?;
        let bounds = HeapBounds::new(reserved_low, reserved_high)?;

        let state = Self {
            kind: config.barrier_kind,
            cards: CardTable::new(reserved_low, reserved_high, config.card_shift())?,

            #[cfg(feature = "card-bundles")]
            bundles: CardBundleTable::new(reserved_low, reserved_high, config.card_bundle_shift())?,
            #[cfg(feature = "card-bundles")]
            bundles_enabled: AtomicBool::new(config.card_bundles),

            #[cfg(feature = "write-watch")]
            write_watch: WriteWatchTable::new(
                reserved_low,
                reserved_high,
                config.write_watch_shift(),
            )?,
            write_watch_enabled: AtomicBool::new(config.write_watch),

            #[cfg(feature = "shadow-heap")]
            shadow: if config.shadow_heap {
                Some(ShadowHeap::new(reserved_low, reserved_high)?)
            } else {
                None
            },

            bounds,
        };

        log::debug!(
            "barrier state over [{:#x}, {:#x}): kind={} cards={}",
            reserved_low,
            reserved_high,
            state.kind,
            state.cards.len()
        );

        Ok(state)
    }

    #[inline(always)]
    pub fn kind(&self) -> BarrierKind {
        self.kind
    }

    #[inline(always)]
    pub fn bounds(&self) -> &HeapBounds {
        &self.bounds
    }

    #[inline(always)]
    pub fn cards(&self) -> &CardTable {
        &self.cards
    }

    /// Clear cards overlapping `[start, end)`
    pub fn clear_cards(&self, _stopped: &WorldStopped<'_>, start: usize, end: usize) -> usize {
        let cards = self.cards.clear_range(start, end);
        log::debug!("cleared {} cards over [{:#x}, {:#x})", cards, start, end);
        log_event(WatchEvent::CardsCleared { start, end, cards });
        cards
    }

    /// Visit the start address of every dirty card in `[start, end)`
    pub fn for_each_dirty_card(&self, start: usize, end: usize, mut f: impl FnMut(usize)) {
        for card in self.cards.dirty_cards(start, end) {
            f(card);
        }
    }

    /// Start addresses of dirty cards in `[start, end)`
    pub fn dirty_cards(&self, start: usize, end: usize) -> Vec<usize> {
        self.cards.dirty_cards(start, end).collect()
    }

    // ------------------------------------------------------------------
    // Card bundles
    // ------------------------------------------------------------------

    #[cfg(feature = "card-bundles")]
    #[inline(always)]
    pub fn card_bundles(&self) -> &CardBundleTable {
        &self.bundles
    }

    #[cfg(feature = "card-bundles")]
    #[inline(always)]
    pub fn card_bundles_enabled(&self) -> bool {
        self.bundles_enabled.load(Ordering::Relaxed)
    }

    /// Turn bundle maintenance on or off
    ///
    /// Enabling marks every bundle dirty, since stores made while disabled
    /// were not summarized.
    #[cfg(feature = "card-bundles")]
    pub fn set_card_bundles_enabled(&self, _stopped: &WorldStopped<'_>, enabled: bool) {
        if enabled && !self.card_bundles_enabled() {
            self.bundles
                .mark_range(self.bounds.reserved_low(), self.bounds.reserved_high());
        }
        self.bundles_enabled.store(enabled, Ordering::Release);
    }

    /// Start addresses of dirty bundles in `[start, end)`
    #[cfg(feature = "card-bundles")]
    pub fn dirty_bundles(&self, start: usize, end: usize) -> Vec<usize> {
        self.bundles.dirty_bundles(start, end).collect()
    }

    /// Clear bundles whose cards are all clean
    #[cfg(feature = "card-bundles")]
    pub fn reset_clean_bundles(&self, _stopped: &WorldStopped<'_>) -> usize {
        let cleared = self.bundles.clear_if_cards_clean(&self.cards);
        log::debug!("cleared {} clean card bundles", cleared);
        cleared
    }

    // ------------------------------------------------------------------
    // Write watch
    // ------------------------------------------------------------------

    #[cfg(feature = "write-watch")]
    pub fn write_watch(&self) -> &WriteWatchTable {
        &self.write_watch
    }

    /// Is the barrier recording page touches
    #[inline(always)]
    pub fn is_write_watch_enabled(&self) -> bool {
        cfg!(feature = "write-watch") && self.write_watch_enabled.load(Ordering::Acquire)
    }

    /// Start recording page touches
    #[cfg(feature = "write-watch")]
    pub fn enable_write_watch(&self, _stopped: &WorldStopped<'_>) {
        self.write_watch_enabled.store(true, Ordering::Release);
    }

    /// Stop recording page touches
    #[cfg(feature = "write-watch")]
    pub fn disable_write_watch(&self, _stopped: &WorldStopped<'_>) {
        self.write_watch_enabled.store(false, Ordering::Release);
    }

    /// Touched pages in `[start, end)`, resetting them
    #[cfg(feature = "write-watch")]
    pub fn harvest_write_watch(
        &self,
        _stopped: &WorldStopped<'_>,
        start: usize,
        end: usize,
    ) -> Vec<usize> {
        let pages = self.write_watch.get_and_reset(start, end);
        log::debug!("write watch reset, {} pages touched", pages.len());
        log_event(WatchEvent::WriteWatchReset { pages: pages.len() });
        pages
    }

    // ------------------------------------------------------------------
    // Shadow heap
    // ------------------------------------------------------------------

    #[cfg(feature = "shadow-heap")]
    #[inline(always)]
    pub fn shadow(&self) -> Option<&ShadowHeap> {
        self.shadow.as_ref()
    }

    /// Compare `[start, end)` against the shadow heap
    ///
    /// Returns `None` if the shadow heap is disabled.
    ///
    /// # Safety
    /// `[start, end)` must be mapped and readable.
    #[cfg(feature = "shadow-heap")]
    pub unsafe fn verify_shadow(
        &self,
        _stopped: &WorldStopped<'_>,
        start: usize,
        end: usize,
    ) -> Option<ShadowReport> {
        let shadow = self.shadow.as_ref()?;
        // SAFETY: caller guarantees the range is readable; mutators are stopped.
        let report = unsafe { shadow.verify(start, end) };
        for mismatch in &report.mismatches {
            log::warn!(
                "shadow mismatch at {:#x}: shadow {:#x}, heap {:#x}",
                mismatch.slot,
                mismatch.shadow,
                mismatch.actual
            );
            log_event(WatchEvent::ShadowMismatch {
                slot: mismatch.slot,
                expected: mismatch.shadow,
                actual: mismatch.actual,
            });
        }
        Some(report)
    }

    /// Copy `[start, end)` of the heap into the shadow
    ///
    /// # Safety
    /// `[start, end)` must be mapped and readable.
    #[cfg(feature = "shadow-heap")]
    pub unsafe fn resync_shadow(&self, _stopped: &WorldStopped<'_>, start: usize, end: usize) {
        if let Some(shadow) = &self.shadow {
            // SAFETY: caller guarantees the range is readable; mutators are stopped.
            unsafe { shadow.resync(start, end) };
        }
    }
}

impl std::fmt::Debug for BarrierState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BarrierState")
            .field("kind", &self.kind)
            .field("bounds", &self.bounds.snapshot())
            .field("cards", &self.cards.len())
            .field("write_watch", &self.is_write_watch_enabled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigError;
    use crate::error::HeapWatchError;

    const LOW: usize = 0x10_0000;
    const HIGH: usize = 0x20_0000;

    fn stopped() -> WorldStopped<'static> {
        unsafe { WorldStopped::assume() }
    }

    #[test]
    fn test_table_sizes() {
        let config = HeapWatchConfig {
            write_watch_page_size: 4096,
            card_bundle_size: 64 * 1024,
            ..Default::default()
        };
        let state = BarrierState::new(&config, LOW, HIGH).unwrap();
        assert_eq!(state.cards().len(), 512);
        #[cfg(feature = "card-bundles")]
        assert_eq!(state.card_bundles().len(), 16);
        #[cfg(feature = "write-watch")]
        assert_eq!(state.write_watch().len(), 256);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = HeapWatchConfig {
            card_size: 1000,
            ..Default::default()
        };
        let err = BarrierState::new(&config, LOW, HIGH).unwrap_err();
        assert!(matches!(
            err,
            HeapWatchError::Configuration(ConfigError::InvalidCardSize(_))
        ));
    }

    #[test]
    fn test_clear_cards() {
        let state = BarrierState::new(&HeapWatchConfig::default(), LOW, HIGH).unwrap();
        state.cards().mark(LOW + 0x100);
        state.cards().mark(LOW + 0x4000);

        assert_eq!(state.dirty_cards(LOW, HIGH), vec![LOW, LOW + 0x4000]);
        assert_eq!(state.clear_cards(&stopped(), LOW, LOW + 0x1000), 1);

        let mut seen = Vec::new();
        state.for_each_dirty_card(LOW, HIGH, |card| seen.push(card));
        assert_eq!(seen, vec![LOW + 0x4000]);
    }

    #[cfg(feature = "card-bundles")]
    #[test]
    fn test_enabling_bundles_marks_everything() {
        let config = HeapWatchConfig {
            card_bundles: false,
            card_bundle_size: 256 * 1024,
            ..Default::default()
        };
        let state = BarrierState::new(&config, LOW, HIGH).unwrap();
        assert!(!state.card_bundles_enabled());
        assert!(state.dirty_bundles(LOW, HIGH).is_empty());

        state.set_card_bundles_enabled(&stopped(), true);
        assert_eq!(state.dirty_bundles(LOW, HIGH).len(), 4);

        assert_eq!(state.reset_clean_bundles(&stopped()), 4);
    }

    #[cfg(feature = "write-watch")]
    #[test]
    fn test_write_watch_toggle() {
        let config = HeapWatchConfig {
            write_watch: false,
            ..Default::default()
        };
        let state = BarrierState::new(&config, LOW, HIGH).unwrap();
        assert!(!state.is_write_watch_enabled());

        state.enable_write_watch(&stopped());
        assert!(state.is_write_watch_enabled());

        state.write_watch().touch(LOW + 8);
        assert_eq!(state.harvest_write_watch(&stopped(), LOW, HIGH), vec![LOW]);
        assert!(state.harvest_write_watch(&stopped(), LOW, HIGH).is_empty());

        state.disable_write_watch(&stopped());
        assert!(!state.is_write_watch_enabled());
    }
}
