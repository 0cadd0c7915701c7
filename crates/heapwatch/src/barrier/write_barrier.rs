//! Card Marking Barrier - [`WriteBarrier`] over a [`BarrierState`]
//!
//! Each call takes exactly one bounds snapshot; the collector may publish
//! new bounds between calls but never within one.

use super::state::BarrierState;
use super::{BarrierKind, WriteBarrier};
use crate::heap::BoundsSnapshot;
use crate::object::WORD;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// CardMarkingBarrier - generational card-marking write barrier
///
/// # Examples
///
/// ```rust
/// use heapwatch::barrier::{BarrierState, CardMarkingBarrier, WriteBarrier};
/// use heapwatch::HeapWatchConfig;
/// use std::sync::Arc;
///
/// let mut heap = vec![0usize; 512];
/// let low = heap.as_mut_ptr() as usize;
/// let high = low + heap.len() * 8;
///
/// let state = Arc::new(BarrierState::new(&HeapWatchConfig::default(), low, high).unwrap());
/// let barrier = CardMarkingBarrier::new(Arc::clone(&state));
///
/// let young = low + 64;
/// unsafe { barrier.write(heap.as_mut_ptr().add(3), young) };
///
/// assert_eq!(heap[3], young);
/// assert!(state.cards().is_dirty(low + 3 * 8));
/// ```
#[derive(Debug, Clone)]
pub struct CardMarkingBarrier {
    state: Arc<BarrierState>,
    kind: BarrierKind,
}

impl CardMarkingBarrier {
    /// Barrier using the kind the state was configured with
    pub fn new(state: Arc<BarrierState>) -> Self {
        let kind = state.kind();
        Self { state, kind }
    }

    /// Barrier with an explicit kind over shared state
    pub fn with_kind(state: Arc<BarrierState>, kind: BarrierKind) -> Self {
        Self { state, kind }
    }

    pub fn state(&self) -> &Arc<BarrierState> {
        &self.state
    }

    /// Table updates for a store of `value` to in-heap slot `dest`
    #[inline(always)]
    unsafe fn record(&self, bounds: &BoundsSnapshot, dest: usize, value: usize) {
        #[cfg(feature = "shadow-heap")]
        if let Some(shadow) = self.state.shadow() {
            // SAFETY: `dest` was just written by the caller.
            unsafe { shadow.update(dest, value) };
        }

        #[cfg(feature = "write-watch")]
        if self.state.is_write_watch_enabled() {
            self.state.write_watch().touch(dest);
        }

        if !self.kind.needs_card(bounds, value) {
            return;
        }

        self.state.cards().mark(dest);

        #[cfg(feature = "card-bundles")]
        if self.state.card_bundles_enabled() {
            self.state.card_bundles().mark(dest);
        }
    }

    /// Dirty every card overlapping `[start, end)`
    ///
    /// Used after a bulk copy; no ephemeral filter is applied.
    pub fn set_cards_after_bulk_copy(&self, start: usize, end: usize) {
        self.state.cards().mark_range(start, end);

        #[cfg(feature = "card-bundles")]
        if self.state.card_bundles_enabled() {
            self.state.card_bundles().mark_range(start, end);
        }
    }
}

#[inline(always)]
unsafe fn store_release(dest: *mut usize, value: usize) {
    // SAFETY: caller guarantees `dest` is valid and aligned.
    unsafe { AtomicUsize::from_ptr(dest).store(value, Ordering::Release) }
}

impl WriteBarrier for CardMarkingBarrier {
    #[inline(always)]
    unsafe fn write(&self, dest: *mut usize, value: usize) {
        let bounds = self.state.bounds().snapshot();
        debug_assert!(bounds.in_heap(dest as usize));

        // SAFETY: forwarded from the caller.
        unsafe {
            store_release(dest, value);
            self.record(&bounds, dest as usize, value);
        }
    }

    #[inline(always)]
    unsafe fn checked_write(&self, dest: *mut usize, value: usize) {
        let bounds = self.state.bounds().snapshot();

        if !bounds.in_heap(dest as usize) {
            // SAFETY: forwarded from the caller.
            unsafe { dest.write(value) };
            return;
        }

        // SAFETY: forwarded from the caller.
        unsafe {
            store_release(dest, value);
            self.record(&bounds, dest as usize, value);
        }
    }

    #[inline]
    unsafe fn byref_write(&self, dest: *mut usize, src: *const usize) {
        // SAFETY: caller guarantees `src` is readable and aligned.
        let value = unsafe { AtomicUsize::from_ptr(src as *mut usize).load(Ordering::Acquire) };
        // SAFETY: forwarded from the caller.
        unsafe { self.checked_write(dest, value) }
    }

    unsafe fn bulk_copy(&self, dest: *mut usize, src: *const usize, count: usize) {
        if count == 0 {
            return;
        }

        // SAFETY: caller guarantees both ranges are valid for `count` words.
        unsafe { std::ptr::copy(src, dest, count) };

        let bounds = self.state.bounds().snapshot();
        let start = dest as usize;
        let end = start + count * WORD;
        if end <= bounds.lowest || start >= bounds.highest {
            return;
        }
        let start = start.max(bounds.lowest);
        let end = end.min(bounds.highest);

        #[cfg(feature = "shadow-heap")]
        if let Some(shadow) = self.state.shadow() {
            for slot in (start..end).step_by(WORD) {
                // SAFETY: every slot in the range was just written.
                unsafe {
                    let value = AtomicUsize::from_ptr(slot as *mut usize).load(Ordering::Relaxed);
                    shadow.update(slot, value);
                }
            }
        }

        #[cfg(feature = "write-watch")]
        if self.state.is_write_watch_enabled() {
            self.state.write_watch().touch_range(start, end);
        }

        self.set_cards_after_bulk_copy(start, end);
    }

    #[inline(always)]
    fn kind(&self) -> BarrierKind {
        self.kind
    }
}
