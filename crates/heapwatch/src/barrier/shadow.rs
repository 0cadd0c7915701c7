//! Shadow Heap - Debug mirror of heap words
//!
//! Every barriered store is repeated into a parallel mapping at a fixed
//! displacement from the real slot. A later [`ShadowHeap::verify`] compares
//! both copies: a slot whose shadow disagrees with the heap was written
//! without the barrier.
//!
//! With `barrier-check`, the barrier re-reads the real slot after a full
//! fence. If another thread raced the store, the shadow slot is poisoned
//! with [`INVALIDGCVALUE`] so the verifier reports it as unknown instead
//! of as a mismatch.

use crate::error::Result;
use crate::heap::MemoryMapping;
use crate::object::WORD;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Shadow value of a slot whose last barriered store raced another writer
pub const INVALIDGCVALUE: usize = 0xCCCC_CCCD;

/// Slot whose shadow copy disagrees with the heap
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShadowMismatch {
    pub slot: usize,
    pub shadow: usize,
    pub actual: usize,
}

/// Result of a verification pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShadowReport {
    /// Slots compared
    pub checked: usize,
    /// Slots holding `INVALIDGCVALUE`
    pub unknown: usize,
    pub mismatches: Vec<ShadowMismatch>,
}

impl ShadowReport {
    pub fn is_clean(&self) -> bool {
        self.mismatches.is_empty()
    }
}

/// ShadowHeap - word-for-word mirror of the reserved range
#[derive(Debug)]
pub struct ShadowHeap {
    mapping: MemoryMapping,
    reserved_low: usize,
    reserved_high: usize,
}

impl ShadowHeap {
    pub fn new(reserved_low: usize, reserved_high: usize) -> Result<Self> {
        Ok(Self {
            mapping: MemoryMapping::anonymous(reserved_high - reserved_low)?,
            reserved_low,
            reserved_high,
        })
    }

    /// Distance from a heap slot to its shadow slot
    pub fn displacement(&self) -> isize {
        self.mapping.base().wrapping_sub(self.reserved_low) as isize
    }

    #[inline(always)]
    fn slot(&self, addr: usize) -> &AtomicUsize {
        &self.mapping.as_atomic_words()[(addr - self.reserved_low) / WORD]
    }

    /// Shadow copy of the slot at `addr`
    pub fn get(&self, addr: usize) -> usize {
        self.slot(addr).load(Ordering::Acquire)
    }

    /// Mirror a barriered store of `value` to `dest`
    ///
    /// # Safety
    /// `dest` must be a readable, aligned slot in the reserved range.
    #[inline(always)]
    pub unsafe fn update(&self, dest: usize, value: usize) {
        let shadow = self.slot(dest);
        shadow.store(value, Ordering::Relaxed);

        #[cfg(feature = "barrier-check")]
        {
            std::sync::atomic::fence(Ordering::SeqCst);
            // SAFETY: caller guarantees `dest` is readable.
            let actual = unsafe { AtomicUsize::from_ptr(dest as *mut usize).load(Ordering::Relaxed) };
            if actual != value {
                shadow.store(INVALIDGCVALUE, Ordering::Relaxed);
            }
        }
    }

    /// Compare every word of `[start, end)` with its shadow
    ///
    /// # Safety
    /// The range must be mapped and readable, and no mutator may be storing
    /// into it.
    pub unsafe fn verify(&self, start: usize, end: usize) -> ShadowReport {
        let mut report = ShadowReport::default();
        for slot in self.words(start, end) {
            report.checked += 1;
            let shadow = self.get(slot);
            if shadow == INVALIDGCVALUE {
                report.unknown += 1;
                continue;
            }
            // SAFETY: caller guarantees the range is readable.
            let actual = unsafe { read_word(slot) };
            if actual != shadow {
                report.mismatches.push(ShadowMismatch {
                    slot,
                    shadow,
                    actual,
                });
            }
        }
        report
    }

    /// Copy `[start, end)` into the shadow, e.g. after objects were
    /// allocated or moved
    ///
    /// # Safety
    /// Same as [`ShadowHeap::verify`].
    pub unsafe fn resync(&self, start: usize, end: usize) -> usize {
        let mut copied = 0;
        for slot in self.words(start, end) {
            // SAFETY: caller guarantees the range is readable.
            self.slot(slot).store(unsafe { read_word(slot) }, Ordering::Relaxed);
            copied += 1;
        }
        copied
    }

    fn words(&self, start: usize, end: usize) -> impl Iterator<Item = usize> {
        let start = start.max(self.reserved_low).next_multiple_of(WORD);
        let end = end.min(self.reserved_high);
        (start..end).step_by(WORD).take_while(move |slot| slot + WORD <= end)
    }
}

unsafe fn read_word(addr: usize) -> usize {
    // SAFETY: forwarded from the caller.
    unsafe { AtomicUsize::from_ptr(addr as *mut usize).load(Ordering::Acquire) }
}
