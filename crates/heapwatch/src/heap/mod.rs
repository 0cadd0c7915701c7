//! Heap Module - Bounds and reference segment
//!
//! [`HeapBounds`] is the collector-owned description of the heap:
//!
//! ```text
//! reserved_low                                              reserved_high
//!   │  lowest_address                      highest_address       │
//!   │     │   ephemeral_low   ephemeral_high       │             │
//!   ▼     ▼        ▼               ▼               ▼             ▼
//!   ├─────┼────────┼───────────────┼───────────────┼─────────────┤
//!         │  old   │   ephemeral   │      old      │
//! ```
//!
//! The reserved range is fixed for the lifetime of the tables built over
//! it. The collector publishes new bounds only while the world is stopped;
//! the barrier reads them once per store through [`HeapBounds::snapshot`].

pub mod mapping;
pub mod segment;

pub use mapping::MemoryMapping;
pub use segment::HeapSegment;

use crate::error::{HeapWatchError, Result};
use crate::logging::{log_event, WatchEvent};
use crate::safepoint::WorldStopped;
use crossbeam::utils::CachePadded;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Half-open address range stored as two atomics
#[derive(Debug)]
struct AtomicRange {
    low: AtomicUsize,
    high: AtomicUsize,
}

impl AtomicRange {
    fn new(low: usize, high: usize) -> Self {
        Self {
            low: AtomicUsize::new(low),
            high: AtomicUsize::new(high),
        }
    }
}

/// Point-in-time copy of the heap bounds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundsSnapshot {
    pub lowest: usize,
    pub highest: usize,
    pub ephemeral_low: usize,
    pub ephemeral_high: usize,
}

impl BoundsSnapshot {
    /// `addr` in `[lowest, highest)`
    #[inline(always)]
    pub fn in_heap(&self, addr: usize) -> bool {
        addr >= self.lowest && addr < self.highest
    }

    /// `addr` in `[ephemeral_low, ephemeral_high)`
    #[inline(always)]
    pub fn in_ephemeral(&self, addr: usize) -> bool {
        addr >= self.ephemeral_low && addr < self.ephemeral_high
    }

    /// `lowest <= ephemeral_low <= ephemeral_high <= highest`
    pub fn is_ordered(&self) -> bool {
        self.lowest <= self.ephemeral_low
            && self.ephemeral_low <= self.ephemeral_high
            && self.ephemeral_high <= self.highest
    }
}

/// HeapBounds - process-wide heap and ephemeral ranges
///
/// # Examples
///
/// ```rust
/// use heapwatch::heap::HeapBounds;
/// use heapwatch::safepoint::Safepoint;
///
/// let bounds = HeapBounds::new(0x1000, 0x9000).unwrap();
/// let safepoint = Safepoint::new(0);
///
/// let stopped = safepoint.stop_the_world();
/// bounds.set_ephemeral_range(&stopped, 0x1000, 0x5000).unwrap();
/// drop(stopped);
///
/// let snap = bounds.snapshot();
/// assert!(snap.in_ephemeral(0x1400));
/// assert!(!snap.in_ephemeral(0x7000));
/// ```
#[derive(Debug)]
pub struct HeapBounds {
    reserved_low: usize,
    reserved_high: usize,
    heap: CachePadded<AtomicRange>,
    ephemeral: CachePadded<AtomicRange>,
}

impl HeapBounds {
    /// Bounds over `[reserved_low, reserved_high)`
    ///
    /// The heap initially spans the whole reservation and everything is
    /// ephemeral.
    pub fn new(reserved_low: usize, reserved_high: usize) -> Result<Self> {
        if reserved_low >= reserved_high {
            return Err(HeapWatchError::InvalidArgument(format!(
                "empty reserved range [{:#x}, {:#x})",
                reserved_low, reserved_high
            )));
        }

        Ok(Self {
            reserved_low,
            reserved_high,
            heap: CachePadded::new(AtomicRange::new(reserved_low, reserved_high)),
            ephemeral: CachePadded::new(AtomicRange::new(reserved_low, reserved_high)),
        })
    }

    /// Start of the reserved range; table index origin
    #[inline(always)]
    pub fn reserved_low(&self) -> usize {
        self.reserved_low
    }

    #[inline(always)]
    pub fn reserved_high(&self) -> usize {
        self.reserved_high
    }

    /// Read all four bounds
    #[inline(always)]
    pub fn snapshot(&self) -> BoundsSnapshot {
        BoundsSnapshot {
            lowest: self.heap.low.load(Ordering::Acquire),
            highest: self.heap.high.load(Ordering::Acquire),
            ephemeral_low: self.ephemeral.low.load(Ordering::Acquire),
            ephemeral_high: self.ephemeral.high.load(Ordering::Acquire),
        }
    }

    /// Publish a full set of bounds
    pub fn publish(&self, _stopped: &WorldStopped<'_>, bounds: BoundsSnapshot) -> Result<()> {
        if !bounds.is_ordered()
            || bounds.lowest < self.reserved_low
            || bounds.highest > self.reserved_high
        {
            return Err(HeapWatchError::InvalidBounds {
                lowest: bounds.lowest,
                ephemeral_low: bounds.ephemeral_low,
                ephemeral_high: bounds.ephemeral_high,
                highest: bounds.highest,
            });
        }

        self.heap.low.store(bounds.lowest, Ordering::Release);
        self.heap.high.store(bounds.highest, Ordering::Release);
        self.ephemeral.low.store(bounds.ephemeral_low, Ordering::Release);
        self.ephemeral.high.store(bounds.ephemeral_high, Ordering::Release);

        log::debug!(
            "heap bounds [{:#x}, {:#x}) ephemeral [{:#x}, {:#x})",
            bounds.lowest,
            bounds.highest,
            bounds.ephemeral_low,
            bounds.ephemeral_high
        );
        log_event(WatchEvent::BoundsUpdated {
            lowest: bounds.lowest,
            highest: bounds.highest,
            ephemeral_low: bounds.ephemeral_low,
            ephemeral_high: bounds.ephemeral_high,
        });

        Ok(())
    }

    /// Move the ephemeral range, keeping the heap range
    pub fn set_ephemeral_range(
        &self,
        stopped: &WorldStopped<'_>,
        ephemeral_low: usize,
        ephemeral_high: usize,
    ) -> Result<()> {
        let current = self.snapshot();
        self.publish(
            stopped,
            BoundsSnapshot {
                ephemeral_low,
                ephemeral_high,
                ..current
            },
        )
    }

    /// Move the heap range, keeping the ephemeral range
    pub fn set_heap_range(
        &self,
        stopped: &WorldStopped<'_>,
        lowest: usize,
        highest: usize,
    ) -> Result<()> {
        let current = self.snapshot();
        self.publish(
            stopped,
            BoundsSnapshot {
                lowest,
                highest,
                ..current
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stopped() -> WorldStopped<'static> {
        unsafe { WorldStopped::assume() }
    }

    #[test]
    fn test_initial_bounds_cover_reservation() {
        let bounds = HeapBounds::new(0x1000, 0x9000).unwrap();
        let snap = bounds.snapshot();
        assert_eq!(snap.lowest, 0x1000);
        assert_eq!(snap.highest, 0x9000);
        assert!(snap.is_ordered());
        assert!(snap.in_heap(0x8ff8));
        assert!(!snap.in_heap(0x9000));
    }

    #[test]
    fn test_empty_reservation_rejected() {
        assert!(HeapBounds::new(0x1000, 0x1000).is_err());
    }

    #[test]
    fn test_ephemeral_update() {
        let bounds = HeapBounds::new(0x1000, 0x9000).unwrap();
        bounds.set_ephemeral_range(&stopped(), 0x1000, 0x5000).unwrap();
        let snap = bounds.snapshot();
        assert!(snap.in_ephemeral(0x4ff8));
        assert!(!snap.in_ephemeral(0x5000));
    }

    #[test]
    fn test_unordered_update_rejected() {
        let bounds = HeapBounds::new(0x1000, 0x9000).unwrap();
        let err = bounds
            .set_ephemeral_range(&stopped(), 0x6000, 0x5000)
            .unwrap_err();
        assert!(matches!(err, HeapWatchError::InvalidBounds { .. }));
        assert_eq!(bounds.snapshot().ephemeral_low, 0x1000);
    }

    #[test]
    fn test_heap_range_must_stay_reserved() {
        let bounds = HeapBounds::new(0x1000, 0x9000).unwrap();
        bounds.set_ephemeral_range(&stopped(), 0x2000, 0x3000).unwrap();
        assert!(bounds.set_heap_range(&stopped(), 0x800, 0x9000).is_err());
        assert!(bounds.set_heap_range(&stopped(), 0x2000, 0x4000).is_ok());
        assert!(bounds.set_heap_range(&stopped(), 0x2800, 0x4000).is_err());
    }
}
