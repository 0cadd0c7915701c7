//! Safepoint Coordination
//!
//! A safepoint is a point where every mutator thread is stopped and the
//! heap is quiescent. Collector-side table maintenance and the byref
//! validation pass only run inside one.
//!
//! ## Safepoint States
//!
//! ```text
//! SAFEPOINT_NONE (0) ─────┐
//!     │                   │
//!     ▼                   │
//! SAFEPOINT_REQUESTED (1) │
//!     │                   │
//!     ▼                   │
//! SAFEPOINT_REACHED (2) ──┘ (after release)
//! ```
//!
//! ## Proof Token
//!
//! [`Safepoint::stop_the_world`] returns a [`WorldStopped`] guard. APIs that
//! are only sound while mutators are halted take `&WorldStopped`, so the
//! precondition is visible in their signature. Dropping the guard releases
//! the safepoint.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Safepoint state constants
pub const SAFEPOINT_NONE: u8 = 0;
pub const SAFEPOINT_REQUESTED: u8 = 1;
pub const SAFEPOINT_REACHED: u8 = 2;

/// Low half of the control word: mutators parked in the current epoch
const PARKED_MASK: u64 = u32::MAX as u64;
const EPOCH_SHIFT: u32 = 32;

#[inline(always)]
fn epoch_of(word: u64) -> u64 {
    word >> EPOCH_SHIFT
}

#[inline(always)]
fn parked_of(word: u64) -> usize {
    (word & PARKED_MASK) as usize
}

/// Safepoint - coordination point between the collector and mutators
///
/// The control word packs a request epoch (odd while a safepoint is
/// requested) with the number of mutators parked in that epoch. An arrival
/// only counts for the epoch it was made in, so a mutator still leaving
/// one safepoint is never counted as stopped for the next.
///
/// # Examples
///
/// ```rust
/// use heapwatch::safepoint::Safepoint;
///
/// // No registered mutators: stopping the world is immediate
/// let safepoint = Safepoint::new(0);
/// {
///     let _stopped = safepoint.stop_the_world();
///     assert!(safepoint.is_requested());
///     assert!(safepoint.try_stop_the_world().is_none());
/// }
/// assert!(!safepoint.is_requested());
/// ```
pub struct Safepoint {
    /// Request epoch and parked mutator count
    control: AtomicU64,

    /// Mutators that must arrive before the world counts as stopped
    total_threads: AtomicUsize,
}

impl Safepoint {
    /// Create a safepoint expecting `total_threads` mutators
    pub fn new(total_threads: usize) -> Self {
        Self {
            control: AtomicU64::new(0),
            total_threads: AtomicUsize::new(total_threads),
        }
    }

    /// Ask all mutators to stop
    ///
    /// Returns `false` if another safepoint is already requested.
    pub fn request_safepoint(&self) -> bool {
        self.control
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |word| {
                (epoch_of(word) % 2 == 0).then(|| (epoch_of(word) + 1) << EPOCH_SHIFT)
            })
            .is_ok()
    }

    /// Spin until every registered mutator has arrived
    pub fn wait_for_safepoint(&self) {
        let total = self.total_threads.load(Ordering::Acquire);

        while parked_of(self.control.load(Ordering::Acquire)) < total {
            std::hint::spin_loop();
        }
    }

    /// Mutator signals arrival
    ///
    /// Returns the epoch arrived in, or `None` if no safepoint is pending.
    pub fn arrive(&self) -> Option<u64> {
        self.control
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |word| {
                (epoch_of(word) % 2 == 1).then_some(word + 1)
            })
            .ok()
            .map(epoch_of)
    }

    /// Resume all mutators
    pub fn release_safepoint(&self) {
        let _ = self
            .control
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |word| {
                (epoch_of(word) % 2 == 1).then(|| (epoch_of(word) + 1) << EPOCH_SHIFT)
            });
    }

    /// Has a safepoint been requested
    pub fn is_requested(&self) -> bool {
        epoch_of(self.control.load(Ordering::Acquire)) % 2 == 1
    }

    /// Current state constant
    pub fn get_state(&self) -> u8 {
        let word = self.control.load(Ordering::Acquire);
        if epoch_of(word) % 2 == 0 {
            SAFEPOINT_NONE
        } else if parked_of(word) == 0 {
            SAFEPOINT_REQUESTED
        } else {
            SAFEPOINT_REACHED
        }
    }

    /// Mutators currently parked
    pub fn threads_at_safepoint(&self) -> usize {
        parked_of(self.control.load(Ordering::Acquire))
    }

    /// Expected mutator count
    pub fn total_threads(&self) -> usize {
        self.total_threads.load(Ordering::Acquire)
    }

    /// Update the expected mutator count
    pub fn set_total_threads(&self, count: usize) {
        self.total_threads.store(count, Ordering::Release);
    }

    /// Arrive and spin until the safepoint arrived in is released
    ///
    /// Returns `false` without parking if nothing was requested.
    pub fn block_until_released(&self) -> bool {
        let Some(epoch) = self.arrive() else {
            return false;
        };

        while epoch_of(self.control.load(Ordering::Acquire)) == epoch {
            std::hint::spin_loop();
        }
        true
    }

    /// Mutator poll point; parks if a safepoint is pending
    ///
    /// Returns `true` if the thread was parked.
    #[inline]
    pub fn poll(&self) -> bool {
        self.is_requested() && self.block_until_released()
    }

    /// Request a safepoint and wait for every mutator
    ///
    /// Waits for a safepoint already in progress to be released first, so
    /// only call this from a thread that is not counted as a mutator. A
    /// mutator should use [`Safepoint::try_stop_the_world`] and poll on
    /// failure.
    ///
    /// The returned guard releases the safepoint when dropped.
    pub fn stop_the_world(&self) -> WorldStopped<'_> {
        while !self.request_safepoint() {
            std::hint::spin_loop();
        }
        self.stopped()
    }

    /// Stop the world unless another thread already requested it
    pub fn try_stop_the_world(&self) -> Option<WorldStopped<'_>> {
        self.request_safepoint().then(|| self.stopped())
    }

    fn stopped(&self) -> WorldStopped<'_> {
        self.wait_for_safepoint();
        WorldStopped {
            safepoint: Some(self),
            _not_send: PhantomData,
        }
    }
}

impl Default for Safepoint {
    fn default() -> Self {
        Self::new(1)
    }
}

/// Proof that no mutator is running managed code
pub struct WorldStopped<'a> {
    safepoint: Option<&'a Safepoint>,
    _not_send: PhantomData<*const ()>,
}

impl WorldStopped<'static> {
    /// Token for a collector that halts mutators by its own means
    ///
    /// # Safety
    /// No mutator thread may run managed code or touch the barrier tables
    /// while the token is alive.
    pub unsafe fn assume() -> Self {
        WorldStopped {
            safepoint: None,
            _not_send: PhantomData,
        }
    }
}

impl WorldStopped<'_> {
    /// Was this token produced by a [`Safepoint`]
    pub fn is_coordinated(&self) -> bool {
        self.safepoint.is_some()
    }
}

impl Drop for WorldStopped<'_> {
    fn drop(&mut self) {
        if let Some(safepoint) = self.safepoint {
            safepoint.release_safepoint();
        }
    }
}

impl std::fmt::Debug for WorldStopped<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorldStopped")
            .field("coordinated", &self.is_coordinated())
            .finish()
    }
}
