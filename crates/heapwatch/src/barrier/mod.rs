//! Barrier Module - Card-marking write barrier
//!
//! Every store of a reference into a heap slot goes through a
//! [`WriteBarrier`]. The barrier performs the store and records it in the
//! collector's side tables:
//!
//! - [`CardTable`]: card covering the slot, if the referent is ephemeral
//! - [`CardBundleTable`]: bundle covering that card (feature `card-bundles`)
//! - [`WriteWatchTable`]: page covering the slot (feature `write-watch`)
//! - [`ShadowHeap`]: mirror of the slot (feature `shadow-heap`)
//!
//! Fast path:
//! ```text
//! store(dest, value)                       // release
//! shadow[dest] = value                     // shadow-heap
//! write_watch[page(dest)] = touched        // write-watch, if enabled
//! if !kind.needs_card(value) return
//! if card[dest] != dirty { card[dest] = dirty }
//! if bundle[dest] != dirty { bundle[dest] = dirty }   // card-bundles
//! ```
//!
//! The fast path takes no locks, never allocates and cannot fail. Table
//! entries only ever go from clean to dirty on this path, so concurrent
//! mutators writing the same entry agree without a CAS.

pub mod byte_map;
#[cfg(feature = "card-bundles")]
pub mod card_bundle;
pub mod card_table;
#[cfg(feature = "shadow-heap")]
pub mod shadow;
pub mod state;
pub mod write_barrier;
#[cfg(feature = "write-watch")]
pub mod write_watch;

#[cfg(feature = "card-bundles")]
pub use card_bundle::CardBundleTable;
pub use card_table::{CardTable, CARD_CLEAN, CARD_DIRTY};
#[cfg(feature = "shadow-heap")]
pub use shadow::{ShadowHeap, ShadowMismatch, ShadowReport, INVALIDGCVALUE};
pub use state::BarrierState;
pub use write_barrier::CardMarkingBarrier;
#[cfg(feature = "write-watch")]
pub use write_watch::WriteWatchTable;

use crate::heap::BoundsSnapshot;
use serde::{Deserialize, Serialize};

/// Ephemeral filter flavor
///
/// - `PreGrow`: only `value >= ephemeral_low`; correct while the ephemeral
///   range extends to the top of the heap
/// - `PostGrow`: `ephemeral_low <= value < ephemeral_high`
/// - `Server`: no filter, every store marks its card
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BarrierKind {
    PreGrow,
    #[default]
    PostGrow,
    Server,
}

impl BarrierKind {
    /// Parse `pregrow`, `postgrow` or `server` (case-insensitive)
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "pregrow" => Some(BarrierKind::PreGrow),
            "postgrow" => Some(BarrierKind::PostGrow),
            "server" => Some(BarrierKind::Server),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            BarrierKind::PreGrow => "pregrow",
            BarrierKind::PostGrow => "postgrow",
            BarrierKind::Server => "server",
        }
    }

    /// Does storing `value` require a card mark
    #[inline(always)]
    pub fn needs_card(self, bounds: &BoundsSnapshot, value: usize) -> bool {
        match self {
            BarrierKind::PreGrow => value >= bounds.ephemeral_low,
            BarrierKind::PostGrow => bounds.in_ephemeral(value),
            BarrierKind::Server => true,
        }
    }
}

impl std::fmt::Display for BarrierKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// WriteBarrier - reference store entry points used by compiled code
///
/// All methods are `unsafe`: the compiler that emits the call is trusted
/// to pass valid, aligned slot pointers.
pub trait WriteBarrier: Send + Sync {
    /// Store `value` to a slot known to be inside the heap
    ///
    /// # Safety
    /// `dest` must be a valid, aligned, writable slot in `[lowest, highest)`.
    unsafe fn write(&self, dest: *mut usize, value: usize);

    /// Store `value` to a slot that may lie outside the heap
    ///
    /// Outside `[lowest, highest)` this is a plain store with no table
    /// updates.
    ///
    /// # Safety
    /// `dest` must be a valid, aligned, writable slot.
    unsafe fn checked_write(&self, dest: *mut usize, value: usize);

    /// Copy one reference slot to another (struct copy)
    ///
    /// # Safety
    /// `src` must be readable and `dest` valid as for `checked_write`.
    unsafe fn byref_write(&self, dest: *mut usize, src: *const usize);

    /// Move `count` reference slots, then mark every card the destination
    /// spans
    ///
    /// # Safety
    /// Both ranges must be valid for `count` words; they may overlap.
    unsafe fn bulk_copy(&self, dest: *mut usize, src: *const usize, count: usize);

    /// Filter flavor
    fn kind(&self) -> BarrierKind;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bounds() -> BoundsSnapshot {
        BoundsSnapshot {
            lowest: 0x1000,
            highest: 0x9000,
            ephemeral_low: 0x1000,
            ephemeral_high: 0x5000,
        }
    }

    #[test]
    fn test_kind_filters() {
        let b = bounds();
        assert!(BarrierKind::PostGrow.needs_card(&b, 0x1400));
        assert!(!BarrierKind::PostGrow.needs_card(&b, 0x7000));
        assert!(BarrierKind::PreGrow.needs_card(&b, 0x7000));
        assert!(!BarrierKind::PreGrow.needs_card(&b, 0x800));
        assert!(BarrierKind::Server.needs_card(&b, 0));
    }

    #[test]
    fn test_kind_names() {
        assert_eq!(BarrierKind::from_name("Server"), Some(BarrierKind::Server));
        assert_eq!(BarrierKind::from_name(" pregrow "), Some(BarrierKind::PreGrow));
        assert_eq!(BarrierKind::from_name("svr"), None);
        assert_eq!(BarrierKind::default().to_string(), "postgrow");
    }
}
