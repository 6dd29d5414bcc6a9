//! The no-reclamation baseline scheme.
//!
//! Retired nodes are simply leaked; the operating system reclaims them at
//! process exit. Protection slots are free because nothing is ever
//! destroyed. Useful as a correctness baseline and in tests that do not
//! measure memory.

use crate::reclaim::{Reclaim, Reclaimable, Slot};

/// Reclamation scheme that leaks retired nodes.
pub struct Leaky;

/// The zero-cost slot of [`Leaky`]: publishes nothing because nothing is
/// ever freed.
#[derive(Default)]
pub struct NullSlot;

impl Slot for NullSlot {
    #[inline]
    fn publish(&mut self, _addr: usize) {}

    #[inline]
    fn clear(&mut self) {}
}

// SAFETY: nodes are never destroyed at all, so no publication can ever be
// violated.
unsafe impl Reclaim for Leaky {
    type Header = ();
    type Slot = NullSlot;

    #[inline]
    unsafe fn retire<T: Reclaimable<Self>>(ptr: *mut T) {
        let _ = ptr; // leaked deliberately
    }

    #[inline]
    fn collect() {}
}
