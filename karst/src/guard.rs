//! The protected pointer: a scoped handle pinning one node.
//!
//! A [`Guard`] owns one protection slot of its reclamation scheme and at
//! most one pinned node at a time. While the pin is held the scheme will
//! not destroy the node, so the holder may dereference it freely. The pin
//! is withdrawn by [`reset`](Guard::reset), by re-acquiring, or when the
//! guard is dropped.

use crate::marked::{MarkedAtomic, MarkedPtr};
use crate::reclaim::{Reclaim, Reclaimable, Slot};
use core::sync::atomic::Ordering;

/// A scoped handle pinning a node against reclamation while it is observed.
///
/// Guards are movable and explicitly cloneable — every clone is a distinct
/// pin and charges the scheme another slot — but never implicitly copied.
pub struct Guard<T, R: Reclaim> {
    slot: R::Slot,
    ptr: MarkedPtr<T>,
}

impl<T, R: Reclaim> Guard<T, R> {
    /// Creates an empty guard.
    #[inline]
    pub fn new() -> Self {
        Self {
            slot: R::Slot::default(),
            ptr: MarkedPtr::null(),
        }
    }

    /// Reads `src` under `order` and pins the value read, repeating the
    /// publish/validate cycle until the read is stable. Returns the pinned
    /// value.
    pub fn acquire(&mut self, src: &MarkedAtomic<T>, order: Ordering) -> MarkedPtr<T> {
        loop {
            let p = src.load(order);
            if p.is_null() {
                self.slot.clear();
                self.ptr = p;
                return p;
            }
            self.slot.publish(p.as_ptr() as usize);
            // the publication races with concurrent retirement; only a
            // re-read that still matches proves the pin landed in time
            if src.load(order) == p {
                self.ptr = p;
                return p;
            }
        }
    }

    /// Pins `expected`, then verifies `src` still holds exactly `expected`
    /// (address and mark). On mismatch the pin is withdrawn and `false` is
    /// returned. A null `expected` pins nothing and merely re-checks the
    /// source.
    pub fn acquire_if_equal(
        &mut self,
        src: &MarkedAtomic<T>,
        expected: MarkedPtr<T>,
        order: Ordering,
    ) -> bool {
        if expected.is_null() {
            self.reset();
            return src.load(order) == expected;
        }
        self.slot.publish(expected.as_ptr() as usize);
        if src.load(order) == expected {
            self.ptr = expected;
            true
        } else {
            self.slot.clear();
            self.ptr = MarkedPtr::null();
            false
        }
    }

    /// Pins `ptr` without validating it against any source.
    ///
    /// # Safety
    ///
    /// The caller must guarantee `ptr` cannot have been retired before this
    /// publication becomes visible to retiring threads — e.g. because a node
    /// that still links to it is provably reachable, or because `ptr` has
    /// not been published to the structure yet.
    pub unsafe fn protect_unchecked(&mut self, ptr: MarkedPtr<T>) {
        if !ptr.is_null() {
            self.slot.publish(ptr.as_ptr() as usize);
        } else {
            self.slot.clear();
        }
        self.ptr = ptr;
    }

    /// The currently pinned value (null if the guard is empty).
    #[inline]
    pub fn get(&self) -> MarkedPtr<T> {
        self.ptr
    }

    /// The pinned address, mark stripped.
    #[inline]
    pub fn as_raw(&self) -> *mut T {
        self.ptr.as_ptr()
    }

    /// True if no node is pinned.
    #[inline]
    pub fn is_null(&self) -> bool {
        self.ptr.is_null()
    }

    /// Borrows the pinned node.
    ///
    /// # Safety
    ///
    /// The pin must actually protect the node — guaranteed after a
    /// successful validated acquire, caller-asserted after
    /// [`protect_unchecked`](Self::protect_unchecked).
    #[inline]
    pub unsafe fn as_ref(&self) -> Option<&T> {
        // SAFETY: the pin keeps the node alive for the guard borrow
        unsafe { self.as_raw().as_ref() }
    }

    /// Withdraws the pin. The guard keeps its slot for reuse.
    #[inline]
    pub fn reset(&mut self) {
        self.slot.clear();
        self.ptr = MarkedPtr::null();
    }

    /// Declares the pinned node dead and hands it to the scheme.
    ///
    /// The guard's own pin is withdrawn first, so the calling thread does
    /// not keep the node alive against its own retirement.
    ///
    /// # Safety
    ///
    /// The node must be unreachable from every shared pointer (physically
    /// unlinked), and must not have been retired already.
    pub unsafe fn reclaim(&mut self)
    where
        T: Reclaimable<R>,
    {
        let ptr = self.as_raw();
        debug_assert!(!ptr.is_null());
        self.reset();
        // SAFETY: caller guarantees the node is unlinked and unretired
        unsafe { R::retire(ptr) };
    }
}

impl<T, R: Reclaim> Default for Guard<T, R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, R: Reclaim> Clone for Guard<T, R> {
    /// A distinct pin on the same node.
    ///
    /// Safe because the original pin is alive for the whole call: the node
    /// cannot be freed before the new publication is visible.
    fn clone(&self) -> Self {
        let mut slot = R::Slot::default();
        if !self.ptr.is_null() {
            slot.publish(self.ptr.as_ptr() as usize);
        }
        Self {
            slot,
            ptr: self.ptr,
        }
    }
}

// The slot's own Drop withdraws the publication and returns the slot, so
// the guard needs no Drop glue of its own.
