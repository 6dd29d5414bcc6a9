//! Karst: protected-pointer memory reclamation for lock-free data structures.
//!
//! Lock-free structures unlink nodes while other threads may still be
//! reading them. Karst provides the pieces that make that safe:
//!
//! - **Marked atomics**: [`MarkedAtomic`]/[`MarkedPtr`] pack a node address
//!   with a one-bit logical-deletion mark in a single machine word.
//! - **Guards**: a [`Guard`] pins the node it observes so the reclamation
//!   scheme cannot free it mid-read.
//! - **Schemes**: the [`Reclaim`] contract, with two implementations —
//!   [`Hazard`] (hazard pointers, bounded garbage) and [`Leaky`] (leak
//!   everything, zero overhead).
//! - **Backoff**: pluggable contention hooks ([`NoBackoff`], [`SpinBackoff`]).
//!
//! # Example
//!
//! ```rust
//! use karst::{Guard, Hazard, MarkedAtomic, MarkedPtr, Ordering, Reclaim, Reclaimable, RetiredNode};
//!
//! // A node enrolls with the scheme by embedding its header first.
//! #[repr(C)]
//! struct Node {
//!     header: RetiredNode,
//!     value: u64,
//! }
//! unsafe impl Reclaimable<Hazard> for Node {}
//!
//! let node = Box::into_raw(Box::new(Node {
//!     header: RetiredNode::new(),
//!     value: 7,
//! }));
//! let head: MarkedAtomic<Node> = MarkedAtomic::new(MarkedPtr::new(node, 0));
//!
//! // Pin before reading.
//! let mut guard: Guard<Node, Hazard> = Guard::new();
//! guard.acquire(&head, Ordering::Acquire);
//! assert_eq!(unsafe { guard.as_ref() }.map(|n| n.value), Some(7));
//!
//! // Unlink, then hand the node to the scheme; it is freed once no pin
//! // publishes it.
//! head.store(MarkedPtr::null(), Ordering::Release);
//! unsafe { guard.reclaim() };
//! Hazard::collect();
//! ```

#![warn(missing_docs)]

mod backoff;
mod guard;
mod hazard;
mod leaky;
mod marked;
mod reclaim;

pub use backoff::{Backoff, NoBackoff, SpinBackoff};
pub use guard::Guard;
pub use hazard::{Hazard, HazardSlot, RetiredNode, active_pins};
pub use leaky::{Leaky, NullSlot};
pub use marked::{MarkedAtomic, MarkedPtr};
pub use reclaim::{Reclaim, Reclaimable, Slot};

// Re-export for convenience
pub use core::sync::atomic::Ordering;
