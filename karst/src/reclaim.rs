//! The reclamation-scheme contract.
//!
//! Data structures in this workspace never free a shared node directly.
//! They unlink it, then hand it to a [`Reclaim`] implementation which
//! defers destruction until no protection slot anywhere still publishes
//! the node's address.

/// A safe memory reclamation scheme.
///
/// A scheme supplies three things:
///
/// - [`Header`](Reclaim::Header): per-node state the scheme needs, embedded
///   at offset 0 of every enrolled node (see [`Reclaimable`]),
/// - [`Slot`](Reclaim::Slot): the per-guard resource through which a thread
///   publishes the address it is currently observing,
/// - [`retire`](Reclaim::retire): acceptance of an unlinked node for
///   deferred destruction.
///
/// # Safety
///
/// Implementations must guarantee that a node passed to `retire` is not
/// destroyed while any [`Slot`] publishes its address, and that it is
/// destroyed exactly once afterwards (or intentionally never, for leaking
/// baselines).
pub unsafe trait Reclaim: Sized + 'static {
    /// Per-node enrollment state, embedded first in every node.
    type Header: Default + Send + Sync;

    /// Per-guard protection resource.
    type Slot: Slot;

    /// Hands an unlinked node to the scheme for deferred destruction.
    ///
    /// # Safety
    ///
    /// - `ptr` must come from `Box::into_raw` of a `T`,
    /// - `ptr` must no longer be reachable from any shared pointer,
    /// - `ptr` must not be retired more than once,
    /// - the caller must not access `*ptr` afterwards.
    unsafe fn retire<T: Reclaimable<Self>>(ptr: *mut T);

    /// Drives deferred reclamation on the calling thread, freeing every
    /// retired node whose address is no longer published by any slot.
    fn collect();
}

/// A protection slot: one published address per slot.
///
/// `publish` must be globally visible before any load the caller performs
/// afterwards (the validation read of the protocol); implementations
/// typically pair a sequentially consistent store with a fence. `clear`
/// withdraws the publication.
pub trait Slot: Default {
    /// Publishes `addr` as protected. Overwrites any previous publication.
    fn publish(&mut self, addr: usize);

    /// Withdraws the current publication.
    fn clear(&mut self);
}

/// Marker for node types enrolled with scheme `R`.
///
/// # Safety
///
/// Implementors must be `#[repr(C)]` with `R::Header` as their first field,
/// so the scheme can reach its per-node state by casting the node pointer.
pub unsafe trait Reclaimable<R: Reclaim>: Sized + 'static {}
