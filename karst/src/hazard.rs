//! Hazard-pointer reclamation.
//!
//! Protection side: a global, append-only registry of slot records. A
//! record is claimed when a guard needs a pin and recycled (never freed)
//! when the guard goes away. Publishing a pin is one `SeqCst` store plus a
//! fence; scanning reads every record once.
//!
//! Retirement side: each thread keeps an intrusive list of retired nodes
//! threaded through their embedded [`RetiredNode`] headers. Every
//! `SCAN_THRESHOLD` retirements the thread scans the registry and frees
//! whatever nobody publishes. A thread that exits with survivors hands
//! them to a global orphan list that the next scanning thread adopts.

use crate::reclaim::{Reclaim, Reclaimable, Slot};
use core::cell::Cell;
use core::ptr;
use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering, fence};
use once_cell::race::OnceBox;

/// Retirements between scans. Must stay small enough that tests observe
/// reclamation promptly and large enough to amortize the registry walk.
const SCAN_THRESHOLD: usize = 64;

/// Hazard-pointer reclamation scheme.
///
/// Use as the `R` parameter of guards and data structures. Nodes enroll by
/// embedding a [`RetiredNode`] as their first field (`#[repr(C)]`).
pub struct Hazard;

/// Type-erased destructor, set when the node is retired.
type DestructorFn = unsafe fn(*mut RetiredNode);

/// Per-node header for the [`Hazard`] scheme.
///
/// Lives at offset 0 of every enrolled node. Inert until the node is
/// retired; after that it threads the owning thread's retire list and
/// carries the node's destructor.
#[repr(C)]
pub struct RetiredNode {
    next: Cell<*mut RetiredNode>,
    destructor: Cell<Option<DestructorFn>>,
}

impl RetiredNode {
    /// Creates an inert header.
    pub const fn new() -> Self {
        Self {
            next: Cell::new(ptr::null_mut()),
            destructor: Cell::new(None),
        }
    }
}

impl Default for RetiredNode {
    fn default() -> Self {
        Self::new()
    }
}

// SAFETY: the cells are only touched by the retiring thread (after the node
// became unreachable) and by the single thread that later frees it; the
// hand-offs go through atomics in the registry.
unsafe impl Send for RetiredNode {}
unsafe impl Sync for RetiredNode {}

// ---------------------------------------------------------------------------
// Slot registry
// ---------------------------------------------------------------------------

struct SlotRecord {
    /// The published address; 0 when the slot protects nothing.
    addr: AtomicUsize,
    /// Claimed by a live guard.
    active: AtomicBool,
    /// Registry link; records are append-only and never deallocated.
    next: AtomicPtr<SlotRecord>,
}

struct Registry {
    head: AtomicPtr<SlotRecord>,
    /// Retired nodes abandoned by exited threads, adopted by the next scan.
    orphans: AtomicPtr<RetiredNode>,
}

static REGISTRY: OnceBox<Registry> = OnceBox::new();

fn registry() -> &'static Registry {
    REGISTRY.get_or_init(|| {
        Box::new(Registry {
            head: AtomicPtr::new(ptr::null_mut()),
            orphans: AtomicPtr::new(ptr::null_mut()),
        })
    })
}

/// Claims a free record or appends a fresh one.
fn acquire_record() -> &'static SlotRecord {
    let reg = registry();

    let mut p = reg.head.load(Ordering::Acquire);
    while !p.is_null() {
        // SAFETY: records are leaked, so every pointer in the registry is
        // valid forever
        let rec = unsafe { &*p };
        if !rec.active.load(Ordering::Relaxed)
            && rec
                .active
                .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
        {
            return rec;
        }
        p = rec.next.load(Ordering::Acquire);
    }

    let rec: &'static SlotRecord = Box::leak(Box::new(SlotRecord {
        addr: AtomicUsize::new(0),
        active: AtomicBool::new(true),
        next: AtomicPtr::new(ptr::null_mut()),
    }));
    let mut head = reg.head.load(Ordering::Relaxed);
    loop {
        rec.next.store(head, Ordering::Relaxed);
        match reg.head.compare_exchange_weak(
            head,
            ptr::from_ref(rec).cast_mut(),
            Ordering::Release,
            Ordering::Relaxed,
        ) {
            Ok(_) => return rec,
            Err(h) => head = h,
        }
    }
}

/// One claimed registry record; the [`Slot`] of the [`Hazard`] scheme.
///
/// The record is claimed lazily on the first publication, so empty guards
/// cost nothing.
#[derive(Default)]
pub struct HazardSlot {
    record: Option<&'static SlotRecord>,
}

impl Slot for HazardSlot {
    fn publish(&mut self, addr: usize) {
        let rec = match self.record {
            Some(rec) => rec,
            None => {
                let rec = acquire_record();
                self.record = Some(rec);
                rec
            }
        };
        rec.addr.store(addr, Ordering::SeqCst);
        // the publication must be ordered before the caller's validation
        // read; pairs with the fence in scan()
        fence(Ordering::SeqCst);
    }

    fn clear(&mut self) {
        if let Some(rec) = self.record {
            rec.addr.store(0, Ordering::Release);
        }
    }
}

impl Drop for HazardSlot {
    fn drop(&mut self) {
        if let Some(rec) = self.record {
            rec.addr.store(0, Ordering::Release);
            rec.active.store(false, Ordering::Release);
        }
    }
}

/// Number of registry slots currently publishing an address.
///
/// Diagnostic: lets tests check the pin budget of an operation (an
/// iterator holds at most two, a map operation at most four).
pub fn active_pins() -> usize {
    let mut n = 0;
    let mut p = registry().head.load(Ordering::Acquire);
    while !p.is_null() {
        // SAFETY: registry records are never deallocated
        let rec = unsafe { &*p };
        if rec.addr.load(Ordering::Acquire) != 0 {
            n += 1;
        }
        p = rec.next.load(Ordering::Acquire);
    }
    n
}

// ---------------------------------------------------------------------------
// Per-thread retirement
// ---------------------------------------------------------------------------

struct Handle {
    head: Cell<*mut RetiredNode>,
    count: Cell<usize>,
}

impl Handle {
    const fn new() -> Self {
        Self {
            head: Cell::new(ptr::null_mut()),
            count: Cell::new(0),
        }
    }

    /// # Safety
    ///
    /// `node` must be unreachable, unretired, and have its destructor set.
    unsafe fn retire(&self, node: *mut RetiredNode) {
        // SAFETY: the node is unreachable, so this thread owns its header
        unsafe { (*node).next.set(self.head.get()) };
        self.head.set(node);
        self.count.set(self.count.get() + 1);
        if self.count.get() >= SCAN_THRESHOLD {
            self.scan();
        }
    }

    /// Frees every retired node whose address no slot publishes.
    fn scan(&self) {
        let reg = registry();

        // adopt garbage abandoned by exited threads
        let orphan = reg.orphans.swap(ptr::null_mut(), Ordering::Acquire);
        if !orphan.is_null() {
            let mut tail = orphan;
            let mut adopted = 1;
            // SAFETY: the orphan chain was exclusively handed over by the swap
            unsafe {
                while !(*tail).next.get().is_null() {
                    tail = (*tail).next.get();
                    adopted += 1;
                }
                (*tail).next.set(self.head.get());
            }
            self.head.set(orphan);
            self.count.set(self.count.get() + adopted);
        }

        // pairs with the fence in HazardSlot::publish: a pin published
        // before this point is visible to the walk below
        fence(Ordering::SeqCst);

        let mut hazards: Vec<usize> = Vec::new();
        let mut p = reg.head.load(Ordering::Acquire);
        while !p.is_null() {
            // SAFETY: registry records are never deallocated
            let rec = unsafe { &*p };
            let a = rec.addr.load(Ordering::Acquire);
            if a != 0 {
                hazards.push(a);
            }
            p = rec.next.load(Ordering::Acquire);
        }
        hazards.sort_unstable();

        let mut kept: *mut RetiredNode = ptr::null_mut();
        let mut kept_count = 0;
        let mut cur = self.head.replace(ptr::null_mut());
        self.count.set(0);
        while !cur.is_null() {
            // SAFETY: every node on the list is unreachable and owned here
            let next = unsafe { (*cur).next.get() };
            if hazards.binary_search(&(cur as usize)).is_ok() {
                unsafe { (*cur).next.set(kept) };
                kept = cur;
                kept_count += 1;
            } else if let Some(destructor) = unsafe { (*cur).destructor.get() } {
                // SAFETY: unreachable, unpinned, destructor set at retire time
                unsafe { destructor(cur) };
            }
            cur = next;
        }

        // a destructor above may have retired again (a value dropping a
        // structure of its own); prepend the survivors instead of clobbering
        // whatever landed on the list meanwhile
        if !kept.is_null() {
            let mut tail = kept;
            // SAFETY: the kept chain is owned here
            unsafe {
                while !(*tail).next.get().is_null() {
                    tail = (*tail).next.get();
                }
                (*tail).next.set(self.head.get());
            }
            self.head.set(kept);
            self.count.set(self.count.get() + kept_count);
        }
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        self.scan();
        // survivors are still pinned somewhere; hand them to the orphan
        // list so another thread's scan frees them eventually
        let reg = registry();
        let mut cur = self.head.replace(ptr::null_mut());
        while !cur.is_null() {
            // SAFETY: the list is owned by this exiting thread
            let next = unsafe { (*cur).next.get() };
            let mut head = reg.orphans.load(Ordering::Relaxed);
            loop {
                unsafe { (*cur).next.set(head) };
                match reg.orphans.compare_exchange_weak(
                    head,
                    cur,
                    Ordering::Release,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => break,
                    Err(h) => head = h,
                }
            }
            cur = next;
        }
    }
}

std::thread_local! {
    static HANDLE: Handle = const { Handle::new() };
}

// SAFETY: a retired node is destroyed only after a scan proves no slot
// publishes it, and exactly one thread owns it from retirement to
// destruction.
unsafe impl Reclaim for Hazard {
    type Header = RetiredNode;
    type Slot = HazardSlot;

    unsafe fn retire<T: Reclaimable<Self>>(ptr: *mut T) {
        unsafe fn destructor<T>(node: *mut RetiredNode) {
            // SAFETY: the node was allocated as a Box<T> with the header at
            // offset 0, and this runs exactly once
            unsafe { drop(Box::from_raw(node.cast::<T>())) };
        }

        let node = ptr.cast::<RetiredNode>();
        // SAFETY: Reclaimable<Hazard> puts a RetiredNode at offset 0, and
        // the node is already unreachable
        unsafe { (*node).destructor.set(Some(destructor::<T>)) };
        // During thread teardown the handle may be gone; the node is then
        // leaked, which is safe.
        let _ = HANDLE.try_with(|h| unsafe { h.retire(node) });
    }

    fn collect() {
        let _ = HANDLE.try_with(|h| h.scan());
    }
}
