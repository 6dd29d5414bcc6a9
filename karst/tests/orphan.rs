// Runs alone in its own binary: the orphan hand-off below is only
// deterministic while no unrelated thread is scanning the same registry.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use karst::{Guard, Hazard, MarkedPtr, Reclaim, Reclaimable, RetiredNode};

#[repr(C)]
struct Tracked {
    retired: RetiredNode,
    drops: Arc<AtomicUsize>,
}

unsafe impl Reclaimable<Hazard> for Tracked {}

impl Drop for Tracked {
    fn drop(&mut self) {
        self.drops.fetch_add(1, Ordering::Relaxed);
    }
}

#[test]
fn exiting_thread_hands_off_pinned_garbage() {
    let drops = Arc::new(AtomicUsize::new(0));
    let n = Box::into_raw(Box::new(Tracked {
        retired: RetiredNode::new(),
        drops: drops.clone(),
    }));

    let mut guard: Guard<Tracked, Hazard> = Guard::new();
    // the node is private to this test, so an unvalidated pin is fine
    unsafe { guard.protect_unchecked(MarkedPtr::new(n, 0)) };

    // the other thread retires the node and exits while we still pin it;
    // its exit scan cannot free the node and must orphan it instead
    let addr = n as usize;
    thread::spawn(move || {
        let n = addr as *mut Tracked;
        unsafe { Hazard::retire(n) };
    })
    .join()
    .unwrap();
    assert_eq!(drops.load(Ordering::Relaxed), 0);

    // once the pin is gone, the next scanning thread adopts and frees it
    guard.reset();
    Hazard::collect();
    assert_eq!(drops.load(Ordering::Relaxed), 1);
}
