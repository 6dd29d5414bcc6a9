use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use karst::{Hazard, Reclaim};
use karst_map::HashMap;

/// A value whose drop is observable through a shared counter.
struct Payload {
    drops: Arc<AtomicUsize>,
}

impl Drop for Payload {
    fn drop(&mut self) {
        self.drops.fetch_add(1, Ordering::Relaxed);
    }
}

fn payload(drops: &Arc<AtomicUsize>) -> Payload {
    Payload {
        drops: drops.clone(),
    }
}

#[test]
fn removed_values_are_dropped_exactly_once() {
    const N: u64 = 1_000;
    let drops = Arc::new(AtomicUsize::new(0));
    let map: Arc<HashMap<u64, Payload, Hazard, 32>> = Arc::new(HashMap::new());

    // insert and erase on a separate thread: its exit scan must free every
    // retired node because nobody pins them
    {
        let map = map.clone();
        let drops = drops.clone();
        thread::spawn(move || {
            for k in 0..N {
                assert!(map.insert(k, payload(&drops)));
            }
            for k in 0..N {
                assert!(map.remove(&k));
            }
        })
        .join()
        .unwrap();
    }
    assert_eq!(drops.load(Ordering::Relaxed), N as usize);

    drop(map);
    assert_eq!(drops.load(Ordering::Relaxed), N as usize);
}

#[test]
fn dropping_the_map_frees_live_entries() {
    const N: u64 = 500;
    let drops = Arc::new(AtomicUsize::new(0));
    let map: HashMap<u64, Payload, Hazard, 32> = HashMap::new();
    for k in 0..N {
        map.insert(k, payload(&drops));
    }
    assert_eq!(drops.load(Ordering::Relaxed), 0);

    drop(map);
    assert_eq!(drops.load(Ordering::Relaxed), N as usize);
}

#[test]
fn value_survives_while_a_cursor_pins_it() {
    let drops = Arc::new(AtomicUsize::new(0));
    let map: HashMap<u64, Payload, Hazard, 8> = HashMap::new();
    map.insert(1, payload(&drops));

    let cursor = map.find(&1);
    assert!(!cursor.is_end());

    // the erase retires the node on this thread, but the cursor still pins it
    assert!(map.remove(&1));
    Hazard::collect();
    assert_eq!(drops.load(Ordering::Relaxed), 0, "pinned value freed early");
    // the erased entry stays readable through the pin
    assert!(cursor.value().is_some());

    drop(cursor);
    Hazard::collect();
    assert_eq!(drops.load(Ordering::Relaxed), 1);
}

#[test]
fn duplicate_insert_drops_only_the_new_value() {
    let drops = Arc::new(AtomicUsize::new(0));
    let map: HashMap<u64, Payload, Hazard, 8> = HashMap::new();

    assert!(map.insert(9, payload(&drops)));
    assert!(!map.insert(9, payload(&drops)));
    // the rejected node was destroyed on the spot; the resident one lives
    assert_eq!(drops.load(Ordering::Relaxed), 1);

    assert!(map.remove(&9));
    Hazard::collect();
    assert_eq!(drops.load(Ordering::Relaxed), 2);
}

#[test]
#[cfg_attr(miri, ignore)]
fn churn_reclaims_everything() {
    const THREADS: u64 = 4;
    const ROUNDS: u64 = 200;
    let drops = Arc::new(AtomicUsize::new(0));
    let map: Arc<HashMap<u64, Payload, Hazard, 16>> = Arc::new(HashMap::new());

    let mut handles = Vec::new();
    for t in 0..THREADS {
        let map = map.clone();
        let drops = drops.clone();
        handles.push(thread::spawn(move || {
            for r in 0..ROUNDS {
                let k = t * ROUNDS + r;
                assert!(map.insert(k, payload(&drops)));
                assert!(map.remove(&k));
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }

    // a worker that exited while one of its retired nodes was transiently
    // pinned has orphaned that node; this scan adopts any such leftovers
    Hazard::collect();

    // every inserted value was erased and no pins remain, so every payload
    // must have been dropped
    assert_eq!(
        drops.load(Ordering::Relaxed),
        (THREADS * ROUNDS) as usize
    );
    drop(map);
    assert_eq!(
        drops.load(Ordering::Relaxed),
        (THREADS * ROUNDS) as usize
    );
}
