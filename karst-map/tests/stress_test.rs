use core::hash::{BuildHasher, Hasher};
use std::collections::HashSet;
use std::sync::{Arc, Barrier};
use std::thread;

use karst::{Hazard, SpinBackoff};
use karst_map::HashMap;
use rand::prelude::*;

#[derive(Default, Clone)]
struct IdentityState;

struct IdentityHasher(u64);

impl Hasher for IdentityHasher {
    fn finish(&self) -> u64 {
        self.0
    }
    fn write(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.0 = (self.0 << 8) | u64::from(b);
        }
    }
    fn write_u64(&mut self, n: u64) {
        self.0 = n;
    }
}

impl BuildHasher for IdentityState {
    type Hasher = IdentityHasher;
    fn build_hasher(&self) -> IdentityHasher {
        IdentityHasher(0)
    }
}

#[test]
#[cfg_attr(miri, ignore)]
fn racing_insert_and_erase_converges() {
    // one bucket so the whole map is a single contended list
    let map: Arc<HashMap<u64, u64, Hazard, 1, SpinBackoff, IdentityState>> =
        Arc::new(HashMap::new());

    let inserter = {
        let map = map.clone();
        thread::spawn(move || {
            for _ in 0..50 {
                for k in 1..100u64 {
                    map.insert(k, k);
                }
            }
        })
    };
    let eraser = {
        let map = map.clone();
        thread::spawn(move || {
            for _ in 0..50 {
                for k in 1..100u64 {
                    map.remove(&k);
                }
            }
        })
    };
    inserter.join().unwrap();
    eraser.join().unwrap();

    // quiescent now: the bucket list must be strictly ascending, and
    // contains() must agree with a full iteration for every key
    let keys: Vec<u64> = map.iter().map(|(k, _)| k).collect();
    assert!(keys.windows(2).all(|w| w[0] < w[1]), "bucket order violated");
    let set: HashSet<u64> = keys.iter().copied().collect();
    for k in 1..100u64 {
        assert_eq!(map.contains(&k), set.contains(&k));
    }
}

#[test]
#[cfg_attr(miri, ignore)]
fn same_key_race_has_one_winner() {
    const THREADS: u64 = 8;
    let map: Arc<HashMap<u64, u64, Hazard, 16>> = Arc::new(HashMap::new());
    let barrier = Arc::new(Barrier::new(THREADS as usize));

    let mut handles = Vec::new();
    for tid in 0..THREADS {
        let map = map.clone();
        let barrier = barrier.clone();
        handles.push(thread::spawn(move || {
            barrier.wait();
            map.insert(42, tid)
        }));
    }
    let results: Vec<bool> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert_eq!(results.iter().filter(|&&won| won).count(), 1);
    let winner = results.iter().position(|&won| won).unwrap() as u64;
    assert_eq!(map.find(&42).value().copied(), Some(winner));
}

#[test]
#[cfg_attr(miri, ignore)]
fn get_or_insert_race_agrees_on_one_value() {
    const THREADS: u64 = 8;
    let map: Arc<HashMap<u64, u64, Hazard, 16>> = Arc::new(HashMap::new());
    let barrier = Arc::new(Barrier::new(THREADS as usize));

    let mut handles = Vec::new();
    for tid in 0..THREADS {
        let map = map.clone();
        let barrier = barrier.clone();
        handles.push(thread::spawn(move || {
            barrier.wait();
            let (c, _) = map.get_or_insert(7, tid);
            c.value().copied().unwrap()
        }));
    }
    let seen: Vec<u64> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    let final_value = map.find(&7).value().copied().unwrap();
    for v in seen {
        assert_eq!(v, final_value, "every racer must observe the winner");
    }
}

#[test]
#[cfg_attr(miri, ignore)]
fn disjoint_concurrent_inserts_all_land() {
    const THREADS: u64 = 8;
    const PER_THREAD: u64 = 1_000;
    let map: Arc<HashMap<u64, u64, Hazard, 64>> = Arc::new(HashMap::new());

    let mut handles = Vec::new();
    for t in 0..THREADS {
        let map = map.clone();
        handles.push(thread::spawn(move || {
            let mut rng = rand::thread_rng();
            let mut keys: Vec<u64> = (0..PER_THREAD).map(|i| i * THREADS + t).collect();
            keys.shuffle(&mut rng);
            for k in keys {
                assert!(map.insert(k, k * 2));
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }

    for k in 0..THREADS * PER_THREAD {
        assert_eq!(map.find(&k).value().copied(), Some(k * 2));
    }
}

#[test]
#[cfg_attr(miri, ignore)]
fn concurrent_removal_empties_the_map() {
    const THREADS: u64 = 4;
    const PER_THREAD: u64 = 1_000;
    let map: Arc<HashMap<u64, u64, Hazard, 64>> = Arc::new(HashMap::new());
    for k in 0..THREADS * PER_THREAD {
        map.insert(k, k);
    }

    let mut handles = Vec::new();
    for t in 0..THREADS {
        let map = map.clone();
        handles.push(thread::spawn(move || {
            let mut rng = rand::thread_rng();
            let mut keys: Vec<u64> = (0..PER_THREAD).map(|i| i * THREADS + t).collect();
            keys.shuffle(&mut rng);
            for k in keys {
                assert!(map.remove(&k));
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }

    assert!(map.cursor().is_end());
}

#[test]
#[cfg_attr(miri, ignore)]
fn mixed_operations_stay_consistent() {
    const THREADS: u64 = 8;
    const PER_THREAD: u64 = 500;
    let map: Arc<HashMap<u64, u64, Hazard, 32>> = Arc::new(HashMap::new());

    let mut handles = Vec::new();
    for t in 0..THREADS {
        let map = map.clone();
        handles.push(thread::spawn(move || {
            for i in 0..PER_THREAD {
                let k = t * PER_THREAD + i;
                assert!(map.insert(k, k));
                assert!(map.contains(&k));
                if i % 3 == 0 {
                    assert!(map.remove(&k));
                }
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }

    for t in 0..THREADS {
        for i in 0..PER_THREAD {
            let k = t * PER_THREAD + i;
            assert_eq!(map.contains(&k), i % 3 != 0);
        }
    }
}

#[test]
#[cfg_attr(miri, ignore)]
fn readers_run_against_writers() {
    const KEYS: u64 = 1_000;
    let map: Arc<HashMap<u64, u64, Hazard, 64>> = Arc::new(HashMap::new());
    for k in 0..KEYS {
        map.insert(k, k * 2);
    }

    let mut handles = Vec::new();
    for _ in 0..6 {
        let map = map.clone();
        handles.push(thread::spawn(move || {
            for i in 0..10_000u64 {
                let k = i % KEYS;
                assert_eq!(map.find(&k).value().copied(), Some(k * 2));
            }
        }));
    }
    {
        let map = map.clone();
        handles.push(thread::spawn(move || {
            for k in KEYS..2 * KEYS {
                map.insert(k, k * 2);
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }
}
