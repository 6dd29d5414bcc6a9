// Runs alone in its own binary: active_pins() reads the process-global
// registry, so unrelated concurrent tests would distort the counts.

use core::hash::{BuildHasher, Hasher};
use karst::{Hazard, SpinBackoff, active_pins};
use karst_map::HashMap;

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
fn cursor_holds_at_most_two_pins() {
    let map: HashMap<u64, u64, Hazard, 1, SpinBackoff, IdentityState> = HashMap::new();
    for k in [1u64, 2, 3] {
        map.insert(k, k);
    }
    assert_eq!(active_pins(), 0);

    // parked on the first entry: only the entry itself is pinned, the
    // predecessor link is the bucket head
    let mut c = map.cursor();
    assert_eq!(c.key().copied(), Some(1));
    assert_eq!(active_pins(), 1);

    // from the second entry on: entry plus predecessor
    c.advance();
    assert_eq!(c.key().copied(), Some(2));
    assert_eq!(active_pins(), 2);

    c.advance();
    assert_eq!(c.key().copied(), Some(3));
    assert_eq!(active_pins(), 2);

    c.advance();
    assert!(c.is_end());
    assert_eq!(active_pins(), 0, "an exhausted cursor pins nothing");

    let found = map.find(&2);
    assert!(active_pins() <= 2);
    drop(found);
    assert_eq!(active_pins(), 0);
}
