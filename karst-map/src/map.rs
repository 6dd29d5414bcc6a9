//! Lock-free hash map over per-bucket ordered lists.
//!
//! The map is a fixed array of buckets; each bucket is a lock-free ordered
//! singly-linked list (Harris/Michael). Deletion is two-phase: a CAS sets
//! the mark bit on the victim's own `next` word (logical), then a CAS on
//! the predecessor link splices it out (physical). Every traversal helps:
//! a marked node found on the way is spliced out and retired before the
//! search continues.
//!
//! All operations are lock-free. Memory reclamation, pinning and backoff
//! are supplied by `karst`; the map is generic over all three.

use core::cmp;
use core::hash::{BuildHasher, Hash};
use core::marker::PhantomData;
use core::ptr;
use core::sync::atomic::Ordering;
use foldhash::fast::FixedState;
use karst::{Backoff, Guard, MarkedAtomic, MarkedPtr, Reclaim, Reclaimable, SpinBackoff};

/// List node. The scheme header must stay the first field (`#[repr(C)]`)
/// so retirement can reach it by pointer cast.
#[repr(C)]
struct Node<K, V, R: Reclaim> {
    header: R::Header,
    key: K,
    value: V,
    next: MarkedAtomic<Node<K, V, R>>,
}

// SAFETY: #[repr(C)] with R::Header first.
unsafe impl<K: 'static, V: 'static, R: Reclaim> Reclaimable<R> for Node<K, V, R> {}

impl<K, V, R: Reclaim> Node<K, V, R> {
    fn boxed(key: K, value: V) -> *mut Self {
        Box::into_raw(Box::new(Self {
            header: R::Header::default(),
            key,
            value,
            next: MarkedAtomic::null(),
        }))
    }
}

/// Traversal state threaded through a search and carried by cursors.
///
/// `prev` is the atomic word that reaches `cur` — a bucket head or some
/// node's `next` field. `save` pins the node owning `prev` so the word
/// stays valid; it is empty exactly when `prev` is a bucket head. `next`
/// is the latest unprotected load of `cur`'s `next` word.
struct FindInfo<K, V, R: Reclaim> {
    prev: *const MarkedAtomic<Node<K, V, R>>,
    next: MarkedPtr<Node<K, V, R>>,
    cur: Guard<Node<K, V, R>, R>,
    save: Guard<Node<K, V, R>, R>,
}

impl<K, V, R: Reclaim> FindInfo<K, V, R> {
    fn at(head: &MarkedAtomic<Node<K, V, R>>) -> Self {
        Self {
            prev: head,
            next: MarkedPtr::null(),
            cur: Guard::new(),
            save: Guard::new(),
        }
    }

    fn detached() -> Self {
        Self {
            prev: ptr::null(),
            next: MarkedPtr::null(),
            cur: Guard::new(),
            save: Guard::new(),
        }
    }
}

/// A lock-free hash map with a fixed number of buckets.
///
/// Keys are unique; inserting an existing key never overwrites. Every
/// operation is lock-free. The bucket count is a compile-time parameter
/// and the map never resizes.
///
/// Type parameters: key, value, reclamation scheme `R`, bucket count,
/// backoff strategy `B` (applied on CAS contention) and hash builder `S`.
///
/// A cursor or map operation holds at most two pins at a time (four for
/// erase); schemes with per-pin resources should provision accordingly.
pub struct HashMap<K, V, R: Reclaim, const BUCKETS: usize, B = SpinBackoff, S = FixedState> {
    buckets: Box<[MarkedAtomic<Node<K, V, R>>]>,
    hasher: S,
    _backoff: PhantomData<B>,
}

// SAFETY: all shared access goes through atomics; nodes may be dropped on
// any thread, hence Send bounds on K and V in both impls.
unsafe impl<K, V, R, const BUCKETS: usize, B, S> Send for HashMap<K, V, R, BUCKETS, B, S>
where
    K: Send,
    V: Send,
    R: Reclaim,
    S: Send,
{
}
unsafe impl<K, V, R, const BUCKETS: usize, B, S> Sync for HashMap<K, V, R, BUCKETS, B, S>
where
    K: Send + Sync,
    V: Send + Sync,
    R: Reclaim,
    S: Sync,
{
}

impl<K, V, R, const BUCKETS: usize, B, S> HashMap<K, V, R, BUCKETS, B, S>
where
    R: Reclaim,
    S: BuildHasher + Default,
{
    /// Creates an empty map with the default hasher.
    pub fn new() -> Self {
        Self::with_hasher(S::default())
    }
}

impl<K, V, R, const BUCKETS: usize, B, S> Default for HashMap<K, V, R, BUCKETS, B, S>
where
    R: Reclaim,
    S: BuildHasher + Default,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, R, const BUCKETS: usize, B, S> HashMap<K, V, R, BUCKETS, B, S>
where
    R: Reclaim,
    S: BuildHasher,
{
    /// Creates an empty map with the given hasher.
    pub fn with_hasher(hasher: S) -> Self {
        assert!(BUCKETS > 0, "bucket count must be non-zero");
        let mut buckets = Vec::with_capacity(BUCKETS);
        for _ in 0..BUCKETS {
            buckets.push(MarkedAtomic::null());
        }
        Self {
            buckets: buckets.into_boxed_slice(),
            hasher,
            _backoff: PhantomData,
        }
    }

    /// The hasher in use.
    pub fn hasher(&self) -> &S {
        &self.hasher
    }
}

impl<K, V, R, const BUCKETS: usize, B, S> HashMap<K, V, R, BUCKETS, B, S>
where
    K: Ord + Hash + Clone + 'static,
    V: 'static,
    R: Reclaim,
    B: Backoff,
    S: BuildHasher,
{
    #[inline]
    fn bucket_of(&self, key: &K) -> usize {
        (self.hasher.hash_one(key) as usize) % BUCKETS
    }

    /// Searches `bucket` for `key`, splicing out every marked node met on
    /// the way.
    ///
    /// Returns `true` with `cur` pinned on a live node whose key equals
    /// `key`, or `false` with `cur` empty (tail reached) or pinned on the
    /// first node with a greater key. Either way `prev`/`save` identify
    /// the predecessor position, so an insert can splice without
    /// re-walking.
    ///
    /// The search resumes from the position in `info`; if that node is
    /// itself being unlinked it falls back to the bucket head.
    fn search(&self, key: &K, bucket: usize, info: &mut FindInfo<K, V, R>, backoff: &mut B) -> bool {
        let head: *const MarkedAtomic<Node<K, V, R>> = &self.buckets[bucket];
        debug_assert!(
            (info.save.is_null() && ptr::eq(info.prev, head))
                || (!info.save.is_null()
                    && ptr::eq(info.prev, unsafe { &(*info.save.as_raw()).next }))
        );
        let mut start = info.prev;
        let mut start_guard = info.save.clone();

        'retry: loop {
            info.prev = start;
            info.save = start_guard.clone();
            info.next = unsafe { &*info.prev }.load(Ordering::Relaxed);
            if info.next.mark() != 0 {
                // the start node is being unlinked under us; its next word
                // no longer identifies a list position
                start = head;
                start_guard.reset();
                continue 'retry;
            }

            loop {
                if !info
                    .cur
                    .acquire_if_equal(unsafe { &*info.prev }, info.next, Ordering::Acquire)
                {
                    continue 'retry;
                }
                if info.cur.is_null() {
                    return false;
                }

                let cur = info.cur.as_raw();
                info.next = unsafe { &(*cur).next }.load(Ordering::Relaxed);
                if info.next.mark() != 0 {
                    // cur is logically deleted: splice it out. The successor
                    // must be re-read with acquire so the splice publishes a
                    // fully initialized link.
                    info.next = unsafe { &(*cur).next }.load(Ordering::Acquire).unmarked();
                    let expected = info.cur.get();
                    if unsafe { &*info.prev }
                        .compare_exchange_weak(
                            expected,
                            info.next,
                            Ordering::Release,
                            Ordering::Relaxed,
                        )
                        .is_err()
                    {
                        backoff.backoff();
                        continue 'retry;
                    }
                    // cur is unreachable now; the scheme frees it once the
                    // last pin is gone
                    unsafe { info.cur.reclaim() };
                } else {
                    // cur may have been cut out between the two loads above;
                    // advancing through a retargeted link would skip keys
                    if unsafe { &*info.prev }.load(Ordering::Relaxed) != info.cur.get() {
                        continue 'retry;
                    }
                    match unsafe { &(*cur).key }.cmp(key) {
                        cmp::Ordering::Less => {
                            info.prev = unsafe { &(*cur).next };
                            core::mem::swap(&mut info.save, &mut info.cur);
                        }
                        cmp::Ordering::Equal => return true,
                        cmp::Ordering::Greater => return false,
                    }
                }
            }
        }
    }

    /// Splices `node` in at the position left in `info` by a failed search,
    /// retrying the search on contention. Takes over ownership of `node`;
    /// frees it if the key shows up concurrently.
    fn install(
        &self,
        node: *mut Node<K, V, R>,
        bucket: usize,
        mut info: FindInfo<K, V, R>,
        mut backoff: B,
    ) -> (Cursor<'_, K, V, R, BUCKETS, B, S>, bool) {
        loop {
            let succ = info.cur.get();
            info.cur.reset();
            // pin the new node so the returned cursor survives an immediate
            // concurrent erase; safe, the node is not published yet
            unsafe { info.cur.protect_unchecked(MarkedPtr::new(node, 0)) };
            // the node must be fully initialized, successor link included,
            // before the release CAS publishes it
            unsafe { &(*node).next }.store(succ, Ordering::Relaxed);

            if unsafe { &*info.prev }
                .compare_exchange_weak(
                    succ,
                    MarkedPtr::new(node, 0),
                    Ordering::Release,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                return (
                    Cursor {
                        map: self,
                        bucket,
                        info,
                    },
                    true,
                );
            }

            backoff.backoff();
            if self.search(unsafe { &(*node).key }, bucket, &mut info, &mut backoff) {
                // lost the race to an equal key
                unsafe { drop(Box::from_raw(node)) };
                return (
                    Cursor {
                        map: self,
                        bucket,
                        info,
                    },
                    false,
                );
            }
        }
    }

    /// True if the map contains `key`.
    ///
    /// Linearizes at the validated pin of a live matching node (hit) or at
    /// the re-verified load that saw a greater key or the tail (miss).
    pub fn contains(&self, key: &K) -> bool {
        let bucket = self.bucket_of(key);
        let mut info = FindInfo::at(&self.buckets[bucket]);
        let mut backoff = B::default();
        self.search(key, bucket, &mut info, &mut backoff)
    }

    /// Returns a cursor on the entry for `key`, or an end cursor if there
    /// is none.
    pub fn find(&self, key: &K) -> Cursor<'_, K, V, R, BUCKETS, B, S> {
        let bucket = self.bucket_of(key);
        let mut info = FindInfo::at(&self.buckets[bucket]);
        let mut backoff = B::default();
        if self.search(key, bucket, &mut info, &mut backoff) {
            Cursor {
                map: self,
                bucket,
                info,
            }
        } else {
            self.end()
        }
    }

    /// Inserts `key → value` if the key is absent. Returns `true` if the
    /// entry was inserted; an existing entry is never overwritten.
    pub fn insert(&self, key: K, value: V) -> bool {
        self.insert_or_get(key, value).1
    }

    /// Inserts `key → value` if the key is absent. The node is built up
    /// front and dropped again on a duplicate. Returns a cursor on the
    /// inserted or already-present entry, and whether an insert happened.
    pub fn insert_or_get(&self, key: K, value: V) -> (Cursor<'_, K, V, R, BUCKETS, B, S>, bool) {
        let node = Node::<K, V, R>::boxed(key, value);
        let bucket = self.bucket_of(unsafe { &(*node).key });
        let mut info = FindInfo::at(&self.buckets[bucket]);
        let mut backoff = B::default();
        if self.search(unsafe { &(*node).key }, bucket, &mut info, &mut backoff) {
            unsafe { drop(Box::from_raw(node)) };
            return (
                Cursor {
                    map: self,
                    bucket,
                    info,
                },
                false,
            );
        }
        self.install(node, bucket, info, backoff)
    }

    /// Like [`insert_or_get`](Self::insert_or_get), but the node is only
    /// built after the first search misses.
    pub fn get_or_insert(&self, key: K, value: V) -> (Cursor<'_, K, V, R, BUCKETS, B, S>, bool) {
        self.get_or_insert_with(key, move || value)
    }

    /// Like [`get_or_insert`](Self::get_or_insert), with the value produced
    /// by `factory`. The factory runs at most once, and not at all when the
    /// first search already finds the key.
    pub fn get_or_insert_with<F>(
        &self,
        key: K,
        factory: F,
    ) -> (Cursor<'_, K, V, R, BUCKETS, B, S>, bool)
    where
        F: FnOnce() -> V,
    {
        let bucket = self.bucket_of(&key);
        let mut info = FindInfo::at(&self.buckets[bucket]);
        let mut backoff = B::default();
        if self.search(&key, bucket, &mut info, &mut backoff) {
            return (
                Cursor {
                    map: self,
                    bucket,
                    info,
                },
                false,
            );
        }
        let node = Node::<K, V, R>::boxed(key, factory());
        self.install(node, bucket, info, backoff)
    }

    /// Removes the entry for `key`. Returns `false` if there is none.
    ///
    /// Linearizes at the CAS that sets the mark bit. The node is
    /// physically unlinked before this returns, by this thread or — if it
    /// loses the splice race — by the rewalk this thread then performs.
    pub fn remove(&self, key: &K) -> bool {
        let bucket = self.bucket_of(key);
        let mut info = FindInfo::at(&self.buckets[bucket]);
        let mut backoff = B::default();

        loop {
            if !self.search(key, bucket, &mut info, &mut backoff) {
                return false;
            }
            let cur = info.cur.as_raw();
            // acquire on success: the mark joins the release sequence headed
            // by the CAS that installed this next value, so readers of the
            // spliced link below see it fully
            if unsafe { &(*cur).next }
                .compare_exchange_weak(
                    info.next,
                    info.next.with_mark(1),
                    Ordering::Acquire,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                break;
            }
            // lost the mark race; search again — it skips marked nodes, so a
            // hit is always a fresh live node
        }
        debug_assert_eq!(info.next.mark(), 0);

        let expected = info.cur.get();
        if unsafe { &*info.prev }
            .compare_exchange_weak(expected, info.next, Ordering::Release, Ordering::Relaxed)
            .is_ok()
        {
            unsafe { info.cur.reclaim() };
        } else {
            // another thread moved the predecessor; rewalk so the marked
            // node is unlinked before we return
            self.search(key, bucket, &mut info, &mut backoff);
        }
        true
    }

    /// Removes the entry under `pos` and returns a cursor past it.
    ///
    /// If this thread loses the physical splice to a competitor, the
    /// position is re-established by key; should the same key have been
    /// reinserted meanwhile, the returned cursor sits on the *new* node.
    ///
    /// # Panics
    ///
    /// Panics if `pos` is an end cursor.
    pub fn remove_at<'a>(
        &'a self,
        mut pos: Cursor<'a, K, V, R, BUCKETS, B, S>,
    ) -> Cursor<'a, K, V, R, BUCKETS, B, S> {
        debug_assert!(ptr::eq(pos.map, self));
        let cur = pos.info.cur.as_raw();
        assert!(!cur.is_null(), "remove_at on an end cursor");
        let mut backoff = B::default();

        let mut next = unsafe { &(*cur).next }.load(Ordering::Relaxed);
        while next.mark() == 0 {
            match unsafe { &(*cur).next }.compare_exchange_weak(
                next,
                next.with_mark(1),
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => {
                    next = actual;
                    backoff.backoff();
                }
            }
        }

        let mut next_guard: Guard<Node<K, V, R>, R> = Guard::new();
        // the successor can only be retired once cur is unlinked; while the
        // splice below can still succeed, cur is linked and the pin lands in
        // time. If cur was already unlinked the splice fails and the pin is
        // dropped without a dereference.
        unsafe { next_guard.protect_unchecked(next.unmarked()) };

        let expected = pos.info.cur.get();
        if unsafe { &*pos.info.prev }
            .compare_exchange_weak(expected, next.unmarked(), Ordering::Release, Ordering::Relaxed)
            .is_ok()
        {
            unsafe { pos.info.cur.reclaim() };
            pos.info.cur = next_guard;
        } else {
            next_guard.reset();
            let key = unsafe { (*cur).key.clone() };
            // rewalk to guarantee the marked node is unlinked before return
            self.search(&key, pos.bucket, &mut pos.info, &mut backoff);
        }

        if pos.info.cur.is_null() {
            pos.move_to_next_bucket();
        }
        pos
    }

    /// Returns a cursor on the first entry (first non-empty bucket), or an
    /// end cursor for an empty map.
    pub fn cursor(&self) -> Cursor<'_, K, V, R, BUCKETS, B, S> {
        let mut c = Cursor {
            map: self,
            bucket: 0,
            info: FindInfo::at(&self.buckets[0]),
        };
        c.info
            .cur
            .acquire(unsafe { &*c.info.prev }, Ordering::Acquire);
        if c.info.cur.is_null() {
            c.move_to_next_bucket();
        }
        c
    }

    /// The past-the-end cursor: empty, equal to every other exhausted
    /// cursor of this map.
    pub fn end(&self) -> Cursor<'_, K, V, R, BUCKETS, B, S> {
        Cursor {
            map: self,
            bucket: BUCKETS,
            info: FindInfo::detached(),
        }
    }

    /// An iterator yielding cloned `(key, value)` pairs.
    ///
    /// Weakly consistent: entries alive for the whole iteration are seen
    /// exactly once, entries inserted or removed concurrently may or may
    /// not be.
    pub fn iter(&self) -> Iter<'_, K, V, R, BUCKETS, B, S>
    where
        V: Clone,
    {
        Iter {
            cursor: self.cursor(),
        }
    }
}

impl<K, V, R, const BUCKETS: usize, B, S> Drop for HashMap<K, V, R, BUCKETS, B, S>
where
    R: Reclaim,
{
    /// Not concurrent: assumes no other thread still holds the map. Nodes
    /// still linked are freed directly, bypassing the scheme; nodes retired
    /// earlier stay with the scheme.
    fn drop(&mut self) {
        for bucket in self.buckets.iter() {
            let mut p = bucket.load(Ordering::Acquire);
            while !p.is_null() {
                let node = p.as_ptr();
                let next = unsafe { &(*node).next }.load(Ordering::Acquire);
                unsafe { drop(Box::from_raw(node)) };
                p = next;
            }
        }
        // free whatever this thread retired through earlier operations
        R::collect();
    }
}

/// A weakly consistent forward cursor.
///
/// Holds up to two pins: the entry it sits on and that entry's
/// predecessor. Stays valid across concurrent inserts and erases; erasing
/// the entry under the cursor makes the next [`advance`](Cursor::advance)
/// rescan from the predecessor, so `a == b` does not imply that advancing
/// both yields equal cursors again.
///
/// The end state is reached when every bucket is exhausted;
/// [`entry`](Cursor::entry) then returns `None`. Cursor equality is
/// identity of the entry under the cursor.
pub struct Cursor<'a, K, V, R: Reclaim, const BUCKETS: usize, B = SpinBackoff, S = FixedState> {
    map: &'a HashMap<K, V, R, BUCKETS, B, S>,
    bucket: usize,
    info: FindInfo<K, V, R>,
}

impl<'a, K, V, R, const BUCKETS: usize, B, S> Cursor<'a, K, V, R, BUCKETS, B, S>
where
    K: Ord + Hash + Clone + 'static,
    V: 'static,
    R: Reclaim,
    B: Backoff,
    S: BuildHasher,
{
    /// The key under the cursor, `None` at the end.
    pub fn key(&self) -> Option<&K> {
        // SAFETY: cur is pinned by this cursor
        unsafe { self.info.cur.as_ref() }.map(|n| &n.key)
    }

    /// The value under the cursor, `None` at the end.
    ///
    /// Shared reference only: in-place mutation requires interior
    /// mutability inside the value type.
    pub fn value(&self) -> Option<&V> {
        // SAFETY: cur is pinned by this cursor
        unsafe { self.info.cur.as_ref() }.map(|n| &n.value)
    }

    /// Key and value under the cursor, `None` at the end.
    pub fn entry(&self) -> Option<(&K, &V)> {
        // SAFETY: cur is pinned by this cursor
        unsafe { self.info.cur.as_ref() }.map(|n| (&n.key, &n.value))
    }

    /// True once the cursor moved past the last entry.
    pub fn is_end(&self) -> bool {
        self.info.cur.is_null()
    }

    /// Moves to the next entry.
    ///
    /// If the current entry was erased concurrently, the bucket is
    /// rescanned from the saved predecessor and the cursor lands on the
    /// first live entry with a key not below the erased one.
    ///
    /// # Panics
    ///
    /// Panics when called on an end cursor.
    pub fn advance(&mut self) {
        let cur = self.info.cur.as_raw();
        assert!(!cur.is_null(), "advance past the end of the map");

        let next = unsafe { &(*cur).next }.load(Ordering::Relaxed);
        let mut tmp: Guard<Node<K, V, R>, R> = Guard::new();
        if next.mark() == 0
            && tmp.acquire_if_equal(unsafe { &(*cur).next }, next, Ordering::Acquire)
        {
            self.info.prev = unsafe { &(*cur).next };
            core::mem::swap(&mut self.info.save, &mut self.info.cur);
            self.info.cur = tmp;
        } else {
            // the entry under the cursor is being erased; rescan from the
            // saved predecessor
            let key = unsafe { (*cur).key.clone() };
            let mut backoff = B::default();
            self.map
                .search(&key, self.bucket, &mut self.info, &mut backoff);
        }
        debug_assert!(
            ptr::eq(self.info.prev, &self.map.buckets[self.bucket])
                || self.info.cur.is_null()
                || (!self.info.save.is_null()
                    && ptr::eq(self.info.prev, unsafe {
                        &(*self.info.save.as_raw()).next
                    }))
        );

        if self.info.cur.is_null() {
            self.move_to_next_bucket();
        }
    }

    fn move_to_next_bucket(&mut self) {
        self.info.save.reset();
        while self.info.cur.is_null() && self.bucket + 1 < BUCKETS {
            self.bucket += 1;
            self.info.prev = &self.map.buckets[self.bucket];
            self.info
                .cur
                .acquire(unsafe { &*self.info.prev }, Ordering::Acquire);
        }
    }
}

impl<K, V, R, const BUCKETS: usize, B, S> PartialEq for Cursor<'_, K, V, R, BUCKETS, B, S>
where
    R: Reclaim,
{
    /// Identity of the entry under the cursor; all end cursors are equal.
    fn eq(&self, other: &Self) -> bool {
        self.info.cur.as_raw() == other.info.cur.as_raw()
    }
}

impl<K, V, R, const BUCKETS: usize, B, S> Eq for Cursor<'_, K, V, R, BUCKETS, B, S> where R: Reclaim {}

/// Iterator over cloned `(key, value)` pairs; see
/// [`HashMap::iter`].
pub struct Iter<'a, K, V, R: Reclaim, const BUCKETS: usize, B = SpinBackoff, S = FixedState> {
    cursor: Cursor<'a, K, V, R, BUCKETS, B, S>,
}

impl<K, V, R, const BUCKETS: usize, B, S> Iterator for Iter<'_, K, V, R, BUCKETS, B, S>
where
    K: Ord + Hash + Clone + 'static,
    V: Clone + 'static,
    R: Reclaim,
    B: Backoff,
    S: BuildHasher,
{
    type Item = (K, V);

    fn next(&mut self) -> Option<(K, V)> {
        let (k, v) = self.cursor.entry()?;
        let item = (k.clone(), v.clone());
        self.cursor.advance();
        Some(item)
    }
}

impl<'a, K, V, R, const BUCKETS: usize, B, S> IntoIterator for &'a HashMap<K, V, R, BUCKETS, B, S>
where
    K: Ord + Hash + Clone + 'static,
    V: Clone + 'static,
    R: Reclaim,
    B: Backoff,
    S: BuildHasher,
{
    type Item = (K, V);
    type IntoIter = Iter<'a, K, V, R, BUCKETS, B, S>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
