//! A bucketed concurrent hash map with per-bucket spin locks.
//!
//! Keys are hashed once, the hash is wrapped so zero never appears (zero
//! marks an empty slot), and the wrapped hash selects one of a fixed number
//! of buckets. Each bucket couples an 8-bit [`SpinLock`] with an atomic
//! occupancy hint and a vector of item slots; lookups and insertions only
//! contend on a single bucket. The bucket lock distinguishes an ordinary
//! hold (`1`) from a structural rebuild (`2`): ordinary operations refuse
//! to wait out a rebuild and instead retry their outer loop with a fresh
//! view, which is what lets a rebuild reallocate slot storage while finds
//! are in flight elsewhere.
//!
//! Reads hand out clones, never references into a bucket (the only way to
//! keep borrows out of critical sections). [`Cursor`] is the iteration
//! handle: increments are recorded lazily and realized under the bucket
//! lock at the next observation, and a cursor that outlives the bucket
//! array it was born against is detected and aborts the process.

use std::cell::{Cell, UnsafeCell};
use std::hash::{BuildHasher, Hash};
use std::io;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicPtr, AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;

use ahash::RandomState;

use crate::lock::{transact_unless, SpinLock};

// ================================================================================================
// CONSTANTS
// ================================================================================================

/// Bucket-lock state marking a structural rebuild of the bucket's slots.
/// Ordinary operations abandon their view and retry when they observe it.
const REBUILD: u8 = 2;

/// Bucket count used when none is requested.
const DEFAULT_BUCKETS: usize = 13;

/// Cursor offset meaning "before the first slot of the bucket".
const BEFORE_FIRST: usize = usize::MAX;

/// Hashes are stored in slots, where `0` means "empty"; a real hash of `0`
/// is remapped to all-ones to keep the sentinel unambiguous.
#[inline(always)]
fn wrap_hash(h: u64) -> u64 {
    if h == 0 {
        !0
    } else {
        h
    }
}

// ================================================================================================
// INTERNAL DATA STRUCTURES
// ================================================================================================

/// One item slot. Occupied iff `hash != 0`; the pair is only initialized
/// while occupied.
struct Slot<K, V> {
    hash: u64,
    entry: MaybeUninit<(K, V)>,
}

impl<K, V> Slot<K, V> {
    #[inline(always)]
    fn new(hash: u64, key: K, value: V) -> Self {
        debug_assert_ne!(hash, 0);
        Self {
            hash,
            entry: MaybeUninit::new((key, value)),
        }
    }

    #[inline(always)]
    fn is_occupied(&self) -> bool {
        self.hash != 0
    }

    /// Borrow the pair of an occupied slot.
    #[inline(always)]
    fn pair(&self) -> &(K, V) {
        debug_assert!(self.is_occupied());
        unsafe { self.entry.assume_init_ref() }
    }

    /// Move the pair out, tombstoning the slot.
    #[inline(always)]
    fn take(&mut self) -> (K, V) {
        debug_assert!(self.is_occupied());
        self.hash = 0;
        unsafe { self.entry.as_ptr().read() }
    }
}

impl<K, V> Drop for Slot<K, V> {
    fn drop(&mut self) {
        if self.is_occupied() {
            unsafe { self.entry.assume_init_drop() }
        }
    }
}

/// A bucket: lock, occupancy hint, and slot storage. `items` is only
/// touched while `lock` is held; `count` is readable without the lock and
/// is bumped with Release only after a slot's contents are in place.
struct Bucket<K, V> {
    lock: SpinLock<AtomicU8>,
    count: AtomicU32,
    items: UnsafeCell<Vec<Slot<K, V>>>,
}

// SAFETY: slot storage is coordinated through the bucket lock; pairs cross
// threads by being moved in under the lock and cloned out under the lock.
unsafe impl<K: Send, V: Send> Send for Bucket<K, V> {}
unsafe impl<K: Send + Sync, V: Send + Sync> Sync for Bucket<K, V> {}

impl<K, V> Bucket<K, V> {
    fn new() -> Self {
        Self {
            lock: SpinLock::new(),
            count: AtomicU32::new(0),
            items: UnsafeCell::new(Vec::new()),
        }
    }

    /// SAFETY: the caller must hold `lock` (in any state).
    #[inline(always)]
    unsafe fn items(&self) -> &Vec<Slot<K, V>> {
        &*self.items.get()
    }

    /// SAFETY: the caller must hold `lock` (in any state) and be its only
    /// accessor of `items` for the borrow's duration.
    #[allow(clippy::mut_from_ref)]
    #[inline(always)]
    unsafe fn items_mut(&self) -> &mut Vec<Slot<K, V>> {
        &mut *self.items.get()
    }
}

/// The swappable unit: hasher plus bucket array. Published through an
/// `AtomicPtr` so `swap` and `rehash` replace both at once. Every table a
/// map has ever pointed at is kept alive in that map's keepalive list, so
/// a reader that loaded the pointer just before a replacement still holds
/// valid memory no matter which map frees things first.
struct Table<K, V, S> {
    hash_builder: S,
    buckets: Box<[Bucket<K, V>]>,
}

impl<K, V, S> Table<K, V, S> {
    fn with_buckets(n: usize, hash_builder: S) -> Self {
        let buckets: Vec<Bucket<K, V>> = (0..n.max(1)).map(|_| Bucket::new()).collect();
        Self {
            hash_builder,
            buckets: buckets.into_boxed_slice(),
        }
    }

    #[inline(always)]
    fn bucket_index(&self, hash: u64) -> usize {
        (hash % self.buckets.len() as u64) as usize
    }
}

impl<K: Hash, V, S: BuildHasher> Table<K, V, S> {
    #[inline(always)]
    fn hash(&self, key: &K) -> u64 {
        wrap_hash(self.hash_builder.hash_one(key))
    }
}

// ================================================================================================
// MAP
// ================================================================================================

/// A concurrent hash map sharing work-free across threads through
/// per-bucket spin locks.
///
/// `emplace` never overwrites: inserting an existing key hands back a
/// cursor to the resident pair and `false`. Structural growth of a bucket
/// happens in the rebuild lock state, excluding every concurrent reader of
/// that bucket; everything else runs bucket-parallel. The bucket count is
/// fixed until an explicit [`rehash`](Self::rehash).
pub struct SpinMap<K, V, S = RandomState> {
    /// Always `Arc::as_ptr` of an entry in `keepalive`.
    table: AtomicPtr<Table<K, V, S>>,
    rehash_lock: SpinLock<AtomicU8>,
    max_load_factor: AtomicU32,
    /// Guarded by `rehash_lock`; the last entry is the current table.
    keepalive: UnsafeCell<Vec<Arc<Table<K, V, S>>>>,
}

// SAFETY: the table pointer and keepalive list are only touched under
// `rehash_lock`, every table the pointer ever held stays alive for the
// map's lifetime, and all slot access goes through bucket locks. Insertion
// moves `K`/`V` in from any thread holding `&self` and reads clone them
// out, hence the `Send + Sync` bounds for `Sync`.
unsafe impl<K: Send, V: Send, S: Send> Send for SpinMap<K, V, S> {}
unsafe impl<K: Send + Sync, V: Send + Sync, S: Sync> Sync for SpinMap<K, V, S> {}

impl<K: Eq + Hash, V> SpinMap<K, V, RandomState> {
    /// Create a map with the default bucket count and hasher.
    pub fn new() -> Self {
        Self::with_buckets(DEFAULT_BUCKETS)
    }

    /// Create a map with `n` buckets (clamped to at least one).
    pub fn with_buckets(n: usize) -> Self {
        Self::with_buckets_and_hasher(n, RandomState::new())
    }
}

impl<K: Eq + Hash, V, S: BuildHasher + Default> Default for SpinMap<K, V, S> {
    fn default() -> Self {
        Self::with_buckets_and_hasher(DEFAULT_BUCKETS, S::default())
    }
}

impl<K: Eq + Hash, V, S: BuildHasher> SpinMap<K, V, S> {
    /// Create a map with the default bucket count and the given hasher.
    pub fn with_hasher(hash_builder: S) -> Self {
        Self::with_buckets_and_hasher(DEFAULT_BUCKETS, hash_builder)
    }

    /// Create a map with `n` buckets (clamped to at least one) and the
    /// given hasher.
    pub fn with_buckets_and_hasher(n: usize, hash_builder: S) -> Self {
        let table = Arc::new(Table::with_buckets(n, hash_builder));
        let ptr = Arc::as_ptr(&table) as *mut Table<K, V, S>;
        Self {
            table: AtomicPtr::new(ptr),
            rehash_lock: SpinLock::new(),
            max_load_factor: AtomicU32::new(1.0f32.to_bits()),
            keepalive: UnsafeCell::new(vec![table]),
        }
    }

    #[inline(always)]
    fn current(&self) -> &Table<K, V, S> {
        // Valid even across a concurrent rehash or swap: the keepalive
        // list pins every table this pointer has ever held.
        unsafe { &*self.table.load(Ordering::Acquire) }
    }

    // ============================================================================================
    // PUBLIC API METHODS
    // ============================================================================================

    /// Number of occupied slots, summed from per-bucket hints.
    ///
    /// Best-effort snapshot; restarted whenever a bucket is observed mid
    /// rebuild, but not linearizable against concurrent mutators.
    pub fn len(&self) -> usize {
        loop {
            let table = self.current();
            let mut total = 0usize;
            let mut interrupted = false;
            for bucket in table.buckets.iter() {
                if bucket.lock.load(Ordering::Acquire) == REBUILD {
                    interrupted = true;
                    break;
                }
                total += bucket.count.load(Ordering::Acquire) as usize;
            }
            if !interrupted {
                return total;
            }
        }
    }

    /// Whether the map holds no items.
    pub fn is_empty(&self) -> bool {
        loop {
            let table = self.current();
            let mut interrupted = false;
            for bucket in table.buckets.iter() {
                if bucket.lock.load(Ordering::Acquire) == REBUILD {
                    interrupted = true;
                    break;
                }
                if bucket.count.load(Ordering::Acquire) != 0 {
                    return false;
                }
            }
            if !interrupted {
                return true;
            }
        }
    }

    /// Locate `key`, returning a cursor bound to its slot, or `None`.
    pub fn find(&self, key: &K) -> Option<Cursor<'_, K, V, S>> {
        loop {
            let table = self.current();
            let hash = table.hash(key);
            let idx = table.bucket_index(hash);
            let bucket = &table.buckets[idx];
            if bucket.count.load(Ordering::Acquire) == 0 {
                return None;
            }
            // A stored hash equal to the wrapped hash implies the slot is
            // occupied, so the key borrow below never touches an empty pair.
            let scanned = transact_unless(&bucket.lock, REBUILD, || {
                let items = unsafe { bucket.items() };
                items
                    .iter()
                    .position(|slot| slot.hash == hash && slot.pair().0 == *key)
            });
            match scanned {
                Some(offset) => return offset.map(|o| Cursor::at(self, table, idx, o)),
                None => continue, // bucket rebuilding; reload and retry
            }
        }
    }

    /// Clone out the value stored under `key`.
    pub fn get(&self, key: &K) -> Option<V>
    where
        V: Clone,
    {
        loop {
            let table = self.current();
            let hash = table.hash(key);
            let bucket = &table.buckets[table.bucket_index(hash)];
            if bucket.count.load(Ordering::Acquire) == 0 {
                return None;
            }
            let scanned = transact_unless(&bucket.lock, REBUILD, || {
                let items = unsafe { bucket.items() };
                items
                    .iter()
                    .find(|slot| slot.hash == hash && slot.pair().0 == *key)
                    .map(|slot| slot.pair().1.clone())
            });
            if let Some(value) = scanned {
                return value;
            }
        }
    }

    /// Whether `key` is present.
    pub fn contains_key(&self, key: &K) -> bool {
        self.find(key).is_some()
    }

    /// Insert a pair; equivalent to [`emplace`](Self::emplace).
    pub fn insert(&self, pair: (K, V)) -> (Cursor<'_, K, V, S>, bool) {
        self.emplace(pair.0, pair.1)
    }

    /// Insert `key → value` unless `key` is already present.
    ///
    /// Returns a cursor to the resident slot and whether an insertion
    /// happened; on `false` the supplied pair is dropped.
    pub fn emplace(&self, key: K, value: V) -> (Cursor<'_, K, V, S>, bool) {
        loop {
            let table = self.current();
            let hash = table.hash(&key);
            let idx = table.bucket_index(hash);
            let bucket = &table.buckets[idx];

            // Concurrent pre-scan for the key, top-down so the cache lines
            // it walks first are the ones find touches last.
            if bucket.count.load(Ordering::Acquire) > 0 {
                let scanned = transact_unless(&bucket.lock, REBUILD, || {
                    let items = unsafe { bucket.items() };
                    items
                        .iter()
                        .rposition(|slot| slot.hash == hash && slot.pair().0 == key)
                });
                match scanned {
                    None => continue, // bucket rebuilding; reload and retry
                    Some(Some(offset)) => return (Cursor::at(self, table, idx, offset), false),
                    Some(None) => {}
                }
            }

            // Escalate to the rebuild state for the write. The pre-scan ran
            // under a lock that has since been released, so rescan for a
            // racing duplicate before touching storage.
            if !bucket.lock.lock_unless(REBUILD) {
                continue;
            }
            bucket.lock.store(REBUILD, Ordering::Release);
            let items = unsafe { bucket.items_mut() };

            let mut empty_idx = None;
            let mut existing = None;
            for offset in (0..items.len()).rev() {
                let slot = &items[offset];
                if !slot.is_occupied() {
                    if empty_idx.is_none() {
                        empty_idx = Some(offset);
                    }
                } else if slot.hash == hash && slot.pair().0 == key {
                    existing = Some(offset);
                    break;
                }
            }

            let (offset, inserted) = match existing {
                Some(offset) => (offset, false),
                None => {
                    let offset = match empty_idx {
                        Some(empty) => {
                            items[empty] = Slot::new(hash, key, value);
                            empty
                        }
                        None => {
                            let cap = items.capacity();
                            if items.len() == cap {
                                items.reserve_exact(cap.max(1));
                            }
                            items.push(Slot::new(hash, key, value));
                            items.len() - 1
                        }
                    };
                    bucket.count.fetch_add(1, Ordering::Release);
                    (offset, true)
                }
            };
            bucket.lock.unlock();
            return (Cursor::at(self, table, idx, offset), inserted);
        }
    }

    /// Erase the slot a cursor points at, returning a cursor to the next
    /// occupied slot (lazily, as with any increment).
    ///
    /// A cursor whose bucket has entered a rebuild, or whose bucket array
    /// has been replaced, is stale: fatal.
    pub fn erase_at<'a>(&'a self, cursor: Cursor<'a, K, V, S>) -> Cursor<'a, K, V, S> {
        cursor.catch_up();
        if cursor.stale() {
            std::process::abort();
        }
        let table = cursor.table_ref();
        if cursor.bucket.get() >= table.buckets.len() {
            return cursor;
        }
        let bucket = &table.buckets[cursor.bucket.get()];
        if !bucket.lock.lock_unless(REBUILD) {
            std::process::abort();
        }
        bucket.lock.store(REBUILD, Ordering::Release);
        let items = unsafe { bucket.items_mut() };
        let offset = cursor.offset.get();
        let removed = if offset < items.len() && items[offset].is_occupied() {
            let pair = items[offset].take();
            while items.last().map_or(false, |slot| !slot.is_occupied()) {
                items.pop();
            }
            bucket.count.fetch_sub(1, Ordering::Release);
            Some(pair)
        } else {
            None
        };
        bucket.lock.unlock();
        match removed {
            Some(pair) => {
                // Pair destructors run here, after the lock is out of play.
                drop(pair);
                cursor.bump();
                cursor
            }
            None => Cursor::end_of(self, self.current()),
        }
    }

    /// Erase `key`, returning how many items were removed (0 or 1).
    pub fn erase(&self, key: &K) -> usize {
        loop {
            let table = self.current();
            let hash = table.hash(key);
            let bucket = &table.buckets[table.bucket_index(hash)];
            if bucket.count.load(Ordering::Acquire) == 0 {
                return 0;
            }
            if !bucket.lock.lock_unless(REBUILD) {
                continue;
            }
            let items = unsafe { bucket.items_mut() };
            match items
                .iter()
                .position(|slot| slot.hash == hash && slot.pair().0 == *key)
            {
                Some(offset) => {
                    bucket.lock.store(REBUILD, Ordering::Release);
                    let pair = items[offset].take();
                    while items.last().map_or(false, |slot| !slot.is_occupied()) {
                        items.pop();
                    }
                    bucket.count.fetch_sub(1, Ordering::Release);
                    bucket.lock.unlock();
                    drop(pair);
                    return 1;
                }
                None => {
                    bucket.lock.unlock();
                    return 0;
                }
            }
        }
    }

    /// Remove every item. Buckets are truncated one at a time; the pass
    /// restarts if any bucket is already mid rebuild.
    pub fn clear(&self) {
        'restart: loop {
            let table = self.current();
            for bucket in table.buckets.iter() {
                if !bucket.lock.lock_unless(REBUILD) {
                    continue 'restart;
                }
                bucket.lock.store(REBUILD, Ordering::Release);
                unsafe { bucket.items_mut() }.clear();
                bucket.count.store(0, Ordering::Release);
                bucket.lock.unlock();
            }
            return;
        }
    }

    /// Exchange contents (hasher and buckets travel together) with
    /// `other`. Cursors born before the swap are stale against their map.
    pub fn swap(&self, other: &Self) {
        if std::ptr::eq(self, other) {
            return;
        }
        // Address order makes the two-lock acquisition deadlock-free.
        let (first, second) = if (self as *const Self) < (other as *const Self) {
            (self, other)
        } else {
            (other, self)
        };
        first.rehash_lock.lock();
        second.rehash_lock.lock();
        // Each map pins the table it is about to receive: a straggler that
        // loaded the old pointer must stay valid regardless of which map
        // is dropped first.
        let mine = unsafe { (*self.keepalive.get()).last().unwrap().clone() };
        let theirs = unsafe { (*other.keepalive.get()).last().unwrap().clone() };
        let a = self.table.load(Ordering::Acquire);
        let b = other.table.load(Ordering::Acquire);
        unsafe { (*self.keepalive.get()).push(theirs) };
        unsafe { (*other.keepalive.get()).push(mine) };
        self.table.store(b, Ordering::Release);
        other.table.store(a, Ordering::Release);
        second.rehash_lock.unlock();
        first.rehash_lock.unlock();
    }

    /// Number of buckets.
    pub fn bucket_count(&self) -> usize {
        self.current().buckets.len()
    }

    /// Index of the bucket `key` maps to.
    pub fn bucket(&self, key: &K) -> usize {
        let table = self.current();
        table.bucket_index(table.hash(key))
    }

    /// Occupancy hint of bucket `n`.
    pub fn bucket_size(&self, n: usize) -> usize {
        self.current().buckets[n].count.load(Ordering::Acquire) as usize
    }

    /// Items per bucket, as currently observable.
    pub fn load_factor(&self) -> f32 {
        self.len() as f32 / self.bucket_count() as f32
    }

    /// The advisory load-factor ceiling (default 1.0).
    pub fn max_load_factor(&self) -> f32 {
        f32::from_bits(self.max_load_factor.load(Ordering::Relaxed))
    }

    /// Set the advisory load-factor ceiling. Only [`reserve`](Self::reserve)
    /// consults it; nothing rehashes automatically.
    pub fn set_max_load_factor(&self, m: f32) {
        self.max_load_factor.store(m.to_bits(), Ordering::Relaxed);
    }

    /// Resize to `n` buckets (clamped to at least one) and redistribute
    /// every item by its stored hash.
    ///
    /// Takes the rehash lock, freezes every bucket in the rebuild state,
    /// moves the slots into a fresh table and publishes it. The old table
    /// is retired with its locks still in the rebuild state, so operations
    /// that raced ahead with the old view retry and land on the new table;
    /// cursors from before the rehash become stale.
    pub fn rehash(&self, n: usize)
    where
        S: Clone,
    {
        let n = n.max(1);
        self.rehash_lock.lock();
        let old_ptr = self.table.load(Ordering::Acquire);
        let old = unsafe { &*old_ptr };
        for bucket in old.buckets.iter() {
            bucket.lock.lock_as(REBUILD);
        }

        let mut new_buckets: Vec<Bucket<K, V>> = (0..n).map(|_| Bucket::new()).collect();
        for bucket in old.buckets.iter() {
            let items = unsafe { bucket.items_mut() };
            for slot in items.drain(..) {
                if slot.is_occupied() {
                    let dest = &mut new_buckets[(slot.hash % n as u64) as usize];
                    dest.items.get_mut().push(slot);
                }
            }
        }
        for bucket in new_buckets.iter_mut() {
            *bucket.count.get_mut() = bucket.items.get_mut().len() as u32;
        }

        let table = Arc::new(Table {
            hash_builder: old.hash_builder.clone(),
            buckets: new_buckets.into_boxed_slice(),
        });
        let ptr = Arc::as_ptr(&table) as *mut Table<K, V, S>;
        // The old table's entry stays in the keepalive list: its buckets
        // remain frozen in the rebuild state, and stragglers that loaded
        // it retry until they observe the new pointer.
        unsafe { (*self.keepalive.get()).push(table) };
        self.table.store(ptr, Ordering::Release);
        self.rehash_lock.unlock();
    }

    /// Rehash so that `n` items fit under the max load factor.
    pub fn reserve(&self, n: usize)
    where
        S: Clone,
    {
        self.rehash((n as f32 / self.max_load_factor()).ceil() as usize);
    }

    /// The hasher in use (before sentinel wrapping).
    pub fn hasher(&self) -> &S {
        &self.current().hash_builder
    }

    /// Write one line per bucket: slot-vector length and occupancy hint.
    pub fn dump_buckets<W: io::Write>(&self, out: &mut W) -> io::Result<()> {
        let table = self.current();
        for (n, bucket) in table.buckets.iter().enumerate() {
            let size = transact_unless(&bucket.lock, REBUILD, || unsafe { bucket.items() }.len());
            match size {
                Some(size) => writeln!(
                    out,
                    "Bucket {}: size={} count={}",
                    n,
                    size,
                    bucket.count.load(Ordering::Acquire)
                )?,
                None => writeln!(out, "Bucket {}: rebuilding", n)?,
            }
        }
        Ok(())
    }

    /// A cursor positioned at the first occupied slot (realized lazily).
    pub fn cursor(&self) -> Cursor<'_, K, V, S> {
        Cursor::begin(self, self.current())
    }

    /// Iterate over clones of the stored pairs.
    ///
    /// Buckets are visited in order; concurrent mutation of not-yet-visited
    /// buckets may or may not be observed.
    pub fn iter(&self) -> Iter<'_, K, V, S>
    where
        K: Clone,
        V: Clone,
    {
        Iter {
            cursor: self.cursor(),
        }
    }
}

// ================================================================================================
// CURSOR
// ================================================================================================

/// A forward-only handle into the map, bound to the bucket array it was
/// born against.
///
/// [`advance`](Self::advance) only records a pending step; the walk to the
/// next occupied slot happens under the bucket lock at the next
/// [`get`](Self::get), [`at_end`](Self::at_end) or comparison. A cursor
/// observed against a replaced bucket array (after [`SpinMap::rehash`] or
/// [`SpinMap::swap`]) is stale, and dereferencing it aborts the process:
/// there is no safe continuation.
pub struct Cursor<'a, K, V, S = RandomState> {
    map: &'a SpinMap<K, V, S>,
    table: *const Table<K, V, S>,
    bucket: Cell<usize>,
    offset: Cell<usize>,
    pending: Cell<usize>,
}

impl<'a, K, V, S> Cursor<'a, K, V, S> {
    fn at(map: &'a SpinMap<K, V, S>, table: &Table<K, V, S>, bucket: usize, offset: usize) -> Self {
        Self {
            map,
            table,
            bucket: Cell::new(bucket),
            offset: Cell::new(offset),
            pending: Cell::new(0),
        }
    }

    fn begin(map: &'a SpinMap<K, V, S>, table: &Table<K, V, S>) -> Self {
        Self {
            map,
            table,
            bucket: Cell::new(0),
            offset: Cell::new(BEFORE_FIRST),
            pending: Cell::new(1),
        }
    }

    fn end_of(map: &'a SpinMap<K, V, S>, table: &Table<K, V, S>) -> Self {
        Self {
            map,
            table,
            bucket: Cell::new(table.buckets.len()),
            offset: Cell::new(BEFORE_FIRST),
            pending: Cell::new(0),
        }
    }

    #[inline(always)]
    fn table_ref(&self) -> &Table<K, V, S> {
        // The table outlives the cursor: the map's keepalive list pins it
        // for the map's lifetime, and the map outlives `'a`.
        unsafe { &*self.table }
    }

    #[inline]
    fn stale(&self) -> bool {
        !std::ptr::eq(self.map.table.load(Ordering::Acquire), self.table)
    }

    /// Realize pending increments: walk forward to the next occupied slot,
    /// bucket by bucket, under each bucket's lock.
    fn catch_up(&self) {
        let table = self.table_ref();
        let bucket_count = table.buckets.len();
        while self.pending.get() > 0 && self.bucket.get() < bucket_count {
            if self.stale() {
                std::process::abort();
            }
            let bucket = &table.buckets[self.bucket.get()];
            let entered = transact_unless(&bucket.lock, REBUILD, || {
                let items = unsafe { bucket.items() };
                let mut offset = self.offset.get();
                loop {
                    offset = offset.wrapping_add(1);
                    if offset >= items.len() {
                        break;
                    }
                    if items[offset].is_occupied() {
                        self.pending.set(self.pending.get() - 1);
                        if self.pending.get() == 0 {
                            break;
                        }
                    }
                }
                self.offset.set(offset);
                if self.pending.get() > 0 && offset >= items.len() {
                    // Bucket exhausted; spill into the next one.
                    self.bucket.set(self.bucket.get() + 1);
                    self.offset.set(BEFORE_FIRST);
                }
            });
            if entered.is_none() {
                // Rebuild under way; the stale check above decides next
                // iteration whether to retry or abort.
                continue;
            }
        }
    }

    /// Record one step; realized lazily.
    pub fn advance(&mut self) {
        self.bump();
    }

    #[inline]
    fn bump(&self) {
        if self.bucket.get() >= self.table_ref().buckets.len() {
            return;
        }
        self.pending.set(self.pending.get() + 1);
    }

    /// Whether the cursor (after catching up) is past the last slot.
    pub fn at_end(&self) -> bool {
        self.catch_up();
        self.bucket.get() >= self.table_ref().buckets.len()
    }

    /// Clone out the pair under the cursor.
    ///
    /// `None` at the end position, or when the slot was erased since the
    /// cursor last observed it. Aborts if the bucket array was replaced.
    pub fn get(&self) -> Option<(K, V)>
    where
        K: Clone,
        V: Clone,
    {
        self.catch_up();
        let table = self.table_ref();
        if self.bucket.get() >= table.buckets.len() {
            return None;
        }
        let bucket = &table.buckets[self.bucket.get()];
        loop {
            if self.stale() {
                std::process::abort();
            }
            let read = transact_unless(&bucket.lock, REBUILD, || {
                let items = unsafe { bucket.items() };
                let offset = self.offset.get();
                if offset < items.len() && items[offset].is_occupied() {
                    let pair = items[offset].pair();
                    Some((pair.0.clone(), pair.1.clone()))
                } else {
                    None
                }
            });
            if let Some(result) = read {
                return result;
            }
        }
    }
}

impl<K, V, S> Clone for Cursor<'_, K, V, S> {
    fn clone(&self) -> Self {
        Self {
            map: self.map,
            table: self.table,
            bucket: self.bucket.clone(),
            offset: self.offset.clone(),
            pending: self.pending.clone(),
        }
    }
}

impl<K, V, S> PartialEq for Cursor<'_, K, V, S> {
    /// Logical equality: both sides catch up first.
    fn eq(&self, other: &Self) -> bool {
        self.catch_up();
        other.catch_up();
        std::ptr::eq(self.table, other.table)
            && self.bucket.get() == other.bucket.get()
            && self.offset.get() == other.offset.get()
            && self.pending.get() == other.pending.get()
    }
}

/// Cloning iterator over a [`SpinMap`], driven by a [`Cursor`].
pub struct Iter<'a, K, V, S = RandomState> {
    cursor: Cursor<'a, K, V, S>,
}

impl<K: Clone, V: Clone, S> Iterator for Iter<'_, K, V, S> {
    type Item = (K, V);

    fn next(&mut self) -> Option<(K, V)> {
        let item = self.cursor.get()?;
        self.cursor.bump();
        Some(item)
    }
}
