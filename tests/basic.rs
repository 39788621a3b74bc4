use std::collections::HashMap;
use std::hash::{BuildHasher, Hasher};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use spinmap::SpinMap;

/// Identity hashing for `u64` keys, for tests that need to steer keys into
/// known buckets.
#[derive(Clone, Default)]
struct IdentityState;

struct IdentityHasher(u64);

impl Hasher for IdentityHasher {
    fn finish(&self) -> u64 {
        self.0
    }

    fn write(&mut self, _bytes: &[u8]) {
        unreachable!("identity hashing supports u64 keys only");
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

fn identity_map<V>(buckets: usize) -> SpinMap<u64, V, IdentityState> {
    SpinMap::with_buckets_and_hasher(buckets, IdentityState)
}

#[test]
fn insert_find_erase_roundtrip() {
    let m: SpinMap<u64, String, IdentityState> = identity_map(3);

    let (_, inserted) = m.emplace(0, "a".to_string());
    assert!(inserted);

    let cursor = m.find(&0).expect("key 0 must be present");
    assert_eq!(cursor.get(), Some((0, "a".to_string())));

    assert_eq!(m.erase(&0), 1);
    assert!(m.find(&0).is_none());
    assert!(m.is_empty());
}

#[test]
fn colliding_keys_share_a_bucket() {
    let m: SpinMap<u64, String, IdentityState> = identity_map(3);

    m.emplace(3, "x".to_string());
    m.emplace(6, "y".to_string());

    assert_eq!(m.bucket(&3), 0);
    assert_eq!(m.bucket(&6), 0);
    assert_eq!(m.len(), 2);
    assert_eq!(m.bucket_size(0), 2);

    assert_eq!(m.erase(&3), 1);
    assert_eq!(m.get(&6), Some("y".to_string()));
    assert_eq!(m.len(), 1);
}

#[test]
fn zero_hash_is_wrapped() {
    // Key 0 hashes to 0 under identity; the map must store it under the
    // all-ones hash and still find it.
    let m: SpinMap<u64, u32, IdentityState> = identity_map(3);

    let (_, inserted) = m.emplace(0, 7);
    assert!(inserted);
    assert_eq!(m.get(&0), Some(7));
    assert_eq!(m.bucket(&0), (u64::MAX % 3) as usize);
    assert_eq!(m.erase(&0), 1);
    assert_eq!(m.get(&0), None);
}

#[test]
fn emplace_does_not_overwrite() {
    let m: SpinMap<u64, &str> = SpinMap::new();

    let (_, first) = m.emplace(1, "x");
    let (cursor, second) = m.emplace(1, "y");
    assert!(first);
    assert!(!second);
    assert_eq!(cursor.get(), Some((1, "x")));
    assert_eq!(m.get(&1), Some("x"));
    assert_eq!(m.len(), 1);
}

#[test]
fn insert_takes_a_pair() {
    let m: SpinMap<u64, &str> = SpinMap::new();
    let (_, inserted) = m.insert((5, "five"));
    assert!(inserted);
    let (cursor, inserted) = m.insert((5, "cinq"));
    assert!(!inserted);
    assert_eq!(cursor.get(), Some((5, "five")));
}

#[test]
fn matches_sequential_reference() {
    let mut rng = StdRng::seed_from_u64(0x5eed);
    let m: SpinMap<u64, u64> = SpinMap::with_buckets(7);
    let mut reference: HashMap<u64, u64> = HashMap::new();

    for _ in 0..10_000 {
        let key = rng.gen_range(0..64u64);
        match rng.gen_range(0..4) {
            0 | 1 => {
                let val = rng.gen::<u64>();
                let should_insert = !reference.contains_key(&key);
                let (_, inserted) = m.emplace(key, val);
                assert_eq!(inserted, should_insert);
                reference.entry(key).or_insert(val);
            }
            2 => {
                let expected = usize::from(reference.remove(&key).is_some());
                assert_eq!(m.erase(&key), expected);
            }
            _ => {
                assert_eq!(m.get(&key), reference.get(&key).copied());
                assert_eq!(m.contains_key(&key), reference.contains_key(&key));
            }
        }
    }

    assert_eq!(m.len(), reference.len());
    let mut collected: Vec<(u64, u64)> = m.iter().collect();
    collected.sort_unstable();
    let mut expected: Vec<(u64, u64)> = reference.iter().map(|(k, v)| (*k, *v)).collect();
    expected.sort_unstable();
    assert_eq!(collected, expected);
}

#[test]
fn iteration_visits_every_pair() {
    let m: SpinMap<u64, u64> = SpinMap::with_buckets(8);
    for i in 0..50u64 {
        m.emplace(i, i * 2);
    }
    assert_eq!(m.len(), 50);

    let mut sum_keys = 0u64;
    let mut sum_vals = 0u64;
    for (k, v) in m.iter() {
        sum_keys += k;
        sum_vals += v;
    }
    assert_eq!(sum_keys, (0..50).sum());
    assert_eq!(sum_vals, (0..50).map(|i| i * 2).sum());
}

#[test]
fn clear_empties_every_bucket() {
    let m: SpinMap<u64, u64> = SpinMap::with_buckets(5);
    for i in 0..40u64 {
        m.emplace(i, i);
    }
    m.clear();
    assert_eq!(m.len(), 0);
    assert!(m.is_empty());
    assert!(m.iter().next().is_none());

    // Still usable afterwards.
    m.emplace(9, 9);
    assert_eq!(m.get(&9), Some(9));
}

#[test]
fn erased_slot_is_reused_before_append() {
    let m: SpinMap<u64, u64, IdentityState> = identity_map(1);
    m.emplace(1, 1);
    m.emplace(2, 2);
    m.emplace(3, 3);
    assert_eq!(m.erase(&2), 1);

    // The tombstone left in the middle must be recycled: the slot vector
    // stays at three entries.
    m.emplace(4, 4);
    let mut dump = Vec::new();
    m.dump_buckets(&mut dump).unwrap();
    assert_eq!(
        String::from_utf8(dump).unwrap(),
        "Bucket 0: size=3 count=3\n"
    );
    assert_eq!(m.get(&4), Some(4));
}

#[test]
fn erasing_the_tail_pops_trailing_slots() {
    let m: SpinMap<u64, u64, IdentityState> = identity_map(1);
    m.emplace(1, 1);
    m.emplace(2, 2);
    m.emplace(3, 3);
    assert_eq!(m.erase(&2), 1);
    assert_eq!(m.erase(&3), 1);

    // Popping the tail also sweeps the tombstone that preceded it.
    let mut dump = Vec::new();
    m.dump_buckets(&mut dump).unwrap();
    assert_eq!(
        String::from_utf8(dump).unwrap(),
        "Bucket 0: size=1 count=1\n"
    );
}

#[test]
fn erase_at_chains_to_the_next_slot() {
    let m: SpinMap<u64, u64, IdentityState> = identity_map(1);
    m.emplace(1, 10);
    m.emplace(2, 20);
    m.emplace(3, 30);

    let cursor = m.find(&1).unwrap();
    let next = m.erase_at(cursor);
    assert_eq!(next.get(), Some((2, 20)));
    assert_eq!(m.len(), 2);
    assert!(m.find(&1).is_none());

    let next = m.erase_at(next);
    assert_eq!(next.get(), Some((3, 30)));
    let next = m.erase_at(next);
    assert!(next.at_end());
    assert!(m.is_empty());
}

#[test]
fn cursor_equality_is_positional() {
    let m: SpinMap<u64, u64, IdentityState> = identity_map(1);
    m.emplace(1, 10);
    m.emplace(2, 20);

    let a = m.find(&1).unwrap();
    let b = m.find(&1).unwrap();
    assert!(a == b);

    let c = m.find(&2).unwrap();
    assert!(a != c);

    // A lazily advanced cursor catches up before comparing.
    let mut d = m.find(&1).unwrap();
    d.advance();
    assert!(d == c);
}

#[test]
fn begin_cursor_on_empty_map_is_end() {
    let m: SpinMap<u64, u64> = SpinMap::new();
    let cursor = m.cursor();
    assert!(cursor.at_end());
    assert_eq!(cursor.get(), None);
}

#[test]
fn rehash_redistributes_items() {
    let m: SpinMap<u64, u64> = SpinMap::with_buckets(3);
    for i in 0..50u64 {
        m.emplace(i, i + 100);
    }

    m.rehash(16);
    assert_eq!(m.bucket_count(), 16);
    assert_eq!(m.len(), 50);
    for i in 0..50u64 {
        assert_eq!(m.get(&i), Some(i + 100));
    }

    // Shrinking redistributes too.
    m.rehash(2);
    assert_eq!(m.bucket_count(), 2);
    assert_eq!(m.len(), 50);
    for i in 0..50u64 {
        assert_eq!(m.get(&i), Some(i + 100));
    }
}

#[test]
fn reserve_sizes_by_load_factor() {
    let m: SpinMap<u64, u64> = SpinMap::new();
    assert_eq!(m.bucket_count(), 13);
    assert!((m.max_load_factor() - 1.0).abs() < f32::EPSILON);

    m.reserve(100);
    assert_eq!(m.bucket_count(), 100);

    m.set_max_load_factor(0.5);
    m.reserve(100);
    assert_eq!(m.bucket_count(), 200);
}

#[test]
fn load_factor_tracks_occupancy() {
    let m: SpinMap<u64, u64> = SpinMap::with_buckets(4);
    for i in 0..8u64 {
        m.emplace(i, i);
    }
    assert!((m.load_factor() - 2.0).abs() < f32::EPSILON);
}

#[test]
fn swap_exchanges_contents() {
    let a: SpinMap<u64, &str> = SpinMap::with_buckets(3);
    let b: SpinMap<u64, &str> = SpinMap::with_buckets(7);
    a.emplace(1, "one");
    a.emplace(2, "two");
    b.emplace(10, "ten");

    a.swap(&b);

    assert_eq!(a.len(), 1);
    assert_eq!(a.get(&10), Some("ten"));
    assert_eq!(a.bucket_count(), 7);

    assert_eq!(b.len(), 2);
    assert_eq!(b.get(&1), Some("one"));
    assert_eq!(b.get(&2), Some("two"));
    assert_eq!(b.bucket_count(), 3);
}

#[test]
fn dump_buckets_prints_one_line_per_bucket() {
    let m: SpinMap<u64, u64> = SpinMap::with_buckets(4);
    m.emplace(1, 1);

    let mut dump = Vec::new();
    m.dump_buckets(&mut dump).unwrap();
    let text = String::from_utf8(dump).unwrap();
    assert_eq!(text.lines().count(), 4);
    assert!(text.starts_with("Bucket 0:"));
}

#[test]
fn values_drop_exactly_once() {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Counted(Arc<AtomicUsize>);
    impl Drop for Counted {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::Relaxed);
        }
    }

    let drops = Arc::new(AtomicUsize::new(0));
    {
        let m: SpinMap<u64, Counted> = SpinMap::with_buckets(3);
        for i in 0..10u64 {
            m.emplace(i, Counted(Arc::clone(&drops)));
        }
        // Rejected duplicate is dropped immediately.
        m.emplace(5, Counted(Arc::clone(&drops)));
        assert_eq!(drops.load(Ordering::Relaxed), 1);

        assert_eq!(m.erase(&3), 1);
        assert_eq!(drops.load(Ordering::Relaxed), 2);

        m.rehash(8);
        assert_eq!(drops.load(Ordering::Relaxed), 2, "rehash must move, not drop");
    }
    assert_eq!(drops.load(Ordering::Relaxed), 11);
}
