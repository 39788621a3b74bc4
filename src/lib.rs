//! Spin-lock primitives and a concurrent hash map built on them.
//!
//! The crate ships two tightly coupled layers:
//!
//! - [`SpinLock`] / [`PtrSpinLock`]: configurable spin locks over a single
//!   atomic word, with a staged back-off discipline ([`Staged`]: CPU pause,
//!   then scheduler yield, then sleep) and a conditional acquisition that
//!   refuses to wait out a caller-chosen sentinel state. The pointer
//!   variant keeps the lock flag in bit 0 of a stored pointer.
//! - [`SpinMap`]: a bucketed concurrent map where lookups, insertions and
//!   erasures lock only the one bucket they touch, and a distinguished
//!   "rebuild" lock state lets structural changes (slot-vector growth,
//!   [`SpinMap::rehash`]) exclude readers without a table-wide lock.
//!
//! Locks here are for critical sections measured in nanoseconds: a handful
//! of compares and a possible vector write. Nothing is fair and nothing
//! times out.
//!
//! ```
//! use spinmap::SpinMap;
//!
//! let map: SpinMap<u64, &str> = SpinMap::new();
//! let (_, inserted) = map.emplace(1, "one");
//! assert!(inserted);
//! assert_eq!(map.get(&1), Some("one"));
//! assert_eq!(map.erase(&1), 1);
//! assert!(map.find(&1).is_none());
//! ```

pub mod backoff;
pub mod lock;
pub mod map;

pub use backoff::{NoBackoff, SpinPolicy, Stage, Staged};
pub use lock::{transact, transact_unless, PtrSpinLock, RawWord, SpinGuard, SpinLock};
pub use map::{Cursor, Iter, SpinMap};
