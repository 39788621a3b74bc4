//! Spin-based mutual exclusion over a single atomic word.
//!
//! [`SpinLock`] keeps its entire coordination protocol in one atomic word:
//! zero is free, one is an ordinary hold, and any other nonzero value is a
//! caller-defined sentinel state that conditional acquirers can refuse to
//! wait out (see [`SpinLock::lock_unless`]). [`PtrSpinLock`] is the variant
//! that folds the lock flag into bit 0 of a stored pointer, saving a word
//! in structures that already carry a pointer under a lock.
//!
//! Acquisition never writes while the word is observably held; contenders
//! re-read until the word looks free and only then attempt the CAS. All
//! waiting happens through a [`SpinPolicy`].

use std::marker::PhantomData;
use std::sync::atomic::{AtomicU32, AtomicU8, AtomicUsize, Ordering};

use crate::backoff::{SpinPolicy, Staged};

/// A machine-word-sized atomic usable as lock storage.
///
/// `UNLOCKED` must be the all-zeroes value and `LOCKED` the ordinary-hold
/// value; other nonzero values are free for sentinel states.
pub trait RawWord {
    type Value: Copy + Eq + std::fmt::Debug;

    const UNLOCKED: Self::Value;
    const LOCKED: Self::Value;

    fn new(v: Self::Value) -> Self;
    fn load(&self, order: Ordering) -> Self::Value;
    fn store(&self, val: Self::Value, order: Ordering);
    fn exchange(&self, val: Self::Value, order: Ordering) -> Self::Value;
    fn compare_exchange_weak(
        &self,
        current: Self::Value,
        new: Self::Value,
        success: Ordering,
        failure: Ordering,
    ) -> Result<Self::Value, Self::Value>;
}

macro_rules! impl_raw_word {
    ($($atomic:ty => $value:ty),* $(,)?) => {$(
        impl RawWord for $atomic {
            type Value = $value;

            const UNLOCKED: $value = 0;
            const LOCKED: $value = 1;

            #[inline(always)]
            fn new(v: $value) -> Self {
                <$atomic>::new(v)
            }

            #[inline(always)]
            fn load(&self, order: Ordering) -> $value {
                <$atomic>::load(self, order)
            }

            #[inline(always)]
            fn store(&self, val: $value, order: Ordering) {
                <$atomic>::store(self, val, order)
            }

            #[inline(always)]
            fn exchange(&self, val: $value, order: Ordering) -> $value {
                <$atomic>::swap(self, val, order)
            }

            #[inline(always)]
            fn compare_exchange_weak(
                &self,
                current: $value,
                new: $value,
                success: Ordering,
                failure: Ordering,
            ) -> Result<$value, $value> {
                <$atomic>::compare_exchange_weak(self, current, new, success, failure)
            }
        }
    )*};
}

impl_raw_word! {
    AtomicU8 => u8,
    AtomicU32 => u32,
    AtomicUsize => usize,
}

/// A configurable spin lock.
///
/// `W` selects the word width (8-bit suffices for a lock that only ever
/// holds small state values; pointer-width for general use) and `P` the
/// back-off discipline. Not reentrant; moving the lock moves ownership of
/// the word with it. There is no `Clone`.
pub struct SpinLock<W: RawWord = AtomicU8, P: SpinPolicy = Staged> {
    word: W,
    _policy: PhantomData<P>,
}

impl<W: RawWord, P: SpinPolicy> Default for SpinLock<W, P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<W: RawWord, P: SpinPolicy> SpinLock<W, P> {
    /// Create an unlocked lock.
    #[inline]
    pub fn new() -> Self {
        Self {
            word: W::new(W::UNLOCKED),
            _policy: PhantomData,
        }
    }

    /// Attempt a single acquisition.
    ///
    /// Performs a read-only load first and bails out on any nonzero value,
    /// so a contended `try_lock` issues no store and leaves the holder's
    /// cache line shared.
    #[inline]
    pub fn try_lock(&self) -> bool {
        if self.word.load(Ordering::Acquire) != W::UNLOCKED {
            return false;
        }
        self.word
            .compare_exchange_weak(W::UNLOCKED, W::LOCKED, Ordering::Acquire, Ordering::Acquire)
            .is_ok()
    }

    /// [`try_lock`](Self::try_lock), reporting the observed word on failure.
    ///
    /// On an early-out the value that blocked acquisition is written into
    /// `expected`, so the caller can react to which non-free state holds.
    #[inline]
    pub fn try_lock_expected(&self, expected: &mut W::Value) -> bool {
        let observed = self.word.load(Ordering::Acquire);
        if observed != W::UNLOCKED {
            *expected = observed;
            return false;
        }
        match self.word.compare_exchange_weak(
            W::UNLOCKED,
            W::LOCKED,
            Ordering::Acquire,
            Ordering::Acquire,
        ) {
            Ok(_) => true,
            Err(actual) => {
                *expected = actual;
                false
            }
        }
    }

    /// Acquire, spinning under the back-off policy until the word is won.
    #[inline]
    pub fn lock(&self) {
        let mut attempt = 0usize;
        loop {
            if self.try_lock() {
                return;
            }
            P::backoff(attempt);
            attempt = attempt.wrapping_add(1);
        }
    }

    /// Acquire unless the word currently equals `sentinel`.
    ///
    /// Returns true with the lock held, or false without acquiring as soon
    /// as `sentinel` is observed. Used by bucket operations to refuse to
    /// wait out a structural rebuild.
    #[inline]
    pub fn lock_unless(&self, sentinel: W::Value) -> bool {
        let mut attempt = 0usize;
        loop {
            let mut expected = W::UNLOCKED;
            if self.try_lock_expected(&mut expected) {
                return true;
            }
            if expected == sentinel {
                return false;
            }
            P::backoff(attempt);
            attempt = attempt.wrapping_add(1);
        }
    }

    /// Acquire by installing an arbitrary nonzero `state` instead of
    /// [`RawWord::LOCKED`]. Waits out any current holder.
    #[inline]
    pub fn lock_as(&self, state: W::Value) {
        debug_assert!(state != W::UNLOCKED);
        let mut attempt = 0usize;
        loop {
            if self.word.load(Ordering::Acquire) == W::UNLOCKED
                && self
                    .word
                    .compare_exchange_weak(
                        W::UNLOCKED,
                        state,
                        Ordering::Acquire,
                        Ordering::Acquire,
                    )
                    .is_ok()
            {
                return;
            }
            P::backoff(attempt);
            attempt = attempt.wrapping_add(1);
        }
    }

    /// Release the lock.
    #[inline]
    pub fn unlock(&self) {
        self.word.store(W::UNLOCKED, Ordering::Release);
    }

    /// Whether any holder (in any state) is present.
    #[inline]
    pub fn is_locked(&self) -> bool {
        self.word.load(Ordering::Acquire) != W::UNLOCKED
    }

    /// Raw read of the word.
    #[inline]
    pub fn load(&self, order: Ordering) -> W::Value {
        self.word.load(order)
    }

    /// Raw write of the word. Used for publishing sentinel states while
    /// the lock is held; writing while unheld forfeits mutual exclusion.
    #[inline]
    pub fn store(&self, val: W::Value, order: Ordering) {
        self.word.store(val, order);
    }

    /// Acquire and return a guard that unlocks on drop.
    #[inline]
    pub fn guard(&self) -> SpinGuard<'_, W, P> {
        self.lock();
        SpinGuard { lock: self }
    }

    /// Conditional form of [`guard`](Self::guard); `None` means the lock
    /// was observed in `sentinel` state and nothing was acquired.
    #[inline]
    pub fn guard_unless(&self, sentinel: W::Value) -> Option<SpinGuard<'_, W, P>> {
        if self.lock_unless(sentinel) {
            Some(SpinGuard { lock: self })
        } else {
            None
        }
    }
}

/// RAII hold on a [`SpinLock`]; releases on drop.
pub struct SpinGuard<'a, W: RawWord, P: SpinPolicy> {
    lock: &'a SpinLock<W, P>,
}

impl<W: RawWord, P: SpinPolicy> Drop for SpinGuard<'_, W, P> {
    #[inline]
    fn drop(&mut self) {
        self.lock.unlock();
    }
}

/// Run `body` inside an unconditional critical section over `lock`.
///
/// This is the scoped-section construct: a transactional-memory backend
/// would run `body` under a relaxed transaction whose read set covers the
/// lock word; the in-tree implementation is the scoped-lock fallback.
#[inline]
pub fn transact<W: RawWord, P: SpinPolicy, R>(
    lock: &SpinLock<W, P>,
    body: impl FnOnce() -> R,
) -> R {
    let _section = lock.guard();
    body()
}

/// Run `body` inside a critical section only if `lock` is not currently in
/// `sentinel` state; `None` means the section was vacated without running.
///
/// Either implementation strategy guarantees mutual exclusion against a
/// holder of `sentinel` on the same lock.
#[inline]
pub fn transact_unless<W: RawWord, P: SpinPolicy, R>(
    lock: &SpinLock<W, P>,
    sentinel: W::Value,
    body: impl FnOnce() -> R,
) -> Option<R> {
    let _section = lock.guard_unless(sentinel)?;
    Some(body())
}

/// Mask of the lock flag inside a [`PtrSpinLock`] word.
const PTR_LOCK_BIT: usize = 1;

/// A spin lock whose flag lives in bit 0 of a stored pointer.
///
/// Requires every stored pointer to be at least 2-aligned, which every
/// non-packed Rust object satisfies. `get` and `set` stay usable whether
/// or not the lock is held; `set` preserves the current lockedness.
pub struct PtrSpinLock<T, P: SpinPolicy = Staged> {
    word: AtomicUsize,
    _marker: PhantomData<(*mut T, P)>,
}

// SAFETY: the lock stores only the pointer value, never dereferences it;
// like `AtomicPtr`, sharing the word across threads is unconditionally fine.
unsafe impl<T, P: SpinPolicy> Send for PtrSpinLock<T, P> {}
unsafe impl<T, P: SpinPolicy> Sync for PtrSpinLock<T, P> {}

impl<T, P: SpinPolicy> Default for PtrSpinLock<T, P> {
    fn default() -> Self {
        Self::new(std::ptr::null_mut())
    }
}

impl<T, P: SpinPolicy> PtrSpinLock<T, P> {
    /// Create an unlocked lock holding `ptr`.
    #[inline]
    pub fn new(ptr: *mut T) -> Self {
        debug_assert_eq!(ptr as usize & PTR_LOCK_BIT, 0, "pointer must be 2-aligned");
        Self {
            word: AtomicUsize::new(ptr as usize),
            _marker: PhantomData,
        }
    }

    /// The stored pointer, with the lock flag masked off.
    #[inline]
    pub fn get(&self) -> *mut T {
        (self.word.load(Ordering::Acquire) & !PTR_LOCK_BIT) as *mut T
    }

    /// Replace the stored pointer, preserving the current lock flag.
    #[inline]
    pub fn set(&self, ptr: *mut T) {
        debug_assert_eq!(ptr as usize & PTR_LOCK_BIT, 0, "pointer must be 2-aligned");
        let mut current = self.word.load(Ordering::Acquire);
        loop {
            let desired = ptr as usize | (current & PTR_LOCK_BIT);
            match self.word.compare_exchange_weak(
                current,
                desired,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }

    /// Attempt a single acquisition; read-only on contention.
    #[inline]
    pub fn try_lock(&self) -> bool {
        let observed = self.word.load(Ordering::Acquire);
        if observed & PTR_LOCK_BIT != 0 {
            return false;
        }
        self.word
            .compare_exchange_weak(
                observed,
                observed | PTR_LOCK_BIT,
                Ordering::Acquire,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Acquire, spinning under the back-off policy.
    #[inline]
    pub fn lock(&self) {
        let mut attempt = 0usize;
        loop {
            if self.try_lock() {
                return;
            }
            P::backoff(attempt);
            attempt = attempt.wrapping_add(1);
        }
    }

    /// Release the lock.
    ///
    /// A bare store suffices: no competing writer may change the pointer
    /// portion while the lock is held. Unlocking an unheld lock is fatal.
    #[inline]
    pub fn unlock(&self) {
        let current = self.word.load(Ordering::Acquire);
        assert!(
            current & PTR_LOCK_BIT != 0,
            "unlock of an unheld PtrSpinLock"
        );
        self.word.store(current & !PTR_LOCK_BIT, Ordering::Release);
    }

    /// Whether the lock flag is currently set.
    #[inline]
    pub fn is_locked(&self) -> bool {
        self.word.load(Ordering::Acquire) & PTR_LOCK_BIT != 0
    }

    /// Raw read of the word, flag included.
    #[inline]
    pub fn load(&self, order: Ordering) -> *mut T {
        self.word.load(order) as *mut T
    }

    /// Raw write of the word, flag included.
    #[inline]
    pub fn store(&self, ptr: *mut T, order: Ordering) {
        self.word.store(ptr as usize, order);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::NoBackoff;
    use std::sync::atomic::AtomicUsize as StdAtomicUsize;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn mutual_exclusion_counter() {
        struct Shared {
            lock: SpinLock<AtomicU8>,
            value: std::cell::UnsafeCell<u64>,
        }
        // SAFETY: `value` is only touched between lock()/unlock().
        unsafe impl Sync for Shared {}

        let shared = Arc::new(Shared {
            lock: SpinLock::new(),
            value: std::cell::UnsafeCell::new(0),
        });

        let threads = 8;
        let iters = 10_000u64;
        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let s = Arc::clone(&shared);
                thread::spawn(move || {
                    for _ in 0..iters {
                        s.lock.lock();
                        unsafe { *s.value.get() += 1 };
                        s.lock.unlock();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(unsafe { *shared.value.get() }, threads as u64 * iters);
        assert!(!shared.lock.is_locked());
    }

    #[test]
    fn contended_try_lock_does_not_store() {
        let lock: SpinLock<AtomicU8, NoBackoff> = SpinLock::new();
        // Park the word in an arbitrary held state; failing try_locks must
        // leave it untouched bit-for-bit.
        lock.store(3, Ordering::Release);
        for _ in 0..1_000_000 {
            assert!(!lock.try_lock());
        }
        assert_eq!(lock.load(Ordering::Acquire), 3);
    }

    #[test]
    fn try_lock_expected_reports_observed_state() {
        let lock: SpinLock<AtomicU8> = SpinLock::new();
        lock.store(2, Ordering::Release);
        let mut expected = 0u8;
        assert!(!lock.try_lock_expected(&mut expected));
        assert_eq!(expected, 2);
    }

    #[test]
    fn lock_unless_refuses_sentinel() {
        let lock: SpinLock<AtomicU8> = SpinLock::new();
        lock.store(2, Ordering::Release);
        assert!(!lock.lock_unless(2));
        lock.store(0, Ordering::Release);
        assert!(lock.lock_unless(2));
        assert_eq!(lock.load(Ordering::Acquire), 1);
        lock.unlock();
    }

    #[test]
    fn lock_as_installs_state() {
        let lock: SpinLock<AtomicU8> = SpinLock::new();
        lock.lock_as(2);
        assert_eq!(lock.load(Ordering::Acquire), 2);
        assert!(!lock.try_lock());
        lock.unlock();
        assert!(lock.try_lock());
        lock.unlock();
    }

    #[test]
    fn guard_releases_on_drop() {
        let lock: SpinLock<AtomicUsize> = SpinLock::new();
        {
            let _g = lock.guard();
            assert!(lock.is_locked());
        }
        assert!(!lock.is_locked());
    }

    #[test]
    fn transact_unless_vacates() {
        let lock: SpinLock<AtomicU8> = SpinLock::new();
        lock.store(2, Ordering::Release);
        assert_eq!(transact_unless(&lock, 2, || 7), None);
        lock.store(0, Ordering::Release);
        assert_eq!(transact_unless(&lock, 2, || 7), Some(7));
        assert_eq!(transact(&lock, || 9), 9);
        assert!(!lock.is_locked());
    }

    #[test]
    fn policy_sees_escalating_attempts() {
        static MAX_ATTEMPT: StdAtomicUsize = StdAtomicUsize::new(0);
        struct Recording;
        impl crate::backoff::SpinPolicy for Recording {
            fn backoff(attempt: usize) -> bool {
                MAX_ATTEMPT.fetch_max(attempt, Ordering::Relaxed);
                thread::yield_now();
                true
            }
        }

        let lock: Arc<SpinLock<AtomicU8, Recording>> = Arc::new(SpinLock::new());
        lock.lock();
        let contender = {
            let lock = Arc::clone(&lock);
            thread::spawn(move || lock.lock())
        };
        while MAX_ATTEMPT.load(Ordering::Relaxed) < 64 {
            thread::yield_now();
        }
        lock.unlock();
        contender.join().unwrap();
        lock.unlock();
        assert!(MAX_ATTEMPT.load(Ordering::Relaxed) >= 64);
    }

    #[test]
    fn ptr_lock_roundtrip_preserves_pointer() {
        let a = Box::into_raw(Box::new(11u64));
        let b = Box::into_raw(Box::new(22u64));

        let lock: PtrSpinLock<u64> = PtrSpinLock::new(a);
        assert_eq!(lock.get(), a);

        assert!(lock.try_lock());
        assert_eq!(lock.get(), a);
        assert!(lock.is_locked());
        assert!(!lock.try_lock());

        // set() under the lock keeps the flag.
        lock.set(b);
        assert_eq!(lock.get(), b);
        assert!(lock.is_locked());

        lock.unlock();
        assert_eq!(lock.get(), b);
        assert!(!lock.is_locked());
        assert_eq!(lock.load(Ordering::Acquire) as usize, b as usize);

        unsafe {
            drop(Box::from_raw(a));
            drop(Box::from_raw(b));
        }
    }

    #[test]
    fn ptr_lock_set_while_unlocked() {
        let a = Box::into_raw(Box::new(5u32));
        let lock: PtrSpinLock<u32> = PtrSpinLock::new(std::ptr::null_mut());
        lock.set(a);
        assert_eq!(lock.get(), a);
        assert!(!lock.is_locked());
        unsafe { drop(Box::from_raw(a)) };
    }

    #[test]
    #[should_panic(expected = "unheld")]
    fn ptr_lock_double_unlock_is_fatal() {
        let lock: PtrSpinLock<u64> = PtrSpinLock::new(std::ptr::null_mut());
        lock.unlock();
    }
}
