//! A busy-waiting mutual-exclusion lock, for short critical sections that
//! must never block the caller's thread (shard free lists, bucket
//! metadata). Generalizes the source kernel's `Spinlock`/`SpinMutex` pair
//! into a single generic type, with a thread identity standing in for the
//! source's CPU identity in the reentrancy check.
//!
//! Per the lock-ordering rules this crate enforces, a sleep-lock is never
//! acquired while a `SpinLock` guard is alive, and a `SpinLock` is never
//! acquired while holding a sleep-lock.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::hash::{Hash, Hasher};
use std::hint;
use std::thread;

pub struct SpinLock<T: ?Sized> {
    name: &'static str,
    locked: AtomicBool,
    owner: AtomicU64,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Send for SpinLock<T> {}
unsafe impl<T: ?Sized + Send> Sync for SpinLock<T> {}

fn this_thread_as_u64() -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    thread::current().id().hash(&mut hasher);
    hasher.finish()
}

impl<T> SpinLock<T> {
    pub const fn new(name: &'static str, data: T) -> SpinLock<T> {
        SpinLock {
            name,
            locked: AtomicBool::new(false),
            owner: AtomicU64::new(0),
            data: UnsafeCell::new(data),
        }
    }
}

impl<T: ?Sized> SpinLock<T> {
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        let me = this_thread_as_u64();
        assert_ne!(
            self.owner.load(Ordering::Relaxed),
            me,
            "nested spin lock: {}",
            self.name
        );
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            hint::spin_loop();
        }
        self.owner.store(me, Ordering::Relaxed);
        SpinLockGuard { lock: self }
    }

    /// True if the calling thread currently holds this lock. Used at
    /// precondition-check sites that must panic rather than deadlock when a
    /// caller violates the locking protocol.
    pub fn holding(&self) -> bool {
        self.locked.load(Ordering::Relaxed) && self.owner.load(Ordering::Relaxed) == this_thread_as_u64()
    }

    fn raw_release(&self) {
        assert!(self.holding(), "unlocking unheld spin lock: {}", self.name);
        self.owner.store(0, Ordering::Relaxed);
        self.locked.store(false, Ordering::Release);
    }
}

pub struct SpinLockGuard<'a, T: ?Sized> {
    lock: &'a SpinLock<T>,
}

impl<'a, T: ?Sized> Deref for SpinLockGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<'a, T: ?Sized> DerefMut for SpinLockGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<'a, T: ?Sized> Drop for SpinLockGuard<'a, T> {
    fn drop(&mut self) {
        self.lock.raw_release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn excludes_concurrent_writers() {
        let lock = Arc::new(SpinLock::new("counter", 0_u64));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let lock = Arc::clone(&lock);
            handles.push(thread::spawn(move || {
                for _ in 0..1000 {
                    *lock.lock() += 1;
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*lock.lock(), 8000);
    }

    #[test]
    #[should_panic(expected = "unlocking unheld spin lock")]
    fn release_of_unheld_lock_panics() {
        let lock = SpinLock::new("x", ());
        lock.raw_release();
    }

    #[test]
    #[should_panic(expected = "nested spin lock")]
    fn self_deadlock_is_caught_instead_of_hanging() {
        let lock = SpinLock::new("x", ());
        let _first = lock.lock();
        let _second = lock.lock();
    }
}
