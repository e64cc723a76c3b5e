//! The monotonic tick counter the buffer cache uses for LRU ordering.
//!
//! The source kernel advances `ticks` from the timer interrupt handler
//! under `tickslock`, and wakes any thread parked on the address of
//! `ticks` (the primitive behind a `sleep(ms)` facility elsewhere in the
//! kernel). This crate has no timer interrupt, so something external —
//! a test, or an embedder's own clock thread — calls [`Ticks::tick`]
//! directly; the waking side is a condition variable rather than the
//! generic `wakeup(chan)` the source uses, since this crate does not model
//! arbitrary sleep channels, only this one.

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicU64, Ordering};

pub struct Ticks {
    value: AtomicU64,
    lock: Mutex<()>,
    cond: Condvar,
}

impl Ticks {
    pub fn new() -> Ticks {
        Ticks {
            value: AtomicU64::new(0),
            lock: Mutex::new(()),
            cond: Condvar::new(),
        }
    }

    /// Advances the clock by one tick and wakes anyone waiting on it.
    pub fn tick(&self) {
        let _guard = self.lock.lock();
        self.value.fetch_add(1, Ordering::SeqCst);
        self.cond.notify_all();
    }

    /// The current tick count. Callers tolerate a torn/stale read — it only
    /// perturbs LRU ordering, never correctness.
    pub fn read(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    /// Blocks the calling thread until the tick count reaches `target`.
    pub fn wait_until(&self, target: u64) {
        let mut guard = self.lock.lock();
        while self.value.load(Ordering::SeqCst) < target {
            self.cond.wait(&mut guard);
        }
    }
}

impl Default for Ticks {
    fn default() -> Self {
        Ticks::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn tick_is_monotonic() {
        let ticks = Ticks::new();
        assert_eq!(ticks.read(), 0);
        ticks.tick();
        ticks.tick();
        assert_eq!(ticks.read(), 2);
    }

    #[test]
    fn wait_until_wakes_on_tick() {
        let ticks = Arc::new(Ticks::new());
        let waiter = {
            let ticks = Arc::clone(&ticks);
            thread::spawn(move || ticks.wait_until(3))
        };
        for _ in 0..3 {
            thread::yield_now();
            ticks.tick();
        }
        waiter.join().unwrap();
        assert!(ticks.read() >= 3);
    }
}
