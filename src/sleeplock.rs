//! A lock whose waiters block rather than spin, for the slow, possibly
//! disk-bound critical sections the buffer cache serializes access around.
//! Generalizes the source kernel's `Sleeplock`, which parked waiters on the
//! scheduler's process-sleep/wakeup mechanism; here there is no process
//! table, so waiters park on a condition variable instead — the same shape
//! as the `pthread_mutex_t`/`pthread_cond_t` pair the kernel's own
//! user-space barrier demo uses for the analogous "wait for a condition,
//! don't spin" problem.

use parking_lot::{Condvar, Mutex};
use std::thread::{self, ThreadId};

struct State {
    locked: bool,
    holder: Option<ThreadId>,
}

pub struct Sleeplock {
    name: &'static str,
    state: Mutex<State>,
    cond: Condvar,
}

impl Sleeplock {
    pub fn new(name: &'static str) -> Sleeplock {
        Sleeplock {
            name,
            state: Mutex::new(State {
                locked: false,
                holder: None,
            }),
            cond: Condvar::new(),
        }
    }

    /// Blocks the calling thread until the lock is free, then takes it.
    pub fn acquire(&self) {
        let me = thread::current().id();
        let mut state = self.state.lock();
        assert_ne!(
            state.holder,
            Some(me),
            "nested sleep lock: {}",
            self.name
        );
        while state.locked {
            self.cond.wait(&mut state);
        }
        state.locked = true;
        state.holder = Some(me);
    }

    /// Releases the lock and wakes every thread parked waiting for it.
    ///
    /// # Panics
    ///
    /// Panics if the calling thread does not currently hold the lock — a
    /// protocol violation that the source kernel treats as fatal.
    pub fn release(&self) {
        let me = thread::current().id();
        let mut state = self.state.lock();
        assert_eq!(
            state.holder,
            Some(me),
            "unlocking unheld sleep lock: {}",
            self.name
        );
        state.locked = false;
        state.holder = None;
        self.cond.notify_all();
    }

    /// True if the calling thread currently holds the lock.
    pub fn holding(&self) -> bool {
        self.state.lock().holder == Some(thread::current().id())
    }
}
