//! Per-hart CPU identity, hosted on top of OS threads.
//!
//! The source kernel reads "which CPU am I" out of a per-CPU register that
//! is set up once at boot and never changes for the lifetime of a hart. A
//! hosted test harness has no such register, so this module lets a test (or
//! an embedder) bind a logical CPU id to the *calling thread* once, with
//! [`bind`]; [`current`] then reads that binding back.
//!
//! [`PreemptGuard`] models the source's nest-countable `push_off`/`pop_off`
//! interrupt-disable pair: the source disables interrupts around the
//! id-read-then-shard-mutate sequence so a hart cannot migrate mid-sequence.
//! A hosted thread cannot migrate between logical CPU ids (the binding is
//! thread-local and sticky), so the guard's only real job here is to catch
//! a caller that forgets to balance enable/disable; an embedder with real
//! interrupts would wire this to `cli`/`sti`.

use std::cell::Cell;

thread_local! {
    static CPU_ID: Cell<Option<usize>> = const { Cell::new(None) };
    static NEST: Cell<u32> = const { Cell::new(0) };
}

/// Binds the calling thread to logical CPU `id` for the remainder of its
/// lifetime (or until [`unbind`] is called). Test harnesses call this once
/// per simulated hart before touching a [`crate::PageAllocator`].
pub fn bind(id: usize) {
    CPU_ID.with(|c| c.set(Some(id)));
}

/// Clears the calling thread's CPU binding.
pub fn unbind() {
    CPU_ID.with(|c| c.set(None));
}

/// An RAII nesting counter standing in for interrupt-disable/enable.
pub struct PreemptGuard {
    _private: (),
}

impl PreemptGuard {
    pub fn new() -> PreemptGuard {
        NEST.with(|n| n.set(n.get() + 1));
        PreemptGuard { _private: () }
    }
}

impl Default for PreemptGuard {
    fn default() -> Self {
        PreemptGuard::new()
    }
}

impl Drop for PreemptGuard {
    fn drop(&mut self) {
        NEST.with(|n| {
            let depth = n.get();
            assert!(depth > 0, "PreemptGuard popped more times than pushed");
            n.set(depth - 1);
        });
    }
}

/// The calling thread's bound CPU id.
///
/// # Panics
///
/// Panics if the calling thread was never [`bind`]-ed — mirroring the
/// source kernel's assumption that `mycpu()` is always well-formed once the
/// scheduler has started.
pub fn current() -> usize {
    let _guard = PreemptGuard::new();
    CPU_ID.with(|c| {
        c.get()
            .expect("current thread is not bound to a CPU id; call cpu::bind() first")
    })
}

/// Current interrupt-disable nesting depth, exposed for tests that want to
/// assert the guard is balanced.
pub fn nest_depth() -> u32 {
    NEST.with(|n| n.get())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_and_current_round_trip() {
        bind(3);
        assert_eq!(current(), 3);
        unbind();
    }

    #[test]
    fn preempt_guard_nests_and_unwinds() {
        assert_eq!(nest_depth(), 0);
        {
            let _a = PreemptGuard::new();
            assert_eq!(nest_depth(), 1);
            let _b = PreemptGuard::new();
            assert_eq!(nest_depth(), 2);
        }
        assert_eq!(nest_depth(), 0);
    }

    #[test]
    #[should_panic(expected = "not bound to a CPU id")]
    fn current_without_bind_panics() {
        let _ = current();
    }
}
