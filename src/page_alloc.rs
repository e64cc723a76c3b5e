//! A per-CPU sharded allocator for fixed-size 4096-byte frames.
//!
//! Each shard owns a singly-linked free list whose nodes live inside the
//! free frames themselves — the same "inline freelist" trick the source
//! kernel's `kalloc.c`/`kalloc.rs` use, generalized here from one global
//! list to `ncpu` per-CPU lists with cross-shard stealing, per the sharded
//! design the source's `kalloc.c` already implements. `alloc`/`free` never
//! sleep; they only ever hold a [`SpinLock`].

use crate::cpu;
use crate::page::{Frame, PAGE_SIZE, POISON_FREE, POISON_FRESH};
use crate::param::PageAllocatorConfig;
use crate::spinlock::SpinLock;
use std::alloc::{alloc, dealloc, Layout};
use std::ptr::NonNull;

struct FreeNode {
    next: Option<NonNull<FreeNode>>,
}

struct Shard {
    free: Option<NonNull<FreeNode>>,
}

// SAFETY: `Shard::free` is only ever read or mutated while the owning
// `SpinLock` is held, so handing a `Shard` across threads inside that lock
// is sound even though it contains a raw pointer.
unsafe impl Send for Shard {}

/// Owns a fixed arena of pages and vends/reclaims them one at a time,
/// sharded per logical CPU to avoid cache-line contention on the hot path.
pub struct PageAllocator {
    shards: Vec<SpinLock<Shard>>,
    arena: NonNull<u8>,
    arena_layout: Layout,
    npages: usize,
}

// SAFETY: all mutable state lives behind `SpinLock`s; `arena` is only read
// for address-range checks and is never mutated through a shared reference
// outside of a poison write performed while the relevant shard lock is
// held.
unsafe impl Send for PageAllocator {}
unsafe impl Sync for PageAllocator {}

impl PageAllocator {
    /// Allocates an arena of `npages` pages and populates shard 0's free
    /// list with all of them, mirroring `kinit`/`freerange` walking
    /// `[kernel_end, PHYSTOP)` once at boot.
    pub fn new(npages: usize, config: PageAllocatorConfig) -> PageAllocator {
        assert!(config.ncpu > 0, "PageAllocator requires at least one shard");
        assert!(npages > 0, "PageAllocator requires at least one page");
        let layout = Layout::from_size_align(npages * PAGE_SIZE, PAGE_SIZE)
            .expect("page allocator arena layout");
        let arena = unsafe {
            let raw = alloc(layout);
            NonNull::new(raw).expect("page allocator arena allocation failed")
        };
        let shards: Vec<SpinLock<Shard>> = (0..config.ncpu)
            .map(|_| SpinLock::new("kmem", Shard { free: None }))
            .collect();
        let allocator = PageAllocator {
            shards,
            arena,
            arena_layout: layout,
            npages,
        };
        {
            let mut shard0 = allocator.shards[0].lock();
            for i in 0..npages {
                let page_ptr =
                    unsafe { NonNull::new_unchecked(arena.as_ptr().add(i * PAGE_SIZE)) };
                unsafe { Self::push_poisoned(&mut shard0, page_ptr) };
            }
        }
        log::debug!(
            "page_alloc: initialized {npages} pages across {} shards",
            config.ncpu
        );
        allocator
    }

    /// Number of shards (logical CPUs) this allocator was built with.
    pub fn ncpu(&self) -> usize {
        self.shards.len()
    }

    /// Total number of pages ever owned by this allocator.
    pub fn total_pages(&self) -> usize {
        self.npages
    }

    /// Number of free frames currently on `shard`'s list. For tests only;
    /// walking a free list under its own lock is O(n) and not meant for a
    /// hot path.
    pub fn shard_free_count(&self, shard: usize) -> usize {
        let guard = self.shards[shard].lock();
        let mut count = 0;
        let mut cur = guard.free;
        while let Some(node) = cur {
            count += 1;
            cur = unsafe { node.as_ref() }.next;
        }
        count
    }

    /// Sum of free frames across every shard, for checking P1 (page
    /// conservation) against the number of frames currently held by
    /// clients.
    pub fn total_free_count(&self) -> usize {
        (0..self.shards.len()).map(|i| self.shard_free_count(i)).sum()
    }

    /// Returns a page-aligned frame poisoned with [`POISON_FRESH`], or
    /// `None` if every shard is empty. Never panics on exhaustion — that is
    /// the caller's resource-exhaustion policy to decide, per §7.
    pub fn alloc(&self) -> Option<Frame> {
        let home = cpu::current();
        let mut home_guard = self.shards[home].lock();
        if let Some(frame) = Self::pop(&mut home_guard) {
            return Some(frame);
        }
        // Home shard is empty; keep its lock held while we search the
        // others so two harts racing on an empty home shard serialize
        // instead of both redundantly walking every other shard.
        for i in 0..self.shards.len() {
            if i == home {
                continue;
            }
            let mut other = self.shards[i].lock();
            if let Some(frame) = Self::pop(&mut other) {
                log::trace!("page_alloc: cpu {home} stole a frame from shard {i}");
                return Some(frame);
            }
        }
        log::warn!(
            "page_alloc: exhausted; cpu {home} and all {} shards are empty",
            self.shards.len()
        );
        None
    }

    /// Returns `frame` to the allocator, poisoning it with [`POISON_FREE`]
    /// and pushing it onto the *caller's current CPU's* shard — never the
    /// shard it originally came from.
    ///
    /// # Panics
    ///
    /// Panics if `frame` is not page-aligned or was not issued by this
    /// allocator's arena; both indicate heap corruption or a caller bug,
    /// which per §7 is fatal rather than recoverable.
    pub fn free(&self, frame: Frame) {
        let addr = frame.addr();
        assert_eq!(
            addr % PAGE_SIZE,
            0,
            "free: frame {addr:#x} is not page-aligned"
        );
        let start = self.arena.as_ptr() as usize;
        let end = start + self.npages * PAGE_SIZE;
        assert!(
            addr >= start && addr < end,
            "free: frame {addr:#x} was not issued by this allocator"
        );
        let home = cpu::current();
        let ptr = frame.into_raw();
        let mut shard = self.shards[home].lock();
        unsafe { Self::push_poisoned(&mut shard, ptr) };
        log::trace!("page_alloc: cpu {home} freed frame {addr:#x}");
    }

    fn pop(shard: &mut Shard) -> Option<Frame> {
        let node = shard.free.take()?;
        shard.free = unsafe { node.as_ref() }.next;
        let mut frame = unsafe { Frame::from_raw(node.cast()) };
        frame.fill(POISON_FRESH);
        Some(frame)
    }

    /// # Safety
    ///
    /// `ptr` must point to `PAGE_SIZE` writable bytes inside this
    /// allocator's arena that no other live `Frame` or free-list node
    /// currently references.
    unsafe fn push_poisoned(shard: &mut Shard, ptr: NonNull<u8>) {
        unsafe {
            std::ptr::write_bytes(ptr.as_ptr(), POISON_FREE, PAGE_SIZE);
            let node_ptr = ptr.cast::<FreeNode>();
            node_ptr.as_ptr().write(FreeNode { next: shard.free });
            shard.free = Some(node_ptr);
        }
    }
}

impl Drop for PageAllocator {
    fn drop(&mut self) {
        unsafe { dealloc(self.arena.as_ptr(), self.arena_layout) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allocator(npages: usize, ncpu: usize) -> PageAllocator {
        PageAllocator::new(npages, PageAllocatorConfig { ncpu })
    }

    #[test]
    fn alloc_is_poisoned_fresh() {
        cpu::bind(0);
        let a = allocator(4, 2);
        let frame = a.alloc().unwrap();
        assert!(frame.as_slice().iter().all(|&b| b == POISON_FRESH));
        cpu::unbind();
    }

    #[test]
    fn free_returns_to_current_cpu_not_origin() {
        cpu::bind(0);
        let a = allocator(4, 2);
        let frame = a.alloc().unwrap();
        assert_eq!(a.shard_free_count(0), 3);
        cpu::unbind();
        cpu::bind(1);
        a.free(frame);
        assert_eq!(a.shard_free_count(0), 3);
        assert_eq!(a.shard_free_count(1), 1);
        cpu::unbind();
    }

    /// §8 scenario 5: draining shard 0 and allocating on CPU 0 steals from
    /// shard 1, and a subsequent free on CPU 0 goes to shard 0 rather than
    /// back to shard 1.
    #[test]
    fn allocator_steal_across_shards() {
        let a = allocator(4, 2);

        // Move two of the four frames (all initially on shard 0) onto
        // shard 1 by allocating and freeing them while bound to CPU 1.
        cpu::bind(1);
        let f1 = a.alloc().unwrap();
        let f2 = a.alloc().unwrap();
        a.free(f1);
        a.free(f2);
        cpu::unbind();
        assert_eq!(a.shard_free_count(0), 2);
        assert_eq!(a.shard_free_count(1), 2);

        // Drain shard 0 from CPU 0.
        cpu::bind(0);
        let _d1 = a.alloc().unwrap();
        let _d2 = a.alloc().unwrap();
        assert_eq!(a.shard_free_count(0), 0);
        assert_eq!(a.shard_free_count(1), 2);

        let stolen = a.alloc().unwrap();
        assert_eq!(a.shard_free_count(0), 0, "steal must not touch the home shard's list");
        assert_eq!(a.shard_free_count(1), 1, "steal removes exactly one frame from the donor shard");

        a.free(stolen);
        assert_eq!(a.shard_free_count(0), 1, "freed frame must land on CPU 0's shard");
        assert_eq!(a.shard_free_count(1), 1);
        cpu::unbind();
    }

    /// §8 scenario 6: exhausting every shard returns `None`, never panics.
    #[test]
    fn allocator_exhaustion_returns_none() {
        cpu::bind(0);
        let a = allocator(2, 2);
        let frames: Vec<_> = std::iter::from_fn(|| a.alloc()).collect();
        assert_eq!(frames.len(), 2);
        assert!(a.alloc().is_none());
        cpu::unbind();
    }

    #[test]
    #[should_panic(expected = "is not page-aligned")]
    fn free_of_misaligned_frame_panics() {
        cpu::bind(0);
        let a = allocator(2, 1);
        let frame = a.alloc().unwrap();
        // Build a bogus unaligned frame pointing one byte into the arena.
        let addr = frame.addr() + 1;
        std::mem::forget(frame);
        let bogus = unsafe { Frame::from_raw(NonNull::new(addr as *mut u8).unwrap()) };
        a.free(bogus);
    }

    /// P1: conservation. Across a sequence of allocs/frees from several
    /// simulated harts, free pages plus held pages always equals the
    /// arena's total.
    #[test]
    fn p1_page_conservation_under_concurrency() {
        use std::sync::Arc;
        use std::thread;

        let npages = 64;
        let ncpu = 4;
        let a = Arc::new(allocator(npages, ncpu));
        let mut handles = Vec::new();
        for cpu_id in 0..ncpu {
            let a = Arc::clone(&a);
            handles.push(thread::spawn(move || {
                cpu::bind(cpu_id);
                let mut held = Vec::new();
                for round in 0..500 {
                    if round % 3 == 0 && !held.is_empty() {
                        let frame = held.pop().unwrap();
                        a.free(frame);
                    } else if let Some(frame) = a.alloc() {
                        held.push(frame);
                    }
                }
                for frame in held {
                    a.free(frame);
                }
                cpu::unbind();
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(a.total_free_count(), npages);
    }

    /// P2: uniqueness. No frame address is ever held by two callers at once,
    /// across several harts concurrently allocating and freeing. Every
    /// allocated address is recorded in a shared set at the moment it is
    /// handed out and removed at the moment it is freed; a duplicate insert
    /// would mean `alloc` handed out a frame that was already live
    /// elsewhere.
    #[test]
    fn p2_no_frame_is_ever_held_twice_under_concurrency() {
        use std::collections::HashSet;
        use std::sync::{Arc, Mutex};
        use std::thread;

        let npages = 32;
        let ncpu = 4;
        let a = Arc::new(allocator(npages, ncpu));
        let live: Arc<Mutex<HashSet<usize>>> = Arc::new(Mutex::new(HashSet::new()));
        let mut handles = Vec::new();
        for cpu_id in 0..ncpu {
            let a = Arc::clone(&a);
            let live = Arc::clone(&live);
            handles.push(thread::spawn(move || {
                cpu::bind(cpu_id);
                let mut held = Vec::new();
                for round in 0..500 {
                    if round % 3 == 0 && !held.is_empty() {
                        let (frame, addr): (Frame, usize) = held.pop().unwrap();
                        assert!(
                            live.lock().unwrap().remove(&addr),
                            "freed an address that was not recorded as live"
                        );
                        a.free(frame);
                    } else if let Some(frame) = a.alloc() {
                        let addr = frame.addr();
                        assert!(
                            live.lock().unwrap().insert(addr),
                            "alloc handed out frame {addr:#x} while it was already live elsewhere"
                        );
                        held.push((frame, addr));
                    }
                }
                for (frame, addr) in held {
                    live.lock().unwrap().remove(&addr);
                    a.free(frame);
                }
                cpu::unbind();
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert!(live.lock().unwrap().is_empty());
    }

    /// R3: `free(alloc())` restores the allocator to its prior abstract
    /// state, modulo which shard ends up holding the frame (freeing always
    /// targets the caller's current shard, not the frame's origin).
    #[test]
    fn r3_free_of_just_allocated_frame_restores_free_count() {
        cpu::bind(0);
        let a = allocator(8, 2);
        let before = a.total_free_count();
        let frame = a.alloc().unwrap();
        assert_eq!(a.total_free_count(), before - 1);
        a.free(frame);
        assert_eq!(a.total_free_count(), before);
        assert_eq!(a.shard_free_count(0), 8);
        cpu::unbind();
    }
}
