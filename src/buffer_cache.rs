//! A hash-bucketed cache of fixed-size disk blocks, generalizing the source
//! kernel's `bio.rs`/`bio.c` from a single global bucket array with
//! intrusive circular lists to the same bucket-per-hash, steal-on-miss
//! design backed by plain `Vec`s (see §9's design notes on why an arena of
//! indices replaces the intrusive list).
//!
//! A `Buffer`'s heavy payload lives in a stable arena slot that never moves;
//! only its lightweight [`BufMeta`] — the bit that bucket-lock code actually
//! touches — migrates between buckets on eviction and steal.

use crate::disk::DiskDriver;
use crate::error::Error;
use crate::param::BufferCacheConfig;
use crate::sleeplock::Sleeplock;
use crate::spinlock::SpinLock;
use crate::ticks::Ticks;
use bitflags::bitflags;
use std::cell::UnsafeCell;
use std::sync::Arc;

bitflags! {
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    struct BufFlags: u8 {
        const VALID = 1 << 0;
    }
}

/// The metadata a bucket's spin-lock actually guards: everything needed to
/// find, rank, and re-home a cached block, but none of its payload.
struct BufMeta {
    /// Stable index into `BufferCache::bufs`; never changes once assigned.
    index: usize,
    device: u32,
    blockno: u64,
    refcnt: u32,
    lastuse: u64,
}

struct Bucket {
    entries: SpinLock<Vec<BufMeta>>,
}

impl Bucket {
    fn new() -> Bucket {
        Bucket {
            entries: SpinLock::new("bcache.bucket", Vec::new()),
        }
    }
}

struct BufferInner {
    flags: BufFlags,
    data: Vec<u8>,
}

/// One arena slot: a sleep-lock guarding a payload, independent of whichever
/// bucket currently claims this slot's metadata.
struct Buffer {
    sleep: Sleeplock,
    inner: UnsafeCell<BufferInner>,
}

// SAFETY: `inner` is mutated in exactly two situations, both of which give
// the mutator exclusive access: (1) while the owning bucket's spin-lock is
// held during victim re-initialization, at which point P4 guarantees no
// other thread holds this slot's sleep-lock or has refcnt>0 on it; (2) while
// this thread holds the slot's sleep-lock, which by construction excludes
// every other accessor.
unsafe impl Sync for Buffer {}

impl Buffer {
    fn new(bsize: usize) -> Buffer {
        Buffer {
            sleep: Sleeplock::new("buffer"),
            inner: UnsafeCell::new(BufferInner {
                flags: BufFlags::empty(),
                data: vec![0u8; bsize],
            }),
        }
    }

    /// # Safety
    ///
    /// The caller must hold either this slot's bucket lock (with no
    /// outstanding sleep-lock holder, per P4) or this slot's sleep-lock.
    unsafe fn inner_mut(&self) -> &mut BufferInner {
        unsafe { &mut *self.inner.get() }
    }
}

/// A handle to a locked [`Buffer`], returned by [`BufferCache::get`] and
/// [`BufferCache::read`]. The sleep-lock it represents is released by an
/// explicit call to [`BufferCache::release`], mirroring the source kernel's
/// `brelse` rather than an RAII guard — the public contract exposes release
/// as a deliberate step so a caller can `pin` a handle across a longer
/// operation before giving it up.
pub struct BufHandle<'a> {
    cache: &'a BufferCache,
    index: usize,
    device: u32,
    blockno: u64,
}

impl<'a> BufHandle<'a> {
    pub fn device(&self) -> u32 {
        self.device
    }

    pub fn blockno(&self) -> u64 {
        self.blockno
    }

    /// The block's payload. Panics if the calling thread does not hold this
    /// handle's sleep-lock.
    pub fn data(&self) -> &[u8] {
        let buf = &self.cache.bufs[self.index];
        assert!(
            buf.sleep.holding(),
            "BufHandle::data: caller does not hold the sleep lock"
        );
        unsafe { &buf.inner_mut().data }
    }

    /// The block's payload, mutably. Panics if the calling thread does not
    /// hold this handle's sleep-lock.
    pub fn data_mut(&mut self) -> &mut [u8] {
        let buf = &self.cache.bufs[self.index];
        assert!(
            buf.sleep.holding(),
            "BufHandle::data_mut: caller does not hold the sleep lock"
        );
        unsafe { &mut buf.inner_mut().data }
    }
}

/// A fixed pool of `nbuf` cached blocks, sharded into `nbucket` hash buckets
/// by block number, each with its own spin-lock.
pub struct BufferCache {
    buckets: Vec<Bucket>,
    bufs: Vec<Buffer>,
    disk: Arc<dyn DiskDriver>,
    ticks: Arc<Ticks>,
}

impl BufferCache {
    /// Preallocates `config.nbuf` buffers, all initially linked into
    /// bucket 0 with `refcnt=0`, matching the source kernel's `binit`.
    pub fn new(
        disk: Arc<dyn DiskDriver>,
        ticks: Arc<Ticks>,
        config: BufferCacheConfig,
    ) -> Result<BufferCache, Error> {
        if config.nbuf < 2 {
            return Err(Error::Config("BufferCache requires at least two buffers"));
        }
        if config.nbucket == 0 {
            return Err(Error::Config("BufferCache requires at least one bucket"));
        }
        let bufs: Vec<Buffer> = (0..config.nbuf).map(|_| Buffer::new(config.bsize)).collect();
        let buckets: Vec<Bucket> = (0..config.nbucket).map(|_| Bucket::new()).collect();
        {
            let mut first = buckets[0].entries.lock();
            for index in 0..config.nbuf {
                first.push(BufMeta {
                    index,
                    device: 0,
                    blockno: 0,
                    refcnt: 0,
                    lastuse: 0,
                });
            }
        }
        log::debug!(
            "buffer_cache: initialized {} buffers across {} buckets",
            config.nbuf,
            config.nbucket
        );
        Ok(BufferCache {
            buckets,
            bufs,
            disk,
            ticks,
        })
    }

    /// Number of hash buckets this cache was built with.
    pub fn nbucket(&self) -> usize {
        self.buckets.len()
    }

    /// Number of cached-block slots this cache was built with.
    pub fn nbuf(&self) -> usize {
        self.bufs.len()
    }

    fn hash(&self, blockno: u64) -> usize {
        (blockno % self.buckets.len() as u64) as usize
    }

    /// Finds-or-allocates a Buffer for `(device, blockno)` and returns it
    /// with its sleep-lock held, without touching the disk. The lower-level
    /// primitive behind [`BufferCache::read`].
    ///
    /// # Panics
    ///
    /// Panics if every bucket is exhausted of idle victims — the cache is
    /// undersized for the workload, which per the error taxonomy is a fatal
    /// misconfiguration rather than a recoverable condition.
    pub fn get(&self, device: u32, blockno: u64) -> BufHandle<'_> {
        let home = self.hash(blockno);
        let mut entries = self.buckets[home].entries.lock();

        if let Some(pos) = entries
            .iter()
            .position(|e| e.device == device && e.blockno == blockno)
        {
            entries[pos].refcnt += 1;
            let index = entries[pos].index;
            drop(entries);
            self.bufs[index].sleep.acquire();
            return self.make_handle(index, device, blockno);
        }

        if let Some(pos) = Self::pick_victim(&entries) {
            let index = entries[pos].index;
            entries[pos].device = device;
            entries[pos].blockno = blockno;
            entries[pos].refcnt = 1;
            drop(entries);
            self.reset_buffer(index);
            self.bufs[index].sleep.acquire();
            log::debug!(
                "buffer_cache: reused idle buffer {index} in bucket {home} for ({device}, {blockno})"
            );
            return self.make_handle(index, device, blockno);
        }

        drop(entries);
        self.steal(home, device, blockno)
    }

    fn steal(&self, home: usize, device: u32, blockno: u64) -> BufHandle<'_> {
        for candidate in 0..self.buckets.len() {
            if candidate == home {
                continue;
            }
            let stolen = {
                let mut entries = self.buckets[candidate].entries.lock();
                Self::pick_victim(&entries).map(|pos| entries.remove(pos))
            };
            let Some(mut meta) = stolen else {
                continue;
            };

            // Re-lock the home bucket and re-scan for the key before
            // inserting the stolen slot, closing the race window described
            // in §4.2 step 4 and §9: another hart may have inserted this
            // exact key into the home bucket while we were scanning the
            // candidate bucket.
            let mut home_entries = self.buckets[home].entries.lock();
            if let Some(pos) = home_entries
                .iter()
                .position(|e| e.device == device && e.blockno == blockno)
            {
                log::debug!(
                    "buffer_cache: steal for ({device}, {blockno}) raced with a concurrent \
                     insert of the same key into bucket {home}; returning the stolen slot to \
                     bucket {candidate} and using the existing entry instead"
                );
                self.buckets[candidate].entries.lock().push(meta);
                home_entries[pos].refcnt += 1;
                let index = home_entries[pos].index;
                drop(home_entries);
                self.bufs[index].sleep.acquire();
                return self.make_handle(index, device, blockno);
            }

            let index = meta.index;
            meta.device = device;
            meta.blockno = blockno;
            meta.refcnt = 1;
            home_entries.push(meta);
            drop(home_entries);
            self.reset_buffer(index);
            self.bufs[index].sleep.acquire();
            log::debug!(
                "buffer_cache: stole buffer {index} from bucket {candidate} into bucket {home} \
                 for ({device}, {blockno})"
            );
            return self.make_handle(index, device, blockno);
        }

        panic!(
            "buffer_cache: no buffers available for ({device}, {blockno}); the cache is \
             undersized for this workload"
        );
    }

    /// Like [`BufferCache::get`], but guarantees the returned handle's
    /// payload reflects the on-disk contents, issuing a disk read if the
    /// slot was not already valid.
    pub fn read(&self, device: u32, blockno: u64) -> Result<BufHandle<'_>, Error> {
        let handle = self.get(device, blockno);
        let buf = &self.bufs[handle.index];
        let needs_fill = !unsafe { buf.inner_mut() }.flags.contains(BufFlags::VALID);
        if needs_fill {
            let inner = unsafe { buf.inner_mut() };
            self.disk.read_block(device, blockno, &mut inner.data)?;
            inner.flags.insert(BufFlags::VALID);
        }
        Ok(handle)
    }

    /// Synchronously writes a handle's payload to disk.
    ///
    /// # Panics
    ///
    /// Panics if the calling thread does not hold `handle`'s sleep-lock.
    pub fn write(&self, handle: &BufHandle<'_>) -> Result<(), Error> {
        let buf = &self.bufs[handle.index];
        assert!(
            buf.sleep.holding(),
            "BufferCache::write: caller does not hold the sleep lock for this buffer"
        );
        let inner = unsafe { buf.inner_mut() };
        self.disk
            .write_block(handle.device, handle.blockno, &inner.data)?;
        inner.flags.insert(BufFlags::VALID);
        Ok(())
    }

    /// Releases `handle`'s sleep-lock, decrements `refcnt` under the owning
    /// bucket's spin-lock, and if `refcnt` drops to zero records the
    /// current tick as `lastuse`.
    pub fn release(&self, handle: BufHandle<'_>) {
        let buf = &self.bufs[handle.index];
        assert!(
            buf.sleep.holding(),
            "BufferCache::release: caller does not hold the sleep lock for this buffer"
        );
        buf.sleep.release();

        let home = self.hash(handle.blockno);
        let mut entries = self.buckets[home].entries.lock();
        let pos = entries
            .iter()
            .position(|e| e.index == handle.index)
            .expect("released buffer is missing from its bucket");
        entries[pos].refcnt -= 1;
        if entries[pos].refcnt == 0 {
            entries[pos].lastuse = self.ticks.read();
        }
    }

    /// Increments `handle`'s `refcnt` under its bucket's spin-lock without
    /// touching the sleep-lock, preventing eviction while the content is
    /// referenced by an external collaborator such as a journaling layer.
    pub fn pin(&self, handle: &BufHandle<'_>) {
        let home = self.hash(handle.blockno);
        let mut entries = self.buckets[home].entries.lock();
        let pos = entries
            .iter()
            .position(|e| e.index == handle.index)
            .expect("pin: buffer is missing from its bucket");
        entries[pos].refcnt += 1;
    }

    /// The inverse of [`BufferCache::pin`].
    ///
    /// # Panics
    ///
    /// Panics on `refcnt` underflow — more `unpin`s than `pin`s/`get`s.
    pub fn unpin(&self, handle: &BufHandle<'_>) {
        let home = self.hash(handle.blockno);
        let mut entries = self.buckets[home].entries.lock();
        let pos = entries
            .iter()
            .position(|e| e.index == handle.index)
            .expect("unpin: buffer is missing from its bucket");
        assert!(entries[pos].refcnt > 0, "unpin: refcnt underflow");
        entries[pos].refcnt -= 1;
    }

    fn make_handle(&self, index: usize, device: u32, blockno: u64) -> BufHandle<'_> {
        BufHandle {
            cache: self,
            index,
            device,
            blockno,
        }
    }

    /// Resets a slot's flags before it is re-homed to a new key. Only
    /// called while the slot's owning bucket lock is held and before its
    /// sleep-lock is (re-)acquired, per P4's exclusivity guarantee.
    fn reset_buffer(&self, index: usize) {
        unsafe { self.bufs[index].inner_mut() }.flags = BufFlags::empty();
    }

    /// Finds the entry with `refcnt==0` and the smallest `lastuse` in
    /// `entries`, or `None` if every entry is busy.
    fn pick_victim(entries: &[BufMeta]) -> Option<usize> {
        let mut best: Option<usize> = None;
        for (i, entry) in entries.iter().enumerate() {
            if entry.refcnt != 0 {
                continue;
            }
            best = match best {
                None => Some(i),
                Some(b) if entry.lastuse < entries[b].lastuse => Some(i),
                some => some,
            };
        }
        best
    }
}
