//! The buffer cache and per-CPU page allocator of a teaching-style kernel.
//!
//! This crate carries only the two hardest concurrency cores out of the
//! source kernel: [`page_alloc`], a per-CPU sharded allocator for fixed-size
//! physical pages, and [`buffer_cache`], a hash-bucketed cache of disk
//! blocks with timestamp-based LRU eviction and cross-bucket stealing. The
//! trap dispatcher, on-disk file-system format, real block device, and
//! process scheduler that a booted kernel would wire these into are
//! external collaborators; [`disk`] defines the one trait this crate
//! actually consumes from such a collaborator, plus a `MemDisk` test
//! double so the cores can be driven end to end without a kernel.
//!
//! "Harts" are simulated with OS threads bound to a logical CPU id via
//! [`cpu::bind`]; spin-locks busy-wait on atomics ([`spinlock`]); sleep-locks
//! block on a condition variable ([`sleeplock`]) instead of a scheduler.

pub mod buffer_cache;
pub mod cpu;
pub mod disk;
pub mod error;
pub mod page;
pub mod page_alloc;
pub mod param;
pub mod sleeplock;
pub mod spinlock;
pub mod ticks;

pub use buffer_cache::{BufHandle, BufferCache};
pub use disk::{DiskDriver, MemDisk};
pub use error::Error;
pub use page::{Frame, PAGE_SIZE};
pub use page_alloc::PageAllocator;
pub use param::{BufferCacheConfig, PageAllocatorConfig};
pub use ticks::Ticks;

/// Crate-wide result alias, mirroring the source kernel's `type Result<T> =
/// core::result::Result<T, &'static str>` but with a typed error instead of
/// a bare string, per the ambient error-handling stack described for this
/// crate.
pub type Result<T> = core::result::Result<T, Error>;
