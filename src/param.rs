//! Tunable constants and runtime configuration.
//!
//! The source kernel hard-codes these as `const` items in `param.rs` because
//! it is compiled once for a fixed machine. This crate's test scenarios
//! construct caches and allocators with several different shapes (a
//! three-buffer, single-bucket cache to force eviction; a two-bucket cache
//! to force a steal; ...), so the same tunables are runtime fields on
//! `*Config` structs instead, with the source kernel's defaults preserved as
//! the `Default` impls.

/// Size in bytes of one cached disk block. The source kernel used 1024.
pub const BSIZE: usize = 1024;

/// Configuration for a [`crate::PageAllocator`].
#[derive(Debug, Clone, Copy)]
pub struct PageAllocatorConfig {
    /// Number of per-CPU shards.
    pub ncpu: usize,
}

impl Default for PageAllocatorConfig {
    fn default() -> Self {
        PageAllocatorConfig { ncpu: 8 }
    }
}

/// Configuration for a [`crate::BufferCache`].
#[derive(Debug, Clone, Copy)]
pub struct BufferCacheConfig {
    /// Total number of cached-block slots.
    pub nbuf: usize,
    /// Number of hash buckets. An odd prime such as 13 avoids pathological
    /// clustering against common block-number stride patterns.
    pub nbucket: usize,
    /// Size in bytes of each block's payload.
    pub bsize: usize,
}

impl Default for BufferCacheConfig {
    fn default() -> Self {
        BufferCacheConfig {
            nbuf: 64,
            nbucket: 13,
            bsize: BSIZE,
        }
    }
}
