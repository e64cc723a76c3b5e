//! Typed errors for the recoverable half of the error taxonomy.
//!
//! Protocol, input-validation, and configuration-misuse failures are *not*
//! represented here: per the source kernel's policy, those indicate a
//! correctness bug and are fatal (`panic!`/`assert!`) rather than recovered
//! from. Only genuinely recoverable conditions — disk I/O failure and
//! allocator/cache construction misconfiguration — get a variant.

use thiserror::Error;

/// Errors that can be returned, as opposed to panicked on, by this crate.
#[derive(Debug, Error)]
pub enum Error {
    /// The `DiskDriver` collaborator failed to service a read or write.
    #[error("disk i/o error on device {device} block {blockno}: {message}")]
    Disk {
        device: u32,
        blockno: u64,
        message: String,
    },

    /// `BufferCache::new` or `PageAllocator::new` was given a configuration
    /// that can never be satisfied (e.g. fewer than two buffers).
    #[error("invalid configuration: {0}")]
    Config(&'static str),
}
