//! The block device the buffer cache consumes, per §6's "disk driver
//! (consumed)" external interface. The source kernel calls straight into a
//! concrete SATA/virtio driver (`sd::rdwr`/`virtio_disk_rw`); this crate
//! instead depends on a trait so the cache can be driven in tests without a
//! real device, mirroring how the source treats the driver as trusted and
//! out of scope for this core's own correctness argument.

use crate::error::Error;

/// A synchronous block device: on return from `read_block`, `buf` reflects
/// the device; on return from `write_block`, the device reflects `buf`.
pub trait DiskDriver: Send + Sync {
    fn read_block(&self, device: u32, blockno: u64, buf: &mut [u8]) -> Result<(), Error>;
    fn write_block(&self, device: u32, blockno: u64, buf: &[u8]) -> Result<(), Error>;
}

/// An in-memory `DiskDriver` used as this crate's default and test double.
/// Counts reads and writes so tests can assert on the "exactly one disk
/// read" style expectations in the cache's test scenarios.
pub struct MemDisk {
    blocks: parking_lot::Mutex<std::collections::HashMap<(u32, u64), Vec<u8>>>,
    reads: std::sync::atomic::AtomicU64,
    writes: std::sync::atomic::AtomicU64,
}

impl MemDisk {
    pub fn new() -> MemDisk {
        MemDisk {
            blocks: parking_lot::Mutex::new(std::collections::HashMap::new()),
            reads: std::sync::atomic::AtomicU64::new(0),
            writes: std::sync::atomic::AtomicU64::new(0),
        }
    }

    pub fn reads(&self) -> u64 {
        self.reads.load(std::sync::atomic::Ordering::SeqCst)
    }

    pub fn writes(&self) -> u64 {
        self.writes.load(std::sync::atomic::Ordering::SeqCst)
    }

    /// Seeds a block's contents without counting as a driver-level write,
    /// for tests that want to assert on what the cache reads back.
    pub fn seed(&self, device: u32, blockno: u64, data: &[u8]) {
        self.blocks
            .lock()
            .insert((device, blockno), data.to_vec());
    }
}

impl Default for MemDisk {
    fn default() -> Self {
        MemDisk::new()
    }
}

impl DiskDriver for MemDisk {
    fn read_block(&self, device: u32, blockno: u64, buf: &mut [u8]) -> Result<(), Error> {
        self.reads.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let blocks = self.blocks.lock();
        match blocks.get(&(device, blockno)) {
            Some(data) => {
                let n = data.len().min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                buf[n..].fill(0);
            }
            None => buf.fill(0),
        }
        Ok(())
    }

    fn write_block(&self, device: u32, blockno: u64, buf: &[u8]) -> Result<(), Error> {
        self.writes.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        self.blocks.lock().insert((device, blockno), buf.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_round_trips() {
        let disk = MemDisk::new();
        disk.write_block(1, 7, &[9u8; 16]).unwrap();
        let mut buf = [0u8; 16];
        disk.read_block(1, 7, &mut buf).unwrap();
        assert_eq!(buf, [9u8; 16]);
        assert_eq!(disk.writes(), 1);
        assert_eq!(disk.reads(), 1);
    }

    #[test]
    fn unwritten_block_reads_as_zero() {
        let disk = MemDisk::new();
        let mut buf = [0xFFu8; 8];
        disk.read_block(2, 3, &mut buf).unwrap();
        assert_eq!(buf, [0u8; 8]);
    }
}
