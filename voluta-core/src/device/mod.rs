//! Block-level access to the backing volume (C1).
//!
//! Mirrors the synchronous `Block` interface of the kernel's resource layer,
//! but scoped to whole-block, whole-volume random access rather than
//! arbitrary byte ranges: every read/write here is exactly
//! [`crate::consts::BLOCK_SIZE`] bytes at a block-aligned offset, which is
//! the only access granularity the engine ever needs.

mod encrypted;
mod file;
mod mem;

pub use encrypted::EncryptedBlockDevice;
pub use file::FileBlockDevice;
pub use mem::MemBlockDevice;

use crate::consts::BLOCK_SIZE;
use crate::error::Result;
use crate::vaddr::Lba;

/// A random-access block device. All operations are block-aligned and
/// synchronous: the engine itself provides any caching or batching.
///
/// `block_size` is usually [`BLOCK_SIZE`], except for the inner device
/// wrapped by [`EncryptedBlockDevice`], which is provisioned wide enough to
/// also hold each block's GCM authentication tag.
pub trait BlockDevice: Send + Sync {
    /// Reads the full block at `lba` into `buf`, which must be exactly
    /// [`BlockDevice::block_size`] bytes.
    fn read_block(&self, lba: Lba, buf: &mut [u8]) -> Result<()>;

    /// Writes `buf` (exactly [`BlockDevice::block_size`] bytes) to the block
    /// at `lba`.
    fn write_block(&self, lba: Lba, buf: &[u8]) -> Result<()>;

    /// Size in bytes of a single block on this device.
    fn block_size(&self) -> usize {
        BLOCK_SIZE
    }

    /// Device size in blocks.
    fn nblocks(&self) -> u64;

    /// Flushes any buffered writes to durable storage.
    fn sync(&self) -> Result<()>;
}

pub(crate) fn check_buf_len(buf: &[u8], block_size: usize) {
    debug_assert_eq!(buf.len(), block_size, "block I/O must be block-sized");
}
