//! An in-memory block device, used by tests and by tools that operate on a
//! volume image entirely in RAM (e.g. `fsck --dry-run`).

use parking_lot::Mutex;

use crate::consts::BLOCK_SIZE;
use crate::error::{Error, Result};
use crate::vaddr::Lba;

use super::{check_buf_len, BlockDevice};

pub struct MemBlockDevice {
    blocks: Mutex<Vec<u8>>,
    block_size: usize,
    nblocks: u64,
}

impl MemBlockDevice {
    pub fn new(nblocks: u64) -> MemBlockDevice {
        Self::with_block_size(nblocks, BLOCK_SIZE)
    }

    pub fn with_block_size(nblocks: u64, block_size: usize) -> MemBlockDevice {
        MemBlockDevice {
            blocks: Mutex::new(vec![0u8; (nblocks as usize) * block_size]),
            block_size,
            nblocks,
        }
    }

    fn offset_of(&self, lba: Lba) -> Result<usize> {
        if lba.0 >= self.nblocks {
            return Err(Error::Invalid("lba out of range"));
        }
        Ok((lba.0 as usize) * self.block_size)
    }
}

impl BlockDevice for MemBlockDevice {
    fn read_block(&self, lba: Lba, buf: &mut [u8]) -> Result<()> {
        check_buf_len(buf, self.block_size);
        let off = self.offset_of(lba)?;
        let blocks = self.blocks.lock();
        buf.copy_from_slice(&blocks[off..off + self.block_size]);
        Ok(())
    }

    fn write_block(&self, lba: Lba, buf: &[u8]) -> Result<()> {
        check_buf_len(buf, self.block_size);
        let off = self.offset_of(lba)?;
        let mut blocks = self.blocks.lock();
        blocks[off..off + self.block_size].copy_from_slice(buf);
        Ok(())
    }

    fn block_size(&self) -> usize {
        self.block_size
    }

    fn nblocks(&self) -> u64 {
        self.nblocks
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_block() {
        let dev = MemBlockDevice::new(8);
        let data = vec![0x5a; BLOCK_SIZE];
        dev.write_block(Lba(3), &data).unwrap();
        let mut out = vec![0u8; BLOCK_SIZE];
        dev.read_block(Lba(3), &mut out).unwrap();
        assert_eq!(out, data);
    }
}
