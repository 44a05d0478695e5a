//! A regular file (or block device node) as the backing store, accessed
//! through a shared memory mapping.

use std::fs::File;
use std::io;

use memmap2::MmapMut;
use parking_lot::Mutex;

use crate::consts::BLOCK_SIZE;
use crate::error::{Error, Result};
use crate::vaddr::Lba;

use super::{check_buf_len, BlockDevice};

/// A volume backed by a single file on the host filesystem, memory-mapped
/// for the lifetime of the device.
pub struct FileBlockDevice {
    file: File,
    map: Mutex<MmapMut>,
    block_size: usize,
    nblocks: u64,
}

impl FileBlockDevice {
    pub fn open(file: File) -> Result<FileBlockDevice> {
        Self::open_with_block_size(file, BLOCK_SIZE)
    }

    pub fn open_with_block_size(file: File, block_size: usize) -> Result<FileBlockDevice> {
        let len = file.metadata()?.len();
        if len % block_size as u64 != 0 {
            return Err(Error::Invalid("volume file size not block-aligned"));
        }
        let map = unsafe { MmapMut::map_mut(&file)? };
        Ok(FileBlockDevice {
            file,
            map: Mutex::new(map),
            block_size,
            nblocks: len / block_size as u64,
        })
    }

    /// Creates a new, zero-filled volume file of `nblocks` blocks at `path`,
    /// then opens it.
    pub fn create(path: &std::path::Path, nblocks: u64) -> Result<FileBlockDevice> {
        Self::create_with_block_size(path, nblocks, BLOCK_SIZE)
    }

    pub fn create_with_block_size(
        path: &std::path::Path,
        nblocks: u64,
        block_size: usize,
    ) -> Result<FileBlockDevice> {
        let file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(nblocks * block_size as u64)?;
        Self::open_with_block_size(file, block_size)
    }

    fn offset_of(&self, lba: Lba) -> Result<usize> {
        if lba.0 >= self.nblocks {
            return Err(Error::Invalid("lba out of range"));
        }
        Ok((lba.0 as usize) * self.block_size)
    }
}

impl BlockDevice for FileBlockDevice {
    fn read_block(&self, lba: Lba, buf: &mut [u8]) -> Result<()> {
        check_buf_len(buf, self.block_size);
        let off = self.offset_of(lba)?;
        let map = self.map.lock();
        buf.copy_from_slice(&map[off..off + self.block_size]);
        Ok(())
    }

    fn write_block(&self, lba: Lba, buf: &[u8]) -> Result<()> {
        check_buf_len(buf, self.block_size);
        let off = self.offset_of(lba)?;
        let mut map = self.map.lock();
        map[off..off + self.block_size].copy_from_slice(buf);
        Ok(())
    }

    fn block_size(&self) -> usize {
        self.block_size
    }

    fn nblocks(&self) -> u64 {
        self.nblocks
    }

    fn sync(&self) -> Result<()> {
        self.map.lock().flush().map_err(io_to_err)?;
        self.file.sync_data()?;
        Ok(())
    }
}

fn io_to_err(e: io::Error) -> Error {
    Error::Io(e)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vol.img");
        let dev = FileBlockDevice::create(&path, 4).unwrap();
        let mut block = vec![0xab; BLOCK_SIZE];
        dev.write_block(Lba(2), &block).unwrap();
        let mut out = vec![0u8; BLOCK_SIZE];
        dev.read_block(Lba(2), &mut out).unwrap();
        assert_eq!(out, block);
        block[0] = 0;
        assert_ne!(out, block);
    }

    #[test]
    fn out_of_range_lba_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vol.img");
        let dev = FileBlockDevice::create(&path, 2).unwrap();
        let buf = vec![0u8; BLOCK_SIZE];
        assert!(dev.read_block(Lba(5), &mut buf.clone()).is_err());
    }
}
