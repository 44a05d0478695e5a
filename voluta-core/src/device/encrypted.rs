//! Decorates any [`BlockDevice`] with transparent per-block AES-256-GCM
//! encryption (C1, I8). The inner device stores ciphertext plus a 16-byte
//! tag per block; callers of this decorator see plaintext blocks.

use crate::consts::{BLOCK_SIZE, IV_SIZE};
use crate::crypto::{self, Key, StoredIv};
use crate::error::{Error, Result};
use crate::vaddr::Lba;

use super::{check_buf_len, BlockDevice};

/// GCM authentication tag length, appended to every ciphertext block.
const TAG_SIZE: usize = 16;

pub struct EncryptedBlockDevice<D> {
    inner: D,
    key: Key,
    iv_base: [u8; IV_SIZE],
}

impl<D: BlockDevice> EncryptedBlockDevice<D> {
    /// Wraps `inner`, which must be provisioned with a block size of
    /// `BLOCK_SIZE + TAG_SIZE` bytes (see [`Self::inner_block_size`]).
    pub fn new(inner: D, key: Key, iv_base: [u8; IV_SIZE]) -> EncryptedBlockDevice<D> {
        debug_assert_eq!(inner.block_size(), Self::inner_block_size());
        EncryptedBlockDevice {
            inner,
            key,
            iv_base,
        }
    }

    /// Block size the wrapped device must be provisioned at.
    pub fn inner_block_size() -> usize {
        BLOCK_SIZE + TAG_SIZE
    }

    fn iv_for(&self, lba: Lba) -> StoredIv {
        StoredIv::for_lba(&self.iv_base, lba)
    }
}

impl<D: BlockDevice> BlockDevice for EncryptedBlockDevice<D> {
    fn read_block(&self, lba: Lba, buf: &mut [u8]) -> Result<()> {
        check_buf_len(buf, BLOCK_SIZE);
        let mut cipher = vec![0u8; Self::inner_block_size()];
        self.inner.read_block(lba, &mut cipher)?;
        let plain = crypto::decrypt(&self.key, self.iv_for(lba), &lba.0.to_le_bytes(), &cipher)?;
        if plain.len() != BLOCK_SIZE {
            return Err(Error::Corrupt("decrypted block has wrong size"));
        }
        buf.copy_from_slice(&plain);
        Ok(())
    }

    fn write_block(&self, lba: Lba, buf: &[u8]) -> Result<()> {
        check_buf_len(buf, BLOCK_SIZE);
        let cipher = crypto::encrypt(&self.key, self.iv_for(lba), &lba.0.to_le_bytes(), buf)?;
        self.inner.write_block(lba, &cipher)
    }

    fn block_size(&self) -> usize {
        BLOCK_SIZE
    }

    fn nblocks(&self) -> u64 {
        self.inner.nblocks()
    }

    fn sync(&self) -> Result<()> {
        self.inner.sync()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemBlockDevice;

    fn dev() -> EncryptedBlockDevice<MemBlockDevice> {
        let inner = MemBlockDevice::with_block_size(4, EncryptedBlockDevice::<MemBlockDevice>::inner_block_size());
        EncryptedBlockDevice::new(inner, Key([1u8; 32]), [2u8; IV_SIZE])
    }

    #[test]
    fn round_trips_plaintext_transparently() {
        let d = dev();
        let data = vec![0x42u8; BLOCK_SIZE];
        d.write_block(Lba(1), &data).unwrap();
        let mut out = vec![0u8; BLOCK_SIZE];
        d.read_block(Lba(1), &mut out).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn corrupted_ciphertext_is_detected() {
        let inner = MemBlockDevice::with_block_size(4, EncryptedBlockDevice::<MemBlockDevice>::inner_block_size());
        let d = EncryptedBlockDevice::new(inner, Key([3u8; 32]), [0u8; IV_SIZE]);
        d.write_block(Lba(0), &vec![7u8; BLOCK_SIZE]).unwrap();

        let mut raw = vec![0u8; EncryptedBlockDevice::<MemBlockDevice>::inner_block_size()];
        d.inner.read_block(Lba(0), &mut raw).unwrap();
        raw[0] ^= 0xff;
        d.inner.write_block(Lba(0), &raw).unwrap();

        let mut out = vec![0u8; BLOCK_SIZE];
        assert!(d.read_block(Lba(0), &mut out).is_err());
    }
}
