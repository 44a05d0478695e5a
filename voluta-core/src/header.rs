//! The 16-byte header prefixing every meta-block (super block, AG map,
//! inode-table node, inode, radix node, H-tree node, xattr node): a magic,
//! a [`crate::vaddr::VType`] tag, flags, the payload size, and a CRC-32C
//! over the remainder of the block. Checked on every load, per I1. Field
//! layout pinned by SPEC_FULL.md §2's common header: `{magic:u32,
//! vtype:u16, flags:u16, size:u32, csum:u32}`.

use zerocopy::byteorder::little_endian::{U16, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::consts::HEADER_MAGIC;
use crate::error::{Error, Result};
use crate::vaddr::VType;

#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned, Clone, Copy)]
#[repr(C)]
pub struct Header {
    magic: U32,
    vtype: U16,
    flags: U16,
    size: U32,
    csum: U32,
}

const _: () = assert!(core::mem::size_of::<Header>() == crate::consts::HEADER_SIZE);

impl Header {
    pub fn new(vtype: VType, size: u32) -> Header {
        Header {
            magic: U32::new(HEADER_MAGIC),
            vtype: U16::new(vtype as u8 as u16),
            flags: U16::new(0),
            size: U32::new(size),
            csum: U32::new(0),
        }
    }

    pub fn vtype(&self) -> Option<VType> {
        VType::from_u8(self.vtype.get() as u8)
    }

    pub fn size(&self) -> u32 {
        self.size.get()
    }

    pub fn csum(&self) -> u32 {
        self.csum.get()
    }

    pub fn set_csum(&mut self, csum: u32) {
        self.csum = U32::new(csum);
    }

    pub fn is_magic_valid(&self) -> bool {
        self.magic.get() == HEADER_MAGIC
    }
}

/// Computes the CRC-32C of `block[HEADER_SIZE..]`, i.e. everything after the
/// header's own checksum field. The header itself (magic/vtype/flags/size)
/// participates in the checksum except for the 4-byte `csum` field, which is
/// zeroed for the purpose of the computation.
pub fn compute_csum(block: &[u8]) -> u32 {
    debug_assert!(block.len() >= crate::consts::HEADER_SIZE);
    crc32c::crc32c_append(
        crc32c::crc32c(&block[..12]), // magic, vtype, flags, size
        &block[16..],
    )
}

/// Recomputes and stores the checksum for `block`, whose first
/// [`crate::consts::HEADER_SIZE`] bytes must be a valid [`Header`].
pub fn seal(block: &mut [u8]) {
    let csum = compute_csum(block);
    let hdr = Header::mut_from_bytes(&mut block[..crate::consts::HEADER_SIZE]).unwrap();
    hdr.set_csum(csum);
}

/// Validates magic and checksum of `block`, whose first
/// [`crate::consts::HEADER_SIZE`] bytes must be a [`Header`].
pub fn verify(block: &[u8]) -> Result<()> {
    let hdr = Header::ref_from_bytes(&block[..crate::consts::HEADER_SIZE])
        .map_err(|_| Error::Corrupt("header: misaligned"))?;
    if !hdr.is_magic_valid() {
        return Err(Error::Corrupt("header: bad magic"));
    }
    let expect = hdr.csum();
    let actual = compute_csum(block);
    if expect != actual {
        return Err(Error::Corrupt("header: checksum mismatch"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_then_verify_round_trips() {
        let mut block = vec![0u8; 256];
        let hdr = Header::new(VType::Super, 1);
        block[..16].copy_from_slice(hdr.as_bytes());
        block[100] = 0xab;
        seal(&mut block);
        verify(&block).unwrap();
    }

    #[test]
    fn corrupted_payload_fails_verify() {
        let mut block = vec![0u8; 256];
        let hdr = Header::new(VType::Inode, 1);
        block[..16].copy_from_slice(hdr.as_bytes());
        seal(&mut block);
        block[200] ^= 0xff;
        assert!(verify(&block).is_err());
    }

    #[test]
    fn bad_magic_fails_verify() {
        let block = vec![0u8; 256];
        assert!(verify(&block).is_err());
    }
}
