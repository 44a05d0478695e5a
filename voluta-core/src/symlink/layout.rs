//! On-disk out-of-line symlink-value node (spec.md §3/§4.7).
//!
//! Mirrors the `lnk_ispec` split described in SPEC_FULL.md §2: the inline
//! head lives in the inode (see [`crate::inode::LnkIspec`]); anything past
//! [`crate::consts::SYMLNK_HEAD_MAX`] spills into a chain of up to
//! [`crate::consts::SYMLNK_NPARTS`] of these nodes, each carrying exactly
//! [`crate::consts::SYMLNK_PART_MAX`] payload bytes (the last part may be
//! only partially used; `len` says how much).

use zerocopy::byteorder::little_endian::{I64, U16, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::consts::{BLOCK_SIZE, HEADER_SIZE, SYMLNK_PART_MAX};
use crate::header::Header;
use crate::vaddr::VType;

const SYMVAL_RESERVED: usize = BLOCK_SIZE - HEADER_SIZE - 8 - 8 - 2 - SYMLNK_PART_MAX;

/// One out-of-line symlink part: up to [`SYMLNK_PART_MAX`] bytes plus a
/// link to the next part, `-1` terminated.
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned, Clone, Copy)]
#[repr(C)]
pub struct SymValNode {
    hdr: Header,
    ino: U64,
    next_off: I64,
    len: U16,
    data: [u8; SYMLNK_PART_MAX],
    _reserved: [u8; SYMVAL_RESERVED],
}

const _: () = assert!(core::mem::size_of::<SymValNode>() == BLOCK_SIZE);

impl SymValNode {
    pub fn new(ino: u64) -> SymValNode {
        SymValNode {
            hdr: Header::new(VType::SymVal, core::mem::size_of::<SymValNode>() as u32),
            ino: U64::new(ino),
            next_off: I64::new(-1),
            len: U16::new(0),
            data: [0; SYMLNK_PART_MAX],
            _reserved: [0; SYMVAL_RESERVED],
        }
    }

    pub fn set_part(&mut self, bytes: &[u8]) {
        debug_assert!(bytes.len() <= SYMLNK_PART_MAX);
        self.data[..bytes.len()].copy_from_slice(bytes);
        self.len = U16::new(bytes.len() as u16);
    }

    pub fn part(&self) -> &[u8] {
        &self.data[..self.len.get() as usize]
    }

    pub fn next(&self) -> Option<i64> {
        let v = self.next_off.get();
        if v < 0 {
            None
        } else {
            Some(v)
        }
    }

    pub fn set_next(&mut self, off: Option<i64>) {
        self.next_off = I64::new(off.unwrap_or(-1));
    }

    pub fn seal(&mut self) {
        crate::header::seal(self.as_mut_bytes());
    }

    pub fn validate(&self) -> crate::error::Result<()> {
        crate::header::verify(self.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_is_one_block() {
        assert_eq!(core::mem::size_of::<SymValNode>(), BLOCK_SIZE);
    }

    #[test]
    fn part_round_trips() {
        let mut node = SymValNode::new(9);
        node.set_part(b"hello");
        assert_eq!(node.part(), b"hello");
        assert_eq!(node.next(), None);
        node.set_next(Some(42));
        assert_eq!(node.next(), Some(42));
    }
}
