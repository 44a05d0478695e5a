//! On-disk file radix-tree node (spec.md §3/§4.5, SPEC_FULL.md §2).

use zerocopy::byteorder::little_endian::{I64, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::consts::{BO_SIZE, FILE_MAP_NCHILD, HEADER_SIZE};
use crate::header::Header;
use crate::vaddr::{Int56, VType};

/// This node is block-octet (8 KiB) sized, not full-block sized, per
/// spec.md §3 ("an 8-KiB node with 1024 56-bit child pointers").
const RTNODE_RESERVED: usize =
    BO_SIZE - HEADER_SIZE - 8 - 8 - 8 - 1 - 7 - FILE_MAP_NCHILD * 7;

/// A file-mapping radix node: 1024 56-bit child pointers keyed by segment
/// index within `[beg, end)` (spec.md §4.5).
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned, Clone, Copy)]
#[repr(C)]
pub struct RadixTNode {
    hdr: Header,
    ino: U64,
    beg: I64,
    end: I64,
    height: u8,
    _pad: [u8; 7],
    childs: [Int56; FILE_MAP_NCHILD],
    _reserved: [u8; RTNODE_RESERVED],
}

const _: () = assert!(core::mem::size_of::<RadixTNode>() == BO_SIZE);

impl RadixTNode {
    pub fn new(ino: u64, beg: i64, end: i64, height: u8) -> RadixTNode {
        RadixTNode {
            hdr: Header::new(VType::RtNode, core::mem::size_of::<RadixTNode>() as u32),
            ino: U64::new(ino),
            beg: I64::new(beg),
            end: I64::new(end),
            height,
            _pad: [0; 7],
            childs: [Int56::default(); FILE_MAP_NCHILD],
            _reserved: [0; RTNODE_RESERVED],
        }
    }

    pub fn height(&self) -> u8 {
        self.height
    }
    pub fn beg(&self) -> i64 {
        self.beg.get()
    }
    pub fn end(&self) -> i64 {
        self.end.get()
    }

    pub fn child(&self, idx: usize) -> Option<i64> {
        let v = self.childs[idx].to_i64();
        if v < 0 {
            None
        } else {
            Some(v)
        }
    }

    pub fn set_child(&mut self, idx: usize, off: Option<i64>) {
        self.childs[idx] = Int56::from_i64(off.unwrap_or(-1));
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
    fn size_is_one_block_octet() {
        assert_eq!(core::mem::size_of::<RadixTNode>(), BO_SIZE);
    }

    #[test]
    fn child_slots_round_trip() {
        let mut node = RadixTNode::new(7, 0, 1024, 0);
        assert_eq!(node.child(3), None);
        node.set_child(3, Some(999));
        assert_eq!(node.child(3), Some(999));
        node.set_child(3, None);
        assert_eq!(node.child(3), None);
    }
}
