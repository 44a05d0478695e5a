//! On-disk inode-table radix node (spec.md §3/§4.4, SPEC_FULL.md §2).

use zerocopy::byteorder::little_endian::{I64, U16, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::consts::{BLOCK_SIZE, HEADER_SIZE, ITNODE_NENTS, ITNODE_NSLOTS};
use crate::header::Header;
use crate::vaddr::VType;

#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned, Clone, Copy)]
#[repr(C)]
pub struct ItEntry {
    pub ino: U64,
    pub off: I64,
}
const _: () = assert!(core::mem::size_of::<ItEntry>() == 16);

const ITNODE_PREAMBLE_RESERVED: usize =
    BLOCK_SIZE - HEADER_SIZE - 8 - 2 - 2 - 2 - ITNODE_NENTS * 16 - ITNODE_NSLOTS * 8;

/// An inode-table radix node: 379 `(ino, off)` leaf entries plus 256
/// child-node offsets, fanned by the 8 most-significant bits of `ino` per
/// level (spec.md §4.4 "Traversal").
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned, Clone, Copy)]
#[repr(C)]
pub struct ItNode {
    hdr: Header,
    parent_off: I64,
    depth: U16,
    nents: U16,
    nchilds: U16,
    _reserved: [u8; ITNODE_PREAMBLE_RESERVED],
    entries: [ItEntry; ITNODE_NENTS],
    childs: [I64; ITNODE_NSLOTS],
}

const _: () = assert!(core::mem::size_of::<ItNode>() == BLOCK_SIZE);

impl ItNode {
    pub fn new(parent_off: Option<i64>, depth: u16) -> ItNode {
        ItNode {
            hdr: Header::new(VType::ItNode, core::mem::size_of::<ItNode>() as u32),
            parent_off: I64::new(parent_off.unwrap_or(-1)),
            depth: U16::new(depth),
            nents: U16::new(0),
            nchilds: U16::new(0),
            _reserved: [0; ITNODE_PREAMBLE_RESERVED],
            entries: [ItEntry {
                ino: U64::new(0),
                off: I64::new(-1),
            }; ITNODE_NENTS],
            childs: [I64::new(-1); ITNODE_NSLOTS],
        }
    }

    pub fn depth(&self) -> u16 {
        self.depth.get()
    }

    pub fn nents(&self) -> usize {
        self.nents.get() as usize
    }

    pub fn is_full(&self) -> bool {
        self.nents() >= ITNODE_NENTS
    }

    /// Binary-searches the sorted entry slice for `ino`.
    pub fn find(&self, ino: u64) -> Option<i64> {
        let n = self.nents();
        self.entries[..n]
            .binary_search_by_key(&ino, |e| e.ino.get())
            .ok()
            .map(|i| self.entries[i].off.get())
    }

    /// Inserts `(ino, off)` keeping entries sorted by `ino`. Returns
    /// `false` if the node is full or `ino` already present.
    pub fn insert(&mut self, ino: u64, off: i64) -> bool {
        let n = self.nents();
        match self.entries[..n].binary_search_by_key(&ino, |e| e.ino.get()) {
            Ok(_) => false,
            Err(pos) => {
                if n >= ITNODE_NENTS {
                    return false;
                }
                for i in (pos..n).rev() {
                    self.entries[i + 1] = self.entries[i];
                }
                self.entries[pos] = ItEntry {
                    ino: U64::new(ino),
                    off: I64::new(off),
                };
                self.nents = U16::new((n + 1) as u16);
                true
            }
        }
    }

    pub fn remove(&mut self, ino: u64) -> bool {
        let n = self.nents();
        match self.entries[..n].binary_search_by_key(&ino, |e| e.ino.get()) {
            Ok(pos) => {
                for i in pos..n - 1 {
                    self.entries[i] = self.entries[i + 1];
                }
                self.entries[n - 1] = ItEntry {
                    ino: U64::new(0),
                    off: I64::new(-1),
                };
                self.nents = U16::new((n - 1) as u16);
                true
            }
            Err(_) => false,
        }
    }

    pub fn child(&self, slot: usize) -> Option<i64> {
        let off = self.childs[slot].get();
        if off < 0 {
            None
        } else {
            Some(off)
        }
    }

    pub fn set_child(&mut self, slot: usize, off: Option<i64>) {
        let had = self.childs[slot].get() >= 0;
        self.childs[slot] = I64::new(off.unwrap_or(-1));
        let has = off.is_some();
        if !had && has {
            self.nchilds = U16::new(self.nchilds.get() + 1);
        } else if had && !has {
            self.nchilds = U16::new(self.nchilds.get().saturating_sub(1));
        }
    }

    pub fn entries_iter(&self) -> impl Iterator<Item = (u64, i64)> + '_ {
        self.entries[..self.nents()]
            .iter()
            .map(|e| (e.ino.get(), e.off.get()))
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
        assert_eq!(core::mem::size_of::<ItNode>(), BLOCK_SIZE);
    }

    #[test]
    fn insert_find_remove_round_trip() {
        let mut node = ItNode::new(None, 0);
        assert!(node.insert(5, 100));
        assert!(node.insert(1, 10));
        assert!(!node.insert(5, 999));
        assert_eq!(node.find(5), Some(100));
        assert_eq!(node.find(1), Some(10));
        assert_eq!(node.find(9), None);
        assert!(node.remove(1));
        assert_eq!(node.find(1), None);
        assert_eq!(node.nents(), 1);
    }
}
