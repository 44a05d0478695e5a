//! On-disk directory H-tree node (spec.md §3/§4.6).
//!
//! The C source's `de_nents`/`de_nprev` fields are intra-node collision
//! chain links (SPEC_FULL.md §2); this layout makes that chaining explicit
//! with a 64-slot bucket head table (one per 6-bit nibble, spec.md I7) and
//! per-entry `next`/`prev` links, so a lookup only scans the entries that
//! actually share a nibble rather than the whole node.

use zerocopy::byteorder::little_endian::{I16, I64, U16, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::consts::{BLOCK_SIZE, DIR_HTNODE_NCHILDS, DIR_HTNODE_NENTS, HEADER_SIZE};
use crate::header::Header;
use crate::vaddr::VType;

/// One directory-entry record: a name, the inode it names, and its dirent
/// type, plus the intra-node chain links used to resolve bucket collisions
/// (spec.md I7 "the tree is descended by 6-bit nibbles").
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned, Clone, Copy)]
#[repr(C)]
pub struct DirEntrySlot {
    ino: U64,
    hash: U64,
    next: I16,
    prev: I16,
    name_len: U16,
    dtype: u8,
    _pad: u8,
    name_off: U16,
}
const _: () = assert!(core::mem::size_of::<DirEntrySlot>() == 26);

const NIL16: i16 = -1;

impl DirEntrySlot {
    fn free() -> DirEntrySlot {
        DirEntrySlot {
            ino: U64::new(0),
            hash: U64::new(0),
            next: I16::new(NIL16),
            prev: I16::new(NIL16),
            name_len: U16::new(0),
            dtype: 0,
            _pad: 0,
            name_off: U16::new(0),
        }
    }

    fn is_free(&self) -> bool {
        self.ino.get() == 0
    }
}

const FIXED_SIZE: usize = HEADER_SIZE
    + 8 // ino
    + 2 // nents
    + 2 // nchilds
    + DIR_HTNODE_NCHILDS * 2 // buckets
    + DIR_HTNODE_NENTS * core::mem::size_of::<DirEntrySlot>()
    + DIR_HTNODE_NCHILDS * 8; // childs

/// Bytes left over for the packed, bump-allocated name arena.
pub const DIR_NAMES_ARENA_SIZE: usize = BLOCK_SIZE - FIXED_SIZE;

/// One H-tree node: a bucketed, chained set of directory entries plus up
/// to [`DIR_HTNODE_NCHILDS`] child-node offsets for entries that overflow
/// this node (spec.md §4.6).
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned, Clone, Copy)]
#[repr(C)]
pub struct DirHtreeNode {
    hdr: Header,
    dir_ino: U64,
    nents: U16,
    nchilds: U16,
    buckets: [I16; DIR_HTNODE_NCHILDS],
    entries: [DirEntrySlot; DIR_HTNODE_NENTS],
    childs: [I64; DIR_HTNODE_NCHILDS],
    names: [u8; DIR_NAMES_ARENA_SIZE],
    arena_used: U16,
    _reserved: [u8; 6],
}

const _: () = assert!(
    core::mem::size_of::<DirHtreeNode>() == FIXED_SIZE + DIR_NAMES_ARENA_SIZE + 8
);

impl DirHtreeNode {
    pub fn new(dir_ino: u64) -> DirHtreeNode {
        DirHtreeNode {
            hdr: Header::new(VType::HtNode, core::mem::size_of::<DirHtreeNode>() as u32),
            dir_ino: U64::new(dir_ino),
            nents: U16::new(0),
            nchilds: U16::new(0),
            buckets: [I16::new(NIL16); DIR_HTNODE_NCHILDS],
            entries: [DirEntrySlot::free(); DIR_HTNODE_NENTS],
            childs: [I64::new(-1); DIR_HTNODE_NCHILDS],
            names: [0u8; DIR_NAMES_ARENA_SIZE],
            arena_used: U16::new(0),
            _reserved: [0; 6],
        }
    }

    pub fn nents(&self) -> usize {
        self.nents.get() as usize
    }

    pub fn is_entries_full(&self) -> bool {
        self.nents() >= DIR_HTNODE_NENTS
    }

    fn free_slot(&self) -> Option<usize> {
        (0..DIR_HTNODE_NENTS).find(|&i| self.entries[i].is_free())
    }

    fn arena_remaining(&self) -> usize {
        DIR_NAMES_ARENA_SIZE - self.arena_used.get() as usize
    }

    fn push_name(&mut self, name: &[u8]) -> Option<u16> {
        if self.arena_remaining() < name.len() {
            return None;
        }
        let off = self.arena_used.get() as usize;
        self.names[off..off + name.len()].copy_from_slice(name);
        self.arena_used = U16::new((off + name.len()) as u16);
        Some(off as u16)
    }

    /// Rebuilds the name arena from only the entries still in use,
    /// reclaiming space left behind by removed entries.
    pub fn compact(&mut self) {
        let mut new_names = [0u8; DIR_NAMES_ARENA_SIZE];
        let mut cursor = 0usize;
        for i in 0..DIR_HTNODE_NENTS {
            if self.entries[i].is_free() {
                continue;
            }
            let len = self.entries[i].name_len.get() as usize;
            let old_off = self.entries[i].name_off.get() as usize;
            new_names[cursor..cursor + len].copy_from_slice(&self.names[old_off..old_off + len]);
            self.entries[i].name_off = U16::new(cursor as u16);
            cursor += len;
        }
        self.names = new_names;
        self.arena_used = U16::new(cursor as u16);
    }

    fn entry_name<'a>(&'a self, slot: usize) -> &'a [u8] {
        let e = &self.entries[slot];
        let off = e.name_off.get() as usize;
        let len = e.name_len.get() as usize;
        &self.names[off..off + len]
    }

    /// Finds the entry matching `(hash, name)` within this node's bucket
    /// chain, without descending to children.
    pub fn find_local(&self, bucket: usize, hash: u64, name: &[u8]) -> Option<(u64, u8)> {
        let mut idx = self.buckets[bucket].get();
        while idx != NIL16 {
            let e = &self.entries[idx as usize];
            if e.hash.get() == hash && self.entry_name(idx as usize) == name {
                return Some((e.ino.get(), e.dtype));
            }
            idx = e.next.get();
        }
        None
    }

    /// Inserts a new entry into this node's bucket chain. Returns `false`
    /// (no mutation) if the node has no room (entry slots or name arena
    /// exhausted) — the caller should then overflow to a child node.
    pub fn insert_local(&mut self, bucket: usize, hash: u64, name: &[u8], ino: u64, dtype: u8) -> bool {
        if self.is_entries_full() {
            return false;
        }
        let Some(name_off) = self.push_name(name) else {
            self.compact();
            match self.push_name(name) {
                Some(off) => {
                    return self.insert_local_at_offset(bucket, hash, name.len(), off, ino, dtype);
                }
                None => return false,
            }
        };
        self.insert_local_at_offset(bucket, hash, name.len(), name_off, ino, dtype)
    }

    fn insert_local_at_offset(
        &mut self,
        bucket: usize,
        hash: u64,
        name_len: usize,
        name_off: u16,
        ino: u64,
        dtype: u8,
    ) -> bool {
        let Some(slot) = self.free_slot() else {
            return false;
        };
        let head = self.buckets[bucket].get();
        self.entries[slot] = DirEntrySlot {
            ino: U64::new(ino),
            hash: U64::new(hash),
            next: I16::new(head),
            prev: I16::new(NIL16),
            name_len: U16::new(name_len as u16),
            dtype,
            _pad: 0,
            name_off: U16::new(name_off),
        };
        if head != NIL16 {
            self.entries[head as usize].prev = I16::new(slot as i16);
        }
        self.buckets[bucket] = I16::new(slot as i16);
        self.nents = U16::new(self.nents.get() + 1);
        true
    }

    /// Removes the entry matching `(hash, name)` from this node's bucket
    /// chain, splicing around it. Returns the removed `(ino, dtype)`.
    pub fn remove_local(&mut self, bucket: usize, hash: u64, name: &[u8]) -> Option<(u64, u8)> {
        let mut idx = self.buckets[bucket].get();
        while idx != NIL16 {
            let i = idx as usize;
            if self.entries[i].hash.get() == hash && self.entry_name(i) == name {
                let prev = self.entries[i].prev.get();
                let next = self.entries[i].next.get();
                if prev != NIL16 {
                    self.entries[prev as usize].next = I16::new(next);
                } else {
                    self.buckets[bucket] = I16::new(next);
                }
                if next != NIL16 {
                    self.entries[next as usize].prev = I16::new(prev);
                }
                let removed = (self.entries[i].ino.get(), self.entries[i].dtype);
                self.entries[i] = DirEntrySlot::free();
                self.nents = U16::new(self.nents.get() - 1);
                return Some(removed);
            }
            idx = self.entries[i].next.get();
        }
        None
    }

    pub fn child(&self, nibble: usize) -> Option<i64> {
        let off = self.childs[nibble].get();
        if off < 0 {
            None
        } else {
            Some(off)
        }
    }

    pub fn set_child(&mut self, nibble: usize, off: Option<i64>) {
        let had = self.childs[nibble].get() >= 0;
        self.childs[nibble] = I64::new(off.unwrap_or(-1));
        if !had && off.is_some() {
            self.nchilds = U16::new(self.nchilds.get() + 1);
        } else if had && off.is_none() {
            self.nchilds = U16::new(self.nchilds.get().saturating_sub(1));
        }
    }

    /// Iterates all live entries in slot order, yielding a stable
    /// `(slot, ino, name, dtype)` tuple per entry, for readdir (spec.md
    /// §4.6 "Readdir cookie").
    pub fn iter_entries(&self) -> impl Iterator<Item = (usize, u64, &[u8], u8)> + '_ {
        (0..DIR_HTNODE_NENTS).filter_map(move |i| {
            let e = &self.entries[i];
            if e.is_free() {
                None
            } else {
                Some((i, e.ino.get(), self.entry_name(i), e.dtype))
            }
        })
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
        assert_eq!(core::mem::size_of::<DirHtreeNode>(), BLOCK_SIZE);
    }

    #[test]
    fn insert_find_remove_round_trip() {
        let mut node = DirHtreeNode::new(2);
        assert!(node.insert_local(3, 999, b"alpha", 10, 1));
        assert!(node.insert_local(3, 1000, b"beta", 11, 1));
        assert_eq!(node.find_local(3, 999, b"alpha"), Some((10, 1)));
        assert_eq!(node.find_local(3, 1000, b"beta"), Some((11, 1)));
        assert_eq!(node.find_local(3, 2, b"nope"), None);
        assert_eq!(node.remove_local(3, 999, b"alpha"), Some((10, 1)));
        assert_eq!(node.find_local(3, 999, b"alpha"), None);
        assert_eq!(node.nents(), 1);
    }

    #[test]
    fn compaction_reclaims_removed_name_bytes() {
        let mut node = DirHtreeNode::new(1);
        for i in 0..50u64 {
            let name = format!("entry-{i}");
            assert!(node.insert_local((i % 64) as usize, i, name.as_bytes(), i + 1, 1));
        }
        for i in 0..40u64 {
            let name = format!("entry-{i}");
            node.remove_local((i % 64) as usize, i, name.as_bytes());
        }
        let used_before = node.arena_used.get();
        node.compact();
        assert!(node.arena_used.get() < used_before);
    }
}
