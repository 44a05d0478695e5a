//! On-disk out-of-line xattr node (spec.md §3/§4.7).

use zerocopy::byteorder::little_endian::U16;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::consts::{BLOCK_SIZE, HEADER_SIZE, XATTR_NENTS};
use crate::header::Header;
use crate::vaddr::VType;

pub const XATTR_NS_NONE: u8 = 0;
pub const XATTR_NS_SECURITY: u8 = 1;
pub const XATTR_NS_SYSTEM: u8 = 2;
pub const XATTR_NS_TRUSTED: u8 = 3;
pub const XATTR_NS_USER: u8 = 4;

#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned, Clone, Copy)]
#[repr(C)]
pub struct XattrEntrySlot {
    namespace: u8,
    name_len: u8,
    value_len: U16,
    name_off: U16,
    value_off: U16,
}
const _: () = assert!(core::mem::size_of::<XattrEntrySlot>() == 8);

impl XattrEntrySlot {
    fn free() -> XattrEntrySlot {
        XattrEntrySlot {
            namespace: 0,
            name_len: 0,
            value_len: U16::new(0),
            name_off: U16::new(0),
            value_off: U16::new(0),
        }
    }

    fn is_free(&self) -> bool {
        self.name_len == 0
    }
}

const FIXED_SIZE: usize =
    HEADER_SIZE + 8 + XATTR_NENTS * core::mem::size_of::<XattrEntrySlot>();

pub const XATTR_ARENA_SIZE: usize = BLOCK_SIZE - FIXED_SIZE - 8;

/// An out-of-line xattr node: a packed, bump-allocated arena of
/// `(name, value)` byte pairs addressed by a fixed entry-slot table
/// (spec.md §4.7 "allocate a xattr node (1016 entries)").
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned, Clone, Copy)]
#[repr(C)]
pub struct XattrNode {
    hdr: Header,
    ino: zerocopy::byteorder::little_endian::U64,
    entries: [XattrEntrySlot; XATTR_NENTS],
    arena: [u8; XATTR_ARENA_SIZE],
    arena_used: U16,
    _reserved: [u8; 6],
}

const _: () = assert!(core::mem::size_of::<XattrNode>() == BLOCK_SIZE);

impl XattrNode {
    pub fn new(ino: u64) -> XattrNode {
        XattrNode {
            hdr: Header::new(VType::XaNode, core::mem::size_of::<XattrNode>() as u32),
            ino: zerocopy::byteorder::little_endian::U64::new(ino),
            entries: [XattrEntrySlot::free(); XATTR_NENTS],
            arena: [0u8; XATTR_ARENA_SIZE],
            arena_used: U16::new(0),
            _reserved: [0; 6],
        }
    }

    fn free_slot(&self) -> Option<usize> {
        (0..XATTR_NENTS).find(|&i| self.entries[i].is_free())
    }

    fn push(&mut self, bytes: &[u8]) -> Option<u16> {
        let remaining = XATTR_ARENA_SIZE - self.arena_used.get() as usize;
        if remaining < bytes.len() {
            return None;
        }
        let off = self.arena_used.get() as usize;
        self.arena[off..off + bytes.len()].copy_from_slice(bytes);
        self.arena_used = U16::new((off + bytes.len()) as u16);
        Some(off as u16)
    }

    pub fn compact(&mut self) {
        let mut new_arena = [0u8; XATTR_ARENA_SIZE];
        let mut cursor = 0usize;
        for i in 0..XATTR_NENTS {
            if self.entries[i].is_free() {
                continue;
            }
            let nlen = self.entries[i].name_len as usize;
            let vlen = self.entries[i].value_len.get() as usize;
            let noff = self.entries[i].name_off.get() as usize;
            let voff = self.entries[i].value_off.get() as usize;
            new_arena[cursor..cursor + nlen].copy_from_slice(&self.arena[noff..noff + nlen]);
            self.entries[i].name_off = U16::new(cursor as u16);
            cursor += nlen;
            new_arena[cursor..cursor + vlen].copy_from_slice(&self.arena[voff..voff + vlen]);
            self.entries[i].value_off = U16::new(cursor as u16);
            cursor += vlen;
        }
        self.arena = new_arena;
        self.arena_used = U16::new(cursor as u16);
    }

    fn entry_name(&self, i: usize) -> &[u8] {
        let e = &self.entries[i];
        let off = e.name_off.get() as usize;
        &self.arena[off..off + e.name_len as usize]
    }

    fn entry_value(&self, i: usize) -> &[u8] {
        let e = &self.entries[i];
        let off = e.value_off.get() as usize;
        &self.arena[off..off + e.value_len.get() as usize]
    }

    pub fn find(&self, namespace: u8, name: &[u8]) -> Option<(usize, &[u8])> {
        (0..XATTR_NENTS).find_map(|i| {
            let e = &self.entries[i];
            if !e.is_free() && e.namespace == namespace && self.entry_name(i) == name {
                Some((i, self.entry_value(i)))
            } else {
                None
            }
        })
    }

    /// Inserts or replaces a `(namespace, name)` -> `value` pair. Returns
    /// `false` if there is no room (caller should try [`Self::compact`]
    /// first, then fall back to a sibling node).
    pub fn set(&mut self, namespace: u8, name: &[u8], value: &[u8]) -> bool {
        if let Some((i, _)) = self.find(namespace, name) {
            self.remove_slot(i);
        }
        let Some(name_off) = self.push(name) else {
            return false;
        };
        let Some(value_off) = self.push(value) else {
            return false;
        };
        let Some(slot) = self.free_slot() else {
            return false;
        };
        self.entries[slot] = XattrEntrySlot {
            namespace,
            name_len: name.len() as u8,
            value_len: U16::new(value.len() as u16),
            name_off,
            value_off,
        };
        true
    }

    fn remove_slot(&mut self, i: usize) {
        self.entries[i] = XattrEntrySlot::free();
    }

    pub fn remove(&mut self, namespace: u8, name: &[u8]) -> bool {
        match self.find(namespace, name) {
            Some((i, _)) => {
                self.remove_slot(i);
                true
            }
            None => false,
        }
    }

    pub fn list(&self) -> impl Iterator<Item = (u8, &[u8])> + '_ {
        (0..XATTR_NENTS).filter_map(move |i| {
            if self.entries[i].is_free() {
                None
            } else {
                Some((self.entries[i].namespace, self.entry_name(i)))
            }
        })
    }

    pub fn is_empty(&self) -> bool {
        self.entries.iter().all(|e| e.is_free())
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
        assert_eq!(core::mem::size_of::<XattrNode>(), BLOCK_SIZE);
    }

    #[test]
    fn set_get_remove_round_trip() {
        let mut node = XattrNode::new(5);
        assert!(node.set(XATTR_NS_USER, b"k", b"v1"));
        assert_eq!(node.find(XATTR_NS_USER, b"k"), Some((0, &b"v1"[..])));
        assert!(node.set(XATTR_NS_USER, b"k", b"v2"));
        assert_eq!(node.find(XATTR_NS_USER, b"k").unwrap().1, b"v2");
        assert!(node.remove(XATTR_NS_USER, b"k"));
        assert!(node.find(XATTR_NS_USER, b"k").is_none());
    }
}
