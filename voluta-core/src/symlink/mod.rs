//! Attribute store, symlink half (C7, spec.md §4.7).
//!
//! Values up to [`crate::consts::SYMLNK_HEAD_MAX`] bytes fit inline in the
//! inode's `lnk_ispec.head`; longer values spill into a chain of up to
//! [`crate::consts::SYMLNK_NPARTS`] out-of-line [`SymValNode`]s linked via
//! `l_tail`, grounded on the same "fixed header, chained overflow" shape
//! `crate::xattr` uses for its out-of-line node.

mod layout;

pub use layout::SymValNode;

use crate::consts::{SYMLNK_HEAD_MAX, SYMLNK_MAX, SYMLNK_NPARTS, SYMLNK_PART_MAX};
use crate::error::{Error, Result};
use crate::inode::Inode;

pub trait SymValNodeStore {
    fn load(&self, off: i64) -> Result<SymValNode>;
    fn store(&self, off: Option<i64>, node: &SymValNode) -> Result<i64>;
    fn free(&self, off: i64) -> Result<()>;
}

/// Sets the symlink target on a freshly-created link inode. Fails
/// `NameTooLong` if `target` exceeds [`SYMLNK_MAX`] bytes (the inline head
/// plus every out-of-line part, the engine's representable maximum).
pub fn set_target<S: SymValNodeStore>(inode: &mut Inode, store: &S, target: &[u8]) -> Result<()> {
    if target.is_empty() || target.len() > SYMLNK_MAX {
        return Err(Error::name_too_long(target.len()));
    }

    let lnk = inode.ispec_mut().as_lnk_mut();
    let head_len = target.len().min(SYMLNK_HEAD_MAX);
    lnk.head[..head_len].copy_from_slice(&target[..head_len]);
    lnk.head[head_len..].fill(0);

    let overflow = &target[head_len..];
    let mut remaining = overflow;
    let mut part_idx = 0usize;
    while !remaining.is_empty() {
        let take = remaining.len().min(SYMLNK_PART_MAX);
        let mut node = SymValNode::new(inode.ino());
        node.set_part(&remaining[..take]);
        let off = store.store(None, &node)?;
        inode.ispec_mut().as_lnk_mut().tail[part_idx] = zerocopy::byteorder::little_endian::I64::new(off);
        remaining = &remaining[take..];
        part_idx += 1;
    }
    for i in part_idx..SYMLNK_NPARTS {
        inode.ispec_mut().as_lnk_mut().tail[i] = zerocopy::byteorder::little_endian::I64::new(-1);
    }
    Ok(())
}

/// Reads back the exact stored symlink target (spec.md §4.7 "`readlink`
/// returns the exact stored length").
pub fn read_target<S: SymValNodeStore>(inode: &Inode, store: &S) -> Result<Vec<u8>> {
    let lnk = inode.ispec().as_lnk();
    let head_len = lnk
        .head
        .iter()
        .position(|&b| b == 0)
        .unwrap_or(SYMLNK_HEAD_MAX);
    // The head is not itself NUL-aware once it is exactly SYMLNK_HEAD_MAX
    // bytes long and continues out-of-line; in that case every byte of the
    // head is significant.
    let has_tail = lnk.tail.iter().any(|t| t.get() >= 0);
    let mut out = if has_tail {
        lnk.head.to_vec()
    } else {
        lnk.head[..head_len].to_vec()
    };
    for t in lnk.tail.iter() {
        let off = t.get();
        if off < 0 {
            break;
        }
        let node = store.load(off)?;
        out.extend_from_slice(node.part());
    }
    Ok(out)
}

/// Frees every out-of-line part of `inode`'s symlink value, e.g. as part of
/// `unlink`'s final-nlink teardown.
pub fn free_target<S: SymValNodeStore>(inode: &Inode, store: &S) -> Result<()> {
    let lnk = inode.ispec().as_lnk();
    for t in lnk.tail.iter() {
        let off = t.get();
        if off >= 0 {
            store.free(off)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inode::S_IFLNK;
    use std::cell::RefCell;
    use std::collections::HashMap;

    struct MemStore {
        nodes: RefCell<HashMap<i64, SymValNode>>,
        next: RefCell<i64>,
    }
    impl MemStore {
        fn new() -> MemStore {
            MemStore {
                nodes: RefCell::new(HashMap::new()),
                next: RefCell::new(0),
            }
        }
    }
    impl SymValNodeStore for MemStore {
        fn load(&self, off: i64) -> Result<SymValNode> {
            self.nodes.borrow().get(&off).copied().ok_or(Error::Corrupt("missing symval"))
        }
        fn store(&self, off: Option<i64>, node: &SymValNode) -> Result<i64> {
            let off = off.unwrap_or_else(|| {
                let mut n = self.next.borrow_mut();
                *n += 1;
                *n
            });
            self.nodes.borrow_mut().insert(off, *node);
            Ok(off)
        }
        fn free(&self, off: i64) -> Result<()> {
            self.nodes.borrow_mut().remove(&off);
            Ok(())
        }
    }

    fn new_link() -> Inode {
        Inode::new(8, 1, S_IFLNK | 0o777, 0, 0, 1)
    }

    #[test]
    fn short_target_stays_inline() {
        let store = MemStore::new();
        let mut ino = new_link();
        set_target(&mut ino, &store, b"target").unwrap();
        assert_eq!(read_target(&ino, &store).unwrap(), b"target");
        assert!(ino.ispec().as_lnk().tail.iter().all(|t| t.get() < 0));
    }

    #[test]
    fn long_target_spills_to_out_of_line_parts() {
        let store = MemStore::new();
        let mut ino = new_link();
        let target = vec![b'x'; 5000];
        set_target(&mut ino, &store, &target).unwrap();
        assert_eq!(read_target(&ino, &store).unwrap(), target);
        assert!(ino.ispec().as_lnk().tail[0].get() >= 0);
    }

    #[test]
    fn oversized_target_is_rejected() {
        let store = MemStore::new();
        let mut ino = new_link();
        let target = vec![b'x'; 6000];
        assert!(matches!(set_target(&mut ino, &store, &target), Err(Error::NameTooLong { .. })));
    }
}
