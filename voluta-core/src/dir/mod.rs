//! Directory mapping (C6, spec.md §4.6): an H-tree over SHA-256-hashed
//! names, descended by 6-bit nibbles (I7), with an inline-or-external root
//! node per directory inode.
//!
//! Grounded on `panda-kernel::vfs::ext2::dir`'s entry-packing/splitting
//! shape (scan for space, split/merge on insert/remove) but generalized
//! from ext2's flat per-block linked record list to per-node hashed
//! buckets with child fan-out, since H-tree descent (rather than a linear
//! block scan) is what bounds lookup cost for very large directories
//! (spec.md's ~4.7M max entries).

mod layout;

pub use layout::{DirEntrySlot, DirHtreeNode};

use sha2::{Digest, Sha256};

use crate::consts::{DIR_HTNODE_NCHILDS, DIR_HTNODE_SHIFT, DIR_HTREE_DEPTH_MAX, NAME_MAX};
use crate::error::{Error, Result};

/// Callbacks the directory walker needs to read/write/allocate/free
/// [`DirHtreeNode`]s, supplied by [`crate::volume::Volume`].
pub trait DirNodeStore {
    fn load(&self, off: i64) -> Result<DirHtreeNode>;
    /// Stores `node` at `off` if given, else allocates a new node.
    fn store(&self, off: Option<i64>, node: &DirHtreeNode) -> Result<i64>;
    fn free(&self, off: i64) -> Result<()>;
}

/// Hashes `name` per I7 (SHA-256 truncated to the low 64 bits).
pub fn hash_name(name: &[u8]) -> u64 {
    let digest = Sha256::digest(name);
    u64::from_le_bytes(digest[..8].try_into().unwrap())
}

fn nibble_at(hash: u64, depth: u32) -> usize {
    let shift = 64u32.saturating_sub(DIR_HTNODE_SHIFT * (depth + 1));
    ((hash >> shift) as usize) & (DIR_HTNODE_NCHILDS - 1)
}

fn check_name(name: &[u8]) -> Result<()> {
    if name.is_empty() || name.len() > NAME_MAX {
        return Err(Error::name_too_long(name.len()));
    }
    Ok(())
}

/// Looks up `name` in the H-tree rooted at `root_off`, returning
/// `(ino, dtype)` or `Error::NoEnt`.
pub fn lookup<S: DirNodeStore>(store: &S, root_off: i64, name: &[u8]) -> Result<(u64, u8)> {
    check_name(name)?;
    let hash = hash_name(name);
    let mut off = root_off;
    let mut depth = 0u32;
    loop {
        let node = store.load(off)?;
        let bucket = nibble_at(hash, depth);
        if let Some(found) = node.find_local(bucket, hash, name) {
            return Ok(found);
        }
        match node.child(bucket) {
            Some(child_off) if depth + 1 < DIR_HTREE_DEPTH_MAX => {
                off = child_off;
                depth += 1;
            }
            _ => return Err(Error::NoEnt),
        }
    }
}

/// Inserts `(name, ino, dtype)` into the H-tree rooted at `root_off`,
/// creating `root_off` if `None`. Returns the (possibly unchanged) root
/// offset. Fails `Exists` if the name is already present anywhere along
/// the descent path, `NameTooLong` on an oversized name.
pub fn insert<S: DirNodeStore>(
    store: &S,
    root_off: Option<i64>,
    dir_ino: u64,
    name: &[u8],
    ino: u64,
    dtype: u8,
) -> Result<i64> {
    check_name(name)?;
    let hash = hash_name(name);
    let root_off = match root_off {
        Some(off) => off,
        None => store.store(None, &DirHtreeNode::new(dir_ino))?,
    };
    insert_at(store, root_off, dir_ino, hash, name, ino, dtype, 0)?;
    Ok(root_off)
}

#[allow(clippy::too_many_arguments)]
fn insert_at<S: DirNodeStore>(
    store: &S,
    off: i64,
    dir_ino: u64,
    hash: u64,
    name: &[u8],
    ino: u64,
    dtype: u8,
    depth: u32,
) -> Result<()> {
    let mut node = store.load(off)?;
    let bucket = nibble_at(hash, depth);
    if node.find_local(bucket, hash, name).is_some() {
        return Err(Error::Exists);
    }
    if node.insert_local(bucket, hash, name, ino, dtype) {
        store.store(Some(off), &node)?;
        return Ok(());
    }
    if depth + 1 >= DIR_HTREE_DEPTH_MAX {
        return Err(Error::NoSpace);
    }
    let child_off = match node.child(bucket) {
        Some(c) => c,
        None => {
            let new_off = store.store(None, &DirHtreeNode::new(dir_ino))?;
            node.set_child(bucket, Some(new_off));
            store.store(Some(off), &node)?;
            new_off
        }
    };
    insert_at(store, child_off, dir_ino, hash, name, ino, dtype, depth + 1)
}

/// Removes `name` from the H-tree rooted at `root_off`.
pub fn remove<S: DirNodeStore>(store: &S, root_off: i64, name: &[u8]) -> Result<(u64, u8)> {
    check_name(name)?;
    let hash = hash_name(name);
    remove_at(store, root_off, hash, name, 0)
}

fn remove_at<S: DirNodeStore>(
    store: &S,
    off: i64,
    hash: u64,
    name: &[u8],
    depth: u32,
) -> Result<(u64, u8)> {
    let mut node = store.load(off)?;
    let bucket = nibble_at(hash, depth);
    if let Some(removed) = node.remove_local(bucket, hash, name) {
        store.store(Some(off), &node)?;
        return Ok(removed);
    }
    match node.child(bucket) {
        Some(child_off) => remove_at(store, child_off, hash, name, depth + 1),
        None => Err(Error::NoEnt),
    }
}

/// One directory entry as surfaced by [`readdir`], with a monotone cookie
/// valid for resuming the scan (spec.md §4.6 "Readdir cookie").
pub struct DirentView {
    pub cookie: u64,
    pub ino: u64,
    pub name: Vec<u8>,
    pub dtype: u8,
}

/// Depth-first walk of every live entry in the H-tree rooted at
/// `root_off`, in a fixed node/bucket/slot order, used both to implement
/// [`readdir`] and to support full-directory scans (e.g. the CLI's
/// consistency walk).
pub fn walk_all<S: DirNodeStore>(store: &S, root_off: i64) -> Result<Vec<DirentView>> {
    let mut out = Vec::new();
    walk_node(store, root_off, &mut out)?;
    for (i, e) in out.iter_mut().enumerate() {
        e.cookie = (i + 1) as u64;
    }
    Ok(out)
}

fn walk_node<S: DirNodeStore>(store: &S, off: i64, out: &mut Vec<DirentView>) -> Result<()> {
    let node = store.load(off)?;
    for (_, ino, name, dtype) in node.iter_entries() {
        out.push(DirentView {
            cookie: 0,
            ino,
            name: name.to_vec(),
            dtype,
        });
    }
    for bucket in 0..DIR_HTNODE_NCHILDS {
        if let Some(child_off) = node.child(bucket) {
            walk_node(store, child_off, out)?;
        }
    }
    Ok(())
}

/// Lists entries with cookie strictly greater than `after_cookie`, per the
/// FUSE `readdir` contract (spec.md §6): a scan that starts at cookie 0
/// and advances to each returned entry's cookie sees every entry that was
/// present for the whole scan exactly once.
pub fn readdir<S: DirNodeStore>(
    store: &S,
    root_off: i64,
    after_cookie: u64,
) -> Result<Vec<DirentView>> {
    let all = walk_all(store, root_off)?;
    Ok(all.into_iter().filter(|e| e.cookie > after_cookie).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::HashMap;

    struct MemStore {
        nodes: RefCell<HashMap<i64, DirHtreeNode>>,
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

    impl DirNodeStore for MemStore {
        fn load(&self, off: i64) -> Result<DirHtreeNode> {
            self.nodes
                .borrow()
                .get(&off)
                .copied()
                .ok_or(Error::Corrupt("missing htnode"))
        }
        fn store(&self, off: Option<i64>, node: &DirHtreeNode) -> Result<i64> {
            let off = match off {
                Some(o) => o,
                None => {
                    let mut n = self.next.borrow_mut();
                    let o = *n;
                    *n += 1;
                    o
                }
            };
            self.nodes.borrow_mut().insert(off, *node);
            Ok(off)
        }
        fn free(&self, off: i64) -> Result<()> {
            self.nodes.borrow_mut().remove(&off);
            Ok(())
        }
    }

    #[test]
    fn insert_lookup_remove_round_trip() {
        let store = MemStore::new();
        let root = insert(&store, None, 2, b"alpha", 10, 1).unwrap();
        let root = insert(&store, Some(root), 2, b"beta", 11, 1).unwrap();
        assert_eq!(lookup(&store, root, b"alpha").unwrap(), (10, 1));
        assert_eq!(lookup(&store, root, b"beta").unwrap(), (11, 1));
        assert!(matches!(lookup(&store, root, b"gamma"), Err(Error::NoEnt)));
        assert!(matches!(
            insert(&store, Some(root), 2, b"alpha", 99, 1),
            Err(Error::Exists)
        ));
        assert_eq!(remove(&store, root, b"alpha").unwrap(), (10, 1));
        assert!(matches!(lookup(&store, root, b"alpha"), Err(Error::NoEnt)));
    }

    #[test]
    fn readdir_sees_every_entry_present_throughout_scan() {
        let store = MemStore::new();
        let mut root = None;
        for i in 0..2000u64 {
            let name = format!("{i:08x}");
            root = Some(insert(&store, root, 2, name.as_bytes(), i + 100, 1).unwrap());
        }
        let entries = readdir(&store, root.unwrap(), 0).unwrap();
        assert_eq!(entries.len(), 2000);
        let mut names: Vec<_> = entries.iter().map(|e| e.name.clone()).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), 2000);
    }

    #[test]
    fn readdir_resumes_from_cookie() {
        let store = MemStore::new();
        let mut root = None;
        for i in 0..10u64 {
            let name = format!("f{i}");
            root = Some(insert(&store, root, 2, name.as_bytes(), i + 1, 1).unwrap());
        }
        let root = root.unwrap();
        let first_half = readdir(&store, root, 0).unwrap();
        let cutoff = first_half[4].cookie;
        let rest = readdir(&store, root, cutoff).unwrap();
        assert_eq!(rest.len(), first_half.len() - 5);
    }
}
