//! Attribute store, xattr half (C7, spec.md §4.7).
//!
//! Inline slots in the inode head are tried first; once they're
//! exhausted, up to two out-of-line [`XattrNode`]s (linked via the
//! inode's `xa_off` pair) take the overflow, mirroring the record-packing
//! style `crate::dir` uses for directory entries (fixed slot table plus a
//! packed variable-length arena).

mod layout;

pub use layout::{XattrNode, XATTR_NS_NONE, XATTR_NS_SECURITY, XATTR_NS_SYSTEM, XATTR_NS_TRUSTED, XATTR_NS_USER};

use bitflags::bitflags;

use crate::consts::XATTR_VALUE_MAX;
use crate::error::{Error, Result};
use crate::inode::{Inode, XATTR_INLINE_BYTES};

bitflags! {
    /// Mirrors the POSIX `XATTR_CREATE`/`XATTR_REPLACE` `setxattr` flags
    /// (spec.md §4.7).
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct XattrFlags: u32 {
        const CREATE = 0b01;
        const REPLACE = 0b10;
    }
}

pub trait XattrNodeStore {
    fn load(&self, off: i64) -> Result<XattrNode>;
    fn store(&self, off: Option<i64>, node: &XattrNode) -> Result<i64>;
    fn free(&self, off: i64) -> Result<()>;
}

fn inline_find(inode: &Inode, namespace: u8, name: &[u8]) -> Option<usize> {
    inode.xattr_slots().iter().position(|s| {
        s.name_len != 0
            && s.namespace == namespace
            && s.name_len as usize == name.len()
            && &s.inline[..name.len()] == name
    })
}

fn inline_value(inode: &Inode, slot: usize) -> Vec<u8> {
    let s = &inode.xattr_slots()[slot];
    let name_len = s.name_len as usize;
    let value_len = s.value_len.get() as usize;
    s.inline[name_len..name_len + value_len].to_vec()
}

/// Reads the value of `(namespace, name)`, searching inline slots first
/// and then each out-of-line node in turn.
pub fn get<S: XattrNodeStore>(
    inode: &Inode,
    store: &S,
    namespace: u8,
    name: &[u8],
) -> Result<Vec<u8>> {
    if let Some(slot) = inline_find(inode, namespace, name) {
        return Ok(inline_value(inode, slot));
    }
    for i in 0..2 {
        if let Some(off) = inode.xattr_node_off(i) {
            let node = store.load(off)?;
            if let Some((_, value)) = node.find(namespace, name) {
                return Ok(value.to_vec());
            }
        }
    }
    Err(Error::NoEnt)
}

fn exists<S: XattrNodeStore>(inode: &Inode, store: &S, namespace: u8, name: &[u8]) -> Result<bool> {
    match get(inode, store, namespace, name) {
        Ok(_) => Ok(true),
        Err(Error::NoEnt) => Ok(false),
        Err(e) => Err(e),
    }
}

/// Removes any existing inline or out-of-line entry for `(namespace,
/// name)`, so `set` never leaves a stale copy behind.
fn remove_any<S: XattrNodeStore>(inode: &mut Inode, store: &S, namespace: u8, name: &[u8]) -> Result<()> {
    if let Some(slot) = inline_find(inode, namespace, name) {
        let s = &mut inode.xattr_slots_mut()[slot];
        s.namespace = 0;
        s.name_len = 0;
        s.value_len = zerocopy::byteorder::little_endian::U16::new(0);
        s.inline = [0; XATTR_INLINE_BYTES];
        return Ok(());
    }
    for i in 0..2 {
        if let Some(off) = inode.xattr_node_off(i) {
            let mut node = store.load(off)?;
            if node.remove(namespace, name) {
                store.store(Some(off), &node)?;
            }
        }
    }
    Ok(())
}

/// Sets `(namespace, name) = value`, honoring `XATTR_CREATE`/
/// `XATTR_REPLACE` (spec.md §4.7, §8 scenario 5). Does not touch
/// `mtime`/`ctime`; the caller applies those per spec.md's "Setting any
/// xattr updates ctime only".
pub fn set<S: XattrNodeStore>(
    inode: &mut Inode,
    store: &S,
    namespace: u8,
    name: &[u8],
    value: &[u8],
    flags: XattrFlags,
) -> Result<()> {
    if name.is_empty() || name.len() > crate::consts::NAME_MAX {
        return Err(Error::name_too_long(name.len()));
    }
    if value.len() > XATTR_VALUE_MAX {
        return Err(Error::Invalid("xattr value too large"));
    }
    let already = exists(inode, store, namespace, name)?;
    if flags.contains(XattrFlags::CREATE) && already {
        return Err(Error::Exists);
    }
    if flags.contains(XattrFlags::REPLACE) && !already {
        return Err(Error::NoEnt);
    }
    remove_any(inode, store, namespace, name)?;

    if name.len() + value.len() <= XATTR_INLINE_BYTES {
        if let Some(slot) = inode.xattr_slots().iter().position(|s| s.name_len == 0) {
            let s = &mut inode.xattr_slots_mut()[slot];
            s.namespace = namespace;
            s.name_len = name.len() as u8;
            s.value_len = zerocopy::byteorder::little_endian::U16::new(value.len() as u16);
            let mut inline = [0u8; XATTR_INLINE_BYTES];
            inline[..name.len()].copy_from_slice(name);
            inline[name.len()..name.len() + value.len()].copy_from_slice(value);
            s.inline = inline;
            return Ok(());
        }
    }

    for i in 0..2 {
        if let Some(off) = inode.xattr_node_off(i) {
            let mut node = store.load(off)?;
            if node.set(namespace, name, value) {
                store.store(Some(off), &node)?;
                return Ok(());
            }
            node.compact();
            if node.set(namespace, name, value) {
                store.store(Some(off), &node)?;
                return Ok(());
            }
        }
    }
    for i in 0..2 {
        if inode.xattr_node_off(i).is_none() {
            let mut node = XattrNode::new(inode.ino());
            if !node.set(namespace, name, value) {
                return Err(Error::Invalid("xattr value too large for a fresh node"));
            }
            let off = store.store(None, &node)?;
            inode.set_xattr_node_off(i, Some(off));
            return Ok(());
        }
    }
    Err(Error::NoSpace)
}

/// Removes `(namespace, name)`. Fails `NoEnt` if absent.
pub fn remove<S: XattrNodeStore>(inode: &mut Inode, store: &S, namespace: u8, name: &[u8]) -> Result<()> {
    if !exists(inode, store, namespace, name)? {
        return Err(Error::NoEnt);
    }
    remove_any(inode, store, namespace, name)
}

/// Lists every `(namespace, name)` pair set on `inode`.
pub fn list<S: XattrNodeStore>(inode: &Inode, store: &S) -> Result<Vec<(u8, Vec<u8>)>> {
    let mut out = Vec::new();
    for s in inode.xattr_slots().iter() {
        if s.name_len != 0 {
            out.push((s.namespace, s.inline[..s.name_len as usize].to_vec()));
        }
    }
    for i in 0..2 {
        if let Some(off) = inode.xattr_node_off(i) {
            let node = store.load(off)?;
            out.extend(node.list().map(|(ns, name)| (ns, name.to_vec())));
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::HashMap;

    struct MemStore {
        nodes: RefCell<HashMap<i64, XattrNode>>,
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
    impl XattrNodeStore for MemStore {
        fn load(&self, off: i64) -> Result<XattrNode> {
            self.nodes.borrow().get(&off).copied().ok_or(Error::Corrupt("missing xanode"))
        }
        fn store(&self, off: Option<i64>, node: &XattrNode) -> Result<i64> {
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

    fn new_inode() -> Inode {
        Inode::new(5, 1, crate::inode::S_IFREG | 0o644, 0, 0, 1)
    }

    #[test]
    fn set_get_replace_create_scenario() {
        let store = MemStore::new();
        let mut ino = new_inode();
        set(&mut ino, &store, XATTR_NS_USER, b"user.k", b"v1", XattrFlags::empty()).unwrap();
        assert_eq!(get(&ino, &store, XATTR_NS_USER, b"user.k").unwrap(), b"v1");
        set(&mut ino, &store, XATTR_NS_USER, b"user.k", b"v2", XattrFlags::REPLACE).unwrap();
        assert_eq!(get(&ino, &store, XATTR_NS_USER, b"user.k").unwrap(), b"v2");
        let err = set(&mut ino, &store, XATTR_NS_USER, b"user.k", b"vv", XattrFlags::CREATE);
        assert!(matches!(err, Err(Error::Exists)));
    }

    #[test]
    fn large_value_overflows_to_external_node() {
        let store = MemStore::new();
        let mut ino = new_inode();
        let value = vec![7u8; 400];
        set(&mut ino, &store, XATTR_NS_USER, b"user.big", &value, XattrFlags::empty()).unwrap();
        assert_eq!(get(&ino, &store, XATTR_NS_USER, b"user.big").unwrap(), value);
        assert!(ino.xattr_node_off(0).is_some());
    }

    #[test]
    fn remove_then_get_fails() {
        let store = MemStore::new();
        let mut ino = new_inode();
        set(&mut ino, &store, XATTR_NS_USER, b"a", b"1", XattrFlags::empty()).unwrap();
        remove(&mut ino, &store, XATTR_NS_USER, b"a").unwrap();
        assert!(matches!(get(&ino, &store, XATTR_NS_USER, b"a"), Err(Error::NoEnt)));
    }
}
