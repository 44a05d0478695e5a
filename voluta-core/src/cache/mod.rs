//! Virtual-node cache (C3, spec.md §4.3).
//!
//! Grounded on `Martinits-eccfs`'s `lru`-backed block cache, widened with
//! an in-flight-build table so concurrent misses on the same [`VAddr`]
//! collapse onto a single decode (spec.md: "at-most-one-build-per-key").
//! Nodes are reference-counted, `RwLock`-guarded values; the LRU only ever
//! evicts clean, unreferenced entries.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::{Mutex, RwLock};

use crate::vaddr::VAddr;

/// A cached, reference-counted, lock-guarded node of type `T` (typically a
/// decoded on-disk meta-block).
pub struct Node<T> {
    value: RwLock<T>,
    dirty: std::sync::atomic::AtomicBool,
}

impl<T> Node<T> {
    pub fn new(value: T) -> Arc<Node<T>> {
        Arc::new(Node {
            value: RwLock::new(value),
            dirty: std::sync::atomic::AtomicBool::new(false),
        })
    }

    pub fn read(&self) -> parking_lot::RwLockReadGuard<'_, T> {
        self.value.read()
    }

    pub fn write(&self) -> parking_lot::RwLockWriteGuard<'_, T> {
        self.dirty.store(true, std::sync::atomic::Ordering::Release);
        self.value.write()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(std::sync::atomic::Ordering::Acquire)
    }

    pub fn clear_dirty(&self) {
        self.dirty.store(false, std::sync::atomic::Ordering::Release);
    }
}

enum Slot<T> {
    Building(Arc<BuildBarrier<T>>),
    Ready(Arc<Node<T>>),
}

struct BuildBarrier<T> {
    result: Mutex<Option<Arc<Node<T>>>>,
    cond: parking_lot::Condvar,
}

/// A bounded LRU of decoded nodes, keyed by virtual address.
pub struct Cache<T> {
    entries: Mutex<LruCache<VAddr, Slot<T>>>,
}

impl<T> Cache<T> {
    pub fn new(capacity: usize) -> Cache<T> {
        Cache {
            entries: Mutex::new(LruCache::new(
                NonZeroUsize::new(capacity.max(1)).unwrap(),
            )),
        }
    }

    /// Returns the cached node for `vaddr`, or runs `build` to decode it if
    /// absent. Concurrent callers for the same `vaddr` block on the first
    /// caller's `build` rather than decoding independently.
    pub fn get_or_build<E>(
        &self,
        vaddr: VAddr,
        build: impl FnOnce() -> Result<T, E>,
    ) -> Result<Arc<Node<T>>, E> {
        loop {
            let mut entries = self.entries.lock();
            match entries.get(&vaddr) {
                Some(Slot::Ready(node)) => return Ok(node.clone()),
                Some(Slot::Building(barrier)) => {
                    let barrier = barrier.clone();
                    drop(entries);
                    let mut guard = barrier.result.lock();
                    while guard.is_none() {
                        barrier.cond.wait(&mut guard);
                    }
                    return Ok(guard.as_ref().unwrap().clone());
                }
                None => {
                    let barrier = Arc::new(BuildBarrier {
                        result: Mutex::new(None),
                        cond: parking_lot::Condvar::new(),
                    });
                    entries.put(vaddr, Slot::Building(barrier.clone()));
                    drop(entries);

                    let built = build();
                    let mut entries = self.entries.lock();
                    match built {
                        Ok(value) => {
                            let node = Node::new(value);
                            entries.put(vaddr, Slot::Ready(node.clone()));
                            drop(entries);
                            *barrier.result.lock() = Some(node.clone());
                            barrier.cond.notify_all();
                            return Ok(node);
                        }
                        Err(e) => {
                            entries.pop(&vaddr);
                            drop(entries);
                            barrier.cond.notify_all();
                            return Err(e);
                        }
                    }
                }
            }
        }
    }

    /// Inserts or replaces a freshly-built node, e.g. one created by an
    /// `allocate`-then-fill path that never needed `get_or_build`.
    pub fn insert(&self, vaddr: VAddr, value: T) -> Arc<Node<T>> {
        let node = Node::new(value);
        self.entries.lock().put(vaddr, Slot::Ready(node.clone()));
        node
    }

    pub fn peek(&self, vaddr: VAddr) -> Option<Arc<Node<T>>> {
        match self.entries.lock().peek(&vaddr) {
            Some(Slot::Ready(node)) => Some(node.clone()),
            _ => None,
        }
    }

    /// Removes `vaddr` from the cache unconditionally. Callers must ensure
    /// no dirty data is lost (i.e. this follows a successful writeback or a
    /// free).
    pub fn evict(&self, vaddr: VAddr) {
        self.entries.lock().pop(&vaddr);
    }

    /// Returns every currently-resident, dirty node, for writeback.
    pub fn dirty_nodes(&self) -> Vec<(VAddr, Arc<Node<T>>)> {
        self.entries
            .lock()
            .iter()
            .filter_map(|(k, slot)| match slot {
                Slot::Ready(node) if node.is_dirty() => Some((*k, node.clone())),
                _ => None,
            })
            .collect()
    }
}

/// Per-vtype caches bundled together, one [`Cache`] per decoded node kind.
/// Kept as a plain struct (rather than a `HashMap<TypeId, _>`) because each
/// node type's decode/encode path is already statically distinct.
pub struct NodeCaches {
    pub itable: Cache<crate::itable::ItNode>,
    pub inodes: Cache<crate::inode::Inode>,
    pub rtnodes: Cache<crate::file::RadixTNode>,
    pub htnodes: Cache<crate::dir::DirHtreeNode>,
    pub xanodes: Cache<crate::xattr::XattrNode>,
}

impl NodeCaches {
    pub fn new(capacity: usize) -> NodeCaches {
        NodeCaches {
            itable: Cache::new(capacity),
            inodes: Cache::new(capacity),
            rtnodes: Cache::new(capacity),
            htnodes: Cache::new(capacity),
            xanodes: Cache::new(capacity),
        }
    }
}

#[allow(dead_code)]
fn _assert_cache_is_send_sync<T: Send + Sync>() {
    fn assert_impl<C: Send + Sync>() {}
    assert_impl::<Cache<T>>();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_runs_once_for_concurrent_misses() {
        let cache: Cache<u32> = Cache::new(16);
        let calls = std::sync::atomic::AtomicUsize::new(0);
        let v = VAddr::from_lba_boctet(crate::vaddr::Lba(1), 0);
        let node = cache
            .get_or_build::<std::convert::Infallible>(v, || {
                calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                Ok(42)
            })
            .unwrap();
        assert_eq!(*node.read(), 42);
        let node2 = cache
            .get_or_build::<std::convert::Infallible>(v, || {
                calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                Ok(99)
            })
            .unwrap();
        assert_eq!(*node2.read(), 42);
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn failed_build_does_not_poison_the_slot() {
        let cache: Cache<u32> = Cache::new(16);
        let v = VAddr::from_lba_boctet(crate::vaddr::Lba(2), 0);
        let err: Result<_, &str> = cache.get_or_build(v, || Err("boom"));
        assert!(err.is_err());
        let ok = cache.get_or_build::<&str>(v, || Ok(7)).unwrap();
        assert_eq!(*ok.read(), 7);
    }

    #[test]
    fn dirty_tracking_follows_write_access() {
        let cache: Cache<u32> = Cache::new(16);
        let v = VAddr::from_lba_boctet(crate::vaddr::Lba(3), 0);
        let node = cache.insert(v, 1);
        assert!(!node.is_dirty());
        *node.write() = 2;
        assert!(node.is_dirty());
    }
}
