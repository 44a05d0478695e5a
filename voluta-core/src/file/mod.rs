//! File mapping (C5, spec.md §4.5): a three-level, 1024-way radix tree
//! from data-segment index to data-segment virtual address.
//!
//! Grounded on `panda-kernel::vfs::ext2::get_block_number`'s direct/
//! single/double/triple indirection walk, generalized from ext2's 4-level
//! 32-bit direct+3-indirect scheme to Voluta's uniform 1024-fan-out
//! 3-level scheme: height 0 addresses a single segment directly from the
//! ispec (ext2's "direct" pointer, singular here), heights 1-3 insert
//! that many [`RadixTNode`] levels above the leaves (ext2's single/
//! double/triple indirection).

mod layout;

pub use layout::RadixTNode;

use zerocopy::byteorder::little_endian::{I64, U32};

use crate::consts::{DS_SIZE, FILESIZE_MAX, FILE_MAP_NCHILD, FILE_NDS_MAX};
use crate::error::{Error, Result};
use crate::inode::Inode;

/// Callbacks to read/write/allocate/free [`RadixTNode`]s, supplied by
/// [`crate::volume::Volume`].
pub trait RtNodeStore {
    fn load(&self, off: i64) -> Result<RadixTNode>;
    fn store(&self, off: Option<i64>, node: &RadixTNode) -> Result<i64>;
    fn free(&self, off: i64) -> Result<()>;
}

/// Callbacks to read/write/allocate/free individual data segments and
/// their `unwritten` bit (I4), supplied by [`crate::volume::Volume`].
pub trait DataStore {
    /// Allocates a fresh, zero-length segment, marked `unwritten` (I3/I4).
    fn alloc(&self) -> Result<i64>;
    fn free(&self, off: i64) -> Result<()>;
    fn is_unwritten(&self, off: i64) -> Result<bool>;
    fn mark_written(&self, off: i64) -> Result<()>;
    /// Reads the full [`DS_SIZE`]-byte segment at `off` into `buf`.
    fn read(&self, off: i64, buf: &mut [u8]) -> Result<()>;
    /// Writes the full [`DS_SIZE`]-byte `buf` to the segment at `off`.
    fn write(&self, off: i64, buf: &[u8]) -> Result<()>;
}

fn opt(v: i64) -> Option<i64> {
    if v < 0 {
        None
    } else {
        Some(v)
    }
}

fn capacity(height: u32) -> u64 {
    if height == 0 {
        1
    } else {
        (FILE_MAP_NCHILD as u64).pow(height)
    }
}

fn required_height(seg_idx: u64) -> u32 {
    let mut h = 0u32;
    while capacity(h) <= seg_idx {
        h += 1;
    }
    h
}

fn lookup_segment<S: RtNodeStore>(
    store: &S,
    root_off: Option<i64>,
    height: u32,
    seg_idx: u64,
) -> Result<Option<i64>> {
    if height == 0 {
        return Ok(if seg_idx == 0 { root_off } else { None });
    }
    match root_off {
        None => Ok(None),
        Some(off) => lookup_rec(store, off, height, seg_idx),
    }
}

fn lookup_rec<S: RtNodeStore>(store: &S, node_off: i64, height: u32, seg_idx: u64) -> Result<Option<i64>> {
    let node = store.load(node_off)?;
    let child_span = capacity(height - 1);
    let idx = ((seg_idx / child_span) % FILE_MAP_NCHILD as u64) as usize;
    match node.child(idx) {
        None => Ok(None),
        Some(child_off) => {
            if height == 1 {
                Ok(Some(child_off))
            } else {
                lookup_rec(store, child_off, height - 1, seg_idx % child_span)
            }
        }
    }
}

fn grow<S: RtNodeStore>(store: &S, ino: u64, root_off: &mut Option<i64>, height: &mut u32, target: u32) -> Result<()> {
    while *height < target {
        let new_height = *height + 1;
        let mut new_node = RadixTNode::new(ino, 0, capacity(new_height) as i64, new_height as u8);
        if let Some(old_root) = *root_off {
            new_node.set_child(0, Some(old_root));
        }
        let off = store.store(None, &new_node)?;
        *root_off = Some(off);
        *height = new_height;
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn ensure_segment<S: RtNodeStore, D: DataStore>(
    rtstore: &S,
    datastore: &D,
    ino: u64,
    root_off: &mut Option<i64>,
    height: &mut u32,
    seg_idx: u64,
    allocated: &mut bool,
) -> Result<i64> {
    if seg_idx >= FILE_NDS_MAX {
        return Err(Error::Fbig);
    }
    let target = required_height(seg_idx).max(*height);
    grow(rtstore, ino, root_off, height, target)?;
    if *height == 0 {
        match *root_off {
            Some(off) => Ok(off),
            None => {
                let off = datastore.alloc()?;
                *root_off = Some(off);
                *allocated = true;
                Ok(off)
            }
        }
    } else {
        ensure_rec(rtstore, datastore, ino, root_off.unwrap(), *height, seg_idx, allocated)
    }
}

fn ensure_rec<S: RtNodeStore, D: DataStore>(
    rtstore: &S,
    datastore: &D,
    ino: u64,
    node_off: i64,
    height: u32,
    seg_idx: u64,
    allocated: &mut bool,
) -> Result<i64> {
    let mut node = rtstore.load(node_off)?;
    let child_span = capacity(height - 1);
    let idx = ((seg_idx / child_span) % FILE_MAP_NCHILD as u64) as usize;
    if height == 1 {
        match node.child(idx) {
            Some(off) => Ok(off),
            None => {
                let off = datastore.alloc()?;
                node.set_child(idx, Some(off));
                rtstore.store(Some(node_off), &node)?;
                *allocated = true;
                Ok(off)
            }
        }
    } else {
        let child_off = match node.child(idx) {
            Some(off) => off,
            None => {
                let new_child = RadixTNode::new(ino, 0, child_span as i64, (height - 1) as u8);
                let off = rtstore.store(None, &new_child)?;
                node.set_child(idx, Some(off));
                rtstore.store(Some(node_off), &node)?;
                off
            }
        };
        ensure_rec(rtstore, datastore, ino, child_off, height - 1, seg_idx % child_span, allocated)
    }
}

/// Directly sets the leaf pointer for `seg_idx` to a pre-existing data
/// offset (rather than allocating), growing the tree as needed. Used by
/// [`fallocate`]'s `COLLAPSE_RANGE` to transplant segments without
/// copying their bytes.
fn set_segment<S: RtNodeStore>(
    store: &S,
    ino: u64,
    root_off: &mut Option<i64>,
    height: &mut u32,
    seg_idx: u64,
    data_off: i64,
) -> Result<()> {
    if seg_idx >= FILE_NDS_MAX {
        return Err(Error::Fbig);
    }
    let target = required_height(seg_idx).max(*height);
    grow(store, ino, root_off, height, target)?;
    if *height == 0 {
        *root_off = Some(data_off);
        return Ok(());
    }
    set_rec(store, root_off.unwrap(), *height, seg_idx, data_off)
}

fn set_rec<S: RtNodeStore>(store: &S, node_off: i64, height: u32, seg_idx: u64, data_off: i64) -> Result<()> {
    let mut node = store.load(node_off)?;
    let child_span = capacity(height - 1);
    let idx = ((seg_idx / child_span) % FILE_MAP_NCHILD as u64) as usize;
    if height == 1 {
        node.set_child(idx, Some(data_off));
        store.store(Some(node_off), &node)?;
        Ok(())
    } else {
        let child_off = match node.child(idx) {
            Some(off) => off,
            None => {
                let new_child = RadixTNode::new(0, 0, child_span as i64, (height - 1) as u8);
                let off = store.store(None, &new_child)?;
                node.set_child(idx, Some(off));
                store.store(Some(node_off), &node)?;
                off
            }
        };
        set_rec(store, child_off, height - 1, seg_idx % child_span, data_off)
    }
}

/// Clears (without freeing) the leaf pointer for `seg_idx`, returning the
/// data offset it held, if any.
fn clear_segment<S: RtNodeStore>(store: &S, root_off: &mut Option<i64>, height: u32, seg_idx: u64) -> Result<Option<i64>> {
    if height == 0 {
        if seg_idx == 0 {
            return Ok(root_off.take());
        }
        return Ok(None);
    }
    let Some(off) = *root_off else { return Ok(None) };
    clear_rec(store, off, height, seg_idx)
}

fn clear_rec<S: RtNodeStore>(store: &S, node_off: i64, height: u32, seg_idx: u64) -> Result<Option<i64>> {
    let mut node = store.load(node_off)?;
    let child_span = capacity(height - 1);
    let idx = ((seg_idx / child_span) % FILE_MAP_NCHILD as u64) as usize;
    if height == 1 {
        let old = node.child(idx);
        if old.is_some() {
            node.set_child(idx, None);
            store.store(Some(node_off), &node)?;
        }
        Ok(old)
    } else {
        match node.child(idx) {
            None => Ok(None),
            Some(child_off) => clear_rec(store, child_off, height - 1, seg_idx % child_span),
        }
    }
}

fn reg_root_height(inode: &Inode) -> (Option<i64>, u32) {
    let reg = inode.ispec().as_reg();
    (opt(reg.tree_root_off.get()), reg.tree_height.get())
}

fn set_reg_root_height(inode: &mut Inode, root_off: Option<i64>, height: u32) {
    let reg = inode.ispec_mut().as_reg_mut();
    reg.tree_root_off = I64::new(root_off.unwrap_or(-1));
    reg.tree_height = U32::new(height);
}

const SECTORS_PER_SEGMENT: u64 = DS_SIZE as u64 / 512;

/// Reads up to `buf.len()` bytes starting at `offset`, zero-filling holes
/// and `unwritten` segments, short-reading past `inode.size()` (spec.md
/// §4.5 "Read").
pub fn read<S: RtNodeStore, D: DataStore>(rtstore: &S, datastore: &D, inode: &Inode, offset: u64, buf: &mut [u8]) -> Result<usize> {
    let size = inode.size();
    if offset >= size || buf.is_empty() {
        return Ok(0);
    }
    let avail = (size - offset).min(buf.len() as u64) as usize;
    let (root_off, height) = reg_root_height(inode);
    let mut done = 0usize;
    while done < avail {
        let pos = offset + done as u64;
        let seg_idx = pos / DS_SIZE as u64;
        let local_off = (pos % DS_SIZE as u64) as usize;
        let chunk = (DS_SIZE - local_off).min(avail - done);
        match lookup_segment(rtstore, root_off, height, seg_idx)? {
            None => buf[done..done + chunk].fill(0),
            Some(seg_off) => {
                if datastore.is_unwritten(seg_off)? {
                    buf[done..done + chunk].fill(0);
                } else {
                    let mut seg = vec![0u8; DS_SIZE];
                    datastore.read(seg_off, &mut seg)?;
                    buf[done..done + chunk].copy_from_slice(&seg[local_off..local_off + chunk]);
                }
            }
        }
        done += chunk;
    }
    Ok(done)
}

/// Writes `buf` at `offset`, allocating segments as needed, clearing
/// `unwritten`, extending `size`/`blocks`, and updating `mtime`/`ctime`
/// plus SUID/SGID clearing (spec.md §4.5 "Write").
pub fn write<S: RtNodeStore, D: DataStore>(
    rtstore: &S,
    datastore: &D,
    inode: &mut Inode,
    offset: u64,
    buf: &[u8],
    now: u64,
) -> Result<usize> {
    if buf.is_empty() {
        return Ok(0);
    }
    let end = offset.checked_add(buf.len() as u64).ok_or(Error::Fbig)?;
    if end > FILESIZE_MAX {
        return Err(Error::Fbig);
    }
    let ino = inode.ino();
    let (mut root_off, mut height) = reg_root_height(inode);
    let mut done = 0usize;
    let mut new_segments = 0u64;
    while done < buf.len() {
        let pos = offset + done as u64;
        let seg_idx = pos / DS_SIZE as u64;
        let local_off = (pos % DS_SIZE as u64) as usize;
        let chunk = (DS_SIZE - local_off).min(buf.len() - done);
        let mut allocated = false;
        let seg_off = ensure_segment(rtstore, datastore, ino, &mut root_off, &mut height, seg_idx, &mut allocated)?;
        if allocated {
            new_segments += 1;
        }
        let was_unwritten = datastore.is_unwritten(seg_off)?;
        if chunk == DS_SIZE {
            datastore.write(seg_off, &buf[done..done + chunk])?;
        } else {
            let mut seg = vec![0u8; DS_SIZE];
            if !allocated && !was_unwritten {
                datastore.read(seg_off, &mut seg)?;
            }
            seg[local_off..local_off + chunk].copy_from_slice(&buf[done..done + chunk]);
            datastore.write(seg_off, &seg)?;
        }
        if was_unwritten {
            datastore.mark_written(seg_off)?;
        }
        done += chunk;
    }
    set_reg_root_height(inode, root_off, height);
    inode.set_size(inode.size().max(end));
    inode.set_blocks(inode.blocks() + new_segments * SECTORS_PER_SEGMENT);
    inode.set_mtime(now);
    inode.set_ctime(now);
    inode.clear_suid_sgid_on_write();
    Ok(done)
}

fn free_range<S: RtNodeStore, D: DataStore>(
    rtstore: &S,
    datastore: &D,
    node_off: i64,
    height: u32,
    node_beg: u64,
    new_seg_count: u64,
) -> Result<(bool, u64)> {
    let mut node = rtstore.load(node_off)?;
    let child_span = capacity(height - 1);
    let mut now_empty = true;
    let mut freed = 0u64;
    for idx in 0..FILE_MAP_NCHILD {
        let child_beg = node_beg + idx as u64 * child_span;
        let child_end = child_beg + child_span;
        if child_end <= new_seg_count {
            if node.child(idx).is_some() {
                now_empty = false;
            }
            continue;
        }
        match node.child(idx) {
            None => continue,
            Some(child_off) => {
                if height == 1 {
                    datastore.free(child_off)?;
                    node.set_child(idx, None);
                    freed += 1;
                } else {
                    let (child_empty, n) = free_range(rtstore, datastore, child_off, height - 1, child_beg, new_seg_count)?;
                    freed += n;
                    if child_empty {
                        rtstore.free(child_off)?;
                        node.set_child(idx, None);
                    } else {
                        now_empty = false;
                    }
                }
            }
        }
    }
    rtstore.store(Some(node_off), &node)?;
    Ok((now_empty, freed))
}

/// Sets `inode.size()`, freeing segments wholly past the new end and
/// zeroing the partial tail segment (spec.md §4.5 "Truncate"). Extending
/// only changes `size`; no segments are allocated.
pub fn truncate<S: RtNodeStore, D: DataStore>(rtstore: &S, datastore: &D, inode: &mut Inode, new_size: u64, now: u64) -> Result<()> {
    let old_size = inode.size();
    if new_size == old_size {
        return Ok(());
    }
    if new_size > old_size {
        inode.set_size(new_size);
        inode.set_mtime(now);
        inode.set_ctime(now);
        return Ok(());
    }
    let (mut root_off, mut height) = reg_root_height(inode);
    let new_seg_count = new_size.div_ceil(DS_SIZE as u64);
    let mut freed = 0u64;
    if height == 0 {
        if new_seg_count == 0 {
            if let Some(off) = root_off.take() {
                datastore.free(off)?;
                freed += 1;
            }
        }
    } else if let Some(off) = root_off {
        let (now_empty, n) = free_range(rtstore, datastore, off, height, 0, new_seg_count)?;
        freed = n;
        if now_empty {
            rtstore.free(off)?;
            root_off = None;
            height = 0;
        }
    }
    if new_size % DS_SIZE as u64 != 0 {
        if let Some(seg_off) = lookup_segment(rtstore, root_off, height, new_size / DS_SIZE as u64)? {
            if !datastore.is_unwritten(seg_off)? {
                let local = (new_size % DS_SIZE as u64) as usize;
                let mut seg = vec![0u8; DS_SIZE];
                datastore.read(seg_off, &mut seg)?;
                seg[local..].fill(0);
                datastore.write(seg_off, &seg)?;
            }
        }
    }
    set_reg_root_height(inode, root_off, height);
    inode.set_size(new_size);
    inode.set_blocks(inode.blocks().saturating_sub(freed * SECTORS_PER_SEGMENT));
    inode.set_mtime(now);
    inode.set_ctime(now);
    Ok(())
}

/// `fallocate` modes (spec.md §4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallocateMode {
    Default,
    PunchHoleKeepSize,
    ZeroRange,
    CollapseRange,
}

/// Implements every `fallocate` mode over the file radix tree (spec.md
/// §4.5 "Fallocate").
pub fn fallocate<S: RtNodeStore, D: DataStore>(
    rtstore: &S,
    datastore: &D,
    inode: &mut Inode,
    mode: FallocateMode,
    offset: u64,
    len: u64,
    now: u64,
) -> Result<()> {
    if len == 0 {
        return Ok(());
    }
    let end = offset.checked_add(len).ok_or(Error::Fbig)?;
    let ino = inode.ino();
    let (mut root_off, mut height) = reg_root_height(inode);
    let mut new_segments = 0u64;
    let mut freed_segments = 0u64;

    match mode {
        FallocateMode::Default => {
            if end > FILESIZE_MAX {
                return Err(Error::Fbig);
            }
            let mut pos = offset;
            while pos < end {
                let seg_idx = pos / DS_SIZE as u64;
                let mut allocated = false;
                ensure_segment(rtstore, datastore, ino, &mut root_off, &mut height, seg_idx, &mut allocated)?;
                if allocated {
                    new_segments += 1;
                }
                pos = (seg_idx + 1) * DS_SIZE as u64;
            }
            set_reg_root_height(inode, root_off, height);
            inode.set_size(inode.size().max(end));
        }
        FallocateMode::PunchHoleKeepSize | FallocateMode::ZeroRange => {
            let mut pos = offset;
            while pos < end {
                let seg_idx = pos / DS_SIZE as u64;
                let seg_start = seg_idx * DS_SIZE as u64;
                let seg_end = seg_start + DS_SIZE as u64;
                let fully_covered = seg_start >= offset && seg_end <= end;
                if fully_covered {
                    if let Some(off) = clear_segment(rtstore, &mut root_off, height, seg_idx)? {
                        datastore.free(off)?;
                        freed_segments += 1;
                    }
                } else if let Some(seg_off) = lookup_segment(rtstore, root_off, height, seg_idx)? {
                    if !datastore.is_unwritten(seg_off)? {
                        let lo = offset.max(seg_start) - seg_start;
                        let hi = end.min(seg_end) - seg_start;
                        let mut seg = vec![0u8; DS_SIZE];
                        datastore.read(seg_off, &mut seg)?;
                        seg[lo as usize..hi as usize].fill(0);
                        datastore.write(seg_off, &seg)?;
                    }
                }
                pos = seg_end;
            }
            set_reg_root_height(inode, root_off, height);
        }
        FallocateMode::CollapseRange => {
            if offset % DS_SIZE as u64 != 0 || len % DS_SIZE as u64 != 0 {
                return Err(Error::Invalid("collapse range must be segment-aligned"));
            }
            let old_size = inode.size();
            if end > old_size {
                return Err(Error::Invalid("collapse range exceeds file size"));
            }
            let remove_first = offset / DS_SIZE as u64;
            let remove_count = len / DS_SIZE as u64;
            let old_last_seg = if old_size == 0 { 0 } else { (old_size - 1) / DS_SIZE as u64 };

            for seg_idx in remove_first..remove_first + remove_count {
                if let Some(off) = clear_segment(rtstore, &mut root_off, height, seg_idx)? {
                    datastore.free(off)?;
                    freed_segments += 1;
                }
            }
            for seg_idx in (remove_first + remove_count)..=old_last_seg {
                if let Some(off) = clear_segment(rtstore, &mut root_off, height, seg_idx)? {
                    set_segment(rtstore, ino, &mut root_off, &mut height, seg_idx - remove_count, off)?;
                }
            }
            set_reg_root_height(inode, root_off, height);
            inode.set_size(old_size - len);
        }
    }

    inode.set_blocks(inode.blocks() + new_segments * SECTORS_PER_SEGMENT - freed_segments * SECTORS_PER_SEGMENT);
    inode.set_mtime(now);
    inode.set_ctime(now);
    Ok(())
}

/// `SEEK_DATA`/`SEEK_HOLE` (spec.md §6, derived from §4.5): an
/// `unwritten` segment counts as a hole.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekWhence {
    Data,
    Hole,
}

pub fn lseek<S: RtNodeStore, D: DataStore>(rtstore: &S, datastore: &D, inode: &Inode, offset: u64, whence: SeekWhence) -> Result<u64> {
    let size = inode.size();
    if offset >= size {
        return Err(Error::Invalid("lseek offset beyond end of file"));
    }
    let (root_off, height) = reg_root_height(inode);
    let mut pos = offset;
    let want_hole = whence == SeekWhence::Hole;
    while pos < size {
        let seg_idx = pos / DS_SIZE as u64;
        let is_hole = match lookup_segment(rtstore, root_off, height, seg_idx)? {
            None => true,
            Some(off) => datastore.is_unwritten(off)?,
        };
        if is_hole == want_hole {
            return Ok(pos);
        }
        pos = (seg_idx + 1) * DS_SIZE as u64;
    }
    match whence {
        SeekWhence::Hole => Ok(size),
        SeekWhence::Data => Err(Error::Invalid("no data at or after offset")),
    }
}

/// One contiguous mapped extent, as surfaced by `fiemap` (spec.md §6).
pub struct Extent {
    pub logical_offset: u64,
    pub length: u64,
    pub unwritten: bool,
}

/// Reports extents by walking the file radix tree (spec.md §6 "fiemap").
pub fn fiemap<S: RtNodeStore, D: DataStore>(rtstore: &S, datastore: &D, inode: &Inode) -> Result<Vec<Extent>> {
    let (root_off, height) = reg_root_height(inode);
    let mut extents = Vec::new();
    match (root_off, height) {
        (None, _) => {}
        (Some(off), 0) => extents.push(Extent {
            logical_offset: 0,
            length: DS_SIZE as u64,
            unwritten: datastore.is_unwritten(off)?,
        }),
        (Some(off), h) => walk_fiemap(rtstore, datastore, off, h, 0, &mut extents)?,
    }
    Ok(extents)
}

fn walk_fiemap<S: RtNodeStore, D: DataStore>(
    rtstore: &S,
    datastore: &D,
    node_off: i64,
    height: u32,
    node_beg: u64,
    out: &mut Vec<Extent>,
) -> Result<()> {
    let node = rtstore.load(node_off)?;
    let child_span = capacity(height - 1);
    for idx in 0..FILE_MAP_NCHILD {
        let Some(child_off) = node.child(idx) else { continue };
        let child_beg = node_beg + idx as u64 * child_span;
        if height == 1 {
            out.push(Extent {
                logical_offset: child_beg * DS_SIZE as u64,
                length: DS_SIZE as u64,
                unwritten: datastore.is_unwritten(child_off)?,
            });
        } else {
            walk_fiemap(rtstore, datastore, child_off, height - 1, child_beg, out)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inode::S_IFREG;
    use std::cell::RefCell;
    use std::collections::HashMap;

    struct MemRtStore {
        nodes: RefCell<HashMap<i64, RadixTNode>>,
        next: RefCell<i64>,
    }
    impl MemRtStore {
        fn new() -> MemRtStore {
            MemRtStore {
                nodes: RefCell::new(HashMap::new()),
                next: RefCell::new(0),
            }
        }
    }
    impl RtNodeStore for MemRtStore {
        fn load(&self, off: i64) -> Result<RadixTNode> {
            self.nodes.borrow().get(&off).copied().ok_or(Error::Corrupt("missing rtnode"))
        }
        fn store(&self, off: Option<i64>, node: &RadixTNode) -> Result<i64> {
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

    struct MemDataStore {
        segs: RefCell<HashMap<i64, (Vec<u8>, bool)>>,
        next: RefCell<i64>,
    }
    impl MemDataStore {
        fn new() -> MemDataStore {
            MemDataStore {
                segs: RefCell::new(HashMap::new()),
                next: RefCell::new(1_000_000),
            }
        }
    }
    impl DataStore for MemDataStore {
        fn alloc(&self) -> Result<i64> {
            let mut n = self.next.borrow_mut();
            *n += 1;
            let off = *n;
            self.segs.borrow_mut().insert(off, (vec![0u8; DS_SIZE], true));
            Ok(off)
        }
        fn free(&self, off: i64) -> Result<()> {
            self.segs.borrow_mut().remove(&off);
            Ok(())
        }
        fn is_unwritten(&self, off: i64) -> Result<bool> {
            Ok(self.segs.borrow().get(&off).map(|(_, u)| *u).unwrap_or(false))
        }
        fn mark_written(&self, off: i64) -> Result<()> {
            if let Some(entry) = self.segs.borrow_mut().get_mut(&off) {
                entry.1 = false;
            }
            Ok(())
        }
        fn read(&self, off: i64, buf: &mut [u8]) -> Result<()> {
            let segs = self.segs.borrow();
            let (data, _) = segs.get(&off).ok_or(Error::Corrupt("missing segment"))?;
            buf.copy_from_slice(data);
            Ok(())
        }
        fn write(&self, off: i64, buf: &[u8]) -> Result<()> {
            let mut segs = self.segs.borrow_mut();
            let (data, _) = segs.get_mut(&off).ok_or(Error::Corrupt("missing segment"))?;
            data.copy_from_slice(buf);
            Ok(())
        }
    }

    fn new_file() -> Inode {
        Inode::new(7, 1, S_IFREG | 0o644, 0, 0, 1)
    }

    #[test]
    fn write_then_read_back() {
        let rt = MemRtStore::new();
        let ds = MemDataStore::new();
        let mut ino = new_file();
        let n = write(&rt, &ds, &mut ino, 0, b"ABCDEFGH", 10).unwrap();
        assert_eq!(n, 8);
        assert_eq!(ino.size(), 8);
        assert!(ino.blocks() >= 16);

        let mut buf = [0u8; 8];
        let got = read(&rt, &ds, &ino, 0, &mut buf).unwrap();
        assert_eq!(got, 8);
        assert_eq!(&buf, b"ABCDEFGH");
    }

    #[test]
    fn read_past_size_is_short_and_sparse_reads_zero() {
        let rt = MemRtStore::new();
        let ds = MemDataStore::new();
        let mut ino = new_file();
        write(&rt, &ds, &mut ino, 0, b"hi", 1).unwrap();
        let mut buf = [0xffu8; 16];
        let got = read(&rt, &ds, &ino, 0, &mut buf).unwrap();
        assert_eq!(got, 2);

        // a pwrite far past the current segment creates a hole before it.
        write(&rt, &ds, &mut ino, 65535, b"X", 2).unwrap();
        assert_eq!(ino.size(), 65536);
        let mut hole = [0xffu8; 100];
        let got = read(&rt, &ds, &ino, 2, &mut hole).unwrap();
        assert_eq!(got, 100);
        assert!(hole.iter().all(|&b| b == 0));
    }

    #[test]
    fn truncate_to_zero_frees_everything_and_blocks_return_to_zero() {
        let rt = MemRtStore::new();
        let ds = MemDataStore::new();
        let mut ino = new_file();
        write(&rt, &ds, &mut ino, 0, &vec![1u8; DS_SIZE * 3], 1).unwrap();
        assert!(ino.blocks() > 0);
        truncate(&rt, &ds, &mut ino, 0, 2).unwrap();
        assert_eq!(ino.size(), 0);
        assert_eq!(ino.blocks(), 0);
    }

    #[test]
    fn truncate_zeroes_partial_tail_segment() {
        let rt = MemRtStore::new();
        let ds = MemDataStore::new();
        let mut ino = new_file();
        write(&rt, &ds, &mut ino, 0, &vec![7u8; 100], 1).unwrap();
        truncate(&rt, &ds, &mut ino, 50, 2).unwrap();
        let mut buf = vec![0xffu8; 50];
        // re-extend via another write further out to force re-reading the tail.
        write(&rt, &ds, &mut ino, 8192, b"z", 3).unwrap();
        let got = read(&rt, &ds, &ino, 0, &mut buf).unwrap();
        assert_eq!(got, 50);
        assert!(buf.iter().all(|&b| b == 7));
    }

    #[test]
    fn fallocate_default_marks_unwritten_and_reads_as_zero() {
        let rt = MemRtStore::new();
        let ds = MemDataStore::new();
        let mut ino = new_file();
        fallocate(&rt, &ds, &mut ino, FallocateMode::Default, 0, DS_SIZE as u64, 1).unwrap();
        assert_eq!(ino.size(), DS_SIZE as u64);
        let mut buf = vec![0xffu8; DS_SIZE];
        let got = read(&rt, &ds, &ino, 0, &mut buf).unwrap();
        assert_eq!(got, DS_SIZE);
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn punch_hole_of_full_segment_drops_blocks() {
        let rt = MemRtStore::new();
        let ds = MemDataStore::new();
        let mut ino = new_file();
        write(&rt, &ds, &mut ino, 0, &vec![9u8; DS_SIZE], 1).unwrap();
        let blocks_before = ino.blocks();
        fallocate(&rt, &ds, &mut ino, FallocateMode::PunchHoleKeepSize, 0, DS_SIZE as u64, 2).unwrap();
        assert_eq!(ino.blocks(), blocks_before - SECTORS_PER_SEGMENT);
        assert_eq!(ino.size(), DS_SIZE as u64);
        let mut buf = vec![0xffu8; DS_SIZE];
        read(&rt, &ds, &ino, 0, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn collapse_range_shifts_segments_left() {
        let rt = MemRtStore::new();
        let ds = MemDataStore::new();
        let mut ino = new_file();
        write(&rt, &ds, &mut ino, 0, &vec![1u8; DS_SIZE], 1).unwrap();
        write(&rt, &ds, &mut ino, DS_SIZE as u64, &vec![2u8; DS_SIZE], 1).unwrap();
        write(&rt, &ds, &mut ino, 2 * DS_SIZE as u64, &vec![3u8; DS_SIZE], 1).unwrap();
        fallocate(&rt, &ds, &mut ino, FallocateMode::CollapseRange, 0, DS_SIZE as u64, 2).unwrap();
        assert_eq!(ino.size(), 2 * DS_SIZE as u64);
        let mut buf = vec![0u8; DS_SIZE];
        read(&rt, &ds, &ino, 0, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 2));
        read(&rt, &ds, &ino, DS_SIZE as u64, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 3));
    }

    #[test]
    fn lseek_data_and_hole() {
        let rt = MemRtStore::new();
        let ds = MemDataStore::new();
        let mut ino = new_file();
        write(&rt, &ds, &mut ino, 0, &vec![1u8; DS_SIZE], 1).unwrap();
        write(&rt, &ds, &mut ino, 3 * DS_SIZE as u64, &vec![1u8; DS_SIZE], 1).unwrap();
        assert_eq!(lseek(&rt, &ds, &ino, 0, SeekWhence::Hole).unwrap(), DS_SIZE as u64);
        assert_eq!(lseek(&rt, &ds, &ino, DS_SIZE as u64, SeekWhence::Data).unwrap(), 3 * DS_SIZE as u64);
    }

    #[test]
    fn fiemap_reports_each_written_extent() {
        let rt = MemRtStore::new();
        let ds = MemDataStore::new();
        let mut ino = new_file();
        write(&rt, &ds, &mut ino, 0, &vec![1u8; DS_SIZE], 1).unwrap();
        write(&rt, &ds, &mut ino, 2000 * DS_SIZE as u64, &vec![1u8; DS_SIZE], 1).unwrap();
        let extents = fiemap(&rt, &ds, &ino).unwrap();
        assert_eq!(extents.len(), 2);
        assert_eq!(extents[0].logical_offset, 0);
        assert_eq!(extents[1].logical_offset, 2000 * DS_SIZE as u64);
    }
}
