//! Allocation-group space map and allocator (C2, spec.md §4.2).
//!
//! Grounded on `panda-kernel::vfs::ext2::bitmap`'s shape: a per-unit mutex
//! serializing read-modify-write of the map, a first-fit linear scan for a
//! free slot, and running free counters updated atomically with the scan.
//! Where ext2 scans a flat bit array, this allocator scans `AgroupMap`
//! block-octet records across however many AGs the volume has formatted.

mod layout;

pub use layout::{AgroupMap, BkRef, Boctet, NBKREF_IN_AGMAP};

use parking_lot::Mutex;

use crate::consts::NBK_IN_AG;
use crate::device::BlockDevice;
use crate::error::{Error, Result};
use crate::vaddr::{Lba, VAddr, VType};

/// Per-volume allocator state: one [`AgroupMap`] per allocation group,
/// lazily materialized from the block device on first touch.
pub struct Allocator {
    ags: Mutex<Vec<Option<AgroupMap>>>,
    nag: u64,
}

impl Allocator {
    pub fn new(nag: u64) -> Allocator {
        let mut ags = Vec::with_capacity(nag as usize);
        ags.resize_with(nag as usize, || None);
        Allocator {
            ags: Mutex::new(ags),
            nag,
        }
    }

    pub fn nag(&self) -> u64 {
        self.nag
    }

    fn ag_lba_base(&self, ag_index: u64) -> Lba {
        Lba(ag_index * NBK_IN_AG)
    }

    fn ensure_loaded<D: BlockDevice + ?Sized>(
        &self,
        ags: &mut [Option<AgroupMap>],
        dev: &D,
        ag_index: u64,
        uuid: [u8; 16],
    ) -> Result<()> {
        if ags[ag_index as usize].is_some() {
            return Ok(());
        }
        let base = self.ag_lba_base(ag_index);
        let mut buf = vec![0u8; dev.block_size()];
        dev.read_block(base, &mut buf)?;
        let all_zero = buf.iter().all(|&b| b == 0);
        let map = if all_zero {
            AgroupMap::new(ag_index, uuid)
        } else {
            let m = zerocopy::FromBytes::read_from_bytes(&buf[..core::mem::size_of::<AgroupMap>()])
                .map_err(|_| Error::Corrupt("ag map: misaligned block"))?;
            let m: AgroupMap = m;
            m.validate()?;
            m
        };
        ags[ag_index as usize] = Some(map);
        Ok(())
    }

    /// Allocates a single block-octet of `vtype`, biased towards the AG of
    /// `near` when given, otherwise scanning AGs in ascending `nkb_used`
    /// order (spec.md §4.2 "Policy").
    pub fn allocate<D: BlockDevice + ?Sized>(
        &self,
        dev: &D,
        vtype: VType,
        near: Option<VAddr>,
        uuid: [u8; 16],
    ) -> Result<VAddr> {
        let mut ags = self.ags.lock();
        let order = self.scan_order(&ags, near);
        for ag_index in order {
            self.ensure_loaded(&mut ags, dev, ag_index, uuid)?;
            let map = ags[ag_index as usize].as_mut().unwrap();
            if let Some(vaddr) = Self::try_alloc_in_ag(map, ag_index, vtype) {
                self.persist(dev, map)?;
                return Ok(vaddr);
            }
        }
        Err(Error::NoSpace)
    }

    fn scan_order(&self, ags: &[Option<AgroupMap>], near: Option<VAddr>) -> Vec<u64> {
        let mut order: Vec<u64> = (0..self.nag).collect();
        if let Some(v) = near {
            let near_ag = v.lba().0 / NBK_IN_AG;
            order.sort_by_key(|&ag| (ag != near_ag, ag));
        } else {
            order.sort_by_key(|&ag| {
                ags[ag as usize]
                    .as_ref()
                    .map(|m| m.nkb_used())
                    .unwrap_or(0)
            });
        }
        order
    }

    fn try_alloc_in_ag(map: &mut AgroupMap, ag_index: u64, vtype: VType) -> Option<VAddr> {
        let whole_block = vtype.is_block_sized();
        for bkref_idx in 0..NBKREF_IN_AGMAP {
            let bkref = map.bkref_mut(bkref_idx);
            if whole_block {
                if bkref.used_boctets() != 0 {
                    continue;
                }
                bkref.boctets_mut()[0].alloc(vtype);
                let lba = Lba(ag_index * NBK_IN_AG + 1 + bkref_idx as u64);
                map.set_nkb_used(map.nkb_used() + 1);
                return Some(VAddr::from_lba_boctet(lba, 0));
            } else {
                for (bo_idx, bo) in bkref.boctets_mut().iter_mut().enumerate() {
                    if bo.is_free() {
                        bo.alloc(vtype);
                        if vtype == VType::Data {
                            bo.set_unwritten(true);
                        }
                        let lba = Lba(ag_index * NBK_IN_AG + 1 + bkref_idx as u64);
                        map.set_nkb_used(map.nkb_used() + 1);
                        return Some(VAddr::from_lba_boctet(lba, bo_idx));
                    }
                }
            }
        }
        None
    }

    /// Releases the block-octet at `vaddr`, decrementing its refcount and
    /// freeing it once the count reaches zero (I3).
    pub fn free<D: BlockDevice + ?Sized>(&self, dev: &D, vaddr: VAddr, uuid: [u8; 16]) -> Result<()> {
        let ag_index = vaddr.lba().0 / NBK_IN_AG;
        let mut ags = self.ags.lock();
        self.ensure_loaded(&mut ags, dev, ag_index, uuid)?;
        let map = ags[ag_index as usize].as_mut().unwrap();
        let bkref_idx = (vaddr.lba().0 - ag_index * NBK_IN_AG - 1) as usize;
        let bkref = map.bkref_mut(bkref_idx);
        let bo = &mut bkref.boctets_mut()[vaddr.boctet_index()];
        if bo.decref() {
            map.set_nkb_used(map.nkb_used().saturating_sub(1));
        }
        self.persist(dev, map)
    }

    pub fn incref<D: BlockDevice + ?Sized>(&self, dev: &D, vaddr: VAddr, uuid: [u8; 16]) -> Result<()> {
        let ag_index = vaddr.lba().0 / NBK_IN_AG;
        let mut ags = self.ags.lock();
        self.ensure_loaded(&mut ags, dev, ag_index, uuid)?;
        let map = ags[ag_index as usize].as_mut().unwrap();
        let bkref_idx = (vaddr.lba().0 - ag_index * NBK_IN_AG - 1) as usize;
        map.bkref_mut(bkref_idx).boctets_mut()[vaddr.boctet_index()].incref();
        self.persist(dev, map)
    }

    /// Whether the data segment at `vaddr` is still logically a hole (I4).
    pub fn is_unwritten<D: BlockDevice + ?Sized>(
        &self,
        dev: &D,
        vaddr: VAddr,
        uuid: [u8; 16],
    ) -> Result<bool> {
        let ag_index = vaddr.lba().0 / NBK_IN_AG;
        let mut ags = self.ags.lock();
        self.ensure_loaded(&mut ags, dev, ag_index, uuid)?;
        let map = ags[ag_index as usize].as_ref().unwrap();
        let bkref_idx = (vaddr.lba().0 - ag_index * NBK_IN_AG - 1) as usize;
        Ok(map.bkref(bkref_idx).boctets()[vaddr.boctet_index()].is_unwritten())
    }

    /// Clears the `unwritten` bit of the segment at `vaddr`, once real data
    /// has been written to it (I4).
    pub fn mark_written<D: BlockDevice + ?Sized>(
        &self,
        dev: &D,
        vaddr: VAddr,
        uuid: [u8; 16],
    ) -> Result<()> {
        let ag_index = vaddr.lba().0 / NBK_IN_AG;
        let mut ags = self.ags.lock();
        self.ensure_loaded(&mut ags, dev, ag_index, uuid)?;
        let map = ags[ag_index as usize].as_mut().unwrap();
        let bkref_idx = (vaddr.lba().0 - ag_index * NBK_IN_AG - 1) as usize;
        map.bkref_mut(bkref_idx).boctets_mut()[vaddr.boctet_index()].set_unwritten(false);
        self.persist(dev, map)
    }

    /// Sum of `nkb_used` across every allocation group, materializing any
    /// not yet loaded (spec.md §6 `statfs`).
    pub fn used_blocks<D: BlockDevice + ?Sized>(&self, dev: &D, uuid: [u8; 16]) -> Result<u64> {
        let mut ags = self.ags.lock();
        let mut total = 0u64;
        for ag_index in 0..self.nag {
            self.ensure_loaded(&mut ags, dev, ag_index, uuid)?;
            total += ags[ag_index as usize].as_ref().unwrap().nkb_used() as u64;
        }
        Ok(total)
    }

    pub fn key_iv_for<D: BlockDevice + ?Sized>(
        &self,
        dev: &D,
        lba: Lba,
        uuid: [u8; 16],
    ) -> Result<([u8; crate::consts::KEY_SIZE], [u8; crate::consts::IV_SIZE])> {
        let ag_index = lba.0 / NBK_IN_AG;
        let mut ags = self.ags.lock();
        self.ensure_loaded(&mut ags, dev, ag_index, uuid)?;
        let map = ags[ag_index as usize].as_ref().unwrap();
        let bkref_idx = (lba.0 - ag_index * NBK_IN_AG - 1) as usize;
        let bkref = map.bkref(bkref_idx);
        Ok((*bkref.key(), *bkref.iv()))
    }

    fn persist<D: BlockDevice + ?Sized>(&self, dev: &D, map: &mut AgroupMap) -> Result<()> {
        map.seal();
        let base = Lba(map.ag_index() * NBK_IN_AG);
        dev.write_block(base, zerocopy::IntoBytes::as_bytes(map))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemBlockDevice;

    #[test]
    fn allocate_then_free_round_trips() {
        let dev = MemBlockDevice::new(NBK_IN_AG * 2);
        let alloc = Allocator::new(2);
        let uuid = [1u8; 16];
        let v1 = alloc.allocate(&dev, VType::Data, None, uuid).unwrap();
        let v2 = alloc.allocate(&dev, VType::Data, None, uuid).unwrap();
        assert_ne!(v1, v2);
        alloc.free(&dev, v1, uuid).unwrap();
        let v3 = alloc.allocate(&dev, VType::Data, None, uuid).unwrap();
        assert_eq!(v3, v1);
    }

    #[test]
    fn block_sized_type_consumes_whole_bkref() {
        let dev = MemBlockDevice::new(NBK_IN_AG);
        let alloc = Allocator::new(1);
        let uuid = [2u8; 16];
        let v = alloc.allocate(&dev, VType::Inode, None, uuid).unwrap();
        assert_eq!(v.boctet_index(), 0);
    }

    #[test]
    fn exhausting_all_ags_yields_no_space() {
        let dev = MemBlockDevice::new(NBK_IN_AG);
        let alloc = Allocator::new(1);
        let uuid = [3u8; 16];
        let mut count = 0;
        while alloc.allocate(&dev, VType::Data, None, uuid).is_ok() {
            count += 1;
        }
        assert_eq!(count, NBKREF_IN_AGMAP * 8);
    }
}
