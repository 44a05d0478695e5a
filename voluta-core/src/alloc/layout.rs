//! On-disk allocation-group map layout (C2, spec.md §3/§4.2).

use zerocopy::byteorder::little_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::consts::{BLOCK_SIZE, HEADER_SIZE, IV_SIZE, KEY_SIZE, NBK_IN_AG};
use crate::header::Header;
use crate::vaddr::VType;

/// One byte of per-block-octet bookkeeping (I2).
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned, Clone, Copy, Default)]
#[repr(C)]
pub struct Boctet {
    vtype: u8,
    usemask: u8,
    unwritten: u8,
    _reserved: u8,
    refcnt: U32,
}

const _: () = assert!(core::mem::size_of::<Boctet>() == 8);

impl Boctet {
    pub fn vtype(&self) -> Option<VType> {
        VType::from_u8(self.vtype)
    }

    pub fn is_free(&self) -> bool {
        self.usemask == 0 && self.refcnt.get() == 0
    }

    pub fn refcnt(&self) -> u32 {
        self.refcnt.get()
    }

    pub fn is_unwritten(&self) -> bool {
        self.unwritten != 0
    }

    pub fn set_unwritten(&mut self, v: bool) {
        self.unwritten = v as u8;
    }

    pub fn alloc(&mut self, vtype: VType) {
        self.vtype = vtype as u8;
        self.usemask = 1;
        self.refcnt = U32::new(1);
        self.unwritten = 0;
    }

    pub fn incref(&mut self) {
        self.refcnt = U32::new(self.refcnt.get() + 1);
    }

    /// Returns true if the boctet became free.
    pub fn decref(&mut self) -> bool {
        let n = self.refcnt.get().saturating_sub(1);
        self.refcnt = U32::new(n);
        if n == 0 {
            self.vtype = VType::None as u8;
            self.usemask = 0;
            self.unwritten = 0;
            true
        } else {
            false
        }
    }
}

const BKREF_RESERVED_SIZE: usize = 128 - 8 * 8 - KEY_SIZE - IV_SIZE;

/// Per-block bookkeeping: 8 block-octet records plus the block's derived
/// encryption key/iv (SPEC_FULL.md §2: "the literal source of I8's
/// derive(master, key_slot[bi])").
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned, Clone, Copy)]
#[repr(C)]
pub struct BkRef {
    boctets: [Boctet; 8],
    key: [u8; KEY_SIZE],
    iv: [u8; IV_SIZE],
    _reserved: [u8; BKREF_RESERVED_SIZE],
}

const _: () = assert!(core::mem::size_of::<BkRef>() == 128);

impl BkRef {
    pub fn boctets(&self) -> &[Boctet; 8] {
        &self.boctets
    }

    pub fn boctets_mut(&mut self) -> &mut [Boctet; 8] {
        &mut self.boctets
    }

    pub fn key(&self) -> &[u8; KEY_SIZE] {
        &self.key
    }

    pub fn iv(&self) -> &[u8; IV_SIZE] {
        &self.iv
    }

    pub fn set_key_iv(&mut self, key: [u8; KEY_SIZE], iv: [u8; IV_SIZE]) {
        self.key = key;
        self.iv = iv;
    }

    pub fn used_boctets(&self) -> usize {
        self.boctets.iter().filter(|b| !b.is_free()).count()
    }
}

impl Default for BkRef {
    fn default() -> Self {
        BkRef {
            boctets: [Boctet::default(); 8],
            key: [0; KEY_SIZE],
            iv: [0; IV_SIZE],
            _reserved: [0; BKREF_RESERVED_SIZE],
        }
    }
}

/// Number of `BkRef` slots per AG map: one block of the AG is consumed by
/// the map itself (SPEC_FULL.md §2).
pub const NBKREF_IN_AGMAP: usize = NBK_IN_AG as usize - 1;

const AGMAP_PREAMBLE_RESERVED: usize = 128 - HEADER_SIZE - 16 - 8 - 4 - 1 - 1;

/// The AG map: one per allocation group, occupying the first block of the
/// group's LBA range.
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned, Clone, Copy)]
#[repr(C)]
pub struct AgroupMap {
    hdr: Header,
    uuid: [u8; 16],
    ag_index: U64,
    ag_nkb_used: U32,
    cipher_type: u8,
    cipher_mode: u8,
    _reserved: [u8; AGMAP_PREAMBLE_RESERVED],
    bkrefs: [BkRef; NBKREF_IN_AGMAP],
}

const _: () = assert!(core::mem::size_of::<AgroupMap>() == BLOCK_SIZE);

impl AgroupMap {
    pub fn new(ag_index: u64, uuid: [u8; 16]) -> AgroupMap {
        AgroupMap {
            hdr: Header::new(VType::AgMap, core::mem::size_of::<AgroupMap>() as u32),
            uuid,
            ag_index: U64::new(ag_index),
            ag_nkb_used: U32::new(0),
            cipher_type: 1,
            cipher_mode: 1,
            _reserved: [0; AGMAP_PREAMBLE_RESERVED],
            bkrefs: [BkRef::default(); NBKREF_IN_AGMAP],
        }
    }

    pub fn ag_index(&self) -> u64 {
        self.ag_index.get()
    }

    pub fn nkb_used(&self) -> u32 {
        self.ag_nkb_used.get()
    }

    pub fn set_nkb_used(&mut self, n: u32) {
        self.ag_nkb_used = U32::new(n);
    }

    pub fn bkref(&self, idx: usize) -> &BkRef {
        &self.bkrefs[idx]
    }

    pub fn bkref_mut(&mut self, idx: usize) -> &mut BkRef {
        &mut self.bkrefs[idx]
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
    fn layout_sizes_match_block() {
        assert_eq!(core::mem::size_of::<AgroupMap>(), BLOCK_SIZE);
        assert_eq!(core::mem::size_of::<BkRef>(), 128);
        assert_eq!(core::mem::size_of::<Boctet>(), 8);
    }

    #[test]
    fn boctet_alloc_and_free_cycle() {
        let mut b = Boctet::default();
        assert!(b.is_free());
        b.alloc(VType::Data);
        assert!(!b.is_free());
        assert_eq!(b.vtype(), Some(VType::Data));
        assert!(b.decref());
        assert!(b.is_free());
    }
}
