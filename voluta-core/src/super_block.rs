//! The master record and super block: the two structures that make a raw
//! file recognizable as a Voluta volume (spec.md §3 "Volume layout").

use zerocopy::byteorder::little_endian::{I64, U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::consts::*;
use crate::crypto::Key;
use crate::error::{Error, Result};
use crate::header::Header;
use crate::vaddr::VType;

/// Number of IV-pool slots carried in the super block.
pub const NIV_SLOTS: usize = 761;
/// Number of key-pool slots carried in the super block.
pub const NKEY_SLOTS: usize = 1531;

/// The 1024-byte prologue at LBA 0 identifying the volume format.
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned, Clone, Copy)]
#[repr(C)]
pub struct MasterRecord {
    marker: U64,
    version: U64,
    reserved: [u8; MASTER_RECORD_SIZE - 16],
}

const _: () = assert!(core::mem::size_of::<MasterRecord>() == MASTER_RECORD_SIZE);

impl MasterRecord {
    pub fn new() -> MasterRecord {
        MasterRecord {
            marker: U64::new(MASTER_MARKER),
            version: U64::new(FORMAT_VERSION),
            reserved: [0; MASTER_RECORD_SIZE - 16],
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.marker.get() != MASTER_MARKER {
            return Err(Error::Corrupt("master record: bad marker"));
        }
        if self.version.get() != FORMAT_VERSION {
            return Err(Error::Corrupt("master record: unsupported version"));
        }
        Ok(())
    }
}

impl Default for MasterRecord {
    fn default() -> Self {
        Self::new()
    }
}

/// A NUL-free, length-prefixed name, as stored in the super block's
/// `s_fs_name` field.
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned, Clone, Copy)]
#[repr(C)]
pub struct StoredName {
    len: u8,
    bytes: [u8; 255],
}

impl StoredName {
    pub fn new(s: &str) -> Result<StoredName> {
        if s.len() > 255 {
            return Err(Error::name_too_long(s.len()));
        }
        let mut bytes = [0u8; 255];
        bytes[..s.len()].copy_from_slice(s.as_bytes());
        Ok(StoredName {
            len: s.len() as u8,
            bytes,
        })
    }

    pub fn as_str(&self) -> &str {
        std::str::from_utf8(&self.bytes[..self.len as usize]).unwrap_or("")
    }
}

/// 761 pool slots of 128-bit IVs plus 1531 pool slots of 256-bit keys, from
/// which per-`BkRef` (key, iv) pairs are cycled (`bi mod pool_len`) at
/// AG-map initialization time (spec.md §3, SPEC_FULL.md §2).
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned, Clone, Copy)]
#[repr(C)]
pub struct KeyIvPool {
    ivs: [[u8; IV_SIZE]; NIV_SLOTS],
    keys: [[u8; KEY_SIZE]; NKEY_SLOTS],
}

const _: () = assert!(
    core::mem::size_of::<KeyIvPool>() == NIV_SLOTS * IV_SIZE + NKEY_SLOTS * KEY_SIZE
);

impl KeyIvPool {
    pub fn iv_for(&self, bi: u64) -> [u8; IV_SIZE] {
        self.ivs[(bi as usize) % NIV_SLOTS]
    }

    pub fn key_for(&self, bi: u64) -> [u8; KEY_SIZE] {
        self.keys[(bi as usize) % NKEY_SLOTS]
    }

    pub fn fill_random(&mut self) {
        use rand::RngCore;
        let mut rng = rand::thread_rng();
        for iv in self.ivs.iter_mut() {
            rng.fill_bytes(iv);
        }
        for key in self.keys.iter_mut() {
            rng.fill_bytes(key);
        }
    }
}

/// Size of the reserved tail, chosen so the whole struct sums exactly to
/// `BLOCK_SIZE`. See DESIGN.md for the arithmetic.
const SB_RESERVED_SIZE: usize = BLOCK_SIZE
    - HEADER_SIZE
    - 8  // s_version
    - 8  // s_birth_time
    - 16 // s_uuid
    - 256 // s_fs_name
    - 8  // s_itable_root
    - 8  // s_next_ino
    - 1  // s_encrypted
    - KDF_SALT_SIZE
    - core::mem::size_of::<KeyIvPool>();

/// LBA 1: the volume-wide super block. Exactly one block in size.
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned, Clone, Copy)]
#[repr(C)]
pub struct SuperBlock {
    hdr: Header,
    version: U64,
    birth_time: U64,
    uuid: [u8; 16],
    fs_name: StoredName,
    itable_root: I64,
    /// Next inode number to mint, the persisted half of C4's "monotonically
    /// increasing counter" (spec.md §4.4); the recycle freelist itself is
    /// kept in memory only and rebuilt as unlinked inodes are encountered.
    next_ino: U64,
    encrypted: u8,
    kdf_salt: [u8; KDF_SALT_SIZE],
    pool: KeyIvPool,
    reserved: [u8; SB_RESERVED_SIZE],
}

const _: () = assert!(core::mem::size_of::<SuperBlock>() == BLOCK_SIZE);

impl SuperBlock {
    pub fn new(uuid: [u8; 16], fs_name: &str, birth_time: u64) -> Result<SuperBlock> {
        let mut pool = KeyIvPool {
            ivs: [[0u8; IV_SIZE]; NIV_SLOTS],
            keys: [[0u8; KEY_SIZE]; NKEY_SLOTS],
        };
        pool.fill_random();
        let mut kdf_salt = [0u8; KDF_SALT_SIZE];
        use rand::RngCore;
        rand::thread_rng().fill_bytes(&mut kdf_salt);
        Ok(SuperBlock {
            hdr: Header::new(VType::Super, core::mem::size_of::<SuperBlock>() as u32),
            version: U64::new(FORMAT_VERSION),
            birth_time: U64::new(birth_time),
            uuid,
            fs_name: StoredName::new(fs_name)?,
            itable_root: I64::new(-1),
            next_ino: U64::new(INO_ROOT + 1),
            encrypted: 0,
            kdf_salt,
            pool,
            reserved: [0; SB_RESERVED_SIZE],
        })
    }

    pub fn validate(&self) -> Result<()> {
        crate::header::verify(self.as_bytes())?;
        if self.hdr.vtype() != Some(VType::Super) {
            return Err(Error::Corrupt("super block: wrong vtype"));
        }
        if self.version.get() != FORMAT_VERSION {
            return Err(Error::Corrupt("super block: unsupported version"));
        }
        Ok(())
    }

    pub fn seal(&mut self) {
        let bytes = self.as_mut_bytes();
        crate::header::seal(bytes);
    }

    pub fn uuid(&self) -> [u8; 16] {
        self.uuid
    }

    pub fn fs_name(&self) -> &str {
        self.fs_name.as_str()
    }

    pub fn kdf_salt(&self) -> &[u8; KDF_SALT_SIZE] {
        &self.kdf_salt
    }

    pub fn itable_root(&self) -> Option<i64> {
        let v = self.itable_root.get();
        if v < 0 {
            None
        } else {
            Some(v)
        }
    }

    pub fn set_itable_root(&mut self, off: Option<i64>) {
        self.itable_root = I64::new(off.unwrap_or(-1));
    }

    pub fn next_ino(&self) -> u64 {
        self.next_ino.get()
    }

    pub fn set_next_ino(&mut self, ino: u64) {
        self.next_ino = U64::new(ino);
    }

    pub fn is_encrypted(&self) -> bool {
        self.encrypted != 0
    }

    pub fn set_encrypted(&mut self, v: bool) {
        self.encrypted = v as u8;
    }

    pub fn derive_block_key_iv(&self, master: &Key, bi: u64) -> ([u8; KEY_SIZE], [u8; IV_SIZE]) {
        let _ = master;
        (self.pool.key_for(bi), self.pool.iv_for(bi))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn master_record_round_trips() {
        let mr = MasterRecord::new();
        mr.validate().unwrap();
    }

    #[test]
    fn super_block_seals_and_validates() {
        let mut sb = SuperBlock::new([1u8; 16], "myvol", 1_700_000_000).unwrap();
        sb.seal();
        sb.validate().unwrap();
        assert_eq!(sb.fs_name(), "myvol");
    }

    #[test]
    fn super_block_is_exactly_one_block() {
        assert_eq!(core::mem::size_of::<SuperBlock>(), BLOCK_SIZE);
    }
}
