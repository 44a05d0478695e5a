//! Virtual addressing: LBAs, block-octet indices, and the [`VAddr`] /
//! [`VType`] pair used throughout the cache, allocator, and every on-disk
//! pointer field.

use crate::consts::{BLOCK_SIZE, BO_SIZE, NBO_IN_BK};

/// A logical block address, in units of [`BLOCK_SIZE`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Lba(pub u64);

impl Lba {
    pub const NULL: Lba = Lba(u64::MAX);

    pub fn byte_offset(self) -> u64 {
        self.0 * BLOCK_SIZE as u64
    }
}

/// Classifies what a given block-octet currently stores (I2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum VType {
    None = 0,
    Super = 1,
    AgMap = 2,
    ItNode = 3,
    Inode = 4,
    XaNode = 5,
    HtNode = 6,
    RtNode = 7,
    SymVal = 8,
    Data = 16,
}

impl VType {
    pub fn from_u8(v: u8) -> Option<VType> {
        Some(match v {
            0 => VType::None,
            1 => VType::Super,
            2 => VType::AgMap,
            3 => VType::ItNode,
            4 => VType::Inode,
            5 => VType::XaNode,
            6 => VType::HtNode,
            7 => VType::RtNode,
            8 => VType::SymVal,
            16 => VType::Data,
            _ => return None,
        })
    }

    /// Whether objects of this type require a whole empty block (vs. being
    /// allowed to share a block with other boctet- or kilo-sized objects,
    /// per spec.md §4.2). `Inode` heads are kilo-block granular; `RtNode`
    /// and `Data` are exactly one block-octet each (spec.md §4.5's
    /// "8 KiB node", §3's data segment) and so also share a block with
    /// seven siblings rather than reserving one block apiece.
    pub fn is_block_sized(self) -> bool {
        !matches!(self, VType::Inode | VType::RtNode | VType::Data)
    }
}

/// A virtual address: a byte offset within the volume identifying the
/// location of some object. Always block-octet aligned.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VAddr(pub u64);

impl VAddr {
    pub const NULL: VAddr = VAddr(0);

    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    pub fn lba(self) -> Lba {
        Lba(self.0 / BLOCK_SIZE as u64)
    }

    /// Index of the block-octet within its containing block, `0..NBO_IN_BK`.
    pub fn boctet_index(self) -> usize {
        ((self.0 % BLOCK_SIZE as u64) / BO_SIZE as u64) as usize
    }

    pub fn from_lba(lba: Lba) -> VAddr {
        VAddr(lba.0 * BLOCK_SIZE as u64)
    }

    pub fn from_lba_boctet(lba: Lba, boctet: usize) -> VAddr {
        debug_assert!(boctet < NBO_IN_BK);
        VAddr(lba.0 * BLOCK_SIZE as u64 + (boctet * BO_SIZE) as u64)
    }

    pub fn byte_offset(self) -> u64 {
        self.0
    }
}

impl std::fmt::Debug for VAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "VAddr({:#x})", self.0)
    }
}

/// Signed, 7-byte (56-bit) little-endian pointer, used for the file
/// radix-tree's child slots (spec.md §3: "1024 56-bit child pointers").
/// `NIL` is represented as all-one bits.
#[derive(
    zerocopy::FromBytes,
    zerocopy::IntoBytes,
    zerocopy::Immutable,
    zerocopy::KnownLayout,
    zerocopy::Unaligned,
    Clone,
    Copy,
    PartialEq,
    Eq,
)]
#[repr(C)]
pub struct Int56([u8; 7]);

impl Int56 {
    pub const NIL: Int56 = Int56([0xff; 7]);

    pub fn from_i64(v: i64) -> Int56 {
        if v == -1 {
            return Int56::NIL;
        }
        let b = v.to_le_bytes();
        let mut out = [0u8; 7];
        out.copy_from_slice(&b[..7]);
        Int56(out)
    }

    pub fn to_i64(self) -> i64 {
        if self == Int56::NIL {
            return -1;
        }
        let mut b = [0u8; 8];
        b[..7].copy_from_slice(&self.0);
        // Sign-extend the 56th bit.
        if self.0[6] & 0x80 != 0 {
            b[7] = 0xff;
        }
        i64::from_le_bytes(b)
    }

    pub fn is_nil(self) -> bool {
        self == Int56::NIL
    }
}

impl Default for Int56 {
    fn default() -> Self {
        Int56::NIL
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn int56_round_trips_positive_and_nil() {
        assert!(Int56::from_i64(-1).is_nil());
        assert_eq!(Int56::from_i64(12345).to_i64(), 12345);
        assert_eq!(Int56::from_i64(0).to_i64(), 0);
        let max = (1i64 << 55) - 1;
        assert_eq!(Int56::from_i64(max).to_i64(), max);
    }

    #[test]
    fn vaddr_lba_and_boctet_roundtrip() {
        let v = VAddr::from_lba_boctet(Lba(7), 3);
        assert_eq!(v.lba(), Lba(7));
        assert_eq!(v.boctet_index(), 3);
    }
}
