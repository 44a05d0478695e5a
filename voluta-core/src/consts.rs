//! Fixed geometry constants from the on-disk format.
//!
//! Values and names are pinned by `voluta-defs.h` in the original source;
//! where spec.md gives a derived quantity (e.g. `FILESIZE_MAX`) the formula
//! is kept alongside the constant so the two stay in sync.

/// Logical block size (64 KiB). Every on-disk meta-object and every I/O
/// through [`crate::device::BlockDevice`] is block-aligned to this size.
pub const BLOCK_SIZE: usize = 1 << 16;

/// Small ("kilo-block") size used for inode-head allocation granularity.
pub const KB_SIZE: usize = 1 << 10;

/// Block-octet size: 1/8 of a block, the smallest allocatable data unit.
pub const BO_SIZE: usize = BLOCK_SIZE / 8;

/// Number of block-octets per block.
pub const NBO_IN_BK: usize = BLOCK_SIZE / BO_SIZE;

/// Number of kilo-blocks per block.
pub const NKB_IN_BK: usize = BLOCK_SIZE / KB_SIZE;

/// Number of blocks per allocation group.
pub const NBK_IN_AG: u64 = 512;

/// Allocation group size in bytes (32 MiB).
pub const AG_SIZE: u64 = NBK_IN_AG * BLOCK_SIZE as u64;

/// Minimum volume size, in allocation groups.
pub const VOLUME_NAG_MIN: u64 = 64;

/// Maximum volume size, in allocation groups.
pub const VOLUME_NAG_MAX: u64 = 1 << 16;

/// Minimum volume size in bytes.
pub const VOLUME_SIZE_MIN: u64 = VOLUME_NAG_MIN * AG_SIZE;

/// Maximum volume size in bytes (~2 TiB).
pub const VOLUME_SIZE_MAX: u64 = VOLUME_NAG_MAX * AG_SIZE;

/// The well-known LBA of the super block.
pub const LBA_SUPER: u64 = 1;

/// Marker stored in the master record (ASCII `"@voluta@"`, read little-endian).
pub const MASTER_MARKER: u64 = 0x406174756c6f7640;

/// Current on-disk format version.
pub const FORMAT_VERSION: u64 = 1;

/// Size of the master record prologue.
pub const MASTER_RECORD_SIZE: usize = 1024;

/// Magic value at the start of every meta-block header (ASCII `'#VLT'`).
pub const HEADER_MAGIC: u32 = 0x2356_4c54;

/// Size of the common meta-data header.
pub const HEADER_SIZE: usize = 16;

/// Maximum length of a file/directory entry name, not including any terminator.
pub const NAME_MAX: usize = 255;

/// Maximum length of a full path.
pub const PATH_MAX: usize = 4096;

/// Maximum number of hard links to a file or sub-directory.
pub const LINK_MAX: u64 = 32_767;

/// Number of entries in a single inode-table radix node.
pub const ITNODE_NENTS: usize = 379;

/// Number of child slots in a single inode-table radix node.
pub const ITNODE_NSLOTS: usize = 256;

/// Bits-per-level used when descending the inode table by ino.
pub const ITNODE_SHIFT: u32 = 8;

/// On-disk size of the inode head.
pub const INODE_SIZE: usize = KB_SIZE;

/// Size of a single user data segment (one block-octet).
pub const DS_SIZE: usize = BO_SIZE;

/// Fan-out of a single level of the file radix-tree mapping.
pub const FILE_MAP_SHIFT: u32 = 10;

/// Number of child slots per file radix-tree node (1024-way).
pub const FILE_MAP_NCHILD: usize = 1 << FILE_MAP_SHIFT;

/// Maximum number of data segments addressable by a regular file.
pub const FILE_NDS_MAX: u64 = 1 << (FILE_MAP_SHIFT as u64 * 3);

/// Maximum regular-file size in bytes (~8 TiB).
pub const FILESIZE_MAX: u64 = (DS_SIZE as u64 * FILE_NDS_MAX) - 1;

/// Bit-shift used to hash-descend the directory H-tree (6-bit nibbles).
pub const DIR_HTNODE_SHIFT: u32 = 6;

/// Number of children per directory H-tree node.
pub const DIR_HTNODE_NCHILDS: usize = 1 << DIR_HTNODE_SHIFT;

/// Maximum depth of the directory H-tree.
pub const DIR_HTREE_DEPTH_MAX: u32 = 4;

/// Number of directory-entry granules (slots) per H-tree node.
pub const DIR_HTNODE_NENTS: usize = 476;

/// Byte size of one directory-entry granule (== size of [`crate::dir::DirEntryHeader`]).
pub const DIR_GRANULE_SIZE: usize = 16;

/// Upper bound on the number of H-tree nodes in one directory (depth-bounded).
pub const DIR_HTREE_NODE_MAX: u64 = (1u64 << (DIR_HTNODE_SHIFT * DIR_HTREE_DEPTH_MAX)) - 1;

/// Idealized maximum directory entry count (reached only with empty names).
pub const DIR_ENTRIES_MAX: u64 = DIR_HTNODE_NENTS as u64 * DIR_HTREE_NODE_MAX;

/// Max size of an in-inode inline symlink value.
pub const SYMLNK_HEAD_MAX: usize = 472;

/// Max size of a single out-of-line symlink part.
pub const SYMLNK_PART_MAX: usize = 960;

/// Max number of out-of-line symlink parts.
pub const SYMLNK_NPARTS: usize = 5;

/// Maximum size of a symlink value, inline or spilled: the inline head
/// plus all out-of-line parts (spec.md §3 "up to 960 bytes x 5 parts ->
/// 5 KiB max"), independent of [`PATH_MAX`].
pub const SYMLNK_MAX: usize = SYMLNK_HEAD_MAX + SYMLNK_NPARTS * SYMLNK_PART_MAX;

/// Number of inline xattr entries carried in the inode head.
pub const XATTR_INENTS: usize = 32;

/// Number of entries in a single out-of-line xattr node.
pub const XATTR_NENTS: usize = 1016;

/// Max length of a single xattr value.
pub const XATTR_VALUE_MAX: usize = 512;

/// Symmetric cipher key size (AES-256).
pub const KEY_SIZE: usize = 32;

/// Initialization-vector size as stored on disk (128 bits).
pub const IV_SIZE: usize = 16;

/// Nonce size actually consumed by AES-256-GCM (96 bits); the low
/// [`IV_SIZE`] - [`GCM_NONCE_SIZE`] bytes of the stored IV are unused.
/// See DESIGN.md for the rationale (spec.md I8 / Open Questions).
pub const GCM_NONCE_SIZE: usize = 12;

/// Salt size for the master-key KDF.
pub const KDF_SALT_SIZE: usize = 128;

/// Root inode number, exported to the VFS.
pub const INO_ROOT: u64 = 1;

/// The "nil" inode number.
pub const INO_NULL: u64 = 0;

/// Maximum number of symlink resolutions before `Loop` is raised.
pub const SYMLOOP_MAX: u32 = 40;
