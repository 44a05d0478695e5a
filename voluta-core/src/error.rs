//! Engine error kinds (spec.md §7).
//!
//! Mirrors the style of `panda-kernel::vfs::FsError` (a flat, `Debug`-only
//! enum threaded through `Result`) but adds `thiserror`-derived messages and
//! context fields, following `Martinits-eccfs`/`realchonk-fuse-ufs`.

use crate::vaddr::{Lba, VAddr};

pub type Result<T> = std::result::Result<T, Error>;

/// All error kinds the engine can surface to a caller.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("no such file or directory")]
    NoEnt,

    #[error("file exists")]
    Exists,

    #[error("not a directory")]
    NotDir,

    #[error("is a directory")]
    IsDir,

    #[error("directory not empty")]
    NotEmpty,

    #[error("name too long: {len} bytes (max {max})")]
    NameTooLong { len: usize, max: usize },

    #[error("too many levels of symbolic links")]
    Loop,

    #[error("no space left on device")]
    NoSpace,

    #[error("disk quota exceeded")]
    Dquot,

    #[error("file too large")]
    Fbig,

    #[error("invalid argument: {0}")]
    Invalid(&'static str),

    #[error("operation not permitted")]
    Perm,

    #[error("permission denied")]
    Access,

    #[error("read-only file system")]
    Rofs,

    #[error("cross-device link")]
    Xdev,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("integrity check failed at lba {lba:?}")]
    IntegrityError { lba: Lba },

    #[error("on-disk structure corrupt: {0}")]
    Corrupt(&'static str),

    #[error("resource busy")]
    Busy,

    #[error("operation cancelled")]
    Cancelled,
}

impl Error {
    pub fn name_too_long(len: usize) -> Self {
        Error::NameTooLong {
            len,
            max: crate::consts::NAME_MAX,
        }
    }
}

/// Panics on a violated internal invariant (I1-I8), distinct from
/// user-induced [`Error`]s, which never `panic!`. See spec.md §7.
#[track_caller]
pub fn invariant_violation(what: &str, vaddr: Option<VAddr>) -> ! {
    match vaddr {
        Some(v) => panic!("voluta: internal invariant violated: {what} (at {v:?})"),
        None => panic!("voluta: internal invariant violated: {what}"),
    }
}
