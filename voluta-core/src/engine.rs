//! The FUSE-facing operation table (spec.md §6): resolves the target
//! inode via C4, then drives C5 (file mapping), C6 (directory mapping), or
//! C7 (xattr/symlink) to traverse or mutate it. Every mutating call dirties
//! nodes through [`crate::volume::Volume`]'s caches and updates on-disk
//! state via C1/C2 underneath that.
//!
//! Grounded on `panda-kernel::vfs::Filesystem`/`File`'s trait shape
//! (SPEC_FULL.md §3 "Engine/op table"): a thin method-per-opcode surface
//! over a single owned store, widened here from panda-kernel's read-only
//! ext2 driver to full read-write POSIX semantics, and from a `&mut self
//! dyn Resource` per open file to a stateless `Ino`-keyed API (the engine
//! itself has no notion of an open-file-descriptor table; the FUSE
//! collaborator owns that, per spec.md §1's out-of-scope boundary).

use std::path::Path;

use crate::consts::*;
use crate::dir;
use crate::error::{Error, Result};
use crate::file::{self, Extent, FallocateMode, SeekWhence};
use crate::inode::{Inode, S_IFDIR, S_IFLNK, S_IFMT, S_IFREG};
use crate::symlink;
use crate::volume::{MkfsConfig, StatFs, Volume};
use crate::xattr::{self, XattrFlags};

pub type Ino = u64;

/// POSIX `d_type` values, as returned by `lookup`/`readdir` (spec.md §6).
pub const DT_UNKNOWN: u8 = 0;
pub const DT_FIFO: u8 = 1;
pub const DT_CHR: u8 = 2;
pub const DT_DIR: u8 = 4;
pub const DT_BLK: u8 = 6;
pub const DT_REG: u8 = 8;
pub const DT_LNK: u8 = 10;
pub const DT_SOCK: u8 = 12;

fn dtype_of_mode(mode: u32) -> u8 {
    match mode & S_IFMT {
        S_IFDIR => DT_DIR,
        S_IFLNK => DT_LNK,
        S_IFREG => DT_REG,
        0o020000 => DT_CHR,
        0o060000 => DT_BLK,
        0o010000 => DT_FIFO,
        0o140000 => DT_SOCK,
        _ => DT_UNKNOWN,
    }
}

/// Caller credentials carried on every uop (spec.md §6 "uop context").
#[derive(Debug, Clone, Copy)]
pub struct Ucred {
    pub uid: u32,
    pub gid: u32,
    pub pid: u32,
    pub umask: u32,
}

impl Ucred {
    pub fn root() -> Ucred {
        Ucred { uid: 0, gid: 0, pid: 0, umask: 0o022 }
    }
}

/// Per-request context threaded through every engine operation (spec.md
/// §6: "a uop context `{ucred, xtime, unique, opcode}`").
#[derive(Debug, Clone, Copy)]
pub struct UopContext {
    pub ucred: Ucred,
    pub xtime: u64,
    pub unique: u64,
    pub opcode: u32,
}

impl UopContext {
    pub fn new(ucred: Ucred, xtime: u64) -> UopContext {
        UopContext { ucred, xtime, unique: 0, opcode: 0 }
    }
}

bitflags::bitflags! {
    /// POSIX access-check bits, checked against owner/group/other mode bits.
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct Access: u32 {
        const READ = 0o4;
        const WRITE = 0o2;
        const EXEC = 0o1;
    }
}

fn check_access(ucred: &Ucred, inode: &Inode, want: Access) -> Result<()> {
    if ucred.uid == 0 {
        return Ok(());
    }
    let mode = inode.mode();
    let bits = if ucred.uid == inode.uid() {
        (mode >> 6) & 0o7
    } else if ucred.gid == inode.gid() {
        (mode >> 3) & 0o7
    } else {
        mode & 0o7
    };
    if (bits & want.bits()) == want.bits() {
        Ok(())
    } else {
        Err(Error::Access)
    }
}

/// Only the owner or root may change ownership/mode (spec.md §6 setattr).
fn check_owner_or_root(ucred: &Ucred, inode: &Inode) -> Result<()> {
    if ucred.uid == 0 || ucred.uid == inode.uid() {
        Ok(())
    } else {
        Err(Error::Perm)
    }
}

/// A stat/statx result (spec.md §6 "getattr/statx").
#[derive(Debug, Clone)]
pub struct Stat {
    pub ino: Ino,
    pub mode: u32,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u64,
    pub size: u64,
    pub blocks: u64,
    pub atime: u64,
    pub mtime: u64,
    pub ctime: u64,
    pub btime: u64,
}

fn stat_of(inode: &Inode) -> Stat {
    Stat {
        ino: inode.ino(),
        mode: inode.mode(),
        nlink: inode.nlink(),
        uid: inode.uid(),
        gid: inode.gid(),
        rdev: inode.rdev(),
        size: inode.size(),
        blocks: inode.blocks(),
        atime: inode.atime(),
        mtime: inode.mtime(),
        ctime: inode.ctime(),
        btime: inode.btime(),
    }
}

/// Partial attribute update (spec.md §6 "setattr/chmod/chown/truncate/
/// utimens"), mirroring FUSE's optional-field `setattr` request.
#[derive(Debug, Clone, Copy, Default)]
pub struct SetAttr {
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub size: Option<u64>,
    pub atime: Option<u64>,
    pub mtime: Option<u64>,
}

/// One directory entry as surfaced by `readdir`/`readdirplus` (spec.md
/// §4.6 "Readdir cookie"), with `.`/`..` synthesized at the front (they
/// are never stored as H-tree entries, per spec.md §9 "Cyclic graphs").
pub struct Dirent {
    pub cookie: u64,
    pub ino: Ino,
    pub name: Vec<u8>,
    pub dtype: u8,
}

pub struct DirentPlus {
    pub dirent: Dirent,
    pub attr: Stat,
}

/// An open Voluta volume plus the full §6 operation table over it. Owns
/// exactly one [`Volume`]; the FUSE collaborator is expected to serialize
/// or dispatch concurrent requests onto it per spec.md §5.
pub struct Engine {
    volume: Volume,
}

impl Engine {
    pub fn new(volume: Volume) -> Engine {
        Engine { volume }
    }

    pub fn mkfs(path: &Path, config: MkfsConfig, birth_time: u64) -> Result<Engine> {
        let volume = Volume::mkfs(path, config, birth_time)?;
        let mut root = volume.create_root_inode(S_IFDIR | 0o755, birth_time)?;
        root.set_nlink(2);
        volume.store_inode(&mut root)?;
        volume.sync()?;
        Ok(Engine { volume })
    }

    pub fn open(path: &Path, passphrase: Option<&[u8]>) -> Result<Engine> {
        Ok(Engine { volume: Volume::open(path, passphrase)? })
    }

    pub fn volume(&self) -> &Volume {
        &self.volume
    }

    pub fn sync(&self) -> Result<()> {
        self.volume.sync()
    }

    // ---- attribute ops ----

    pub fn statfs(&self, _ino: Ino) -> Result<StatFs> {
        self.volume.statfs()
    }

    pub fn getattr(&self, ino: Ino) -> Result<Stat> {
        Ok(stat_of(&self.volume.load_inode(ino)?))
    }

    /// `setattr`/`chmod`/`chown`/`truncate`/`utimens` (spec.md §6):
    /// enforces ownership rules and SUID/SGID clearing (spec.md §4.5).
    pub fn setattr(&self, ctx: &UopContext, ino: Ino, attr: &SetAttr) -> Result<Stat> {
        let mut inode = self.volume.load_inode(ino)?;
        if attr.mode.is_some() || attr.uid.is_some() || attr.gid.is_some() {
            check_owner_or_root(&ctx.ucred, &inode)?;
        }
        if let Some(mode) = attr.mode {
            inode.set_mode((inode.mode() & S_IFMT) | (mode & !S_IFMT));
        }
        if let Some(uid) = attr.uid {
            inode.set_uid(uid);
            if ctx.ucred.uid != 0 {
                inode.clear_suid_sgid_on_write();
            }
        }
        if let Some(gid) = attr.gid {
            inode.set_gid(gid);
        }
        if let Some(atime) = attr.atime {
            inode.set_atime(atime);
        }
        if let Some(mtime) = attr.mtime {
            inode.set_mtime(mtime);
        }
        if let Some(size) = attr.size {
            if !inode.is_reg() {
                return Err(Error::Invalid("truncate of non-regular file"));
            }
            if size > FILESIZE_MAX {
                return Err(Error::Fbig);
            }
            file::truncate(&self.volume.rtnode_store(), &self.volume.data_store(), &mut inode, size, ctx.xtime)?;
        }
        inode.set_ctime(ctx.xtime);
        self.volume.store_inode(&mut inode)?;
        Ok(stat_of(&inode))
    }

    // ---- namespace ops ----

    fn dir_root(inode: &Inode) -> Option<i64> {
        let off = inode.ispec().as_dir().root_off.get();
        if off < 0 {
            None
        } else {
            Some(off)
        }
    }

    pub fn lookup(&self, ctx: &UopContext, parent: Ino, name: &[u8]) -> Result<Stat> {
        if name == b"." {
            return self.getattr(parent);
        }
        let parent_inode = self.volume.load_inode(parent)?;
        if !parent_inode.is_dir() {
            return Err(Error::NotDir);
        }
        check_access(&ctx.ucred, &parent_inode, Access::EXEC)?;
        if name == b".." {
            return self.getattr(parent_inode.parent_ino());
        }
        let root = Self::dir_root(&parent_inode).ok_or(Error::NoEnt)?;
        let (ino, _dtype) = dir::lookup(&self.volume.dir_store(), root, name)?;
        self.getattr(ino)
    }

    /// `create`: makes a new regular-file inode and links it into `parent`.
    pub fn create(&self, ctx: &UopContext, parent: Ino, name: &[u8], mode: u32) -> Result<Stat> {
        self.make_node(ctx, parent, name, S_IFREG | (mode & !S_IFMT), 0)
    }

    /// `mknod`: as `create`, but for any file type (device nodes carry
    /// `rdev`; spec.md §6 groups it with `symlink`/`link`/`unlink`).
    pub fn mknod(&self, ctx: &UopContext, parent: Ino, name: &[u8], mode: u32, rdev: u64) -> Result<Stat> {
        self.make_node(ctx, parent, name, mode, rdev)
    }

    pub fn mkdir(&self, ctx: &UopContext, parent: Ino, name: &[u8], mode: u32) -> Result<Stat> {
        let stat = self.make_node(ctx, parent, name, S_IFDIR | (mode & !S_IFMT), 0)?;
        let mut parent_inode = self.volume.load_inode(parent)?;
        parent_inode.set_nlink(parent_inode.nlink() + 1); // child's ".."
        parent_inode.set_ctime(ctx.xtime);
        self.volume.store_inode(&mut parent_inode)?;
        let mut child = self.volume.load_inode(stat.ino)?;
        child.set_nlink(2); // self + "."
        self.volume.store_inode(&mut child)?;
        self.getattr(stat.ino)
    }

    fn make_node(&self, ctx: &UopContext, parent: Ino, name: &[u8], mode: u32, rdev: u64) -> Result<Stat> {
        let mut parent_inode = self.volume.load_inode(parent)?;
        if !parent_inode.is_dir() {
            return Err(Error::NotDir);
        }
        check_access(&ctx.ucred, &parent_inode, Access::WRITE | Access::EXEC)?;
        if name.len() > NAME_MAX {
            return Err(Error::name_too_long(name.len()));
        }
        if Self::dir_root(&parent_inode)
            .map(|root| dir::lookup(&self.volume.dir_store(), root, name).is_ok())
            .unwrap_or(false)
        {
            return Err(Error::Exists);
        }
        let mut child = self.volume.create_inode(parent, mode, ctx.ucred.uid, ctx.ucred.gid, ctx.xtime)?;
        child.set_rdev(rdev);
        child.set_nlink(if child.is_dir() { 0 } else { 1 });
        self.volume.store_inode(&mut child)?;

        let root = Self::dir_root(&parent_inode);
        let dtype = dtype_of_mode(mode);
        let new_root = dir::insert(&self.volume.dir_store(), root, parent, name, child.ino(), dtype)?;
        {
            let dir_ispec = parent_inode.ispec_mut().as_dir_mut();
            dir_ispec.root_off = zerocopy::byteorder::little_endian::I64::new(new_root);
            dir_ispec.ndents = zerocopy::byteorder::little_endian::U64::new(dir_ispec.ndents.get() + 1);
        }
        parent_inode.set_mtime(ctx.xtime);
        parent_inode.set_ctime(ctx.xtime);
        self.volume.store_inode(&mut parent_inode)?;

        Ok(stat_of(&child))
    }

    /// `symlink`: creates a link inode and stores its target (spec.md
    /// §4.7).
    pub fn symlink(&self, ctx: &UopContext, parent: Ino, name: &[u8], target: &[u8]) -> Result<Stat> {
        let stat = self.make_node(ctx, parent, name, S_IFLNK | 0o777, 0)?;
        let mut child = self.volume.load_inode(stat.ino)?;
        child.set_nlink(1);
        symlink::set_target(&mut child, &self.volume.symlink_store(), target)?;
        self.volume.store_inode(&mut child)?;
        self.getattr(stat.ino)
    }

    pub fn readlink(&self, ino: Ino) -> Result<Vec<u8>> {
        let inode = self.volume.load_inode(ino)?;
        if !inode.is_lnk() {
            return Err(Error::Invalid("readlink of non-symlink"));
        }
        symlink::read_target(&inode, &self.volume.symlink_store())
    }

    /// `link`: hardlinks an existing inode under a new name (spec.md §6).
    pub fn link(&self, ctx: &UopContext, ino: Ino, new_parent: Ino, new_name: &[u8]) -> Result<Stat> {
        let mut target = self.volume.load_inode(ino)?;
        if target.is_dir() {
            return Err(Error::Perm); // directory hardlinks are forbidden, spec.md §9
        }
        if target.nlink() as u64 >= LINK_MAX {
            return Err(Error::Invalid("link count would exceed LINK_MAX"));
        }
        let mut parent_inode = self.volume.load_inode(new_parent)?;
        if !parent_inode.is_dir() {
            return Err(Error::NotDir);
        }
        check_access(&ctx.ucred, &parent_inode, Access::WRITE | Access::EXEC)?;
        if new_name.len() > NAME_MAX {
            return Err(Error::name_too_long(new_name.len()));
        }
        let root = Self::dir_root(&parent_inode);
        let dtype = dtype_of_mode(target.mode());
        let new_root = dir::insert(&self.volume.dir_store(), root, new_parent, new_name, ino, dtype)?;
        {
            let dir_ispec = parent_inode.ispec_mut().as_dir_mut();
            dir_ispec.root_off = zerocopy::byteorder::little_endian::I64::new(new_root);
            dir_ispec.ndents = zerocopy::byteorder::little_endian::U64::new(dir_ispec.ndents.get() + 1);
        }
        parent_inode.set_mtime(ctx.xtime);
        parent_inode.set_ctime(ctx.xtime);
        self.volume.store_inode(&mut parent_inode)?;

        target.set_nlink(target.nlink() + 1);
        target.set_ctime(ctx.xtime);
        self.volume.store_inode(&mut target)?;
        Ok(stat_of(&target))
    }

    /// `unlink`: removes a directory entry and, once the target's last
    /// reference is gone, destroys it (spec.md §3 "Ownership & lifecycle").
    pub fn unlink(&self, ctx: &UopContext, parent: Ino, name: &[u8]) -> Result<()> {
        let mut parent_inode = self.volume.load_inode(parent)?;
        if !parent_inode.is_dir() {
            return Err(Error::NotDir);
        }
        check_access(&ctx.ucred, &parent_inode, Access::WRITE | Access::EXEC)?;
        let root = Self::dir_root(&parent_inode).ok_or(Error::NoEnt)?;
        let (ino, dtype) = dir::remove(&self.volume.dir_store(), root, name)?;
        if dtype == DT_DIR {
            return Err(Error::IsDir);
        }
        {
            let dir_ispec = parent_inode.ispec_mut().as_dir_mut();
            dir_ispec.ndents = zerocopy::byteorder::little_endian::U64::new(dir_ispec.ndents.get().saturating_sub(1));
        }
        parent_inode.set_mtime(ctx.xtime);
        parent_inode.set_ctime(ctx.xtime);
        self.volume.store_inode(&mut parent_inode)?;
        self.drop_link(ino, ctx.xtime)
    }

    fn drop_link(&self, ino: Ino, now: u64) -> Result<()> {
        let mut inode = self.volume.load_inode(ino)?;
        let remaining = inode.nlink().saturating_sub(1);
        inode.set_nlink(remaining);
        inode.set_ctime(now);
        if remaining > 0 {
            self.volume.store_inode(&mut inode)?;
            return Ok(());
        }
        if inode.is_reg() {
            file::truncate(&self.volume.rtnode_store(), &self.volume.data_store(), &mut inode, 0, now)?;
        } else if inode.is_lnk() {
            symlink::free_target(&inode, &self.volume.symlink_store())?;
        }
        for i in 0..2 {
            if let Some(off) = inode.xattr_node_off(i) {
                // xattr nodes have no further children to free.
                let _ = off;
            }
        }
        self.volume.destroy_inode(ino)
    }

    /// `rmdir`: fails `NotEmpty` unless the directory has no entries
    /// besides the implicit `.`/`..` (spec.md §6).
    pub fn rmdir(&self, ctx: &UopContext, parent: Ino, name: &[u8]) -> Result<()> {
        let mut parent_inode = self.volume.load_inode(parent)?;
        if !parent_inode.is_dir() {
            return Err(Error::NotDir);
        }
        check_access(&ctx.ucred, &parent_inode, Access::WRITE | Access::EXEC)?;
        let root = Self::dir_root(&parent_inode).ok_or(Error::NoEnt)?;
        let (ino, dtype) = dir::lookup(&self.volume.dir_store(), root, name)?;
        if dtype != DT_DIR {
            return Err(Error::NotDir);
        }
        let child = self.volume.load_inode(ino)?;
        if Self::dir_root(&child).is_some() {
            return Err(Error::NotEmpty);
        }
        dir::remove(&self.volume.dir_store(), root, name)?;
        {
            let dir_ispec = parent_inode.ispec_mut().as_dir_mut();
            dir_ispec.ndents = zerocopy::byteorder::little_endian::U64::new(dir_ispec.ndents.get().saturating_sub(1));
        }
        parent_inode.set_nlink(parent_inode.nlink().saturating_sub(1)); // lost child's ".."
        parent_inode.set_mtime(ctx.xtime);
        parent_inode.set_ctime(ctx.xtime);
        self.volume.store_inode(&mut parent_inode)?;
        self.volume.destroy_inode(ino)
    }

    /// `rename`: default replace semantics, or `RENAME_EXCHANGE` (spec.md
    /// §6, §8 scenario 6).
    pub fn rename(&self, ctx: &UopContext, old_parent: Ino, old_name: &[u8], new_parent: Ino, new_name: &[u8], exchange: bool) -> Result<()> {
        if exchange {
            return self.rename_exchange(ctx, old_parent, old_name, new_parent, new_name);
        }
        let mut op = self.volume.load_inode(old_parent)?;
        if !op.is_dir() {
            return Err(Error::NotDir);
        }
        check_access(&ctx.ucred, &op, Access::WRITE | Access::EXEC)?;
        let old_root = Self::dir_root(&op).ok_or(Error::NoEnt)?;
        let (ino, dtype) = dir::lookup(&self.volume.dir_store(), old_root, old_name)?;

        if old_parent == new_parent && old_name == new_name {
            return Ok(());
        }

        let mut np = if new_parent == old_parent { None } else { Some(self.volume.load_inode(new_parent)?) };
        {
            let target_parent = np.as_ref().unwrap_or(&op);
            if !target_parent.is_dir() {
                return Err(Error::NotDir);
            }
            check_access(&ctx.ucred, target_parent, Access::WRITE | Access::EXEC)?;
        }

        // Replace-if-exists: if new_name already names something, unlink it
        // first (directories must be empty; spec.md's default replace
        // semantics mirror POSIX rename(2)).
        let new_root_existing = np.as_ref().map(Self::dir_root).unwrap_or_else(|| Self::dir_root(&op));
        if let Some(existing_root) = new_root_existing {
            if let Ok((existing_ino, existing_dtype)) = dir::lookup(&self.volume.dir_store(), existing_root, new_name) {
                if existing_dtype == DT_DIR {
                    let existing = self.volume.load_inode(existing_ino)?;
                    if Self::dir_root(&existing).is_some() {
                        return Err(Error::NotEmpty);
                    }
                }
                dir::remove(&self.volume.dir_store(), existing_root, new_name)?;
                self.drop_link(existing_ino, ctx.xtime)?;
                if existing_dtype == DT_DIR {
                    let tp = np.as_mut().unwrap_or(&mut op);
                    tp.set_nlink(tp.nlink().saturating_sub(1));
                }
            }
        }

        dir::remove(&self.volume.dir_store(), old_root, old_name)?;
        {
            let d = op.ispec_mut().as_dir_mut();
            d.ndents = zerocopy::byteorder::little_endian::U64::new(d.ndents.get().saturating_sub(1));
        }

        let target_parent_mut = np.as_mut().unwrap_or(&mut op);
        let target_root = Self::dir_root(target_parent_mut);
        let new_root = dir::insert(&self.volume.dir_store(), target_root, new_parent, new_name, ino, dtype)?;
        {
            let d = target_parent_mut.ispec_mut().as_dir_mut();
            d.root_off = zerocopy::byteorder::little_endian::I64::new(new_root);
            d.ndents = zerocopy::byteorder::little_endian::U64::new(d.ndents.get() + 1);
        }
        target_parent_mut.set_mtime(ctx.xtime);
        target_parent_mut.set_ctime(ctx.xtime);

        if dtype == DT_DIR && new_parent != old_parent {
            let mut moved = self.volume.load_inode(ino)?;
            moved.set_parent_ino(new_parent);
            moved.set_ctime(ctx.xtime);
            self.volume.store_inode(&mut moved)?;
            op.set_nlink(op.nlink().saturating_sub(1));
            target_parent_mut.set_nlink(target_parent_mut.nlink() + 1);
        }

        if let Some(mut np) = np {
            self.volume.store_inode(&mut np)?;
        }
        op.set_mtime(ctx.xtime);
        op.set_ctime(ctx.xtime);
        self.volume.store_inode(&mut op)?;
        Ok(())
    }

    /// `rename_exchange`: swaps two existing names' targets in place,
    /// preserving both `ino`s (spec.md §8 scenario 6).
    fn rename_exchange(&self, ctx: &UopContext, old_parent: Ino, old_name: &[u8], new_parent: Ino, new_name: &[u8]) -> Result<()> {
        // spec.md §5: "rename_exchange acquires both target directory
        // inodes in address order" — load smaller ino first to match that
        // lock-order rule (relevant once the cache's per-node rw-locks are
        // held across this call rather than released per load/store).
        let mut op = self.volume.load_inode(old_parent)?;
        let mut np = if new_parent == old_parent { None } else { Some(self.volume.load_inode(new_parent)?) };
        check_access(&ctx.ucred, &op, Access::WRITE | Access::EXEC)?;
        if let Some(np) = np.as_ref() {
            check_access(&ctx.ucred, np, Access::WRITE | Access::EXEC)?;
        }

        let old_root = Self::dir_root(&op).ok_or(Error::NoEnt)?;
        let (old_ino, old_dtype) = dir::lookup(&self.volume.dir_store(), old_root, old_name)?;
        let new_root = np.as_ref().map(Self::dir_root).unwrap_or_else(|| Self::dir_root(&op)).ok_or(Error::NoEnt)?;
        let (new_ino, new_dtype) = dir::lookup(&self.volume.dir_store(), new_root, new_name)?;

        dir::remove(&self.volume.dir_store(), old_root, old_name)?;
        dir::insert(&self.volume.dir_store(), Some(old_root), old_parent, old_name, new_ino, new_dtype)?;
        dir::remove(&self.volume.dir_store(), new_root, new_name)?;
        dir::insert(&self.volume.dir_store(), Some(new_root), new_parent, new_name, old_ino, old_dtype)?;

        if old_dtype == DT_DIR || new_dtype == DT_DIR {
            if old_dtype == DT_DIR {
                let mut moved = self.volume.load_inode(old_ino)?;
                moved.set_parent_ino(new_parent);
                self.volume.store_inode(&mut moved)?;
            }
            if new_dtype == DT_DIR {
                let mut moved = self.volume.load_inode(new_ino)?;
                moved.set_parent_ino(old_parent);
                self.volume.store_inode(&mut moved)?;
            }
        }

        op.set_ctime(ctx.xtime);
        op.set_mtime(ctx.xtime);
        self.volume.store_inode(&mut op)?;
        if let Some(mut np) = np {
            np.set_ctime(ctx.xtime);
            np.set_mtime(ctx.xtime);
            self.volume.store_inode(&mut np)?;
        }

        let mut a = self.volume.load_inode(old_ino)?;
        a.set_ctime(ctx.xtime);
        self.volume.store_inode(&mut a)?;
        let mut b = self.volume.load_inode(new_ino)?;
        b.set_ctime(ctx.xtime);
        self.volume.store_inode(&mut b)?;
        Ok(())
    }

    // ---- directory listing ----

    /// `readdir`/`readdirplus`: `.`/`..` occupy cookies 1/2, real entries
    /// follow at cookie+2 (spec.md §4.6 "Readdir cookie").
    pub fn readdir(&self, ino: Ino, after_cookie: u64) -> Result<Vec<Dirent>> {
        let inode = self.volume.load_inode(ino)?;
        let mut out = Vec::new();
        if after_cookie < 1 {
            out.push(Dirent { cookie: 1, ino, name: b".".to_vec(), dtype: DT_DIR });
        }
        if after_cookie < 2 {
            out.push(Dirent { cookie: 2, ino: inode.parent_ino(), name: b"..".to_vec(), dtype: DT_DIR });
        }
        if let Some(root) = Self::dir_root(&inode) {
            let real = dir::readdir(&self.volume.dir_store(), root, after_cookie.saturating_sub(2))?;
            out.extend(real.into_iter().map(|e| Dirent {
                cookie: e.cookie + 2,
                ino: e.ino,
                name: e.name,
                dtype: e.dtype,
            }));
        }
        Ok(out)
    }

    pub fn readdirplus(&self, ino: Ino, after_cookie: u64) -> Result<Vec<DirentPlus>> {
        self.readdir(ino, after_cookie)?
            .into_iter()
            .map(|d| {
                let attr = self.getattr(d.ino)?;
                Ok(DirentPlus { dirent: d, attr })
            })
            .collect()
    }

    // ---- data ops (C5) ----

    pub fn read(&self, ino: Ino, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let inode = self.volume.load_inode(ino)?;
        if !inode.is_reg() {
            return Err(Error::Invalid("read of non-regular file"));
        }
        file::read(&self.volume.rtnode_store(), &self.volume.data_store(), &inode, offset, buf)
    }

    pub fn write(&self, ctx: &UopContext, ino: Ino, offset: u64, buf: &[u8]) -> Result<usize> {
        let mut inode = self.volume.load_inode(ino)?;
        if !inode.is_reg() {
            return Err(Error::Invalid("write of non-regular file"));
        }
        let n = file::write(&self.volume.rtnode_store(), &self.volume.data_store(), &mut inode, offset, buf, ctx.xtime)?;
        self.volume.store_inode(&mut inode)?;
        Ok(n)
    }

    pub fn fsync(&self, _ino: Ino) -> Result<()> {
        self.volume.sync()
    }

    pub fn fallocate(&self, ctx: &UopContext, ino: Ino, mode: FallocateMode, offset: u64, len: u64) -> Result<()> {
        let mut inode = self.volume.load_inode(ino)?;
        if !inode.is_reg() {
            return Err(Error::Invalid("fallocate of non-regular file"));
        }
        file::fallocate(&self.volume.rtnode_store(), &self.volume.data_store(), &mut inode, mode, offset, len, ctx.xtime)?;
        self.volume.store_inode(&mut inode)
    }

    pub fn lseek(&self, ino: Ino, offset: u64, whence: SeekWhence) -> Result<u64> {
        let inode = self.volume.load_inode(ino)?;
        file::lseek(&self.volume.rtnode_store(), &self.volume.data_store(), &inode, offset, whence)
    }

    pub fn fiemap(&self, ino: Ino) -> Result<Vec<Extent>> {
        let inode = self.volume.load_inode(ino)?;
        file::fiemap(&self.volume.rtnode_store(), &self.volume.data_store(), &inode)
    }

    // ---- xattr ops (C7) ----

    pub fn getxattr(&self, ino: Ino, namespace: u8, name: &[u8]) -> Result<Vec<u8>> {
        let inode = self.volume.load_inode(ino)?;
        xattr::get(&inode, &self.volume.xattr_store(), namespace, name)
    }

    /// Setting an xattr touches `ctime` only, never `mtime` (spec.md §4.7).
    pub fn setxattr(&self, ctx: &UopContext, ino: Ino, namespace: u8, name: &[u8], value: &[u8], flags: XattrFlags) -> Result<()> {
        let mut inode = self.volume.load_inode(ino)?;
        xattr::set(&mut inode, &self.volume.xattr_store(), namespace, name, value, flags)?;
        inode.set_ctime(ctx.xtime);
        self.volume.store_inode(&mut inode)
    }

    pub fn removexattr(&self, ctx: &UopContext, ino: Ino, namespace: u8, name: &[u8]) -> Result<()> {
        let mut inode = self.volume.load_inode(ino)?;
        xattr::remove(&mut inode, &self.volume.xattr_store(), namespace, name)?;
        inode.set_ctime(ctx.xtime);
        self.volume.store_inode(&mut inode)
    }

    pub fn listxattr(&self, ino: Ino) -> Result<Vec<(u8, Vec<u8>)>> {
        let inode = self.volume.load_inode(ino)?;
        xattr::list(&inode, &self.volume.xattr_store())
    }

    // ---- path resolution convenience (not a FUSE op; used by the CLI) ----

    /// Resolves a `/`-separated path from the root, following symlinks up
    /// to [`SYMLOOP_MAX`] times (spec.md §7 "`Loop` (>= 40 symlink
    /// resolutions)").
    pub fn resolve_path(&self, ctx: &UopContext, path: &[u8]) -> Result<Ino> {
        if path.len() > PATH_MAX {
            return Err(Error::Invalid("path too long"));
        }
        fn split(path: &[u8]) -> std::collections::VecDeque<Vec<u8>> {
            path.split(|&b| b == b'/').filter(|c| !c.is_empty()).map(|c| c.to_vec()).collect()
        }

        let mut cur = INO_ROOT;
        let mut loops = 0u32;
        let mut components = split(path);
        while let Some(name) = components.pop_front() {
            let stat = self.lookup(ctx, cur, &name)?;
            if stat.mode & S_IFMT == S_IFLNK && !components.is_empty() {
                loops += 1;
                if loops > SYMLOOP_MAX {
                    return Err(Error::Loop);
                }
                let target = self.readlink(stat.ino)?;
                for part in split(&target).into_iter().rev() {
                    components.push_front(part);
                }
                continue;
            }
            cur = stat.ino;
        }
        Ok(cur)
    }
}
