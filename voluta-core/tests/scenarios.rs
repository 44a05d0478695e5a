//! End-to-end scenarios over the full `Engine` op table (spec.md §8
//! "Concrete end-to-end scenarios"), each driving a fresh tempfile-backed
//! volume through `mkfs` and the public op table exactly as a FUSE
//! collaborator would.

use voluta_core::engine::{Engine, Ucred, UopContext};
use voluta_core::volume::MkfsConfig;
use voluta_core::xattr::{XattrFlags, XATTR_NS_USER};
use voluta_core::{consts, Error};

fn new_volume() -> (tempfile::TempDir, Engine) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("volume.img");
    let config = MkfsConfig {
        uuid: [7u8; 16],
        fs_name: "scenarios".to_string(),
        nblocks: consts::VOLUME_NAG_MIN * consts::NBK_IN_AG,
        passphrase: None,
    };
    let engine = Engine::mkfs(&path, config, 1_000_000).unwrap();
    (dir, engine)
}

fn ctx(xtime: u64) -> UopContext {
    UopContext::new(Ucred::root(), xtime)
}

/// Scenario 1: `creat("/f", 0600); write(fd, "ABCDEFGH", 8); close;
/// stat("/f").st_size == 8; st_blocks >= 16`.
#[test]
fn scenario_create_write_stat() {
    let (_dir, engine) = new_volume();
    let c = ctx(10);
    let f = engine.create(&c, consts::INO_ROOT, b"f", 0o600).unwrap();
    let n = engine.write(&c, f.ino, 0, b"ABCDEFGH").unwrap();
    assert_eq!(n, 8);
    let st = engine.getattr(f.ino).unwrap();
    assert_eq!(st.size, 8);
    assert!(st.blocks >= 16);
}

/// Scenario 2: `truncate("/f", 1_048_576); stat.st_size == 1048576;
/// st_blocks == 0`. Then `pwrite(fd, "X", 1, 65535)` -> `st_blocks == 16`.
#[test]
fn scenario_truncate_then_sparse_write() {
    let (_dir, engine) = new_volume();
    let c = ctx(20);
    let f = engine.create(&c, consts::INO_ROOT, b"f", 0o600).unwrap();
    let attr = voluta_core::engine::SetAttr { size: Some(1_048_576), ..Default::default() };
    let st = engine.setattr(&c, f.ino, &attr).unwrap();
    assert_eq!(st.size, 1_048_576);
    assert_eq!(st.blocks, 0);

    engine.write(&c, f.ino, 65535, b"X").unwrap();
    let st = engine.getattr(f.ino).unwrap();
    assert_eq!(st.blocks, 16);
}

/// Scenario 3: 30000-entry directory, full readdir coverage, rmdir
/// NotEmpty-then-success after unlinking everything.
#[test]
fn scenario_large_directory_readdir_and_rmdir() {
    let (_dir, engine) = new_volume();
    let c = ctx(30);
    let d = engine.mkdir(&c, consts::INO_ROOT, b"d", 0o755).unwrap();

    const N: usize = 30_000;
    for i in 0..N {
        let name = format!("{i:08x}");
        engine.create(&c, d.ino, name.as_bytes(), 0o644).unwrap();
    }

    let mut seen = std::collections::HashSet::new();
    let mut cookie = 0u64;
    loop {
        let batch = engine.readdir(d.ino, cookie).unwrap();
        if batch.is_empty() {
            break;
        }
        for e in &batch {
            if e.name.as_slice() != b"." && e.name.as_slice() != b".." {
                seen.insert(e.name.clone());
            }
        }
        cookie = batch.last().unwrap().cookie;
    }
    assert_eq!(seen.len(), N);

    assert!(matches!(engine.rmdir(&c, consts::INO_ROOT, b"d"), Err(Error::NotEmpty)));

    for i in 0..N {
        let name = format!("{i:08x}");
        engine.unlink(&c, d.ino, name.as_bytes()).unwrap();
    }
    engine.rmdir(&c, consts::INO_ROOT, b"d").unwrap();
}

/// Scenario 4: short and 5000-byte symlink targets round-trip exactly.
#[test]
fn scenario_symlink_roundtrip_short_and_long() {
    let (_dir, engine) = new_volume();
    let c = ctx(40);
    let l = engine.symlink(&c, consts::INO_ROOT, b"l", b"target").unwrap();
    assert_eq!(engine.readlink(l.ino).unwrap(), b"target");

    let long_target = vec![b'y'; 5000];
    let l2 = engine.symlink(&c, consts::INO_ROOT, b"l2", &long_target).unwrap();
    assert_eq!(engine.readlink(l2.ino).unwrap(), long_target);
}

/// Scenario 5: xattr CREATE/REPLACE rules.
#[test]
fn scenario_xattr_create_replace_rules() {
    let (_dir, engine) = new_volume();
    let c = ctx(50);
    let f = engine.create(&c, consts::INO_ROOT, b"f", 0o644).unwrap();

    engine.setxattr(&c, f.ino, XATTR_NS_USER, b"k", b"v1", XattrFlags::empty()).unwrap();
    assert_eq!(engine.getxattr(f.ino, XATTR_NS_USER, b"k").unwrap(), b"v1");

    engine.setxattr(&c, f.ino, XATTR_NS_USER, b"k", b"v2", XattrFlags::REPLACE).unwrap();
    assert_eq!(engine.getxattr(f.ino, XATTR_NS_USER, b"k").unwrap(), b"v2");

    let err = engine.setxattr(&c, f.ino, XATTR_NS_USER, b"k", b"vv", XattrFlags::CREATE).unwrap_err();
    assert!(matches!(err, Error::Exists));
}

/// Scenario 6: `rename_exchange` swaps two distinct inodes' names while
/// preserving `ino` and bumping `ctime`.
#[test]
fn scenario_rename_exchange_swaps_names() {
    let (_dir, engine) = new_volume();
    let c = ctx(60);
    let a = engine.create(&c, consts::INO_ROOT, b"a", 0o644).unwrap();
    let b = engine.create(&c, consts::INO_ROOT, b"b", 0o644).unwrap();

    let a_before = engine.getattr(a.ino).unwrap();
    let b_before = engine.getattr(b.ino).unwrap();

    let c2 = ctx(61);
    engine.rename(&c2, consts::INO_ROOT, b"a", consts::INO_ROOT, b"b", true).unwrap();

    let looked_up_a_name = engine.lookup(&c2, consts::INO_ROOT, b"a").unwrap();
    let looked_up_b_name = engine.lookup(&c2, consts::INO_ROOT, b"b").unwrap();
    assert_eq!(looked_up_a_name.ino, b.ino);
    assert_eq!(looked_up_b_name.ino, a.ino);

    assert_eq!(looked_up_a_name.nlink, b_before.nlink);
    assert_eq!(looked_up_b_name.nlink, a_before.nlink);
    assert!(looked_up_a_name.ctime > b_before.ctime);
    assert!(looked_up_b_name.ctime > a_before.ctime);
}

/// Rename idempotence: `rename(a,b); rename(b,a)` restores the directory
/// entries exactly (spec.md §8 "Quantified invariants").
#[test]
fn rename_is_idempotent_round_trip() {
    let (_dir, engine) = new_volume();
    let c = ctx(70);
    let f = engine.create(&c, consts::INO_ROOT, b"a", 0o644).unwrap();

    engine.rename(&c, consts::INO_ROOT, b"a", consts::INO_ROOT, b"b", false).unwrap();
    assert!(matches!(engine.lookup(&c, consts::INO_ROOT, b"a"), Err(Error::NoEnt)));
    assert_eq!(engine.lookup(&c, consts::INO_ROOT, b"b").unwrap().ino, f.ino);

    engine.rename(&c, consts::INO_ROOT, b"b", consts::INO_ROOT, b"a", false).unwrap();
    assert!(matches!(engine.lookup(&c, consts::INO_ROOT, b"b"), Err(Error::NoEnt)));
    assert_eq!(engine.lookup(&c, consts::INO_ROOT, b"a").unwrap().ino, f.ino);
}

/// Write-truncate(0)-write: final block count matches the second write
/// alone, and `st_blocks` returns to zero after the truncate in between.
#[test]
fn write_truncate_zero_write_resets_block_count() {
    let (_dir, engine) = new_volume();
    let c = ctx(80);
    let f = engine.create(&c, consts::INO_ROOT, b"f", 0o644).unwrap();

    engine.write(&c, f.ino, 0, &vec![1u8; 20_000]).unwrap();
    assert!(engine.getattr(f.ino).unwrap().blocks > 0);

    let attr = voluta_core::engine::SetAttr { size: Some(0), ..Default::default() };
    engine.setattr(&c, f.ino, &attr).unwrap();
    assert_eq!(engine.getattr(f.ino).unwrap().blocks, 0);

    engine.write(&c, f.ino, 0, b"hello").unwrap();
    let st = engine.getattr(f.ino).unwrap();
    assert_eq!(st.size, 5);
    assert_eq!(st.blocks, 16);
}

/// Reads past EOF return zero bytes rather than erroring.
#[test]
fn read_past_eof_returns_zero_bytes() {
    let (_dir, engine) = new_volume();
    let c = ctx(90);
    let f = engine.create(&c, consts::INO_ROOT, b"f", 0o644).unwrap();
    engine.write(&c, f.ino, 0, b"hi").unwrap();
    let mut buf = [0u8; 16];
    let n = engine.read(f.ino, 1000, &mut buf).unwrap();
    assert_eq!(n, 0);
}
