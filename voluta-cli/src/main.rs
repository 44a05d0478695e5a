//! `voluta`: a thin CLI over `voluta-core` (SPEC_FULL.md §0). Only the
//! subset of the op table that is a client of the core API from outside a
//! mount point lives here -- `mkfs`, `show`, `dump`, `fsck`. Mounting
//! (`fsd`/`mntd`) is out of scope.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use voluta_core::engine::{Engine, Ucred, UopContext};
use voluta_core::volume::MkfsConfig;
use voluta_core::Volume;

#[derive(Parser)]
#[command(name = "voluta", about = "Voluta volume storage engine", version)]
struct Cli {
    #[command(flatten)]
    verbosity: clap_verbosity_flag::Verbosity,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Format a new volume file.
    Mkfs {
        /// Path to the volume file (created or truncated).
        path: PathBuf,
        /// Filesystem label.
        #[arg(long, default_value = "voluta")]
        name: String,
        /// Volume size, e.g. "64M", "2G". Plain byte counts are also
        /// accepted.
        #[arg(long, default_value = "64M")]
        size: String,
        /// Encrypt the volume; prompts on stdin for a passphrase.
        #[arg(long)]
        encrypted: bool,
    },
    /// Print super block and space-usage summary.
    Show {
        path: PathBuf,
        #[arg(long)]
        encrypted: bool,
    },
    /// Recursively dump the directory tree from the root inode.
    Dump {
        path: PathBuf,
        #[arg(long)]
        encrypted: bool,
    },
    /// Walk every live inode, checking for structural inconsistencies.
    Fsck {
        path: PathBuf,
        #[arg(long)]
        encrypted: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    env_logger::Builder::new()
        .filter_level(cli.verbosity.log_level_filter())
        .init();

    match cli.command {
        Command::Mkfs { path, name, size, encrypted } => cmd_mkfs(path, name, &size, encrypted),
        Command::Show { path, encrypted } => cmd_show(path, encrypted),
        Command::Dump { path, encrypted } => cmd_dump(path, encrypted),
        Command::Fsck { path, encrypted } => cmd_fsck(path, encrypted),
    }
}

fn read_passphrase() -> Result<Vec<u8>> {
    use std::io::Write;
    eprint!("passphrase: ");
    std::io::stderr().flush().ok();
    let mut pass = String::new();
    std::io::stdin().read_line(&mut pass).context("reading passphrase")?;
    Ok(pass.trim_end_matches(['\n', '\r']).as_bytes().to_vec())
}

/// Parses sizes like "64M"/"2G"/"131072" (bytes) into a block count.
fn parse_size_blocks(s: &str) -> Result<u64> {
    let s = s.trim();
    let (digits, mult) = match s.chars().last() {
        Some('k') | Some('K') => (&s[..s.len() - 1], 1024u64),
        Some('m') | Some('M') => (&s[..s.len() - 1], 1024 * 1024),
        Some('g') | Some('G') => (&s[..s.len() - 1], 1024 * 1024 * 1024),
        _ => (s, 1u64),
    };
    let n: u64 = digits.trim().parse().with_context(|| format!("invalid size: {s}"))?;
    let bytes = n * mult;
    Ok(bytes / voluta_core::consts::BLOCK_SIZE as u64)
}

fn cmd_mkfs(path: PathBuf, name: String, size: &str, encrypted: bool) -> Result<()> {
    let nblocks = parse_size_blocks(size)?;
    let passphrase = if encrypted { Some(read_passphrase()?) } else { None };
    let uuid = *uuid::Uuid::new_v4().as_bytes();
    let config = MkfsConfig { uuid, fs_name: name, nblocks, passphrase };
    let birth_time = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .context("system clock before epoch")?
        .as_secs();
    let engine = Engine::mkfs(&path, config, birth_time)?;
    engine.sync()?;
    log::info!("formatted {} ({} blocks)", path.display(), nblocks);
    Ok(())
}

fn open_engine(path: PathBuf, encrypted: bool) -> Result<Engine> {
    let passphrase = if encrypted { Some(read_passphrase()?) } else { None };
    let engine = Engine::open(&path, passphrase.as_deref())?;
    Ok(engine)
}

fn cmd_show(path: PathBuf, encrypted: bool) -> Result<()> {
    let engine = open_engine(path, encrypted)?;
    let volume = engine.volume();
    let stat = engine.statfs(voluta_core::consts::INO_ROOT)?;
    println!("uuid:        {}", uuid_string(volume.uuid()));
    println!("name:        {}", volume.fs_name());
    println!("blocks:      {}", volume.nblocks());
    println!("ag count:    {}", volume.nag());
    println!("block size:  {}", stat.block_size);
    println!("blocks free: {}/{}", stat.blocks_free, stat.blocks_total);
    println!("files free:  {}", stat.files_free);
    Ok(())
}

fn uuid_string(bytes: [u8; 16]) -> String {
    uuid::Uuid::from_bytes(bytes).to_string()
}

fn cmd_dump(path: PathBuf, encrypted: bool) -> Result<()> {
    let engine = open_engine(path, encrypted)?;
    let ctx = UopContext::new(Ucred::root(), 0);
    dump_tree(&engine, &ctx, voluta_core::consts::INO_ROOT, PathBuf::from("/"), 0)?;
    Ok(())
}

fn dump_tree(engine: &Engine, ctx: &UopContext, ino: u64, path: PathBuf, depth: u32) -> Result<()> {
    if depth > voluta_core::consts::SYMLOOP_MAX {
        bail!("directory nesting too deep under {}", path.display());
    }
    let stat = engine.getattr(ino)?;
    println!("{:>8} {:o} {}", stat.size, stat.mode, path.display());
    if stat.mode & voluta_core::inode::S_IFMT != voluta_core::inode::S_IFDIR {
        return Ok(());
    }
    for entry in engine.readdir(ino, 0)? {
        if entry.name == b"." || entry.name == b".." {
            continue;
        }
        let name = String::from_utf8_lossy(&entry.name);
        dump_tree(engine, ctx, entry.ino, path.join(name.as_ref()), depth + 1)?;
    }
    Ok(())
}

/// Walks every reachable inode from the root, checking nlink bookkeeping
/// and that directory entries resolve. Not a full block-level scrub --
/// that would require reading the allocator's own bitmap, which `Volume`
/// doesn't expose read-only today.
fn cmd_fsck(path: PathBuf, encrypted: bool) -> Result<()> {
    let engine = open_engine(path, encrypted)?;
    let mut errors = 0u64;
    let mut visited = std::collections::HashSet::new();
    fsck_walk(&engine, voluta_core::consts::INO_ROOT, voluta_core::consts::INO_ROOT, &mut visited, &mut errors)?;
    if errors == 0 {
        println!("fsck: clean ({} inodes checked)", visited.len());
        Ok(())
    } else {
        bail!("fsck: {} inconsistencies found", errors);
    }
}

fn fsck_walk(
    engine: &Engine,
    ino: u64,
    expected_parent: u64,
    visited: &mut std::collections::HashSet<u64>,
    errors: &mut u64,
) -> Result<()> {
    if !visited.insert(ino) {
        return Ok(());
    }
    let stat = match engine.getattr(ino) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("inode {ino}: {e}");
            *errors += 1;
            return Ok(());
        }
    };
    if stat.nlink == 0 {
        eprintln!("inode {ino}: nlink is zero but reachable");
        *errors += 1;
    }
    if stat.mode & voluta_core::inode::S_IFMT != voluta_core::inode::S_IFDIR {
        return Ok(());
    }
    let entries = engine.readdir(ino, 0)?;
    let dotdot = entries.iter().find(|e| e.name == b"..");
    if let Some(dotdot) = dotdot {
        if dotdot.ino != expected_parent {
            eprintln!("inode {ino}: '..' points to {} but parent is {}", dotdot.ino, expected_parent);
            *errors += 1;
        }
    }
    for entry in entries {
        if entry.name == b"." || entry.name == b".." {
            continue;
        }
        fsck_walk(engine, entry.ino, ino, visited, errors)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_byte_counts() {
        assert_eq!(parse_size_blocks("131072").unwrap(), 131072 / voluta_core::consts::BLOCK_SIZE as u64);
    }

    #[test]
    fn parses_suffixed_sizes() {
        let block_size = voluta_core::consts::BLOCK_SIZE as u64;
        assert_eq!(parse_size_blocks("64M").unwrap(), (64 * 1024 * 1024) / block_size);
        assert_eq!(parse_size_blocks("2G").unwrap(), (2u64 * 1024 * 1024 * 1024) / block_size);
        assert_eq!(parse_size_blocks("512K").unwrap(), (512 * 1024) / block_size);
    }

    #[test]
    fn rejects_garbage_sizes() {
        assert!(parse_size_blocks("not-a-size").is_err());
    }
}
