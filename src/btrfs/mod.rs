//! Typed interface over the btrfs control calls the engine needs:
//! tree search, clone, defragment, inode path lookup, subvolume flags,
//! and filesystem identity.

pub mod ioctl;
pub mod items;
pub mod root_tree;
pub mod tree_search;

use std::ffi::OsStr;
use std::fs::File;
use std::io::{self, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::PathBuf;

use uuid::Uuid;

use crate::error::DedupError;
use crate::platform::fiemap::same_extents;

pub use ioctl::{BTRFS_SUBVOL_RDONLY, check_ioctl_buf_len};
pub use root_tree::{RootInfo, read_root_tree};

/// UUID of the filesystem containing `fd`.
pub fn get_fs_uuid(fd: RawFd) -> io::Result<Uuid> {
    let info = ioctl::fs_info(fd)?;
    Ok(Uuid::from_bytes(info.fsid))
}

/// Subvolume (root) id of the subvolume containing `fd`.
pub fn get_root_id(fd: RawFd) -> io::Result<u64> {
    let args = ioctl::ino_lookup(fd, 0, items::FIRST_FREE_OBJECTID)?;
    Ok(args.treeid)
}

/// True when `fd` is the top directory of a subvolume.
pub fn is_subvolume(fd: RawFd) -> io::Result<bool> {
    let mut st: libc::stat = unsafe { std::mem::zeroed() };
    if unsafe { libc::fstat(fd, &mut st) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(st.st_ino == items::FIRST_FREE_OBJECTID)
}

/// Read-only flag of the subvolume open at `fd`.
pub fn subvol_is_readonly(fd: RawFd) -> io::Result<bool> {
    Ok(ioctl::subvol_getflags(fd)? & BTRFS_SUBVOL_RDONLY != 0)
}

/// One path for an inode, relative to the root of `tree_id` (0 = the
/// subvolume of `fd`). The kernel provides a single backref; multi-path
/// lookup for hardlinked inodes has kernel-side bugs and stays unused.
pub fn lookup_one_path(fd: RawFd, ino: u64, tree_id: u64) -> io::Result<PathBuf> {
    let args = ioctl::ino_lookup(fd, tree_id, ino)?;
    let mut name = args.name_bytes();
    // The kernel appends a '/' when resolving within the fd's subvolume.
    if tree_id == 0 {
        name = name.strip_suffix(b"/").unwrap_or(name);
    }
    Ok(PathBuf::from(OsStr::from_bytes(name)))
}

/// Most recent generation of the subvolume containing `fd`, read from
/// its root item. Taken from how `btrfs-list` finds a root's generation.
pub fn get_root_generation(fd: RawFd) -> Result<u64, DedupError> {
    let treeid = get_root_id(fd)?;
    let range = tree_search::SearchRange {
        tree_id: items::ROOT_TREE_OBJECTID,
        min_objectid: treeid,
        max_objectid: treeid,
        min_type: items::ROOT_ITEM_KEY,
        max_type: items::ROOT_ITEM_KEY,
        ..Default::default()
    };
    let mut max_found = 0u64;
    tree_search::search(fd, &range, |header, data| {
        debug_assert_eq!(header.objectid, treeid);
        if header.item_type == items::ROOT_ITEM_KEY {
            let item = items::RootItem::parse(data)?;
            max_found = max_found.max(item.generation.get());
        }
        Ok(())
    })?;
    if max_found == 0 {
        return Err(DedupError::Parse("no root item for subvolume"));
    }
    Ok(max_found)
}

/// Outcome of `clone_data`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloneResult {
    /// The clone ioctl ran and the destination now shares the source's
    /// extents.
    Cloned,
    /// The extent maps were already identical; no ioctl was issued.
    AlreadyShared,
}

/// Reattach `dest`'s extents to `src`'s via the clone (reflink) ioctl.
///
/// With `check_first`, identical extent maps short-circuit to
/// `AlreadyShared`. EINVAL maps to `NodataCowOrInvalid`: the kernel
/// reuses its generic invalid-argument return to reject clones of
/// files marked no-COW.
pub fn clone_data(dest: &File, src: &File, check_first: bool) -> Result<CloneResult, DedupError> {
    if check_first && same_extents(dest.as_raw_fd(), src.as_raw_fd())? {
        return Ok(CloneResult::AlreadyShared);
    }
    match ioctl::clone_ioctl(dest.as_raw_fd(), src.as_raw_fd()) {
        Ok(()) => Ok(CloneResult::Cloned),
        Err(e) if e.raw_os_error() == Some(libc::EINVAL) => Err(DedupError::NodataCowOrInvalid),
        Err(e) => Err(DedupError::Io(e)),
    }
}

/// Defragment a file in place. Can unshare extents and drop compression
/// as side effects; only used when the caller opts in.
pub fn defragment(fd: RawFd) -> io::Result<()> {
    ioctl::defrag_ioctl(fd)
}

/// List tree items changed since `min_generation`, in the style of
/// `btrfs find-new` but covering inodes, refs and directory items as
/// well as extents.
pub fn find_new(
    fd: RawFd,
    min_generation: u64,
    out: &mut dyn Write,
    terse: bool,
) -> Result<(), DedupError> {
    let range = tree_search::SearchRange {
        min_transid: min_generation,
        max_type: items::EXTENT_DATA_KEY,
        ..Default::default()
    };
    tree_search::search(fd, &range, |header, data| {
        match header.item_type {
            items::EXTENT_DATA_KEY => {
                let item = items::FileExtentHeader::parse(data)?;
                let found_gen = item.generation.get();
                if terse {
                    if found_gen >= min_generation {
                        let name = lookup_one_path(fd, header.objectid, 0)?;
                        writeln!(out, "{}", name.display()).map_err(DedupError::Io)?;
                    }
                } else {
                    writeln!(
                        out,
                        "extent ino {} len {} gen0 {} gen1 {}",
                        header.objectid, header.len, header.transid, found_gen
                    )
                    .map_err(DedupError::Io)?;
                }
            }
            items::INODE_ITEM_KEY => {
                let item = items::InodeItem::parse(data)?;
                if !terse {
                    writeln!(
                        out,
                        "inode ino {} len {} gen0 {} gen1 {} size {} mode {:o}",
                        header.objectid,
                        header.len,
                        header.transid,
                        item.generation.get(),
                        item.size.get(),
                        item.mode.get()
                    )
                    .map_err(DedupError::Io)?;
                }
            }
            items::INODE_REF_KEY => {
                let (_, name) = items::InodeRef::parse(data)?;
                if !terse {
                    writeln!(
                        out,
                        "ref ino {} gen0 {} name {}",
                        header.objectid,
                        header.transid,
                        String::from_utf8_lossy(name)
                    )
                    .map_err(DedupError::Io)?;
                }
            }
            items::DIR_ITEM_KEY | items::DIR_INDEX_KEY => {
                let (item, name) = items::DirItem::parse(data)?;
                if !terse {
                    writeln!(
                        out,
                        "dir ino {} gen0 {} gen1 {} type {} name {}",
                        header.objectid,
                        header.transid,
                        item.transid.get(),
                        item.dir_type,
                        String::from_utf8_lossy(name)
                    )
                    .map_err(DedupError::Io)?;
                }
            }
            other => {
                if !terse {
                    writeln!(
                        out,
                        "item type {} oid {} len {} gen0 {}",
                        other, header.objectid, header.len, header.transid
                    )
                    .map_err(DedupError::Io)?;
                }
            }
        }
        Ok(())
    })
}
