//! Raw btrfs control calls and their argument layouts.
//!
//! Numbers are the `_IO*(0x94, ...)` encodings from `linux/btrfs.h`,
//! spelled out so no bindgen step is needed.

use std::io;
use std::mem;
use std::os::fd::RawFd;

use crate::error::DedupError;
use crate::platform::cvt;

const BTRFS_IOC_TREE_SEARCH: libc::c_ulong = 0xD000_9411; // _IOWR(0x94, 17, search_args)
const BTRFS_IOC_INO_LOOKUP: libc::c_ulong = 0xD000_9412; // _IOWR(0x94, 18, ino_lookup_args)
const BTRFS_IOC_FS_INFO: libc::c_ulong = 0x8400_941F; // _IOR(0x94, 31, fs_info_args)
const BTRFS_IOC_CLONE: libc::c_ulong = 0x4004_9409; // _IOW(0x94, 9, int)
const BTRFS_IOC_DEFRAG: libc::c_ulong = 0x5000_9402; // _IOW(0x94, 2, vol_args)
const BTRFS_IOC_SUBVOL_GETFLAGS: libc::c_ulong = 0x8008_9419; // _IOR(0x94, 25, u64)

/// Subvolume flag reported by `SUBVOL_GETFLAGS` for read-only snapshots.
pub const BTRFS_SUBVOL_RDONLY: u64 = 1 << 1;

/// Some platforms' generic ioctl paths copy instead of mutating when the
/// userspace buffer is exactly 1024 bytes. Refuse such a buffer outright;
/// callers must size their argument structs around it.
pub fn check_ioctl_buf_len(len: usize) -> Result<(), DedupError> {
    if len == 1024 {
        return Err(DedupError::SearchBufSize);
    }
    Ok(())
}

// ---- Tree search ----

/// `struct btrfs_ioctl_search_key`: key-range bounds plus the in/out
/// batch size. The kernel advances the `min_*` fields as it walks, in
/// (objectid, type, offset) tuple order, not as an intersection of
/// per-field ranges.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct SearchKey {
    pub tree_id: u64,
    pub min_objectid: u64,
    pub max_objectid: u64,
    pub min_offset: u64,
    pub max_offset: u64,
    pub min_transid: u64,
    pub max_transid: u64,
    pub min_type: u32,
    pub max_type: u32,
    pub nr_items: u32,
    unused: u32,
    unused1: u64,
    unused2: u64,
    unused3: u64,
    unused4: u64,
}

pub const SEARCH_BUF_SIZE: usize = 4096 - mem::size_of::<SearchKey>();

/// `struct btrfs_ioctl_search_args`: the key followed by a buffer the
/// kernel fills with (header, item) pairs.
#[repr(C)]
pub struct SearchArgs {
    pub key: SearchKey,
    pub buf: [u8; SEARCH_BUF_SIZE],
}

/// `struct btrfs_ioctl_search_header`, prepended to every returned item.
/// Items are packed; headers after the first are not naturally aligned.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct SearchHeader {
    pub transid: u64,
    pub objectid: u64,
    pub offset: u64,
    pub item_type: u32,
    pub len: u32,
}

pub const SEARCH_HEADER_SIZE: usize = mem::size_of::<SearchHeader>();

impl SearchArgs {
    pub fn zeroed() -> Box<SearchArgs> {
        Box::new(unsafe { mem::zeroed() })
    }
}

pub fn tree_search_ioctl(fd: RawFd, args: &mut SearchArgs) -> Result<(), DedupError> {
    check_ioctl_buf_len(mem::size_of::<SearchArgs>())?;
    cvt(unsafe { libc::ioctl(fd, BTRFS_IOC_TREE_SEARCH, args as *mut SearchArgs) })
        .map_err(DedupError::Io)?;
    Ok(())
}

// ---- Inode path lookup ----

const INO_LOOKUP_PATH_MAX: usize = 4080;

#[repr(C)]
pub struct InoLookupArgs {
    pub treeid: u64,
    pub objectid: u64,
    pub name: [u8; INO_LOOKUP_PATH_MAX],
}

/// Resolve one path for an inode. `treeid = 0` means the subvolume of
/// `fd`; on return the kernel has filled in the actual tree id.
pub fn ino_lookup(fd: RawFd, treeid: u64, objectid: u64) -> io::Result<Box<InoLookupArgs>> {
    let mut args: Box<InoLookupArgs> = Box::new(unsafe { mem::zeroed() });
    args.treeid = treeid;
    args.objectid = objectid;
    cvt(unsafe { libc::ioctl(fd, BTRFS_IOC_INO_LOOKUP, &mut *args) })?;
    Ok(args)
}

impl InoLookupArgs {
    /// The NUL-terminated path the kernel wrote, as raw bytes.
    pub fn name_bytes(&self) -> &[u8] {
        let end = self
            .name
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(self.name.len());
        &self.name[..end]
    }
}

// ---- Filesystem info ----

#[repr(C)]
pub struct FsInfoArgs {
    pub max_id: u64,
    pub num_devices: u64,
    pub fsid: [u8; 16],
    pub nodesize: u32,
    pub sectorsize: u32,
    pub clone_alignment: u32,
    pub csum_type: u16,
    pub csum_size: u16,
    pub flags: u64,
    pub generation: u64,
    pub metadata_uuid: [u8; 16],
    reserved: [u8; 944],
}

pub fn fs_info(fd: RawFd) -> io::Result<Box<FsInfoArgs>> {
    let mut args: Box<FsInfoArgs> = Box::new(unsafe { mem::zeroed() });
    cvt(unsafe { libc::ioctl(fd, BTRFS_IOC_FS_INFO, &mut *args) })?;
    Ok(args)
}

// ---- Clone / defrag / subvolume flags ----

pub fn clone_ioctl(dest_fd: RawFd, src_fd: RawFd) -> io::Result<()> {
    cvt(unsafe { libc::ioctl(dest_fd, BTRFS_IOC_CLONE, src_fd) })?;
    Ok(())
}

pub fn defrag_ioctl(fd: RawFd) -> io::Result<()> {
    cvt(unsafe { libc::ioctl(fd, BTRFS_IOC_DEFRAG, 0usize) })?;
    Ok(())
}

pub fn subvol_getflags(fd: RawFd) -> io::Result<u64> {
    let mut flags: u64 = 0;
    cvt(unsafe { libc::ioctl(fd, BTRFS_IOC_SUBVOL_GETFLAGS, &mut flags) })?;
    Ok(flags)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn search_args_fill_a_page() {
        assert_eq!(mem::size_of::<SearchKey>(), 104);
        assert_eq!(mem::size_of::<SearchArgs>(), 4096);
        assert_eq!(SEARCH_HEADER_SIZE, 32);
    }

    #[test]
    fn quirky_buffer_size_is_rejected() {
        assert!(matches!(
            check_ioctl_buf_len(1024),
            Err(DedupError::SearchBufSize)
        ));
        assert!(check_ioctl_buf_len(1023).is_ok());
        assert!(check_ioctl_buf_len(1025).is_ok());
        assert!(check_ioctl_buf_len(4096).is_ok());
    }
}
