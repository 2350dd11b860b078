//! Physical extent maps via the `FS_IOC_FIEMAP` ioctl.

use std::io;
use std::os::fd::RawFd;

use crate::platform::cvt;

// _IOWR('f', 11, struct fiemap)
const FS_IOC_FIEMAP: libc::c_ulong = 0xC020_660B;

const FIEMAP_MAX_OFFSET: u64 = u64::MAX;
const FIEMAP_EXTENT_LAST: u32 = 0x0000_0001;

/// Extents fetched per ioctl call; the request struct stays under a page.
const EXTENT_BATCH: usize = 72;

#[repr(C)]
#[derive(Clone, Copy)]
struct FiemapHeader {
    fm_start: u64,
    fm_length: u64,
    fm_flags: u32,
    fm_mapped_extents: u32,
    fm_extent_count: u32,
    fm_reserved: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct FiemapExtentRaw {
    fe_logical: u64,
    fe_physical: u64,
    fe_length: u64,
    fe_reserved64: [u64; 2],
    fe_flags: u32,
    fe_reserved: [u32; 3],
}

#[repr(C)]
struct FiemapArgs {
    hdr: FiemapHeader,
    extents: [FiemapExtentRaw; EXTENT_BATCH],
}

/// One entry of a file's physical extent map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtentRecord {
    pub logical: u64,
    pub physical: u64,
    pub length: u64,
    pub flags: u32,
}

/// Enumerate the full extent map of an open file.
pub fn fiemap(fd: RawFd) -> io::Result<Vec<ExtentRecord>> {
    let mut out = Vec::new();
    let mut start = 0u64;

    loop {
        let mut args: FiemapArgs = unsafe { std::mem::zeroed() };
        args.hdr.fm_start = start;
        args.hdr.fm_length = FIEMAP_MAX_OFFSET;
        args.hdr.fm_extent_count = EXTENT_BATCH as u32;
        cvt(unsafe { libc::ioctl(fd, FS_IOC_FIEMAP, &mut args) })?;

        let mapped = args.hdr.fm_mapped_extents as usize;
        if mapped == 0 {
            break;
        }

        let mut saw_last = false;
        for raw in &args.extents[..mapped.min(EXTENT_BATCH)] {
            out.push(ExtentRecord {
                logical: raw.fe_logical,
                physical: raw.fe_physical,
                length: raw.fe_length,
                flags: raw.fe_flags,
            });
            saw_last = raw.fe_flags & FIEMAP_EXTENT_LAST != 0;
        }
        if saw_last {
            break;
        }
        let last = out.last().unwrap();
        start = last.logical + last.length;
    }

    Ok(out)
}

/// True when two files already share an identical on-disk layout,
/// in which case a clone would be a no-op.
pub fn same_extents(fd1: RawFd, fd2: RawFd) -> io::Result<bool> {
    Ok(fiemap(fd1)? == fiemap(fd2)?)
}
