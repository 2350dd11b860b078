//! Per-file inode flags (`FS_IOC_GETFLAGS`/`SETFLAGS`).

use std::io;
use std::os::fd::RawFd;

use crate::platform::cvt;

// _IOR('f', 1, long) / _IOW('f', 2, long)
const FS_IOC_GETFLAGS: libc::c_ulong = 0x8008_6601;
const FS_IOC_SETFLAGS: libc::c_ulong = 0x4008_6602;

/// Immutable file: no new writable fds can be opened, existing ones
/// keep working.
pub const FS_IMMUTABLE_FL: libc::c_long = 0x0000_0010;

/// Read the inode flags of an open file.
pub fn get_flags(fd: RawFd) -> io::Result<libc::c_long> {
    let mut flags: libc::c_long = 0;
    cvt(unsafe { libc::ioctl(fd, FS_IOC_GETFLAGS, &mut flags) })?;
    Ok(flags)
}

/// Set and clear inode flags in one get/set pair.
///
/// Returns the previous value of the touched bits, so the caller can
/// tell whether an added flag was already present. Does not change
/// atime or mtime.
pub fn edit_flags(
    fd: RawFd,
    add_flags: libc::c_long,
    remove_flags: libc::c_long,
) -> io::Result<libc::c_long> {
    debug_assert_eq!(add_flags & remove_flags, 0);
    let mut flags: libc::c_long = 0;
    cvt(unsafe { libc::ioctl(fd, FS_IOC_GETFLAGS, &mut flags) })?;
    let prev = flags;
    flags |= add_flags;
    flags &= !remove_flags;
    cvt(unsafe { libc::ioctl(fd, FS_IOC_SETFLAGS, &flags) })?;
    Ok(prev & (add_flags | remove_flags))
}
