//! Nanosecond-precision file timestamps.

use std::io;
use std::os::fd::RawFd;

use crate::platform::cvt;

/// Read (atime, mtime) of an open file at nanosecond resolution.
pub fn fstat_ns(fd: RawFd) -> io::Result<(libc::timespec, libc::timespec)> {
    let mut st: libc::stat = unsafe { std::mem::zeroed() };
    cvt(unsafe { libc::fstat(fd, &mut st) })?;
    let atime = libc::timespec {
        tv_sec: st.st_atime,
        tv_nsec: st.st_atime_nsec,
    };
    let mtime = libc::timespec {
        tv_sec: st.st_mtime,
        tv_nsec: st.st_mtime_nsec,
    };
    Ok((atime, mtime))
}

/// Restore (atime, mtime) at nanosecond resolution.
///
/// ctime cannot be reset; every caller that cares must avoid touching
/// it in the first place.
pub fn futimens_ns(fd: RawFd, atime: libc::timespec, mtime: libc::timespec) -> io::Result<()> {
    debug_assert!((0..1_000_000_000).contains(&atime.tv_nsec));
    debug_assert!((0..1_000_000_000).contains(&mtime.tv_nsec));
    let times = [atime, mtime];
    cvt(unsafe { libc::futimens(fd, times.as_ptr()) })?;
    Ok(())
}
