//! Thin wrappers over the Linux syscalls the engine depends on.

pub mod chattr;
pub mod fiemap;
pub mod ioprio;
pub mod openat;
pub mod times;

use std::io;
use std::os::fd::RawFd;

/// Convert a negative syscall return into the current `errno`.
pub(crate) fn cvt(ret: libc::c_int) -> io::Result<libc::c_int> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

/// Flush all dirty data of the filesystem containing `fd`.
pub fn syncfs(fd: RawFd) -> io::Result<()> {
    cvt(unsafe { libc::syncfs(fd) })?;
    Ok(())
}

/// Detach the process into a private mount namespace.
///
/// Mounts created afterwards are invisible to the rest of the system.
pub fn unshare_mount_ns() -> io::Result<()> {
    cvt(unsafe { libc::unshare(libc::CLONE_NEWNS) })?;
    Ok(())
}

/// Open-file descriptor limits for the current process.
#[derive(Debug, Clone, Copy)]
pub struct FdLimit {
    pub soft: u64,
    pub hard: u64,
}

pub fn fd_limit() -> io::Result<FdLimit> {
    let mut rl = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    cvt(unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut rl) })?;
    Ok(FdLimit {
        soft: rl.rlim_cur,
        hard: rl.rlim_max,
    })
}

/// Raise the soft open-file limit, clamped to the hard limit.
/// Returns the resulting limits.
pub fn raise_fd_limit(wanted: u64) -> io::Result<FdLimit> {
    let current = fd_limit()?;
    let new_soft = wanted.min(current.hard);
    if new_soft <= current.soft {
        return Ok(current);
    }
    let rl = libc::rlimit {
        rlim_cur: new_soft,
        rlim_max: current.hard,
    };
    cvt(unsafe { libc::setrlimit(libc::RLIMIT_NOFILE, &rl) })?;
    Ok(FdLimit {
        soft: new_soft,
        hard: current.hard,
    })
}
