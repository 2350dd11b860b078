//! Opens relative to a directory fd. Paths returned by the inode-path
//! lookup are relative to the subvolume root, so every file open goes
//! through the volume's directory handle.

use std::ffi::CString;
use std::fs::File;
use std::io;
use std::os::fd::{FromRawFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

fn c_path(path: &Path) -> io::Result<CString> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains NUL"))
}

fn openat_flags(dirfd: RawFd, path: &Path, flags: libc::c_int) -> io::Result<File> {
    let c = c_path(path)?;
    let fd = unsafe { libc::openat(dirfd, c.as_ptr(), flags | libc::O_CLOEXEC) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { File::from_raw_fd(fd) })
}

pub fn openat_read(dirfd: RawFd, path: &Path) -> io::Result<File> {
    openat_flags(dirfd, path, libc::O_RDONLY)
}

pub fn openat_rw(dirfd: RawFd, path: &Path) -> io::Result<File> {
    openat_flags(dirfd, path, libc::O_RDWR)
}

/// Open a directory relative to `dirfd`. The returned `File` is only a
/// handle for ioctls and further relative opens.
pub fn openat_dir(dirfd: RawFd, path: &Path) -> io::Result<File> {
    openat_flags(dirfd, path, libc::O_RDONLY | libc::O_DIRECTORY)
}

/// Open a directory by absolute path.
pub fn open_dir(path: &Path) -> io::Result<File> {
    let c = c_path(path)?;
    let fd = unsafe { libc::open(c.as_ptr(), libc::O_RDONLY | libc::O_DIRECTORY | libc::O_CLOEXEC) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { File::from_raw_fd(fd) })
}
