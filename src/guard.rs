//! Scoped immutability over a set of open files.
//!
//! The clone ioctl needs both files quiescent and there is no kernel
//! lease that freezes an inode without touching metadata. Setting the
//! IMMUTABLE flag stops new writable fds from being opened; writers
//! that already hold one are detected through `/proc` and reported so
//! the caller can decline to dedup that inode. Best-effort against a
//! cooperative system, not a lock.

use std::collections::{HashMap, HashSet};
use std::io;
use std::os::fd::RawFd;
use std::os::unix::fs::MetadataExt;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use crate::platform::chattr::{FS_IMMUTABLE_FL, edit_flags};
use crate::platform::times::{fstat_ns, futimens_ns};

/// One `/proc` reference to an inode under test.
#[derive(Debug, Clone)]
pub struct UseInfo {
    pub proc_path: PathBuf,
    pub is_readable: bool,
    pub is_writable: bool,
}

struct RestoreInfo {
    fd: RawFd,
    was_immutable: bool,
    atime: libc::timespec,
    mtime: libc::timespec,
}

/// Marks a set of fds immutable for its lifetime.
///
/// Works at the inode level; the fds only pin the inodes unambiguously.
/// Release runs in reverse acquisition order on every exit path,
/// including unwinds: the flag is cleared only where it was not set
/// before, and (atime, mtime) are restored on every fd at nanosecond
/// resolution (the flag edit itself does not touch them, so the values
/// captured after locking are the ones to put back).
pub struct ImmutableFds {
    fds: Vec<RawFd>,
    revert: Vec<RestoreInfo>,
    in_use: Option<HashMap<RawFd, Vec<UseInfo>>>,
}

impl ImmutableFds {
    pub fn acquire(fds: Vec<RawFd>) -> io::Result<Self> {
        let mut guard = ImmutableFds {
            fds,
            revert: Vec::new(),
            in_use: None,
        };
        for i in 0..guard.fds.len() {
            let fd = guard.fds[i];
            // Dropping the partially built guard rolls back the fds
            // locked so far.
            let prev = edit_flags(fd, FS_IMMUTABLE_FL, 0)?;
            let was_immutable = prev & FS_IMMUTABLE_FL != 0;
            let (atime, mtime) = match fstat_ns(fd) {
                Ok(times) => times,
                Err(e) => {
                    // This fd is not on the revert list yet.
                    if !was_immutable {
                        let _ = edit_flags(fd, 0, FS_IMMUTABLE_FL);
                    }
                    return Err(e);
                }
            };
            guard.revert.push(RestoreInfo {
                fd,
                was_immutable,
                atime,
                mtime,
            });
        }
        Ok(guard)
    }

    fn require_use_info(&mut self) -> io::Result<()> {
        // Only write use is tracked; read uses can appear at any moment
        // after the scan anyway.
        if self.in_use.is_none() {
            let mut map: HashMap<RawFd, Vec<UseInfo>> = HashMap::new();
            for (fd, info) in find_inodes_in_use(&self.fds)? {
                if info.is_writable {
                    map.entry(fd).or_default().push(info);
                }
            }
            self.in_use = Some(map);
        }
        Ok(())
    }

    /// The guarded fds whose inodes some other fd holds open writable.
    pub fn fds_in_write_use(&mut self) -> io::Result<HashSet<RawFd>> {
        self.require_use_info()?;
        Ok(self.in_use.as_ref().unwrap().keys().copied().collect())
    }

    /// The `/proc` entries responsible for a write-use report.
    pub fn write_use_info(&mut self, fd: RawFd) -> io::Result<Vec<UseInfo>> {
        self.require_use_info()?;
        Ok(self
            .in_use
            .as_ref()
            .unwrap()
            .get(&fd)
            .cloned()
            .unwrap_or_default())
    }
}

impl Drop for ImmutableFds {
    fn drop(&mut self) {
        for r in self.revert.iter().rev() {
            if !r.was_immutable {
                let _ = edit_flags(r.fd, 0, FS_IMMUTABLE_FL);
            }
            // Someone might modify the file between the flag edit and
            // the time restore; that window needs kernel support to
            // close.
            let _ = futimens_ns(r.fd, r.atime, r.mtime);
        }
    }
}

fn use_info_of(proc_path: &Path) -> io::Result<Option<UseInfo>> {
    // The symlink's own mode bits encode the open mode of the fd.
    match std::fs::symlink_metadata(proc_path) {
        Ok(meta) => {
            let mode = meta.permissions().mode();
            Ok(Some(UseInfo {
                proc_path: proc_path.to_path_buf(),
                is_readable: mode & 0o400 != 0,
                is_writable: mode & 0o200 != 0,
            }))
        }
        Err(e) if e.raw_os_error() == Some(libc::ENOENT) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Find which of these inodes other fds refer to, with their open modes.
///
/// Scans `/proc/<pid>/fd/*` and `/proc/<pid>/map_files/*` (the latter
/// exists since Linux 3.3). The passed fds themselves are not counted,
/// but other descriptors of the current process pointing at the same
/// inodes are. Processes whose `/proc` entries are unreadable (not ours,
/// or gone mid-scan) are skipped.
pub fn find_inodes_in_use(fds: &[RawFd]) -> io::Result<Vec<(RawFd, UseInfo)>> {
    let self_pid = unsafe { libc::getpid() } as u64;

    let mut id_fd_assoc: HashMap<(u64, u64), Vec<RawFd>> = HashMap::new();
    for &fd in fds {
        let mut st: libc::stat = unsafe { std::mem::zeroed() };
        if unsafe { libc::fstat(fd, &mut st) } != 0 {
            return Err(io::Error::last_os_error());
        }
        id_fd_assoc
            .entry((st.st_dev, st.st_ino))
            .or_default()
            .push(fd);
    }

    let mut found = Vec::new();

    for entry in std::fs::read_dir("/proc")? {
        let entry = entry?;
        let pid: u64 = match entry.file_name().to_str().and_then(|s| s.parse().ok()) {
            Some(pid) => pid,
            None => continue,
        };

        for subdir in ["fd", "map_files"] {
            let dir = entry.path().join(subdir);
            let iter = match std::fs::read_dir(&dir) {
                Ok(iter) => iter,
                // Other users' fd tables need privileges; processes also
                // exit mid-scan. ESTALE shows up on network filesystems.
                Err(_) => continue,
            };
            for link in iter {
                let link = match link {
                    Ok(l) => l,
                    Err(_) => continue,
                };
                let proc_path = link.path();
                let st = match std::fs::metadata(&proc_path) {
                    Ok(st) => st,
                    Err(e)
                        if matches!(
                            e.raw_os_error(),
                            Some(libc::ENOENT) | Some(libc::ESTALE)
                        ) =>
                    {
                        continue;
                    }
                    Err(_) => continue,
                };
                let st_id = (st.dev(), st.ino());
                let original_fds = match id_fd_assoc.get(&st_id) {
                    Some(fds) => fds,
                    None => continue,
                };

                // Don't count the fds under test against themselves.
                if pid == self_pid && subdir == "fd" {
                    let other_fd: Option<RawFd> = link
                        .file_name()
                        .to_str()
                        .and_then(|s| s.parse().ok());
                    if let Some(other) = other_fd {
                        if original_fds.contains(&other) {
                            continue;
                        }
                    }
                }

                if let Some(info) = use_info_of(&proc_path)? {
                    for &fd in original_fds {
                        found.push((fd, info.clone()));
                    }
                }
            }
        }
    }

    Ok(found)
}

/// Filter of `find_inodes_in_use` down to writable references.
pub fn find_inodes_in_write_use(fds: &[RawFd]) -> io::Result<Vec<(RawFd, UseInfo)>> {
    Ok(find_inodes_in_use(fds)?
        .into_iter()
        .filter(|(_, info)| info.is_writable)
        .collect())
}
