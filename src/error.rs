use std::io;
use std::path::PathBuf;

use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum DedupError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),
    #[error("not a btrfs subvolume: {0}")]
    NotAVolume(PathBuf),
    #[error("filesystem {0} has no usable mountpoint")]
    NotMounted(Uuid),
    #[error("no block device found for filesystem {0}")]
    NotPlugged(Uuid),
    #[error("no btrfs filesystem detected on {0}")]
    BadDevice(PathBuf),
    #[error("ioctl buffer of exactly 1024 bytes trips a platform quirk")]
    SearchBufSize,
    #[error("clone rejected by the kernel (no-COW file or invalid range)")]
    NodataCowOrInvalid,
    #[error("files differ: {0} {1}")]
    FilesDiffer(PathBuf, PathBuf),
    #[error("some of the files to deduplicate are open for writing elsewhere:\n{0}")]
    FilesInUse(String),
    #[error("root tree has unresolvable parents for roots {0:?}")]
    CorruptRootTree(Vec<u64>),
    #[error("parse error: {0}")]
    Parse(&'static str),
}

impl DedupError {
    /// True for conditions a user can fix (permissions, wrong path, files
    /// held open elsewhere). The CLI maps these to exit code 1.
    pub fn is_user_recoverable(&self) -> bool {
        match self {
            DedupError::Io(e) => e.raw_os_error() == Some(libc::EPERM),
            DedupError::NotAVolume(_)
            | DedupError::BadDevice(_)
            | DedupError::FilesDiffer(_, _)
            | DedupError::FilesInUse(_) => true,
            _ => false,
        }
    }
}

/// Routing for per-file failures during the dedup pipeline.
///
/// The engine matches on this explicitly: `Stale` deletes the stored
/// record, the middle three notify-and-skip, `Fatal` propagates.
#[derive(Debug)]
pub enum FileOpError {
    /// The inode no longer exists; its record is garbage.
    Stale,
    /// ETXTBSY: the file backs a running executable.
    Busy,
    /// EACCES on open.
    AccessDenied,
    /// ENOENT on open after a successful path lookup (rename/unlink race).
    Moved,
    Fatal(io::Error),
}

impl FileOpError {
    /// Classify an error from inode path lookup.
    pub fn from_lookup(e: io::Error) -> Self {
        match e.raw_os_error() {
            Some(libc::ENOENT) => FileOpError::Stale,
            _ => FileOpError::Fatal(e),
        }
    }

    /// Classify an error from opening a looked-up path.
    pub fn from_open(e: io::Error) -> Self {
        match e.raw_os_error() {
            Some(libc::ETXTBSY) => FileOpError::Busy,
            Some(libc::EACCES) => FileOpError::AccessDenied,
            Some(libc::ENOENT) => FileOpError::Moved,
            _ => FileOpError::Fatal(e),
        }
    }
}
