//! Human-readable progress events.
//!
//! The engine reports through a `FnMut(&Notice)` callback; rendering is
//! the caller's business. The CLI prints `Display`, tests collect the
//! variants.

use std::fmt;
use std::path::PathBuf;

/// Events emitted during scan and dedup runs.
#[derive(Debug, Clone)]
pub enum Notice {
    /// Starting an incremental walk of a volume's inode tree.
    ScanBegin {
        volume: String,
        min_generation: u64,
        top_generation: u64,
    },
    /// The watermark already covers the volume's current generation.
    ScanUpToDate { volume: String, generation: u64 },
    /// A volume walk finished and its watermark advanced.
    ScanFinished {
        volume: String,
        tracked: u64,
        generation: u64,
    },
    /// Read-only snapshots were left out of a filesystem's batch.
    FrozenSkipped { fs: String, count: usize },
    /// A whole filesystem was left out.
    FsSkipped { fs: String, reason: &'static str },
    /// Entering a size group of dedup candidates.
    GroupBegin { size: u64, candidates: usize },
    /// A writer holds the file open elsewhere; retried next run.
    FileInUse { path: PathBuf },
    /// The file backs a running executable.
    FileBusy { path: PathBuf },
    FileAccessDenied { path: PathBuf },
    /// The file moved or vanished between lookup and open.
    FileMoved { path: PathBuf },
    /// The group needs more fds than the process may open; retried next
    /// run.
    GroupOverFdLimit { size: u64, needed: u64, limit: u64 },
    /// A destination now shares the source's extents.
    Deduped {
        source: PathBuf,
        dest: PathBuf,
        size: u64,
    },
    /// The kernel refused the clone pair (typically a no-COW file).
    CloneRejected { source: PathBuf, dest: PathBuf },
    /// End-of-run accounting: bytes a perfect pass could reclaim.
    DedupComplete { gained: u64 },
}

impl fmt::Display for Notice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Notice::ScanBegin {
                volume,
                min_generation,
                top_generation,
            } => write!(
                f,
                "Scanning {volume} generations {min_generation} to {top_generation}"
            ),
            Notice::ScanUpToDate { volume, generation } => {
                write!(f, "Volume {volume}: generation is still {generation}")
            }
            Notice::ScanFinished {
                volume,
                tracked,
                generation,
            } => write!(
                f,
                "Scanned {volume}: {tracked} inodes tracked up to generation {generation}"
            ),
            Notice::FrozenSkipped { fs, count } => {
                write!(f, "Skipped {count} frozen volumes in filesystem {fs}")
            }
            Notice::FsSkipped { fs, reason } => {
                write!(f, "Skipping filesystem {fs}, {reason}")
            }
            Notice::GroupBegin { size, candidates } => {
                write!(f, "Dupe candidates for size {size}: {candidates} files")
            }
            Notice::FileInUse { path } => {
                write!(f, "File {} is in use, skipping", path.display())
            }
            Notice::FileBusy { path } => {
                write!(f, "File {} backs a running program, skipping", path.display())
            }
            Notice::FileAccessDenied { path } => {
                write!(f, "Access denied to {}, skipping", path.display())
            }
            Notice::FileMoved { path } => {
                write!(f, "File {} moved during dedup, skipping", path.display())
            }
            Notice::GroupOverFdLimit { size, needed, limit } => write!(
                f,
                "Size group {size} needs {needed} open files, limit is {limit}; deferred"
            ),
            Notice::Deduped { source, dest, size } => write!(
                f,
                "Deduplicated {} bytes: {} <- {}",
                size,
                source.display(),
                dest.display()
            ),
            Notice::CloneRejected { source, dest } => write!(
                f,
                "Clone rejected for {} -> {} (no-COW file?)",
                source.display(),
                dest.display()
            ),
            Notice::DedupComplete { gained } => {
                write!(f, "Potential space gain: {gained} bytes")
            }
        }
    }
}
