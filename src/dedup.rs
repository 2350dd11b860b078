//! The dedup engine.
//!
//! Consumes size groups from the windowed query, drives candidates
//! through the tiered identity pipeline (sample hash, extent-map hash,
//! full content hash), then byte-compares and clones confirmed
//! duplicates under the immutability guard. Largest sizes first; within
//! a size, ascending inode numbers; never across filesystems.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom};
use std::os::fd::{AsRawFd, FromRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::api::Notice;
use crate::btrfs::{self, CloneResult};
use crate::error::{DedupError, FileOpError};
use crate::filesystem::Volume;
use crate::guard::ImmutableFds;
use crate::hashing::{READ_BUF, content_hash, extent_hash_of, sample_hash};
use crate::platform::openat::{openat_read, openat_rw};
use crate::platform::{fd_limit, raise_fd_limit};
use crate::store::windowed::{InodeKey, SizeGroup, SkippedList, WindowedQuery};
use crate::store::{Checkpointer, Store};

pub struct DedupOptions {
    /// Defragment each clone source first. Off by default: defrag can
    /// unshare extents and drop compression.
    pub defrag: bool,
}

/// Descriptors that must stay free while a group is open: the standard
/// streams, the store connections, and one directory handle per volume
/// in the batch.
fn reserved_fds(volumes: usize) -> u64 {
    7 + volumes as u64
}

/// Descriptors a group needs while frozen.
fn fds_needed(candidates: usize, volumes: usize) -> u64 {
    2 * candidates as u64 + reserved_fds(volumes)
}

/// Deduplicate all dirty size groups of one filesystem's volume batch.
///
/// Cancellation is honoured between size groups only; the guard must
/// release on the same path it acquired, so a group in flight runs to
/// completion. Returns the number of bytes the clones reclaimed.
pub fn dedup_filesystem<F>(
    store: &Store,
    fs_id: i64,
    vols: &[Volume],
    cancel: &AtomicBool,
    opts: &DedupOptions,
    notify: &mut F,
) -> Result<u64, DedupError>
where
    F: FnMut(&Notice),
{
    let vol_map: HashMap<i64, &Volume> = vols.iter().map(|v| (v.id, v)).collect();
    let vol_ids: Vec<i64> = vols.iter().map(|v| v.id).collect();
    let skipped: SkippedList = Rc::new(RefCell::new(Vec::new()));

    let checkpointer = Checkpointer::spawn(store.path().to_path_buf())?;
    store.begin_relaxed()?;

    let mut gained = 0u64;
    let result = (|| -> Result<(), DedupError> {
        let query = WindowedQuery::new(store, vol_ids, skipped.clone(), Some(&checkpointer))?;
        for group in query {
            if cancel.load(Ordering::Relaxed) {
                tracing::info!("cancellation observed, stopping between size groups");
                break;
            }
            let group = group?;
            gained += process_group(store, fs_id, &vol_map, &group, opts, &skipped, notify)?;
        }
        Ok(())
    })();

    // Pending dirty-flag resets were flushed by the query; stop the
    // checkpointer, then make the run durable.
    checkpointer.stop();
    store.end_relaxed()?;
    result?;

    notify(&Notice::DedupComplete { gained });
    Ok(gained)
}

struct Candidate<'v> {
    key: InodeKey,
    vol: &'v Volume,
    path: PathBuf,
}

fn process_group<F>(
    store: &Store,
    fs_id: i64,
    vols: &HashMap<i64, &Volume>,
    group: &SizeGroup,
    opts: &DedupOptions,
    skipped: &SkippedList,
    notify: &mut F,
) -> Result<u64, DedupError>
where
    F: FnMut(&Notice),
{
    notify(&Notice::GroupBegin {
        size: group.size,
        candidates: group.inode_count,
    });

    // ---- Sample-hash tier ----
    let mut by_sample: HashMap<u32, Vec<Candidate<'_>>> = HashMap::new();
    for row in &group.inodes {
        let vol = match vols.get(&row.vol_id) {
            Some(vol) => *vol,
            None => continue,
        };
        let key = InodeKey {
            vol_id: row.vol_id,
            ino: row.ino,
        };
        let path = match btrfs::lookup_one_path(vol.raw_fd(), row.ino, 0) {
            Ok(path) => path,
            Err(e) => match FileOpError::from_lookup(e) {
                // The inode is gone; its record follows.
                FileOpError::Stale => {
                    store.delete_inode(key.vol_id, key.ino)?;
                    continue;
                }
                FileOpError::Fatal(e) => return Err(DedupError::Io(e)),
                _ => unreachable!("lookup classifies to Stale or Fatal"),
            },
        };
        let mut rfile = match openat_read(vol.raw_fd(), &path) {
            Ok(f) => f,
            Err(e) => {
                notify_open_failure(FileOpError::from_open(e), &path, notify)?;
                continue;
            }
        };
        let hash = sample_hash(&mut rfile, group.size)?;
        store.set_sample_hash(key.vol_id, key.ino, hash)?;
        by_sample.entry(hash).or_default().push(Candidate { key, vol, path });
    }
    by_sample.retain(|_, bucket| bucket.len() >= 2);

    // ---- Extent-map tier ----
    // A bucket whose extent maps all hash alike is either fully shared
    // already or would not benefit; drop it before the expensive tiers.
    let mut survivors: Vec<Candidate<'_>> = Vec::new();
    for (_, bucket) in by_sample {
        let mut layouts = HashSet::new();
        let mut kept = Vec::new();
        for cand in bucket {
            let rfile = match openat_read(cand.vol.raw_fd(), &cand.path) {
                Ok(f) => f,
                Err(e) => {
                    notify_open_failure(FileOpError::from_open(e), &cand.path, notify)?;
                    continue;
                }
            };
            let hash = extent_hash_of(rfile.as_raw_fd())?;
            store.set_extent_hash(cand.key.vol_id, cand.key.ino, hash)?;
            layouts.insert(hash);
            kept.push(cand);
        }
        if layouts.len() < 2 {
            continue;
        }
        survivors.extend(kept);
    }
    if survivors.len() < 2 {
        return Ok(0);
    }
    survivors.sort_by_key(|c| (c.key.ino, c.key.vol_id));

    // ---- Open-for-dedup phase ----
    // Scoped file ownership above has already dropped every previous
    // group's descriptors, so the limit check reflects reality.
    let needed = fds_needed(survivors.len(), vols.len());
    let mut limit = fd_limit()?;
    if needed > limit.soft {
        limit = raise_fd_limit(needed)?;
    }
    if needed > limit.soft {
        notify(&Notice::GroupOverFdLimit {
            size: group.size,
            needed,
            limit: limit.soft,
        });
        // Never silently drop inodes over the limit: defer the whole
        // group to the next run.
        let mut list = skipped.borrow_mut();
        for row in group.inodes.iter().filter(|r| r.dirty) {
            list.push(InodeKey {
                vol_id: row.vol_id,
                ino: row.ino,
            });
        }
        return Ok(0);
    }

    // Everything opens read-write: the crypto tier may still eliminate
    // any file, so no source can be picked yet.
    let mut files: Vec<(Candidate<'_>, File)> = Vec::new();
    for cand in survivors {
        match openat_rw(cand.vol.raw_fd(), &cand.path) {
            Ok(f) => files.push((cand, f)),
            Err(e) => notify_open_failure(FileOpError::from_open(e), &cand.path, notify)?,
        }
    }
    if files.len() < 2 {
        return Ok(0);
    }

    // ---- Freeze ----
    let fds: Vec<RawFd> = files.iter().map(|(_, f)| f.as_raw_fd()).collect();
    let mut guard = ImmutableFds::acquire(fds)?;
    let in_write_use = guard.fds_in_write_use()?;

    // ---- Full-hash tier, under the freeze ----
    let mut by_hash: BTreeMap<[u8; 32], Vec<usize>> = BTreeMap::new();
    for (idx, (cand, file)) in files.iter_mut().enumerate() {
        if in_write_use.contains(&file.as_raw_fd()) {
            notify(&Notice::FileInUse {
                path: cand.path.clone(),
            });
            skipped.borrow_mut().push(cand.key);
            continue;
        }
        let digest = content_hash(file)?;

        // Re-validate after the read: the fd must still be the stored
        // inode and the length must still match the group.
        let mut st: libc::stat = unsafe { std::mem::zeroed() };
        if unsafe { libc::fstat(file.as_raw_fd(), &mut st) } != 0 {
            return Err(DedupError::Io(io::Error::last_os_error()));
        }
        if st.st_ino != cand.key.ino || st.st_dev != cand.vol.st_dev {
            skipped.borrow_mut().push(cand.key);
            continue;
        }
        if st.st_size as u64 != group.size {
            if (st.st_size as u64) < cand.vol.size_cutoff {
                store.delete_inode(cand.key.vol_id, cand.key.ino)?;
            } else {
                skipped.borrow_mut().push(cand.key);
            }
            continue;
        }
        by_hash.entry(digest).or_default().push(idx);
    }

    // ---- Clone ----
    let mut gained = 0u64;
    'bucket: for indices in by_hash.values() {
        if indices.len() < 2 {
            continue;
        }
        let (&src_idx, dest_indices) = indices.split_first().unwrap();
        let (src_cand, src_file) = &files[src_idx];
        if opts.defrag {
            if let Err(e) = btrfs::defragment(src_file.as_raw_fd()) {
                tracing::warn!("defragment of {} failed: {e}", src_cand.path.display());
            }
        }
        let mut participants = vec![(src_cand.key.vol_id, src_cand.key.ino)];
        for &dest_idx in dest_indices {
            let (dest_cand, dest_file) = &files[dest_idx];
            // Paranoia against a hash collision or a hasher bug: the
            // full digests matched, so the bytes must.
            let identical = cmp_fds(src_file.as_raw_fd(), dest_file.as_raw_fd())?;
            assert!(
                identical,
                "files differ after matching content hash: {} {}",
                src_cand.path.display(),
                dest_cand.path.display()
            );
            match btrfs::clone_data(dest_file, src_file, true) {
                Ok(CloneResult::Cloned) => {
                    participants.push((dest_cand.key.vol_id, dest_cand.key.ino));
                    gained += group.size;
                    notify(&Notice::Deduped {
                        source: src_cand.path.clone(),
                        dest: dest_cand.path.clone(),
                        size: group.size,
                    });
                }
                Ok(CloneResult::AlreadyShared) => {
                    tracing::debug!(
                        "did not dedup (same extents): {} {}",
                        src_cand.path.display(),
                        dest_cand.path.display()
                    );
                }
                Err(DedupError::NodataCowOrInvalid) => {
                    notify(&Notice::CloneRejected {
                        source: src_cand.path.clone(),
                        dest: dest_cand.path.clone(),
                    });
                    continue 'bucket;
                }
                Err(e) => return Err(e),
            }
        }
        if participants.len() >= 2 {
            store.append_dedup_event(fs_id, group.size, &participants)?;
        }
    }

    // Guard drops here, restoring flags and times in reverse order.
    drop(guard);
    Ok(gained)
}

fn notify_open_failure<F>(
    err: FileOpError,
    path: &Path,
    notify: &mut F,
) -> Result<(), DedupError>
where
    F: FnMut(&Notice),
{
    match err {
        FileOpError::Busy => notify(&Notice::FileBusy {
            path: path.to_path_buf(),
        }),
        FileOpError::AccessDenied => notify(&Notice::FileAccessDenied {
            path: path.to_path_buf(),
        }),
        FileOpError::Moved | FileOpError::Stale => notify(&Notice::FileMoved {
            path: path.to_path_buf(),
        }),
        FileOpError::Fatal(e) => return Err(DedupError::Io(e)),
    }
    Ok(())
}

/// Freeze an explicit file set, verify equality, and project the first
/// file's extents onto the rest. Backs the `dedup-files` command.
pub fn dedup_files(source: &Path, dests: &[PathBuf], defrag: bool) -> Result<(), DedupError> {
    let src = if defrag {
        OpenOptions::new().read(true).write(true).open(source)?
    } else {
        File::open(source)?
    };
    let mut dest_files: Vec<(PathBuf, File)> = Vec::new();
    for dest in dests {
        let f = OpenOptions::new().read(true).write(true).open(dest)?;
        dest_files.push((dest.clone(), f));
    }

    let mut fd_names: HashMap<RawFd, PathBuf> = HashMap::new();
    fd_names.insert(src.as_raw_fd(), source.to_path_buf());
    for (name, f) in &dest_files {
        fd_names.insert(f.as_raw_fd(), name.clone());
    }

    let mut guard = ImmutableFds::acquire(fd_names.keys().copied().collect())?;
    let in_use = guard.fds_in_write_use()?;
    if !in_use.is_empty() {
        let mut report = String::new();
        for fd in &in_use {
            report.push_str(&format!("File {} is in use\n", fd_names[fd].display()));
            for info in guard.write_use_info(*fd)? {
                report.push_str(&format!("  used as {}\n", info.proc_path.display()));
            }
        }
        return Err(DedupError::FilesInUse(report));
    }

    if defrag {
        btrfs::defragment(src.as_raw_fd())?;
    }
    for (name, dest) in &dest_files {
        if !cmp_fds(src.as_raw_fd(), dest.as_raw_fd())? {
            return Err(DedupError::FilesDiffer(source.to_path_buf(), name.clone()));
        }
        btrfs::clone_data(dest, &src, !defrag)?;
    }
    Ok(())
}

/// Byte-compare two descriptors through private dups, leaving the
/// originals' offsets alone.
fn cmp_fds(fd1: RawFd, fd2: RawFd) -> io::Result<bool> {
    let mut f1 = dup_file(fd1)?;
    let mut f2 = dup_file(fd2)?;
    cmp_files(&mut f1, &mut f2)
}

fn dup_file(fd: RawFd) -> io::Result<File> {
    let dup = unsafe { libc::dup(fd) };
    if dup < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { File::from_raw_fd(dup) })
}

fn cmp_files(f1: &mut File, f2: &mut File) -> io::Result<bool> {
    f1.seek(SeekFrom::Start(0))?;
    f2.seek(SeekFrom::Start(0))?;
    let mut buf1 = [0u8; READ_BUF];
    let mut buf2 = [0u8; READ_BUF];
    loop {
        let n1 = fill_buf(f1, &mut buf1)?;
        let n2 = fill_buf(f2, &mut buf2)?;
        if n1 != n2 || buf1[..n1] != buf2[..n2] {
            return Ok(false);
        }
        if n1 == 0 {
            return Ok(true);
        }
    }
}

/// Read until `buf` is full or EOF; short `read` returns do not mean
/// EOF on all filesystems.
fn fill_buf(f: &mut File, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = f.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn fd_budget_arithmetic() {
        // Streams + store + one dir handle per volume.
        assert_eq!(reserved_fds(3), 10);
        assert_eq!(fds_needed(0, 1), 8);
        assert_eq!(fds_needed(100, 2), 209);
    }

    #[test]
    fn cmp_files_detects_single_byte_difference() {
        let mut a = tempfile::tempfile().unwrap();
        let mut b = tempfile::tempfile().unwrap();
        let mut data = vec![0x55u8; 100_000];
        a.write_all(&data).unwrap();
        data[50_000] ^= 1;
        b.write_all(&data).unwrap();
        assert!(!cmp_files(&mut a, &mut b).unwrap());
    }

    #[test]
    fn cmp_files_accepts_identical_content() {
        let mut a = tempfile::tempfile().unwrap();
        let mut b = tempfile::tempfile().unwrap();
        let data = vec![0xA5u8; 100_000];
        a.write_all(&data).unwrap();
        b.write_all(&data).unwrap();
        assert!(cmp_files(&mut a, &mut b).unwrap());
    }

    #[test]
    fn cmp_files_rejects_length_mismatch() {
        let mut a = tempfile::tempfile().unwrap();
        let mut b = tempfile::tempfile().unwrap();
        a.write_all(&[1u8; 1000]).unwrap();
        b.write_all(&[1u8; 1001]).unwrap();
        assert!(!cmp_files(&mut a, &mut b).unwrap());
    }
}
