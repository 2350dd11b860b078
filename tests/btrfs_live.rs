//! End-to-end scenarios against a real btrfs volume.
//!
//! These need root (for tree search and the IMMUTABLE flag) and a
//! scratch btrfs subvolume to play in. Set BTRDEDUP_TEST_VOLUME to the
//! subvolume's mountpoint to enable them; they skip cleanly otherwise.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use btrdedup::api::Notice;
use btrdedup::dedup::{DedupOptions, dedup_files, dedup_filesystem};
use btrdedup::error::DedupError;
use btrdedup::filesystem::WholeFs;
use btrdedup::platform::fiemap::fiemap;
use btrdedup::scan::scan_volume;
use btrdedup::store::Store;

const FILE_SIZE: usize = 1024 * 1024;
const CUTOFF: u64 = 128 * 1024;

fn live_volume() -> Option<PathBuf> {
    let path = match std::env::var_os("BTRDEDUP_TEST_VOLUME") {
        Some(p) => PathBuf::from(p),
        None => {
            eprintln!("Skipping: BTRDEDUP_TEST_VOLUME not set");
            return None;
        }
    };
    if unsafe { libc::geteuid() } != 0 {
        eprintln!("Skipping: requires root");
        return None;
    }
    Some(path)
}

struct Playground {
    vol_path: PathBuf,
    dir: PathBuf,
}

impl Playground {
    fn new(vol_path: PathBuf, tag: &str) -> Playground {
        let dir = vol_path.join(format!(
            "btrdedup-test-{}-{tag}",
            std::process::id()
        ));
        std::fs::create_dir(&dir).unwrap();
        Playground { vol_path, dir }
    }

    fn write_file(&self, name: &str, data: &[u8]) -> PathBuf {
        let path = self.dir.join(name);
        let mut f = File::create(&path).unwrap();
        f.write_all(data).unwrap();
        f.sync_all().unwrap();
        path
    }
}

impl Drop for Playground {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.dir);
    }
}

fn sample_data(seed: u8) -> Vec<u8> {
    let mut data = vec![0u8; FILE_SIZE];
    for (i, b) in data.iter_mut().enumerate() {
        *b = seed ^ (i as u8) ^ ((i >> 8) as u8);
    }
    data
}

/// Scan + dedup the playground's volume, collecting notices.
fn run_pass(pg: &Playground, store: &Store) -> Result<Vec<Notice>, DedupError> {
    let mut notices = Vec::new();
    let mut notify = |n: &Notice| notices.push(n.clone());
    let mut whole = WholeFs::new(store, Some(CUTOFF))?;
    let mut vols = whole.load_vols(std::slice::from_ref(&pg.vol_path), false, &mut notify)?;
    assert_eq!(vols.len(), 1);
    scan_volume(store, &mut vols[0], true, &mut notify)?;
    let fs_id = vols[0].fs_id;
    let cancel = Arc::new(AtomicBool::new(false));
    dedup_filesystem(
        store,
        fs_id,
        &vols,
        &cancel,
        &DedupOptions { defrag: false },
        &mut notify,
    )?;
    Ok(notices)
}

fn extent_map_of(path: &Path) -> Vec<btrdedup::platform::fiemap::ExtentRecord> {
    let f = File::open(path).unwrap();
    fiemap(f.as_raw_fd()).unwrap()
}

#[test]
fn identical_files_are_merged_and_logged() {
    let Some(vol_path) = live_volume() else { return };
    let pg = Playground::new(vol_path, "merge");
    let data = sample_data(0x11);
    let a = pg.write_file("one.sample", &data);
    let b = pg.write_file("two.sample", &data);
    // Same sample window, different content at the midpoint: the full
    // hash must separate this one.
    let mut other = data.clone();
    other[FILE_SIZE / 2] ^= 0xFF;
    let c = pg.write_file("three.sample", &other);

    let dir = tempfile::tempdir().unwrap();
    let store = Store::open(&dir.path().join("db.sqlite")).unwrap();
    run_pass(&pg, &store).unwrap();

    assert_eq!(
        extent_map_of(&a),
        extent_map_of(&b),
        "identical files should share extents after dedup"
    );
    assert_eq!(std::fs::read(&c).unwrap(), other, "odd file untouched");

    // Exactly one event for our size group, with both participants.
    let fs_list = store.list_filesystems().unwrap();
    assert_eq!(fs_list.len(), 1);
    let events: Vec<_> = store
        .dedup_events(fs_list[0].0)
        .unwrap()
        .into_iter()
        .filter(|e| e.item_size == FILE_SIZE as u64)
        .collect();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].inodes.len(), 2);
}

#[test]
fn scan_is_idempotent_without_changes() {
    let Some(vol_path) = live_volume() else { return };
    let pg = Playground::new(vol_path, "idem");
    pg.write_file("steady.sample", &sample_data(0x22));

    let dir = tempfile::tempdir().unwrap();
    let store = Store::open(&dir.path().join("db.sqlite")).unwrap();

    let mut notices = Vec::new();
    let mut notify = |n: &Notice| notices.push(n.clone());
    let mut whole = WholeFs::new(&store, Some(CUTOFF)).unwrap();
    let mut vols = whole
        .load_vols(std::slice::from_ref(&pg.vol_path), false, &mut notify)
        .unwrap();
    scan_volume(&store, &mut vols[0], true, &mut notify).unwrap();

    // No writes in between: the second scan must short-circuit.
    notices.clear();
    let mut notify = |n: &Notice| notices.push(n.clone());
    scan_volume(&store, &mut vols[0], true, &mut notify).unwrap();
    assert!(
        notices
            .iter()
            .any(|n| matches!(n, Notice::ScanUpToDate { .. })),
        "second scan should report the generation unchanged: {notices:?}"
    );
}

#[test]
fn held_writable_fd_skips_the_inode() {
    let Some(vol_path) = live_volume() else { return };
    let pg = Playground::new(vol_path, "inuse");
    let data = sample_data(0x33);
    let a = pg.write_file("one.sample", &data);
    pg.write_file("two.sample", &data);

    let holder = OpenOptions::new().write(true).open(&a).unwrap();
    let mtime_before = std::fs::metadata(&a).unwrap().modified().unwrap();

    let dir = tempfile::tempdir().unwrap();
    let store = Store::open(&dir.path().join("db.sqlite")).unwrap();
    let notices = run_pass(&pg, &store).unwrap();

    assert!(
        notices.iter().any(|n| matches!(n, Notice::FileInUse { .. })),
        "the held file must be reported in use: {notices:?}"
    );
    assert!(
        !notices.iter().any(|n| matches!(n, Notice::Deduped { .. })),
        "no clone may happen while a writer holds the file"
    );
    assert_eq!(
        std::fs::metadata(&a).unwrap().modified().unwrap(),
        mtime_before,
        "mtime of the held file must be restored"
    );
    drop(holder);
}

#[test]
fn dedup_files_rejects_differing_files() {
    let Some(vol_path) = live_volume() else { return };
    let pg = Playground::new(vol_path, "differ");
    let data = sample_data(0x44);
    let a = pg.write_file("src.sample", &data);
    let mut other = data.clone();
    other[12345] ^= 1;
    let b = pg.write_file("dst.sample", &other);

    let mtime_a = std::fs::metadata(&a).unwrap().modified().unwrap();
    let mtime_b = std::fs::metadata(&b).unwrap().modified().unwrap();

    let err = dedup_files(&a, &[b.clone()], false).unwrap_err();
    assert!(matches!(err, DedupError::FilesDiffer(_, _)));

    assert_eq!(std::fs::metadata(&a).unwrap().modified().unwrap(), mtime_a);
    assert_eq!(std::fs::metadata(&b).unwrap().modified().unwrap(), mtime_b);
    assert_eq!(std::fs::read(&b).unwrap(), other, "no data was rewritten");
}
