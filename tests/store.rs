use std::cell::RefCell;
use std::rc::Rc;

use btrdedup::store::windowed::{InodeKey, SizeGroup, SkippedList, WINDOW, WindowedQuery};
use btrdedup::store::Store;
use uuid::Uuid;

const FS_UUID: &str = "3b7e44e4-a01d-441f-a1b7-b6ecd9d5ad9a";
const CUTOFF: u64 = 64 * 1024;

struct Fixture {
    store: Store,
    fs_id: i64,
    vol_id: i64,
    // Dropped after the store so the database file outlives the
    // connection.
    _dir: tempfile::TempDir,
}

fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open(&dir.path().join("db.sqlite")).unwrap();
    let fs_id = store
        .get_or_create_fs(&Uuid::parse_str(FS_UUID).unwrap())
        .unwrap();
    let (vol, created) = store.get_or_create_volume(fs_id, 5, CUTOFF).unwrap();
    assert!(created);
    Fixture {
        store,
        fs_id,
        vol_id: vol.id,
        _dir: dir,
    }
}

fn collect_groups(store: &Store, vol_id: i64, skipped: SkippedList) -> Vec<SizeGroup> {
    WindowedQuery::new(store, vec![vol_id], skipped, None)
        .unwrap()
        .collect::<Result<Vec<_>, _>>()
        .unwrap()
}

// ---------------------------------------------------------------------------
// Inode upserts
// ---------------------------------------------------------------------------

#[test]
fn upsert_sets_dirty_and_keeps_hashes_while_size_is_stable() {
    let fx = fixture();
    fx.store.upsert_inode(fx.vol_id, 257, 1_000_000).unwrap();
    fx.store.set_sample_hash(fx.vol_id, 257, 0xDEAD_BEEF).unwrap();
    fx.store.set_extent_hash(fx.vol_id, 257, 0x1234_5678_9ABC_DEF0).unwrap();

    // Same size seen again: cached hashes stay valid.
    fx.store.upsert_inode(fx.vol_id, 257, 1_000_000).unwrap();
    let row = fx.store.inode_record(fx.vol_id, 257).unwrap().unwrap();
    assert!(row.dirty);
    assert_eq!(row.sample_hash, Some(0xDEAD_BEEF));
    assert_eq!(row.extent_hash, Some(0x1234_5678_9ABC_DEF0));
}

#[test]
fn upsert_clears_hashes_on_size_change() {
    let fx = fixture();
    fx.store.upsert_inode(fx.vol_id, 257, 1_000_000).unwrap();
    fx.store.set_sample_hash(fx.vol_id, 257, 1).unwrap();
    fx.store.set_extent_hash(fx.vol_id, 257, 2).unwrap();

    fx.store.upsert_inode(fx.vol_id, 257, 2_000_000).unwrap();
    let row = fx.store.inode_record(fx.vol_id, 257).unwrap().unwrap();
    assert_eq!(row.size, 2_000_000);
    assert_eq!(row.sample_hash, None);
    assert_eq!(row.extent_hash, None);
    assert!(row.dirty);
}

#[test]
fn delete_inode_removes_the_record() {
    let fx = fixture();
    fx.store.upsert_inode(fx.vol_id, 300, 500_000).unwrap();
    fx.store.delete_inode(fx.vol_id, 300).unwrap();
    assert!(fx.store.inode_record(fx.vol_id, 300).unwrap().is_none());
}

// ---------------------------------------------------------------------------
// Watermarks
// ---------------------------------------------------------------------------

#[test]
fn watermark_updates_are_visible_on_reload() {
    let fx = fixture();
    fx.store.update_watermark(fx.vol_id, 1234, CUTOFF).unwrap();
    let rec = fx.store.volume_by_root(fx.fs_id, 5).unwrap().unwrap();
    assert_eq!(rec.last_tracked_generation, 1234);
    assert_eq!(rec.last_tracked_size_cutoff, Some(CUTOFF));
}

#[test]
fn reset_volume_rewinds_watermark_and_drops_inodes() {
    let fx = fixture();
    fx.store.upsert_inode(fx.vol_id, 257, 1_000_000).unwrap();
    fx.store.update_watermark(fx.vol_id, 99, CUTOFF).unwrap();

    fx.store.reset_volume(fx.vol_id).unwrap();
    let rec = fx.store.volume_by_root(fx.fs_id, 5).unwrap().unwrap();
    assert_eq!(rec.last_tracked_generation, 0);
    assert_eq!(rec.last_tracked_size_cutoff, None);
    assert!(fx.store.inode_record(fx.vol_id, 257).unwrap().is_none());
}

// ---------------------------------------------------------------------------
// Windowed size-grouping query
// ---------------------------------------------------------------------------

#[test]
fn groups_come_in_descending_size_with_ascending_inodes() {
    let fx = fixture();
    for (ino, size) in [(300, 500u64), (100, 900), (200, 900), (400, 500), (150, 700)] {
        fx.store.upsert_inode(fx.vol_id, ino, size).unwrap();
    }
    let skipped: SkippedList = Rc::new(RefCell::new(Vec::new()));
    let groups = collect_groups(&fx.store, fx.vol_id, skipped);

    // 700 is a singleton and never forms a group.
    assert_eq!(groups.len(), 2);
    assert_eq!(groups[0].size, 900);
    assert_eq!(groups[1].size, 500);
    let inos: Vec<u64> = groups[0].inodes.iter().map(|r| r.ino).collect();
    assert_eq!(inos, vec![100, 200]);
    let inos: Vec<u64> = groups[1].inodes.iter().map(|r| r.ino).collect();
    assert_eq!(inos, vec![300, 400]);
}

#[test]
fn clean_groups_are_not_yielded() {
    let fx = fixture();
    fx.store.upsert_inode(fx.vol_id, 100, 900).unwrap();
    fx.store.upsert_inode(fx.vol_id, 200, 900).unwrap();

    // First pass clears the dirty flags.
    let skipped: SkippedList = Rc::new(RefCell::new(Vec::new()));
    let groups = collect_groups(&fx.store, fx.vol_id, skipped.clone());
    assert_eq!(groups.len(), 1);

    // Nothing changed since: no groups on the second pass.
    let groups = collect_groups(&fx.store, fx.vol_id, skipped);
    assert!(groups.is_empty());
}

#[test]
fn one_dirty_inode_pulls_in_clean_group_members() {
    let fx = fixture();
    fx.store.upsert_inode(fx.vol_id, 100, 900).unwrap();
    fx.store.upsert_inode(fx.vol_id, 200, 900).unwrap();
    let skipped: SkippedList = Rc::new(RefCell::new(Vec::new()));
    collect_groups(&fx.store, fx.vol_id, skipped.clone());

    // Only one member changes; the whole group resurfaces.
    fx.store.upsert_inode(fx.vol_id, 200, 900).unwrap();
    let groups = collect_groups(&fx.store, fx.vol_id, skipped);
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].inode_count, 2);
}

#[test]
fn dirty_flags_clear_exactly_once_including_singletons() {
    let fx = fixture();
    // Two groups and a singleton between them; the singleton sits
    // inside the cleared range and must not stay dirty forever.
    for (ino, size) in [(1, 900u64), (2, 900), (3, 800), (4, 700), (5, 700)] {
        fx.store.upsert_inode(fx.vol_id, ino, size).unwrap();
    }
    let skipped: SkippedList = Rc::new(RefCell::new(Vec::new()));
    let groups = collect_groups(&fx.store, fx.vol_id, skipped);
    assert_eq!(groups.len(), 2);

    for ino in 1..=5u64 {
        let row = fx.store.inode_record(fx.vol_id, ino).unwrap().unwrap();
        assert!(!row.dirty, "inode {ino} should be clean after a full pass");
    }
}

#[test]
fn skipped_inodes_are_redirtied_for_the_next_run() {
    let fx = fixture();
    fx.store.upsert_inode(fx.vol_id, 100, 900).unwrap();
    fx.store.upsert_inode(fx.vol_id, 200, 900).unwrap();

    let skipped: SkippedList = Rc::new(RefCell::new(Vec::new()));
    {
        let mut query =
            WindowedQuery::new(&fx.store, vec![fx.vol_id], skipped.clone(), None).unwrap();
        let group = query.next().unwrap().unwrap();
        assert_eq!(group.size, 900);
        // The consumer could not process inode 200 this run.
        skipped.borrow_mut().push(InodeKey {
            vol_id: fx.vol_id,
            ino: 200,
        });
        assert!(query.next().is_none());
    }

    assert!(!fx.store.inode_record(fx.vol_id, 100).unwrap().unwrap().dirty);
    assert!(fx.store.inode_record(fx.vol_id, 200).unwrap().unwrap().dirty);
}

#[test]
fn iteration_spans_multiple_windows() {
    let fx = fixture();
    // More duplicated sizes than one window holds.
    let sizes: Vec<u64> = (0..(WINDOW as u64 + 50)).map(|i| 1_000_000 + i * 10).collect();
    let mut ino = 1000u64;
    for &size in &sizes {
        fx.store.upsert_inode(fx.vol_id, ino, size).unwrap();
        fx.store.upsert_inode(fx.vol_id, ino + 1, size).unwrap();
        ino += 2;
    }
    let skipped: SkippedList = Rc::new(RefCell::new(Vec::new()));
    let groups = collect_groups(&fx.store, fx.vol_id, skipped);

    assert_eq!(groups.len(), sizes.len());
    // Strictly descending across window boundaries.
    for pair in groups.windows(2) {
        assert!(pair[0].size > pair[1].size);
    }
    // Everything came out clean.
    for group in &groups {
        for row in &group.inodes {
            let row = fx.store.inode_record(row.vol_id, row.ino).unwrap().unwrap();
            assert!(!row.dirty);
        }
    }
}

#[test]
fn volumes_outside_the_batch_are_untouched() {
    let fx = fixture();
    let (other, _) = fx.store.get_or_create_volume(fx.fs_id, 6, CUTOFF).unwrap();
    fx.store.upsert_inode(fx.vol_id, 100, 900).unwrap();
    fx.store.upsert_inode(fx.vol_id, 200, 900).unwrap();
    fx.store.upsert_inode(other.id, 100, 900).unwrap();

    let skipped: SkippedList = Rc::new(RefCell::new(Vec::new()));
    let groups = collect_groups(&fx.store, fx.vol_id, skipped);
    assert_eq!(groups.len(), 1);
    assert!(groups[0].inodes.iter().all(|r| r.vol_id == fx.vol_id));
    // The other volume keeps its dirty flag.
    assert!(fx.store.inode_record(other.id, 100).unwrap().unwrap().dirty);
}

// ---------------------------------------------------------------------------
// Dedup events
// ---------------------------------------------------------------------------

#[test]
fn events_record_participants_in_insert_order() {
    let fx = fixture();
    fx.store
        .append_dedup_event(fx.fs_id, 8_388_608, &[(fx.vol_id, 257), (fx.vol_id, 258)])
        .unwrap();
    fx.store
        .append_dedup_event(fx.fs_id, 4_194_304, &[(fx.vol_id, 300), (fx.vol_id, 301)])
        .unwrap();

    let events = fx.store.dedup_events(fx.fs_id).unwrap();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].item_size, 8_388_608);
    assert_eq!(events[0].inodes, vec![(fx.vol_id, 257), (fx.vol_id, 258)]);
    assert_eq!(events[1].item_size, 4_194_304);
    assert!(events[0].created_at <= events[1].created_at);
}

#[test]
fn events_survive_inode_deletion() {
    let fx = fixture();
    fx.store.upsert_inode(fx.vol_id, 257, 8_388_608).unwrap();
    fx.store
        .append_dedup_event(fx.fs_id, 8_388_608, &[(fx.vol_id, 257), (fx.vol_id, 258)])
        .unwrap();
    // History is not rewritten when the inode goes away.
    fx.store.delete_inode(fx.vol_id, 257).unwrap();
    let events = fx.store.dedup_events(fx.fs_id).unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].inodes.len(), 2);
}

#[test]
fn forget_fs_cascades_through_everything() {
    let fx = fixture();
    fx.store.upsert_inode(fx.vol_id, 257, 8_388_608).unwrap();
    fx.store.record_path_history(fx.vol_id, "/mnt/data").unwrap();
    fx.store
        .append_dedup_event(fx.fs_id, 8_388_608, &[(fx.vol_id, 257)])
        .unwrap();

    let uuid = Uuid::parse_str(FS_UUID).unwrap();
    assert!(fx.store.forget_fs(&uuid).unwrap());
    assert!(fx.store.list_filesystems().unwrap().is_empty());
    assert!(fx.store.volume_by_root(fx.fs_id, 5).unwrap().is_none());
    assert!(fx.store.inode_record(fx.vol_id, 257).unwrap().is_none());
    assert!(fx.store.dedup_events(fx.fs_id).unwrap().is_empty());
    // Forgetting twice is a no-op.
    assert!(!fx.store.forget_fs(&uuid).unwrap());
}

// ---------------------------------------------------------------------------
// Reopening
// ---------------------------------------------------------------------------

#[test]
fn reopening_the_store_preserves_data() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("db.sqlite");
    let uuid = Uuid::parse_str(FS_UUID).unwrap();
    {
        let store = Store::open(&path).unwrap();
        let fs_id = store.get_or_create_fs(&uuid).unwrap();
        let (vol, _) = store.get_or_create_volume(fs_id, 5, CUTOFF).unwrap();
        store.upsert_inode(vol.id, 257, 1_000_000).unwrap();
    }
    // Second open runs the migrations again; they must be idempotent.
    let store = Store::open(&path).unwrap();
    let fs_id = store.get_or_create_fs(&uuid).unwrap();
    let (vol, created) = store.get_or_create_volume(fs_id, 5, CUTOFF).unwrap();
    assert!(!created);
    let row = store.inode_record(vol.id, 257).unwrap().unwrap();
    assert_eq!(row.size, 1_000_000);
}

#[test]
fn size_lookup_joins_back_to_the_filesystem() {
    let fx = fixture();
    fx.store.upsert_inode(fx.vol_id, 257, 1_000_000).unwrap();
    fx.store.upsert_inode(fx.vol_id, 258, 1_000_000).unwrap();
    fx.store.upsert_inode(fx.vol_id, 259, 2_000_000).unwrap();

    let rows = fx.store.inodes_by_size(1_000_000).unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].0, Uuid::parse_str(FS_UUID).unwrap());
    assert_eq!(rows[0].1, 5); // root id
    assert_eq!(rows[0].2, 257);
}
