//! The `/proc` scan behind the immutability guard, exercised on plain
//! temp files: no root and no btrfs needed to observe fd bookkeeping.

use std::fs::OpenOptions;
use std::io::Write;
use std::os::fd::AsRawFd;

use btrdedup::guard::{find_inodes_in_use, find_inodes_in_write_use};

#[test]
fn writable_fd_in_same_process_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("held.bin");
    std::fs::File::create(&path)
        .unwrap()
        .write_all(b"some bytes")
        .unwrap();

    let observed = std::fs::File::open(&path).unwrap();
    let writer = OpenOptions::new().write(true).open(&path).unwrap();

    // Only `observed` is under test; the writer fd is an outside use.
    let uses = find_inodes_in_write_use(&[observed.as_raw_fd()]).unwrap();
    assert!(
        uses.iter().any(|(fd, info)| {
            *fd == observed.as_raw_fd() && info.is_writable
        }),
        "the in-process writable fd must be reported as write use"
    );
    drop(writer);
}

#[test]
fn fds_under_test_do_not_count_against_themselves() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("held.bin");
    std::fs::File::create(&path)
        .unwrap()
        .write_all(b"some bytes")
        .unwrap();

    let a = std::fs::File::open(&path).unwrap();
    let b = OpenOptions::new().write(true).open(&path).unwrap();

    // Both fds are under test, so neither is an outside use.
    let uses = find_inodes_in_write_use(&[a.as_raw_fd(), b.as_raw_fd()]).unwrap();
    assert!(
        uses.is_empty(),
        "fds passed in must not be counted as uses of themselves: {uses:?}"
    );
}

#[test]
fn unrelated_files_report_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("lonely.bin");
    std::fs::File::create(&path)
        .unwrap()
        .write_all(b"untouched")
        .unwrap();

    let only = std::fs::File::open(&path).unwrap();
    let uses = find_inodes_in_use(&[only.as_raw_fd()]).unwrap();
    assert!(
        uses.is_empty(),
        "a file opened once read-only has no other users: {uses:?}"
    );
}

#[test]
fn read_only_second_fd_is_visible_but_not_writable() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("held.bin");
    std::fs::File::create(&path)
        .unwrap()
        .write_all(b"some bytes")
        .unwrap();

    let observed = std::fs::File::open(&path).unwrap();
    let reader = std::fs::File::open(&path).unwrap();

    let uses = find_inodes_in_use(&[observed.as_raw_fd()]).unwrap();
    assert!(
        uses.iter()
            .any(|(_, info)| info.is_readable && !info.is_writable),
        "the second read-only fd should show up as a readable use"
    );
    let write_uses = find_inodes_in_write_use(&[observed.as_raw_fd()]).unwrap();
    assert!(write_uses.is_empty());
    drop(reader);
}
