//! Subvolume enumeration from the tree of roots.

use std::collections::BTreeMap;
use std::os::fd::RawFd;
use std::path::PathBuf;

use crate::btrfs::items::{
    FS_TREE_OBJECTID, ROOT_BACKREF_KEY, ROOT_ITEM_KEY, ROOT_TREE_OBJECTID, RootItem, RootRef,
};
use crate::btrfs::tree_search::{SearchRange, search};
use crate::btrfs::lookup_one_path;
use crate::error::DedupError;

/// Live metadata of one subvolume, keyed by root id.
#[derive(Debug, Clone)]
pub struct RootInfo {
    /// Path of the subvolume inside the filesystem tree ("/" for the
    /// top-level volume).
    pub path: PathBuf,
    pub parent_root_id: Option<u64>,
    /// Read-only snapshot; excluded from scanning and deduplication.
    pub is_frozen: bool,
}

/// Read the tree of roots and resolve each subvolume's absolute path
/// within the filesystem.
///
/// Two phases: the search pass collects root items (for the read-only
/// flag) and backrefs (parent root, parent directory, entry name),
/// joining children onto parents that are already resolved. A fixpoint
/// pass then handles children listed before their parent, which happens
/// after a subvolume move.
pub fn read_root_tree(fd: RawFd) -> Result<BTreeMap<u64, RootInfo>, DedupError> {
    let range = SearchRange {
        tree_id: ROOT_TREE_OBJECTID,
        min_type: ROOT_ITEM_KEY,
        max_type: ROOT_BACKREF_KEY,
        ..Default::default()
    };

    let mut resolved: BTreeMap<u64, RootInfo> = BTreeMap::new();
    // Children whose parent has not been resolved yet; path is relative
    // to the parent subvolume.
    let mut pending: BTreeMap<u64, RootInfo> = BTreeMap::new();
    // The root item precedes its backrefs in key order; carry its flags.
    let mut last_item: Option<(u64, bool)> = None;

    search(fd, &range, |header, data| {
        match header.item_type {
            ROOT_ITEM_KEY => {
                let item = RootItem::parse(data)?;
                let is_frozen = item.is_frozen();
                last_item = Some((header.objectid, is_frozen));
                if header.objectid == FS_TREE_OBJECTID {
                    resolved.insert(
                        header.objectid,
                        RootInfo {
                            path: PathBuf::from("/"),
                            parent_root_id: None,
                            is_frozen,
                        },
                    );
                }
            }
            ROOT_BACKREF_KEY => {
                let (rref, name) = RootRef::parse(data)?;
                let root_id = header.objectid;
                let parent_root_id = header.offset;
                let is_frozen = match last_item {
                    Some((id, frozen)) if id == root_id => frozen,
                    _ => return Err(DedupError::Parse("root backref without root item")),
                };
                // Path from the parent subvolume's root down to the
                // directory holding this subvolume.
                let reldir = lookup_one_path(fd, rref.dirid.get(), parent_root_id)?;
                let rel = reldir.join(String::from_utf8_lossy(name).as_ref());
                let info = RootInfo {
                    path: rel,
                    parent_root_id: Some(parent_root_id),
                    is_frozen,
                };
                match resolved.get(&parent_root_id) {
                    Some(parent) => {
                        let path = parent.path.join(&info.path);
                        resolved.insert(root_id, RootInfo { path, ..info });
                    }
                    None => {
                        pending.insert(root_id, info);
                    }
                }
            }
            _ => {}
        }
        Ok(())
    })?;

    // Fixpoint over out-of-order parents. Terminates when a pass makes
    // no progress; anything left over points at a corrupt tree.
    while !pending.is_empty() {
        let before = pending.len();
        let ready: Vec<u64> = pending
            .iter()
            .filter(|(_, ri)| {
                ri.parent_root_id
                    .is_some_and(|p| resolved.contains_key(&p))
            })
            .map(|(&id, _)| id)
            .collect();
        for id in ready {
            let info = pending.remove(&id).unwrap();
            let parent_path = &resolved[&info.parent_root_id.unwrap()].path;
            let path = parent_path.join(&info.path);
            resolved.insert(id, RootInfo { path, ..info });
        }
        if pending.len() == before {
            return Err(DedupError::CorruptRootTree(pending.keys().copied().collect()));
        }
    }

    Ok(resolved)
}
