//! Incremental inode discovery.
//!
//! Instead of crawling the namespace, the scanner walks the subvolume's
//! inode-item tree through the generation-number index: only items from
//! transactions after the last watermark are visited. Eligible inodes
//! are upserted into the store with their dirty flag set; the dedup
//! pass consumes them later.

use crate::api::Notice;
use crate::btrfs::items::{INODE_ITEM_KEY, InodeItem, S_IFMT, S_IFREG};
use crate::btrfs::tree_search::{SearchRange, search};
use crate::btrfs::get_root_generation;
use crate::error::DedupError;
use crate::filesystem::Volume;
use crate::platform::syncfs;
use crate::store::Store;

/// First generation the incremental walk must cover.
///
/// Resuming from the watermark is only sound while the cutoff did not
/// drop: files between the new and old cutoffs were never tracked, so a
/// lower cutoff forces a full walk from generation zero.
fn min_generation(
    last_cutoff: Option<u64>,
    new_cutoff: u64,
    last_tracked_generation: u64,
) -> u64 {
    match last_cutoff {
        Some(prev) if prev <= new_cutoff => last_tracked_generation + 1,
        _ => 0,
    }
}

/// Should this inode item enter tracking?
///
/// Order matters for cost: size first, then the generation rule, then
/// the mode. Files already inside the previous scan's size window take
/// the strict test (changed since the watermark); files newly admitted
/// by a lowered cutoff only need the coarse one.
fn admits(
    size: u64,
    inode_generation: u64,
    mode: u32,
    size_cutoff: u64,
    last_cutoff: Option<u64>,
    last_tracked_generation: u64,
    min_gen: u64,
) -> bool {
    if size < size_cutoff {
        return false;
    }
    let gen_ok = match last_cutoff {
        Some(prev) if size >= prev => inode_generation > last_tracked_generation,
        _ => inode_generation >= min_gen,
    };
    if !gen_ok {
        return false;
    }
    mode & S_IFMT == S_IFREG
}

/// Walk one volume's inode tree and upsert everything eligible.
///
/// On success the watermark advances to the generation observed before
/// the walk; any error leaves it untouched so the next run re-covers
/// the same range.
pub fn scan_volume<F>(
    store: &Store,
    vol: &mut Volume,
    flush: bool,
    notify: &mut F,
) -> Result<u64, DedupError>
where
    F: FnMut(&Notice),
{
    if flush {
        syncfs(vol.raw_fd())?;
    }
    let top_generation = get_root_generation(vol.raw_fd())?;
    let min_gen = min_generation(
        vol.last_tracked_size_cutoff,
        vol.size_cutoff,
        vol.last_tracked_generation,
    );
    if min_gen > top_generation {
        notify(&Notice::ScanUpToDate {
            volume: vol.desc.clone(),
            generation: top_generation,
        });
        return Ok(0);
    }
    notify(&Notice::ScanBegin {
        volume: vol.desc.clone(),
        min_generation: min_gen,
        top_generation,
    });

    // tree_id 0 searches the subvolume of the fd. A min_type filter
    // would be pointless without min_objectid = max_objectid: the
    // kernel iterates min_* in tuple order, it does not intersect
    // per-field ranges.
    let range = SearchRange {
        tree_id: 0,
        min_transid: min_gen,
        max_type: INODE_ITEM_KEY,
        ..Default::default()
    };

    let mut tracked = 0u64;
    let (last_cutoff, last_gen, cutoff) = (
        vol.last_tracked_size_cutoff,
        vol.last_tracked_generation,
        vol.size_cutoff,
    );
    let vol_id = vol.id;
    search(vol.raw_fd(), &range, |header, data| {
        // The search returns every item type at or below the bound.
        if header.item_type != INODE_ITEM_KEY {
            return Ok(());
        }
        let item = InodeItem::parse(data)?;
        if !admits(
            item.size.get(),
            item.generation.get(),
            item.mode.get(),
            cutoff,
            last_cutoff,
            last_gen,
            min_gen,
        ) {
            return Ok(());
        }
        store.upsert_inode(vol_id, header.objectid, item.size.get())?;
        tracked += 1;
        Ok(())
    })?;

    store.update_watermark(vol.id, top_generation, vol.size_cutoff)?;
    vol.last_tracked_generation = top_generation;
    vol.last_tracked_size_cutoff = Some(vol.size_cutoff);

    notify(&Notice::ScanFinished {
        volume: vol.desc.clone(),
        tracked,
        generation: top_generation,
    });
    Ok(tracked)
}

#[cfg(test)]
mod tests {
    use super::*;

    const REG: u32 = 0o100644;
    const DIR: u32 = 0o040755;
    const CUTOFF: u64 = 64 * 1024;

    #[test]
    fn size_cutoff_boundary() {
        // Exactly at the cutoff is tracked, one byte below is not.
        assert!(admits(CUTOFF, 5, REG, CUTOFF, None, 0, 0));
        assert!(!admits(CUTOFF - 1, 5, REG, CUTOFF, None, 0, 0));
    }

    #[test]
    fn non_regular_files_are_skipped() {
        assert!(!admits(CUTOFF, 5, DIR, CUTOFF, None, 0, 0));
    }

    #[test]
    fn tracked_range_needs_strict_generation() {
        // File already within the previous window: admitted only when
        // modified after the watermark.
        let last_cutoff = Some(CUTOFF);
        assert!(!admits(CUTOFF, 10, REG, CUTOFF, last_cutoff, 10, 11));
        assert!(admits(CUTOFF, 11, REG, CUTOFF, last_cutoff, 10, 11));
    }

    #[test]
    fn newly_admitted_range_needs_only_coarse_generation() {
        // Cutoff lowered from 16 MiB to 4 MiB: an old 8 MiB file enters
        // tracking at any generation since min_gen is 0.
        let old_cutoff = Some(16 * 1024 * 1024);
        let new_cutoff = 4 * 1024 * 1024;
        let min_gen = min_generation(old_cutoff, new_cutoff, 100);
        assert_eq!(min_gen, 0);
        assert!(admits(
            8 * 1024 * 1024,
            1,
            REG,
            new_cutoff,
            old_cutoff,
            100,
            min_gen
        ));
        // A 32 MiB file was already tracked; it still needs the strict
        // test against the old watermark.
        assert!(!admits(
            32 * 1024 * 1024,
            100,
            REG,
            new_cutoff,
            old_cutoff,
            100,
            min_gen
        ));
        assert!(admits(
            32 * 1024 * 1024,
            101,
            REG,
            new_cutoff,
            old_cutoff,
            100,
            min_gen
        ));
    }

    #[test]
    fn raising_cutoff_keeps_watermark() {
        // Raising the cutoff keeps incremental scanning sound.
        assert_eq!(min_generation(Some(4 << 20), 16 << 20, 42), 43);
        // Equal cutoff too.
        assert_eq!(min_generation(Some(16 << 20), 16 << 20, 42), 43);
        // Lowering forces a full rescan.
        assert_eq!(min_generation(Some(16 << 20), 4 << 20, 42), 0);
        // First scan of a volume is always full.
        assert_eq!(min_generation(None, 16 << 20, 0), 0);
    }
}
