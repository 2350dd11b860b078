//! Streaming interface over the generic tree-search ioctl.
//!
//! The ioctl returns batches of (header, item) pairs into a single
//! page-sized buffer that is reused across iterations; items are handed
//! to the caller as borrowed slices, one batch at a time.

use std::os::fd::RawFd;

use crate::btrfs::ioctl::{
    SEARCH_HEADER_SIZE, SearchArgs, SearchHeader, tree_search_ioctl,
};
use crate::error::DedupError;

/// Default in/out batch size, matching what btrfs-progs asks for.
const BATCH_ITEMS: u32 = 4096;

/// Key-range bounds for one search. The default covers an entire tree.
#[derive(Debug, Clone)]
pub struct SearchRange {
    /// Tree to search; 0 means the subvolume of the ioctl fd.
    pub tree_id: u64,
    pub min_objectid: u64,
    pub max_objectid: u64,
    pub min_offset: u64,
    pub max_offset: u64,
    pub min_transid: u64,
    pub max_transid: u64,
    pub min_type: u32,
    pub max_type: u32,
}

impl Default for SearchRange {
    fn default() -> Self {
        SearchRange {
            tree_id: 0,
            min_objectid: 0,
            max_objectid: u64::MAX,
            min_offset: 0,
            max_offset: u64::MAX,
            min_transid: 0,
            max_transid: u64::MAX,
            min_type: 0,
            max_type: u32::MAX,
        }
    }
}

/// Run a tree search, invoking `on_item` for every (header, payload)
/// pair in key order. The payload slice is only valid for the duration
/// of the callback; the underlying buffer is overwritten per batch.
pub fn search<F>(fd: RawFd, range: &SearchRange, mut on_item: F) -> Result<(), DedupError>
where
    F: FnMut(&SearchHeader, &[u8]) -> Result<(), DedupError>,
{
    let mut args = SearchArgs::zeroed();
    args.key.tree_id = range.tree_id;
    args.key.min_objectid = range.min_objectid;
    args.key.max_objectid = range.max_objectid;
    args.key.min_offset = range.min_offset;
    args.key.max_offset = range.max_offset;
    args.key.min_transid = range.min_transid;
    args.key.max_transid = range.max_transid;
    args.key.min_type = range.min_type;
    args.key.max_type = range.max_type;

    loop {
        args.key.nr_items = BATCH_ITEMS;
        tree_search_ioctl(fd, &mut args)?;

        let nr_items = args.key.nr_items;
        if nr_items == 0 {
            return Ok(());
        }

        let mut offset = 0usize;
        let mut last: Option<(u64, u32, u64)> = None;
        for _ in 0..nr_items {
            if offset + SEARCH_HEADER_SIZE > args.buf.len() {
                return Err(DedupError::Parse("search header out of bounds"));
            }
            // Headers after the first are unaligned; copy one out.
            let header: SearchHeader = unsafe {
                std::ptr::read_unaligned(args.buf[offset..].as_ptr() as *const SearchHeader)
            };
            offset += SEARCH_HEADER_SIZE;

            let len = header.len as usize;
            if offset + len > args.buf.len() {
                return Err(DedupError::Parse("search item out of bounds"));
            }
            on_item(&header, &args.buf[offset..offset + len])?;
            offset += len;

            last = Some((header.objectid, header.item_type, header.offset));
        }

        // The kernel has already advanced min_* past consumed leaves, but
        // only re-seeding from the last returned key is reliable across
        // kernel versions.
        let (objectid, item_type, item_offset) = last.unwrap();
        match advance_key(objectid, item_type, item_offset) {
            Some((o, t, off)) => {
                args.key.min_objectid = o;
                args.key.min_type = t;
                args.key.min_offset = off;
            }
            None => return Ok(()),
        }
    }
}

/// Next key after `(objectid, item_type, offset)` in tuple order.
///
/// Offset overflow promotes into the type, type overflow into the
/// objectid. Returns `None` when the key space is exhausted.
pub(crate) fn advance_key(objectid: u64, item_type: u32, offset: u64) -> Option<(u64, u32, u64)> {
    if let Some(next_offset) = offset.checked_add(1) {
        return Some((objectid, item_type, next_offset));
    }
    if let Some(next_type) = item_type.checked_add(1) {
        return Some((objectid, next_type, 0));
    }
    objectid.checked_add(1).map(|next_oid| (next_oid, 0, 0))
}

#[cfg(test)]
mod tests {
    use super::advance_key;

    #[test]
    fn advances_offset_first() {
        assert_eq!(advance_key(7, 1, 41), Some((7, 1, 42)));
    }

    #[test]
    fn offset_overflow_promotes_type() {
        assert_eq!(advance_key(7, 1, u64::MAX), Some((7, 2, 0)));
    }

    #[test]
    fn type_overflow_promotes_objectid() {
        assert_eq!(advance_key(7, u32::MAX, u64::MAX), Some((8, 0, 0)));
    }

    #[test]
    fn full_overflow_ends_iteration() {
        assert_eq!(advance_key(u64::MAX, u32::MAX, u64::MAX), None);
    }
}
