//! Bounded-memory iteration over duplicated size groups.
//!
//! Walks sizes in descending order, `WINDOW` size groups at a time, so
//! arbitrarily large stores never load more than a window of rows. At
//! each window boundary the dirty flags of the covered size range are
//! cleared wholesale (this includes singleton sizes inside the range)
//! and inodes the consumer reported as skipped get their flag put back
//! for the next run.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use rusqlite::types::Value;

use crate::error::DedupError;
use crate::store::{Checkpointer, Store};

/// Size groups fetched per window.
pub const WINDOW: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InodeKey {
    pub vol_id: i64,
    pub ino: u64,
}

#[derive(Debug, Clone)]
pub struct InodeRow {
    pub vol_id: i64,
    pub ino: u64,
    pub size: u64,
    pub sample_hash: Option<u32>,
    pub extent_hash: Option<u64>,
    pub dirty: bool,
}

/// Inodes sharing one byte length, at least two of them, at least one
/// dirty. Rows arrive in ascending inode-number order.
#[derive(Debug)]
pub struct SizeGroup {
    pub size: u64,
    pub inode_count: usize,
    pub inodes: Vec<InodeRow>,
}

/// The consumer pushes keys here to flag "retry next run"; the iterator
/// drains it at each window boundary.
pub type SkippedList = Rc<RefCell<Vec<InodeKey>>>;

pub struct WindowedQuery<'a> {
    store: &'a Store,
    vol_ids: Vec<i64>,
    skipped: SkippedList,
    checkpointer: Option<&'a Checkpointer>,
    pending: VecDeque<SizeGroup>,
    window_start: u64,
    window_end: u64,
    in_window: bool,
    done: bool,
}

impl<'a> WindowedQuery<'a> {
    pub fn new(
        store: &'a Store,
        vol_ids: Vec<i64>,
        skipped: SkippedList,
        checkpointer: Option<&'a Checkpointer>,
    ) -> Result<Self, DedupError> {
        // The bound covers every tracked inode, dirty or not, so the
        // final sweep clears flags on sizes that never formed a group.
        let upper_bound = max_size(store, &vol_ids)?;
        Ok(WindowedQuery {
            store,
            vol_ids,
            skipped,
            checkpointer,
            pending: VecDeque::new(),
            window_start: upper_bound.unwrap_or(0),
            window_end: 0,
            in_window: false,
            done: upper_bound.is_none(),
        })
    }

    fn close_window(&mut self, lo: u64, hi: u64) -> Result<(), DedupError> {
        clear_dirty_range(self.store, &self.vol_ids, lo, hi)?;
        let skipped: Vec<InodeKey> = self.skipped.borrow_mut().drain(..).collect();
        for key in skipped {
            self.store.conn().execute(
                "UPDATE Inode SET dirty = 1 WHERE vol_id = ?1 AND ino = ?2",
                rusqlite::params![key.vol_id, key.ino as i64],
            )?;
        }
        if let Some(ckpt) = self.checkpointer {
            ckpt.request_checkpoint();
        }
        Ok(())
    }

    fn try_next(&mut self) -> Result<Option<SizeGroup>, DedupError> {
        if self.done {
            return Ok(None);
        }
        if let Some(group) = self.pending.pop_front() {
            return Ok(Some(group));
        }

        if self.in_window {
            self.close_window(self.window_end, self.window_start)?;
            self.in_window = false;
            match self.window_end.checked_sub(1) {
                Some(next) => self.window_start = next,
                None => {
                    self.done = true;
                    return Ok(None);
                }
            }
        }

        let sizes = fetch_window_sizes(self.store, &self.vol_ids, self.window_start)?;
        if sizes.is_empty() {
            // Tail of the size space: no groups left, but singleton
            // dirty flags below the last window still need clearing.
            self.close_window(0, self.window_start)?;
            self.done = true;
            return Ok(None);
        }
        self.window_end = *sizes.last().unwrap();
        self.in_window = true;
        self.pending = load_groups(self.store, &self.vol_ids, &sizes)?;
        Ok(self.pending.pop_front())
    }
}

impl Iterator for WindowedQuery<'_> {
    type Item = Result<SizeGroup, DedupError>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.try_next() {
            Ok(Some(group)) => Some(Ok(group)),
            Ok(None) => None,
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

fn placeholders(n: usize) -> String {
    let mut s = String::with_capacity(n * 2);
    for i in 0..n {
        if i > 0 {
            s.push(',');
        }
        s.push('?');
    }
    s
}

fn max_size(store: &Store, vol_ids: &[i64]) -> Result<Option<u64>, DedupError> {
    let sql = format!(
        "SELECT MAX(size) FROM Inode WHERE vol_id IN ({})",
        placeholders(vol_ids.len())
    );
    let params: Vec<Value> = vol_ids.iter().map(|&v| Value::from(v)).collect();
    let max: Option<i64> =
        store
            .conn()
            .query_row(&sql, rusqlite::params_from_iter(params), |r| r.get(0))?;
    Ok(max.map(|v| v as u64))
}

fn fetch_window_sizes(
    store: &Store,
    vol_ids: &[i64],
    window_start: u64,
) -> Result<Vec<u64>, DedupError> {
    let sql = format!(
        "SELECT size FROM Inode WHERE vol_id IN ({}) AND size <= ?
         GROUP BY size HAVING COUNT(*) > 1 AND MAX(dirty) > 0
         ORDER BY size DESC LIMIT {WINDOW}",
        placeholders(vol_ids.len())
    );
    let mut params: Vec<Value> = vol_ids.iter().map(|&v| Value::from(v)).collect();
    params.push(Value::from(window_start as i64));
    let mut stmt = store.conn().prepare(&sql)?;
    let rows = stmt.query_map(rusqlite::params_from_iter(params), |r| {
        r.get::<_, i64>(0).map(|v| v as u64)
    })?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

fn load_groups(
    store: &Store,
    vol_ids: &[i64],
    sizes: &[u64],
) -> Result<VecDeque<SizeGroup>, DedupError> {
    let sql = format!(
        "SELECT vol_id, ino, size, sample_hash, extent_hash, dirty
         FROM Inode WHERE vol_id IN ({}) AND size IN ({})
         ORDER BY size DESC, ino ASC",
        placeholders(vol_ids.len()),
        placeholders(sizes.len())
    );
    let mut params: Vec<Value> = vol_ids.iter().map(|&v| Value::from(v)).collect();
    params.extend(sizes.iter().map(|&s| Value::from(s as i64)));
    let mut stmt = store.conn().prepare(&sql)?;
    let rows = stmt.query_map(rusqlite::params_from_iter(params), |r| {
        Ok(InodeRow {
            vol_id: r.get(0)?,
            ino: r.get::<_, i64>(1)? as u64,
            size: r.get::<_, i64>(2)? as u64,
            sample_hash: r.get::<_, Option<i64>>(3)?.map(|v| v as u32),
            extent_hash: r.get::<_, Option<i64>>(4)?.map(|v| v as u64),
            dirty: r.get::<_, i64>(5)? != 0,
        })
    })?;

    let mut groups: VecDeque<SizeGroup> = VecDeque::new();
    for row in rows {
        let row = row?;
        match groups.back_mut() {
            Some(group) if group.size == row.size => {
                group.inodes.push(row);
                group.inode_count += 1;
            }
            _ => {
                groups.push_back(SizeGroup {
                    size: row.size,
                    inode_count: 1,
                    inodes: vec![row],
                });
            }
        }
    }
    Ok(groups)
}

fn clear_dirty_range(
    store: &Store,
    vol_ids: &[i64],
    lo: u64,
    hi: u64,
) -> Result<(), DedupError> {
    let sql = format!(
        "UPDATE Inode SET dirty = 0 WHERE vol_id IN ({}) AND size BETWEEN ? AND ?",
        placeholders(vol_ids.len())
    );
    let mut params: Vec<Value> = vol_ids.iter().map(|&v| Value::from(v)).collect();
    params.push(Value::from(lo as i64));
    params.push(Value::from(hi as i64));
    store
        .conn()
        .execute(&sql, rusqlite::params_from_iter(params))?;
    Ok(())
}
