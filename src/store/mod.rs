//! SQLite-backed tracking store.
//!
//! One file holds everything: tracked filesystems and volumes with their
//! scan watermarks, per-inode size/hash records, and the append-only
//! dedup event log. WAL journaling with enforced foreign keys; the
//! schema revision lives in `user_version` and migrations are
//! additive-only.

pub mod windowed;

use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::thread;

use rusqlite::{Connection, OptionalExtension, params};
use uuid::Uuid;

use crate::error::DedupError;

const SCHEMA_VERSION: i32 = 1;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS Filesystem (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    uuid TEXT NOT NULL UNIQUE CHECK (uuid != '')
);
CREATE TABLE IF NOT EXISTS Volume (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    fs_id INTEGER NOT NULL REFERENCES Filesystem(id) ON DELETE CASCADE,
    root_id INTEGER NOT NULL,
    last_tracked_generation INTEGER NOT NULL DEFAULT 0,
    last_tracked_size_cutoff INTEGER,
    size_cutoff INTEGER NOT NULL,
    UNIQUE (fs_id, root_id)
);
CREATE TABLE IF NOT EXISTS VolumePathHistory (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    vol_id INTEGER NOT NULL REFERENCES Volume(id) ON DELETE CASCADE,
    path TEXT NOT NULL,
    UNIQUE (vol_id, path)
);
CREATE TABLE IF NOT EXISTS Inode (
    vol_id INTEGER NOT NULL REFERENCES Volume(id) ON DELETE CASCADE,
    ino INTEGER NOT NULL,
    size INTEGER NOT NULL,
    sample_hash INTEGER,
    extent_hash INTEGER,
    dirty INTEGER NOT NULL DEFAULT 1,
    PRIMARY KEY (vol_id, ino)
);
CREATE INDEX IF NOT EXISTS Inode_size ON Inode (size DESC);
CREATE TABLE IF NOT EXISTS DedupEvent (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    fs_id INTEGER NOT NULL REFERENCES Filesystem(id) ON DELETE CASCADE,
    item_size INTEGER NOT NULL,
    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
);
CREATE INDEX IF NOT EXISTS DedupEvent_size ON DedupEvent (item_size);
CREATE TABLE IF NOT EXISTS DedupEventInode (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    event_id INTEGER NOT NULL REFERENCES DedupEvent(id) ON DELETE CASCADE,
    vol_id INTEGER NOT NULL REFERENCES Volume(id) ON DELETE CASCADE,
    ino INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS DedupEventInode_event ON DedupEventInode (event_id);
";

/// A tracked volume row. The three watermarks implement the incremental
/// scan contract: as long as the current cutoff is at or above the one
/// in effect at the last scan, resuming from `last_tracked_generation`
/// is sound; lowering the cutoff forces a full rescan.
#[derive(Debug, Clone)]
pub struct VolumeRecord {
    pub id: i64,
    pub fs_id: i64,
    pub root_id: u64,
    pub last_tracked_generation: u64,
    pub last_tracked_size_cutoff: Option<u64>,
    pub size_cutoff: u64,
}

/// One entry of the append-only dedup log with its participants.
#[derive(Debug, Clone)]
pub struct DedupEventRecord {
    pub id: i64,
    pub fs_id: i64,
    pub item_size: u64,
    pub created_at: String,
    pub inodes: Vec<(i64, u64)>,
}

/// One worker-side session against the store file.
pub struct Store {
    conn: Connection,
    path: PathBuf,
}

impl Store {
    pub fn open(path: &Path) -> Result<Store, DedupError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(DedupError::Io)?;
        }
        let conn = Connection::open(path)?;
        // journal_mode returns a row; query it instead of pragma_update.
        conn.query_row("PRAGMA journal_mode=WAL", [], |_| Ok(()))?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        migrate(&conn)?;
        Ok(Store {
            conn,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Relax durability for the scan/window phases. The checkpointer
    /// thread takes over WAL maintenance in between windows.
    pub fn begin_relaxed(&self) -> Result<(), DedupError> {
        self.conn.pragma_update(None, "synchronous", "NORMAL")?;
        self.conn.pragma_update(None, "wal_autocheckpoint", 0)?;
        Ok(())
    }

    /// Restore full durability before the final commit of a run.
    pub fn end_relaxed(&self) -> Result<(), DedupError> {
        self.conn.pragma_update(None, "synchronous", "FULL")?;
        self.conn.pragma_update(None, "wal_autocheckpoint", 1000)?;
        self.conn
            .query_row("PRAGMA wal_checkpoint(FULL)", [], |_| Ok(()))?;
        Ok(())
    }

    pub fn get_or_create_fs(&self, uuid: &Uuid) -> Result<i64, DedupError> {
        let existing: Option<i64> = self
            .conn
            .query_row(
                "SELECT id FROM Filesystem WHERE uuid = ?1",
                params![uuid.to_string()],
                |r| r.get(0),
            )
            .optional()?;
        if let Some(id) = existing {
            return Ok(id);
        }
        self.conn.execute(
            "INSERT INTO Filesystem (uuid) VALUES (?1)",
            params![uuid.to_string()],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Fetch or create a volume row; new rows start with the given
    /// cutoff and an empty watermark.
    pub fn get_or_create_volume(
        &self,
        fs_id: i64,
        root_id: u64,
        default_cutoff: u64,
    ) -> Result<(VolumeRecord, bool), DedupError> {
        if let Some(rec) = self.volume_by_root(fs_id, root_id)? {
            return Ok((rec, false));
        }
        self.conn.execute(
            "INSERT INTO Volume (fs_id, root_id, size_cutoff) VALUES (?1, ?2, ?3)",
            params![fs_id, root_id as i64, default_cutoff as i64],
        )?;
        let rec = self
            .volume_by_root(fs_id, root_id)?
            .expect("row just inserted");
        Ok((rec, true))
    }

    fn volume_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<VolumeRecord> {
        Ok(VolumeRecord {
            id: row.get(0)?,
            fs_id: row.get(1)?,
            root_id: row.get::<_, i64>(2)? as u64,
            last_tracked_generation: row.get::<_, i64>(3)? as u64,
            last_tracked_size_cutoff: row.get::<_, Option<i64>>(4)?.map(|v| v as u64),
            size_cutoff: row.get::<_, i64>(5)? as u64,
        })
    }

    pub fn volume_by_root(
        &self,
        fs_id: i64,
        root_id: u64,
    ) -> Result<Option<VolumeRecord>, DedupError> {
        Ok(self
            .conn
            .query_row(
                "SELECT id, fs_id, root_id, last_tracked_generation,
                        last_tracked_size_cutoff, size_cutoff
                 FROM Volume WHERE fs_id = ?1 AND root_id = ?2",
                params![fs_id, root_id as i64],
                Self::volume_row,
            )
            .optional()?)
    }

    pub fn volumes_of_fs(&self, fs_id: i64) -> Result<Vec<VolumeRecord>, DedupError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, fs_id, root_id, last_tracked_generation,
                    last_tracked_size_cutoff, size_cutoff
             FROM Volume WHERE fs_id = ?1 ORDER BY root_id",
        )?;
        let rows = stmt.query_map(params![fs_id], Self::volume_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn set_size_cutoff(&self, vol_id: i64, cutoff: u64) -> Result<(), DedupError> {
        self.conn.execute(
            "UPDATE Volume SET size_cutoff = ?2 WHERE id = ?1",
            params![vol_id, cutoff as i64],
        )?;
        Ok(())
    }

    /// Advance the scan watermark; only called after a completed walk.
    pub fn update_watermark(
        &self,
        vol_id: i64,
        generation: u64,
        cutoff: u64,
    ) -> Result<(), DedupError> {
        self.conn.execute(
            "UPDATE Volume
             SET last_tracked_generation = ?2, last_tracked_size_cutoff = ?3
             WHERE id = ?1",
            params![vol_id, generation as i64, cutoff as i64],
        )?;
        Ok(())
    }

    pub fn record_path_history(&self, vol_id: i64, path: &str) -> Result<(), DedupError> {
        self.conn.execute(
            "INSERT OR IGNORE INTO VolumePathHistory (vol_id, path) VALUES (?1, ?2)",
            params![vol_id, path],
        )?;
        Ok(())
    }

    pub fn last_known_mountpoint(&self, vol_id: i64) -> Result<Option<String>, DedupError> {
        Ok(self
            .conn
            .query_row(
                "SELECT path FROM VolumePathHistory WHERE vol_id = ?1
                 ORDER BY id DESC LIMIT 1",
                params![vol_id],
                |r| r.get(0),
            )
            .optional()?)
    }

    /// Track an inode sighting from the scanner. A size change
    /// invalidates both cached hashes; the dirty flag is always set.
    pub fn upsert_inode(&self, vol_id: i64, ino: u64, size: u64) -> Result<(), DedupError> {
        self.conn.execute(
            "INSERT INTO Inode (vol_id, ino, size, dirty) VALUES (?1, ?2, ?3, 1)
             ON CONFLICT (vol_id, ino) DO UPDATE SET
                 sample_hash = CASE WHEN size != excluded.size THEN NULL ELSE sample_hash END,
                 extent_hash = CASE WHEN size != excluded.size THEN NULL ELSE extent_hash END,
                 size = excluded.size,
                 dirty = 1",
            params![vol_id, ino as i64, size as i64],
        )?;
        Ok(())
    }

    pub fn set_sample_hash(&self, vol_id: i64, ino: u64, hash: u32) -> Result<(), DedupError> {
        self.conn.execute(
            "UPDATE Inode SET sample_hash = ?3 WHERE vol_id = ?1 AND ino = ?2",
            params![vol_id, ino as i64, hash as i64],
        )?;
        Ok(())
    }

    pub fn set_extent_hash(&self, vol_id: i64, ino: u64, hash: u64) -> Result<(), DedupError> {
        self.conn.execute(
            "UPDATE Inode SET extent_hash = ?3 WHERE vol_id = ?1 AND ino = ?2",
            params![vol_id, ino as i64, hash as i64],
        )?;
        Ok(())
    }

    /// One tracked inode row, when present.
    pub fn inode_record(
        &self,
        vol_id: i64,
        ino: u64,
    ) -> Result<Option<windowed::InodeRow>, DedupError> {
        Ok(self
            .conn
            .query_row(
                "SELECT vol_id, ino, size, sample_hash, extent_hash, dirty
                 FROM Inode WHERE vol_id = ?1 AND ino = ?2",
                params![vol_id, ino as i64],
                |r| {
                    Ok(windowed::InodeRow {
                        vol_id: r.get(0)?,
                        ino: r.get::<_, i64>(1)? as u64,
                        size: r.get::<_, i64>(2)? as u64,
                        sample_hash: r.get::<_, Option<i64>>(3)?.map(|v| v as u32),
                        extent_hash: r.get::<_, Option<i64>>(4)?.map(|v| v as u64),
                        dirty: r.get::<_, i64>(5)? != 0,
                    })
                },
            )
            .optional()?)
    }

    /// Drop a record whose inode was confirmed gone.
    pub fn delete_inode(&self, vol_id: i64, ino: u64) -> Result<(), DedupError> {
        self.conn.execute(
            "DELETE FROM Inode WHERE vol_id = ?1 AND ino = ?2",
            params![vol_id, ino as i64],
        )?;
        Ok(())
    }

    pub fn inode_count(&self, vol_id: i64) -> Result<u64, DedupError> {
        Ok(self.conn.query_row(
            "SELECT COUNT(*) FROM Inode WHERE vol_id = ?1",
            params![vol_id],
            |r| r.get::<_, i64>(0),
        )? as u64)
    }

    /// Append one dedup event with its participants, atomically.
    /// Events are history: inode numbers in them may later be reused or
    /// deleted, and that is fine; volumes cascade.
    pub fn append_dedup_event(
        &self,
        fs_id: i64,
        item_size: u64,
        participants: &[(i64, u64)],
    ) -> Result<i64, DedupError> {
        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "INSERT INTO DedupEvent (fs_id, item_size) VALUES (?1, ?2)",
            params![fs_id, item_size as i64],
        )?;
        let event_id = tx.last_insert_rowid();
        for &(vol_id, ino) in participants {
            tx.execute(
                "INSERT INTO DedupEventInode (event_id, vol_id, ino) VALUES (?1, ?2, ?3)",
                params![event_id, vol_id, ino as i64],
            )?;
        }
        tx.commit()?;
        Ok(event_id)
    }

    /// The event log of one filesystem, oldest first.
    pub fn dedup_events(&self, fs_id: i64) -> Result<Vec<DedupEventRecord>, DedupError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, fs_id, item_size, created_at
             FROM DedupEvent WHERE fs_id = ?1 ORDER BY id",
        )?;
        let events = stmt.query_map(params![fs_id], |r| {
            Ok(DedupEventRecord {
                id: r.get(0)?,
                fs_id: r.get(1)?,
                item_size: r.get::<_, i64>(2)? as u64,
                created_at: r.get(3)?,
                inodes: Vec::new(),
            })
        })?;
        let mut out = events.collect::<rusqlite::Result<Vec<_>>>()?;
        let mut part_stmt = self.conn.prepare(
            "SELECT vol_id, ino FROM DedupEventInode WHERE event_id = ?1 ORDER BY id",
        )?;
        for event in &mut out {
            let rows = part_stmt.query_map(params![event.id], |r| {
                Ok((r.get::<_, i64>(0)?, r.get::<_, i64>(1)? as u64))
            })?;
            event.inodes = rows.collect::<rusqlite::Result<Vec<_>>>()?;
        }
        Ok(out)
    }

    pub fn list_filesystems(&self) -> Result<Vec<(i64, Uuid)>, DedupError> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, uuid FROM Filesystem ORDER BY id")?;
        let rows = stmt.query_map([], |r| {
            let id: i64 = r.get(0)?;
            let uuid: String = r.get(1)?;
            Ok((id, uuid))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (id, uuid) = row?;
            let uuid =
                Uuid::parse_str(&uuid).map_err(|_| DedupError::Parse("bad uuid in store"))?;
            out.push((id, uuid));
        }
        Ok(out)
    }

    /// Tracked inodes of a given size, for the size-lookup command.
    pub fn inodes_by_size(&self, size: u64) -> Result<Vec<(Uuid, u64, u64)>, DedupError> {
        let mut stmt = self.conn.prepare(
            "SELECT f.uuid, v.root_id, i.ino
             FROM Inode i
             JOIN Volume v ON v.id = i.vol_id
             JOIN Filesystem f ON f.id = v.fs_id
             WHERE i.size = ?1
             ORDER BY f.uuid, v.root_id, i.ino",
        )?;
        let rows = stmt.query_map(params![size as i64], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, i64>(1)? as u64,
                r.get::<_, i64>(2)? as u64,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (uuid, root_id, ino) = row?;
            let uuid =
                Uuid::parse_str(&uuid).map_err(|_| DedupError::Parse("bad uuid in store"))?;
            out.push((uuid, root_id, ino));
        }
        Ok(out)
    }

    /// Forget a filesystem and everything hanging off it.
    /// Returns true when a row was actually deleted.
    pub fn forget_fs(&self, uuid: &Uuid) -> Result<bool, DedupError> {
        let n = self.conn.execute(
            "DELETE FROM Filesystem WHERE uuid = ?1",
            params![uuid.to_string()],
        )?;
        Ok(n > 0)
    }

    /// Drop a volume's tracking data and rewind its watermark, keeping
    /// the volume row and its event history.
    pub fn reset_volume(&self, vol_id: i64) -> Result<(), DedupError> {
        let tx = self.conn.unchecked_transaction()?;
        tx.execute("DELETE FROM Inode WHERE vol_id = ?1", params![vol_id])?;
        tx.execute(
            "UPDATE Volume
             SET last_tracked_generation = 0, last_tracked_size_cutoff = NULL
             WHERE id = ?1",
            params![vol_id],
        )?;
        tx.commit()?;
        Ok(())
    }
}

fn migrate(conn: &Connection) -> Result<(), DedupError> {
    let version: i32 = conn.query_row("PRAGMA user_version", [], |r| r.get(0))?;
    if version < 1 {
        conn.execute_batch(SCHEMA)?;
        conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
    }
    Ok(())
}

enum CkptMsg {
    Checkpoint,
    Stop,
}

/// Auxiliary WAL-checkpointing thread.
///
/// Runs on its own connection so the worker's pragmas (`synchronous`,
/// `wal_autocheckpoint`) stay untouched. The windowed query signals it
/// between windows.
pub struct Checkpointer {
    tx: mpsc::Sender<CkptMsg>,
    handle: Option<thread::JoinHandle<()>>,
}

impl Checkpointer {
    pub fn spawn(db_path: PathBuf) -> Result<Checkpointer, DedupError> {
        let (tx, rx) = mpsc::channel();
        let handle = thread::Builder::new()
            .name("checkpointer".into())
            .spawn(move || {
                let conn = match Connection::open(&db_path) {
                    Ok(conn) => conn,
                    Err(e) => {
                        tracing::warn!("checkpointer could not open {}: {e}", db_path.display());
                        return;
                    }
                };
                while let Ok(msg) = rx.recv() {
                    match msg {
                        CkptMsg::Checkpoint => {
                            if let Err(e) =
                                conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))
                            {
                                tracing::debug!("wal checkpoint failed: {e}");
                            }
                        }
                        CkptMsg::Stop => break,
                    }
                }
            })
            .map_err(DedupError::Io)?;
        Ok(Checkpointer {
            tx,
            handle: Some(handle),
        })
    }

    pub fn request_checkpoint(&self) {
        let _ = self.tx.send(CkptMsg::Checkpoint);
    }

    pub fn stop(mut self) {
        self.stop_inner();
    }

    fn stop_inner(&mut self) {
        let _ = self.tx.send(CkptMsg::Stop);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Checkpointer {
    fn drop(&mut self) {
        self.stop_inner();
    }
}
