//! Concurrency-safe persistent store for image instances and per-terminal
//! upload status.
//!
//! One SQLite file per (terminal identity, id space), opened by many
//! cooperating processes. Every public mutation runs in a short immediate
//! transaction and retries on busy with bounded exponential backoff; past
//! the budget the caller gets a `ResourceBusy` error.

use crate::id::space::{IdSpace, IdSubspace};
use crate::utils::time::now_us;
use crate::utils::{IkupError, Result};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, TransactionBehavior};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

const STATUS_UPLOADED: i64 = 0;
const STATUS_IN_PROGRESS: i64 = 1;
const STATUS_DIRTY: i64 = 2;

/// Rejection-sampling attempts per round when minting a random id.
const MINT_SAMPLES_PER_ROUND: usize = 8;
const MINT_ROUNDS: usize = 4;

#[derive(Debug, Clone)]
pub struct ImageRecord {
    pub id: u32,
    pub fingerprint: String,
    pub path: PathBuf,
    pub mtime_ns: i64,
    pub size_bytes: u64,
    pub cols: u32,
    pub rows: u32,
    pub format: Option<String>,
    pub quality: Option<u8>,
    /// Byte cap of the lower-quality variant chosen for this instance, if
    /// a transport cap ever forced one. Reused on subsequent uploads.
    pub variant_max_bytes: Option<u64>,
    pub atime_us: i64,
}

/// Fields of a new or replacing instance row; the id comes from `assign`.
#[derive(Debug, Clone)]
pub struct NewInstance {
    pub fingerprint: String,
    pub path: PathBuf,
    pub mtime_ns: i64,
    pub size_bytes: u64,
    pub cols: u32,
    pub rows: u32,
    pub format: Option<String>,
    pub quality: Option<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum UploadState {
    Uploaded {
        at_us: i64,
        bytes: u64,
        uploads_ago: i64,
        bytes_ago: u64,
    },
    InProgress {
        started_at_us: i64,
        last_progress_at_us: i64,
        bytes_sent: u64,
    },
    Dirty {
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub struct UploadRow {
    pub terminal_id: String,
    pub id: u32,
    pub state: UploadState,
    pub transport: String,
    /// Fingerprint of the instance the terminal currently believes is
    /// associated with this id.
    pub description: String,
    pub size_bytes: u64,
}

impl UploadRow {
    pub fn is_uploaded(&self) -> bool {
        matches!(self.state, UploadState::Uploaded { .. })
    }
}

#[derive(Debug, Clone)]
pub enum AssignPolicy {
    Default { subspace: IdSubspace, max_num_ids: u32 },
    ForceId(u32),
}

#[derive(Debug, Clone)]
pub enum ListQuery {
    All,
    Last(usize),
    Ids(Vec<u32>),
    Paths(Vec<PathBuf>),
}

pub struct IdDatabase {
    conn: Connection,
    path: PathBuf,
    space: IdSpace,
    lock_timeout: Duration,
}

fn is_busy(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == ErrorCode::DatabaseBusy || e.code == ErrorCode::DatabaseLocked
    )
}

impl IdDatabase {
    /// Open (creating if needed) the database file for one identity and id
    /// space: `<dir>/<identity>-<space>.db`.
    pub fn open(dir: &Path, identity: &str, space: IdSpace, lock_timeout: Duration) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(format!("{}-{}.db", identity, space.name()));
        Self::open_file(&path, space, lock_timeout)
    }

    pub fn open_file(path: &Path, space: IdSpace, lock_timeout: Duration) -> Result<Self> {
        let conn = Connection::open(path)?;
        // WAL keeps readers unblocked; our own retry loop handles writers.
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS images (
                id                INTEGER PRIMARY KEY,
                fingerprint       TEXT NOT NULL,
                path              TEXT NOT NULL,
                mtime_ns          INTEGER NOT NULL,
                size_bytes        INTEGER NOT NULL,
                cols              INTEGER NOT NULL,
                rows              INTEGER NOT NULL,
                format            TEXT,
                quality           INTEGER,
                variant_max_bytes INTEGER,
                atime_us          INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_images_fingerprint ON images(fingerprint);
            CREATE INDEX IF NOT EXISTS idx_images_atime ON images(atime_us);
            CREATE TABLE IF NOT EXISTS uploads (
                terminal_id   TEXT NOT NULL,
                id            INTEGER NOT NULL,
                status        INTEGER NOT NULL,
                transport     TEXT NOT NULL DEFAULT '',
                description   TEXT NOT NULL DEFAULT '',
                size_bytes    INTEGER NOT NULL DEFAULT 0,
                bytes_sent    INTEGER NOT NULL DEFAULT 0,
                started_at_us INTEGER,
                progress_at_us INTEGER,
                uploaded_at_us INTEGER,
                upload_seq    INTEGER NOT NULL DEFAULT 0,
                dirty_reason  TEXT,
                PRIMARY KEY (terminal_id, id)
            );",
        )?;
        Ok(Self {
            conn,
            path: path.to_path_buf(),
            space,
            lock_timeout,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn space(&self) -> IdSpace {
        self.space
    }

    /// Run a mutation, retrying on lock contention with exponential backoff
    /// until the configured budget is exhausted.
    fn with_retry<T>(
        &mut self,
        op: &str,
        mut f: impl FnMut(&mut Connection) -> rusqlite::Result<T>,
    ) -> Result<T> {
        let deadline = Instant::now() + self.lock_timeout;
        let mut delay = Duration::from_millis(2);
        loop {
            match f(&mut self.conn) {
                Ok(value) => return Ok(value),
                Err(err) if is_busy(&err) => {
                    if Instant::now() >= deadline {
                        return Err(IkupError::busy(format!(
                            "{} on {} timed out after {:?}",
                            op,
                            self.path.display(),
                            self.lock_timeout
                        )));
                    }
                    log::debug!("{}: database busy, retrying in {:?}", op, delay);
                    std::thread::sleep(delay);
                    delay = (delay * 2).min(Duration::from_millis(100));
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    // ---- instance rows ----

    pub fn lookup_by_fingerprint(&self, fingerprint: &str) -> Result<Option<ImageRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, fingerprint, path, mtime_ns, size_bytes, cols, rows, format,
                    quality, variant_max_bytes, atime_us
             FROM images WHERE fingerprint = ?1 ORDER BY atime_us DESC LIMIT 1",
        )?;
        let record = stmt
            .query_row(params![fingerprint], row_to_record)
            .optional()?;
        Ok(record)
    }

    pub fn get(&self, id: u32) -> Result<Option<ImageRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, fingerprint, path, mtime_ns, size_bytes, cols, rows, format,
                    quality, variant_max_bytes, atime_us
             FROM images WHERE id = ?1",
        )?;
        Ok(stmt.query_row(params![id as i64], row_to_record).optional()?)
    }

    pub fn count(&self) -> Result<u64> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM images", [], |row| row.get(0))?;
        Ok(n as u64)
    }

    /// Allocate or reuse an id for the instance.
    pub fn assign(&mut self, instance: &NewInstance, policy: &AssignPolicy) -> Result<u32> {
        match policy {
            AssignPolicy::ForceId(id) => self.assign_forced(instance, *id),
            AssignPolicy::Default {
                subspace,
                max_num_ids,
            } => self.assign_default(instance, *subspace, *max_num_ids),
        }
    }

    /// FORCE_ID never fails on collision: the new instance replaces the old
    /// one and every terminal that referenced the id goes dirty, keeping its
    /// remembered description so `fix` knows to re-transmit.
    fn assign_forced(&mut self, instance: &NewInstance, id: u32) -> Result<u32> {
        let inst = instance.clone();
        let atime = now_us();
        self.with_retry("assign(force)", move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let existing: Option<String> = tx
                .query_row(
                    "SELECT fingerprint FROM images WHERE id = ?1",
                    params![id as i64],
                    |row| row.get(0),
                )
                .optional()?;
            upsert_image(&tx, id, &inst, atime)?;
            if let Some(old_fp) = existing {
                if old_fp != inst.fingerprint {
                    tx.execute(
                        "UPDATE uploads SET status = ?1, dirty_reason = ?2 WHERE id = ?3",
                        params![STATUS_DIRTY, "description changed", id as i64],
                    )?;
                }
            }
            tx.commit()?;
            Ok(id)
        })
    }

    fn assign_default(
        &mut self,
        instance: &NewInstance,
        subspace: IdSubspace,
        max_num_ids: u32,
    ) -> Result<u32> {
        let shift = self.space.high_byte_shift();
        let space = self.space;
        let inst = instance.clone();
        let atime = now_us();

        // Reuse a still-valid binding for the same fingerprint.
        let reused = self.with_retry("assign(lookup)", |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let found: Option<i64> = tx
                .query_row(
                    "SELECT id FROM images
                     WHERE fingerprint = ?1 AND ((id >> ?2) & 255) >= ?3 AND ((id >> ?2) & 255) < ?4
                     ORDER BY atime_us DESC LIMIT 1",
                    params![inst.fingerprint, shift, subspace.begin, subspace.end],
                    |row| row.get(0),
                )
                .optional()?;
            if let Some(id) = found {
                tx.execute(
                    "UPDATE images SET atime_us = ?1 WHERE id = ?2",
                    params![atime, id],
                )?;
            }
            tx.commit()?;
            Ok(found)
        })?;
        if let Some(id) = reused {
            return Ok(id as u32);
        }

        // Mint a fresh id. Rejection-sample; if a round of samples all
        // collide (tiny subspaces), evict the LRU binding in the subspace
        // and try again.
        let mut rng = rand::thread_rng();
        for round in 0..MINT_ROUNDS {
            let candidates: Vec<u32> = (0..MINT_SAMPLES_PER_ROUND)
                .map(|_| space.random_id(subspace, &mut rng))
                .collect();
            let inst = inst.clone();
            let minted = self.with_retry("assign(mint)", move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let mut minted = None;
                for &candidate in &candidates {
                    let taken: Option<i64> = tx
                        .query_row(
                            "SELECT id FROM images WHERE id = ?1",
                            params![candidate as i64],
                            |row| row.get(0),
                        )
                        .optional()?;
                    if taken.is_none() {
                        minted = Some(candidate);
                        break;
                    }
                }
                if let Some(id) = minted {
                    // Keep at most max_num_ids + 1 rows after the insert.
                    let count: i64 =
                        tx.query_row("SELECT COUNT(*) FROM images", [], |row| row.get(0))?;
                    if count >= max_num_ids as i64 {
                        let excess = count - max_num_ids as i64 + 1;
                        tx.execute(
                            "DELETE FROM images WHERE id IN (
                                SELECT id FROM images ORDER BY atime_us ASC LIMIT ?1)",
                            params![excess],
                        )?;
                    }
                    upsert_image(&tx, id, &inst, atime)?;
                } else if round + 1 < MINT_ROUNDS {
                    // Free the least recently used id in the subspace.
                    tx.execute(
                        "DELETE FROM images WHERE id IN (
                            SELECT id FROM images
                            WHERE ((id >> ?1) & 255) >= ?2 AND ((id >> ?1) & 255) < ?3
                            ORDER BY atime_us ASC LIMIT 1)",
                        params![shift, subspace.begin, subspace.end],
                    )?;
                }
                tx.commit()?;
                Ok(minted)
            })?;
            if let Some(id) = minted {
                return Ok(id);
            }
        }
        Err(IkupError::busy(format!(
            "could not find an unused id in space {} subspace {}",
            space, subspace
        )))
    }

    /// Record the byte cap of the variant chosen for this instance.
    pub fn record_variant(&mut self, id: u32, max_bytes: u64) -> Result<()> {
        self.with_retry("record_variant", move |conn| {
            conn.execute(
                "UPDATE images SET variant_max_bytes = ?1 WHERE id = ?2",
                params![max_bytes as i64, id as i64],
            )
        })?;
        Ok(())
    }

    pub fn touch(&mut self, id: u32) -> Result<()> {
        let atime = now_us();
        self.with_retry("touch", move |conn| {
            conn.execute(
                "UPDATE images SET atime_us = ?1 WHERE id = ?2",
                params![atime, id as i64],
            )
        })?;
        Ok(())
    }

    pub fn list(&self, query: &ListQuery) -> Result<Vec<ImageRecord>> {
        let base = "SELECT id, fingerprint, path, mtime_ns, size_bytes, cols, rows, format,
                    quality, variant_max_bytes, atime_us FROM images";
        let mut records = Vec::new();
        match query {
            ListQuery::All => {
                let mut stmt = self.conn.prepare(&format!("{} ORDER BY atime_us ASC", base))?;
                let rows = stmt.query_map([], row_to_record)?;
                for row in rows {
                    records.push(row?);
                }
            }
            ListQuery::Last(n) => {
                let mut stmt = self
                    .conn
                    .prepare(&format!("{} ORDER BY atime_us DESC LIMIT ?1", base))?;
                let rows = stmt.query_map(params![*n as i64], row_to_record)?;
                for row in rows {
                    records.push(row?);
                }
                records.reverse();
            }
            ListQuery::Ids(ids) => {
                let mut stmt = self
                    .conn
                    .prepare(&format!("{} WHERE id = ?1", base))?;
                for &id in ids {
                    if let Some(rec) =
                        stmt.query_row(params![id as i64], row_to_record).optional()?
                    {
                        records.push(rec);
                    }
                }
                records.sort_by_key(|r| r.atime_us);
            }
            ListQuery::Paths(paths) => {
                let mut stmt = self
                    .conn
                    .prepare(&format!("{} WHERE path = ?1 ORDER BY atime_us ASC", base))?;
                for path in paths {
                    let rows =
                        stmt.query_map(params![path.to_string_lossy().into_owned()], row_to_record)?;
                    for row in rows {
                        records.push(row?);
                    }
                }
                records.sort_by_key(|r| r.atime_us);
            }
        }
        Ok(records)
    }

    pub fn forget(&mut self, ids: &[u32]) -> Result<usize> {
        let ids: Vec<i64> = ids.iter().map(|&id| id as i64).collect();
        self.with_retry("forget", move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let mut removed = 0;
            for &id in &ids {
                removed += tx.execute("DELETE FROM images WHERE id = ?1", params![id])?;
                tx.execute("DELETE FROM uploads WHERE id = ?1", params![id])?;
            }
            tx.commit()?;
            Ok(removed)
        })
    }

    // ---- upload status ----

    pub fn mark_in_progress(
        &mut self,
        terminal_id: &str,
        id: u32,
        transport: &str,
        description: &str,
        size_bytes: u64,
        started_at_us: i64,
    ) -> Result<()> {
        let terminal_id = terminal_id.to_string();
        let transport = transport.to_string();
        let description = description.to_string();
        self.with_retry("mark_in_progress", move |conn| {
            conn.execute(
                "INSERT INTO uploads (terminal_id, id, status, transport, description,
                                      size_bytes, bytes_sent, started_at_us, progress_at_us)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7, ?7)
                 ON CONFLICT(terminal_id, id) DO UPDATE SET
                     status = excluded.status, transport = excluded.transport,
                     description = excluded.description, size_bytes = excluded.size_bytes,
                     bytes_sent = 0, started_at_us = excluded.started_at_us,
                     progress_at_us = excluded.progress_at_us, dirty_reason = NULL",
                params![
                    terminal_id,
                    id as i64,
                    STATUS_IN_PROGRESS,
                    transport,
                    description,
                    size_bytes as i64,
                    started_at_us
                ],
            )
        })?;
        Ok(())
    }

    /// Refresh the progress heartbeat of an in-progress upload.
    pub fn progress(&mut self, terminal_id: &str, id: u32, bytes_sent: u64, now: i64) -> Result<()> {
        let terminal_id = terminal_id.to_string();
        self.with_retry("progress", move |conn| {
            conn.execute(
                "UPDATE uploads SET progress_at_us = ?1, bytes_sent = ?2
                 WHERE terminal_id = ?3 AND id = ?4 AND status = ?5",
                params![now, bytes_sent as i64, terminal_id, id as i64, STATUS_IN_PROGRESS],
            )
        })?;
        Ok(())
    }

    pub fn mark_uploaded(
        &mut self,
        terminal_id: &str,
        id: u32,
        transport: &str,
        description: &str,
        bytes: u64,
    ) -> Result<()> {
        let terminal_id = terminal_id.to_string();
        let transport = transport.to_string();
        let description = description.to_string();
        let now = now_us();
        self.with_retry("mark_uploaded", move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let seq: i64 = tx.query_row(
                "SELECT COALESCE(MAX(upload_seq), 0) + 1 FROM uploads WHERE terminal_id = ?1",
                params![terminal_id],
                |row| row.get(0),
            )?;
            tx.execute(
                "INSERT INTO uploads (terminal_id, id, status, transport, description,
                                      size_bytes, bytes_sent, uploaded_at_us, progress_at_us,
                                      upload_seq)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6, ?7, ?7, ?8)
                 ON CONFLICT(terminal_id, id) DO UPDATE SET
                     status = excluded.status, transport = excluded.transport,
                     description = excluded.description, size_bytes = excluded.size_bytes,
                     bytes_sent = excluded.bytes_sent,
                     uploaded_at_us = excluded.uploaded_at_us,
                     progress_at_us = excluded.progress_at_us,
                     upload_seq = excluded.upload_seq, dirty_reason = NULL",
                params![
                    terminal_id,
                    id as i64,
                    STATUS_UPLOADED,
                    transport,
                    description,
                    bytes as i64,
                    now,
                    seq
                ],
            )?;
            tx.commit()?;
            Ok(())
        })
    }

    /// Mark the id dirty for every terminal that has seen it.
    pub fn mark_dirty(&mut self, id: u32, reason: &str) -> Result<()> {
        let reason = reason.to_string();
        let id = id as i64;
        self.with_retry("mark_dirty", move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let updated = tx.execute(
                "UPDATE uploads SET status = ?1, dirty_reason = ?2 WHERE id = ?3",
                params![STATUS_DIRTY, reason, id],
            )?;
            if updated == 0 {
                // No terminal has a row yet; a dirty marker still has to
                // survive so `fix` knows about the id.
                tx.execute(
                    "INSERT OR REPLACE INTO uploads (terminal_id, id, status, dirty_reason)
                     VALUES ('', ?1, ?2, ?3)",
                    params![id, STATUS_DIRTY, reason],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
    }

    pub fn status(&self, terminal_id: &str, id: u32) -> Result<Option<UploadRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT terminal_id, id, status, transport, description, size_bytes,
                    bytes_sent, started_at_us, progress_at_us, uploaded_at_us,
                    upload_seq, dirty_reason
             FROM uploads WHERE terminal_id = ?1 AND id = ?2",
        )?;
        let raw = stmt
            .query_row(params![terminal_id, id as i64], row_to_raw_upload)
            .optional()?;
        match raw {
            None => Ok(None),
            Some(raw) => Ok(Some(self.finish_upload_row(raw)?)),
        }
    }

    /// All upload rows for the id, for verbose listing.
    pub fn upload_rows(&self, id: u32) -> Result<Vec<UploadRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT terminal_id, id, status, transport, description, size_bytes,
                    bytes_sent, started_at_us, progress_at_us, uploaded_at_us,
                    upload_seq, dirty_reason
             FROM uploads WHERE id = ?1 AND terminal_id != '' ORDER BY terminal_id",
        )?;
        let raws: Vec<RawUpload> = stmt
            .query_map(params![id as i64], row_to_raw_upload)?
            .collect::<rusqlite::Result<_>>()?;
        raws.into_iter().map(|r| self.finish_upload_row(r)).collect()
    }

    fn finish_upload_row(&self, raw: RawUpload) -> Result<UploadRow> {
        let state = match raw.status {
            STATUS_IN_PROGRESS => UploadState::InProgress {
                started_at_us: raw.started_at_us.unwrap_or(0),
                last_progress_at_us: raw.progress_at_us.unwrap_or(0),
                bytes_sent: raw.bytes_sent,
            },
            STATUS_DIRTY => UploadState::Dirty {
                reason: raw.dirty_reason.unwrap_or_else(|| "dirty".to_string()),
            },
            _ => {
                // Uploads that happened after this one, for re-upload ageing.
                let (max_seq, bytes_after): (i64, i64) = self.conn.query_row(
                    "SELECT COALESCE(MAX(upload_seq), 0),
                            COALESCE(SUM(CASE WHEN upload_seq > ?2 THEN size_bytes ELSE 0 END), 0)
                     FROM uploads WHERE terminal_id = ?1",
                    params![raw.terminal_id, raw.upload_seq],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )?;
                UploadState::Uploaded {
                    at_us: raw.uploaded_at_us.unwrap_or(0),
                    bytes: raw.size_bytes,
                    uploads_ago: max_seq - raw.upload_seq + 1,
                    bytes_ago: bytes_after as u64,
                }
            }
        };
        Ok(UploadRow {
            terminal_id: raw.terminal_id,
            id: raw.id,
            state,
            transport: raw.transport,
            description: raw.description,
            size_bytes: raw.size_bytes,
        })
    }

    // ---- cleanup ----

    /// Evict oldest rows until `count <= max_num_ids`, dropping orphaned
    /// upload rows along the way.
    pub fn cleanup(&mut self, max_num_ids: u32) -> Result<usize> {
        self.with_retry("cleanup", move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let count: i64 = tx.query_row("SELECT COUNT(*) FROM images", [], |row| row.get(0))?;
            let mut removed = 0;
            if count > max_num_ids as i64 {
                removed = tx.execute(
                    "DELETE FROM images WHERE id IN (
                        SELECT id FROM images ORDER BY atime_us ASC LIMIT ?1)",
                    params![count - max_num_ids as i64],
                )?;
            }
            tx.execute(
                "DELETE FROM uploads WHERE id NOT IN (SELECT id FROM images)",
                [],
            )?;
            tx.commit()?;
            Ok(removed)
        })
    }
}

/// Delete database files in `dir` whose file mtime is older than `max_age`,
/// keeping the currently open files. Returns the removed paths.
pub fn purge_stale_databases(
    dir: &Path,
    max_age: Duration,
    keep: &[PathBuf],
) -> Result<Vec<PathBuf>> {
    let mut removed = Vec::new();
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return Ok(removed),
    };
    let now = std::time::SystemTime::now();
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("db") {
            continue;
        }
        if keep.iter().any(|k| k == &path) {
            continue;
        }
        let stale = entry
            .metadata()
            .and_then(|m| m.modified())
            .ok()
            .and_then(|mtime| now.duration_since(mtime).ok())
            .map(|age| age > max_age)
            .unwrap_or(false);
        if stale {
            if std::fs::remove_file(&path).is_ok() {
                log::info!("Removed stale database {}", path.display());
                removed.push(path);
            }
        }
    }
    Ok(removed)
}

struct RawUpload {
    terminal_id: String,
    id: u32,
    status: i64,
    transport: String,
    description: String,
    size_bytes: u64,
    bytes_sent: u64,
    started_at_us: Option<i64>,
    progress_at_us: Option<i64>,
    uploaded_at_us: Option<i64>,
    upload_seq: i64,
    dirty_reason: Option<String>,
}

fn row_to_raw_upload(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawUpload> {
    Ok(RawUpload {
        terminal_id: row.get(0)?,
        id: row.get::<_, i64>(1)? as u32,
        status: row.get(2)?,
        transport: row.get(3)?,
        description: row.get(4)?,
        size_bytes: row.get::<_, i64>(5)? as u64,
        bytes_sent: row.get::<_, i64>(6)? as u64,
        started_at_us: row.get(7)?,
        progress_at_us: row.get(8)?,
        uploaded_at_us: row.get(9)?,
        upload_seq: row.get(10)?,
        dirty_reason: row.get(11)?,
    })
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<ImageRecord> {
    Ok(ImageRecord {
        id: row.get::<_, i64>(0)? as u32,
        fingerprint: row.get(1)?,
        path: PathBuf::from(row.get::<_, String>(2)?),
        mtime_ns: row.get(3)?,
        size_bytes: row.get::<_, i64>(4)? as u64,
        cols: row.get::<_, i64>(5)? as u32,
        rows: row.get::<_, i64>(6)? as u32,
        format: row.get(7)?,
        quality: row.get::<_, Option<i64>>(8)?.map(|q| q as u8),
        variant_max_bytes: row.get::<_, Option<i64>>(9)?.map(|b| b as u64),
        atime_us: row.get(10)?,
    })
}

fn upsert_image(
    tx: &rusqlite::Transaction<'_>,
    id: u32,
    inst: &NewInstance,
    atime_us: i64,
) -> rusqlite::Result<()> {
    tx.execute(
        "INSERT INTO images (id, fingerprint, path, mtime_ns, size_bytes, cols, rows,
                             format, quality, atime_us)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
         ON CONFLICT(id) DO UPDATE SET
             fingerprint = excluded.fingerprint, path = excluded.path,
             mtime_ns = excluded.mtime_ns, size_bytes = excluded.size_bytes,
             cols = excluded.cols, rows = excluded.rows, format = excluded.format,
             quality = excluded.quality, variant_max_bytes = NULL,
             atime_us = excluded.atime_us",
        params![
            id as i64,
            inst.fingerprint,
            inst.path.to_string_lossy().into_owned(),
            inst.mtime_ns,
            inst.size_bytes as i64,
            inst.cols as i64,
            inst.rows as i64,
            inst.format,
            inst.quality.map(|q| q as i64),
            atime_us
        ],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db(space: IdSpace) -> (tempfile::TempDir, IdDatabase) {
        let dir = tempfile::tempdir().unwrap();
        let db = IdDatabase::open(dir.path(), "test", space, Duration::from_secs(2)).unwrap();
        (dir, db)
    }

    fn instance(fp: &str) -> NewInstance {
        NewInstance {
            fingerprint: fp.to_string(),
            path: PathBuf::from("/tmp/img.png"),
            mtime_ns: 1234,
            size_bytes: 999,
            cols: 5,
            rows: 2,
            format: None,
            quality: None,
        }
    }

    fn default_policy() -> AssignPolicy {
        AssignPolicy::Default {
            subspace: IdSubspace::default(),
            max_num_ids: 1024,
        }
    }

    #[test]
    fn test_assign_is_idempotent() {
        let (_dir, mut db) = test_db(IdSpace::Bits24);
        let inst = instance("aa");
        let id1 = db.assign(&inst, &default_policy()).unwrap();
        let id2 = db.assign(&inst, &default_policy()).unwrap();
        assert_eq!(id1, id2);
        assert!(IdSpace::Bits24.contains(id1));
        assert_eq!(db.count().unwrap(), 1);
    }

    #[test]
    fn test_lookup_by_fingerprint() {
        let (_dir, mut db) = test_db(IdSpace::Bits24);
        assert!(db.lookup_by_fingerprint("aa").unwrap().is_none());
        let id = db.assign(&instance("aa"), &default_policy()).unwrap();
        let found = db.lookup_by_fingerprint("aa").unwrap().unwrap();
        assert_eq!(found.id, id);
        assert_eq!(found.cols, 5);
        assert_eq!(found.rows, 2);
    }

    #[test]
    fn test_assign_respects_subspace() {
        let (_dir, mut db) = test_db(IdSpace::Bits32);
        let policy = AssignPolicy::Default {
            subspace: IdSubspace { begin: 42, end: 43 },
            max_num_ids: 1024,
        };
        for i in 0..20 {
            let id = db.assign(&instance(&format!("fp{}", i)), &policy).unwrap();
            assert_eq!(IdSpace::Bits32.high_byte(id), 0x2A);
        }
    }

    #[test]
    fn test_single_id_subspace_evicts_lru() {
        // The 8-bit space with subspace 42:43 has exactly one id.
        let (_dir, mut db) = test_db(IdSpace::Bits8);
        let policy = AssignPolicy::Default {
            subspace: IdSubspace { begin: 42, end: 43 },
            max_num_ids: 1024,
        };
        assert_eq!(db.assign(&instance("one"), &policy).unwrap(), 42);
        assert_eq!(db.assign(&instance("two"), &policy).unwrap(), 42);
        assert_eq!(db.count().unwrap(), 1);
        assert_eq!(db.get(42).unwrap().unwrap().fingerprint, "two");
    }

    #[test]
    fn test_max_num_ids_bound() {
        let (_dir, mut db) = test_db(IdSpace::Bits24);
        let policy = AssignPolicy::Default {
            subspace: IdSubspace::default(),
            max_num_ids: 4,
        };
        for i in 0..10 {
            db.assign(&instance(&format!("fp{}", i)), &policy).unwrap();
            assert!(db.count().unwrap() <= 5, "count > max_num_ids + 1");
        }
        db.cleanup(4).unwrap();
        assert!(db.count().unwrap() <= 4);
    }

    #[test]
    fn test_force_id_steals_and_dirties() {
        let (_dir, mut db) = test_db(IdSpace::Bits24);
        let k = 0x0012_3456;
        db.assign(&instance("first"), &AssignPolicy::ForceId(k)).unwrap();
        db.mark_uploaded("term-1", k, "file", "first", 100).unwrap();
        assert!(db.status("term-1", k).unwrap().unwrap().is_uploaded());

        db.assign(&instance("second"), &AssignPolicy::ForceId(k)).unwrap();
        assert_eq!(db.get(k).unwrap().unwrap().fingerprint, "second");
        let status = db.status("term-1", k).unwrap().unwrap();
        assert_eq!(
            status.state,
            UploadState::Dirty {
                reason: "description changed".to_string()
            }
        );
        // The blob the terminal saw is preserved for mismatch detection.
        assert_eq!(status.description, "first");
    }

    #[test]
    fn test_upload_status_lifecycle() {
        let (_dir, mut db) = test_db(IdSpace::Bits24);
        let id = db.assign(&instance("fp"), &default_policy()).unwrap();

        let t0 = now_us();
        db.mark_in_progress("term", id, "stream", "fp", 1000, t0).unwrap();
        match db.status("term", id).unwrap().unwrap().state {
            UploadState::InProgress {
                started_at_us,
                last_progress_at_us,
                bytes_sent,
            } => {
                assert_eq!(started_at_us, t0);
                assert_eq!(last_progress_at_us, t0);
                assert_eq!(bytes_sent, 0);
            }
            other => panic!("unexpected state {:?}", other),
        }

        db.progress("term", id, 512, t0 + 100).unwrap();
        match db.status("term", id).unwrap().unwrap().state {
            UploadState::InProgress {
                last_progress_at_us,
                bytes_sent,
                ..
            } => {
                assert_eq!(last_progress_at_us, t0 + 100);
                assert_eq!(bytes_sent, 512);
            }
            other => panic!("unexpected state {:?}", other),
        }

        db.mark_uploaded("term", id, "stream", "fp", 1000).unwrap();
        match db.status("term", id).unwrap().unwrap().state {
            UploadState::Uploaded {
                bytes, uploads_ago, ..
            } => {
                assert_eq!(bytes, 1000);
                assert_eq!(uploads_ago, 1);
            }
            other => panic!("unexpected state {:?}", other),
        }
    }

    #[test]
    fn test_uploads_ago_counts_later_uploads() {
        let (_dir, mut db) = test_db(IdSpace::Bits24);
        let a = db.assign(&instance("a"), &default_policy()).unwrap();
        let b = db.assign(&instance("b"), &default_policy()).unwrap();
        db.mark_uploaded("term", a, "file", "a", 100).unwrap();
        db.mark_uploaded("term", b, "file", "b", 250).unwrap();
        match db.status("term", a).unwrap().unwrap().state {
            UploadState::Uploaded {
                uploads_ago,
                bytes_ago,
                ..
            } => {
                assert_eq!(uploads_ago, 2);
                assert_eq!(bytes_ago, 250);
            }
            other => panic!("unexpected state {:?}", other),
        }
    }

    #[test]
    fn test_dirty_and_forget() {
        let (_dir, mut db) = test_db(IdSpace::Bits24);
        let id = db.assign(&instance("fp"), &default_policy()).unwrap();
        db.mark_uploaded("term", id, "file", "fp", 10).unwrap();
        db.mark_dirty(id, "requested").unwrap();
        assert!(matches!(
            db.status("term", id).unwrap().unwrap().state,
            UploadState::Dirty { .. }
        ));

        db.forget(&[id]).unwrap();
        assert!(db.get(id).unwrap().is_none());
        assert!(db.status("term", id).unwrap().is_none());
    }

    #[test]
    fn test_list_queries() {
        let (_dir, mut db) = test_db(IdSpace::Bits24);
        let mut ids = Vec::new();
        for i in 0..5 {
            let mut inst = instance(&format!("fp{}", i));
            inst.path = PathBuf::from(format!("/tmp/img{}.png", i));
            ids.push(db.assign(&inst, &default_policy()).unwrap());
        }
        let all = db.list(&ListQuery::All).unwrap();
        assert_eq!(all.len(), 5);
        assert!(all.windows(2).all(|w| w[0].atime_us <= w[1].atime_us));

        let last2 = db.list(&ListQuery::Last(2)).unwrap();
        assert_eq!(last2.len(), 2);

        let by_id = db.list(&ListQuery::Ids(vec![ids[0], 999])).unwrap();
        assert_eq!(by_id.len(), 1);
        assert_eq!(by_id[0].id, ids[0]);

        let by_path = db
            .list(&ListQuery::Paths(vec![PathBuf::from("/tmp/img3.png")]))
            .unwrap();
        assert_eq!(by_path.len(), 1);
        assert_eq!(by_path[0].id, ids[3]);
    }

    #[test]
    fn test_purge_stale_databases() {
        let dir = tempfile::tempdir().unwrap();
        let keep = dir.path().join("keep.db");
        let stale = dir.path().join("stale.db");
        std::fs::write(&keep, b"x").unwrap();
        std::fs::write(&stale, b"x").unwrap();
        // Zero max age makes every file stale except the kept one.
        std::thread::sleep(Duration::from_millis(10));
        let removed =
            purge_stale_databases(dir.path(), Duration::from_millis(1), &[keep.clone()]).unwrap();
        assert_eq!(removed, vec![stale]);
        assert!(keep.exists());
    }
}
