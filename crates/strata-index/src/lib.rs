//! # strata-index
//!
//! Durable chunk index: the single owner of reference counts.
//!
//! Backed by SQLite in write-ahead-log mode with full synchronization.
//! Four tables carry the whole data model:
//!
//! - `chunks(hash PK, size, ref_count)`
//! - `files(path PK, chunks_csv)` — logical stream to ordered digest list
//! - `layer_chunks(layer_id, hash, position)` — per-layer bindings
//! - `layers(layer_id PK, digest, total_size, chunk_count, created_at)`
//!
//! A process-wide read-write lock serializes writers at the application
//! level; every write path is a single immediate transaction. On open the
//! index looks for a lock sentinel or a leftover WAL from a prior run and,
//! when found, runs integrity check → WAL checkpoint truncation → (on
//! corruption) backup plus a refcount rebuild from `files.chunks_csv`.

use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("index corrupted: {0}")]
    Corrupt(String),

    #[error("not found: {0}")]
    NotFound(String),
}

pub type Result<T> = std::result::Result<T, IndexError>;

/// Digest and size of one chunk within a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkMeta {
    pub digest: String,
    pub size: u64,
}

/// Per-layer dedup statistics.
#[derive(Debug, Clone, Default)]
pub struct LayerStats {
    pub total_chunks: i64,
    pub unique_chunks: i64,
    pub total_size: i64,
    pub unique_size: i64,
    pub dedup_ratio: f64,
}

/// Store-wide statistics.
#[derive(Debug, Clone, Default)]
pub struct GlobalStats {
    pub total_chunks: i64,
    pub stored_size: i64,
    pub logical_size: i64,
    pub dedup_ratio: f64,
    pub layer_count: i64,
}

/// Recorded layer row.
#[derive(Debug, Clone)]
pub struct LayerRecord {
    pub layer_id: String,
    pub digest: String,
    pub total_size: i64,
    pub chunk_count: i64,
    pub created_at: i64,
}

fn timestamp_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// Durable `{digest → (size, refcount)}` and `{path → digests}` mapping.
pub struct ChunkIndex {
    path: PathBuf,
    lock_file: PathBuf,
    rw: RwLock<()>,
}

impl ChunkIndex {
    /// Open the index at `path`, running crash recovery when a prior run
    /// left a lock sentinel or WAL behind.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let lock_file = PathBuf::from(format!("{}.lock", path.display()));

        if let Err(e) = check_clean_shutdown(&path, &lock_file) {
            warn!(error = %e, "unclean shutdown detected, running recovery");
            recover_database(&path)?;
        }

        let index = Self {
            path,
            lock_file,
            rw: RwLock::new(()),
        };

        {
            let conn = index.connection()?;
            init_schema(&conn)?;
        }
        index.create_lock_file()?;

        if let Err(e) = index.verify_integrity() {
            warn!(error = %e, "integrity check failed, rebuilding refcounts");
            index.rebuild()?;
        }

        Ok(index)
    }

    fn connection(&self) -> Result<Connection> {
        let conn = Connection::open(&self.path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "FULL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.busy_timeout(Duration::from_secs(10))?;
        Ok(conn)
    }

    fn create_lock_file(&self) -> Result<()> {
        std::fs::write(&self.lock_file, format!("{}", timestamp_secs()))?;
        Ok(())
    }

    /// Record a logical stream: insert-or-ignore every chunk row, bump each
    /// refcount once per occurrence, upsert the file record. Atomic.
    pub fn index_file(&self, path: &str, chunks: &[ChunkMeta]) -> Result<()> {
        let _w = self.rw.write().unwrap();
        let mut conn = self.connection()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let mut csv = String::new();
        for (i, chunk) in chunks.iter().enumerate() {
            if i > 0 {
                csv.push(',');
            }
            csv.push_str(&chunk.digest);

            tx.execute(
                "INSERT OR IGNORE INTO chunks (hash, size, ref_count) VALUES (?1, ?2, 0)",
                params![chunk.digest, chunk.size as i64],
            )?;
            tx.execute(
                "UPDATE chunks SET ref_count = ref_count + 1 WHERE hash = ?1",
                params![chunk.digest],
            )?;
        }

        tx.execute(
            "INSERT OR REPLACE INTO files (path, chunks_csv) VALUES (?1, ?2)",
            params![path, csv],
        )?;

        tx.commit()?;
        debug!(path, chunks = chunks.len(), "file indexed");
        Ok(())
    }

    /// Ordered digest list for a previously indexed stream.
    pub fn file_chunks(&self, path: &str) -> Result<Vec<String>> {
        let _r = self.rw.read().unwrap();
        let conn = self.connection()?;
        let csv: Option<String> = conn
            .query_row(
                "SELECT chunks_csv FROM files WHERE path = ?1",
                params![path],
                |row| row.get(0),
            )
            .optional()?;
        match csv {
            Some(csv) => Ok(parse_chunk_csv(&csv)),
            None => Err(IndexError::NotFound(format!("file {path}"))),
        }
    }

    /// Bump a chunk refcount by one.
    pub fn increment(&self, digest: &str) -> Result<i64> {
        let _w = self.rw.write().unwrap();
        let mut conn = self.connection()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let changed = tx.execute(
            "UPDATE chunks SET ref_count = ref_count + 1 WHERE hash = ?1",
            params![digest],
        )?;
        if changed == 0 {
            return Err(IndexError::NotFound(format!("chunk {digest}")));
        }
        let post: i64 = tx.query_row(
            "SELECT ref_count FROM chunks WHERE hash = ?1",
            params![digest],
            |row| row.get(0),
        )?;
        tx.commit()?;
        Ok(post)
    }

    /// Drop a chunk refcount by one, never below zero. Returns the post
    /// value; the caller erases the chunk file when it reaches zero.
    pub fn decrement(&self, digest: &str) -> Result<i64> {
        let _w = self.rw.write().unwrap();
        let mut conn = self.connection()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let changed = tx.execute(
            "UPDATE chunks SET ref_count = CASE WHEN ref_count > 0 \
             THEN ref_count - 1 ELSE 0 END WHERE hash = ?1",
            params![digest],
        )?;
        if changed == 0 {
            return Err(IndexError::NotFound(format!("chunk {digest}")));
        }
        let post: i64 = tx.query_row(
            "SELECT ref_count FROM chunks WHERE hash = ?1",
            params![digest],
            |row| row.get(0),
        )?;
        tx.commit()?;
        Ok(post)
    }

    /// Current refcount for a chunk.
    pub fn refcount(&self, digest: &str) -> Result<i64> {
        let _r = self.rw.read().unwrap();
        let conn = self.connection()?;
        conn.query_row(
            "SELECT ref_count FROM chunks WHERE hash = ?1",
            params![digest],
            |row| row.get(0),
        )
        .optional()?
        .ok_or_else(|| IndexError::NotFound(format!("chunk {digest}")))
    }

    /// Chunk size as recorded at first insert.
    pub fn chunk_size(&self, digest: &str) -> Result<i64> {
        let _r = self.rw.read().unwrap();
        let conn = self.connection()?;
        conn.query_row(
            "SELECT size FROM chunks WHERE hash = ?1",
            params![digest],
            |row| row.get(0),
        )
        .optional()?
        .ok_or_else(|| IndexError::NotFound(format!("chunk {digest}")))
    }

    /// Register a layer row keyed by its whole-archive content digest.
    pub fn register_layer(&self, layer_id: &str, content_digest: &str) -> Result<()> {
        let _w = self.rw.write().unwrap();
        let conn = self.connection()?;
        conn.execute(
            "INSERT INTO layers (layer_id, digest, total_size, chunk_count, created_at) \
             VALUES (?1, ?2, 0, 0, ?3) \
             ON CONFLICT(layer_id) DO UPDATE SET digest = excluded.digest",
            params![layer_id, content_digest, timestamp_secs()],
        )?;
        Ok(())
    }

    /// Whole-layer dedup key: the layer id previously recorded for this
    /// content digest, if any.
    pub fn layer_for_digest(&self, content_digest: &str) -> Result<Option<String>> {
        let _r = self.rw.read().unwrap();
        let conn = self.connection()?;
        Ok(conn
            .query_row(
                "SELECT layer_id FROM layers WHERE digest = ?1",
                params![content_digest],
                |row| row.get(0),
            )
            .optional()?)
    }

    /// Recorded layer row.
    pub fn layer(&self, layer_id: &str) -> Result<LayerRecord> {
        let _r = self.rw.read().unwrap();
        let conn = self.connection()?;
        conn.query_row(
            "SELECT layer_id, digest, total_size, chunk_count, created_at \
             FROM layers WHERE layer_id = ?1",
            params![layer_id],
            |row| {
                Ok(LayerRecord {
                    layer_id: row.get(0)?,
                    digest: row.get(1)?,
                    total_size: row.get(2)?,
                    chunk_count: row.get(3)?,
                    created_at: row.get(4)?,
                })
            },
        )
        .optional()?
        .ok_or_else(|| IndexError::NotFound(format!("layer {layer_id}")))
    }

    /// Bind the next chunk of a layer: upsert the chunk row (refcount += 1),
    /// assign the next position, update the layer aggregates. Atomic.
    pub fn record_layer_chunk(&self, layer_id: &str, digest: &str, size: u64) -> Result<()> {
        let _w = self.rw.write().unwrap();
        let mut conn = self.connection()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        tx.execute(
            "INSERT INTO chunks (hash, size, ref_count) VALUES (?1, ?2, 1) \
             ON CONFLICT(hash) DO UPDATE SET ref_count = ref_count + 1",
            params![digest, size as i64],
        )?;

        let position: i64 = tx.query_row(
            "SELECT COALESCE(MAX(position), -1) + 1 FROM layer_chunks WHERE layer_id = ?1",
            params![layer_id],
            |row| row.get(0),
        )?;
        tx.execute(
            "INSERT INTO layer_chunks (layer_id, hash, position) VALUES (?1, ?2, ?3)",
            params![layer_id, digest, position],
        )?;

        tx.execute(
            "INSERT INTO layers (layer_id, digest, total_size, chunk_count, created_at) \
             VALUES (?1, '', ?2, 1, ?3) \
             ON CONFLICT(layer_id) DO UPDATE SET \
                 total_size = total_size + ?2, \
                 chunk_count = chunk_count + 1",
            params![layer_id, size as i64, timestamp_secs()],
        )?;

        tx.commit()?;
        Ok(())
    }

    /// Ordered digests bound to a layer.
    pub fn layer_chunks(&self, layer_id: &str) -> Result<Vec<String>> {
        let _r = self.rw.read().unwrap();
        let conn = self.connection()?;
        let mut stmt = conn.prepare(
            "SELECT hash FROM layer_chunks WHERE layer_id = ?1 ORDER BY position",
        )?;
        let rows = stmt
            .query_map(params![layer_id], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Drop a layer: decrement once per binding occurrence, delete chunk
    /// rows that reach zero, delete the bindings and the layer row.
    /// Returns the digests whose files the chunk store must erase.
    pub fn remove_layer(&self, layer_id: &str) -> Result<Vec<String>> {
        let _w = self.rw.write().unwrap();
        let mut conn = self.connection()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let bound: Vec<String> = {
            let mut stmt =
                tx.prepare("SELECT hash FROM layer_chunks WHERE layer_id = ?1")?;
            let rows = stmt
                .query_map(params![layer_id], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };

        let mut occurrences: HashMap<String, i64> = HashMap::new();
        for hash in &bound {
            *occurrences.entry(hash.clone()).or_default() += 1;
        }

        let mut to_erase = Vec::new();
        for (hash, count) in &occurrences {
            tx.execute(
                "UPDATE chunks SET ref_count = CASE WHEN ref_count > ?2 \
                 THEN ref_count - ?2 ELSE 0 END WHERE hash = ?1",
                params![hash, count],
            )?;
            let post: i64 = tx.query_row(
                "SELECT ref_count FROM chunks WHERE hash = ?1",
                params![hash],
                |row| row.get(0),
            )?;
            if post <= 0 {
                tx.execute("DELETE FROM chunks WHERE hash = ?1", params![hash])?;
                to_erase.push(hash.clone());
            }
        }

        tx.execute(
            "DELETE FROM layer_chunks WHERE layer_id = ?1",
            params![layer_id],
        )?;
        tx.execute("DELETE FROM layers WHERE layer_id = ?1", params![layer_id])?;

        tx.commit()?;
        info!(
            layer_id,
            erasable = to_erase.len(),
            "layer removed from index"
        );
        Ok(to_erase)
    }

    /// Per-layer dedup statistics.
    pub fn stats(&self, layer_id: &str) -> Result<LayerStats> {
        let _r = self.rw.read().unwrap();
        let conn = self.connection()?;

        let (total_chunks, unique_chunks, total_size): (i64, i64, Option<i64>) = conn
            .query_row(
                "SELECT COUNT(*), COUNT(DISTINCT lc.hash), SUM(c.size) \
                 FROM layer_chunks lc JOIN chunks c ON lc.hash = c.hash \
                 WHERE lc.layer_id = ?1",
                params![layer_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )?;

        let unique_size: Option<i64> = conn.query_row(
            "SELECT SUM(c.size) FROM \
             (SELECT DISTINCT hash FROM layer_chunks WHERE layer_id = ?1) lc \
             JOIN chunks c ON lc.hash = c.hash",
            params![layer_id],
            |row| row.get(0),
        )?;

        let total_size = total_size.unwrap_or(0);
        let unique_size = unique_size.unwrap_or(0);
        let dedup_ratio = if total_size > 0 {
            (total_size - unique_size) as f64 / total_size as f64 * 100.0
        } else {
            0.0
        };

        Ok(LayerStats {
            total_chunks,
            unique_chunks,
            total_size,
            unique_size,
            dedup_ratio,
        })
    }

    /// Store-wide statistics across all tables.
    pub fn global_stats(&self) -> Result<GlobalStats> {
        let _r = self.rw.read().unwrap();
        let conn = self.connection()?;

        let (total_chunks, stored_size, logical_size): (i64, Option<i64>, Option<i64>) = conn
            .query_row(
                "SELECT COUNT(*), SUM(size), SUM(size * ref_count) FROM chunks",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )?;
        let layer_count: i64 =
            conn.query_row("SELECT COUNT(*) FROM layers", [], |row| row.get(0))?;

        let stored_size = stored_size.unwrap_or(0);
        let logical_size = logical_size.unwrap_or(0);
        let dedup_ratio = if logical_size > 0 {
            (logical_size - stored_size) as f64 / logical_size as f64 * 100.0
        } else {
            0.0
        };

        Ok(GlobalStats {
            total_chunks,
            stored_size,
            logical_size,
            dedup_ratio,
            layer_count,
        })
    }

    fn verify_integrity(&self) -> Result<()> {
        let conn = self.connection()?;
        let result: String = conn.query_row("PRAGMA integrity_check", [], |row| row.get(0))?;
        if result.to_ascii_lowercase() != "ok" {
            return Err(IndexError::Corrupt(result));
        }

        let chunk_count: i64 =
            conn.query_row("SELECT COUNT(*) FROM chunks", [], |row| row.get(0))?;
        let file_count: i64 =
            conn.query_row("SELECT COUNT(*) FROM files", [], |row| row.get(0))?;
        info!(chunk_count, file_count, "index integrity verified");
        Ok(())
    }

    /// Reconstruct every refcount from `files.chunks_csv`. After this pass
    /// each refcount equals the number of occurrences of its digest across
    /// all file rows.
    fn rebuild(&self) -> Result<()> {
        info!("starting index rebuild");

        let backup = format!("{}.rebuild_backup.{}", self.path.display(), timestamp_secs());
        if std::fs::copy(&self.path, &backup).is_ok() {
            info!(backup = %backup, "created rebuild backup");
        }

        let _w = self.rw.write().unwrap();
        let mut conn = self.connection()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        tx.execute("DELETE FROM chunks WHERE ref_count <= 0", [])?;

        let mut ref_counts: HashMap<String, i64> = HashMap::new();
        {
            let mut stmt = tx.prepare("SELECT path, chunks_csv FROM files")?;
            let mut rows = stmt.query([])?;
            while let Some(row) = rows.next()? {
                let csv: String = row.get(1)?;
                for hash in parse_chunk_csv(&csv) {
                    *ref_counts.entry(hash).or_default() += 1;
                }
            }
        }

        for (hash, count) in &ref_counts {
            tx.execute(
                "UPDATE chunks SET ref_count = ?1 WHERE hash = ?2",
                params![count, hash],
            )?;
        }

        tx.commit()?;

        if let Err(e) = conn.execute("VACUUM", []) {
            warn!(error = %e, "VACUUM after rebuild failed");
        }

        info!(rebuilt = ref_counts.len(), "index rebuild completed");
        Ok(())
    }

    /// Checkpoint the WAL and remove the lock sentinel.
    pub fn close(&self) -> Result<()> {
        {
            let _w = self.rw.write().unwrap();
            let conn = self.connection()?;
            let _ = conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE)");
        }
        if self.lock_file.exists() {
            std::fs::remove_file(&self.lock_file)?;
        }
        Ok(())
    }
}

fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS chunks (
            hash TEXT PRIMARY KEY,
            size INTEGER NOT NULL,
            ref_count INTEGER DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS files (
            path TEXT PRIMARY KEY,
            chunks_csv TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS layer_chunks (
            layer_id TEXT NOT NULL,
            hash TEXT NOT NULL,
            position INTEGER NOT NULL,
            PRIMARY KEY (layer_id, hash, position)
        );

        CREATE TABLE IF NOT EXISTS layers (
            layer_id TEXT PRIMARY KEY,
            digest TEXT NOT NULL,
            total_size INTEGER DEFAULT 0,
            chunk_count INTEGER DEFAULT 0,
            created_at INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_chunks_refcount ON chunks(ref_count);
        CREATE INDEX IF NOT EXISTS idx_layer_chunks_layer ON layer_chunks(layer_id);
        CREATE INDEX IF NOT EXISTS idx_layers_digest ON layers(digest);
        "#,
    )?;
    Ok(())
}

fn check_clean_shutdown(db_path: &Path, lock_file: &Path) -> std::result::Result<(), String> {
    if lock_file.exists() {
        return Err("lock sentinel exists".to_string());
    }
    if !db_path.exists() {
        return Ok(());
    }
    let wal = PathBuf::from(format!("{}-wal", db_path.display()));
    if wal.exists() {
        return Err("WAL file left from previous run".to_string());
    }
    Ok(())
}

fn recover_database(db_path: &Path) -> Result<()> {
    if !db_path.exists() {
        return Ok(());
    }

    info!("attempting index recovery");

    let backup = format!("{}.backup.{}", db_path.display(), timestamp_secs());
    match std::fs::copy(db_path, &backup) {
        Ok(_) => info!(backup = %backup, "created index backup"),
        Err(e) => warn!(error = %e, "failed to create index backup"),
    }

    let conn = Connection::open(db_path)?;
    conn.pragma_update(None, "journal_mode", "WAL")?;

    let result: String = conn.query_row("PRAGMA integrity_check", [], |row| row.get(0))?;
    if result.to_ascii_lowercase() != "ok" {
        // The caller's rebuild pass handles the corruption.
        warn!(result = %result, "integrity check reported corruption");
        return Ok(());
    }

    conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE)")?;
    info!("index recovery completed");
    Ok(())
}

fn parse_chunk_csv(csv: &str) -> Vec<String> {
    csv.split(',')
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}

impl Drop for ChunkIndex {
    fn drop(&mut self) {
        if self.lock_file.exists() {
            let _ = std::fs::remove_file(&self.lock_file);
        }
    }
}
