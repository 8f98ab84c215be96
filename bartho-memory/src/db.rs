//! Record store: a single SQLite file holding records, embeddings, the FTS
//! shadow tables, consent rows, and system flags.
//!
//! Single-writer, multi-reader: one connection behind a mutex, WAL journal
//! in durable mode, short critical sections. Every mutation that spans the
//! record row and its index rows happens inside one transaction opened by
//! the ingestion pipeline.

use rusqlite::{Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, Once};

use crate::error::{MemoryError, Result};
use crate::types::{RawRecord, RecordId, StoredText};

/// Current schema version, recorded in the flags table.
const SCHEMA_VERSION: &str = "1";

static FTS_DEGRADED_LOG: Once = Once::new();

pub struct Database {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
    fts_enabled: bool,
}

impl Database {
    /// Open (or create) the store. `tokenize` is the full FTS5 tokenizer
    /// spec, e.g. `porter` or `unicode61 remove_diacritics 2`.
    pub fn open(path: Option<&Path>, tokenize: &str) -> Result<Self> {
        let conn = match path {
            Some(p) => Connection::open(p)?,
            None => Connection::open_in_memory()?,
        };

        if path.is_some() {
            // WAL gives readers a consistent snapshot while the writer runs.
            let _mode: String =
                conn.query_row("PRAGMA journal_mode=WAL", [], |r| r.get(0))?;
            conn.execute_batch("PRAGMA synchronous=NORMAL;")?;
        }
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS records (
                 id       INTEGER PRIMARY KEY,
                 kind     TEXT NOT NULL,
                 key      TEXT NOT NULL,
                 value    TEXT NOT NULL,
                 summary  TEXT,
                 ts       TEXT NOT NULL,
                 tags     TEXT NOT NULL DEFAULT '[]',
                 metadata TEXT NOT NULL DEFAULT '{}',
                 UNIQUE (kind, key)
             );
             CREATE TABLE IF NOT EXISTS embeddings (
                 embedding_id INTEGER PRIMARY KEY,
                 memory_id    INTEGER NOT NULL REFERENCES records(id) ON DELETE CASCADE,
                 source       TEXT NOT NULL,
                 provider     TEXT NOT NULL,
                 model        TEXT NOT NULL,
                 dim          INTEGER NOT NULL,
                 vec          BLOB NOT NULL,
                 norm         REAL NOT NULL
             );
             CREATE INDEX IF NOT EXISTS embeddings_by_record ON embeddings(memory_id);
             CREATE TABLE IF NOT EXISTS consent (
                 memory_id  INTEGER PRIMARY KEY REFERENCES records(id) ON DELETE CASCADE,
                 granted_at TEXT NOT NULL
             );
             CREATE TABLE IF NOT EXISTS flags (
                 name  TEXT PRIMARY KEY,
                 value TEXT NOT NULL
             );",
        )?;

        // Probe FTS5 once: a build without the extension degrades the FTS
        // channel to empty rather than failing the store.
        let fts_sql = format!(
            "CREATE VIRTUAL TABLE IF NOT EXISTS memory_fts USING fts5(
                 content, kind UNINDEXED, tokenize='{}'
             );",
            tokenize.replace('\'', "''")
        );
        let fts_enabled = match conn.execute_batch(&fts_sql) {
            Ok(()) => true,
            Err(e) => {
                FTS_DEGRADED_LOG.call_once(|| {
                    tracing::warn!(error = %e, "FTS5 unavailable; full-text channel degraded to empty");
                });
                false
            }
        };

        let db = Self { conn: Mutex::new(conn), path: path.map(Path::to_path_buf), fts_enabled };
        db.set_flag("schema_version", SCHEMA_VERSION)?;
        Ok(db)
    }

    pub fn fts_enabled(&self) -> bool {
        self.fts_enabled
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Exclusive connection handle. Transactions are opened on this guard;
    /// the mutex is what makes the store single-writer.
    pub(crate) fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().expect("record store lock")
    }

    // -----------------------------------------------------------------------
    // Record reads
    // -----------------------------------------------------------------------

    pub fn record_by_id(&self, id: RecordId) -> Result<Option<RawRecord>> {
        let conn = self.conn();
        record_by_id(&conn, id)
    }

    pub fn record_id_for_slot(&self, kind: &str, key: &str) -> Result<Option<RecordId>> {
        let conn = self.conn();
        record_id_for_slot(&conn, kind, key)
    }

    pub fn record_by_slot(&self, kind: &str, key: &str) -> Result<Option<RawRecord>> {
        let conn = self.conn();
        let id = match record_id_for_slot(&conn, kind, key)? {
            Some(id) => id,
            None => return Ok(None),
        };
        record_by_id(&conn, id)
    }

    pub fn record_count(&self) -> Result<i64> {
        let conn = self.conn();
        Ok(conn.query_row("SELECT COUNT(*) FROM records", [], |r| r.get(0))?)
    }

    // -----------------------------------------------------------------------
    // Flags
    // -----------------------------------------------------------------------

    pub fn get_flag(&self, name: &str) -> Result<Option<String>> {
        let conn = self.conn();
        Ok(conn
            .query_row("SELECT value FROM flags WHERE name = ?1", [name], |r| r.get(0))
            .optional()?)
    }

    pub fn set_flag(&self, name: &str, value: &str) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO flags (name, value) VALUES (?1, ?2)
             ON CONFLICT(name) DO UPDATE SET value = excluded.value",
            [name, value],
        )?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Maintenance
    // -----------------------------------------------------------------------

    /// Startup migration pass: FTS row identity must mirror the record
    /// table. Returns true when orphans were found (the store then rebuilds
    /// the index from decrypted record content).
    pub fn verify_fts_identity(&self) -> Result<bool> {
        if !self.fts_enabled {
            return Ok(false);
        }
        let conn = self.conn();
        let orphans: i64 = conn.query_row(
            "SELECT COUNT(*) FROM memory_fts WHERE rowid NOT IN (SELECT id FROM records)",
            [],
            |r| r.get(0),
        )?;
        if orphans > 0 {
            conn.execute(
                "DELETE FROM memory_fts WHERE rowid NOT IN (SELECT id FROM records)",
                [],
            )?;
        }
        Ok(orphans > 0)
    }

    /// Weekly maintenance: merge FTS segments and checkpoint the WAL.
    pub fn maintenance(&self) -> Result<()> {
        let conn = self.conn();
        if self.fts_enabled {
            conn.execute("INSERT INTO memory_fts(memory_fts) VALUES('optimize')", [])
                .map_err(|e| MemoryError::Index(e.to_string()))?;
        }
        if self.path.is_some() {
            conn.execute_batch("PRAGMA wal_checkpoint(PASSIVE);")?;
        }
        Ok(())
    }

    /// Clean shutdown: truncate the auxiliary journal files.
    pub fn close(&self) -> Result<()> {
        if self.path.is_some() {
            let conn = self.conn();
            conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Row mapping (shared with transaction code in the pipeline)
// ---------------------------------------------------------------------------

pub(crate) fn record_by_id(conn: &Connection, id: RecordId) -> Result<Option<RawRecord>> {
    conn.query_row(
        "SELECT id, kind, key, value, summary, ts, tags, metadata FROM records WHERE id = ?1",
        [id],
        map_record,
    )
    .optional()
    .map_err(Into::into)
}

pub(crate) fn record_id_for_slot(
    conn: &Connection,
    kind: &str,
    key: &str,
) -> Result<Option<RecordId>> {
    conn.query_row(
        "SELECT id FROM records WHERE kind = ?1 AND key = ?2",
        [kind, key],
        |r| r.get(0),
    )
    .optional()
    .map_err(Into::into)
}

pub(crate) fn map_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRecord> {
    let value: String = row.get(3)?;
    let summary: Option<String> = row.get(4)?;
    let tags_json: String = row.get(6)?;
    let metadata_json: String = row.get(7)?;
    Ok(RawRecord {
        id: row.get(0)?,
        kind: row.get(1)?,
        key: row.get(2)?,
        value: StoredText::from_stored(value),
        summary: summary.map(StoredText::from_stored),
        ts: row.get(5)?,
        tags: serde_json::from_str(&tags_json).unwrap_or_default(),
        metadata: serde_json::from_str(&metadata_json)
            .unwrap_or(serde_json::Value::Null),
    })
}
