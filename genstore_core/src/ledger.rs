//! Metadata ledger backed by SQLite.
//!
//! Holds object refcounts and attributes, committed generations with their
//! root sets, and the temporary pins of in-flight drafts. The database runs
//! in WAL mode with `synchronous=FULL`, so a committed transaction survives a
//! crash and an uncommitted one leaves nothing behind.
//!
//! Row-level helpers take a `&Connection` so they compose inside a caller's
//! transaction (a `Transaction` derefs to `Connection`).

use crate::error::{Error, Result};
use crate::hash::Hash;
use crate::object::{ObjectKind, ObjectMetadata};
use crate::store::StoreStats;
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSqlOutput, ValueRef};
use rusqlite::{Connection, OptionalExtension, ToSql, Transaction, TransactionBehavior, params};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

const SCHEMA_VERSION: u32 = 1;
const META_KEY_SCHEMA_VERSION: &str = "schema_version";

/// Live references to an object: committed roots plus outstanding pins.
const TRUE_REFCOUNT: &str = "(SELECT COUNT(*) FROM generation_roots r WHERE r.hash = objects.hash) \
     + COALESCE((SELECT SUM(p.count) FROM pins p WHERE p.hash = objects.hash), 0)";

impl ToSql for Hash {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.to_hex()))
    }
}

impl FromSql for Hash {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let text = value.as_str()?;
        Hash::from_hex(text).map_err(|e| FromSqlError::Other(Box::new(e)))
    }
}

impl ToSql for ObjectKind {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for ObjectKind {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let text = value.as_str()?;
        ObjectKind::try_from(text).map_err(|e| FromSqlError::Other(Box::new(e)))
    }
}

/// Attributes of an object about to be inserted.
#[derive(Debug, Clone)]
pub struct NewObject {
    pub hash: Hash,
    pub size: u64,
    pub kind: ObjectKind,
    pub path: String,
    pub created_at: i64,
}

/// A committed generation without its root set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationRow {
    pub id: u64,
    pub created_at: i64,
    pub fingerprint: Hash,
    pub manifest_hash: Option<Hash>,
    pub pinned: bool,
}

/// A committed generation with its ordered root set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationRecord {
    pub row: GenerationRow,
    pub roots: Vec<Hash>,
}

/// An in-flight build registered in the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DraftRow {
    pub token: String,
    pub pid: u32,
    pub started_at: i64,
}

/// Handle to the ledger database. Cheap to clone; every operation opens its
/// own connection.
#[derive(Debug, Clone)]
pub struct Ledger {
    path: PathBuf,
    busy_timeout: Duration,
}

impl Ledger {
    /// Open (creating if needed) the ledger at `path` and apply the schema.
    pub fn open(path: impl Into<PathBuf>, busy_timeout: Duration) -> Result<Self> {
        let ledger = Self {
            path: path.into(),
            busy_timeout,
        };
        let mut conn = ledger.connection()?;
        init_schema(&conn)?;
        ensure_meta(&mut conn)?;
        Ok(ledger)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn connection(&self) -> Result<Connection> {
        let conn = Connection::open(&self.path)?;
        conn.busy_timeout(self.busy_timeout)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
            row.get::<_, String>(0)
        })?;
        conn.pragma_update(None, "synchronous", "FULL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Ok(conn)
    }

    /// Run `f` inside a write transaction taken up front.
    ///
    /// Immediate transactions serialize writers, so a check followed by an
    /// update inside `f` cannot interleave with another writer.
    pub fn with_immediate_tx<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T>,
    {
        let mut conn = self.connection()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let result = f(&tx)?;
        tx.commit()?;
        Ok(result)
    }

    /// Run `f` inside one read transaction.
    ///
    /// Under WAL every read in `f` observes the same committed state, no
    /// matter what other connections commit meanwhile.
    pub fn with_snapshot<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T>,
    {
        let mut conn = self.connection()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Deferred)?;
        // Start the read now so the snapshot does not depend on f's first query.
        tx.query_row("SELECT COUNT(*) FROM generations", [], |row| {
            row.get::<_, i64>(0)
        })?;
        let result = f(&tx)?;
        tx.rollback()?;
        Ok(result)
    }

    pub fn get_object(&self, hash: &Hash) -> Result<Option<ObjectMetadata>> {
        let conn = self.connection()?;
        get_object(&conn, hash)
    }

    /// Atomically add `delta` to an object's refcount, clamped at zero.
    pub fn increment(&self, hash: &Hash, delta: i64) -> Result<i64> {
        self.with_immediate_tx(|tx| increment(tx, hash, delta))
    }

    pub fn get_generation(&self, id: u64) -> Result<Option<GenerationRecord>> {
        let conn = self.connection()?;
        get_generation(&conn, id)
    }

    pub fn list_generations(&self) -> Result<Vec<GenerationRow>> {
        let conn = self.connection()?;
        list_generations(&conn)
    }

    /// Union of the root sets of `ids`, read in one snapshot.
    pub fn read_all_roots(&self, ids: &[u64]) -> Result<HashSet<Hash>> {
        self.with_snapshot(|tx| read_all_roots(tx, ids))
    }

    /// Rewrite every refcount as committed roots plus outstanding pins.
    pub fn recompute_refcounts(&self) -> Result<usize> {
        self.with_immediate_tx(|tx| recompute_refcounts(tx))
    }
}

fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS objects (
            hash TEXT PRIMARY KEY,
            refcount INTEGER NOT NULL DEFAULT 0 CHECK (refcount >= 0),
            size INTEGER NOT NULL,
            kind TEXT NOT NULL,
            path TEXT NOT NULL,
            created_at INTEGER NOT NULL
        );
        CREATE TABLE IF NOT EXISTS generations (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            created_at INTEGER NOT NULL,
            fingerprint TEXT NOT NULL,
            manifest_hash TEXT,
            pinned INTEGER NOT NULL DEFAULT 0
        );
        CREATE TABLE IF NOT EXISTS generation_roots (
            generation_id INTEGER NOT NULL REFERENCES generations(id) ON DELETE CASCADE,
            position INTEGER NOT NULL,
            hash TEXT NOT NULL,
            PRIMARY KEY (generation_id, position),
            UNIQUE (generation_id, hash)
        );
        CREATE INDEX IF NOT EXISTS generation_roots_by_hash ON generation_roots(hash);
        CREATE TABLE IF NOT EXISTS drafts (
            token TEXT PRIMARY KEY,
            pid INTEGER NOT NULL,
            started_at INTEGER NOT NULL
        );
        CREATE TABLE IF NOT EXISTS pins (
            token TEXT NOT NULL REFERENCES drafts(token) ON DELETE CASCADE,
            hash TEXT NOT NULL,
            count INTEGER NOT NULL CHECK (count > 0),
            PRIMARY KEY (token, hash)
        );
        CREATE INDEX IF NOT EXISTS pins_by_hash ON pins(hash);
        "#,
    )?;
    Ok(())
}

fn ensure_meta(conn: &mut Connection) -> Result<()> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    tx.execute(
        "INSERT OR IGNORE INTO meta(key, value) VALUES (?1, ?2)",
        params![META_KEY_SCHEMA_VERSION, SCHEMA_VERSION.to_string()],
    )?;
    let found: String = tx.query_row(
        "SELECT value FROM meta WHERE key = ?1",
        params![META_KEY_SCHEMA_VERSION],
        |row| row.get(0),
    )?;
    tx.commit()?;

    if found != SCHEMA_VERSION.to_string() {
        return Err(Error::invalid_config(format!(
            "Unsupported ledger schema version {} (expected {})",
            found, SCHEMA_VERSION
        )));
    }
    Ok(())
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn object_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ObjectMetadata> {
    Ok(ObjectMetadata {
        hash: row.get(0)?,
        refcount: row.get(1)?,
        size: row.get::<_, i64>(2)? as u64,
        kind: row.get(3)?,
        path: row.get(4)?,
        created_at: row.get(5)?,
    })
}

fn generation_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<GenerationRow> {
    Ok(GenerationRow {
        id: row.get::<_, i64>(0)? as u64,
        created_at: row.get(1)?,
        fingerprint: row.get(2)?,
        manifest_hash: row.get(3)?,
        pinned: row.get(4)?,
    })
}

// ---------------------------------------------------------------------------
// Objects
// ---------------------------------------------------------------------------

pub fn get_object(conn: &Connection, hash: &Hash) -> Result<Option<ObjectMetadata>> {
    let row = conn
        .query_row(
            "SELECT hash, refcount, size, kind, path, created_at FROM objects WHERE hash = ?1",
            params![hash],
            object_from_row,
        )
        .optional()?;
    Ok(row)
}

pub fn object_exists(conn: &Connection, hash: &Hash) -> Result<bool> {
    let found = conn
        .query_row(
            "SELECT 1 FROM objects WHERE hash = ?1",
            params![hash],
            |_| Ok(()),
        )
        .optional()?;
    Ok(found.is_some())
}

/// Insert a new object row, or add `refcount` to the existing one.
pub fn upsert_object(conn: &Connection, object: &NewObject, refcount: i64) -> Result<()> {
    conn.execute(
        "INSERT INTO objects (hash, refcount, size, kind, path, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
         ON CONFLICT(hash) DO UPDATE SET refcount = refcount + excluded.refcount",
        params![
            object.hash,
            refcount,
            to_i64(object.size),
            object.kind,
            object.path,
            object.created_at
        ],
    )?;
    Ok(())
}

/// Add `delta` to a refcount in one statement, clamping at zero.
pub fn increment(conn: &Connection, hash: &Hash, delta: i64) -> Result<i64> {
    let updated = conn
        .query_row(
            "UPDATE objects SET refcount = MAX(refcount + ?2, 0) WHERE hash = ?1 RETURNING refcount",
            params![hash, delta],
            |row| row.get(0),
        )
        .optional()?;
    updated.ok_or_else(|| Error::object_not_found(hash.to_hex()))
}

pub fn delete_object(conn: &Connection, hash: &Hash) -> Result<bool> {
    let deleted = conn.execute("DELETE FROM objects WHERE hash = ?1", params![hash])?;
    Ok(deleted > 0)
}

pub fn all_objects(conn: &Connection) -> Result<Vec<ObjectMetadata>> {
    let mut stmt =
        conn.prepare("SELECT hash, refcount, size, kind, path, created_at FROM objects")?;
    let rows = stmt
        .query_map([], object_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

/// Object and generation totals, with the bytes saved by storing each
/// multiply-referenced object once.
pub fn store_stats(conn: &Connection) -> Result<StoreStats> {
    let mut stats = conn.query_row(
        "SELECT COUNT(*), \
                COALESCE(SUM(kind = 'file'), 0), \
                COALESCE(SUM(kind = 'tree'), 0), \
                COALESCE(SUM(kind = 'symlink'), 0), \
                COALESCE(SUM(size), 0), \
                COALESCE(SUM(size * MAX(refcount - 1, 0)), 0) \
         FROM objects",
        [],
        |row| {
            Ok(StoreStats {
                objects: row.get::<_, i64>(0)? as u64,
                files: row.get::<_, i64>(1)? as u64,
                trees: row.get::<_, i64>(2)? as u64,
                symlinks: row.get::<_, i64>(3)? as u64,
                total_bytes: row.get::<_, i64>(4)? as u64,
                dedup_savings_bytes: row.get::<_, i64>(5)? as u64,
                ..StoreStats::default()
            })
        },
    )?;
    stats.generations =
        conn.query_row("SELECT COUNT(*) FROM generations", [], |row| row.get::<_, i64>(0))? as u64;

    let referenced = stats.total_bytes + stats.dedup_savings_bytes;
    if referenced > 0 {
        stats.dedup_ratio = stats.dedup_savings_bytes as f64 / referenced as f64;
    }
    Ok(stats)
}

/// True when a committed generation roots this hash.
pub fn is_rooted(conn: &Connection, hash: &Hash) -> Result<bool> {
    let found = conn
        .query_row(
            "SELECT 1 FROM generation_roots WHERE hash = ?1 LIMIT 1",
            params![hash],
            |_| Ok(()),
        )
        .optional()?;
    Ok(found.is_some())
}

pub fn recompute_refcounts(conn: &Connection) -> Result<usize> {
    let sql = format!(
        "UPDATE objects SET refcount = {expr} WHERE refcount <> {expr}",
        expr = TRUE_REFCOUNT
    );
    let changed = conn.execute(&sql, [])?;
    if changed > 0 {
        debug!(changed, "recomputed refcounts");
    }
    Ok(changed)
}

// ---------------------------------------------------------------------------
// Generations
// ---------------------------------------------------------------------------

/// Insert a generation and its root set, adding one reference per distinct
/// root. Returns the new id.
pub fn insert_generation(
    conn: &Connection,
    created_at: i64,
    fingerprint: &Hash,
    manifest_hash: Option<&Hash>,
    roots: &[Hash],
) -> Result<u64> {
    conn.execute(
        "INSERT INTO generations (created_at, fingerprint, manifest_hash, pinned) \
         VALUES (?1, ?2, ?3, 0)",
        params![created_at, fingerprint, manifest_hash],
    )?;
    let id = conn.last_insert_rowid();

    let mut seen = HashSet::with_capacity(roots.len());
    let mut insert = conn.prepare(
        "INSERT INTO generation_roots (generation_id, position, hash) VALUES (?1, ?2, ?3)",
    )?;
    let mut position: i64 = 0;
    for root in roots {
        if !seen.insert(*root) {
            continue;
        }
        if !object_exists(conn, root)? {
            return Err(Error::object_not_found(root.to_hex()));
        }
        insert.execute(params![id, position, root])?;
        increment(conn, root, 1)?;
        position += 1;
    }
    Ok(id as u64)
}

pub fn get_generation(conn: &Connection, id: u64) -> Result<Option<GenerationRecord>> {
    let row = conn
        .query_row(
            "SELECT id, created_at, fingerprint, manifest_hash, pinned \
             FROM generations WHERE id = ?1",
            params![to_i64(id)],
            generation_from_row,
        )
        .optional()?;
    let Some(row) = row else {
        return Ok(None);
    };

    let mut stmt = conn.prepare(
        "SELECT hash FROM generation_roots WHERE generation_id = ?1 ORDER BY position",
    )?;
    let roots = stmt
        .query_map(params![to_i64(id)], |r| r.get(0))?
        .collect::<rusqlite::Result<Vec<Hash>>>()?;
    Ok(Some(GenerationRecord { row, roots }))
}

/// All generations, newest first.
pub fn list_generations(conn: &Connection) -> Result<Vec<GenerationRow>> {
    let mut stmt = conn.prepare(
        "SELECT id, created_at, fingerprint, manifest_hash, pinned \
         FROM generations ORDER BY id DESC",
    )?;
    let rows = stmt
        .query_map([], generation_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

pub fn set_pinned(conn: &Connection, id: u64, pinned: bool) -> Result<()> {
    let changed = conn.execute(
        "UPDATE generations SET pinned = ?2 WHERE id = ?1",
        params![to_i64(id), pinned],
    )?;
    if changed == 0 {
        return Err(Error::GenerationNotFound { id });
    }
    Ok(())
}

/// Remove a generation and release one reference from each of its roots.
pub fn delete_generation(conn: &Connection, id: u64) -> Result<Vec<Hash>> {
    let Some(record) = get_generation(conn, id)? else {
        return Err(Error::GenerationNotFound { id });
    };
    conn.execute(
        "DELETE FROM generation_roots WHERE generation_id = ?1",
        params![to_i64(id)],
    )?;
    conn.execute("DELETE FROM generations WHERE id = ?1", params![to_i64(id)])?;
    for root in &record.roots {
        // A root whose row is already gone has nothing left to release.
        match increment(conn, root, -1) {
            Ok(_) | Err(Error::ObjectNotFound { .. }) => {}
            Err(err) => return Err(err),
        }
    }
    Ok(record.roots)
}

pub fn read_all_roots(conn: &Connection, ids: &[u64]) -> Result<HashSet<Hash>> {
    let mut stmt = conn.prepare("SELECT hash FROM generation_roots WHERE generation_id = ?1")?;
    let mut live = HashSet::new();
    for &id in ids {
        let rows = stmt.query_map(params![to_i64(id)], |r| r.get::<_, Hash>(0))?;
        for hash in rows {
            live.insert(hash?);
        }
    }
    Ok(live)
}

// ---------------------------------------------------------------------------
// Drafts and pins
// ---------------------------------------------------------------------------

pub fn insert_draft(conn: &Connection, token: &str, pid: u32, started_at: i64) -> Result<()> {
    conn.execute(
        "INSERT INTO drafts (token, pid, started_at) VALUES (?1, ?2, ?3)",
        params![token, pid, started_at],
    )?;
    Ok(())
}

pub fn list_drafts(conn: &Connection) -> Result<Vec<DraftRow>> {
    let mut stmt = conn.prepare("SELECT token, pid, started_at FROM drafts ORDER BY started_at")?;
    let rows = stmt
        .query_map([], |row| {
            Ok(DraftRow {
                token: row.get(0)?,
                pid: row.get(1)?,
                started_at: row.get(2)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

/// Record one more provisional reference held by `token` on `hash`.
pub fn add_pin(conn: &Connection, token: &str, hash: &Hash) -> Result<()> {
    conn.execute(
        "INSERT INTO pins (token, hash, count) VALUES (?1, ?2, 1) \
         ON CONFLICT(token, hash) DO UPDATE SET count = count + 1",
        params![token, hash],
    )?;
    Ok(())
}

pub fn is_pinned(conn: &Connection, hash: &Hash) -> Result<bool> {
    let found = conn
        .query_row(
            "SELECT 1 FROM pins WHERE hash = ?1 LIMIT 1",
            params![hash],
            |_| Ok(()),
        )
        .optional()?;
    Ok(found.is_some())
}

pub fn pinned_hashes(conn: &Connection) -> Result<HashSet<Hash>> {
    let mut stmt = conn.prepare("SELECT DISTINCT hash FROM pins")?;
    let rows = stmt
        .query_map([], |r| r.get::<_, Hash>(0))?
        .collect::<rusqlite::Result<HashSet<_>>>()?;
    Ok(rows)
}

/// Drop a draft: release its provisional references and delete its pins.
/// Returns the number of distinct hashes it had pinned.
pub fn release_draft(conn: &Connection, token: &str) -> Result<usize> {
    let mut stmt = conn.prepare("SELECT hash, count FROM pins WHERE token = ?1")?;
    let pins = stmt
        .query_map(params![token], |r| Ok((r.get::<_, Hash>(0)?, r.get::<_, i64>(1)?)))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    drop(stmt);
    for (hash, count) in &pins {
        match increment(conn, hash, -count) {
            Ok(_) | Err(Error::ObjectNotFound { .. }) => {}
            Err(err) => return Err(err),
        }
    }
    conn.execute("DELETE FROM pins WHERE token = ?1", params![token])?;
    conn.execute("DELETE FROM drafts WHERE token = ?1", params![token])?;
    Ok(pins.len())
}
