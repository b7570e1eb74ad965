use rusqlite::Connection;
use tracing::debug;

use crate::error::{Error, Result};

/// Current schema version.  Increment when adding new migrations.
const SCHEMA_VERSION: u32 = 1;

/// Apply all pending migrations to `conn` and pin the embedding dimension.
///
/// Migrations are idempotent — tables are created with `IF NOT EXISTS` and
/// the `meta` table tracks which version has been applied. The dimension is
/// recorded on first use; opening a store created with a different
/// dimension fails with `DimensionMismatch`.
pub fn run_migrations(conn: &Connection, dimension: usize) -> Result<()> {
    // WAL mode lets search legs read concurrently with a writer.
    conn.execute_batch("PRAGMA journal_mode = WAL;")?;
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;

    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS meta (
            key   TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );",
    )?;

    verify_dimension(conn, dimension)?;

    let current_version = get_schema_version(conn);
    if current_version >= SCHEMA_VERSION {
        debug!(version = current_version, "store schema up to date");
        return Ok(());
    }

    if current_version < 1 {
        migrate_v1(conn)?;
    }

    set_meta(conn, "schema_version", &SCHEMA_VERSION.to_string())?;
    debug!(version = SCHEMA_VERSION, "store schema migrated");
    Ok(())
}

/// Read the dimension recorded in an existing store, if any.
pub fn stored_dimension(conn: &Connection) -> Result<Option<usize>> {
    let has_meta: bool = conn
        .query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'meta'",
            [],
            |row| row.get::<_, i64>(0),
        )
        .map(|n| n > 0)?;
    if !has_meta {
        return Ok(None);
    }

    match get_meta(conn, "embedding_dim") {
        Some(v) => {
            let dim = v
                .parse::<usize>()
                .map_err(|_| Error::Internal(format!("corrupt embedding_dim value: {v}")))?;
            Ok(Some(dim))
        }
        None => Ok(None),
    }
}

fn verify_dimension(conn: &Connection, dimension: usize) -> Result<()> {
    match stored_dimension(conn)? {
        Some(existing) if existing != dimension => Err(Error::DimensionMismatch {
            expected: existing,
            got: dimension,
        }),
        Some(_) => Ok(()),
        None => set_meta(conn, "embedding_dim", &dimension.to_string()),
    }
}

// ---------------------------------------------------------------------------
// v1 — initial tables
// ---------------------------------------------------------------------------

fn migrate_v1(conn: &Connection) -> Result<()> {
    // ------------------------------------------------------------------
    // chunks — the primary table. AUTOINCREMENT keeps ids monotonic and
    // never reused, even across deletes.
    // ------------------------------------------------------------------
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS chunks (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            source      TEXT    NOT NULL,
            chunk_index INTEGER NOT NULL,
            content     TEXT    NOT NULL,
            metadata    TEXT    NOT NULL DEFAULT '{}',
            created_at  TEXT    NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
        );",
    )?;

    conn.execute_batch("CREATE INDEX IF NOT EXISTS idx_chunks_source ON chunks(source);")?;

    // ------------------------------------------------------------------
    // chunks_fts — FTS5 virtual table for BM25 full-text search.
    // ------------------------------------------------------------------
    conn.execute_batch(
        "CREATE VIRTUAL TABLE IF NOT EXISTS chunks_fts USING fts5(
            content,
            content='chunks',
            content_rowid='id',
            tokenize='porter unicode61'
        );",
    )?;

    // Triggers keep the FTS index in sync with the chunks table.
    conn.execute_batch(
        "CREATE TRIGGER IF NOT EXISTS chunks_ai AFTER INSERT ON chunks BEGIN
            INSERT INTO chunks_fts(rowid, content) VALUES (new.id, new.content);
        END;",
    )?;
    conn.execute_batch(
        "CREATE TRIGGER IF NOT EXISTS chunks_ad AFTER DELETE ON chunks BEGIN
            INSERT INTO chunks_fts(chunks_fts, rowid, content) VALUES ('delete', old.id, old.content);
        END;",
    )?;
    conn.execute_batch(
        "CREATE TRIGGER IF NOT EXISTS chunks_au AFTER UPDATE ON chunks BEGIN
            INSERT INTO chunks_fts(chunks_fts, rowid, content) VALUES ('delete', old.id, old.content);
            INSERT INTO chunks_fts(rowid, content) VALUES (new.id, new.content);
        END;",
    )?;

    // ------------------------------------------------------------------
    // chunks_vec — embeddings as little-endian f32 blobs keyed by chunk
    // id. Deleting a chunk cascades here via trigger; inserts are written
    // explicitly in the same transaction as the chunk row.
    // ------------------------------------------------------------------
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS chunks_vec (
            id        INTEGER PRIMARY KEY,
            embedding BLOB NOT NULL
        );",
    )?;

    conn.execute_batch(
        "CREATE TRIGGER IF NOT EXISTS chunks_vec_ad AFTER DELETE ON chunks BEGIN
            DELETE FROM chunks_vec WHERE id = old.id;
        END;",
    )?;

    Ok(())
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn get_schema_version(conn: &Connection) -> u32 {
    get_meta(conn, "schema_version")
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(0)
}

fn get_meta(conn: &Connection, key: &str) -> Option<String> {
    conn.query_row("SELECT value FROM meta WHERE key = ?1", [key], |row| {
        row.get(0)
    })
    .ok()
}

fn set_meta(conn: &Connection, key: &str, value: &str) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO meta (key, value) VALUES (?1, ?2)",
        [key, value],
    )?;
    Ok(())
}
