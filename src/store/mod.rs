mod schema;

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use rusqlite::{params, Connection, OpenFlags};
use tracing::debug;

use crate::engine::sanitize::sanitize_query;
use crate::error::{Error, Result};

/// A single-file store holding chunks, their FTS projection, and their
/// embeddings, kept in lockstep by write-time cascades.
pub struct SearchStore {
    conn: Connection,
    path: PathBuf,
    dimension: usize,
}

/// One chunk to be written, as produced by the index pipeline.
#[derive(Debug, Clone)]
pub struct ChunkInsert {
    pub source: String,
    pub chunk_index: u32,
    pub content: String,
    pub embedding: Vec<f32>,
    pub metadata: HashMap<String, String>,
}

/// A chunk row as read back from the store.
#[derive(Debug, Clone)]
pub struct ChunkRow {
    pub id: i64,
    pub source: String,
    pub chunk_index: u32,
    pub content: String,
    pub metadata: HashMap<String, String>,
}

/// A BM25 match with its 1-based rank; rank 1 is the most relevant.
#[derive(Debug, Clone)]
pub struct Bm25Match {
    pub chunk: ChunkRow,
    pub rank: u32,
    pub score: f64,
}

/// A vector match with its 1-based rank; distance is cosine distance,
/// non-negative, lower is better.
#[derive(Debug, Clone)]
pub struct VectorMatch {
    pub chunk: ChunkRow,
    pub rank: u32,
    pub distance: f64,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SourceCount {
    pub source: String,
    pub chunks: u64,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct StoreStats {
    pub chunk_count: u64,
    pub source_count: u64,
    pub bytes: u64,
    pub top_sources: Vec<SourceCount>,
}

impl SearchStore {
    /// Open a store, creating the file and schema if needed.
    ///
    /// The first creation pins `dimension` for the lifetime of the store;
    /// reopening with a different dimension fails with `DimensionMismatch`.
    pub fn create(path: &Path, dimension: usize) -> Result<Self> {
        if dimension == 0 {
            return Err(Error::InvalidArgument(
                "embedding dimension must be positive".to_string(),
            ));
        }
        let conn = Connection::open(path)?;
        schema::run_migrations(&conn, dimension)?;
        Ok(Self {
            conn,
            path: path.to_path_buf(),
            dimension,
        })
    }

    /// Open an existing store, reading its pinned dimension.
    ///
    /// Fails with `StoreUnavailable` when the file is missing or is not a
    /// fastsearch store.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|e| Error::StoreUnavailable {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

        let dimension = schema::stored_dimension(&conn)?.ok_or_else(|| Error::StoreUnavailable {
            path: path.display().to_string(),
            reason: "missing store metadata".to_string(),
        })?;

        schema::run_migrations(&conn, dimension)?;
        Ok(Self {
            conn,
            path: path.to_path_buf(),
            dimension,
        })
    }

    /// The embedding dimension this store was created with.
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    // ------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------

    /// Insert one chunk with its embedding; all three tables are written in
    /// a single transaction. Returns the assigned id.
    pub fn insert(
        &mut self,
        source: &str,
        chunk_index: u32,
        content: &str,
        embedding: &[f32],
        metadata: &HashMap<String, String>,
    ) -> Result<i64> {
        let item = ChunkInsert {
            source: source.to_string(),
            chunk_index,
            content: content.to_string(),
            embedding: embedding.to_vec(),
            metadata: metadata.clone(),
        };
        let ids = self.insert_batch(std::slice::from_ref(&item))?;
        Ok(ids[0])
    }

    /// Insert a batch of chunks in one transaction; either every item is
    /// written or none are.
    pub fn insert_batch(&mut self, items: &[ChunkInsert]) -> Result<Vec<i64>> {
        let dimension = self.dimension;
        let tx = self.conn.transaction()?;
        let ids = write_items(&tx, items, dimension)?;
        tx.commit()?;
        Ok(ids)
    }

    /// Replace every chunk of `source` with `items`, atomically.
    ///
    /// On any failure the previous contents of the source are untouched.
    pub fn replace_source(&mut self, source: &str, items: &[ChunkInsert]) -> Result<Vec<i64>> {
        let dimension = self.dimension;
        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM chunks WHERE source = ?1", [source])?;
        let ids = write_items(&tx, items, dimension)?;
        tx.commit()?;
        Ok(ids)
    }

    /// Delete every chunk whose source is `target`. When no source matches
    /// exactly, `target` is treated as a suffix and must name exactly one
    /// source.
    ///
    /// A suffix matching several distinct sources deletes nothing and fails
    /// with `AmbiguousSource` listing the candidates.
    pub fn delete_source(&mut self, target: &str) -> Result<usize> {
        if target.trim().is_empty() {
            return Err(Error::InvalidArgument(
                "source must not be empty".to_string(),
            ));
        }

        let exact: u64 = self.conn.query_row(
            "SELECT COUNT(*) FROM chunks WHERE source = ?1",
            [target],
            |row| row.get(0),
        )?;

        let victim = if exact > 0 {
            target.to_string()
        } else {
            let mut stmt = self
                .conn
                .prepare("SELECT DISTINCT source FROM chunks ORDER BY source")?;
            let sources = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            let mut candidates: Vec<String> = sources
                .into_iter()
                .filter(|s| s.ends_with(target))
                .collect();

            match candidates.len() {
                0 => return Ok(0),
                1 => candidates.remove(0),
                _ => {
                    return Err(Error::AmbiguousSource {
                        suffix: target.to_string(),
                        candidates,
                    })
                }
            }
        };

        let tx = self.conn.transaction()?;
        let deleted = tx.execute("DELETE FROM chunks WHERE source = ?1", [&victim])?;
        tx.commit()?;
        debug!(source = %victim, deleted, "deleted source");
        Ok(deleted)
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// BM25 full-text search. The query is sanitized for FTS operator
    /// syntax; an empty sanitized query yields zero results.
    pub fn search_bm25(&self, query: &str, limit: usize) -> Result<Vec<Bm25Match>> {
        let sanitized = sanitize_query(query);
        if sanitized.is_empty() {
            return Ok(Vec::new());
        }

        let mut stmt = self.conn.prepare(
            "SELECT d.id, d.source, d.chunk_index, d.content, d.metadata,
                    bm25(chunks_fts) AS score
             FROM chunks_fts f
             JOIN chunks d ON f.rowid = d.id
             WHERE chunks_fts MATCH ?1
             ORDER BY score
             LIMIT ?2",
        )?;

        let rows = stmt.query_map(params![sanitized, limit as i64], |row| {
            Ok((read_chunk_row(row)?, row.get::<_, f64>(5)?))
        })?;

        let mut matches = Vec::new();
        for (i, row) in rows.enumerate() {
            let (chunk, score) = row?;
            matches.push(Bm25Match {
                chunk,
                rank: i as u32 + 1,
                score,
            });
        }
        Ok(matches)
    }

    /// k-nearest-neighbor scan by cosine distance over the vector table.
    pub fn search_vector(&self, embedding: &[f32], limit: usize) -> Result<Vec<VectorMatch>> {
        if embedding.len() != self.dimension {
            return Err(Error::DimensionMismatch {
                expected: self.dimension,
                got: embedding.len(),
            });
        }

        let mut stmt = self.conn.prepare(
            "SELECT v.id, v.embedding, d.source, d.chunk_index, d.content, d.metadata
             FROM chunks_vec v
             JOIN chunks d ON v.id = d.id",
        )?;

        let rows = stmt.query_map([], |row| {
            let id: i64 = row.get(0)?;
            let blob: Vec<u8> = row.get(1)?;
            let source: String = row.get(2)?;
            let chunk_index: i64 = row.get(3)?;
            let content: String = row.get(4)?;
            let metadata: String = row.get(5)?;
            Ok((id, blob, source, chunk_index, content, metadata))
        })?;

        let mut scored: Vec<(f64, ChunkRow)> = Vec::new();
        for row in rows {
            let (id, blob, source, chunk_index, content, metadata) = row?;
            let stored = decode_embedding(&blob);
            if stored.len() != self.dimension {
                continue;
            }
            let distance = cosine_distance(embedding, &stored);
            scored.push((
                distance,
                ChunkRow {
                    id,
                    source,
                    chunk_index: chunk_index as u32,
                    content,
                    metadata: parse_metadata(&metadata),
                },
            ));
        }

        scored.sort_by(|a, b| {
            a.0.partial_cmp(&b.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.1.id.cmp(&b.1.id))
        });
        scored.truncate(limit);

        Ok(scored
            .into_iter()
            .enumerate()
            .map(|(i, (distance, chunk))| VectorMatch {
                chunk,
                rank: i as u32 + 1,
                distance,
            })
            .collect())
    }

    /// Store statistics: counts, file size, and the ten largest sources.
    pub fn stats(&self) -> Result<StoreStats> {
        let chunk_count: u64 =
            self.conn
                .query_row("SELECT COUNT(*) FROM chunks", [], |row| row.get(0))?;
        let source_count: u64 =
            self.conn
                .query_row("SELECT COUNT(DISTINCT source) FROM chunks", [], |row| {
                    row.get(0)
                })?;

        let mut stmt = self.conn.prepare(
            "SELECT source, COUNT(*) AS chunks
             FROM chunks GROUP BY source
             ORDER BY chunks DESC, source
             LIMIT 10",
        )?;
        let top_sources = stmt
            .query_map([], |row| {
                Ok(SourceCount {
                    source: row.get(0)?,
                    chunks: row.get(1)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let bytes = std::fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0);

        Ok(StoreStats {
            chunk_count,
            source_count,
            bytes,
            top_sources,
        })
    }
}

impl std::fmt::Debug for SearchStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SearchStore")
            .field("path", &self.path)
            .field("dimension", &self.dimension)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn write_items(
    tx: &rusqlite::Transaction<'_>,
    items: &[ChunkInsert],
    dimension: usize,
) -> Result<Vec<i64>> {
    let mut ids = Vec::with_capacity(items.len());
    for item in items {
        if item.content.trim().is_empty() {
            return Err(Error::InvalidArgument(
                "chunk content must not be empty".to_string(),
            ));
        }
        if item.embedding.len() != dimension {
            return Err(Error::DimensionMismatch {
                expected: dimension,
                got: item.embedding.len(),
            });
        }

        tx.execute(
            "INSERT INTO chunks (source, chunk_index, content, metadata)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                item.source,
                item.chunk_index as i64,
                item.content,
                serde_json::to_string(&item.metadata)?,
            ],
        )?;
        let id = tx.last_insert_rowid();

        tx.execute(
            "INSERT INTO chunks_vec (id, embedding) VALUES (?1, ?2)",
            params![id, encode_embedding(&item.embedding)],
        )?;

        ids.push(id);
    }
    Ok(ids)
}

fn read_chunk_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ChunkRow> {
    let metadata: String = row.get(4)?;
    Ok(ChunkRow {
        id: row.get(0)?,
        source: row.get(1)?,
        chunk_index: row.get::<_, i64>(2)? as u32,
        content: row.get(3)?,
        metadata: parse_metadata(&metadata),
    })
}

fn parse_metadata(raw: &str) -> HashMap<String, String> {
    serde_json::from_str(raw).unwrap_or_default()
}

/// Little-endian f32 encoding for embedding blobs.
pub fn encode_embedding(embedding: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(embedding.len() * 4);
    for v in embedding {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

pub fn decode_embedding(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

/// Cosine distance: `1 - cos(a, b)`, clamped to be non-negative. Vectors
/// with zero norm are maximally distant.
fn cosine_distance(a: &[f32], b: &[f32]) -> f64 {
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += *x as f64 * *y as f64;
        norm_a += *x as f64 * *x as f64;
        norm_b += *y as f64 * *y as f64;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 1.0;
    }
    (1.0 - dot / (norm_a.sqrt() * norm_b.sqrt())).max(0.0)
}
