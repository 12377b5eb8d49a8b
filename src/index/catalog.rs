//! SQLite chunk catalog with migrations
//!
//! Source of truth for an index: chunk text, metadata and embeddings. The
//! HNSW graph is rebuilt from here on open.

use crate::error::{RagError, Result};
use crate::retrieval::ContentType;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension};
use std::path::Path;

/// Database connection pool
pub type DbPool = Pool<SqliteConnectionManager>;

/// Chunk row as persisted
#[derive(Debug, Clone, PartialEq)]
pub struct StoredChunk {
    pub row_id: i64,
    pub chunk_id: String,
    pub doc_id: String,
    pub content_type: ContentType,
    pub text: String,
    pub content_hash: String,
    pub embedding: Vec<f32>,
}

/// Outcome of writing one chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted(i64),
    /// Content changed; the previous row was retired
    Replaced { old: i64, new: i64 },
    Unchanged,
}

pub struct Catalog {
    pool: DbPool,
}

impl Catalog {
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| RagError::Io {
                source: e,
                context: format!("Failed to create catalog directory: {:?}", parent),
            })?;
        }

        let manager = SqliteConnectionManager::file(db_path);
        let pool = Pool::builder()
            .max_size(8)
            .build(manager)
            .map_err(|e| RagError::Index(format!("Failed to create connection pool: {}", e)))?;

        {
            let conn = pool
                .get()
                .map_err(|e| RagError::Index(format!("Failed to get connection: {}", e)))?;
            conn.execute_batch(
                "
                PRAGMA journal_mode = WAL;
                PRAGMA synchronous = NORMAL;
                PRAGMA busy_timeout = 5000;
                ",
            )?;
        }

        let catalog = Self { pool };
        catalog.migrate()?;
        Ok(catalog)
    }

    fn get_conn(&self) -> Result<r2d2::PooledConnection<SqliteConnectionManager>> {
        self.pool
            .get()
            .map_err(|e| RagError::Index(format!("Failed to get connection: {}", e)))
    }

    fn migrate(&self) -> Result<()> {
        let conn = self.get_conn()?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS _migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL
            )",
            [],
        )?;

        let current_version: i32 = conn.query_row(
            "SELECT COALESCE(MAX(version), 0) FROM _migrations",
            [],
            |row| row.get(0),
        )?;

        for (version, migration) in MIGRATIONS.iter().enumerate() {
            let version = version as i32 + 1;

            if version > current_version {
                tracing::info!("Applying catalog migration {}", version);
                conn.execute_batch(migration)?;
                conn.execute(
                    "INSERT INTO _migrations (version, applied_at) VALUES (?1, datetime('now'))",
                    params![version],
                )?;
            }
        }

        Ok(())
    }

    /// Embedding dimension recorded when the index was created
    pub fn dimension(&self) -> Result<Option<usize>> {
        let conn = self.get_conn()?;
        let value: Option<String> = conn
            .query_row(
                "SELECT value FROM index_meta WHERE key = 'dimension'",
                [],
                |row| row.get(0),
            )
            .optional()?;

        value
            .map(|v| {
                v.parse::<usize>()
                    .map_err(|e| RagError::Index(format!("Corrupt dimension entry '{}': {}", v, e)))
            })
            .transpose()
    }

    pub fn set_dimension(&self, dimension: usize) -> Result<()> {
        let conn = self.get_conn()?;
        conn.execute(
            "INSERT INTO index_meta (key, value) VALUES ('dimension', ?1)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![dimension.to_string()],
        )?;
        Ok(())
    }

    /// Hash currently stored for `chunk_id`, if any
    pub fn content_hash(&self, chunk_id: &str) -> Result<Option<String>> {
        let conn = self.get_conn()?;
        let hash = conn
            .query_row(
                "SELECT content_hash FROM chunks WHERE chunk_id = ?1",
                params![chunk_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(hash)
    }

    /// Insert or replace a chunk keyed by `chunk_id`
    pub fn upsert(
        &self,
        chunk_id: &str,
        doc_id: &str,
        content_type: ContentType,
        text: &str,
        content_hash: &str,
        embedding: &[f32],
    ) -> Result<UpsertOutcome> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction()?;

        let existing: Option<(i64, String)> = tx
            .query_row(
                "SELECT id, content_hash FROM chunks WHERE chunk_id = ?1",
                params![chunk_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        if let Some((_, hash)) = &existing {
            if hash == content_hash {
                return Ok(UpsertOutcome::Unchanged);
            }
        }

        if let Some((old, _)) = existing {
            tx.execute("DELETE FROM chunks WHERE id = ?1", params![old])?;
        }

        tx.execute(
            "INSERT INTO chunks (chunk_id, doc_id, content_type, text, content_hash, embedding, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                chunk_id,
                doc_id,
                content_type.as_str(),
                text,
                content_hash,
                encode_vector(embedding),
                chrono::Utc::now().timestamp(),
            ],
        )?;
        let new = tx.last_insert_rowid();
        tx.commit()?;

        Ok(match existing {
            Some((old, _)) => UpsertOutcome::Replaced { old, new },
            None => UpsertOutcome::Inserted(new),
        })
    }

    /// Rows for the given ids; retired ids are skipped
    pub fn get_many(&self, row_ids: &[i64]) -> Result<Vec<StoredChunk>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, chunk_id, doc_id, content_type, text, content_hash, embedding
             FROM chunks WHERE id = ?1",
        )?;

        let mut chunks = Vec::with_capacity(row_ids.len());
        for row_id in row_ids {
            if let Some(chunk) = stmt.query_row(params![row_id], read_chunk).optional()? {
                chunks.push(chunk);
            }
        }
        Ok(chunks)
    }

    pub fn all(&self) -> Result<Vec<StoredChunk>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, chunk_id, doc_id, content_type, text, content_hash, embedding
             FROM chunks ORDER BY id",
        )?;
        let rows = stmt.query_map([], read_chunk)?;
        let chunks = rows.collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(chunks)
    }

    pub fn count(&self) -> Result<usize> {
        let conn = self.get_conn()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM chunks", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

fn read_chunk(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredChunk> {
    let content_type: String = row.get(3)?;
    let blob: Vec<u8> = row.get(6)?;
    Ok(StoredChunk {
        row_id: row.get(0)?,
        chunk_id: row.get(1)?,
        doc_id: row.get(2)?,
        content_type: content_type.parse().unwrap_or_default(),
        text: row.get(4)?,
        content_hash: row.get(5)?,
        embedding: decode_vector(&blob),
    })
}

fn encode_vector(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn decode_vector(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

/// Catalog migrations (each string is one migration)
const MIGRATIONS: &[&str] = &[
    // Migration 1: Initial schema
    r#"
    CREATE TABLE chunks (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        chunk_id TEXT NOT NULL UNIQUE,
        doc_id TEXT NOT NULL,
        content_type TEXT NOT NULL,
        text TEXT NOT NULL,
        content_hash TEXT NOT NULL,
        embedding BLOB NOT NULL,
        created_at INTEGER NOT NULL
    );

    CREATE INDEX idx_chunks_doc ON chunks(doc_id);

    CREATE TABLE index_meta (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    );
    "#,
];

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_temp() -> (TempDir, Catalog) {
        let temp = TempDir::new().unwrap();
        let catalog = Catalog::open(&temp.path().join("catalog.db")).unwrap();
        (temp, catalog)
    }

    #[test]
    fn test_migrations_applied() {
        let (_temp, catalog) = open_temp();
        let conn = catalog.get_conn().unwrap();
        let version: i32 = conn
            .query_row("SELECT MAX(version) FROM _migrations", [], |row| row.get(0))
            .unwrap();
        assert_eq!(version, MIGRATIONS.len() as i32);
    }

    #[test]
    fn test_vector_blob_roundtrip() {
        let vector = vec![0.25, -1.5, 3.0];
        assert_eq!(decode_vector(&encode_vector(&vector)), vector);
    }

    #[test]
    fn test_upsert_skips_unchanged_and_retires_replaced() {
        let (_temp, catalog) = open_temp();

        let first = catalog
            .upsert("c1", "d1", ContentType::Text, "alpha", "h1", &[1.0, 0.0])
            .unwrap();
        let row = match first {
            UpsertOutcome::Inserted(id) => id,
            other => panic!("expected insert, got {:?}", other),
        };

        let again = catalog
            .upsert("c1", "d1", ContentType::Text, "alpha", "h1", &[1.0, 0.0])
            .unwrap();
        assert_eq!(again, UpsertOutcome::Unchanged);

        let replaced = catalog
            .upsert("c1", "d1", ContentType::Text, "beta", "h2", &[0.0, 1.0])
            .unwrap();
        let new_row = match replaced {
            UpsertOutcome::Replaced { old, new } => {
                assert_eq!(old, row);
                new
            }
            other => panic!("expected replace, got {:?}", other),
        };

        assert!(catalog.get_many(&[row]).unwrap().is_empty());
        let rows = catalog.get_many(&[new_row]).unwrap();
        assert_eq!(rows[0].text, "beta");
        assert_eq!(rows[0].embedding, vec![0.0, 1.0]);
        assert_eq!(catalog.count().unwrap(), 1);
    }

    #[test]
    fn test_dimension_meta() {
        let (_temp, catalog) = open_temp();
        assert_eq!(catalog.dimension().unwrap(), None);
        catalog.set_dimension(384).unwrap();
        assert_eq!(catalog.dimension().unwrap(), Some(384));
    }
}
