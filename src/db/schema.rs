//! SQL DDL for the index store.
//!
//! Defines the `chunks`, `files`, `embedding_cache`, and `meta` tables plus
//! the `chunks_fts` (FTS5) keyword index and the lazily-created `chunks_vec`
//! (vec0) vector index. All DDL uses `IF NOT EXISTS` for idempotent
//! initialization.

use rusqlite::Connection;
use serde::Serialize;
use tracing::warn;

use crate::index::types::{IndexMeta, META_KEY};

const SCHEMA_SQL: &str = r#"
-- One row per indexed chunk. `id` is a deterministic hash of
-- (source, path, start_line, end_line, hash, model), so re-indexing unchanged
-- content upserts in place instead of growing the table.
CREATE TABLE IF NOT EXISTS chunks (
    id TEXT PRIMARY KEY,
    path TEXT NOT NULL,
    source TEXT NOT NULL CHECK(source IN ('memory','sessions')),
    start_line INTEGER NOT NULL,
    end_line INTEGER NOT NULL,
    hash TEXT NOT NULL,
    model TEXT NOT NULL,
    text TEXT NOT NULL,
    embedding TEXT NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_chunks_path_source ON chunks(path, source);
CREATE UNIQUE INDEX IF NOT EXISTS idx_chunks_range
    ON chunks(path, source, start_line, end_line, model);

-- Per-file sync metadata for dirty detection.
CREATE TABLE IF NOT EXISTS files (
    path TEXT PRIMARY KEY,
    source TEXT NOT NULL CHECK(source IN ('memory','sessions')),
    hash TEXT NOT NULL,
    mtime INTEGER NOT NULL,
    size INTEGER NOT NULL
);

-- Content-hash-keyed vectors, scoped by provider identity. Keyed independently
-- of `chunks` so cached vectors survive a full reindex.
CREATE TABLE IF NOT EXISTS embedding_cache (
    provider TEXT NOT NULL,
    model TEXT NOT NULL,
    provider_key TEXT NOT NULL,
    hash TEXT NOT NULL,
    embedding TEXT NOT NULL,
    dims INTEGER,
    updated_at INTEGER NOT NULL,
    PRIMARY KEY (provider, model, provider_key, hash)
);

-- Build metadata (single JSON value under META_KEY).
CREATE TABLE IF NOT EXISTS meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

/// FTS5 keyword index over chunk text. Created separately so an FTS5-less
/// SQLite build degrades to vector-only search instead of failing the open.
const FTS_SQL: &str = r#"
CREATE VIRTUAL TABLE IF NOT EXISTS chunks_fts USING fts5(
    text,
    id UNINDEXED,
    path UNINDEXED,
    source UNINDEXED,
    model UNINDEXED,
    start_line UNINDEXED,
    end_line UNINDEXED
);
"#;

/// Capability outcome of schema initialization.
#[derive(Debug, Clone, Serialize)]
pub struct SchemaCaps {
    pub fts_available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fts_error: Option<String>,
}

/// Initialize all tables. Idempotent.
///
/// The keyword index is attempted only when `fts_enabled`; a creation failure
/// is recorded as a capability flag, not an error.
pub fn ensure_schema(conn: &Connection, fts_enabled: bool) -> rusqlite::Result<SchemaCaps> {
    conn.execute_batch(SCHEMA_SQL)?;

    if !fts_enabled {
        return Ok(SchemaCaps {
            fts_available: false,
            fts_error: None,
        });
    }
    match conn.execute_batch(FTS_SQL) {
        Ok(()) => Ok(SchemaCaps {
            fts_available: true,
            fts_error: None,
        }),
        Err(err) => {
            warn!(error = %err, "keyword index unavailable; degrading to vector-only search");
            Ok(SchemaCaps {
                fts_available: false,
                fts_error: Some(err.to_string()),
            })
        }
    }
}

/// Create the vec0 similarity table for the given dimensionality.
///
/// Deferred until the first embedding arrives because vec0 requires the vector
/// width up front and the store cannot know it before the provider answers.
pub fn ensure_vector_table(conn: &Connection, dimensions: usize) -> rusqlite::Result<()> {
    conn.execute_batch(&format!(
        "CREATE VIRTUAL TABLE IF NOT EXISTS chunks_vec USING vec0(\n\
         \x20   id TEXT PRIMARY KEY,\n\
         \x20   embedding FLOAT[{dimensions}]\n\
         );"
    ))
}

/// Read the build-configuration stamp, if any.
pub fn read_meta(conn: &Connection) -> Option<IndexMeta> {
    let value: Option<String> = conn
        .query_row(
            "SELECT value FROM meta WHERE key = ?1",
            [META_KEY],
            |row| row.get(0),
        )
        .ok();
    value.and_then(|v| serde_json::from_str(&v).ok())
}

/// Write the build-configuration stamp (once per successful full rebuild).
pub fn write_meta(conn: &Connection, meta: &IndexMeta) -> anyhow::Result<()> {
    let value = serde_json::to_string(meta)?;
    conn.execute(
        "INSERT INTO meta (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        rusqlite::params![META_KEY, value],
    )?;
    Ok(())
}
