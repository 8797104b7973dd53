//! Content-hash-keyed embedding cache.
//!
//! Rows are keyed by `(provider, model, provider_key, hash)` so vectors are
//! scoped to the exact provider identity that produced them. The table lives
//! in the index store but is independent of the chunk tables: a full rebuild
//! seeds the new store from the old cache before any provider call.

use anyhow::{Context, Result};
use rusqlite::{params, Connection};
use std::collections::HashMap;

use super::EmbeddingProvider;

/// SQLite's default parameter limit is 999; stay well under it when expanding
/// hash lists into `IN (...)` clauses.
const IN_CLAUSE_BATCH: usize = 400;

/// Identity under which cache rows are read and written.
#[derive(Debug, Clone)]
pub struct CacheScope {
    pub provider: String,
    pub model: String,
    pub provider_key: String,
}

impl CacheScope {
    pub fn for_provider(provider: &dyn EmbeddingProvider, provider_key: &str) -> Self {
        Self {
            provider: provider.id().to_string(),
            model: provider.model().to_string(),
            provider_key: provider_key.to_string(),
        }
    }
}

/// Fetch cached vectors for the given content hashes. Missing hashes are
/// simply absent from the returned map.
pub fn get_many(
    conn: &Connection,
    scope: &CacheScope,
    hashes: &[String],
) -> Result<HashMap<String, Vec<f32>>> {
    let mut found = HashMap::new();
    for window in hashes.chunks(IN_CLAUSE_BATCH) {
        let placeholders = (0..window.len())
            .map(|i| format!("?{}", i + 4))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT hash, embedding FROM embedding_cache
             WHERE provider = ?1 AND model = ?2 AND provider_key = ?3
               AND hash IN ({placeholders})"
        );
        let mut stmt = conn.prepare(&sql)?;
        let mut values: Vec<&dyn rusqlite::ToSql> =
            vec![&scope.provider, &scope.model, &scope.provider_key];
        for hash in window {
            values.push(hash);
        }
        let rows = stmt.query_map(&values[..], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        for row in rows {
            let (hash, embedding_json) = row?;
            let embedding: Vec<f32> = serde_json::from_str(&embedding_json)
                .context("corrupt embedding JSON in cache")?;
            found.insert(hash, embedding);
        }
    }
    Ok(found)
}

/// Upsert vectors for the given content hashes.
pub fn put_many(
    conn: &Connection,
    scope: &CacheScope,
    entries: &[(String, Vec<f32>)],
) -> Result<()> {
    let now = chrono::Utc::now().timestamp_millis();
    let mut stmt = conn.prepare(
        "INSERT INTO embedding_cache (provider, model, provider_key, hash, embedding, dims, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(provider, model, provider_key, hash)
         DO UPDATE SET embedding = excluded.embedding,
                       dims = excluded.dims,
                       updated_at = excluded.updated_at",
    )?;
    for (hash, embedding) in entries {
        let embedding_json = serde_json::to_string(embedding)?;
        stmt.execute(params![
            scope.provider,
            scope.model,
            scope.provider_key,
            hash,
            embedding_json,
            embedding.len() as i64,
            now,
        ])?;
    }
    Ok(())
}

/// Copy every cache row from `src` into `dst`. Used to seed a rebuild's temp
/// store so unchanged content re-embeds from disk instead of the network.
pub fn copy_all(src: &Connection, dst: &Connection) -> Result<usize> {
    let mut read = src.prepare(
        "SELECT provider, model, provider_key, hash, embedding, dims, updated_at
         FROM embedding_cache",
    )?;
    let mut write = dst.prepare(
        "INSERT OR REPLACE INTO embedding_cache
         (provider, model, provider_key, hash, embedding, dims, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
    )?;
    let mut copied = 0usize;
    let mut rows = read.query([])?;
    while let Some(row) = rows.next()? {
        write.execute(params![
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, String>(3)?,
            row.get::<_, String>(4)?,
            row.get::<_, Option<i64>>(5)?,
            row.get::<_, i64>(6)?,
        ])?;
        copied += 1;
    }
    Ok(copied)
}

/// Delete the oldest rows past `max_entries`. 0 means unbounded.
pub fn prune(conn: &Connection, max_entries: usize) -> Result<usize> {
    if max_entries == 0 {
        return Ok(0);
    }
    let removed = conn.execute(
        "DELETE FROM embedding_cache WHERE rowid IN (
             SELECT rowid FROM embedding_cache
             ORDER BY updated_at DESC, rowid DESC
             LIMIT -1 OFFSET ?1
         )",
        params![max_entries as i64],
    )?;
    Ok(removed)
}

pub fn count(conn: &Connection) -> Result<i64> {
    let n = conn.query_row("SELECT COUNT(*) FROM embedding_cache", [], |row| row.get(0))?;
    Ok(n)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_memory_database;
    use crate::db::schema::ensure_schema;

    fn scope() -> CacheScope {
        CacheScope {
            provider: "openai".into(),
            model: "text-embedding-3-small".into(),
            provider_key: "k1".into(),
        }
    }

    fn store() -> Connection {
        let conn = open_memory_database().unwrap();
        ensure_schema(&conn, false).unwrap();
        conn
    }

    #[test]
    fn round_trip_and_miss() {
        let conn = store();
        let scope = scope();
        put_many(
            &conn,
            &scope,
            &[("h1".into(), vec![1.0, 2.0]), ("h2".into(), vec![3.0])],
        )
        .unwrap();

        let found = get_many(&conn, &scope, &["h1".into(), "h3".into()]).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found["h1"], vec![1.0, 2.0]);
    }

    #[test]
    fn scoped_by_provider_identity() {
        let conn = store();
        let a = scope();
        let mut b = scope();
        b.provider_key = "k2".into();

        put_many(&conn, &a, &[("h1".into(), vec![1.0])]).unwrap();
        assert!(get_many(&conn, &b, &["h1".into()]).unwrap().is_empty());
    }

    #[test]
    fn copy_seeds_another_store() {
        let src = store();
        let dst = store();
        put_many(&src, &scope(), &[("h1".into(), vec![0.5])]).unwrap();

        assert_eq!(copy_all(&src, &dst).unwrap(), 1);
        let found = get_many(&dst, &scope(), &["h1".into()]).unwrap();
        assert_eq!(found["h1"], vec![0.5]);
    }

    #[test]
    fn prune_keeps_newest() {
        let conn = store();
        let scope = scope();
        for i in 0..5 {
            put_many(&conn, &scope, &[(format!("h{i}"), vec![i as f32])]).unwrap();
            conn.execute(
                "UPDATE embedding_cache SET updated_at = ?1 WHERE hash = ?2",
                params![i as i64, format!("h{i}")],
            )
            .unwrap();
        }
        let removed = prune(&conn, 2).unwrap();
        assert_eq!(removed, 3);
        let remaining = get_many(
            &conn,
            &scope,
            &(0..5).map(|i| format!("h{i}")).collect::<Vec<_>>(),
        )
        .unwrap();
        assert!(remaining.contains_key("h3"));
        assert!(remaining.contains_key("h4"));
        assert!(!remaining.contains_key("h0"));
    }

    #[test]
    fn large_hash_lists_split_into_in_clause_batches() {
        let conn = store();
        let scope = scope();
        let entries: Vec<(String, Vec<f32>)> =
            (0..900).map(|i| (format!("h{i}"), vec![i as f32])).collect();
        put_many(&conn, &scope, &entries).unwrap();

        let hashes: Vec<String> = (0..900).map(|i| format!("h{i}")).collect();
        let found = get_many(&conn, &scope, &hashes).unwrap();
        assert_eq!(found.len(), 900);
    }
}
