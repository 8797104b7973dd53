//! Hybrid search: vec0 KNN + FTS5 BM25 → weighted merge → hydrate → rank.
//!
//! Both retrieval paths produce normalized per-chunk scores in (0, 1]; the
//! merge weighs them (`vector_weight`·v + `text_weight`·t, a single-path hit
//! keeping only its own weighted term) so tuning the weights trades semantic
//! recall against keyword precision without renormalizing.

use anyhow::Result;
use rusqlite::{params, Connection};
use std::collections::HashMap;

use crate::index::types::{MemorySearchResult, Source, MAX_CANDIDATES, SNIPPET_MAX_CHARS};

/// Knobs resolved from config plus per-call overrides.
pub struct SearchParams {
    pub max_results: usize,
    pub min_score: f64,
    pub candidate_multiplier: f64,
    pub vector_weight: f64,
    pub text_weight: f64,
    pub sources: Option<Vec<Source>>,
    pub model: String,
}

impl SearchParams {
    fn candidate_limit(&self) -> usize {
        let scaled = (self.max_results as f64 * self.candidate_multiplier).ceil() as usize;
        scaled.clamp(self.max_results, MAX_CANDIDATES)
    }

    fn source_allowed(&self, source: Source) -> bool {
        match &self.sources {
            Some(allowed) => allowed.contains(&source),
            None => true,
        }
    }
}

struct ChunkRow {
    path: String,
    source: Source,
    start_line: usize,
    end_line: usize,
    text: String,
}

/// Run the hybrid query. `query_embedding` is `None` when the vector path is
/// unavailable (no vec table yet, provider down, vectors disabled); the
/// keyword path alone still serves results, and vice versa.
pub fn search_index(
    conn: &Connection,
    query_text: &str,
    query_embedding: Option<&[f32]>,
    fts_available: bool,
    params: &SearchParams,
) -> Result<Vec<MemorySearchResult>> {
    let limit = params.candidate_limit();

    let vec_scores = match query_embedding {
        Some(embedding) => vector_search(conn, embedding, params, limit)?,
        None => Vec::new(),
    };
    let text_scores = if fts_available {
        fts_search(conn, query_text, params, limit)?
    } else {
        Vec::new()
    };

    let merged = weighted_merge(
        &vec_scores,
        &text_scores,
        params.vector_weight,
        params.text_weight,
    );
    if merged.is_empty() {
        return Ok(Vec::new());
    }

    let ids: Vec<&str> = merged.keys().map(|id| id.as_str()).collect();
    let rows = fetch_chunks(conn, &ids)?;

    let mut results: Vec<MemorySearchResult> = merged
        .iter()
        .filter_map(|(id, score)| {
            let row = rows.get(id.as_str())?;
            if *score < params.min_score {
                return None;
            }
            Some(MemorySearchResult {
                path: row.path.clone(),
                start_line: row.start_line,
                end_line: row.end_line,
                score: *score,
                snippet: make_snippet(&row.text),
                source: row.source,
            })
        })
        .collect();

    // Descending score; equal scores ordered by path then start line so the
    // result list is stable across runs.
    results.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.path.cmp(&b.path))
            .then_with(|| a.start_line.cmp(&b.start_line))
    });
    results.truncate(params.max_results);
    Ok(results)
}

/// Vector KNN via sqlite-vec, hydrated against `chunks` to apply the source
/// filter while preserving distance order. No model filter is needed here: a
/// model change forces a full rebuild, so vec rows always match the current
/// model.
fn vector_search(
    conn: &Connection,
    embedding: &[f32],
    params: &SearchParams,
    limit: usize,
) -> Result<Vec<(String, f64)>> {
    // The source filter runs after the KNN, so a filtered search over-fetches;
    // otherwise excluded-source neighbors could fill the whole k.
    let fetch = if params.sources.is_some() {
        limit.saturating_mul(4).min(MAX_CANDIDATES)
    } else {
        limit
    };
    let blob = vector_to_blob(embedding);
    let mut stmt = conn.prepare(
        "SELECT id, distance FROM chunks_vec \
         WHERE embedding MATCH ?1 ORDER BY distance LIMIT ?2",
    )?;
    let hits = stmt
        .query_map(params![blob, fetch as i64], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    if hits.is_empty() {
        return Ok(Vec::new());
    }

    let ids: Vec<&str> = hits.iter().map(|(id, _)| id.as_str()).collect();
    let rows = fetch_chunks(conn, &ids)?;
    let mut scored = Vec::new();
    for (id, distance) in hits {
        let Some(row) = rows.get(id.as_str()) else {
            continue; // vec row without a chunk row: stale, skip
        };
        if !params.source_allowed(row.source) {
            continue;
        }
        // L2 distance 0 → score 1, decaying toward 0
        scored.push((id, 1.0 / (1.0 + distance)));
    }
    // hits iterate in distance order, so truncation keeps the best survivors
    scored.truncate(limit);
    Ok(scored)
}

/// FTS5 BM25 keyword search with the model and source filters pushed into SQL.
fn fts_search(
    conn: &Connection,
    query_text: &str,
    params: &SearchParams,
    limit: usize,
) -> Result<Vec<(String, f64)>> {
    let escaped = escape_fts_query(query_text);
    if escaped.is_empty() {
        return Ok(Vec::new());
    }

    let source_filter = match &params.sources {
        Some(allowed) => {
            let list = allowed
                .iter()
                .map(|s| format!("'{}'", s.as_str()))
                .collect::<Vec<_>>()
                .join(", ");
            format!("AND source IN ({list})")
        }
        None => String::new(),
    };
    let sql = format!(
        "SELECT id, rank FROM chunks_fts \
         WHERE chunks_fts MATCH ?1 AND model = ?2 {source_filter} \
         ORDER BY rank LIMIT ?3"
    );
    let mut stmt = conn.prepare(&sql)?;
    let hits = stmt
        .query_map(params![escaped, params.model, limit as i64], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    // FTS5 rank is negative, more negative = better; map to (0, 1].
    Ok(hits
        .into_iter()
        .map(|(id, rank)| {
            let r = (-rank).max(0.0);
            (id, r / (1.0 + r))
        })
        .collect())
}

/// Escape a user query for FTS5 MATCH syntax.
///
/// Wraps each whitespace-delimited word in double quotes and joins with spaces
/// so FTS5 treats them as individual terms (implicit AND). Strips empty tokens.
pub fn escape_fts_query(query: &str) -> String {
    query
        .split_whitespace()
        .map(|word| {
            let clean = word.replace('"', "");
            format!("\"{clean}\"")
        })
        .filter(|w| w != "\"\"")
        .collect::<Vec<_>>()
        .join(" ")
}

/// Weighted score merge keyed by chunk id. A chunk in both lists gets
/// `vw·v + tw·t`; a chunk in only one list gets that score times its weight.
fn weighted_merge(
    vec_scores: &[(String, f64)],
    text_scores: &[(String, f64)],
    vector_weight: f64,
    text_weight: f64,
) -> HashMap<String, f64> {
    let mut merged: HashMap<String, f64> = HashMap::new();
    for (id, score) in vec_scores {
        *merged.entry(id.clone()).or_insert(0.0) += vector_weight * score;
    }
    for (id, score) in text_scores {
        *merged.entry(id.clone()).or_insert(0.0) += text_weight * score;
    }
    merged
}

fn fetch_chunks(conn: &Connection, ids: &[&str]) -> Result<HashMap<String, ChunkRow>> {
    if ids.is_empty() {
        return Ok(HashMap::new());
    }
    let placeholders: Vec<String> = (1..=ids.len()).map(|i| format!("?{i}")).collect();
    let sql = format!(
        "SELECT id, path, source, start_line, end_line, text \
         FROM chunks WHERE id IN ({})",
        placeholders.join(", ")
    );
    let mut stmt = conn.prepare(&sql)?;
    let values: Vec<&dyn rusqlite::types::ToSql> = ids
        .iter()
        .map(|id| id as &dyn rusqlite::types::ToSql)
        .collect();
    let rows = stmt
        .query_map(values.as_slice(), |row| {
            let source: String = row.get(2)?;
            Ok((
                row.get::<_, String>(0)?,
                ChunkRow {
                    path: row.get(1)?,
                    source: if source == "sessions" {
                        Source::Sessions
                    } else {
                        Source::Memory
                    },
                    start_line: row.get::<_, i64>(3)? as usize,
                    end_line: row.get::<_, i64>(4)? as usize,
                    text: row.get(5)?,
                },
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut map = HashMap::new();
    for (id, row) in rows {
        map.insert(id, row);
    }
    Ok(map)
}

/// Leading slice of the chunk, truncated on a char boundary.
fn make_snippet(text: &str) -> String {
    if text.len() <= SNIPPET_MAX_CHARS {
        return text.to_string();
    }
    let mut end = SNIPPET_MAX_CHARS;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text[..end].to_string()
}

/// Little-endian f32 blob in the layout sqlite-vec expects.
pub fn vector_to_blob(embedding: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(embedding.len() * 4);
    for value in embedding {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_memory_database;
    use crate::db::schema::{ensure_schema, ensure_vector_table};

    const MODEL: &str = "test-model";

    fn test_store() -> Connection {
        let conn = open_memory_database().unwrap();
        ensure_schema(&conn, true).unwrap();
        ensure_vector_table(&conn, 3).unwrap();
        conn
    }

    fn insert_chunk(conn: &Connection, id: &str, path: &str, source: &str, text: &str, embedding: &[f32]) {
        conn.execute(
            "INSERT INTO chunks (id, path, source, start_line, end_line, hash, model, text, embedding, updated_at) \
             VALUES (?1, ?2, ?3, 1, 2, 'h', ?4, ?5, '[]', 0)",
            params![id, path, source, MODEL, text],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO chunks_fts (text, id, path, source, model, start_line, end_line) \
             VALUES (?1, ?2, ?3, ?4, ?5, 1, 2)",
            params![text, id, path, source, MODEL],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO chunks_vec (id, embedding) VALUES (?1, ?2)",
            params![id, vector_to_blob(embedding)],
        )
        .unwrap();
    }

    fn default_params() -> SearchParams {
        SearchParams {
            max_results: 8,
            min_score: 0.0,
            candidate_multiplier: 4.0,
            vector_weight: 0.6,
            text_weight: 0.4,
            sources: None,
            model: MODEL.to_string(),
        }
    }

    #[test]
    fn weighted_merge_matches_documented_example() {
        let vec_scores = vec![("c1".to_string(), 0.9)];
        let text_scores = vec![("c1".to_string(), 0.8), ("c2".to_string(), 0.5)];
        let merged = weighted_merge(&vec_scores, &text_scores, 0.6, 0.4);
        assert!((merged["c1"] - 0.86).abs() < 1e-9);
        assert!((merged["c2"] - 0.2).abs() < 1e-9);
    }

    #[test]
    fn hybrid_search_finds_both_paths() {
        let conn = test_store();
        insert_chunk(&conn, "c1", "MEMORY.md", "memory", "remember the milk", &[1.0, 0.0, 0.0]);
        insert_chunk(&conn, "c2", "memory/other.md", "memory", "unrelated notes", &[0.0, 1.0, 0.0]);

        let results =
            search_index(&conn, "milk", Some(&[1.0, 0.0, 0.0]), true, &default_params()).unwrap();
        assert!(!results.is_empty());
        assert_eq!(results[0].path, "MEMORY.md");
        // keyword + vector hit must outrank vector-only
        assert!(results[0].score > results.last().unwrap().score || results.len() == 1);
    }

    #[test]
    fn keyword_only_when_no_embedding() {
        let conn = test_store();
        insert_chunk(&conn, "c1", "MEMORY.md", "memory", "alpha beta gamma", &[1.0, 0.0, 0.0]);

        let results = search_index(&conn, "beta", None, true, &default_params()).unwrap();
        assert_eq!(results.len(), 1);
        // single-list score is scaled by the text weight, so it stays below it
        assert!(results[0].score <= 0.4 + 1e-9);
    }

    #[test]
    fn vector_only_when_fts_unavailable() {
        let conn = test_store();
        insert_chunk(&conn, "c1", "MEMORY.md", "memory", "alpha", &[1.0, 0.0, 0.0]);

        let results =
            search_index(&conn, "alpha", Some(&[1.0, 0.0, 0.0]), false, &default_params()).unwrap();
        assert_eq!(results.len(), 1);
        assert!(results[0].score <= 0.6 + 1e-9);
    }

    #[test]
    fn source_filter_applies_to_both_paths() {
        let conn = test_store();
        insert_chunk(&conn, "c1", "MEMORY.md", "memory", "shared term", &[1.0, 0.0, 0.0]);
        insert_chunk(&conn, "c2", "sessions/a.jsonl", "sessions", "shared term", &[1.0, 0.0, 0.0]);

        let mut params = default_params();
        params.sources = Some(vec![Source::Sessions]);
        let results =
            search_index(&conn, "shared", Some(&[1.0, 0.0, 0.0]), true, &params).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].source, Source::Sessions);
    }

    #[test]
    fn source_filter_does_not_starve_vector_candidates() {
        let conn = test_store();
        // five session chunks crowd the top of the KNN; the lone memory chunk
        // sits farther from the query vector
        for i in 0..5 {
            insert_chunk(
                &conn,
                &format!("s{i}"),
                &format!("sessions/{i}.jsonl"),
                "sessions",
                "chatter",
                &[0.9, 0.01 * i as f32, 0.0],
            );
        }
        insert_chunk(&conn, "m1", "memory/far.md", "memory", "note", &[0.0, 1.0, 0.0]);

        let mut params = default_params();
        params.max_results = 1;
        params.sources = Some(vec![Source::Memory]);
        let results =
            search_index(&conn, "note", Some(&[1.0, 0.0, 0.0]), false, &params).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].source, Source::Memory);
        assert_eq!(results[0].path, "memory/far.md");
    }

    #[test]
    fn min_score_and_max_results_apply() {
        let conn = test_store();
        for i in 0..5 {
            insert_chunk(
                &conn,
                &format!("c{i}"),
                &format!("memory/{i}.md"),
                "memory",
                "common words here",
                &[i as f32, 1.0, 0.0],
            );
        }
        let mut params = default_params();
        params.max_results = 2;
        let results =
            search_index(&conn, "common", Some(&[0.0, 1.0, 0.0]), true, &params).unwrap();
        assert_eq!(results.len(), 2);

        params.min_score = 0.99;
        let results =
            search_index(&conn, "common", Some(&[0.0, 1.0, 0.0]), true, &params).unwrap();
        assert!(results.is_empty());
    }

    #[test]
    fn ties_break_by_path_then_start_line() {
        let a = MemorySearchResult {
            path: "a.md".into(),
            start_line: 5,
            end_line: 6,
            score: 0.5,
            snippet: String::new(),
            source: Source::Memory,
        };
        let results = vec![
            MemorySearchResult { path: "b.md".into(), start_line: 1, ..a.clone() },
            a.clone(),
            MemorySearchResult { start_line: 1, ..a.clone() },
        ];
        let mut sorted = results.clone();
        sorted.sort_by(|x, y| {
            y.score
                .partial_cmp(&x.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| x.path.cmp(&y.path))
                .then_with(|| x.start_line.cmp(&y.start_line))
        });
        assert_eq!(sorted[0].path, "a.md");
        assert_eq!(sorted[0].start_line, 1);
        assert_eq!(sorted[1].start_line, 5);
        assert_eq!(sorted[2].path, "b.md");
    }

    #[test]
    fn snippet_truncates_on_char_boundary() {
        let text = "é".repeat(600); // 1200 bytes
        let snippet = make_snippet(&text);
        assert!(snippet.len() <= SNIPPET_MAX_CHARS);
        assert!(snippet.chars().all(|c| c == 'é'));
    }

    #[test]
    fn escape_fts_query_quotes_terms() {
        assert_eq!(escape_fts_query("hello world"), "\"hello\" \"world\"");
        assert_eq!(escape_fts_query("drop\"table"), "\"droptable\"");
        assert_eq!(escape_fts_query("   "), "");
    }
}
