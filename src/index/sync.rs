//! Sync engine: scanning, dirty detection, and (re)indexing.
//!
//! Incremental sync mutates the serving store in place and runs in three
//! phases so the store lock is never held across a provider call: a planning
//! phase (under the lock) decides which files are dirty via a stored
//! mtime+size fast path with a content-hash fallback, chunks them, and pulls
//! cached vectors; an embedding phase (no lock) fetches the missing vectors;
//! an apply phase (under the lock) writes rows and deletes files gone from
//! disk. Per-file errors are recorded and the pass continues. A full rebuild
//! indexes everything into a separate temp store that the caller swaps in
//! afterwards; its first error aborts the whole build.

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use tracing::{debug, info, warn};

use super::Sanitizer;
use crate::chunker::{chunk_markdown, sha256_hex, Chunk};
use crate::config::MemdexConfig;
use crate::db::schema::{self, ensure_vector_table};
use crate::embedding::batch::{plan_batches, BatchManager};
use crate::embedding::cache::{self, CacheScope};
use crate::embedding::{EmbedError, EmbeddingProvider};
use crate::index::search::vector_to_blob;
use crate::index::types::{FileEntry, IndexMeta, Source};

/// Everything the indexing path needs besides the store handle.
pub struct SyncContext<'a> {
    pub provider: &'a dyn EmbeddingProvider,
    pub batch: &'a BatchManager,
    pub cache_scope: &'a CacheScope,
    pub config: &'a MemdexConfig,
    pub sanitizer: &'a dyn Sanitizer,
}

impl SyncContext<'_> {
    fn vectors_wanted(&self) -> bool {
        self.config.storage.vector_enabled
    }
}

/// Mutable store capabilities, updated as indexing discovers them.
#[derive(Debug, Clone)]
pub struct StoreCaps {
    pub fts_available: bool,
    /// Whether sqlite-vec is usable on this handle at all.
    pub vector_available: bool,
    /// Set once the vec0 table exists; fixes the accepted dimensionality.
    pub vector_dims: Option<usize>,
}

/// Outcome of an incremental pass.
#[derive(Default)]
pub struct SyncReport {
    pub indexed: usize,
    pub removed: usize,
    pub errors: Vec<(String, anyhow::Error)>,
}

impl SyncReport {
    /// Per-file errors do not stop the pass, but the caller still learns that
    /// something failed: the first error is surfaced after the pass completes.
    pub fn into_result(mut self) -> Result<()> {
        if self.errors.is_empty() {
            return Ok(());
        }
        let (path, err) = self.errors.remove(0);
        Err(err.context(format!("failed to index {path}")))
    }
}

struct FileRecord {
    hash: String,
    mtime: i64,
    size: u64,
}

// ── Scanning ──────────────────────────────────────────────────────────────────

/// Memory notes on disk: `MEMORY.md` plus `memory/**/*.md`, relative paths,
/// sorted. Content and hash are left unset; the dirty check reads them only
/// when the mtime+size fast path misses.
pub fn list_memory_files(workspace: &Path) -> Result<Vec<FileEntry>> {
    let mut entries = Vec::new();
    let root_file = workspace.join("MEMORY.md");
    if root_file.is_file() {
        entries.push(stat_entry("MEMORY.md".into(), root_file)?);
    }
    let memory_dir = workspace.join("memory");
    if memory_dir.is_dir() {
        collect_markdown(&memory_dir, "memory", &mut entries)?;
    }
    entries.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(entries)
}

fn collect_markdown(dir: &Path, prefix: &str, entries: &mut Vec<FileEntry>) -> Result<()> {
    for dirent in std::fs::read_dir(dir)
        .with_context(|| format!("failed to read directory {}", dir.display()))?
    {
        let dirent = dirent?;
        let path = dirent.path();
        let name = dirent.file_name().to_string_lossy().into_owned();
        if path.is_dir() {
            collect_markdown(&path, &format!("{prefix}/{name}"), entries)?;
        } else if name.ends_with(".md") {
            entries.push(stat_entry(format!("{prefix}/{name}"), path)?);
        }
    }
    Ok(())
}

fn stat_entry(rel_path: String, abs_path: std::path::PathBuf) -> Result<FileEntry> {
    let metadata = std::fs::metadata(&abs_path)
        .with_context(|| format!("failed to stat {}", abs_path.display()))?;
    let mtime_ms = metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0);
    Ok(FileEntry {
        path: rel_path,
        abs_path,
        mtime_ms,
        size: metadata.len(),
        hash: String::new(),
        content: None,
    })
}

fn source_of(path: &str) -> Source {
    if path.starts_with("sessions/") {
        Source::Sessions
    } else {
        Source::Memory
    }
}

/// Resolve the content that gets chunked for an entry: transcripts carry their
/// extracted text, notes are read from disk and sanitized. Also fills the
/// entry hash when the scan left it unset.
fn resolve_content(entry: &mut FileEntry, sanitizer: &dyn Sanitizer) -> Result<String> {
    if let Some(content) = &entry.content {
        return Ok(content.clone());
    }
    let raw = std::fs::read_to_string(&entry.abs_path)
        .with_context(|| format!("failed to read {}", entry.abs_path.display()))?;
    if entry.hash.is_empty() {
        entry.hash = sha256_hex(&raw);
    }
    Ok(sanitizer.sanitize(&raw))
}

// ── Dirty detection ───────────────────────────────────────────────────────────

fn load_file_records(conn: &Connection) -> Result<HashMap<String, FileRecord>> {
    let mut stmt = conn.prepare("SELECT path, hash, mtime, size FROM files")?;
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, String>(0)?,
            FileRecord {
                hash: row.get(1)?,
                mtime: row.get(2)?,
                size: row.get::<_, i64>(3)? as u64,
            },
        ))
    })?;
    let mut map = HashMap::new();
    for row in rows {
        let (path, record) = row?;
        map.insert(path, record);
    }
    Ok(map)
}

/// Does the stored configuration stamp force throwing the whole index away?
pub fn needs_full_reindex(conn: &Connection, expected: &IndexMeta, vectors_wanted: bool) -> bool {
    let Some(stored) = schema::read_meta(conn) else {
        return true;
    };
    if stored.provider != expected.provider
        || stored.model != expected.model
        || stored.provider_key != expected.provider_key
        || stored.chunk_tokens != expected.chunk_tokens
        || stored.chunk_overlap != expected.chunk_overlap
    {
        return true;
    }
    // vectors requested but the stored index was built without them
    vectors_wanted && stored.vector_dims.is_none()
}

// ── Incremental sync ──────────────────────────────────────────────────────────

/// One dirty file, carried through the embed and apply phases.
pub struct FileJob {
    entry: FileEntry,
    chunks: Vec<Chunk>,
    /// Vectors resolved so far, keyed by chunk hash (cache hits, then fresh).
    vectors: HashMap<String, Vec<f32>>,
    /// Distinct chunks still needing a provider call.
    missing: Vec<Chunk>,
    failed: bool,
}

/// Outcome of the planning phase: what to (re)index, what to drop, and the
/// errors hit so far.
pub struct SyncPlan {
    jobs: Vec<FileJob>,
    stale: Vec<String>,
    report: SyncReport,
}

/// Planning phase of an incremental pass, run under the store lock. Decides
/// which files are dirty, refreshes the stat columns of touched-but-unchanged
/// files, chunks the dirty ones, and pulls whatever the embedding cache
/// already holds. No provider call happens here, so the lock hold stays short.
///
/// `entries` must cover every source being synced; stored files under a
/// covered source that are absent from the scan are treated as deleted.
/// Sources not present in `scanned_sources` are left untouched (a memory-only
/// pass must not drop session rows).
pub fn plan_incremental(
    conn: &Connection,
    caps: &StoreCaps,
    ctx: &SyncContext,
    mut entries: Vec<FileEntry>,
    scanned_sources: &[Source],
) -> Result<SyncPlan> {
    let records = load_file_records(conn)?;
    let on_disk: HashSet<String> = entries.iter().map(|e| e.path.clone()).collect();
    let mut plan = SyncPlan {
        jobs: Vec::new(),
        stale: Vec::new(),
        report: SyncReport::default(),
    };

    for entry in &mut entries {
        match plan_one_file(conn, ctx, entry, records.get(&entry.path)) {
            Ok(Some(content)) => match make_job(conn, caps, ctx, entry.clone(), &content) {
                Ok(job) => plan.jobs.push(job),
                Err(err) => plan.report.errors.push((entry.path.clone(), err)),
            },
            Ok(None) => {}
            Err(err) => {
                warn!(path = %entry.path, error = %err, "failed to plan file, continuing");
                plan.report.errors.push((entry.path.clone(), err));
            }
        }
    }

    for path in records.keys() {
        if !on_disk.contains(path) && scanned_sources.contains(&source_of(path)) {
            plan.stale.push(path.clone());
        }
    }
    Ok(plan)
}

/// Returns the content to index, or `None` when the file is clean.
fn plan_one_file(
    conn: &Connection,
    ctx: &SyncContext,
    entry: &mut FileEntry,
    record: Option<&FileRecord>,
) -> Result<Option<String>> {
    if let Some(record) = record {
        if record.mtime == entry.mtime_ms && record.size == entry.size {
            return Ok(None);
        }
        let content = resolve_content(entry, ctx.sanitizer)?;
        if record.hash == entry.hash {
            // touched but unchanged: refresh the stat columns only
            conn.execute(
                "UPDATE files SET mtime = ?1, size = ?2 WHERE path = ?3",
                params![entry.mtime_ms, entry.size as i64, entry.path],
            )?;
            return Ok(None);
        }
        return Ok(Some(content));
    }
    let content = resolve_content(entry, ctx.sanitizer)?;
    Ok(Some(content))
}

fn make_job(
    conn: &Connection,
    caps: &StoreCaps,
    ctx: &SyncContext,
    entry: FileEntry,
    content: &str,
) -> Result<FileJob> {
    let chunks = chunk_markdown(
        content,
        ctx.config.chunking.tokens,
        ctx.config.chunking.overlap,
    );
    let mut vectors = HashMap::new();
    let mut missing = Vec::new();
    if ctx.vectors_wanted() && caps.vector_available {
        let mut seen = HashSet::new();
        let distinct: Vec<&Chunk> = chunks
            .iter()
            .filter(|c| seen.insert(c.hash.clone()))
            .collect();
        let hashes: Vec<String> = distinct.iter().map(|c| c.hash.clone()).collect();
        if ctx.config.cache.enabled {
            vectors = cache::get_many(conn, ctx.cache_scope, &hashes)?;
        }
        missing = distinct
            .into_iter()
            .filter(|c| !vectors.contains_key(&c.hash))
            .cloned()
            .collect();
    }
    Ok(FileJob {
        entry,
        chunks,
        vectors,
        missing,
        failed: false,
    })
}

/// Embedding phase, run with no lock held so searches keep serving while the
/// provider works. Per-file failures mark the job failed and the remaining
/// files continue. Returns the fresh vectors for the apply phase to write back
/// into the cache.
pub fn embed_plan(ctx: &SyncContext, plan: &mut SyncPlan) -> Vec<(String, Vec<f32>)> {
    let mut fresh: Vec<(String, Vec<f32>)> = Vec::new();
    let mut known: HashMap<String, Vec<f32>> = HashMap::new();
    for job in &mut plan.jobs {
        let FileJob {
            entry,
            vectors,
            missing,
            failed,
            ..
        } = job;
        // identical content across files embeds once per pass
        missing.retain(|chunk| {
            if let Some(vector) = known.get(&chunk.hash) {
                vectors.insert(chunk.hash.clone(), vector.clone());
                false
            } else {
                true
            }
        });
        if missing.is_empty() {
            continue;
        }
        match embed_texts(ctx, missing) {
            Ok(embedded) => {
                for (chunk, vector) in missing.iter().zip(embedded) {
                    known.insert(chunk.hash.clone(), vector.clone());
                    fresh.push((chunk.hash.clone(), vector.clone()));
                    vectors.insert(chunk.hash.clone(), vector);
                }
            }
            Err(err) => {
                warn!(path = %entry.path, error = %err, "failed to embed file, continuing");
                plan.report.errors.push((entry.path.clone(), err));
                *failed = true;
            }
        }
    }
    fresh
}

/// Apply phase, back under the store lock: cache write-back, per-file
/// transactional row replacement, and stale-row deletion.
pub fn apply_incremental(
    conn: &Connection,
    caps: &mut StoreCaps,
    ctx: &SyncContext,
    plan: SyncPlan,
    fresh: Vec<(String, Vec<f32>)>,
) -> Result<SyncReport> {
    let mut report = plan.report;
    if ctx.config.cache.enabled && !fresh.is_empty() {
        cache::put_many(conn, ctx.cache_scope, &fresh)?;
    }

    for job in plan.jobs {
        if job.failed {
            continue;
        }
        match write_file_rows(conn, caps, ctx, &job.entry, &job.chunks, &job.vectors) {
            Ok(()) => report.indexed += 1,
            Err(err) => {
                warn!(path = %job.entry.path, error = %err, "failed to index file, continuing");
                report.errors.push((job.entry.path.clone(), err));
            }
        }
    }

    for path in &plan.stale {
        match delete_file(conn, caps, path) {
            Ok(()) => report.removed += 1,
            Err(err) => report.errors.push((path.clone(), err)),
        }
    }

    if report.indexed > 0 || report.removed > 0 {
        info!(
            indexed = report.indexed,
            removed = report.removed,
            errors = report.errors.len(),
            "incremental sync finished"
        );
    }
    Ok(report)
}

// ── Per-file indexing ─────────────────────────────────────────────────────────

fn chunk_id(source: Source, path: &str, chunk: &Chunk, model: &str) -> String {
    sha256_hex(&format!(
        "{}\n{}\n{}\n{}\n{}\n{}",
        source.as_str(),
        path,
        chunk.start_line,
        chunk.end_line,
        chunk.hash,
        model
    ))
}

/// Replace a file's rows: chunk, embed (cache first), upsert. Used by the
/// full-rebuild path, which runs lock-free against its own temp store and can
/// therefore afford inline provider calls.
pub fn index_file(
    conn: &Connection,
    caps: &mut StoreCaps,
    ctx: &SyncContext,
    entry: &FileEntry,
    content: &str,
) -> Result<()> {
    let chunks = chunk_markdown(
        content,
        ctx.config.chunking.tokens,
        ctx.config.chunking.overlap,
    );
    let vectors = if ctx.vectors_wanted() && caps.vector_available {
        embed_chunks(conn, ctx, &chunks)?
    } else {
        HashMap::new()
    };
    write_file_rows(conn, caps, ctx, entry, &chunks, &vectors)
}

/// Replace a file's rows in one transaction so readers never observe a
/// half-indexed file.
fn write_file_rows(
    conn: &Connection,
    caps: &mut StoreCaps,
    ctx: &SyncContext,
    entry: &FileEntry,
    chunks: &[Chunk],
    vectors: &HashMap<String, Vec<f32>>,
) -> Result<()> {
    let source = source_of(&entry.path);
    let tx = conn.unchecked_transaction()?;
    delete_file_rows(&tx, caps, &entry.path)?;

    let model = ctx.provider.model();
    let now = chrono::Utc::now().timestamp_millis();
    for chunk in chunks {
        let id = chunk_id(source, &entry.path, chunk, model);
        let vector = vectors.get(&chunk.hash);
        let embedding_json = match vector {
            Some(v) => serde_json::to_string(v)?,
            None => "[]".to_string(),
        };
        tx.execute(
            "INSERT INTO chunks (id, path, source, start_line, end_line, hash, model, text, embedding, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(id) DO UPDATE SET text = excluded.text,
                                           embedding = excluded.embedding,
                                           updated_at = excluded.updated_at",
            params![
                id,
                entry.path,
                source.as_str(),
                chunk.start_line as i64,
                chunk.end_line as i64,
                chunk.hash,
                model,
                chunk.text,
                embedding_json,
                now,
            ],
        )?;
        if caps.fts_available {
            tx.execute(
                "INSERT INTO chunks_fts (text, id, path, source, model, start_line, end_line)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    chunk.text,
                    id,
                    entry.path,
                    source.as_str(),
                    model,
                    chunk.start_line as i64,
                    chunk.end_line as i64,
                ],
            )?;
        }
        if let Some(vector) = vector {
            ensure_vec_table_for(&tx, caps, vector.len())?;
            if caps.vector_dims == Some(vector.len()) {
                tx.execute(
                    "INSERT OR REPLACE INTO chunks_vec (id, embedding) VALUES (?1, ?2)",
                    params![id, vector_to_blob(vector)],
                )?;
            }
        }
    }

    tx.execute(
        "INSERT INTO files (path, source, hash, mtime, size)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(path) DO UPDATE SET source = excluded.source,
                                         hash = excluded.hash,
                                         mtime = excluded.mtime,
                                         size = excluded.size",
        params![
            entry.path,
            source.as_str(),
            entry.hash,
            entry.mtime_ms,
            entry.size as i64,
        ],
    )?;
    tx.commit()?;
    debug!(path = %entry.path, chunks = chunks.len(), "indexed file");
    Ok(())
}

fn ensure_vec_table_for(conn: &Connection, caps: &mut StoreCaps, dims: usize) -> Result<()> {
    match caps.vector_dims {
        Some(existing) if existing == dims => Ok(()),
        Some(existing) => {
            // mixed dimensionality cannot share one vec0 table; keep the first
            warn!(existing, got = dims, "embedding dimensionality mismatch, skipping vector row");
            Ok(())
        }
        None => {
            ensure_vector_table(conn, dims)?;
            caps.vector_dims = Some(dims);
            Ok(())
        }
    }
}

/// Embed every distinct chunk hash, consulting the cache first. Cache misses
/// go to the provider in token-bounded batches under the circuit breaker, with
/// a per-chunk fallback; fresh vectors are written back to the cache.
fn embed_chunks(
    conn: &Connection,
    ctx: &SyncContext,
    chunks: &[Chunk],
) -> Result<HashMap<String, Vec<f32>>> {
    let mut seen = HashSet::new();
    let distinct: Vec<&Chunk> = chunks
        .iter()
        .filter(|c| seen.insert(c.hash.clone()))
        .collect();
    if distinct.is_empty() {
        return Ok(HashMap::new());
    }

    let hashes: Vec<String> = distinct.iter().map(|c| c.hash.clone()).collect();
    let mut vectors = if ctx.config.cache.enabled {
        cache::get_many(conn, ctx.cache_scope, &hashes)?
    } else {
        HashMap::new()
    };

    let missing: Vec<Chunk> = distinct
        .into_iter()
        .filter(|c| !vectors.contains_key(&c.hash))
        .cloned()
        .collect();
    if missing.is_empty() {
        return Ok(vectors);
    }

    let embedded = embed_texts(ctx, &missing)?;
    let fresh: Vec<(String, Vec<f32>)> = missing
        .iter()
        .map(|c| c.hash.clone())
        .zip(embedded)
        .collect();
    if ctx.config.cache.enabled {
        cache::put_many(conn, ctx.cache_scope, &fresh)?;
    }
    for (hash, vector) in fresh {
        vectors.insert(hash, vector);
    }
    Ok(vectors)
}

/// Embed chunks through the batch manager, in token-bounded batches with a
/// per-chunk fallback. Touches no store handle, so callers may run it with no
/// lock held.
fn embed_texts(ctx: &SyncContext, chunks: &[Chunk]) -> Result<Vec<Vec<f32>>> {
    let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
    let mut out = Vec::with_capacity(texts.len());
    for range in plan_batches(&texts, ctx.config.embedding.batch.max_tokens) {
        let slice = &texts[range];
        let embedded = ctx
            .batch
            .run_with_fallback(
                &|| ctx.provider.embed_batch(slice),
                || {
                    slice
                        .iter()
                        .map(|text| ctx.provider.embed_query(text))
                        .collect::<Result<Vec<_>, EmbedError>>()
                },
            )
            .map_err(|err| anyhow!(err))?;
        if embedded.len() != slice.len() {
            return Err(anyhow!(
                "provider returned {} embeddings for {} chunks",
                embedded.len(),
                slice.len()
            ));
        }
        out.extend(embedded);
    }
    Ok(out)
}

// ── Deletion ──────────────────────────────────────────────────────────────────

fn delete_file_rows(conn: &Connection, caps: &StoreCaps, path: &str) -> Result<()> {
    let mut stmt = conn.prepare("SELECT id FROM chunks WHERE path = ?1")?;
    let ids = stmt
        .query_map(params![path], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    for id in &ids {
        // side tables exist exactly when the capability flags say so; a failed
        // delete on an existing table must surface, not leave ghost rows
        if caps.fts_available {
            conn.execute("DELETE FROM chunks_fts WHERE id = ?1", params![id])?;
        }
        if caps.vector_dims.is_some() {
            conn.execute("DELETE FROM chunks_vec WHERE id = ?1", params![id])?;
        }
    }
    conn.execute("DELETE FROM chunks WHERE path = ?1", params![path])?;
    Ok(())
}

/// Remove every trace of a file that disappeared from disk.
pub fn delete_file(conn: &Connection, caps: &StoreCaps, path: &str) -> Result<()> {
    let tx = conn.unchecked_transaction()?;
    delete_file_rows(&tx, caps, path)?;
    tx.execute("DELETE FROM files WHERE path = ?1", params![path])?;
    tx.commit()?;
    debug!(path, "removed stale file from index");
    Ok(())
}

// ── Full rebuild ──────────────────────────────────────────────────────────────

/// Open a fresh store at `temp_path` for a full rebuild. The caller seeds the
/// embedding cache into it (holding whatever lock guards the serving store for
/// only that copy), then runs [`populate_full_index`] lock-free.
pub fn prepare_rebuild_store(temp_path: &Path, fts_enabled: bool) -> Result<(Connection, StoreCaps)> {
    let conn = crate::db::open_database(temp_path)?;
    let schema_caps = schema::ensure_schema(&conn, fts_enabled)?;
    let caps = StoreCaps {
        fts_available: schema_caps.fts_available,
        vector_available: crate::db::probe_vector_support(&conn),
        vector_dims: None,
    };
    Ok((conn, caps))
}

/// Index every entry into the rebuild store, stamp the configuration meta, and
/// prune the cache. The first error aborts the build; the caller discards the
/// temp file set, so the serving store is never touched by a failed rebuild.
pub fn populate_full_index(
    conn: &Connection,
    caps: &mut StoreCaps,
    ctx: &SyncContext,
    mut entries: Vec<FileEntry>,
    meta: &IndexMeta,
) -> Result<()> {
    for entry in &mut entries {
        let content = resolve_content(entry, ctx.sanitizer)
            .with_context(|| format!("failed to read {} during rebuild", entry.path))?;
        index_file(conn, caps, ctx, entry, &content)
            .with_context(|| format!("failed to index {} during rebuild", entry.path))?;
    }

    let stamped = IndexMeta {
        vector_dims: caps.vector_dims,
        ..meta.clone()
    };
    schema::write_meta(conn, &stamped)?;
    if ctx.config.cache.enabled {
        cache::prune(conn, ctx.config.cache.max_entries)?;
    }
    info!(files = entries.len(), "full index build complete");
    Ok(())
}
