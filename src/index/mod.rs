//! The per-agent memory index manager.
//!
//! [`IndexManager`] owns one store (`<data_dir>/<agent>/index.db`), the
//! embedding pipeline for it, and a background supervisor for watch-, delta-,
//! and interval-triggered syncs. Syncs are single-flight per manager; search
//! reads the currently served store and keeps working while a full rebuild
//! writes into its own temp file set.

pub mod search;
pub mod sessions;
pub mod sync;
pub mod types;
mod watch;

use anyhow::{anyhow, Context, Result};
use rusqlite::Connection;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tracing::{debug, info, warn};

use crate::config::MemdexConfig;
use crate::db::{self, schema, swap};
use crate::embedding::batch::BatchManager;
use crate::embedding::cache::{self, CacheScope};
use crate::embedding::{provider_key, EmbeddingProvider};
use search::SearchParams;
use sessions::SessionTracker;
use sync::{StoreCaps, SyncContext};
use types::{
    IndexMeta, IndexStatus, MemorySearchResult, SearchOptions, Source, SyncOptions, SyncReason,
};
use watch::WatchSupervisor;

/// Host-provided content scrubbing, applied to note text before chunking.
pub trait Sanitizer: Send + Sync {
    fn sanitize(&self, text: &str) -> String;
}

/// Passes content through untouched.
pub struct NoopSanitizer;

impl Sanitizer for NoopSanitizer {
    fn sanitize(&self, text: &str) -> String {
        text.to_string()
    }
}

struct StoreState {
    conn: Connection,
    caps: StoreCaps,
}

struct IndexState {
    /// `None` once the manager is closed.
    store: Option<StoreState>,
    /// Whether a sync is known to be pending.
    dirty: bool,
    tracker: SessionTracker,
    /// Session keys already seen by `search`, for session-start warm-up.
    warm_sessions: HashSet<String>,
}

pub struct IndexManager {
    agent_id: String,
    config: MemdexConfig,
    provider: Box<dyn EmbeddingProvider>,
    sanitizer: Box<dyn Sanitizer>,
    batch: BatchManager,
    cache_scope: CacheScope,
    db_path: PathBuf,
    workspace: PathBuf,
    sessions_dir: PathBuf,
    state: Mutex<IndexState>,
    /// Serializes whole sync passes; concurrent callers queue here.
    sync_flight: Mutex<()>,
    supervisor: Mutex<Option<WatchSupervisor>>,
}

impl IndexManager {
    /// Construct a manager with an explicit provider and sanitizer. Opens (or
    /// creates) the store immediately; the first sync decides whether its
    /// contents are still valid for the current configuration.
    pub fn with_provider(
        agent_id: &str,
        config: MemdexConfig,
        provider: Box<dyn EmbeddingProvider>,
        sanitizer: Box<dyn Sanitizer>,
    ) -> Result<Arc<Self>> {
        let db_path = config.db_path(agent_id);
        let workspace = config.workspace_dir(agent_id);
        let sessions_dir = config.sessions_dir(agent_id);
        let key = provider_key(provider.id(), &config.embedding.base_url, provider.model());
        let cache_scope = CacheScope {
            provider: provider.id().to_string(),
            model: provider.model().to_string(),
            provider_key: key,
        };
        let batch = BatchManager::new(
            config.embedding.batch.enabled,
            config.embedding.batch.failure_limit,
        );

        let store = open_store(&db_path, &config)?;
        let sync_config = config.sync.clone();
        let watch_root = workspace.clone();

        let manager = Arc::new_cyclic(|weak: &Weak<IndexManager>| IndexManager {
            agent_id: agent_id.to_string(),
            config,
            provider,
            sanitizer,
            batch,
            cache_scope,
            db_path,
            workspace,
            sessions_dir,
            state: Mutex::new(IndexState {
                store: Some(store),
                dirty: true,
                tracker: SessionTracker::default(),
                warm_sessions: HashSet::new(),
            }),
            sync_flight: Mutex::new(()),
            supervisor: Mutex::new(Some(WatchSupervisor::start(
                weak.clone(),
                &sync_config,
                watch_root,
            ))),
        });
        info!(agent = agent_id, "memory index manager ready");
        Ok(manager)
    }

    fn lock_state(&self) -> MutexGuard<'_, IndexState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn sync_context(&self) -> SyncContext<'_> {
        SyncContext {
            provider: self.provider.as_ref(),
            batch: &self.batch,
            cache_scope: &self.cache_scope,
            config: &self.config,
            sanitizer: self.sanitizer.as_ref(),
        }
    }

    fn expected_meta(&self) -> IndexMeta {
        IndexMeta {
            provider: self.provider.id().to_string(),
            model: self.provider.model().to_string(),
            provider_key: self.cache_scope.provider_key.clone(),
            chunk_tokens: self.config.chunking.tokens,
            chunk_overlap: self.config.chunking.overlap,
            vector_dims: None,
        }
    }

    fn vectors_wanted(&self) -> bool {
        self.config.storage.vector_enabled
    }

    fn request_background_sync(&self, reason: SyncReason) {
        let guard = self
            .supervisor
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if let Some(supervisor) = guard.as_ref() {
            supervisor.request_sync(reason);
        }
    }

    // ── Sync ──────────────────────────────────────────────────────────────────

    /// Bring the index up to date. Forced or configuration-invalidated syncs
    /// run a full rebuild into a temp store and atomically swap it in; anything
    /// else is an incremental pass over dirty files. An error leaves the
    /// previously served index intact and queryable.
    pub fn sync(&self, options: SyncOptions) -> Result<()> {
        let _flight = self
            .sync_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner());

        let expected = self.expected_meta();
        let needs_full = {
            let state = self.lock_state();
            let store = state
                .store
                .as_ref()
                .ok_or_else(|| anyhow!("index manager is closed"))?;
            sync::needs_full_reindex(&store.conn, &expected, self.vectors_wanted())
        };

        if options.force || needs_full {
            debug!(
                agent = %self.agent_id,
                reason = options.reason.as_str(),
                forced = options.force,
                "running full rebuild"
            );
            return self.run_full_rebuild(&expected);
        }
        self.run_incremental(options.reason)
    }

    fn run_incremental(&self, reason: SyncReason) -> Result<()> {
        let sources = &self.config.storage.sources;
        let mut entries = Vec::new();
        let mut scanned: Vec<Source> = Vec::new();

        if sources.contains(&Source::Memory) {
            entries.extend(sync::list_memory_files(&self.workspace)?);
            scanned.push(Source::Memory);
        }
        // Routine churn (watch events, session warm-up) skips transcripts;
        // they only resync once accumulated deltas cross the thresholds.
        let sessions_due = {
            let state = self.lock_state();
            state.tracker.should_sync(&self.config.sync)
        };
        let skip_sessions = matches!(reason, SyncReason::Watch | SyncReason::SessionStart);
        if sources.contains(&Source::Sessions) && !skip_sessions && sessions_due {
            entries.extend(sessions::list_session_files(&self.sessions_dir)?);
            scanned.push(Source::Sessions);
        }

        let ctx = self.sync_context();

        // Plan under the lock (disk + SQLite only), embed with the lock
        // released so searches keep serving, then apply under the lock again.
        // The sync-flight mutex keeps other syncs from interleaving between
        // the phases.
        let mut plan = {
            let state = self.lock_state();
            let store = state
                .store
                .as_ref()
                .ok_or_else(|| anyhow!("index manager is closed"))?;
            sync::plan_incremental(&store.conn, &store.caps, &ctx, entries, &scanned)?
        };

        let fresh = sync::embed_plan(&ctx, &mut plan);

        let mut state = self.lock_state();
        let store = state
            .store
            .as_mut()
            .ok_or_else(|| anyhow!("index manager is closed"))?;
        let report = sync::apply_incremental(&store.conn, &mut store.caps, &ctx, plan, fresh)?;

        state.dirty = false;
        if scanned.contains(&Source::Sessions) {
            state.tracker.reset();
        }
        drop(state);
        report.into_result()
    }

    fn run_full_rebuild(&self, expected: &IndexMeta) -> Result<()> {
        let sources = &self.config.storage.sources;
        let mut entries = Vec::new();
        if sources.contains(&Source::Memory) {
            entries.extend(sync::list_memory_files(&self.workspace)?);
        }
        if sources.contains(&Source::Sessions) {
            entries.extend(sessions::list_session_files(&self.sessions_dir)?);
        }

        let temp = swap::temp_store_path(&self.db_path);
        let (temp_conn, mut caps) =
            sync::prepare_rebuild_store(&temp, self.config.query.hybrid_enabled)?;

        // cache seeding is the only part that reads the serving store
        if self.config.cache.enabled {
            let state = self.lock_state();
            if let Some(store) = &state.store {
                let seeded = cache::copy_all(&store.conn, &temp_conn)?;
                debug!(seeded, "seeded embedding cache into rebuild store");
            }
        }

        let ctx = self.sync_context();
        let populated = sync::populate_full_index(&temp_conn, &mut caps, &ctx, entries, expected);
        if let Err((_, err)) = temp_conn.close() {
            warn!(error = %err, "failed to close rebuild store cleanly");
        }
        if let Err(err) = populated {
            if let Err(cleanup) = swap::remove_index_files(&temp) {
                warn!(error = %cleanup, "failed to remove temp store after aborted rebuild");
            }
            return Err(err);
        }

        // Swap under the state lock: drop the serving handle, rename the file
        // sets, reopen. A failed swap restores the backup, so reopening always
        // lands on a complete index. A manager closed while the build ran must
        // stay closed, so the finished build is discarded instead of swapped.
        let mut state = self.lock_state();
        let Some(previous) = state.store.take() else {
            drop(state);
            if let Err(cleanup) = swap::remove_index_files(&temp) {
                warn!(error = %cleanup, "failed to remove temp store after close during rebuild");
            }
            return Err(anyhow!("index manager closed during rebuild"));
        };
        drop(previous);
        let swap_result = swap::swap_index_files(&self.db_path, &temp);
        let reopened = open_store(&self.db_path, &self.config)
            .context("failed to reopen index store after rebuild")?;
        state.store = Some(reopened);
        if let Err(err) = swap_result {
            drop(state);
            if let Err(cleanup) = swap::remove_index_files(&temp) {
                warn!(error = %cleanup, "failed to remove temp store after failed swap");
            }
            return Err(err);
        }
        state.dirty = false;
        state.tracker.reset();
        drop(state);
        info!(agent = %self.agent_id, "full rebuild swapped in");
        Ok(())
    }

    // ── Search ────────────────────────────────────────────────────────────────

    /// Hybrid search over the served index. Provider failures on the query
    /// embedding degrade to keyword-only; an FTS-less store degrades to
    /// vector-only. Never blocks on a sync.
    pub fn search(
        &self,
        query: &str,
        options: &SearchOptions,
    ) -> Result<Vec<MemorySearchResult>> {
        // session warm-up: first sight of a session key may kick a sync
        if let Some(key) = &options.session_key {
            let mut state = self.lock_state();
            if state.warm_sessions.insert(key.clone()) && self.config.sync.on_session_start {
                drop(state);
                self.request_background_sync(SyncReason::SessionStart);
            }
        }

        let (want_vector, dims) = {
            let state = self.lock_state();
            let store = state
                .store
                .as_ref()
                .ok_or_else(|| anyhow!("index manager is closed"))?;
            if self.config.sync.on_search && state.dirty {
                self.request_background_sync(SyncReason::Search);
            }
            (
                self.vectors_wanted()
                    && store.caps.vector_available
                    && store.caps.vector_dims.is_some(),
                store.caps.vector_dims,
            )
        };

        // the query embedding happens outside the state lock
        let query_embedding = if want_vector {
            match self.provider.embed_query(query) {
                Ok(vector) if Some(vector.len()) == dims => Some(vector),
                Ok(vector) => {
                    warn!(
                        got = vector.len(),
                        expected = ?dims,
                        "query embedding dimensionality mismatch, keyword-only search"
                    );
                    None
                }
                Err(err) => {
                    warn!(error = %err, "query embedding failed, keyword-only search");
                    None
                }
            }
        } else {
            None
        };

        let params = SearchParams {
            max_results: options
                .max_results
                .unwrap_or(self.config.query.max_results),
            min_score: options.min_score.unwrap_or(self.config.query.min_score),
            candidate_multiplier: self.config.query.candidate_multiplier,
            vector_weight: self.config.query.vector_weight,
            text_weight: self.config.query.text_weight,
            sources: options.sources.clone(),
            model: self.provider.model().to_string(),
        };

        let state = self.lock_state();
        let store = state
            .store
            .as_ref()
            .ok_or_else(|| anyhow!("index manager is closed"))?;
        let fts = store.caps.fts_available && self.config.query.hybrid_enabled;
        search::search_index(
            &store.conn,
            query,
            query_embedding.as_deref(),
            fts,
            &params,
        )
    }

    // ── Session deltas ────────────────────────────────────────────────────────

    /// Host notification that a transcript file was appended to. Accumulates
    /// deltas and kicks a background sync once they cross the thresholds.
    pub fn note_session_update(&self, path: &Path) {
        let mut state = self.lock_state();
        state.tracker.note_update(path);
        if state.tracker.should_sync(&self.config.sync) && !state.dirty {
            state.dirty = true;
            drop(state);
            if self.config.sync.on_session_delta {
                self.request_background_sync(SyncReason::SessionDelta);
            }
        }
    }

    // ── Introspection & lifecycle ─────────────────────────────────────────────

    pub fn status(&self) -> Result<IndexStatus> {
        let state = self.lock_state();
        let store = state
            .store
            .as_ref()
            .ok_or_else(|| anyhow!("index manager is closed"))?;
        let files: i64 = store
            .conn
            .query_row("SELECT COUNT(*) FROM files", [], |row| row.get(0))?;
        let chunks: i64 = store
            .conn
            .query_row("SELECT COUNT(*) FROM chunks", [], |row| row.get(0))?;
        let cache_entries = cache::count(&store.conn)?;
        Ok(IndexStatus {
            agent_id: self.agent_id.clone(),
            provider: self.provider.id().to_string(),
            model: self.provider.model().to_string(),
            files,
            chunks,
            cache_entries,
            dirty: state.dirty,
            fts_available: store.caps.fts_available,
            vector_available: Some(store.caps.vector_available),
            vector_dims: store.caps.vector_dims,
            batch_enabled: self.batch.is_enabled(),
            batch_failures: self.batch.failure_count(),
            batch_last_error: self.batch.last_error(),
        })
    }

    /// Stop background work and release the store. Further calls error.
    pub fn close(&self) {
        let supervisor = self
            .supervisor
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(mut supervisor) = supervisor {
            supervisor.shutdown();
        }
        drop(self.lock_state().store.take());
        debug!(agent = %self.agent_id, "memory index manager closed");
    }
}

fn open_store(db_path: &Path, config: &MemdexConfig) -> Result<StoreState> {
    let conn = db::open_database(db_path)?;
    let schema_caps = schema::ensure_schema(&conn, config.query.hybrid_enabled)?;
    let vector_available = config.storage.vector_enabled && db::probe_vector_support(&conn);
    let vector_dims = schema::read_meta(&conn).and_then(|meta| meta.vector_dims);
    Ok(StoreState {
        conn,
        caps: StoreCaps {
            fts_available: schema_caps.fts_available,
            vector_available,
            vector_dims,
        },
    })
}
