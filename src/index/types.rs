//! Core index type definitions.
//!
//! Defines [`Source`] (the two content classes), [`MemorySearchResult`],
//! [`IndexMeta`] (the configuration stamp a store was built with), and the
//! option structs for sync and search calls.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// The two content classes the index covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    /// Long-lived memory notes: `MEMORY.md` and `memory/**/*.md`.
    Memory,
    /// Historical conversation transcripts (`sessions/*.jsonl`).
    Sessions,
}

impl Source {
    /// SQL-compatible string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Sessions => "sessions",
        }
    }
}

impl std::fmt::Display for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A ranked search hit.
#[derive(Debug, Clone, Serialize)]
pub struct MemorySearchResult {
    /// Store-relative path (`MEMORY.md`, `memory/...`, `sessions/...`).
    pub path: String,
    pub start_line: usize,
    pub end_line: usize,
    /// Merged hybrid score in `[0, 1]`.
    pub score: f64,
    /// Leading slice of the chunk text, at most [`SNIPPET_MAX_CHARS`] chars.
    pub snippet: String,
    pub source: Source,
}

/// One scanned file, before chunking.
#[derive(Debug, Clone)]
pub struct FileEntry {
    /// Store-relative path.
    pub path: String,
    pub abs_path: PathBuf,
    /// Modification time in milliseconds since the epoch.
    pub mtime_ms: i64,
    pub size: u64,
    /// Content hash (sha256 hex).
    pub hash: String,
    /// Pre-extracted content (session transcripts); memory files are read lazily.
    pub content: Option<String>,
}

/// The configuration stamp written once per successful full rebuild.
///
/// Chunk identity depends on all of these, so any mismatch with the requested
/// configuration forces a full reindex.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexMeta {
    pub provider: String,
    pub model: String,
    pub provider_key: String,
    pub chunk_tokens: usize,
    pub chunk_overlap: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vector_dims: Option<usize>,
}

/// What triggered a sync. Session content is skipped for watch- and
/// session-start-triggered syncs so routine churn stays cheap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncReason {
    Manual,
    Search,
    SessionStart,
    SessionDelta,
    Watch,
    Interval,
}

impl SyncReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Search => "search",
            Self::SessionStart => "session-start",
            Self::SessionDelta => "session-delta",
            Self::Watch => "watch",
            Self::Interval => "interval",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SyncOptions {
    /// Force a full rebuild even when nothing looks dirty.
    pub force: bool,
    pub reason: SyncReason,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            force: false,
            reason: SyncReason::Manual,
        }
    }
}

impl SyncOptions {
    pub fn forced() -> Self {
        Self {
            force: true,
            reason: SyncReason::Manual,
        }
    }
}

/// Per-call search knobs; `None` fields fall back to configuration.
#[derive(Debug, Clone, Default)]
pub struct SearchOptions {
    pub max_results: Option<usize>,
    pub min_score: Option<f64>,
    /// Session key for warm-up tracking (first sight may trigger a background sync).
    pub session_key: Option<String>,
    /// Restrict results to a subset of sources.
    pub sources: Option<Vec<Source>>,
}

/// Counts and capability flags, for status/introspection surfaces.
#[derive(Debug, Clone, Serialize)]
pub struct IndexStatus {
    pub agent_id: String,
    pub provider: String,
    pub model: String,
    pub files: i64,
    pub chunks: i64,
    pub cache_entries: i64,
    pub dirty: bool,
    pub fts_available: bool,
    pub vector_available: Option<bool>,
    pub vector_dims: Option<usize>,
    pub batch_enabled: bool,
    pub batch_failures: u32,
    pub batch_last_error: Option<String>,
}

pub const META_KEY: &str = "memory_index_meta_v1";
pub const SNIPPET_MAX_CHARS: usize = 700;
/// Hard ceiling on the hybrid candidate pool per path.
pub const MAX_CANDIDATES: usize = 200;
