use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::index::types::Source;

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct MemdexConfig {
    /// Master switch — when false, [`crate::registry::MemoryIndexRegistry::get`]
    /// returns `None` for every agent.
    pub enabled: bool,
    pub storage: StorageConfig,
    pub embedding: EmbeddingConfig,
    pub chunking: ChunkingConfig,
    pub cache: CacheConfig,
    pub query: QueryConfig,
    pub sync: SyncConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding one index store per agent (`<data_dir>/<agent>/index.db`).
    pub data_dir: String,
    /// Root of agent workspaces (`<workspace_root>/<agent>/MEMORY.md`, `memory/`).
    pub workspace_root: String,
    /// Root of session transcripts (`<sessions_root>/<agent>/*.jsonl`).
    pub sessions_root: String,
    /// Whether to build the sqlite-vec similarity index.
    pub vector_enabled: bool,
    /// Content sources to index.
    pub sources: Vec<Source>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// Embedding provider id. Currently only `"openai"` (OpenAI-compatible HTTP).
    pub provider: String,
    pub model: String,
    pub base_url: String,
    /// Environment variable holding the API key. The key itself never lives in config.
    pub api_key_env: String,
    /// Per-request timeout for query embeddings, seconds.
    pub query_timeout_secs: u64,
    /// Per-request timeout for batch embeddings, seconds.
    pub batch_timeout_secs: u64,
    pub batch: BatchConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct BatchConfig {
    pub enabled: bool,
    /// Consecutive failures after which batching is disabled for the session.
    pub failure_limit: u32,
    /// Estimated-token ceiling for one batch request.
    pub max_tokens: usize,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ChunkingConfig {
    /// Token budget per chunk (estimated, ~4 chars per token).
    pub tokens: usize,
    /// Token budget carried over from the previous chunk.
    pub overlap: usize,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    /// Oldest entries are pruned past this count after a full rebuild. 0 = unbounded.
    pub max_entries: usize,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct QueryConfig {
    pub max_results: usize,
    pub min_score: f64,
    /// Candidate pool per path = max_results × multiplier, capped at 200.
    pub candidate_multiplier: f64,
    /// When false, keyword search is skipped and results are vector-only.
    pub hybrid_enabled: bool,
    pub vector_weight: f64,
    pub text_weight: f64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SyncConfig {
    /// Watch the workspace memory files and resync on change.
    pub watch: bool,
    pub watch_debounce_ms: u64,
    /// Kick a background sync from `search()` when the index is dirty.
    pub on_search: bool,
    /// Kick a background sync the first time a session key is seen.
    pub on_session_start: bool,
    /// Kick a background sync when transcript deltas cross the thresholds.
    pub on_session_delta: bool,
    /// Periodic background resync. 0 = disabled.
    pub interval_minutes: u64,
    /// Accumulated dirty transcript bytes that force a session resync.
    pub session_delta_bytes: u64,
    /// Accumulated dirty transcript messages that force a session resync.
    pub session_delta_messages: u64,
}

impl Default for MemdexConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            storage: StorageConfig::default(),
            embedding: EmbeddingConfig::default(),
            chunking: ChunkingConfig::default(),
            cache: CacheConfig::default(),
            query: QueryConfig::default(),
            sync: SyncConfig::default(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        let base = default_memdex_dir();
        Self {
            data_dir: base.join("index").to_string_lossy().into_owned(),
            workspace_root: base.join("workspace").to_string_lossy().into_owned(),
            sessions_root: base.join("sessions").to_string_lossy().into_owned(),
            vector_enabled: true,
            sources: vec![Source::Memory, Source::Sessions],
        }
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "openai".into(),
            model: "text-embedding-3-small".into(),
            base_url: "https://api.openai.com/v1".into(),
            api_key_env: "OPENAI_API_KEY".into(),
            query_timeout_secs: 60,
            batch_timeout_secs: 120,
            batch: BatchConfig::default(),
        }
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_limit: 2,
            max_tokens: 8000,
        }
    }
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            tokens: 400,
            overlap: 80,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_entries: 50_000,
        }
    }
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            max_results: 8,
            min_score: 0.0,
            candidate_multiplier: 4.0,
            hybrid_enabled: true,
            vector_weight: 0.6,
            text_weight: 0.4,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            watch: true,
            watch_debounce_ms: 2000,
            on_search: true,
            on_session_start: true,
            on_session_delta: true,
            interval_minutes: 0,
            session_delta_bytes: 64 * 1024,
            session_delta_messages: 10,
        }
    }
}

/// Returns `~/.memdex/`
pub fn default_memdex_dir() -> PathBuf {
    dirs::home_dir()
        .expect("home directory must exist")
        .join(".memdex")
}

/// Returns the default config file path: `~/.memdex/config.toml`
pub fn default_config_path() -> PathBuf {
    default_memdex_dir().join("config.toml")
}

impl MemdexConfig {
    /// Load config from the default TOML file (if it exists) then apply env overrides.
    pub fn load() -> Result<Self> {
        Self::load_from(default_config_path())
    }

    /// Load from a specific path, then apply env var overrides.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path).context("failed to read config file")?;
            toml::from_str(&contents).context("failed to parse config TOML")?
        } else {
            info!("no config file at {}, using defaults", path.display());
            MemdexConfig::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides (MEMDEX_DATA_DIR, MEMDEX_MODEL, MEMDEX_BASE_URL).
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("MEMDEX_DATA_DIR") {
            self.storage.data_dir = val;
        }
        if let Ok(val) = std::env::var("MEMDEX_MODEL") {
            self.embedding.model = val;
        }
        if let Ok(val) = std::env::var("MEMDEX_BASE_URL") {
            self.embedding.base_url = val;
        }
    }

    /// Per-agent store file: `<data_dir>/<agent>/index.db`.
    pub fn db_path(&self, agent_id: &str) -> PathBuf {
        expand_tilde(&self.storage.data_dir)
            .join(agent_id)
            .join("index.db")
    }

    /// Per-agent workspace directory.
    pub fn workspace_dir(&self, agent_id: &str) -> PathBuf {
        expand_tilde(&self.storage.workspace_root).join(agent_id)
    }

    /// Per-agent session transcript directory.
    pub fn sessions_dir(&self, agent_id: &str) -> PathBuf {
        expand_tilde(&self.storage.sessions_root).join(agent_id)
    }
}

pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        dirs::home_dir()
            .expect("home directory must exist")
            .join(rest)
    } else {
        PathBuf::from(path)
    }
}
