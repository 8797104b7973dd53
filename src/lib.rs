//! Hybrid local memory index for AI agents.
//!
//! memdex maintains a continuously-updated search index over two content
//! classes — long-lived memory notes and historical conversation transcripts —
//! and answers queries with a hybrid of keyword and vector ranking.
//!
//! # Architecture
//!
//! - **Storage**: SQLite with FTS5 for keyword search and
//!   [sqlite-vec](https://github.com/asg017/sqlite-vec) for vector search,
//!   one store file per agent, replaced atomically on full rebuilds
//! - **Embeddings**: pluggable [`embedding::EmbeddingProvider`] with a
//!   content-hash cache, token-bounded batching, and a circuit breaker that
//!   degrades to per-chunk calls when batching keeps failing
//! - **Sync**: incremental dirty-file detection (hash / mtime / size), with a
//!   full rebuild into a temporary store whenever the embedding or chunking
//!   configuration changes
//! - **Search**: keyword and vector candidates merged by configurable weights,
//!   deterministic tie-breaking by path and line range
//!
//! # Modules
//!
//! - [`config`] — Typed configuration from TOML files and environment variables
//! - [`db`] — Store open/close, schema, and the atomic swap protocol
//! - [`chunker`] — Structural markdown chunking with line ranges
//! - [`embedding`] — Provider trait, HTTP provider, batch manager, cache
//! - [`index`] — The per-agent manager: sync coordinator, hybrid search, watch
//! - [`registry`] — Keyed registry of per-agent managers, owned by the host

pub mod chunker;
pub mod config;
pub mod db;
pub mod embedding;
pub mod index;
pub mod logging;
pub mod registry;

pub use index::types::{MemorySearchResult, SearchOptions, Source, SyncOptions, SyncReason};
pub use index::{IndexManager, NoopSanitizer, Sanitizer};
pub use registry::MemoryIndexRegistry;
