#![allow(dead_code)]

use memdex::config::MemdexConfig;
use memdex::embedding::{EmbedError, EmbeddingProvider};
use memdex::index::{IndexManager, NoopSanitizer};
use memdex::Source;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

pub const DIMS: usize = 8;

/// Deterministic embedding provider backed by a hash of the input text, so
/// identical text always maps to the same vector and nothing needs a network.
/// Failure modes are toggled per test.
pub struct MockProvider {
    pub query_calls: AtomicU32,
    pub batch_calls: AtomicU32,
    /// Total texts embedded across query and batch calls.
    pub texts_embedded: AtomicU32,
    pub fail_all: AtomicBool,
    pub fail_batch_timeout: AtomicBool,
    pub reject_batch: AtomicBool,
    /// Per-call sleep inside `embed_batch`, to hold a sync mid-flight.
    pub batch_delay_ms: AtomicU32,
    /// Set when `embed_batch` begins, so tests can wait for the hold.
    pub batch_started: AtomicBool,
}

impl MockProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            query_calls: AtomicU32::new(0),
            batch_calls: AtomicU32::new(0),
            texts_embedded: AtomicU32::new(0),
            fail_all: AtomicBool::new(false),
            fail_batch_timeout: AtomicBool::new(false),
            reject_batch: AtomicBool::new(false),
            batch_delay_ms: AtomicU32::new(0),
            batch_started: AtomicBool::new(false),
        })
    }

    pub fn embedding_for(text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; DIMS];
        let mut acc: u32 = 17;
        for b in text.bytes() {
            acc = acc.wrapping_mul(31).wrapping_add(b as u32);
        }
        v[(acc as usize) % DIMS] = 1.0;
        v[(acc as usize / DIMS) % DIMS] += 0.25;
        v
    }
}

/// `Arc<MockProvider>` is what tests hold on to for assertions; the manager
/// gets a boxed clone of the same counters.
pub struct SharedProvider(pub Arc<MockProvider>);

impl EmbeddingProvider for SharedProvider {
    fn id(&self) -> &str {
        "mock"
    }

    fn model(&self) -> &str {
        "mock-model"
    }

    fn embed_query(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
        self.0.query_calls.fetch_add(1, Ordering::SeqCst);
        if self.0.fail_all.load(Ordering::SeqCst) {
            return Err(EmbedError::Provider(anyhow::anyhow!("provider offline")));
        }
        self.0.texts_embedded.fetch_add(1, Ordering::SeqCst);
        Ok(MockProvider::embedding_for(text))
    }

    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        self.0.batch_calls.fetch_add(1, Ordering::SeqCst);
        self.0.batch_started.store(true, Ordering::SeqCst);
        let delay = self.0.batch_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            std::thread::sleep(std::time::Duration::from_millis(delay as u64));
        }
        if self.0.fail_all.load(Ordering::SeqCst) {
            return Err(EmbedError::Provider(anyhow::anyhow!("provider offline")));
        }
        if self.0.fail_batch_timeout.load(Ordering::SeqCst) {
            return Err(EmbedError::Timeout { attempts: 1 });
        }
        if self.0.reject_batch.load(Ordering::SeqCst) {
            return Err(EmbedError::BatchUnsupported("array input rejected".into()));
        }
        self.0
            .texts_embedded
            .fetch_add(texts.len() as u32, Ordering::SeqCst);
        Ok(texts.iter().map(|t| MockProvider::embedding_for(t)).collect())
    }
}

/// A throwaway agent environment: workspace, sessions dir, and data dir under
/// one temp root, with background sync triggers disabled for determinism.
pub struct TestEnv {
    pub root: TempDir,
    pub config: MemdexConfig,
    pub provider: Arc<MockProvider>,
}

pub const AGENT: &str = "main";

impl TestEnv {
    pub fn new() -> Self {
        let root = TempDir::new().unwrap();
        let mut config = MemdexConfig::default();
        config.storage.data_dir = root.path().join("index").to_string_lossy().into_owned();
        config.storage.workspace_root =
            root.path().join("workspace").to_string_lossy().into_owned();
        config.storage.sessions_root =
            root.path().join("sessions").to_string_lossy().into_owned();
        config.sync.watch = false;
        config.sync.on_search = false;
        config.sync.on_session_start = false;
        config.sync.on_session_delta = false;
        std::fs::create_dir_all(config.workspace_dir(AGENT)).unwrap();
        std::fs::create_dir_all(config.sessions_dir(AGENT)).unwrap();
        Self {
            root,
            config,
            provider: MockProvider::new(),
        }
    }

    pub fn manager(&self) -> Arc<IndexManager> {
        IndexManager::with_provider(
            AGENT,
            self.config.clone(),
            Box::new(SharedProvider(self.provider.clone())),
            Box::new(NoopSanitizer),
        )
        .unwrap()
    }

    pub fn workspace(&self) -> PathBuf {
        self.config.workspace_dir(AGENT)
    }

    pub fn sessions_dir(&self) -> PathBuf {
        self.config.sessions_dir(AGENT)
    }

    pub fn db_path(&self) -> PathBuf {
        self.config.db_path(AGENT)
    }

    pub fn write_note(&self, rel_path: &str, content: &str) {
        let path = self.workspace().join(rel_path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, content).unwrap();
    }

    pub fn write_session(&self, name: &str, turns: &[(&str, &str)]) {
        let lines: Vec<String> = turns
            .iter()
            .map(|(role, text)| {
                serde_json::json!({
                    "type": "message",
                    "message": { "role": role, "content": text }
                })
                .to_string()
            })
            .collect();
        std::fs::write(self.sessions_dir().join(name), lines.join("\n") + "\n").unwrap();
    }
}

pub fn paths_of(results: &[memdex::MemorySearchResult]) -> Vec<&str> {
    results.iter().map(|r| r.path.as_str()).collect()
}

pub fn memory_sources_only(results: &[memdex::MemorySearchResult]) -> bool {
    results.iter().all(|r| r.source == Source::Memory)
}
