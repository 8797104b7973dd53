//! Per-agent manager registry.
//!
//! The host owns one registry; managers are constructed lazily per agent id
//! and shared behind `Arc`. There is no global state: dropping the registry
//! (after `close_all`) releases every store and supervisor.

use anyhow::Result;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::debug;

use crate::config::MemdexConfig;
use crate::embedding::http::HttpEmbeddingProvider;
use crate::index::{IndexManager, NoopSanitizer, Sanitizer};

pub struct MemoryIndexRegistry {
    config: MemdexConfig,
    sanitizer: Arc<dyn Fn() -> Box<dyn Sanitizer> + Send + Sync>,
    managers: Mutex<HashMap<String, Arc<IndexManager>>>,
}

impl MemoryIndexRegistry {
    pub fn new(config: MemdexConfig) -> Self {
        Self::with_sanitizer(config, || Box::new(NoopSanitizer))
    }

    /// A registry whose managers scrub content with host-provided logic.
    pub fn with_sanitizer(
        config: MemdexConfig,
        sanitizer: impl Fn() -> Box<dyn Sanitizer> + Send + Sync + 'static,
    ) -> Self {
        Self {
            config,
            sanitizer: Arc::new(sanitizer),
            managers: Mutex::new(HashMap::new()),
        }
    }

    /// The manager for `agent_id`, constructed on first use. Returns `None`
    /// when memory search is disabled in configuration.
    pub fn get(&self, agent_id: &str) -> Result<Option<Arc<IndexManager>>> {
        if !self.config.enabled {
            return Ok(None);
        }
        let mut managers = self.managers.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(manager) = managers.get(agent_id) {
            return Ok(Some(manager.clone()));
        }
        let provider = HttpEmbeddingProvider::from_config(&self.config.embedding)?;
        let manager = IndexManager::with_provider(
            agent_id,
            self.config.clone(),
            Box::new(provider),
            (self.sanitizer)(),
        )?;
        debug!(agent = agent_id, "constructed memory index manager");
        managers.insert(agent_id.to_string(), manager.clone());
        Ok(Some(manager))
    }

    /// Close every manager. The registry stays usable; closed managers are
    /// dropped and will be rebuilt on the next `get`.
    pub fn close_all(&self) {
        let mut managers = self.managers.lock().unwrap_or_else(|e| e.into_inner());
        for (_, manager) in managers.drain() {
            manager.close();
        }
    }
}

impl Drop for MemoryIndexRegistry {
    fn drop(&mut self) {
        self.close_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_config_yields_no_managers() {
        let mut config = MemdexConfig::default();
        config.enabled = false;
        let registry = MemoryIndexRegistry::new(config);
        assert!(registry.get("main").unwrap().is_none());
    }

    #[test]
    fn managers_are_shared_per_agent() {
        let tmp = tempfile::TempDir::new().unwrap();
        let mut config = MemdexConfig::default();
        config.storage.data_dir = tmp.path().join("index").to_string_lossy().into_owned();
        config.storage.workspace_root =
            tmp.path().join("workspace").to_string_lossy().into_owned();
        config.storage.sessions_root = tmp.path().join("sessions").to_string_lossy().into_owned();
        config.sync.watch = false;

        let registry = MemoryIndexRegistry::new(config);
        let a = registry.get("main").unwrap().unwrap();
        let b = registry.get("main").unwrap().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        registry.close_all();
    }
}
