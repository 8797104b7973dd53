//! Background sync supervision: filesystem watch, interval resync, and the
//! thread that actually runs background syncs.
//!
//! All background-triggered syncs funnel through one supervisor thread per
//! manager. The thread owns nothing but a `Weak` back-reference, so dropping
//! the manager ends supervision, and every sync outcome is consumed and
//! logged on the spot; a failing background sync can never panic the host or
//! leave an error unobserved.

use notify_debouncer_full::notify::{RecursiveMode, Watcher};
use notify_debouncer_full::{new_debouncer, DebounceEventResult, Debouncer, FileIdMap};
use std::path::PathBuf;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Weak;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, warn};

use super::IndexManager;
use crate::config::SyncConfig;
use crate::index::types::{SyncOptions, SyncReason};

type FsDebouncer = Debouncer<notify_debouncer_full::notify::RecommendedWatcher, FileIdMap>;

pub(crate) enum SupervisorEvent {
    Sync(SyncReason),
    Shutdown,
}

pub(crate) struct WatchSupervisor {
    tx: Sender<SupervisorEvent>,
    debouncer: Option<FsDebouncer>,
    join: Option<JoinHandle<()>>,
}

impl WatchSupervisor {
    /// Spawn the supervisor thread and, when configured, the filesystem
    /// watcher over the workspace. Watch setup failure degrades to
    /// trigger-only syncing rather than failing manager construction.
    pub fn start(manager: Weak<IndexManager>, config: &SyncConfig, workspace: PathBuf) -> Self {
        let (tx, rx) = mpsc::channel::<SupervisorEvent>();

        let interval = (config.interval_minutes > 0)
            .then(|| Duration::from_secs(config.interval_minutes * 60));
        let join = std::thread::Builder::new()
            .name("memdex-sync".into())
            .spawn(move || {
                // idle tick only matters when interval resync is on
                let tick = interval.unwrap_or(Duration::from_secs(3600));
                loop {
                    match rx.recv_timeout(tick) {
                        Ok(SupervisorEvent::Sync(reason)) => run_background_sync(&manager, reason),
                        Ok(SupervisorEvent::Shutdown) | Err(RecvTimeoutError::Disconnected) => {
                            break
                        }
                        Err(RecvTimeoutError::Timeout) => {
                            if interval.is_some() {
                                run_background_sync(&manager, SyncReason::Interval);
                            }
                        }
                    }
                }
            })
            .ok();
        if join.is_none() {
            warn!("failed to spawn sync supervisor thread");
        }

        let debouncer = if config.watch {
            start_watcher(tx.clone(), config.watch_debounce_ms, &workspace)
        } else {
            None
        };

        Self {
            tx,
            debouncer,
            join,
        }
    }

    /// Queue a background sync. Never blocks; a dead supervisor drops it.
    pub fn request_sync(&self, reason: SyncReason) {
        let _ = self.tx.send(SupervisorEvent::Sync(reason));
    }

    pub fn shutdown(&mut self) {
        self.debouncer.take(); // stops the watcher threads
        let _ = self.tx.send(SupervisorEvent::Shutdown);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl Drop for WatchSupervisor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_background_sync(manager: &Weak<IndexManager>, reason: SyncReason) {
    let Some(manager) = manager.upgrade() else {
        return;
    };
    match manager.sync(SyncOptions {
        force: false,
        reason,
    }) {
        Ok(()) => debug!(reason = reason.as_str(), "background sync complete"),
        Err(err) => warn!(reason = reason.as_str(), error = %err, "background sync failed"),
    }
}

fn start_watcher(tx: Sender<SupervisorEvent>, debounce_ms: u64, workspace: &PathBuf) -> Option<FsDebouncer> {
    if !workspace.is_dir() {
        debug!(path = %workspace.display(), "workspace missing, not watching");
        return None;
    }
    let event_tx = tx;
    let debouncer = new_debouncer(
        Duration::from_millis(debounce_ms.max(100)),
        None,
        move |result: DebounceEventResult| match result {
            Ok(events) => {
                let touched_notes = events.iter().any(|event| {
                    event
                        .paths
                        .iter()
                        .any(|p| p.extension().and_then(|e| e.to_str()) == Some("md"))
                });
                if touched_notes {
                    let _ = event_tx.send(SupervisorEvent::Sync(SyncReason::Watch));
                }
            }
            Err(errors) => {
                for err in errors {
                    warn!(error = %err, "filesystem watch error");
                }
            }
        },
    );
    let mut debouncer = match debouncer {
        Ok(d) => d,
        Err(err) => {
            warn!(error = %err, "failed to create filesystem watcher");
            return None;
        }
    };
    if let Err(err) = debouncer
        .watcher()
        .watch(workspace, RecursiveMode::Recursive)
    {
        warn!(error = %err, path = %workspace.display(), "failed to watch workspace");
        return None;
    }
    debug!(path = %workspace.display(), "watching workspace for note changes");
    Some(debouncer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn supervisor_starts_and_shuts_down_without_a_manager() {
        let tmp = TempDir::new().unwrap();
        let config = SyncConfig {
            watch: true,
            watch_debounce_ms: 100,
            ..SyncConfig::default()
        };
        let mut supervisor =
            WatchSupervisor::start(Weak::new(), &config, tmp.path().to_path_buf());
        supervisor.request_sync(SyncReason::Search);
        supervisor.shutdown();
        // second shutdown is a no-op
        supervisor.shutdown();
    }

    #[test]
    fn missing_workspace_disables_watching_only() {
        let config = SyncConfig::default();
        let mut supervisor = WatchSupervisor::start(
            Weak::new(),
            &config,
            PathBuf::from("/nonexistent/workspace"),
        );
        assert!(supervisor.debouncer.is_none());
        supervisor.shutdown();
    }
}
