//! Atomic replacement of the serving store with a freshly built one.
//!
//! A SQLite store in WAL mode is a *set* of files (`index.db`, `-wal`, `-shm`)
//! that must move together. A full rebuild writes into a temporary file set;
//! [`swap_index_files`] then performs the rename pair
//! `current → backup`, `temp → current`, restoring the backup if the second
//! rename fails. The serving path therefore always refers to either the last
//! successful index or a state recoverable to it.

use anyhow::{Context, Result};
use std::path::Path;
use tracing::warn;
use uuid::Uuid;

/// WAL-mode side files that travel with the primary store file.
const SIDE_SUFFIXES: &[&str] = &["", "-wal", "-shm"];

fn with_suffix(base: &Path, suffix: &str) -> std::path::PathBuf {
    let mut s = base.as_os_str().to_os_string();
    s.push(suffix);
    std::path::PathBuf::from(s)
}

/// Rename a store file set, skipping side files that do not exist.
pub fn move_index_files(source_base: &Path, target_base: &Path) -> Result<()> {
    for suffix in SIDE_SUFFIXES {
        let source = with_suffix(source_base, suffix);
        let target = with_suffix(target_base, suffix);
        match std::fs::rename(&source, &target) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                return Err(err).with_context(|| {
                    format!("failed to move {} to {}", source.display(), target.display())
                })
            }
        }
    }
    Ok(())
}

/// Delete a store file set, ignoring files that do not exist.
pub fn remove_index_files(base: &Path) -> Result<()> {
    for suffix in SIDE_SUFFIXES {
        let path = with_suffix(base, suffix);
        match std::fs::remove_file(&path) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to remove {}", path.display()))
            }
        }
    }
    Ok(())
}

/// Swap a freshly built store into the serving path.
///
/// On failure of the temp→current rename the backup is restored before the
/// error propagates; the backup set is deleted only after a fully successful
/// swap. Both connections to `target` and `temp` must be closed first.
pub fn swap_index_files(target: &Path, temp: &Path) -> Result<()> {
    let backup = with_suffix(target, &format!(".backup-{}", Uuid::new_v4()));
    move_index_files(target, &backup)?;
    if let Err(err) = move_index_files(temp, target) {
        move_index_files(&backup, target)
            .context("failed to restore backup after aborted swap")?;
        return Err(err);
    }
    if let Err(err) = remove_index_files(&backup) {
        // The swap itself succeeded; a stale backup set is only disk waste.
        warn!(error = %err, "failed to remove backup store files");
    }
    Ok(())
}

/// Build a unique sibling path for a temporary store.
pub fn temp_store_path(target: &Path) -> std::path::PathBuf {
    with_suffix(target, &format!(".tmp-{}", Uuid::new_v4()))
}
