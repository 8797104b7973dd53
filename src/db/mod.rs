pub mod schema;
pub mod swap;

use anyhow::{Context, Result};
use rusqlite::Connection;
use sqlite_vec::sqlite3_vec_init;
use std::path::Path;
use std::sync::Once;

static SQLITE_VEC_INIT: Once = Once::new();

/// Register the sqlite-vec extension globally. Safe to call multiple times.
pub fn load_sqlite_vec() {
    SQLITE_VEC_INIT.call_once(|| unsafe {
        rusqlite::ffi::sqlite3_auto_extension(Some(std::mem::transmute(
            sqlite3_vec_init as *const (),
        )));
    });
}

/// Open (or create) an index store at the given path.
///
/// Enables WAL journaling so searches stay readable while a sync writes, and a
/// busy timeout so the brief moments of contention spin instead of erroring.
/// Schema initialization is the caller's job ([`schema::ensure_schema`]) since
/// the keyword-index capability outcome must be recorded alongside the handle.
pub fn open_database(path: impl AsRef<Path>) -> Result<Connection> {
    let path = path.as_ref();

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {}", parent.display()))?;
    }

    load_sqlite_vec();

    let conn = Connection::open(path)
        .with_context(|| format!("failed to open index store at {}", path.display()))?;

    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "busy_timeout", 5000)?;

    Ok(conn)
}

/// Probe whether the sqlite-vec extension is actually usable on this handle.
///
/// Registration can silently fail (static linking aside, hosts may disable
/// extensions), so availability is decided once per store open and recorded as
/// a capability flag rather than assumed.
pub fn probe_vector_support(conn: &Connection) -> bool {
    conn.query_row("SELECT vec_version()", [], |row| row.get::<_, String>(0))
        .is_ok()
}

/// Open an in-memory store for testing.
#[cfg(test)]
pub fn open_memory_database() -> Result<Connection> {
    load_sqlite_vec();
    let conn = Connection::open_in_memory().context("failed to open in-memory store")?;
    Ok(conn)
}
