//! Transactional relational store.
//!
//! SQLite runs at serializable isolation by default; every public
//! repository operation wraps its statements in one transaction on the
//! owning connection. Each database file is opened at most once per
//! process through a [`ConnectionCache`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, format_err, Error};
use once_cell::sync::Lazy;
use rusqlite::Connection;

use crate::error::RvnError;

/// Shared handle to an open database connection.
pub type SharedConnection = Arc<Mutex<Connection>>;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS timelines (
    id TEXT PRIMARY KEY,
    time_created INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS snapshots (
    id INTEGER PRIMARY KEY,
    timeline TEXT NOT NULL REFERENCES timelines (id) ON DELETE CASCADE,
    revision INTEGER NOT NULL,
    name TEXT,
    description TEXT NOT NULL DEFAULT '',
    pinned INTEGER NOT NULL DEFAULT 0,
    time_created INTEGER NOT NULL,
    UNIQUE (timeline, revision)
);

CREATE INDEX IF NOT EXISTS idx_snapshots_timeline
    ON snapshots (timeline, revision);

CREATE TABLE IF NOT EXISTS versions (
    id INTEGER PRIMARY KEY,
    snapshot INTEGER NOT NULL REFERENCES snapshots (id) ON DELETE CASCADE,
    path TEXT NOT NULL,
    last_modified INTEGER NOT NULL,
    permissions INTEGER,
    size INTEGER NOT NULL,
    checksum TEXT NOT NULL,
    UNIQUE (snapshot, path)
);

CREATE INDEX IF NOT EXISTS idx_versions_path ON versions (path);

CREATE TABLE IF NOT EXISTS blobs (
    checksum TEXT PRIMARY KEY,
    size INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS blocks (
    version INTEGER NOT NULL REFERENCES versions (id) ON DELETE CASCADE,
    blob TEXT NOT NULL REFERENCES blobs (checksum),
    block_index INTEGER NOT NULL,
    PRIMARY KEY (version, block_index)
);

CREATE INDEX IF NOT EXISTS idx_blocks_blob ON blocks (blob);

CREATE TABLE IF NOT EXISTS cleanup_policies (
    id INTEGER PRIMARY KEY,
    min_interval INTEGER NOT NULL,
    time_frame INTEGER NOT NULL,
    max_versions INTEGER NOT NULL,
    description TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS timeline_cleanup_policies (
    timeline TEXT NOT NULL REFERENCES timelines (id) ON DELETE CASCADE,
    policy INTEGER NOT NULL REFERENCES cleanup_policies (id) ON DELETE CASCADE,
    PRIMARY KEY (timeline, policy)
);
";

/// Process wide connection cache keyed by absolute database path.
///
/// Tests may instantiate their own cache; production code shares
/// [`default_cache`].
pub struct ConnectionCache {
    connections: Mutex<HashMap<PathBuf, SharedConnection>>,
}

static DEFAULT_CACHE: Lazy<ConnectionCache> = Lazy::new(ConnectionCache::new);

pub fn default_cache() -> &'static ConnectionCache {
    &DEFAULT_CACHE
}

impl ConnectionCache {
    pub fn new() -> Self {
        Self {
            connections: Mutex::new(HashMap::new()),
        }
    }

    /// Open (or return the cached connection for) the database at `path`.
    ///
    /// On first connect the integrity probe runs and the schema is created;
    /// a failing probe raises [`RvnError::DataCorrupt`].
    pub fn open<P: AsRef<Path>>(&self, path: P) -> Result<SharedConnection, Error> {
        let path = normalize_db_path(path.as_ref())?;

        let mut connections = self.connections.lock().unwrap();
        if let Some(connection) = connections.get(&path) {
            return Ok(Arc::clone(connection));
        }

        let connection = connect(&path)?;
        let connection = Arc::new(Mutex::new(connection));
        connections.insert(path, Arc::clone(&connection));
        Ok(connection)
    }

    /// Drop the cached connection for `path`, closing it once all clones
    /// are gone. Required before replacing the database file on disk.
    pub fn evict<P: AsRef<Path>>(&self, path: P) -> Result<(), Error> {
        let path = normalize_db_path(path.as_ref())?;
        self.connections.lock().unwrap().remove(&path);
        Ok(())
    }
}

impl Default for ConnectionCache {
    fn default() -> Self {
        Self::new()
    }
}

fn normalize_db_path(path: &Path) -> Result<PathBuf, Error> {
    // the database file itself may not exist yet, so canonicalize its parent
    let parent = path
        .parent()
        .ok_or_else(|| format_err!("database path {:?} has no parent", path))?;
    let file_name = path
        .file_name()
        .ok_or_else(|| format_err!("database path {:?} has no file name", path))?;
    Ok(parent.canonicalize()?.join(file_name))
}

fn connect(path: &Path) -> Result<Connection, Error> {
    let connection = Connection::open(path)
        .map_err(|err| format_err!("unable to open database {:?} - {}", path, err))?;

    connection
        .busy_timeout(Duration::from_secs(30))
        .map_err(map_sqlite_err)?;
    connection
        .pragma_update(None, "foreign_keys", "ON")
        .map_err(map_sqlite_err)?;
    // write ahead journaling; the pragma reports the active mode back
    let _mode: String = connection
        .query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))
        .map_err(map_sqlite_err)?;

    probe(&connection)?;

    connection.execute_batch(SCHEMA).map_err(map_sqlite_err)?;

    Ok(connection)
}

/// Translate sqlite level corruption into the engine's taxonomy so callers
/// can offer the backup restore.
fn map_sqlite_err(err: rusqlite::Error) -> Error {
    if let rusqlite::Error::SqliteFailure(failure, _) = &err {
        match failure.code {
            rusqlite::ErrorCode::DatabaseCorrupt | rusqlite::ErrorCode::NotADatabase => {
                return RvnError::DataCorrupt(format!("database unreadable - {}", err)).into();
            }
            _ => {}
        }
    }
    err.into()
}

/// Run the integrity probe on `connection`.
pub fn probe(connection: &Connection) -> Result<(), Error> {
    let result: String = connection
        .query_row("PRAGMA integrity_check", [], |row| row.get(0))
        .map_err(map_sqlite_err)?;

    if result != "ok" {
        bail!(RvnError::DataCorrupt(format!(
            "database integrity check failed - {}",
            result
        )));
    }
    Ok(())
}

/// Snapshot the live database at `connection` into `target` using the
/// sqlite online backup API. The copy is written next to `target` and
/// renamed into place.
pub fn backup_to(connection: &Connection, target: &Path) -> Result<(), Error> {
    let file_name = target
        .file_name()
        .ok_or_else(|| format_err!("backup target {:?} has no file name", target))?;
    let mut tmp_name = file_name.to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = target.with_file_name(tmp_name);

    let _ = std::fs::remove_file(&tmp_path);

    let result = (|| -> Result<(), Error> {
        let mut backup_conn = Connection::open(&tmp_path)?;
        let backup = rusqlite::backup::Backup::new(connection, &mut backup_conn)?;
        backup.run_to_completion(64, Duration::from_millis(50), None)?;
        drop(backup);
        drop(backup_conn);
        std::fs::rename(&tmp_path, target)?;
        Ok(())
    })();

    if result.is_err() {
        let _ = std::fs::remove_file(&tmp_path);
    }

    result
}
