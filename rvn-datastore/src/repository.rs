//! Repository management.
//!
//! A repository is a self contained directory: `version` sentinel,
//! `config.json`, the `manifest.db` relational store with its periodic
//! `manifest.db.bak` backup, and the `blobs/` directory.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, format_err, Error};
use rusqlite::{params, OptionalExtension};
use uuid::Uuid;

use crate::blob_store::BlobStore;
use crate::chunker::Chunker;
use crate::config::RepositoryConfig;
use crate::database::{self, ConnectionCache, SharedConnection};
use crate::error::RvnError;
use crate::stats::CleanStatus;
use crate::timeline::Timeline;

/// Sentinel declaring the on-disk format.
pub const FORMAT_VERSION: &str = "c0747b1e-4bd2-11e9-a623-bff5824aa175";

/// Formats this implementation can open.
const SUPPORTED_VERSIONS: &[&str] = &[FORMAT_VERSION];

pub const VERSION_FILE: &str = "version";
pub const CONFIG_FILE: &str = "config.json";
pub const DATABASE_FILE: &str = "manifest.db";
pub const BACKUP_FILE: &str = "manifest.db.bak";
pub const BLOB_DIR: &str = "blobs";

pub(crate) struct RepoInner {
    pub path: PathBuf,
    pub config: RepositoryConfig,
    pub conn: SharedConnection,
    pub blob_store: BlobStore,
}

/// A self contained store of one or more timelines.
pub struct Repository {
    pub(crate) inner: Arc<RepoInner>,
}

impl Repository {
    /// Create a new repository at `path`. Fails when the path exists.
    ///
    /// The version sentinel is written last, so a partially created
    /// directory is never mistaken for a repository.
    pub fn create(
        path: &Path,
        config: RepositoryConfig,
        cache: &ConnectionCache,
    ) -> Result<Self, Error> {
        if path.exists() {
            bail!(RvnError::InvalidInput(format!(
                "'{}' already exists",
                path.display()
            )));
        }

        // fail early on an unusable chunker configuration
        config.chunker()?;

        std::fs::create_dir_all(path)?;
        let blob_store = BlobStore::new(path.join(BLOB_DIR));
        blob_store.create()?;
        config.store(path.join(CONFIG_FILE))?;

        let conn = cache.open(path.join(DATABASE_FILE))?;

        rvn_tools::fs::replace_file(
            path.join(VERSION_FILE),
            format!("{}\n", FORMAT_VERSION).as_bytes(),
        )?;

        Ok(Self {
            inner: Arc::new(RepoInner {
                path: path.to_path_buf(),
                blob_store,
                config,
                conn,
            }),
        })
    }

    /// Open the repository at `path`.
    pub fn open(path: &Path, cache: &ConnectionCache) -> Result<Self, Error> {
        let sentinel = match std::fs::read_to_string(path.join(VERSION_FILE)) {
            Ok(sentinel) => sentinel,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                bail!(RvnError::InvalidRepository(format!(
                    "'{}' is not a repository (missing version sentinel)",
                    path.display()
                )));
            }
            Err(err) => return Err(err.into()),
        };

        let sentinel = sentinel.trim();
        if !SUPPORTED_VERSIONS.contains(&sentinel) {
            bail!(RvnError::IncompatibleRepository(sentinel.to_string()));
        }

        let config = RepositoryConfig::load(path.join(CONFIG_FILE))?;
        let conn = cache.open(path.join(DATABASE_FILE))?;

        Ok(Self {
            inner: Arc::new(RepoInner {
                path: path.to_path_buf(),
                blob_store: BlobStore::new(path.join(BLOB_DIR)),
                config,
                conn,
            }),
        })
    }

    /// Recursively remove the repository at `path`.
    pub fn delete(path: &Path, cache: &ConnectionCache) -> Result<(), Error> {
        if path.join(DATABASE_FILE).exists() {
            cache.evict(path.join(DATABASE_FILE))?;
        }
        std::fs::remove_dir_all(path)
            .map_err(|err| format_err!("unable to delete repository {:?} - {}", path, err))
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn config(&self) -> &RepositoryConfig {
        &self.inner.config
    }

    pub fn chunker(&self) -> Result<Chunker, Error> {
        self.inner.config.chunker()
    }

    pub(crate) fn database_path(&self) -> PathBuf {
        self.inner.path.join(DATABASE_FILE)
    }

    pub(crate) fn backup_path(&self) -> PathBuf {
        self.inner.path.join(BACKUP_FILE)
    }

    /// Sum of stored blob sizes (after deduplication).
    pub fn stored_size(&self) -> Result<u64, Error> {
        let conn = self.inner.conn.lock().unwrap();
        let size: i64 =
            conn.query_row("SELECT COALESCE(SUM(size), 0) FROM blobs", [], |row| {
                row.get(0)
            })?;
        Ok(size as u64)
    }

    /// Sum of version sizes (before deduplication).
    pub fn total_size(&self) -> Result<u64, Error> {
        let conn = self.inner.conn.lock().unwrap();
        let size: i64 =
            conn.query_row("SELECT COALESCE(SUM(size), 0) FROM versions", [], |row| {
                row.get(0)
            })?;
        Ok(size as u64)
    }

    /// Sweep blob files referenced by no block.
    pub fn clean(&self) -> Result<CleanStatus, Error> {
        let conn = self.inner.conn.lock().unwrap();
        let status = self.inner.blob_store.clean(&conn)?;
        log::info!("blob sweep on {:?}: {:?}", self.inner.path, status);
        Ok(status)
    }

    pub fn create_timeline(&self) -> Result<Timeline, Error> {
        let id = Uuid::new_v4();
        let time_created = rvn_tools::epoch_millis();

        let conn = self.inner.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO timelines (id, time_created) VALUES (?1, ?2)",
            params![id.to_string(), time_created],
        )?;

        Ok(Timeline::from_parts(
            Arc::clone(&self.inner),
            id,
            time_created,
        ))
    }

    pub fn timelines(&self) -> Result<Vec<Timeline>, Error> {
        let conn = self.inner.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT id, time_created FROM timelines ORDER BY time_created")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;

        let mut timelines = Vec::new();
        for row in rows {
            let (id, time_created) = row?;
            let id = Uuid::parse_str(&id)
                .map_err(|err| RvnError::Internal(format!("malformed timeline id - {}", err)))?;
            timelines.push(Timeline::from_parts(
                Arc::clone(&self.inner),
                id,
                time_created,
            ));
        }
        Ok(timelines)
    }

    pub fn timeline(&self, id: Uuid) -> Result<Option<Timeline>, Error> {
        let conn = self.inner.conn.lock().unwrap();
        let time_created: Option<i64> = conn
            .query_row(
                "SELECT time_created FROM timelines WHERE id = ?1",
                params![id.to_string()],
                |row| row.get(0),
            )
            .optional()?;

        Ok(time_created
            .map(|time_created| Timeline::from_parts(Arc::clone(&self.inner), id, time_created)))
    }

    /// Whether the periodic database backup should run now.
    pub fn backup_job_due(&self, now_millis: i64) -> bool {
        let interval = (self.inner.config.backup_interval as i64).saturating_mul(60_000);
        match std::fs::metadata(self.backup_path())
            .map_err(Error::from)
            .and_then(|metadata| rvn_tools::fs::mtime_millis(&metadata))
        {
            Ok(backup_time) => backup_time.saturating_add(interval) <= now_millis,
            Err(_) => true,
        }
    }

    /// Snapshot the live database to the backup file.
    ///
    /// The cycle is skipped (returning false) when the live database
    /// currently fails its integrity probe, so a corrupt state never
    /// overwrites a good backup.
    pub fn run_backup_job(&self) -> Result<bool, Error> {
        let conn = self.inner.conn.lock().unwrap();

        if let Err(err) = database::probe(&conn) {
            log::warn!(
                "skipping database backup of {:?} - {}",
                self.inner.path,
                err
            );
            return Ok(false);
        }

        database::backup_to(&conn, &self.backup_path())?;
        log::info!("database backup written to {:?}", self.backup_path());
        Ok(true)
    }
}
