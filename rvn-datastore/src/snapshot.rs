//! Snapshots: atomically taken sets of versions.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, format_err, Error};
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use crate::checksum::Checksum;
use crate::error::RvnError;
use crate::permissions::PermissionSet;
use crate::repository::RepoInner;
use crate::stats::CommitStats;
use crate::version::Version;

/// A named set of versions with a monotonic revision number, owned by a
/// timeline.
pub struct Snapshot {
    repo: Arc<RepoInner>,
    id: i64,
    timeline_id: Uuid,
    revision: i64,
    time_created: i64,
    name: Option<String>,
    description: String,
    pinned: bool,
}

impl Snapshot {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn from_parts(
        repo: Arc<RepoInner>,
        id: i64,
        timeline_id: Uuid,
        revision: i64,
        time_created: i64,
        name: Option<String>,
        description: String,
        pinned: bool,
    ) -> Self {
        Self {
            repo,
            id,
            timeline_id,
            revision,
            time_created,
            name,
            description,
            pinned,
        }
    }

    pub(crate) fn id(&self) -> i64 {
        self.id
    }

    pub fn timeline_id(&self) -> Uuid {
        self.timeline_id
    }

    pub fn revision(&self) -> i64 {
        self.revision
    }

    /// Creation time in unix epoch milliseconds.
    pub fn time_created(&self) -> i64 {
        self.time_created
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    /// Pinned snapshots are never removed by cleanup policies.
    pub fn pinned(&self) -> bool {
        self.pinned
    }

    pub fn set_name(&mut self, name: Option<String>) -> Result<(), Error> {
        let conn = self.repo.conn.lock().unwrap();
        conn.execute(
            "UPDATE snapshots SET name = ?1 WHERE id = ?2",
            params![name, self.id],
        )?;
        self.name = name;
        Ok(())
    }

    pub fn set_description(&mut self, description: String) -> Result<(), Error> {
        let conn = self.repo.conn.lock().unwrap();
        conn.execute(
            "UPDATE snapshots SET description = ?1 WHERE id = ?2",
            params![description, self.id],
        )?;
        self.description = description;
        Ok(())
    }

    pub fn set_pinned(&mut self, pinned: bool) -> Result<(), Error> {
        let conn = self.repo.conn.lock().unwrap();
        conn.execute(
            "UPDATE snapshots SET pinned = ?1 WHERE id = ?2",
            params![pinned, self.id],
        )?;
        self.pinned = pinned;
        Ok(())
    }

    /// Record the current content of `workdir_root/path` as a new version
    /// of this snapshot.
    pub fn create_version(&self, path: &str, workdir_root: &Path) -> Result<Version, Error> {
        let mut stats = CommitStats::default();
        let mut conn = self.repo.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let version = insert_version(
            &self.repo,
            &tx,
            self.id,
            self.revision,
            path,
            workdir_root,
            &mut stats,
        )?;
        tx.commit()?;
        Ok(version)
    }

    /// Remove the version recorded for `path`, sweeping now-unreferenced
    /// blobs afterwards. Returns false when no such version exists.
    pub fn remove_version(&self, path: &str) -> Result<bool, Error> {
        let conn = self.repo.conn.lock().unwrap();
        let removed = conn.execute(
            "DELETE FROM versions WHERE snapshot = ?1 AND path = ?2",
            params![self.id, path],
        )?;
        if removed == 0 {
            return Ok(false);
        }
        self.repo.blob_store.clean(&conn)?;
        Ok(true)
    }

    /// Versions recorded directly in this snapshot.
    pub fn versions(&self) -> Result<Vec<Version>, Error> {
        let conn = self.repo.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, path, last_modified, permissions, size, checksum
             FROM versions WHERE snapshot = ?1 ORDER BY path",
        )?;
        let rows = stmt.query_map(params![self.id], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, Option<i64>>(3)?,
                row.get::<_, i64>(4)?,
                row.get::<_, String>(5)?,
            ))
        })?;

        let mut versions = Vec::new();
        for row in rows {
            let (id, path, last_modified, permissions, size, checksum) = row?;
            versions.push(Version::from_parts(
                Arc::clone(&self.repo),
                id,
                self.id,
                self.revision,
                path,
                last_modified,
                permissions.map(|mode| PermissionSet::from_mode(mode as u32)),
                size as u64,
                Checksum::from_hex(&checksum)?,
            ));
        }
        Ok(versions)
    }

    /// The version recorded for `path` in this snapshot, if any.
    pub fn version(&self, path: &str) -> Result<Option<Version>, Error> {
        let conn = self.repo.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT id, last_modified, permissions, size, checksum
                 FROM versions WHERE snapshot = ?1 AND path = ?2",
                params![self.id, path],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, Option<i64>>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                },
            )
            .optional()?;

        match row {
            None => Ok(None),
            Some((id, last_modified, permissions, size, checksum)) => Ok(Some(
                Version::from_parts(
                    Arc::clone(&self.repo),
                    id,
                    self.id,
                    self.revision,
                    path.to_string(),
                    last_modified,
                    permissions.map(|mode| PermissionSet::from_mode(mode as u32)),
                    size as u64,
                    Checksum::from_hex(&checksum)?,
                ),
            )),
        }
    }

    /// The materialized file tree visible at this snapshot: union by path
    /// over this and all earlier snapshots of the timeline, highest
    /// revision winning.
    pub fn cumulative_versions(&self) -> Result<BTreeMap<String, Version>, Error> {
        let conn = self.repo.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT v.id, v.snapshot, s.revision, v.path, v.last_modified,
                    v.permissions, v.size, v.checksum
             FROM versions v
             JOIN snapshots s ON v.snapshot = s.id
             WHERE s.timeline = ?1 AND s.revision <= ?2
             ORDER BY s.revision ASC",
        )?;
        let rows = stmt.query_map(
            params![self.timeline_id.to_string(), self.revision],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, Option<i64>>(5)?,
                    row.get::<_, i64>(6)?,
                    row.get::<_, String>(7)?,
                ))
            },
        )?;

        let mut cumulative = BTreeMap::new();
        for row in rows {
            let (id, snapshot_id, revision, path, last_modified, permissions, size, checksum) =
                row?;
            let version = Version::from_parts(
                Arc::clone(&self.repo),
                id,
                snapshot_id,
                revision,
                path.clone(),
                last_modified,
                permissions.map(|mode| PermissionSet::from_mode(mode as u32)),
                size as u64,
                Checksum::from_hex(&checksum)?,
            );
            // ascending revision order, so later entries win
            cumulative.insert(path, version);
        }
        Ok(cumulative)
    }
}

/// Insert a new version row (and its blocks) inside the caller's
/// transaction.
pub(crate) fn insert_version(
    repo: &Arc<RepoInner>,
    conn: &Connection,
    snapshot_id: i64,
    revision: i64,
    path: &str,
    workdir_root: &Path,
    stats: &mut CommitStats,
) -> Result<Version, Error> {
    let exists: Option<i64> = conn
        .query_row(
            "SELECT id FROM versions WHERE snapshot = ?1 AND path = ?2",
            params![snapshot_id, path],
            |row| row.get(0),
        )
        .optional()?;
    if exists.is_some() {
        bail!(RvnError::DuplicateRecord(format!(
            "version for '{}' already exists in this snapshot",
            path
        )));
    }

    let absolute = workdir_root.join(path);
    let metadata = std::fs::metadata(&absolute)
        .map_err(|err| format_err!("unable to stat {:?} - {}", absolute, err))?;
    if !metadata.is_file() {
        bail!(RvnError::InvalidInput(format!(
            "'{}' is not a regular file",
            absolute.display()
        )));
    }

    let last_modified = rvn_tools::fs::mtime_millis(&metadata)?;
    let permissions = PermissionSet::from_path(&absolute)?;
    let size = metadata.len();
    let checksum = {
        let file = std::fs::File::open(&absolute)?;
        Checksum::of_reader(std::io::BufReader::new(file))?
    };

    conn.execute(
        "INSERT INTO versions (snapshot, path, last_modified, permissions, size, checksum)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            snapshot_id,
            path,
            last_modified,
            permissions.map(|set| set.mode() as i64),
            size as i64,
            checksum.to_hex(),
        ],
    )?;
    let version_id = conn.last_insert_rowid();

    let chunker = repo.config.chunker()?;
    let file = std::io::BufReader::new(std::fs::File::open(&absolute)?);
    for (index, blob) in chunker.chunks(file).enumerate() {
        let blob = blob?;
        let (blob_checksum, blob_size, duplicate) = repo.blob_store.add_blob(conn, &blob)?;
        conn.execute(
            "INSERT INTO blocks (version, blob, block_index) VALUES (?1, ?2, ?3)",
            params![version_id, blob_checksum.to_hex(), index as i64],
        )?;
        stats.record_chunk(blob_size, duplicate);
    }

    stats.file_count += 1;
    stats.size += size;

    Ok(Version::from_parts(
        Arc::clone(repo),
        version_id,
        snapshot_id,
        revision,
        path.to_string(),
        last_modified,
        permissions,
        size,
        checksum,
    ))
}
