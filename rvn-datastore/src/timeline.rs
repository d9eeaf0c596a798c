//! Timelines: ordered snapshot histories sharing cleanup policies.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use anyhow::Error;
use rusqlite::{params, OptionalExtension, Row};
use rvn_tools::task::TaskContext;
use rvn_tools::task_log;
use uuid::Uuid;

use crate::checksum::Checksum;
use crate::permissions::PermissionSet;
use crate::prune::{self, CleanupPolicy};
use crate::repository::RepoInner;
use crate::snapshot::{insert_version, Snapshot};
use crate::stats::CommitStats;
use crate::version::Version;

/// An ordered sequence of snapshots. The id is stable across renames of
/// the owning work directory.
pub struct Timeline {
    repo: Arc<RepoInner>,
    id: Uuid,
    time_created: i64,
}

impl Timeline {
    pub(crate) fn from_parts(repo: Arc<RepoInner>, id: Uuid, time_created: i64) -> Self {
        Self {
            repo,
            id,
            time_created,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Creation time in unix epoch milliseconds.
    pub fn time_created(&self) -> i64 {
        self.time_created
    }

    fn snapshot_from_row(&self, row: &Row) -> rusqlite::Result<Snapshot> {
        Ok(Snapshot::from_parts(
            Arc::clone(&self.repo),
            row.get(0)?,
            self.id,
            row.get(1)?,
            row.get(2)?,
            row.get(3)?,
            row.get(4)?,
            row.get::<_, i64>(5)? != 0,
        ))
    }

    /// Take a new snapshot of the given work directory paths.
    ///
    /// Runs in one transaction; the revision is assigned inside that same
    /// transaction (max + 1, first = 1). An empty path list still creates
    /// an empty snapshot.
    pub fn create_snapshot(
        &self,
        paths: &[String],
        workdir_root: &Path,
        name: Option<String>,
        description: &str,
        pinned: bool,
    ) -> Result<Snapshot, Error> {
        let time_created = rvn_tools::epoch_millis();

        let mut conn = self.repo.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let revision: i64 = tx.query_row(
            "SELECT COALESCE(MAX(revision), 0) + 1 FROM snapshots WHERE timeline = ?1",
            params![self.id.to_string()],
            |row| row.get(0),
        )?;

        tx.execute(
            "INSERT INTO snapshots (timeline, revision, name, description, pinned, time_created)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                self.id.to_string(),
                revision,
                name,
                description,
                pinned as i64,
                time_created,
            ],
        )?;
        let snapshot_id = tx.last_insert_rowid();

        let mut stats = CommitStats::default();
        let mut seen = BTreeSet::new();
        for path in paths {
            if !seen.insert(path.as_str()) {
                continue;
            }
            insert_version(
                &self.repo,
                &tx,
                snapshot_id,
                revision,
                path,
                workdir_root,
                &mut stats,
            )?;
        }

        tx.commit()?;
        log::info!("snapshot revision {} created: {:?}", revision, stats);

        Ok(Snapshot::from_parts(
            Arc::clone(&self.repo),
            snapshot_id,
            self.id,
            revision,
            time_created,
            name,
            description.to_string(),
            pinned,
        ))
    }

    /// All snapshots ordered by revision.
    pub fn snapshots(&self) -> Result<Vec<Snapshot>, Error> {
        let conn = self.repo.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, revision, time_created, name, description, pinned
             FROM snapshots WHERE timeline = ?1 ORDER BY revision",
        )?;
        let rows = stmt.query_map(params![self.id.to_string()], |row| {
            self.snapshot_from_row(row)
        })?;

        let mut snapshots = Vec::new();
        for row in rows {
            snapshots.push(row?);
        }
        Ok(snapshots)
    }

    pub fn snapshot(&self, revision: i64) -> Result<Option<Snapshot>, Error> {
        let conn = self.repo.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, revision, time_created, name, description, pinned
             FROM snapshots WHERE timeline = ?1 AND revision = ?2",
            params![self.id.to_string(), revision],
            |row| self.snapshot_from_row(row),
        )
        .optional()
        .map_err(Error::from)
    }

    pub fn latest_snapshot(&self) -> Result<Option<Snapshot>, Error> {
        let conn = self.repo.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, revision, time_created, name, description, pinned
             FROM snapshots WHERE timeline = ?1 ORDER BY revision DESC LIMIT 1",
            params![self.id.to_string()],
            |row| self.snapshot_from_row(row),
        )
        .optional()
        .map_err(Error::from)
    }

    /// Remove the snapshot with `revision` (cascading to its versions and
    /// blocks), then sweep unreferenced blobs. Returns false when the
    /// revision does not exist.
    pub fn remove_snapshot(&self, revision: i64) -> Result<bool, Error> {
        let conn = self.repo.conn.lock().unwrap();
        let removed = conn.execute(
            "DELETE FROM snapshots WHERE timeline = ?1 AND revision = ?2",
            params![self.id.to_string(), revision],
        )?;
        if removed == 0 {
            return Ok(false);
        }
        self.repo.blob_store.clean(&conn)?;
        Ok(true)
    }

    /// All versions recorded for `path` across the timeline, newest
    /// revision first.
    pub fn list_versions(&self, path: &str) -> Result<Vec<Version>, Error> {
        let conn = self.repo.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT v.id, v.snapshot, s.revision, v.last_modified, v.permissions,
                    v.size, v.checksum
             FROM versions v
             JOIN snapshots s ON v.snapshot = s.id
             WHERE s.timeline = ?1 AND v.path = ?2
             ORDER BY s.revision DESC",
        )?;
        let rows = stmt.query_map(params![self.id.to_string(), path], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, Option<i64>>(4)?,
                row.get::<_, i64>(5)?,
                row.get::<_, String>(6)?,
            ))
        })?;

        let mut versions = Vec::new();
        for row in rows {
            let (id, snapshot_id, revision, last_modified, permissions, size, checksum) = row?;
            versions.push(Version::from_parts(
                Arc::clone(&self.repo),
                id,
                snapshot_id,
                revision,
                path.to_string(),
                last_modified,
                permissions.map(|mode| PermissionSet::from_mode(mode as u32)),
                size as u64,
                Checksum::from_hex(&checksum)?,
            ));
        }
        Ok(versions)
    }

    /// Union of all version paths across all snapshots.
    pub fn paths(&self) -> Result<BTreeSet<String>, Error> {
        let conn = self.repo.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT DISTINCT v.path FROM versions v
             JOIN snapshots s ON v.snapshot = s.id
             WHERE s.timeline = ?1",
        )?;
        let rows = stmt.query_map(params![self.id.to_string()], |row| {
            row.get::<_, String>(0)
        })?;

        let mut paths = BTreeSet::new();
        for row in rows {
            paths.insert(row?);
        }
        Ok(paths)
    }

    /// The persisted cleanup policy set.
    pub fn cleanup_policies(&self) -> Result<Vec<CleanupPolicy>, Error> {
        let conn = self.repo.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT p.min_interval, p.time_frame, p.max_versions, p.description
             FROM cleanup_policies p
             JOIN timeline_cleanup_policies tp ON tp.policy = p.id
             WHERE tp.timeline = ?1
             ORDER BY p.id",
        )?;
        let rows = stmt.query_map(params![self.id.to_string()], |row| {
            Ok(CleanupPolicy {
                min_interval: row.get(0)?,
                time_frame: row.get(1)?,
                max_versions: row.get::<_, i64>(2)? as u32,
                description: row.get(3)?,
            })
        })?;

        let mut policies = Vec::new();
        for row in rows {
            policies.push(row?);
        }
        Ok(policies)
    }

    /// Atomically replace the persisted cleanup policy set.
    pub fn set_cleanup_policies(&self, policies: &[CleanupPolicy]) -> Result<(), Error> {
        let mut conn = self.repo.conn.lock().unwrap();
        let tx = conn.transaction()?;

        tx.execute(
            "DELETE FROM timeline_cleanup_policies WHERE timeline = ?1",
            params![self.id.to_string()],
        )?;
        tx.execute(
            "DELETE FROM cleanup_policies
             WHERE id NOT IN (SELECT policy FROM timeline_cleanup_policies)",
            [],
        )?;

        for policy in policies {
            tx.execute(
                "INSERT INTO cleanup_policies (min_interval, time_frame, max_versions, description)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    policy.min_interval,
                    policy.time_frame,
                    policy.max_versions as i64,
                    policy.description,
                ],
            )?;
            let policy_id = tx.last_insert_rowid();
            tx.execute(
                "INSERT INTO timeline_cleanup_policies (timeline, policy) VALUES (?1, ?2)",
                params![self.id.to_string(), policy_id],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    /// Apply every cleanup policy to every path of the timeline. Versions
    /// of pinned snapshots are never removed. Returns the number of
    /// removed versions.
    pub fn clean_up(&self, task: &dyn TaskContext) -> Result<u64, Error> {
        let policies = self.cleanup_policies()?;
        if policies.is_empty() {
            return Ok(0);
        }

        let mut removed = 0u64;

        for policy in &policies {
            for path in self.paths()? {
                task.check_abort()?;
                let conn = self.repo.conn.lock().unwrap();
                let mut stmt = conn.prepare(
                    "SELECT v.id, s.time_created, s.pinned
                     FROM versions v
                     JOIN snapshots s ON v.snapshot = s.id
                     WHERE s.timeline = ?1 AND v.path = ?2
                     ORDER BY s.time_created DESC, s.revision DESC",
                )?;
                let rows = stmt.query_map(params![self.id.to_string(), path], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, i64>(2)? != 0,
                    ))
                })?;

                let mut versions = Vec::new();
                for row in rows {
                    versions.push(row?);
                }
                drop(stmt);

                let times: Vec<i64> = versions.iter().map(|(_, time, _)| *time).collect();
                for index in prune::select_removals(policy, &times) {
                    let (version_id, _, pinned) = versions[index];
                    if pinned {
                        continue;
                    }
                    conn.execute("DELETE FROM versions WHERE id = ?1", params![version_id])?;
                    removed += 1;
                }
            }
        }

        let conn = self.repo.conn.lock().unwrap();
        let status = self.repo.blob_store.clean(&conn)?;
        task_log!(task, "cleanup removed {} version(s): {:?}", removed, status);

        Ok(removed)
    }
}
