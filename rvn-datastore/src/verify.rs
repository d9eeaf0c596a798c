//! Integrity verification and repair.
//!
//! Verification never repairs anything on its own: it returns
//! [`RepairAction`] values describing what was found, and the caller
//! decides whether to invoke them. Discovered corruption is reported, not
//! raised as an error.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use anyhow::{bail, Error};
use rusqlite::params;

use rvn_tools::task::TaskContext;
use rvn_tools::{task_log, task_warn};

use crate::checksum::Checksum;
use crate::database::{self, ConnectionCache};
use crate::error::RvnError;
use crate::repository::{Repository, BACKUP_FILE, DATABASE_FILE};
use crate::store_progress::StoreProgress;

/// A discovered problem together with the repair it offers.
pub struct RepairAction {
    message: String,
    kind: RepairKind,
}

enum RepairKind {
    /// The live database fails its integrity probe; restore the last
    /// backup over it.
    RestoreDatabase { repo_path: PathBuf },
    /// Blob files that are missing or whose content hashes to a different
    /// digest than recorded.
    ResolveCorruptBlobs {
        repo_path: PathBuf,
        corrupt: Vec<Checksum>,
    },
}

/// Outcome of invoking a [`RepairAction`].
#[derive(Debug, Default)]
pub struct RepairReport {
    pub database_restored: bool,
    /// Paths whose corrupt blobs were re-sourced from the working
    /// directory.
    pub repaired_versions: Vec<String>,
    /// Paths whose versions had to be deleted because no source for the
    /// missing data remained.
    pub deleted_versions: Vec<String>,
}

impl RepairAction {
    /// Plain English description shown to the user before repairing.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Execute the repair. `workdir_root` is the working directory used to
    /// re-source corrupt blobs.
    pub fn repair(
        &self,
        workdir_root: &Path,
        cache: &ConnectionCache,
        task: &dyn TaskContext,
    ) -> Result<RepairReport, Error> {
        match &self.kind {
            RepairKind::RestoreDatabase { repo_path } => restore_database(repo_path, cache, task),
            RepairKind::ResolveCorruptBlobs { repo_path, corrupt } => {
                resolve_corrupt_blobs(repo_path, corrupt, workdir_root, cache, task)
            }
        }
    }
}

/// Check the repository at `repo_path` and return the ordered repair
/// actions for everything found. An empty result means the repository is
/// healthy.
pub fn verify(
    repo_path: &Path,
    cache: &ConnectionCache,
    task: &dyn TaskContext,
) -> Result<Vec<RepairAction>, Error> {
    // database check runs first; without a usable database the version
    // check cannot run at all
    let repo = match Repository::open(repo_path, cache) {
        Ok(repo) => repo,
        Err(err) => {
            if let Some(RvnError::DataCorrupt(_)) = err.downcast_ref::<RvnError>() {
                return Ok(vec![database_action(repo_path)]);
            }
            return Err(err);
        }
    };

    let mut actions = Vec::new();

    let records = {
        let conn = repo.inner.conn.lock().unwrap();
        if database::probe(&conn).is_err() {
            actions.push(database_action(repo_path));
            return Ok(actions);
        }

        let mut stmt = conn.prepare("SELECT checksum FROM blobs")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut records = Vec::new();
        for row in rows {
            records.push(Checksum::from_hex(&row?)?);
        }
        records
    };

    task_log!(task, "verifying {} stored blob(s)", records.len());

    let mut progress = StoreProgress::new(records.len() as u64);
    let mut last_percentage = 0;
    let mut corrupt = Vec::new();
    for checksum in records {
        task.check_abort()?;

        match repo.inner.blob_store.get_blob(&checksum) {
            None => corrupt.push(checksum),
            Some(blob) => {
                if blob.checksum()? != checksum {
                    corrupt.push(checksum);
                }
            }
        }

        progress.done += 1;
        let percentage = (progress.percentage() * 100.0) as u64 / 10 * 10;
        if percentage != last_percentage {
            last_percentage = percentage;
            task_log!(task, "verified {}", progress);
        }
    }

    if !corrupt.is_empty() {
        let message = format!(
            "{} stored blob{} failed verification; repairing re-reads the \
             affected files from the working directory and deletes versions \
             that cannot be re-sourced",
            corrupt.len(),
            if corrupt.len() == 1 { "" } else { "s" },
        );
        actions.push(RepairAction {
            message,
            kind: RepairKind::ResolveCorruptBlobs {
                repo_path: repo_path.to_path_buf(),
                corrupt,
            },
        });
    }

    Ok(actions)
}

fn database_action(repo_path: &Path) -> RepairAction {
    let backup_path = repo_path.join(BACKUP_FILE);
    let message = match std::fs::metadata(&backup_path)
        .map_err(Error::from)
        .and_then(|metadata| rvn_tools::fs::mtime_millis(&metadata))
    {
        Ok(backup_time) => {
            let formatted = proxmox_time::epoch_to_rfc3339(backup_time / 1000)
                .unwrap_or_else(|_| backup_time.to_string());
            format!(
                "the database is corrupt; repairing restores the backup taken at {}",
                formatted
            )
        }
        Err(_) => "the database is corrupt and no backup exists; repair will fail".to_string(),
    };

    RepairAction {
        message,
        kind: RepairKind::RestoreDatabase {
            repo_path: repo_path.to_path_buf(),
        },
    }
}

fn restore_database(
    repo_path: &Path,
    cache: &ConnectionCache,
    task: &dyn TaskContext,
) -> Result<RepairReport, Error> {
    let database_path = repo_path.join(DATABASE_FILE);
    let backup_path = repo_path.join(BACKUP_FILE);

    if !backup_path.is_file() {
        bail!(RvnError::DataCorrupt(
            "database corrupt and no backup available".to_string(),
        ));
    }

    cache.evict(&database_path)?;

    // stale journal state must not survive the restore
    for suffix in ["-wal", "-shm"] {
        let mut name = DATABASE_FILE.to_string();
        name.push_str(suffix);
        let _ = std::fs::remove_file(repo_path.join(name));
    }

    std::fs::copy(&backup_path, &database_path)?;

    // re-probe through a fresh connection
    let conn = cache.open(&database_path)?;
    database::probe(&conn.lock().unwrap())?;

    task_log!(task, "database restored from backup {:?}", backup_path);

    Ok(RepairReport {
        database_restored: true,
        ..Default::default()
    })
}

fn resolve_corrupt_blobs(
    repo_path: &Path,
    corrupt: &[Checksum],
    workdir_root: &Path,
    cache: &ConnectionCache,
    task: &dyn TaskContext,
) -> Result<RepairReport, Error> {
    let repo = Repository::open(repo_path, cache)?;
    let chunker = repo.chunker()?;

    let mut report = RepairReport::default();

    for checksum in corrupt {
        task.check_abort()?;

        // every version whose blocks reference the corrupt blob
        let mut referencing: BTreeMap<i64, String> = BTreeMap::new();
        {
            let conn = repo.inner.conn.lock().unwrap();
            let mut stmt = conn.prepare(
                "SELECT DISTINCT v.id, v.path FROM versions v
                 JOIN blocks b ON b.version = v.id
                 WHERE b.blob = ?1",
            )?;
            let rows = stmt.query_map(params![checksum.to_hex()], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
            })?;
            for row in rows {
                let (id, path) = row?;
                referencing.insert(id, path);
            }
        }

        if referencing.is_empty() {
            // unreferenced record, the next clean will take care of it
            continue;
        }

        let paths: BTreeSet<&String> = referencing.values().collect();

        // probe the file currently present in the working directory for a
        // chunk matching the lost blob
        let mut resolved = false;
        'paths: for path in &paths {
            let candidate = workdir_root.join(path.as_str());
            let file = match std::fs::File::open(&candidate) {
                Ok(file) => file,
                Err(_) => continue,
            };

            for blob in chunker.chunks(std::io::BufReader::new(file)) {
                let blob = blob?;
                if blob.checksum()? == *checksum {
                    let blob_path = repo.inner.blob_store.blob_path(checksum);
                    if let Some(parent) = blob_path.parent() {
                        std::fs::create_dir_all(parent)?;
                    }
                    blob.write_to(&blob_path, true)?;
                    task_log!(task, "blob {} re-sourced from {:?}", checksum, candidate);
                    resolved = true;
                    break 'paths;
                }
            }
        }

        if resolved {
            report
                .repaired_versions
                .extend(referencing.values().cloned());
        } else {
            let conn = repo.inner.conn.lock().unwrap();
            for (version_id, path) in &referencing {
                conn.execute("DELETE FROM versions WHERE id = ?1", params![version_id])?;
                task_warn!(
                    task,
                    "deleted version of '{}' - blob {} could not be re-sourced",
                    path,
                    checksum
                );
                report.deleted_versions.push(path.clone());
            }
        }
    }

    repo.clean()?;

    report.repaired_versions.sort();
    report.repaired_versions.dedup();
    report.deleted_versions.sort();
    report.deleted_versions.dedup();

    // a version is repaired if it was corrupt and not deleted
    report
        .repaired_versions
        .retain(|path| !report.deleted_versions.contains(path));

    Ok(report)
}
