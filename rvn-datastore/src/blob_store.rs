//! File system based blob store.
//!
//! Blobs live in a two level directory below the repository root:
//! `blobs/<first-2-hex>/<full-hex>`. Additions write the file before the
//! database row, removals delete the row before the file, so interrupts
//! leave at worst an unreferenced file for the next `clean`.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::{format_err, Error};
use rusqlite::{params, Connection, OptionalExtension};

use crate::blob::Blob;
use crate::checksum::Checksum;
use crate::stats::CleanStatus;

pub struct BlobStore {
    blob_dir: PathBuf,
}

impl BlobStore {
    pub fn new<P: Into<PathBuf>>(blob_dir: P) -> Self {
        Self {
            blob_dir: blob_dir.into(),
        }
    }

    pub fn blob_dir(&self) -> &Path {
        &self.blob_dir
    }

    /// Create the blob directory with its full two-hex-digit fan out.
    pub fn create(&self) -> Result<(), Error> {
        std::fs::create_dir_all(&self.blob_dir)?;
        for prefix in 0..256u16 {
            let subdir = self.blob_dir.join(format!("{:02x}", prefix));
            match std::fs::create_dir(&subdir) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {}
                Err(err) => {
                    return Err(format_err!(
                        "unable to create blob subdir {:?} - {}",
                        subdir,
                        err
                    ))
                }
            }
        }
        Ok(())
    }

    /// Absolute path of the file backing `checksum`.
    pub fn blob_path(&self, checksum: &Checksum) -> PathBuf {
        let mut path = self.blob_dir.clone();
        path.push(checksum.hex_prefix());
        path.push(checksum.to_hex());
        path
    }

    /// Store `blob`, returning its checksum, size, and whether an identical
    /// blob was already present. The file write comes first; the record
    /// insert is a no-op when the row already exists.
    pub fn add_blob(&self, conn: &Connection, blob: &Blob) -> Result<(Checksum, u64, bool), Error> {
        let checksum = blob.checksum()?;
        let size = blob.size()?;
        let path = self.blob_path(&checksum);

        let exists = path.exists();
        if !exists {
            let parent = path
                .parent()
                .ok_or_else(|| format_err!("blob path {:?} has no parent", path))?;
            std::fs::create_dir_all(parent)?;
            blob.write_to(&path, true)?;
        }

        conn.execute(
            "INSERT OR IGNORE INTO blobs (checksum, size) VALUES (?1, ?2)",
            params![checksum.to_hex(), size as i64],
        )?;

        Ok((checksum, size, exists))
    }

    /// Remove the record and then best-effort delete the file. Idempotent.
    pub fn remove_blob(&self, conn: &Connection, checksum: &Checksum) -> Result<(), Error> {
        conn.execute(
            "DELETE FROM blobs WHERE checksum = ?1",
            params![checksum.to_hex()],
        )?;

        match std::fs::remove_file(self.blob_path(checksum)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => {
                log::warn!("unable to remove blob file {} - {}", checksum, err);
                Ok(())
            }
        }
    }

    /// A blob reading the stored file, or `None` when the file is missing.
    pub fn get_blob(&self, checksum: &Checksum) -> Option<Blob> {
        let path = self.blob_path(checksum);
        if path.is_file() {
            Some(Blob::from_file(path))
        } else {
            None
        }
    }

    /// Recorded size of `checksum`, if a record exists.
    pub fn blob_size(&self, conn: &Connection, checksum: &Checksum) -> Result<Option<u64>, Error> {
        let size: Option<i64> = conn
            .query_row(
                "SELECT size FROM blobs WHERE checksum = ?1",
                params![checksum.to_hex()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(size.map(|s| s as u64))
    }

    /// Enumerate stored blob files. The returned checksums are *claimed*
    /// (decoded from file names), not verified against content.
    pub fn list_blobs(&self) -> Result<Vec<Checksum>, Error> {
        let mut checksums = Vec::new();

        let prefixes = match std::fs::read_dir(&self.blob_dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(checksums),
            Err(err) => {
                return Err(format_err!(
                    "unable to read blob dir {:?} - {}",
                    self.blob_dir,
                    err
                ))
            }
        };

        for prefix in prefixes {
            let prefix = prefix?;
            if !prefix.file_type()?.is_dir() {
                continue;
            }
            for entry in std::fs::read_dir(prefix.path())? {
                let entry = entry?;
                if !entry.file_type()?.is_file() {
                    continue;
                }
                let name = entry.file_name();
                let name = match name.to_str() {
                    Some(name) => name,
                    None => continue,
                };
                // skip files that are not a hex digest
                if let Ok(checksum) = Checksum::from_hex(name) {
                    checksums.push(checksum);
                }
            }
        }

        Ok(checksums)
    }

    /// Remove every stored file whose checksum is referenced by no block.
    /// Idempotent.
    pub fn clean(&self, conn: &Connection) -> Result<CleanStatus, Error> {
        let mut used = HashSet::new();
        {
            let mut stmt = conn.prepare("SELECT DISTINCT blob FROM blocks")?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            for row in rows {
                used.insert(Checksum::from_hex(&row?)?);
            }
        }

        let mut status = CleanStatus::default();
        for checksum in self.list_blobs()? {
            let bytes = std::fs::metadata(self.blob_path(&checksum))
                .map(|metadata| metadata.len())
                .unwrap_or(0);
            if used.contains(&checksum) {
                status.disk_blobs += 1;
                status.disk_bytes += bytes;
            } else {
                self.remove_blob(conn, &checksum)?;
                status.removed_blobs += 1;
                status.removed_bytes += bytes;
            }
        }

        // rows whose file already disappeared still need to go
        let mut orphans = Vec::new();
        {
            let mut stmt = conn.prepare("SELECT checksum FROM blobs")?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            for row in rows {
                let checksum = Checksum::from_hex(&row?)?;
                if !used.contains(&checksum) {
                    orphans.push(checksum);
                }
            }
        }
        for checksum in orphans {
            self.remove_blob(conn, &checksum)?;
        }

        Ok(status)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::database::ConnectionCache;

    fn store() -> (tempfile::TempDir, BlobStore, crate::database::SharedConnection) {
        let dir = tempfile::tempdir().unwrap();
        let cache = ConnectionCache::new();
        let conn = cache.open(dir.path().join("manifest.db")).unwrap();
        let store = BlobStore::new(dir.path().join("blobs"));
        (dir, store, conn)
    }

    #[test]
    fn add_get_remove_round_trip() {
        let (_dir, store, shared) = store();
        let conn = shared.lock().unwrap();

        let blob = Blob::from_data(b"hello blob".to_vec());
        let (checksum, size, existed) = store.add_blob(&conn, &blob).unwrap();
        assert_eq!(size, 10);
        assert!(!existed);
        assert!(store.blob_path(&checksum).is_file());
        assert_eq!(store.blob_size(&conn, &checksum).unwrap(), Some(10));

        let fetched = store.get_blob(&checksum).unwrap();
        assert_eq!(fetched.checksum().unwrap(), checksum);

        store.remove_blob(&conn, &checksum).unwrap();
        assert!(store.get_blob(&checksum).is_none());
        assert_eq!(store.blob_size(&conn, &checksum).unwrap(), None);

        // idempotent
        store.remove_blob(&conn, &checksum).unwrap();
    }

    #[test]
    fn add_blob_is_deduplicating() {
        let (_dir, store, shared) = store();
        let conn = shared.lock().unwrap();

        let first = store
            .add_blob(&conn, &Blob::from_data(b"same".to_vec()))
            .unwrap();
        let second = store
            .add_blob(&conn, &Blob::from_data(b"same".to_vec()))
            .unwrap();
        assert_eq!(first.0, second.0);
        assert!(!first.2);
        assert!(second.2);

        let rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM blobs", [], |row| row.get(0))
            .unwrap();
        assert_eq!(rows, 1);
        assert_eq!(store.list_blobs().unwrap().len(), 1);
    }

    #[test]
    fn clean_removes_only_unreferenced_blobs_and_is_idempotent() {
        let (_dir, store, shared) = store();
        let conn = shared.lock().unwrap();

        let (kept, _, _) = store
            .add_blob(&conn, &Blob::from_data(b"referenced".to_vec()))
            .unwrap();
        let (_swept, _, _) = store
            .add_blob(&conn, &Blob::from_data(b"orphan".to_vec()))
            .unwrap();

        conn.execute_batch(
            "INSERT INTO timelines (id, time_created) VALUES ('t', 0);
             INSERT INTO snapshots (timeline, revision, time_created) VALUES ('t', 1, 0);
             INSERT INTO versions (snapshot, path, last_modified, size, checksum)
                 VALUES (1, 'a', 0, 10, 'x');",
        )
        .unwrap();
        conn.execute(
            "INSERT INTO blocks (version, blob, block_index) VALUES (1, ?1, 0)",
            params![kept.to_hex()],
        )
        .unwrap();

        let status = store.clean(&conn).unwrap();
        assert_eq!(status.removed_blobs, 1);
        assert_eq!(status.removed_bytes, 6);
        assert_eq!(status.disk_blobs, 1);
        assert!(store.get_blob(&kept).is_some());

        let status = store.clean(&conn).unwrap();
        assert_eq!(status.removed_blobs, 0);
    }
}
