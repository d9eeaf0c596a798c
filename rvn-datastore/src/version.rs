//! A single recorded file state.

use std::io::{Read, Write};
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Error};
use rusqlite::params;

use crate::blob::Blob;
use crate::checksum::Checksum;
use crate::error::RvnError;
use crate::permissions::PermissionSet;
use crate::repository::RepoInner;

/// One file content record: metadata plus an ordered block list. The
/// blocks, concatenated in index order, reconstruct the file's bytes.
pub struct Version {
    repo: Arc<RepoInner>,
    id: i64,
    snapshot_id: i64,
    revision: i64,
    path: String,
    last_modified: i64,
    permissions: Option<PermissionSet>,
    size: u64,
    checksum: Checksum,
}

impl Version {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn from_parts(
        repo: Arc<RepoInner>,
        id: i64,
        snapshot_id: i64,
        revision: i64,
        path: String,
        last_modified: i64,
        permissions: Option<PermissionSet>,
        size: u64,
        checksum: Checksum,
    ) -> Self {
        Self {
            repo,
            id,
            snapshot_id,
            revision,
            path,
            last_modified,
            permissions,
            size,
            checksum,
        }
    }

    pub(crate) fn id(&self) -> i64 {
        self.id
    }

    pub(crate) fn snapshot_id(&self) -> i64 {
        self.snapshot_id
    }

    /// Revision of the owning snapshot.
    pub fn revision(&self) -> i64 {
        self.revision
    }

    /// Path relative to the work directory root.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Last modification time in unix epoch milliseconds.
    pub fn last_modified(&self) -> i64 {
        self.last_modified
    }

    pub fn permissions(&self) -> Option<PermissionSet> {
        self.permissions
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn checksum(&self) -> Checksum {
        self.checksum
    }

    /// Ordered blob checksums of this version's blocks.
    pub fn blocks(&self) -> Result<Vec<Checksum>, Error> {
        let conn = self.repo.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT blob FROM blocks WHERE version = ?1 ORDER BY block_index",
        )?;
        let rows = stmt.query_map(params![self.id], |row| row.get::<_, String>(0))?;

        let mut blocks = Vec::new();
        for row in rows {
            blocks.push(Checksum::from_hex(&row?)?);
        }
        Ok(blocks)
    }

    /// Lazy concatenation of all blocks in index order. Blob files missing
    /// at read time are silently skipped; callers must verify if they need
    /// the bytes to match [`size`](Self::size).
    pub fn data(&self) -> Result<Blob, Error> {
        let paths = self
            .blocks()?
            .iter()
            .map(|checksum| self.repo.blob_store.blob_path(checksum))
            .collect();
        Ok(Blob::from_chain(paths))
    }

    /// Whether the file at `file_path` currently differs from this version.
    ///
    /// True iff the file exists and its size or whole file checksum
    /// differs. The modification time alone never decides.
    pub fn is_changed<P: AsRef<Path>>(&self, file_path: P) -> Result<bool, Error> {
        let file_path = file_path.as_ref();

        let metadata = match std::fs::metadata(file_path) {
            Ok(metadata) => metadata,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(err) => return Err(err.into()),
        };

        if metadata.len() != self.size {
            return Ok(true);
        }

        let file = std::fs::File::open(file_path)?;
        let checksum = Checksum::of_reader(std::io::BufReader::new(file))?;
        Ok(checksum != self.checksum)
    }

    /// Write this version's content to `target_path`.
    ///
    /// The bytes go to a temporary file in the target's directory which is
    /// then renamed into place; last modified time and permissions (when
    /// recorded) are restored afterwards. With `verify` the reconstructed
    /// bytes are hashed and a mismatch fails with a corruption error.
    pub fn checkout<P: AsRef<Path>>(
        &self,
        target_path: P,
        overwrite: bool,
        verify: bool,
    ) -> Result<(), Error> {
        let target_path = target_path.as_ref();

        if !overwrite && target_path.exists() {
            bail!("refusing to overwrite existing file {:?}", target_path);
        }

        let (mut file, tmp_path) = rvn_tools::fs::make_tmp_file(target_path)?;

        let result = (|| -> Result<(), Error> {
            let mut channel = self.data()?.open()?;

            if verify {
                let mut hasher = openssl::sha::Sha256::new();
                let mut buf = [0u8; 64 * 1024];
                loop {
                    let got = channel.read(&mut buf)?;
                    if got == 0 {
                        break;
                    }
                    hasher.update(&buf[..got]);
                    file.write_all(&buf[..got])?;
                }
                let actual = Checksum::from_bytes(hasher.finish());
                if actual != self.checksum {
                    bail!(RvnError::DataCorrupt(format!(
                        "reconstructed data for '{}' hashes to {} instead of {}",
                        self.path, actual, self.checksum
                    )));
                }
            } else {
                std::io::copy(&mut channel, &mut file)?;
            }

            drop(file);
            std::fs::rename(&tmp_path, target_path)?;

            rvn_tools::fs::set_file_mtime(target_path, self.last_modified)?;
            if let Some(permissions) = self.permissions {
                permissions.apply(target_path)?;
            }
            Ok(())
        })();

        if result.is_err() {
            let _ = std::fs::remove_file(&tmp_path);
        }

        result
    }
}
