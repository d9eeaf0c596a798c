//! Content addressed byte ranges.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, format_err, Error};
use once_cell::sync::OnceCell;

use crate::checksum::Checksum;

/// A lazy byte producer paired with the checksum of its content.
///
/// Blobs are ephemeral values; they only become records once added to a
/// blob store. The checksum is computed over the exact bytes the blob
/// emits and memoized on first use.
pub struct Blob {
    data: BlobData,
    checksum: OnceCell<Checksum>,
}

enum BlobData {
    Memory(Arc<[u8]>),
    File(PathBuf),
    Chain(Vec<PathBuf>),
}

impl Blob {
    pub fn from_data(data: Vec<u8>) -> Self {
        Self {
            data: BlobData::Memory(data.into()),
            checksum: OnceCell::new(),
        }
    }

    /// A blob reading the file at `path` on demand.
    pub fn from_file<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            data: BlobData::File(path.into()),
            checksum: OnceCell::new(),
        }
    }

    /// A blob concatenating the files at `paths` in order. Files missing at
    /// read time are silently skipped, so the emitted length may be shorter
    /// than the sum of the parts; callers needing a guarantee must verify.
    pub fn from_chain(paths: Vec<PathBuf>) -> Self {
        Self {
            data: BlobData::Chain(paths),
            checksum: OnceCell::new(),
        }
    }

    pub fn size(&self) -> Result<u64, Error> {
        match &self.data {
            BlobData::Memory(data) => Ok(data.len() as u64),
            BlobData::File(path) => Ok(std::fs::metadata(path)?.len()),
            BlobData::Chain(paths) => {
                let mut total = 0;
                for path in paths {
                    match std::fs::metadata(path) {
                        Ok(metadata) => total += metadata.len(),
                        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                        Err(err) => return Err(err.into()),
                    }
                }
                Ok(total)
            }
        }
    }

    pub fn checksum(&self) -> Result<Checksum, Error> {
        self.checksum
            .get_or_try_init(|| match &self.data {
                BlobData::Memory(data) => Ok(Checksum::of(data)),
                _ => Checksum::of_reader(self.open()?),
            })
            .copied()
    }

    /// Open a channel over the blob's bytes, readable exactly once.
    pub fn open(&self) -> Result<Box<dyn Read + Send>, Error> {
        match &self.data {
            BlobData::Memory(data) => Ok(Box::new(std::io::Cursor::new(Arc::clone(data)))),
            BlobData::File(path) => {
                let file = std::fs::File::open(path)
                    .map_err(|err| format_err!("unable to open blob file {:?} - {}", path, err))?;
                Ok(Box::new(file))
            }
            BlobData::Chain(paths) => Ok(Box::new(ChainReader {
                remaining: paths.clone().into(),
                current: None,
            })),
        }
    }

    /// Materialize the bytes to `path` atomically (temp file plus rename).
    pub fn write_to<P: AsRef<Path>>(&self, path: P, overwrite: bool) -> Result<(), Error> {
        let path = path.as_ref();

        if !overwrite && path.exists() {
            bail!("refusing to overwrite existing file {:?}", path);
        }

        let (mut file, tmp_path) = rvn_tools::fs::make_tmp_file(path)?;

        let result = self
            .open()
            .and_then(|mut channel| std::io::copy(&mut channel, &mut file).map_err(Error::from))
            .and_then(|_| std::fs::rename(&tmp_path, path).map_err(Error::from));

        if result.is_err() {
            let _ = std::fs::remove_file(&tmp_path);
        }

        result.map(drop)
    }
}

struct ChainReader {
    remaining: std::collections::VecDeque<PathBuf>,
    current: Option<std::fs::File>,
}

impl Read for ChainReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        loop {
            if let Some(file) = self.current.as_mut() {
                let got = file.read(buf)?;
                if got > 0 {
                    return Ok(got);
                }
                self.current = None;
            }

            let path = match self.remaining.pop_front() {
                Some(path) => path,
                None => return Ok(0),
            };
            match std::fs::File::open(&path) {
                Ok(file) => self.current = Some(file),
                // missing links are skipped at read time
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn memory_blob_checksum_and_size() {
        let blob = Blob::from_data(b"hello".to_vec());
        assert_eq!(blob.size().unwrap(), 5);
        assert_eq!(blob.checksum().unwrap(), Checksum::of(b"hello"));
    }

    #[test]
    fn file_blob_reads_lazily() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data");
        std::fs::write(&path, b"content").unwrap();

        let blob = Blob::from_file(&path);
        assert_eq!(blob.checksum().unwrap(), Checksum::of(b"content"));

        let mut bytes = Vec::new();
        blob.open().unwrap().read_to_end(&mut bytes).unwrap();
        assert_eq!(bytes, b"content");
    }

    #[test]
    fn chain_blob_concatenates_and_skips_missing() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("first");
        let missing = dir.path().join("missing");
        let second = dir.path().join("second");
        std::fs::write(&first, b"abc").unwrap();
        std::fs::write(&second, b"def").unwrap();

        let blob = Blob::from_chain(vec![first, missing, second]);
        assert_eq!(blob.size().unwrap(), 6);

        let mut bytes = Vec::new();
        blob.open().unwrap().read_to_end(&mut bytes).unwrap();
        assert_eq!(bytes, b"abcdef");
        assert_eq!(blob.checksum().unwrap(), Checksum::of(b"abcdef"));
    }

    #[test]
    fn write_to_honors_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out");
        std::fs::write(&path, b"old").unwrap();

        let blob = Blob::from_data(b"new".to_vec());
        assert!(blob.write_to(&path, false).is_err());
        assert_eq!(std::fs::read(&path).unwrap(), b"old");

        blob.write_to(&path, true).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"new");
    }
}
