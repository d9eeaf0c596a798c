//! File system helper functions.

use std::io::Write;
use std::path::Path;

use anyhow::{bail, format_err, Error};

/// Atomically replace `path` with `data`.
///
/// The data is written to a temporary file in the same directory which is
/// then renamed over the target, so concurrent readers either see the old
/// or the new content, never a partial write.
pub fn replace_file<P: AsRef<Path>>(path: P, data: &[u8]) -> Result<(), Error> {
    let path = path.as_ref();

    let (mut file, tmp_path) = make_tmp_file(path)?;

    let result = file.write_all(data).map_err(Error::from).and_then(|_| {
        std::fs::rename(&tmp_path, path)
            .map_err(|err| format_err!("rename {:?} to {:?} failed - {}", tmp_path, path, err))
    });

    if result.is_err() {
        let _ = std::fs::remove_file(&tmp_path);
    }

    result
}

/// Create a uniquely named temporary file next to `path`.
///
/// Returns the open file and its path so the caller can rename it into
/// place once the content is complete.
pub fn make_tmp_file<P: AsRef<Path>>(
    path: P,
) -> Result<(std::fs::File, std::path::PathBuf), Error> {
    let path = path.as_ref();

    let file_name = path
        .file_name()
        .ok_or_else(|| format_err!("path {:?} has no file name", path))?
        .to_os_string();

    // bounded retry so a pathological directory cannot loop us forever
    for attempt in 0..64u32 {
        let mut tmp_name = file_name.clone();
        tmp_name.push(format!(".tmp_{:08x}", tmp_nonce(attempt)));
        let tmp_path = path.with_file_name(tmp_name);

        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&tmp_path)
        {
            Ok(file) => return Ok((file, tmp_path)),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => continue,
            Err(err) => bail!("unable to create tmp file {:?} - {}", tmp_path, err),
        }
    }

    bail!("unable to create tmp file for {:?}", path);
}

fn tmp_nonce(attempt: u32) -> u32 {
    let pid = std::process::id();
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    pid.wrapping_mul(31).wrapping_add(now).wrapping_add(attempt)
}

/// Set the last modification time of `path` to `mtime_millis` (unix epoch
/// milliseconds), leaving the access time untouched.
pub fn set_file_mtime<P: AsRef<Path>>(path: P, mtime_millis: i64) -> Result<(), Error> {
    use nix::sys::stat::{utimensat, UtimensatFlags};
    use nix::sys::time::TimeSpec;

    let secs = mtime_millis.div_euclid(1000);
    let nanos = mtime_millis.rem_euclid(1000) * 1_000_000;

    let atime = TimeSpec::new(0, libc::UTIME_OMIT);
    let mtime = TimeSpec::new(secs, nanos);

    utimensat(
        None,
        path.as_ref(),
        &atime,
        &mtime,
        UtimensatFlags::NoFollowSymlink,
    )
    .map_err(|err| format_err!("utimensat on {:?} failed - {}", path.as_ref(), err))
}

/// Last modification time of `path` in unix epoch milliseconds.
pub fn file_mtime<P: AsRef<Path>>(path: P) -> Result<i64, Error> {
    let metadata = std::fs::metadata(path.as_ref())?;
    mtime_millis(&metadata)
}

/// Extract the modification time from `metadata` in unix epoch milliseconds.
pub fn mtime_millis(metadata: &std::fs::Metadata) -> Result<i64, Error> {
    let mtime = metadata.modified()?;
    match mtime.duration_since(std::time::UNIX_EPOCH) {
        Ok(duration) => Ok(duration.as_millis() as i64),
        Err(err) => Ok(-(err.duration().as_millis() as i64)),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn replace_file_creates_and_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("target.txt");

        replace_file(&path, b"first").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"first");

        replace_file(&path, b"second").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"second");

        // no stray tmp files left behind
        let entries: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn mtime_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("file");
        std::fs::write(&path, b"x").unwrap();

        set_file_mtime(&path, 1_500_000_000_123).unwrap();
        assert_eq!(file_mtime(&path).unwrap(), 1_500_000_000_123);
    }
}
