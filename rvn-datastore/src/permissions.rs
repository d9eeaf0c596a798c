//! POSIX permission sets.

use std::path::Path;

use anyhow::Error;

/// Set over {owner, group, other} x {read, write, execute}, stored as the
/// lower nine mode bits. `None` at call sites means the file system could
/// not report POSIX permissions; the engine never substitutes a default in
/// that case.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct PermissionSet(u32);

impl PermissionSet {
    pub const MASK: u32 = 0o777;

    pub fn from_mode(mode: u32) -> Self {
        Self(mode & Self::MASK)
    }

    pub fn mode(&self) -> u32 {
        self.0
    }

    /// Read the permissions of `path`, or `None` when the platform cannot
    /// report POSIX mode bits.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Option<Self>, Error> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::MetadataExt;
            let metadata = std::fs::metadata(path.as_ref())?;
            Ok(Some(Self::from_mode(metadata.mode())))
        }
        #[cfg(not(unix))]
        {
            let _ = path;
            Ok(None)
        }
    }

    /// Apply this permission set to `path`.
    pub fn apply<P: AsRef<Path>>(&self, path: P) -> Result<(), Error> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path.as_ref(), std::fs::Permissions::from_mode(self.0))?;
        }
        Ok(())
    }

    pub fn owner_can(&self, permission: Permission) -> bool {
        self.0 & (permission.bit() << 6) != 0
    }

    pub fn group_can(&self, permission: Permission) -> bool {
        self.0 & (permission.bit() << 3) != 0
    }

    pub fn other_can(&self, permission: Permission) -> bool {
        self.0 & permission.bit() != 0
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Permission {
    Read,
    Write,
    Execute,
}

impl Permission {
    fn bit(self) -> u32 {
        match self {
            Permission::Read => 0o4,
            Permission::Write => 0o2,
            Permission::Execute => 0o1,
        }
    }
}
