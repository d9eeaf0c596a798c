//! Read-only snapshot mounts.
//!
//! A mounted snapshot exposes its cumulative versions as a file tree.
//! Directories are synthesized from path prefixes; only regular files
//! exist as leaves, so empty directories never appear. File modes come
//! from the recorded permission set, falling back to a read-only default
//! when none was recorded.

use std::collections::{BTreeMap, HashMap};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, UNIX_EPOCH};

use anyhow::{format_err, Error};
use fuser::{
    BackgroundSession, FileAttr, FileType, Filesystem, MountOption, ReplyAttr, ReplyData,
    ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, Request,
};
use once_cell::sync::Lazy;

use rvn_datastore::{Blob, Snapshot};

pub mod cache;

use cache::SeekableCache;

/// Attribute cache validity handed to the kernel. Mounted snapshots are
/// immutable, so this can be generous.
const TTL: Duration = Duration::from_secs(3600);

/// Mode bits used when a version carries no permission set.
const DEFAULT_FILE_MODE: u16 = 0o644;
const DIR_MODE: u16 = 0o755;

const ROOT_INO: u64 = 1;

struct FileNode {
    size: u64,
    mtime_millis: i64,
    perm: u16,
    blob: Blob,
}

enum Node {
    Directory { children: BTreeMap<String, u64> },
    File(FileNode),
}

struct Tree {
    nodes: BTreeMap<u64, Node>,
}

impl Tree {
    fn build(files: Vec<(String, FileNode)>) -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(
            ROOT_INO,
            Node::Directory {
                children: BTreeMap::new(),
            },
        );
        let mut next_ino = ROOT_INO + 1;

        for (path, file) in files {
            let mut current = ROOT_INO;
            let components: Vec<&str> = path.split('/').filter(|c| !c.is_empty()).collect();
            if components.is_empty() {
                continue;
            }

            for component in &components[..components.len() - 1] {
                let existing = match nodes.get(&current) {
                    Some(Node::Directory { children }) => children.get(*component).copied(),
                    _ => None,
                };
                current = match existing {
                    Some(ino) => ino,
                    None => {
                        let ino = next_ino;
                        next_ino += 1;
                        nodes.insert(
                            ino,
                            Node::Directory {
                                children: BTreeMap::new(),
                            },
                        );
                        if let Some(Node::Directory { children }) = nodes.get_mut(&current) {
                            children.insert(component.to_string(), ino);
                        }
                        ino
                    }
                };
            }

            let leaf = next_ino;
            next_ino += 1;
            nodes.insert(leaf, Node::File(file));
            if let Some(Node::Directory { children }) = nodes.get_mut(&current) {
                children.insert(components[components.len() - 1].to_string(), leaf);
            }
        }

        Self { nodes }
    }

    fn lookup_child(&self, parent: u64, name: &str) -> Option<u64> {
        match self.nodes.get(&parent) {
            Some(Node::Directory { children }) => children.get(name).copied(),
            _ => None,
        }
    }

    fn attr(&self, ino: u64) -> Option<FileAttr> {
        let node = self.nodes.get(&ino)?;
        Some(match node {
            Node::Directory { .. } => make_attr(ino, 0, 0, DIR_MODE, FileType::Directory),
            Node::File(file) => make_attr(
                ino,
                file.size,
                file.mtime_millis,
                file.perm,
                FileType::RegularFile,
            ),
        })
    }
}

fn make_attr(ino: u64, size: u64, mtime_millis: i64, perm: u16, kind: FileType) -> FileAttr {
    let mtime = if mtime_millis >= 0 {
        UNIX_EPOCH + Duration::from_millis(mtime_millis as u64)
    } else {
        UNIX_EPOCH
    };

    FileAttr {
        ino,
        size,
        blocks: size.div_ceil(512),
        atime: mtime,
        mtime,
        ctime: mtime,
        crtime: mtime,
        kind,
        perm,
        nlink: if kind == FileType::Directory { 2 } else { 1 },
        uid: unsafe { libc::getuid() },
        gid: unsafe { libc::getgid() },
        rdev: 0,
        blksize: 4096,
        flags: 0,
    }
}

/// The filesystem serving one mounted snapshot.
pub struct SnapshotFilesystem {
    tree: Tree,
    handles: HashMap<u64, SeekableCache>,
    next_fh: u64,
}

impl SnapshotFilesystem {
    /// Materialize the snapshot's cumulative versions into a mountable
    /// tree. The view is fixed at call time.
    pub fn new(snapshot: &Snapshot) -> Result<Self, Error> {
        let mut files = Vec::new();
        for (path, version) in snapshot.cumulative_versions()? {
            files.push((
                path,
                FileNode {
                    size: version.size(),
                    mtime_millis: version.last_modified(),
                    perm: version
                        .permissions()
                        .map(|set| set.mode() as u16)
                        .unwrap_or(DEFAULT_FILE_MODE),
                    blob: version.data()?,
                },
            ));
        }

        Ok(Self {
            tree: Tree::build(files),
            handles: HashMap::new(),
            next_fh: 1,
        })
    }
}

impl Filesystem for SnapshotFilesystem {
    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let name = match name.to_str() {
            Some(name) => name,
            None => return reply.error(libc::ENOENT),
        };
        match self
            .tree
            .lookup_child(parent, name)
            .and_then(|ino| self.tree.attr(ino))
        {
            Some(attr) => reply.entry(&TTL, &attr, 0),
            None => reply.error(libc::ENOENT),
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyAttr) {
        match self.tree.attr(ino) {
            Some(attr) => reply.attr(&TTL, &attr),
            None => reply.error(libc::ENOENT),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let children = match self.tree.nodes.get(&ino) {
            Some(Node::Directory { children }) => children,
            Some(Node::File(_)) => return reply.error(libc::ENOTDIR),
            None => return reply.error(libc::ENOENT),
        };

        let mut entries: Vec<(u64, FileType, String)> = vec![
            (ino, FileType::Directory, ".".to_string()),
            (ino, FileType::Directory, "..".to_string()),
        ];
        for (name, child) in children {
            let kind = match self.tree.nodes.get(child) {
                Some(Node::Directory { .. }) => FileType::Directory,
                _ => FileType::RegularFile,
            };
            entries.push((*child, kind, name.clone()));
        }

        for (index, (child, kind, name)) in
            entries.iter().enumerate().skip(offset as usize)
        {
            if reply.add(*child, (index + 1) as i64, *kind, name) {
                break;
            }
        }
        reply.ok();
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        let file = match self.tree.nodes.get(&ino) {
            Some(Node::File(file)) => file,
            Some(Node::Directory { .. }) => return reply.error(libc::EISDIR),
            None => return reply.error(libc::ENOENT),
        };

        let channel = match file.blob.open() {
            Ok(channel) => channel,
            Err(err) => {
                log::error!("unable to open snapshot file data - {}", err);
                return reply.error(libc::EIO);
            }
        };
        let cache = match SeekableCache::new(channel) {
            Ok(cache) => cache,
            Err(err) => {
                log::error!("unable to allocate read cache - {}", err);
                return reply.error(libc::EIO);
            }
        };

        let fh = self.next_fh;
        self.next_fh += 1;
        self.handles.insert(fh, cache);
        reply.opened(fh, 0);
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let cache = match self.handles.get_mut(&fh) {
            Some(cache) => cache,
            None => return reply.error(libc::EBADF),
        };

        let mut buf = vec![0u8; size as usize];
        let mut filled = 0;
        // no short reads except at the end of the file
        while filled < buf.len() {
            match cache.read_at(offset as u64 + filled as u64, &mut buf[filled..]) {
                Ok(0) => break,
                Ok(got) => filled += got,
                Err(err) => {
                    log::error!("snapshot read failed - {}", err);
                    return reply.error(libc::EIO);
                }
            }
        }
        buf.truncate(filled);
        reply.data(&buf);
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        self.handles.remove(&fh);
        reply.ok();
    }
}

/// Process wide registry of mounted snapshots, keyed by mount path.
pub struct SnapshotMounter {
    mounts: Mutex<HashMap<PathBuf, BackgroundSession>>,
}

static DEFAULT_MOUNTER: Lazy<SnapshotMounter> = Lazy::new(SnapshotMounter::new);

pub fn default_mounter() -> &'static SnapshotMounter {
    &DEFAULT_MOUNTER
}

impl SnapshotMounter {
    pub fn new() -> Self {
        Self {
            mounts: Mutex::new(HashMap::new()),
        }
    }

    /// Mount `snapshot` read-only at `path`, creating the directory if
    /// needed. Idempotent per path.
    pub fn mount(&self, snapshot: &Snapshot, path: &Path) -> Result<(), Error> {
        std::fs::create_dir_all(path)?;
        let path = path
            .canonicalize()
            .map_err(|err| format_err!("unable to resolve mount path {:?} - {}", path, err))?;

        let mut mounts = self.mounts.lock().unwrap();
        if mounts.contains_key(&path) {
            return Ok(());
        }

        let filesystem = SnapshotFilesystem::new(snapshot)?;
        let session = fuser::spawn_mount2(
            filesystem,
            &path,
            &[
                MountOption::RO,
                MountOption::FSName("reversion".to_string()),
                MountOption::AutoUnmount,
            ],
        )
        .map_err(|err| format_err!("unable to mount snapshot at {:?} - {}", path, err))?;

        log::info!("snapshot mounted at {:?}", path);
        mounts.insert(path, session);
        Ok(())
    }

    /// Unmount the filesystem at `path`. Best effort; returns false when
    /// nothing was mounted there.
    pub fn unmount(&self, path: &Path) -> Result<bool, Error> {
        let path = match path.canonicalize() {
            Ok(path) => path,
            Err(_) => path.to_path_buf(),
        };

        match self.mounts.lock().unwrap().remove(&path) {
            Some(session) => {
                // dropping the session detaches the mount
                drop(session);
                log::info!("snapshot unmounted from {:?}", path);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Whether `path` currently has a mounted snapshot. Pure lookup.
    pub fn is_mounted(&self, path: &Path) -> bool {
        let path = match path.canonicalize() {
            Ok(path) => path,
            Err(_) => path.to_path_buf(),
        };
        self.mounts.lock().unwrap().contains_key(&path)
    }
}

impl Default for SnapshotMounter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn file(content: &[u8], mtime: i64, perm: u16) -> FileNode {
        FileNode {
            size: content.len() as u64,
            mtime_millis: mtime,
            perm,
            blob: Blob::from_data(content.to_vec()),
        }
    }

    fn sample_tree() -> Tree {
        Tree::build(vec![
            ("a.txt".to_string(), file(b"aaa", 1_000, 0o600)),
            ("dir/b.txt".to_string(), file(b"bbbb", 2_000, 0o644)),
            ("dir/sub/c.txt".to_string(), file(b"c", 3_000, 0o644)),
        ])
    }

    #[test]
    fn tree_synthesizes_directories_from_prefixes() {
        let tree = sample_tree();

        let dir = tree.lookup_child(ROOT_INO, "dir").unwrap();
        let sub = tree.lookup_child(dir, "sub").unwrap();
        assert!(tree.lookup_child(sub, "c.txt").is_some());
        assert!(tree.lookup_child(ROOT_INO, "missing").is_none());

        let attr = tree.attr(dir).unwrap();
        assert_eq!(attr.kind, FileType::Directory);
        assert_eq!(attr.perm, DIR_MODE);
    }

    #[test]
    fn file_attrs_carry_recorded_metadata() {
        let tree = sample_tree();
        let ino = tree.lookup_child(ROOT_INO, "a.txt").unwrap();
        let attr = tree.attr(ino).unwrap();

        assert_eq!(attr.kind, FileType::RegularFile);
        assert_eq!(attr.size, 3);
        assert_eq!(attr.perm, 0o600);
        assert_eq!(attr.mtime, UNIX_EPOCH + Duration::from_millis(1_000));
    }

    #[test]
    fn root_listing_has_no_empty_directories() {
        let tree = sample_tree();
        match tree.nodes.get(&ROOT_INO) {
            Some(Node::Directory { children }) => {
                assert_eq!(
                    children.keys().cloned().collect::<Vec<_>>(),
                    vec!["a.txt", "dir"]
                );
            }
            _ => panic!("root must be a directory"),
        }
    }
}
