//! Working directory management.
//!
//! A working directory binds a user visible directory tree to exactly one
//! timeline. All engine state lives in the hidden `.reversion/` directory:
//! `info.json` (the timeline id), `ignore.json`, and a self contained
//! repository under `repository/`.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use anyhow::{bail, format_err, Error};
use once_cell::sync::Lazy;
use rvn_tools::task::TaskContext;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use rvn_datastore::{
    ConnectionCache, Repository, RepositoryConfig, RvnError, Snapshot, Timeline,
};

use crate::ignore::{self, CompiledMatcher, IgnoreMatcher};

/// Name of the hidden metadata directory.
pub const METADATA_DIR: &str = ".reversion";

const INFO_FILE: &str = "info.json";
const IGNORE_FILE: &str = "ignore.json";
const REPOSITORY_DIR: &str = "repository";

/// Description recorded on the automatic snapshot taken before a restore.
pub const RESTORE_COMMIT_DESCRIPTION: &str = "Automatic snapshot taken before a restore";

#[derive(Serialize, Deserialize)]
struct WorkDirectoryInfo {
    timeline: Uuid,
}

/// Per process instance cache: at most one live [`WorkDirectory`] per
/// canonical root path. Tests may instantiate their own cache.
pub struct WorkDirCache {
    instances: Mutex<HashMap<PathBuf, Arc<WorkDirectory>>>,
}

static DEFAULT_CACHE: Lazy<WorkDirCache> = Lazy::new(WorkDirCache::new);

pub fn default_cache() -> &'static WorkDirCache {
    &DEFAULT_CACHE
}

impl WorkDirCache {
    pub fn new() -> Self {
        Self {
            instances: Mutex::new(HashMap::new()),
        }
    }

    /// Turn `root` into a tracked working directory backed by a fresh
    /// private repository.
    pub fn init(
        &self,
        root: &Path,
        config: RepositoryConfig,
        connections: &ConnectionCache,
    ) -> Result<Arc<WorkDirectory>, Error> {
        let metadata_dir = root.join(METADATA_DIR);
        if metadata_dir.exists() {
            bail!(RvnError::InvalidInput(format!(
                "'{}' is already a work directory",
                root.display()
            )));
        }

        std::fs::create_dir_all(root)?;
        std::fs::create_dir(&metadata_dir)?;

        let repository =
            Repository::create(&metadata_dir.join(REPOSITORY_DIR), config, connections)?;
        let timeline = repository.create_timeline()?;

        let info = WorkDirectoryInfo {
            timeline: timeline.id(),
        };
        let mut data = serde_json::to_vec_pretty(&info)?;
        data.push(b'\n');
        rvn_tools::fs::replace_file(metadata_dir.join(INFO_FILE), &data)?;
        ignore::store_matchers(metadata_dir.join(IGNORE_FILE), &[])?;

        self.open(root, connections)
    }

    /// Open the working directory rooted at `root`.
    pub fn open(
        &self,
        root: &Path,
        connections: &ConnectionCache,
    ) -> Result<Arc<WorkDirectory>, Error> {
        let root = root
            .canonicalize()
            .map_err(|err| format_err!("unable to resolve {:?} - {}", root, err))?;

        let mut instances = self.instances.lock().unwrap();
        if let Some(instance) = instances.get(&root) {
            return Ok(Arc::clone(instance));
        }

        let metadata_dir = root.join(METADATA_DIR);
        if !metadata_dir.is_dir() {
            bail!(RvnError::NotAWorkDirectory(root.display().to_string()));
        }

        let info: WorkDirectoryInfo =
            serde_json::from_slice(&std::fs::read(metadata_dir.join(INFO_FILE))?).map_err(
                |err| RvnError::InvalidRepository(format!("malformed info.json - {}", err)),
            )?;

        let repository = Repository::open(&metadata_dir.join(REPOSITORY_DIR), connections)?;
        if repository.timeline(info.timeline)?.is_none() {
            bail!(RvnError::InvalidRepository(format!(
                "timeline {} referenced by info.json does not exist",
                info.timeline
            )));
        }

        let matchers = ignore::load_matchers(metadata_dir.join(IGNORE_FILE))?;
        let compiled = compile_with_defaults(&matchers)?;

        let instance = Arc::new(WorkDirectory {
            root: root.clone(),
            repository,
            timeline_id: info.timeline,
            matchers: RwLock::new(MatcherState { matchers, compiled }),
        });
        instances.insert(root, Arc::clone(&instance));
        Ok(instance)
    }

    /// Walk up from `path` until a directory with hidden metadata is found.
    pub fn open_from_descendant(
        &self,
        path: &Path,
        connections: &ConnectionCache,
    ) -> Result<Arc<WorkDirectory>, Error> {
        let start = path
            .canonicalize()
            .map_err(|err| format_err!("unable to resolve {:?} - {}", path, err))?;

        let mut candidate = Some(start.as_path());
        while let Some(dir) = candidate {
            if dir.join(METADATA_DIR).is_dir() {
                return self.open(dir, connections);
            }
            candidate = dir.parent();
        }

        bail!(RvnError::NotAWorkDirectory(path.display().to_string()))
    }

    /// Delete the working directory's engine state (repository plus hidden
    /// metadata) and drop the cached instance. User files are untouched.
    pub fn delete(&self, root: &Path, connections: &ConnectionCache) -> Result<(), Error> {
        let root = root
            .canonicalize()
            .map_err(|err| format_err!("unable to resolve {:?} - {}", root, err))?;
        let metadata_dir = root.join(METADATA_DIR);
        if !metadata_dir.is_dir() {
            bail!(RvnError::NotAWorkDirectory(root.display().to_string()));
        }

        Repository::delete(&metadata_dir.join(REPOSITORY_DIR), connections)?;
        std::fs::remove_dir_all(&metadata_dir)?;

        self.instances.lock().unwrap().remove(&root);
        Ok(())
    }
}

impl Default for WorkDirCache {
    fn default() -> Self {
        Self::new()
    }
}

struct MatcherState {
    matchers: Vec<IgnoreMatcher>,
    compiled: CompiledMatcher,
}

fn compile_with_defaults(matchers: &[IgnoreMatcher]) -> Result<CompiledMatcher, Error> {
    // the hidden metadata directory is always ignored
    let mut combined = vec![IgnoreMatcher::Prefix {
        path: PathBuf::from(METADATA_DIR),
    }];
    combined.extend_from_slice(matchers);
    CompiledMatcher::compile(&combined)
}

/// A user directory bound to one timeline of its private repository.
pub struct WorkDirectory {
    root: PathBuf,
    repository: Repository,
    timeline_id: Uuid,
    matchers: RwLock<MatcherState>,
}

impl WorkDirectory {
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn repository(&self) -> &Repository {
        &self.repository
    }

    pub fn timeline(&self) -> Result<Timeline, Error> {
        self.repository
            .timeline(self.timeline_id)?
            .ok_or_else(|| RvnError::Internal("work directory timeline disappeared".into()).into())
    }

    pub fn ignore_matchers(&self) -> Vec<IgnoreMatcher> {
        self.matchers.read().unwrap().matchers.clone()
    }

    /// Replace the persisted ignore matcher set.
    pub fn set_ignore_matchers(&self, matchers: Vec<IgnoreMatcher>) -> Result<(), Error> {
        let compiled = compile_with_defaults(&matchers)?;
        ignore::store_matchers(
            self.root.join(METADATA_DIR).join(IGNORE_FILE),
            &matchers,
        )?;
        *self.matchers.write().unwrap() = MatcherState { matchers, compiled };
        Ok(())
    }

    /// Normalize inputs to absolute paths, dropping descendants of other
    /// inputs. An empty input list means the whole tree.
    fn normalize_inputs(&self, paths: &[PathBuf]) -> Vec<PathBuf> {
        let mut inputs: Vec<PathBuf> = if paths.is_empty() {
            vec![self.root.clone()]
        } else {
            paths
                .iter()
                .map(|path| {
                    if path.is_absolute() {
                        path.clone()
                    } else {
                        self.root.join(path)
                    }
                })
                .collect()
        };

        inputs.sort();
        inputs.dedup();

        let mut flattened: Vec<PathBuf> = Vec::new();
        for input in inputs {
            if !flattened
                .iter()
                .any(|kept| input.starts_with(kept) && input != *kept)
            {
                flattened.push(input);
            }
        }
        flattened
    }

    fn relative(&self, path: &Path) -> Option<String> {
        let rel = path.strip_prefix(&self.root).ok()?;
        let rel = rel.to_str()?;
        if rel.is_empty() {
            None
        } else {
            Some(rel.to_string())
        }
    }

    /// Enumerate the regular files below the given paths, apply the ignore
    /// matchers, and return paths relative to the root.
    pub fn walk_directory(&self, paths: &[PathBuf]) -> Result<Vec<String>, Error> {
        let state = self.matchers.read().unwrap();
        let mut files = Vec::new();

        for input in self.normalize_inputs(paths) {
            let metadata = match std::fs::symlink_metadata(&input) {
                Ok(metadata) => metadata,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(err) => return Err(err.into()),
            };

            if metadata.is_file() {
                if let Some(rel) = self.relative(&input) {
                    if !state.compiled.is_ignored(Path::new(&rel), metadata.len()) {
                        files.push(rel);
                    }
                }
                continue;
            }

            if !metadata.is_dir() {
                continue;
            }

            for entry in walkdir::WalkDir::new(&input).follow_links(false) {
                let entry = entry?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let rel = match self.relative(entry.path()) {
                    Some(rel) => rel,
                    None => continue,
                };
                let size = entry.metadata()?.len();
                if !state.compiled.is_ignored(Path::new(&rel), size) {
                    files.push(rel);
                }
            }
        }

        files.sort();
        files.dedup();
        Ok(files)
    }

    /// Intersect the timeline's recorded paths with the requested
    /// subtrees, applying the same ignore filtering.
    pub fn walk_timeline(&self, paths: &[PathBuf]) -> Result<Vec<String>, Error> {
        let inputs = self.normalize_inputs(paths);
        let state = self.matchers.read().unwrap();

        let mut selected = Vec::new();
        for rel in self.timeline()?.paths()? {
            let absolute = self.root.join(&rel);
            let in_scope = inputs
                .iter()
                .any(|input| absolute.starts_with(input) || absolute == *input);
            if !in_scope {
                continue;
            }

            let size = std::fs::metadata(&absolute)
                .map(|metadata| metadata.len())
                .unwrap_or(0);
            if !state.compiled.is_ignored(Path::new(&rel), size) {
                selected.push(rel);
            }
        }
        Ok(selected)
    }

    /// Reduce `rel_paths` to the files that differ from the latest
    /// snapshot. Files with no prior version count as modified; files that
    /// no longer exist are dropped.
    pub fn filter_modified(&self, rel_paths: &[String]) -> Result<Vec<String>, Error> {
        let cumulative = match self.timeline()?.latest_snapshot()? {
            Some(snapshot) => snapshot.cumulative_versions()?,
            None => BTreeMap::new(),
        };

        let mut modified = Vec::new();
        for rel in rel_paths {
            let absolute = self.root.join(rel);
            if !absolute.is_file() {
                continue;
            }
            match cumulative.get(rel) {
                None => modified.push(rel.clone()),
                Some(version) => {
                    if version.is_changed(&absolute)? {
                        modified.push(rel.clone());
                    }
                }
            }
        }
        Ok(modified)
    }

    /// Snapshot the given paths. Unmodified files are skipped unless
    /// `force` is set; when nothing remains no snapshot is created.
    pub fn commit(
        &self,
        paths: &[PathBuf],
        force: bool,
        name: Option<String>,
        description: &str,
        pinned: bool,
    ) -> Result<Option<Snapshot>, Error> {
        let walked = self.walk_directory(paths)?;
        let to_commit = if force {
            walked
        } else {
            self.filter_modified(&walked)?
        };

        if to_commit.is_empty() {
            return Ok(None);
        }

        let snapshot =
            self.timeline()?
                .create_snapshot(&to_commit, &self.root, name, description, pinned)?;
        log::info!(
            "committed {} file(s) as revision {}",
            to_commit.len(),
            snapshot.revision()
        );
        Ok(Some(snapshot))
    }

    /// Write the recorded content of the given paths back into the
    /// working directory.
    ///
    /// `revision` selects the snapshot (latest when absent). Files whose
    /// current content is unmodified are always overwritten; modified
    /// files only with `overwrite`.
    pub fn update(
        &self,
        paths: &[PathBuf],
        revision: Option<i64>,
        overwrite: bool,
        task: &dyn TaskContext,
    ) -> Result<u64, Error> {
        let timeline = self.timeline()?;
        let snapshot = match revision {
            Some(revision) => timeline.snapshot(revision)?.ok_or_else(|| {
                RvnError::InvalidInput(format!("no snapshot with revision {}", revision))
            })?,
            None => match timeline.latest_snapshot()? {
                Some(snapshot) => snapshot,
                None => return Ok(0),
            },
        };

        let target_versions = snapshot.cumulative_versions()?;
        let current_versions = match timeline.latest_snapshot()? {
            Some(latest) => latest.cumulative_versions()?,
            None => Default::default(),
        };

        let mut updated = 0;
        for rel in self.walk_timeline(paths)? {
            task.check_abort()?;

            let version = match target_versions.get(&rel) {
                Some(version) => version,
                None => continue,
            };
            let absolute = self.root.join(&rel);

            let unmodified = match current_versions.get(&rel) {
                Some(current) => !current.is_changed(&absolute)?,
                None => false,
            };
            let effective_overwrite = overwrite || unmodified;

            if absolute.exists() && !effective_overwrite {
                log::info!("skipping modified file '{}'", rel);
                continue;
            }

            if let Some(parent) = absolute.parent() {
                std::fs::create_dir_all(parent)?;
            }
            version.checkout(&absolute, effective_overwrite, false)?;
            updated += 1;
        }

        log::info!("updated {} file(s)", updated);
        Ok(updated)
    }

    /// Commit the current content of `paths` as a safety snapshot, then
    /// update them to `revision`.
    pub fn restore(
        &self,
        paths: &[PathBuf],
        revision: Option<i64>,
        task: &dyn TaskContext,
    ) -> Result<u64, Error> {
        self.commit(paths, true, None, RESTORE_COMMIT_DESCRIPTION, false)?;
        self.update(paths, revision, true, task)
    }

    /// The set of relative paths currently modified with respect to the
    /// latest snapshot.
    pub fn status(&self) -> Result<BTreeSet<String>, Error> {
        let walked = self.walk_directory(&[])?;
        Ok(self.filter_modified(&walked)?.into_iter().collect())
    }
}
