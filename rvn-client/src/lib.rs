//! Working directory client.
//!
//! Maps user directories to timelines of their private repositories:
//! walking, ignore matching, commit/update/restore/status, and the watch
//! list consumed by the background watcher.

pub mod ignore;
pub mod model;
pub mod watch;
pub mod workdir;

pub use ignore::{CompiledMatcher, IgnoreMatcher};
pub use model::WorkDirectoryModel;
pub use watch::{WatchEvent, WatchListStore};
pub use workdir::{WorkDirCache, WorkDirectory, METADATA_DIR};
