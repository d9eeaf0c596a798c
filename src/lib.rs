//! Reversion: a file version history engine.
//!
//! Regular files in tracked working directories are chunked into content
//! addressed blobs, deduplicated, and recorded as snapshot versions in a
//! transactional manifest. Historical revisions can be checked out,
//! mounted read-only, pruned by retention policies, and repaired from
//! their own backups.
//!
//! This crate is a facade over the workspace members:
//!
//! * [`datastore`] — the storage engine (blobs, chunkers, repository,
//!   timelines, snapshots, versions, cleanup policies, verification)
//! * [`client`] — working directories, ignore matchers, the watch list
//! * [`fuse`] — read-only snapshot mounts
//! * [`tools`] — shared helpers (atomic file replacement, the task actor)

pub use rvn_client as client;
pub use rvn_datastore as datastore;
pub use rvn_fuse as fuse;
pub use rvn_tools as tools;
