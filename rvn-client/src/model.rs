//! Serialized access to a working directory.
//!
//! Front ends (viewer, watcher) issue commits, updates and status queries
//! from several places at once; the model funnels them through a single
//! threaded actor so coarse operations run in submission order against
//! the one live [`WorkDirectory`] instance.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

use rvn_datastore::Snapshot;
use rvn_tools::actor::{Actor, ActorEvent, TaskHandle};
use rvn_tools::task::ForegroundTask;

use crate::workdir::WorkDirectory;

/// One queue of coarse operations against one working directory.
pub struct WorkDirectoryModel {
    workdir: Arc<WorkDirectory>,
    actor: Actor<PathBuf>,
}

impl WorkDirectoryModel {
    pub fn new(workdir: Arc<WorkDirectory>) -> Self {
        Self {
            workdir,
            actor: Actor::new(),
        }
    }

    pub fn workdir(&self) -> &Arc<WorkDirectory> {
        &self.workdir
    }

    /// Observe queue activity (keys are the working directory root).
    pub fn subscribe<F>(&self, handler: F)
    where
        F: Fn(&ActorEvent<PathBuf>) + Send + 'static,
    {
        self.actor.subscribe(handler);
    }

    fn key(&self) -> PathBuf {
        self.workdir.root().to_path_buf()
    }

    /// Queue a commit of `paths`.
    pub fn commit(
        &self,
        paths: Vec<PathBuf>,
        force: bool,
        name: Option<String>,
        description: String,
        pinned: bool,
    ) -> TaskHandle<Option<Snapshot>> {
        let workdir = Arc::clone(&self.workdir);
        self.actor.send(self.key(), move || {
            workdir.commit(&paths, force, name, &description, pinned)
        })
    }

    /// Queue an update of `paths` to `revision`.
    pub fn update(
        &self,
        paths: Vec<PathBuf>,
        revision: Option<i64>,
        overwrite: bool,
    ) -> TaskHandle<u64> {
        let workdir = Arc::clone(&self.workdir);
        self.actor.send(self.key(), move || {
            workdir.update(&paths, revision, overwrite, &ForegroundTask)
        })
    }

    /// Queue a restore of `paths` to `revision` (safety commit included).
    pub fn restore(&self, paths: Vec<PathBuf>, revision: Option<i64>) -> TaskHandle<u64> {
        let workdir = Arc::clone(&self.workdir);
        self.actor.send(self.key(), move || {
            workdir.restore(&paths, revision, &ForegroundTask)
        })
    }

    /// Queue a status query.
    pub fn status(&self) -> TaskHandle<BTreeSet<String>> {
        let workdir = Arc::clone(&self.workdir);
        self.actor.send(self.key(), move || workdir.status())
    }

    /// Queue a cleanup pass over the timeline.
    pub fn clean_up(&self) -> TaskHandle<u64> {
        let workdir = Arc::clone(&self.workdir);
        self.actor
            .send(self.key(), move || workdir.timeline()?.clean_up(&ForegroundTask))
    }

    /// Wait for every queued operation to finish.
    pub fn flush(&self) {
        self.actor.flush();
    }
}
