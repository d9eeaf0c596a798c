//! Persisted watch list.
//!
//! A plain JSON array of absolute working directory roots the background
//! watcher should monitor. The store only owns the list and its change
//! events, not the monitoring itself.

use std::path::{Path, PathBuf};

use anyhow::Error;

/// Change notification produced by [`WatchListStore`] writers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WatchEvent {
    Added(PathBuf),
    Removed(PathBuf),
}

type Observer = Box<dyn Fn(&WatchEvent) + Send>;

pub struct WatchListStore {
    path: PathBuf,
    entries: Vec<PathBuf>,
    observers: Vec<Observer>,
}

impl WatchListStore {
    /// Open the watch list at `path`; a missing file yields an empty list.
    pub fn open<P: Into<PathBuf>>(path: P) -> Result<Self, Error> {
        let path = path.into();
        let entries = match std::fs::read(&path) {
            Ok(data) => serde_json::from_slice(&data)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(err) => return Err(err.into()),
        };

        Ok(Self {
            path,
            entries,
            observers: Vec::new(),
        })
    }

    pub fn paths(&self) -> &[PathBuf] {
        &self.entries
    }

    /// Register an observer for subsequent add/remove events.
    pub fn subscribe<F>(&mut self, observer: F)
    where
        F: Fn(&WatchEvent) + Send + 'static,
    {
        self.observers.push(Box::new(observer));
    }

    /// Add `path` to the list. Returns false (and fires no event) when it
    /// is already present.
    pub fn add(&mut self, path: PathBuf) -> Result<bool, Error> {
        if self.entries.contains(&path) {
            return Ok(false);
        }
        self.entries.push(path.clone());
        self.persist()?;
        self.notify(&WatchEvent::Added(path));
        Ok(true)
    }

    /// Remove `path` from the list. Returns false (and fires no event)
    /// when it was not present.
    pub fn remove(&mut self, path: &Path) -> Result<bool, Error> {
        let before = self.entries.len();
        self.entries.retain(|entry| entry != path);
        if self.entries.len() == before {
            return Ok(false);
        }
        self.persist()?;
        self.notify(&WatchEvent::Removed(path.to_path_buf()));
        Ok(true)
    }

    fn persist(&self) -> Result<(), Error> {
        let mut data = serde_json::to_vec_pretty(&self.entries)?;
        data.push(b'\n');
        rvn_tools::fs::replace_file(&self.path, &data)
    }

    fn notify(&self, event: &WatchEvent) {
        for observer in &self.observers {
            observer(event);
        }
    }
}
