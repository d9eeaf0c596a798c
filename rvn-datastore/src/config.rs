//! Repository configuration (`config.json`).

use std::path::Path;

use anyhow::{format_err, Error};
use serde::{Deserialize, Serialize};

use crate::chunker::Chunker;
use crate::error::RvnError;

/// Default block size: effectively "one blob per file".
pub const DEFAULT_BLOCK_SIZE: u64 = i64::MAX as u64;

/// Default database backup interval in minutes.
pub const DEFAULT_BACKUP_INTERVAL: u64 = 15;

/// Chunker selection as persisted in `config.json`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ChunkerSelector {
    #[serde(rename = "FixedSizeChunker")]
    FixedSize,
    #[serde(rename = "ContentDefinedChunker")]
    ContentDefined {
        #[serde(rename = "averageBits")]
        average_bits: u32,
    },
}

impl Default for ChunkerSelector {
    fn default() -> Self {
        ChunkerSelector::FixedSize
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RepositoryConfig {
    /// Block size in bytes for the fixed size chunker.
    pub block_size: u64,
    /// Database backup interval in minutes.
    pub backup_interval: u64,
    pub chunker: ChunkerSelector,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            backup_interval: DEFAULT_BACKUP_INTERVAL,
            chunker: ChunkerSelector::default(),
        }
    }
}

impl RepositoryConfig {
    /// Instantiate the configured chunking strategy.
    pub fn chunker(&self) -> Result<Chunker, Error> {
        match self.chunker {
            ChunkerSelector::FixedSize => Chunker::fixed_size(self.block_size),
            ChunkerSelector::ContentDefined { average_bits } => {
                Chunker::content_defined(average_bits)
            }
        }
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let data = std::fs::read(path.as_ref()).map_err(|err| {
            format_err!("unable to read config {:?} - {}", path.as_ref(), err)
        })?;
        serde_json::from_slice(&data).map_err(|err| {
            RvnError::InvalidRepository(format!(
                "malformed config {:?} - {}",
                path.as_ref(),
                err
            ))
            .into()
        })
    }

    pub fn store<P: AsRef<Path>>(&self, path: P) -> Result<(), Error> {
        let mut data = serde_json::to_vec_pretty(self)?;
        data.push(b'\n');
        rvn_tools::fs::replace_file(path, &data)
    }
}
