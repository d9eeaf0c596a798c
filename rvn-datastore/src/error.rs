//! Error taxonomy of the storage engine.
//!
//! Functions generally return `anyhow::Error`; the variants here are raised
//! for conditions callers are expected to distinguish, and can be recovered
//! with `err.downcast_ref::<RvnError>()`.

#[derive(Debug, thiserror::Error)]
pub enum RvnError {
    /// The repository version sentinel holds an unknown format id.
    #[error("unsupported repository format '{0}'")]
    IncompatibleRepository(String),

    /// The sentinel is fine but the configuration or database is unreadable.
    #[error("invalid repository - {0}")]
    InvalidRepository(String),

    /// No hidden metadata directory was found at or above the given path.
    #[error("'{0}' is not inside a work directory")]
    NotAWorkDirectory(String),

    /// Uniqueness violation, e.g. a second version for the same path within
    /// one snapshot.
    #[error("record already exists - {0}")]
    DuplicateRecord(String),

    /// Reconstructed data failed its checksum, or the database failed its
    /// integrity probe.
    #[error("data corrupt - {0}")]
    DataCorrupt(String),

    /// Malformed caller input (bad hex, unknown matcher type, zero block
    /// size, ...).
    #[error("invalid input - {0}")]
    InvalidInput(String),

    /// A queued task was cancelled before it ran.
    #[error("cancelled")]
    Cancelled,

    /// Invariant violation inside the engine.
    #[error("internal error - {0}")]
    Internal(String),
}
