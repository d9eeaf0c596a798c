//! Common tooling for the reversion workspace.
//!
//! Everything here is intentionally free of storage-engine types so that all
//! member crates can depend on it.

pub mod actor;
pub mod fs;
pub mod task;

/// Milliseconds since the unix epoch.
pub fn epoch_millis() -> i64 {
    match std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH) {
        Ok(duration) => duration.as_millis() as i64,
        Err(err) => -(err.duration().as_millis() as i64),
    }
}
