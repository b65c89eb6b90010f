//! On-disk state for Bridgekeeper: bridge type records, per-instance
//! configuration directories and shared volumes. All writes are atomic.

pub mod envfile;
pub mod instances;
pub mod layout;
pub mod types;

pub use envfile::EnvFile;
pub use instances::InstanceStore;
pub use layout::{HostLayout, StoreLayout, STAGED_PREFIX};
pub use types::{TypeRecord, TypeStore};

use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;
use thiserror::Error;

/// Fsync a directory so a preceding `rename()` is durable.
pub(crate) fn fsync_dir(dir: &Path) -> Result<(), std::io::Error> {
    let f = std::fs::File::open(dir)?;
    f.sync_all()
}

/// Write `content` to `dest` through a temp file in the same directory.
pub(crate) fn write_atomic(dest: &Path, content: &[u8]) -> Result<(), StoreError> {
    let dir = dest
        .parent()
        .ok_or_else(|| StoreError::InvalidPath(dest.display().to_string()))?;
    std::fs::create_dir_all(dir)?;
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(content)?;
    tmp.as_file().sync_all()?;
    tmp.persist(dest).map_err(|e| StoreError::Io(e.error))?;
    fsync_dir(dir)?;
    Ok(())
}

/// Remove a file, treating "already gone" as success.
pub(crate) fn remove_if_exists(path: &Path) -> Result<bool, StoreError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Remove a directory tree, treating "already gone" as success.
pub(crate) fn remove_dir_if_exists(path: &Path) -> Result<bool, StoreError> {
    match std::fs::remove_dir_all(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("invalid descriptor: {0}")]
    Schema(#[from] bridgekeeper_schema::SchemaError),
    #[error("invalid path: {0}")]
    InvalidPath(String),
    #[error("invalid file name '{0}'")]
    InvalidName(String),
    #[error("malformed env file line {line}: {content}")]
    MalformedEnv { line: usize, content: String },
}
