use crate::StoreError;
use std::fs;
use std::path::{Path, PathBuf};

pub const LOCAL_DESCRIPTOR: &str = "local.configuration.json";
pub const PENDING_DESCRIPTOR: &str = "update.configuration.json";
pub const STAGED_PREFIX: &str = "update.";
pub const ENV_FILE: &str = ".env";

/// Directory layout of the core's data directory.
///
/// ```text
/// <root>/
///   .lock
///   bridge-types/<type>/{local,update}.configuration.json, <icon>, update.<icon>
///   system/bridges/<container-name>/.env, <field>.json, <field>.js
///   system/shared/<name>/
/// ```
///
/// The `system/` part mirrors the host-visible directory, so bind sources built
/// by [`HostLayout`] point at the same files.
#[derive(Debug, Clone)]
pub struct StoreLayout {
    root: PathBuf,
}

impl StoreLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[inline]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[inline]
    pub fn bridge_types_dir(&self) -> PathBuf {
        self.root.join("bridge-types")
    }

    #[inline]
    pub fn type_dir(&self, type_id: &str) -> PathBuf {
        self.bridge_types_dir().join(type_id)
    }

    #[inline]
    pub fn local_descriptor(&self, type_id: &str) -> PathBuf {
        self.type_dir(type_id).join(LOCAL_DESCRIPTOR)
    }

    #[inline]
    pub fn pending_descriptor(&self, type_id: &str) -> PathBuf {
        self.type_dir(type_id).join(PENDING_DESCRIPTOR)
    }

    #[inline]
    pub fn bridges_dir(&self) -> PathBuf {
        self.root.join("system").join("bridges")
    }

    #[inline]
    pub fn instance_dir(&self, container_name: &str) -> PathBuf {
        self.bridges_dir().join(container_name)
    }

    #[inline]
    pub fn shared_dir(&self) -> PathBuf {
        self.root.join("system").join("shared")
    }

    #[inline]
    pub fn lock_file(&self) -> PathBuf {
        self.root.join(".lock")
    }

    pub fn initialize(&self) -> Result<(), StoreError> {
        fs::create_dir_all(self.bridge_types_dir())?;
        fs::create_dir_all(self.bridges_dir())?;
        fs::create_dir_all(self.shared_dir())?;
        Ok(())
    }
}

/// The same directory as seen by the container runtime's host.
///
/// The core usually runs inside a container itself, so bind sources handed to
/// the runtime must be host paths, not paths inside the core's filesystem.
#[derive(Debug, Clone)]
pub struct HostLayout {
    root: PathBuf,
}

impl HostLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[inline]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[inline]
    pub fn instance_dir(&self, container_name: &str) -> PathBuf {
        self.root.join("system").join("bridges").join(container_name)
    }

    #[inline]
    pub fn shared_dir(&self, name: &str) -> PathBuf {
        self.root.join("system").join("shared").join(name)
    }

    /// Resolve a `./relative` path against the host root.
    pub fn relative(&self, path: &str) -> PathBuf {
        self.root.join(path.strip_prefix("./").unwrap_or(path))
    }
}

/// Reject names that would escape their parent directory.
pub fn check_segment(name: &str) -> Result<(), StoreError> {
    if name.is_empty()
        || name == "."
        || name == ".."
        || name.contains('/')
        || name.contains('\\')
        || name.contains('\0')
    {
        return Err(StoreError::InvalidName(name.to_owned()));
    }
    Ok(())
}
