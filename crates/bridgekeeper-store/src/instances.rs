use crate::envfile::EnvFile;
use crate::layout::{check_segment, StoreLayout, ENV_FILE};
use crate::{remove_dir_if_exists, remove_if_exists, write_atomic, StoreError};
use std::fs;
use std::path::PathBuf;
use tracing::debug;

/// Materialized configuration of bridge instances, one directory per
/// container name under `system/bridges/`.
pub struct InstanceStore {
    layout: StoreLayout,
}

impl InstanceStore {
    pub fn new(layout: StoreLayout) -> Self {
        Self { layout }
    }

    pub fn layout(&self) -> &StoreLayout {
        &self.layout
    }

    /// Names of every instance directory on disk, sorted.
    pub fn list_dirs(&self) -> Result<Vec<String>, StoreError> {
        let entries = match fs::read_dir(self.layout.bridges_dir()) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    names.push(name.to_owned());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    pub fn dir(&self, container: &str) -> Result<PathBuf, StoreError> {
        check_segment(container)?;
        Ok(self.layout.instance_dir(container))
    }

    pub fn ensure_dir(&self, container: &str) -> Result<PathBuf, StoreError> {
        let dir = self.dir(container)?;
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// `Ok(None)` when the env file does not exist.
    pub fn read_env(&self, container: &str) -> Result<Option<EnvFile>, StoreError> {
        let path = self.dir(container)?.join(ENV_FILE);
        match fs::read_to_string(&path) {
            Ok(content) => EnvFile::parse(&content).map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn write_env(&self, container: &str, env: &EnvFile) -> Result<(), StoreError> {
        let path = self.dir(container)?.join(ENV_FILE);
        write_atomic(&path, env.render().as_bytes())
    }

    pub fn field_path(&self, container: &str, name: &str, ext: &str) -> Result<PathBuf, StoreError> {
        let file = format!("{name}.{ext}");
        check_segment(&file)?;
        Ok(self.dir(container)?.join(file))
    }

    pub fn write_field(
        &self,
        container: &str,
        name: &str,
        ext: &str,
        content: &[u8],
    ) -> Result<(), StoreError> {
        write_atomic(&self.field_path(container, name, ext)?, content)
    }

    /// `Ok(None)` when the field file does not exist.
    pub fn read_field(
        &self,
        container: &str,
        name: &str,
        ext: &str,
    ) -> Result<Option<Vec<u8>>, StoreError> {
        match fs::read(self.field_path(container, name, ext)?) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn remove_field(&self, container: &str, name: &str, ext: &str) -> Result<bool, StoreError> {
        remove_if_exists(&self.field_path(container, name, ext)?)
    }

    pub fn remove_dir(&self, container: &str) -> Result<bool, StoreError> {
        let removed = remove_dir_if_exists(&self.dir(container)?)?;
        if removed {
            debug!("removed config dir {container}");
        }
        Ok(removed)
    }

    /// Empty a shared volume directory, keeping the directory itself.
    pub fn clear_shared(&self, name: &str) -> Result<(), StoreError> {
        check_segment(name)?;
        let dir = self.layout.shared_dir().join(name);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                remove_dir_if_exists(&entry.path())?;
            } else {
                remove_if_exists(&entry.path())?;
            }
        }
        Ok(())
    }
}
