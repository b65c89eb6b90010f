use crate::layout::{check_segment, StoreLayout, STAGED_PREFIX};
use crate::{remove_dir_if_exists, remove_if_exists, write_atomic, StoreError};
use bridgekeeper_schema::BridgeTypeDescriptor;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Installed and staged descriptors of one bridge type.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TypeRecord {
    pub local: Option<BridgeTypeDescriptor>,
    pub pending: Option<BridgeTypeDescriptor>,
}

impl TypeRecord {
    pub fn is_empty(&self) -> bool {
        self.local.is_none() && self.pending.is_none()
    }

    /// Installed descriptor, or the staged one with its configuration withheld.
    pub fn effective(&self) -> Option<BridgeTypeDescriptor> {
        match (&self.local, &self.pending) {
            (Some(local), _) => Some(local.clone()),
            (None, Some(pending)) => Some(pending.without_configuration()),
            (None, None) => None,
        }
    }

    /// A staged update exists and advertises a different image than what is installed.
    pub fn update_available(&self) -> bool {
        match (&self.local, &self.pending) {
            (_, None) => false,
            (None, Some(_)) => true,
            (Some(local), Some(pending)) => pending.differs_from(local),
        }
    }
}

/// Per-type descriptor records under `bridge-types/<type>/`.
pub struct TypeStore {
    layout: StoreLayout,
}

impl TypeStore {
    pub fn new(layout: StoreLayout) -> Self {
        Self { layout }
    }

    pub fn layout(&self) -> &StoreLayout {
        &self.layout
    }

    /// Every type with a directory on disk, sorted.
    pub fn list(&self) -> Result<Vec<String>, StoreError> {
        let dir = self.layout.bridge_types_dir();
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut types = Vec::new();
        for entry in entries {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    types.push(name.to_owned());
                }
            }
        }
        types.sort();
        Ok(types)
    }

    pub fn exists(&self, type_id: &str) -> bool {
        self.layout.type_dir(type_id).is_dir()
    }

    pub fn load(&self, type_id: &str) -> Result<TypeRecord, StoreError> {
        check_segment(type_id)?;
        Ok(TypeRecord {
            local: read_descriptor(&self.layout.local_descriptor(type_id), type_id)?,
            pending: read_descriptor(&self.layout.pending_descriptor(type_id), type_id)?,
        })
    }

    pub fn read_local(&self, type_id: &str) -> Result<Option<BridgeTypeDescriptor>, StoreError> {
        check_segment(type_id)?;
        read_descriptor(&self.layout.local_descriptor(type_id), type_id)
    }

    pub fn read_pending(&self, type_id: &str) -> Result<Option<BridgeTypeDescriptor>, StoreError> {
        check_segment(type_id)?;
        read_descriptor(&self.layout.pending_descriptor(type_id), type_id)
    }

    pub fn write_local(
        &self,
        type_id: &str,
        descriptor: &BridgeTypeDescriptor,
    ) -> Result<(), StoreError> {
        check_segment(type_id)?;
        write_atomic(
            &self.layout.local_descriptor(type_id),
            &descriptor.to_vec_pretty()?,
        )
    }

    /// Stage a remote descriptor (and its icon bytes) as the pending update.
    pub fn stage(
        &self,
        type_id: &str,
        descriptor: &BridgeTypeDescriptor,
        icon: Option<&[u8]>,
    ) -> Result<(), StoreError> {
        check_segment(type_id)?;
        if let (Some(name), Some(bytes)) = (descriptor.icon.as_deref(), icon) {
            write_atomic(&self.staged_icon_path(type_id, name)?, bytes)?;
        }
        write_atomic(
            &self.layout.pending_descriptor(type_id),
            &descriptor.to_vec_pretty()?,
        )?;
        debug!("staged {type_id} version {:?}", descriptor.version);
        Ok(())
    }

    /// Drop the staged update and its icon. Returns whether anything was staged.
    pub fn drop_pending(&self, type_id: &str) -> Result<bool, StoreError> {
        let Some(pending) = self.read_pending(type_id)? else {
            return Ok(false);
        };
        if let Some(icon) = pending.icon.as_deref() {
            remove_if_exists(&self.staged_icon_path(type_id, icon)?)?;
        }
        remove_if_exists(&self.layout.pending_descriptor(type_id))?;
        Ok(true)
    }

    /// Make the staged update the installed record. The staged files are removed.
    pub fn promote(&self, type_id: &str) -> Result<BridgeTypeDescriptor, StoreError> {
        let pending = self.read_pending(type_id)?.ok_or_else(|| {
            StoreError::InvalidPath(self.layout.pending_descriptor(type_id).display().to_string())
        })?;
        if let Some(icon) = pending.icon.as_deref() {
            let staged = self.staged_icon_path(type_id, icon)?;
            let installed = self.icon_path(type_id, icon)?;
            match fs::rename(&staged, &installed) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    debug!("no staged icon for {type_id}");
                }
                Err(e) => warn!("failed to install icon for {type_id}: {e}"),
            }
        }
        self.write_local(type_id, &pending)?;
        remove_if_exists(&self.layout.pending_descriptor(type_id))?;
        Ok(pending)
    }

    /// Delete the installed record and its icon. A staged record is kept.
    pub fn remove_local(&self, type_id: &str) -> Result<(), StoreError> {
        let Some(local) = self.read_local(type_id)? else {
            return Ok(());
        };
        if let Some(icon) = local.icon.as_deref() {
            if let Err(e) = remove_if_exists(&self.icon_path(type_id, icon)?) {
                warn!("failed to remove icon for {type_id}: {e}");
            }
        }
        remove_if_exists(&self.layout.local_descriptor(type_id))?;
        Ok(())
    }

    /// Remove every artifact of the type.
    pub fn purge(&self, type_id: &str) -> Result<(), StoreError> {
        check_segment(type_id)?;
        remove_dir_if_exists(&self.layout.type_dir(type_id))?;
        Ok(())
    }

    pub fn icon_path(&self, type_id: &str, icon: &str) -> Result<PathBuf, StoreError> {
        check_segment(icon)?;
        Ok(self.layout.type_dir(type_id).join(icon))
    }

    pub fn staged_icon_path(&self, type_id: &str, icon: &str) -> Result<PathBuf, StoreError> {
        check_segment(icon)?;
        Ok(self
            .layout
            .type_dir(type_id)
            .join(format!("{STAGED_PREFIX}{icon}")))
    }
}

fn read_descriptor(
    path: &Path,
    type_id: &str,
) -> Result<Option<BridgeTypeDescriptor>, StoreError> {
    let data = match fs::read(path) {
        Ok(d) => d,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let mut descriptor = BridgeTypeDescriptor::from_slice(&data)?;
    if descriptor.type_id.is_empty() {
        type_id.clone_into(&mut descriptor.type_id);
    }
    Ok(Some(descriptor))
}
