use crate::{CatalogClient, RemoteError};
use async_trait::async_trait;
use bridgekeeper_schema::BridgeTypeDescriptor;
use std::collections::BTreeMap;
use std::sync::Mutex;

#[derive(Default)]
struct Entry {
    descriptor: Option<BridgeTypeDescriptor>,
    files: BTreeMap<String, Vec<u8>>,
}

#[derive(Default)]
struct State {
    types: BTreeMap<String, Entry>,
    unreachable: bool,
    requests: usize,
}

/// In-memory catalog, used by tests and for offline setups.
#[derive(Default)]
pub struct StaticCatalog {
    state: Mutex<State>,
}

impl StaticCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Publishes or replaces a type descriptor.
    pub fn publish(&self, descriptor: BridgeTypeDescriptor) {
        let mut state = self.lock();
        let entry = state.types.entry(descriptor.type_id.clone()).or_default();
        entry.descriptor = Some(descriptor);
    }

    pub fn publish_file(&self, type_id: &str, file: &str, data: &[u8]) {
        let mut state = self.lock();
        state
            .types
            .entry(type_id.to_owned())
            .or_default()
            .files
            .insert(file.to_owned(), data.to_vec());
    }

    pub fn withdraw(&self, type_id: &str) -> bool {
        self.lock().types.remove(type_id).is_some()
    }

    /// While set, every request fails like a dropped connection.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.lock().unreachable = unreachable;
    }

    pub fn request_count(&self) -> usize {
        self.lock().requests
    }

    fn begin(&self) -> Result<std::sync::MutexGuard<'_, State>, RemoteError> {
        let mut state = self.lock();
        state.requests += 1;
        if state.unreachable {
            return Err(RemoteError::Http("connection refused".to_owned()));
        }
        Ok(state)
    }
}

#[async_trait]
impl CatalogClient for StaticCatalog {
    async fn list_types(&self) -> Result<Vec<String>, RemoteError> {
        let state = self.begin()?;
        Ok(state
            .types
            .iter()
            .filter(|(_, e)| e.descriptor.is_some())
            .map(|(k, _)| k.clone())
            .collect())
    }

    async fn type_descriptor(&self, type_id: &str) -> Result<BridgeTypeDescriptor, RemoteError> {
        let state = self.begin()?;
        state
            .types
            .get(type_id)
            .and_then(|e| e.descriptor.clone())
            .ok_or_else(|| RemoteError::NotFound(type_id.to_owned()))
    }

    async fn type_file(&self, type_id: &str, file: &str) -> Result<Vec<u8>, RemoteError> {
        let state = self.begin()?;
        state
            .types
            .get(type_id)
            .and_then(|e| e.files.get(file).cloned())
            .ok_or_else(|| RemoteError::NotFound(format!("{type_id}/{file}")))
    }
}
