use crate::RemoteError;
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const DEFAULT_DESCRIPTOR_FILE: &str = "bridge.configuration.json";
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 8 * 60 * 60;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogConfig {
    /// Base URL of the catalog directory, always with a trailing `/`.
    pub url: String,
    #[serde(default = "default_descriptor_file")]
    pub descriptor_file: String,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    #[serde(default)]
    pub auth_token: Option<String>,
}

fn default_descriptor_file() -> String {
    DEFAULT_DESCRIPTOR_FILE.to_owned()
}

fn default_poll_interval() -> u64 {
    DEFAULT_POLL_INTERVAL_SECS
}

impl CatalogConfig {
    pub fn new(url: &str) -> Self {
        Self {
            url: normalize_url(url),
            descriptor_file: default_descriptor_file(),
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
            auth_token: None,
        }
    }

    #[must_use]
    pub fn with_token(mut self, token: &str) -> Self {
        self.auth_token = Some(token.to_owned());
        self
    }

    #[must_use]
    pub fn with_descriptor_file(mut self, file: &str) -> Self {
        file.clone_into(&mut self.descriptor_file);
        self
    }

    pub fn load(path: &Path) -> Result<Self, RemoteError> {
        let content = std::fs::read_to_string(path)?;
        let mut config: Self = serde_json::from_str(&content)
            .map_err(|e| RemoteError::Config(format!("invalid catalog config: {e}")))?;
        config.url = normalize_url(&config.url);
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), RemoteError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| RemoteError::Serialization(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn type_url(&self, type_id: &str) -> String {
        format!("{}{type_id}/", self.url)
    }

    pub fn file_url(&self, type_id: &str, file: &str) -> String {
        format!("{}{file}", self.type_url(type_id))
    }

    pub fn descriptor_url(&self, type_id: &str) -> String {
        self.file_url(type_id, &self.descriptor_file)
    }
}

fn normalize_url(url: &str) -> String {
    format!("{}/", url.trim_end_matches('/'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.json");

        let config = CatalogConfig::new("https://catalog.example.com/releases/bridge_types")
            .with_token("secret123");
        config.save(&path).unwrap();

        let loaded = CatalogConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
        assert_eq!(loaded.auth_token.as_deref(), Some("secret123"));
    }

    #[test]
    fn load_applies_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.json");
        std::fs::write(&path, r#"{"url": "http://c/types"}"#).unwrap();
        let loaded = CatalogConfig::load(&path).unwrap();
        assert_eq!(loaded.url, "http://c/types/");
        assert_eq!(loaded.descriptor_file, DEFAULT_DESCRIPTOR_FILE);
        assert_eq!(loaded.poll_interval_secs, DEFAULT_POLL_INTERVAL_SECS);
    }

    #[test]
    fn urls_are_built_under_base() {
        let config = CatalogConfig::new("http://c/types/").with_descriptor_file("type.json");
        assert_eq!(config.type_url("zigbee"), "http://c/types/zigbee/");
        assert_eq!(config.descriptor_url("zigbee"), "http://c/types/zigbee/type.json");
        assert_eq!(config.file_url("zigbee", "icon.svg"), "http://c/types/zigbee/icon.svg");
    }
}
