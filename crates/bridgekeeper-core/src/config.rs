use crate::CoreError;
use bridgekeeper_remote::CatalogConfig;
use bridgekeeper_runtime::{ContainerRuntime, LogConfig, RegistryAuth};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub const DEFAULT_CHANNEL_TAG: &str = "market";
pub const DEFAULT_ORPHAN_GRACE_SECS: u64 = 600;
const FALLBACK_NETWORK: &str = "bridge";
const FALLBACK_PROJECT: &str = "bridgekeeper";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Data directory as seen by this process.
    pub data_dir: PathBuf,
    /// The same directory as seen by the container runtime's host. Defaults to
    /// `data_dir`.
    pub host_dir: Option<PathBuf>,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/lib/bridgekeeper"),
            host_dir: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// `docker` or `mock`.
    pub backend: String,
    /// Stable local tag installed images are retagged to.
    pub channel_tag: String,
    pub default_network: Option<String>,
    pub compose_project: Option<String>,
    /// Name of the container this core runs in, used to discover the network
    /// and compose project when they are not configured.
    pub self_container: String,
    /// Reverse proxy reloaded by the `reloadNginx` stream event.
    pub proxy_container: String,
    pub timezone: String,
    pub log_max_file: u32,
    pub log_max_size: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            backend: "docker".to_owned(),
            channel_tag: DEFAULT_CHANNEL_TAG.to_owned(),
            default_network: None,
            compose_project: None,
            self_container: "bridgekeeper-core".to_owned(),
            proxy_container: "bridgekeeper-proxy".to_owned(),
            timezone: "UTC".to_owned(),
            log_max_file: 5,
            log_max_size: "20m".to_owned(),
        }
    }
}

impl RuntimeConfig {
    pub fn log_config(&self) -> LogConfig {
        let mut log = LogConfig::default();
        log.options
            .insert("max-file".to_owned(), self.log_max_file.to_string());
        log.options
            .insert("max-size".to_owned(), self.log_max_size.clone());
        log
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub uri: String,
    /// Used by bridges that run with host networking.
    pub host_uri: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            uri: "mqtt://mqtt:1883".to_owned(),
            host_uri: "mqtt://localhost:1883".to_owned(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub paths: PathsConfig,
    pub runtime: RuntimeConfig,
    pub broker: BrokerConfig,
    /// No catalog polling when absent.
    pub catalog: Option<CatalogConfig>,
    pub registry: Option<RegistryAuth>,
    pub orphan_grace_secs: u64,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            paths: PathsConfig::default(),
            runtime: RuntimeConfig::default(),
            broker: BrokerConfig::default(),
            catalog: None,
            registry: None,
            orphan_grace_secs: DEFAULT_ORPHAN_GRACE_SECS,
        }
    }
}

impl CoreConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, CoreError> {
        let mut config: Self =
            toml::from_str(content).map_err(|e| CoreError::Config(e.to_string()))?;
        if let Some(catalog) = config.catalog.take() {
            config.catalog = Some(normalize_catalog(&catalog));
        }
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, CoreError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Load `path` if given, else defaults, then apply the process environment.
    pub fn load_with_env(path: Option<&Path>) -> Result<Self, CoreError> {
        let mut config = match path {
            Some(p) => Self::load(p)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Override settings from environment variables, read through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), CoreError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.is_empty());

        if let Some(v) = get("BRIDGEKEEPER_DATA_DIR") {
            self.paths.data_dir = PathBuf::from(v);
        }
        if let Some(v) = get("BRIDGEKEEPER_HOST_DIR") {
            self.paths.host_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = get("BRIDGES_TAG") {
            self.runtime.channel_tag = v;
        }
        if let Some(v) = get("MQTT_URI") {
            self.broker.uri = v;
        }
        if let Some(v) = get("TZ") {
            self.runtime.timezone = v;
        }
        if let Some(url) = get("BRIDGEKEEPER_CATALOG_URL") {
            let mut catalog = CatalogConfig::new(&url);
            if let Some(existing) = &self.catalog {
                catalog.descriptor_file.clone_from(&existing.descriptor_file);
                catalog.poll_interval_secs = existing.poll_interval_secs;
                catalog.auth_token.clone_from(&existing.auth_token);
            }
            self.catalog = Some(catalog);
        }
        if let Some(v) = get("BRIDGEKEEPER_CATALOG_INTERVAL_SECS") {
            let secs = v.parse::<u64>().map_err(|e| {
                CoreError::Config(format!("BRIDGEKEEPER_CATALOG_INTERVAL_SECS: {e}"))
            })?;
            if let Some(catalog) = self.catalog.as_mut() {
                catalog.poll_interval_secs = secs;
            }
        }
        if let (Some(username), Some(password)) = (
            get("BRIDGEKEEPER_REGISTRY_USER"),
            get("BRIDGEKEEPER_REGISTRY_PASS"),
        ) {
            self.registry = Some(RegistryAuth { username, password });
        }
        Ok(())
    }

    pub fn host_dir(&self) -> &Path {
        self.paths
            .host_dir
            .as_deref()
            .unwrap_or(&self.paths.data_dir)
    }

    pub fn orphan_grace(&self) -> Duration {
        Duration::from_secs(self.orphan_grace_secs)
    }
}

fn normalize_catalog(catalog: &CatalogConfig) -> CatalogConfig {
    let mut normalized = CatalogConfig::new(&catalog.url);
    normalized
        .descriptor_file
        .clone_from(&catalog.descriptor_file);
    normalized.poll_interval_secs = catalog.poll_interval_secs;
    normalized.auth_token.clone_from(&catalog.auth_token);
    normalized
}

/// Runtime handle plus the facts about it resolved at startup.
#[derive(Clone)]
pub struct RuntimeContext {
    pub runtime: Arc<dyn ContainerRuntime>,
    pub default_network: String,
    pub compose_project: String,
    pub proxy_container: String,
    pub timezone: String,
    pub channel_tag: String,
    pub log: LogConfig,
}

impl RuntimeContext {
    /// Fill in whatever `config` leaves unset from the core's own container.
    pub async fn resolve(
        runtime: Arc<dyn ContainerRuntime>,
        config: &RuntimeConfig,
    ) -> Self {
        let (mut network, mut project) =
            (config.default_network.clone(), config.compose_project.clone());

        if network.is_none() || project.is_none() {
            match runtime.inspect_container(&config.self_container).await {
                Ok(info) => {
                    debug!("discovered runtime context from {}", config.self_container);
                    if network.is_none() {
                        network = info.networks.first().cloned();
                    }
                    if project.is_none() {
                        project = info.labels.get("com.docker.compose.project").cloned();
                    }
                }
                Err(e) => warn!(
                    "cannot inspect own container {}: {e}; using defaults",
                    config.self_container
                ),
            }
        }

        Self {
            runtime,
            default_network: network.unwrap_or_else(|| FALLBACK_NETWORK.to_owned()),
            compose_project: project.unwrap_or_else(|| FALLBACK_PROJECT.to_owned()),
            proxy_container: config.proxy_container.clone(),
            timezone: config.timezone.clone(),
            channel_tag: config.channel_tag.clone(),
            log: config.log_config(),
        }
    }
}
