use crate::bus::{EntityDirectory, EntityKind, MemoryDirectory};
use crate::concurrency::ProcessLock;
use crate::config::{CoreConfig, RuntimeContext};
use crate::credentials::{CredentialService, MemoryCredentials};
use crate::instances::{BridgeInstanceManager, InstanceDeps};
use crate::materialize::Materializer;
use crate::poller::CatalogPoller;
use crate::registry::{BridgeTypeRegistry, RegistryDeps, TypeMembers};
use crate::CoreError;
use bridgekeeper_remote::{CatalogClient, HttpCatalog};
use bridgekeeper_runtime::{select_runtime, ContainerRuntime};
use bridgekeeper_schema::{ConfigValidator, RuleValidator};
use bridgekeeper_store::{HostLayout, InstanceStore, StoreLayout, TypeStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const MIN_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// The collaborators a [`Core`] runs against.
pub struct CoreParts {
    pub runtime: Arc<dyn ContainerRuntime>,
    pub directory: Arc<dyn EntityDirectory>,
    pub credentials: Arc<dyn CredentialService>,
    pub catalog: Option<Arc<dyn CatalogClient>>,
    pub validator: Arc<dyn ConfigValidator>,
}

impl CoreParts {
    /// The configured runtime backend and catalog, with the in-memory
    /// directory and credential service.
    pub fn from_config(config: &CoreConfig) -> Result<Self, CoreError> {
        let runtime = select_runtime(&config.runtime.backend)?;
        let catalog = config
            .catalog
            .clone()
            .map(|c| Arc::new(HttpCatalog::new(c)) as Arc<dyn CatalogClient>);
        Ok(Self {
            runtime,
            directory: Arc::new(MemoryDirectory::new()),
            credentials: Arc::new(MemoryCredentials::new()),
            catalog,
            validator: Arc::new(RuleValidator),
        })
    }
}

/// A running core: both managers wired together, their bus dispatchers, the
/// catalog poller and the leftover cleanup timer.
pub struct Core {
    config: CoreConfig,
    layout: StoreLayout,
    directory: Arc<dyn EntityDirectory>,
    registry: Arc<BridgeTypeRegistry>,
    instances: Arc<BridgeInstanceManager>,
    shutdown: watch::Sender<bool>,
    dispatchers: Vec<JoinHandle<()>>,
    poller: Option<JoinHandle<()>>,
    cleanup: JoinHandle<usize>,
    _lock: ProcessLock,
}

impl Core {
    pub async fn start(config: CoreConfig, parts: CoreParts) -> Result<Self, CoreError> {
        let layout = StoreLayout::new(&config.paths.data_dir);
        layout.initialize()?;
        let lock_path = layout.lock_file();
        let lock = ProcessLock::try_acquire(&lock_path)?.ok_or_else(|| {
            CoreError::Config(format!(
                "{} is held by another core process",
                lock_path.display()
            ))
        })?;
        info!("starting core in {}", layout.root().display());

        let context = RuntimeContext::resolve(Arc::clone(&parts.runtime), &config.runtime).await;
        info!(
            "runtime {}: network {}, project {}",
            parts.runtime.name(),
            context.default_network,
            context.compose_project
        );

        let registry = BridgeTypeRegistry::new(RegistryDeps {
            store: TypeStore::new(layout.clone()),
            runtime: Arc::clone(&parts.runtime),
            catalog: parts.catalog.clone(),
            directory: Arc::clone(&parts.directory),
            channel_tag: config.runtime.channel_tag.clone(),
            auth: config.registry.clone(),
        });
        let materializer = Materializer::new(
            Arc::new(InstanceStore::new(layout.clone())),
            Arc::clone(&parts.credentials),
            config.broker.uri.clone(),
            config.broker.host_uri.clone(),
        );
        let instances = BridgeInstanceManager::new(InstanceDeps {
            context,
            host: HostLayout::new(config.host_dir()),
            registry: Arc::clone(&registry),
            materializer,
            credentials: parts.credentials,
            directory: Arc::clone(&parts.directory),
            validator: parts.validator,
            orphan_grace: config.orphan_grace(),
        });
        let members: Arc<dyn TypeMembers> = instances.clone();
        registry.bind_members(Arc::downgrade(&members));

        // Subscribed before the first publications so nothing is missed.
        let type_events = parts.directory.subscribe(EntityKind::BridgeType);
        let bridge_events = parts.directory.subscribe(EntityKind::Bridge);

        let types = registry.first_sync().await?;
        debug!("{types} bridge types on disk");
        registry.republish().await?;
        if let Err(e) = registry.poll_catalog().await {
            warn!("initial catalog poll failed: {e}");
        }

        let dispatchers = vec![
            Arc::clone(&registry).run(type_events),
            Arc::clone(&instances).run(bridge_events),
        ];
        let (shutdown, shutdown_rx) = watch::channel(false);
        let poller = config.catalog.as_ref().map(|catalog| {
            let interval = Duration::from_secs(catalog.poll_interval_secs).max(MIN_POLL_INTERVAL);
            CatalogPoller::new(Arc::clone(&registry), interval).spawn(shutdown_rx)
        });

        instances.startup().await?;
        let cleanup = instances.schedule_cleanup();
        info!("core started");

        Ok(Self {
            config,
            layout,
            directory: parts.directory,
            registry,
            instances,
            shutdown,
            dispatchers,
            poller,
            cleanup,
            _lock: lock,
        })
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn layout(&self) -> &StoreLayout {
        &self.layout
    }

    pub fn directory(&self) -> &Arc<dyn EntityDirectory> {
        &self.directory
    }

    pub fn registry(&self) -> &Arc<BridgeTypeRegistry> {
        &self.registry
    }

    pub fn instances(&self) -> &Arc<BridgeInstanceManager> {
        &self.instances
    }

    /// Stop the background loops. Containers are left as they are.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Some(poller) = self.poller {
            if let Err(e) = poller.await {
                warn!("catalog poller ended abnormally: {e}");
            }
        }
        for dispatcher in self.dispatchers {
            dispatcher.abort();
        }
        self.cleanup.abort();
        info!("core stopped");
    }
}
