use crate::bus::{
    report_entity_error, report_error, BusError, EntityDirectory, EntityEvent, EntityKind, Fields,
    RoutingTable,
};
use crate::concurrency::SingleFlight;
use crate::container::local_image;
use crate::lock::{LockGuard, ResourceLock};
use crate::{CoreError, ErrorCode, ErrorPayload};
use async_trait::async_trait;
use bridgekeeper_remote::{CatalogClient, RemoteError};
use bridgekeeper_runtime::{ContainerRuntime, RegistryAuth};
use bridgekeeper_schema::{BridgeTypeDescriptor, ImageReference};
use bridgekeeper_store::{TypeRecord, TypeStore, STAGED_PREFIX};
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const KIND: EntityKind = EntityKind::BridgeType;
const ICON_ROOT: &str = "resources/bridge-types";
const BUSY: &str = "BridgeType is processing now, wait for the end of operation.";
const STOP_FIRST: &str = "You have to stop all running bridges before removing the image.";
const REQUEST_ERROR: &str = "Request error. Please try again later";
const NOT_PERMITTED: &str = "operation is not permitted";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeStatus {
    Pulled,
    Removed,
    Pulling,
    Removing,
}

impl TypeStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TypeStatus::Pulled => "pulled",
            TypeStatus::Removed => "removed",
            TypeStatus::Pulling => "pulling",
            TypeStatus::Removing => "removing",
        }
    }
}

/// The instances of a type, as seen by type-level operations.
///
/// Implemented by the instance manager. The `*_locked` methods expect the
/// caller to hold the guard returned by [`TypeMembers::lock_type`].
#[async_trait]
pub trait TypeMembers: Send + Sync {
    /// Exclude every instance operation on members of `type_id`.
    async fn lock_type(&self, type_id: &str) -> LockGuard;

    /// Whether any instance of the type wants to be running.
    async fn has_started_members(&self, type_id: &str) -> Result<bool, CoreError>;

    /// Tear down the containers of every member. Desired status is kept.
    async fn stop_type_locked(&self, type_id: &str);

    /// Reconcile every member against its desired status.
    async fn start_type_locked(&self, type_id: &str);

    /// Tear down and reconcile every member, so each one comes back on the
    /// current image.
    async fn restart_type_locked(&self, type_id: &str) {
        self.stop_type_locked(type_id).await;
        self.start_type_locked(type_id).await;
    }
}

pub struct RegistryDeps {
    pub store: TypeStore,
    pub runtime: Arc<dyn ContainerRuntime>,
    pub catalog: Option<Arc<dyn CatalogClient>>,
    pub directory: Arc<dyn EntityDirectory>,
    /// Tag given to images whose registry reference carries none.
    pub channel_tag: String,
    pub auth: Option<RegistryAuth>,
}

pub struct BridgeTypeRegistry {
    store: TypeStore,
    runtime: Arc<dyn ContainerRuntime>,
    catalog: Option<Arc<dyn CatalogClient>>,
    directory: Arc<dyn EntityDirectory>,
    locks: ResourceLock,
    members: Mutex<Option<Weak<dyn TypeMembers>>>,
    channel_tag: String,
    auth: Option<RegistryAuth>,
    first_sync_flight: SingleFlight,
    poll_flight: SingleFlight,
    routes: RoutingTable,
}

impl BridgeTypeRegistry {
    pub fn new(deps: RegistryDeps) -> Arc<Self> {
        Arc::new(Self {
            store: deps.store,
            runtime: deps.runtime,
            catalog: deps.catalog,
            directory: deps.directory,
            locks: ResourceLock::new(),
            members: Mutex::new(None),
            channel_tag: deps.channel_tag,
            auth: deps.auth,
            first_sync_flight: SingleFlight::new(),
            poll_flight: SingleFlight::new(),
            routes: RoutingTable::new(),
        })
    }

    /// Register the instance manager. Held weakly; the manager owns the registry.
    pub fn bind_members(&self, members: Weak<dyn TypeMembers>) {
        *self
            .members
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(members);
    }

    fn members(&self) -> Option<Arc<dyn TypeMembers>> {
        self.members
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .as_ref()
            .and_then(Weak::upgrade)
    }

    pub fn locks(&self) -> &ResourceLock {
        &self.locks
    }

    pub fn store(&self) -> &TypeStore {
        &self.store
    }

    pub fn has_catalog(&self) -> bool {
        self.catalog.is_some()
    }

    pub fn is_routed(&self, type_id: &str) -> bool {
        self.routes.is_attached(type_id)
    }

    pub fn list_types(&self) -> Result<Vec<String>, CoreError> {
        Ok(self.store.list()?)
    }

    pub fn record(&self, type_id: &str) -> Result<TypeRecord, CoreError> {
        Ok(self.store.load(type_id)?)
    }

    /// The installed descriptor, the one instances are built from.
    pub fn installed_descriptor(
        &self,
        type_id: &str,
    ) -> Result<Option<BridgeTypeDescriptor>, CoreError> {
        Ok(self.store.read_local(type_id)?)
    }

    /// Installed or staged descriptor, whichever exists. Enough to derive
    /// container names when the type is not installed.
    pub fn naming_descriptor(&self, type_id: &str) -> Option<BridgeTypeDescriptor> {
        let record = self.store.load(type_id).ok()?;
        record.local.or(record.pending)
    }

    /// The image reference containers of `descriptor` run.
    pub fn image_for(&self, descriptor: &BridgeTypeDescriptor) -> Result<String, CoreError> {
        local_image(&descriptor.registry, &self.channel_tag)
    }

    async fn image_present(&self, descriptor: &BridgeTypeDescriptor) -> Result<bool, CoreError> {
        let image = self.image_for(descriptor)?;
        Ok(self.runtime.image_exists(&image).await?)
    }

    /// Installed record exists and its image is in the local image store.
    pub async fn is_image_installed(&self, type_id: &str) -> Result<bool, CoreError> {
        match self.store.read_local(type_id)? {
            Some(local) => self.image_present(&local).await,
            None => Ok(false),
        }
    }

    /// `None` when the type is unknown.
    pub async fn status(&self, type_id: &str) -> Result<Option<TypeStatus>, CoreError> {
        let record = self.store.load(type_id)?;
        if record.is_empty() {
            return Ok(None);
        }
        if self.is_image_installed(type_id).await? {
            Ok(Some(TypeStatus::Pulled))
        } else {
            Ok(Some(TypeStatus::Removed))
        }
    }

    pub async fn sync_type(&self, type_id: &str) -> Result<Option<TypeStatus>, CoreError> {
        let _guard = self.locks.acquire(type_id).await;
        self.sync_locked(type_id).await
    }

    /// Bring the published entity in line with disk and the image store.
    /// A type with neither record is purged and its entity deleted.
    async fn sync_locked(&self, type_id: &str) -> Result<Option<TypeStatus>, CoreError> {
        let record = self.store.load(type_id)?;
        if record.is_empty() {
            self.store.purge(type_id)?;
            match self.directory.delete_entity(KIND, type_id).await {
                Ok(()) | Err(BusError::NotFound { .. }) => {}
                Err(e) => return Err(e.into()),
            }
            self.routes.detach(type_id);
            info!("bridge type {type_id} forgotten");
            return Ok(None);
        }

        let installed = match &record.local {
            Some(local) => self.image_present(local).await?,
            None => false,
        };
        let status = if installed {
            TypeStatus::Pulled
        } else {
            TypeStatus::Removed
        };
        let fields = projection(type_id, &record, installed)?;

        if self.directory.entity(KIND, type_id).await?.is_none() {
            match self.directory.attach_entity(KIND, type_id, fields.clone()).await {
                Ok(_) | Err(BusError::Exists { .. }) => {}
                Err(e) => return Err(e.into()),
            }
        }
        if self.routes.attach(type_id).is_some() {
            debug!("routing events for bridge type {type_id}");
        }
        self.directory.publish(KIND, type_id, fields, true).await?;
        debug!("bridge type {type_id} synced as {}", status.as_str());
        Ok(Some(status))
    }

    /// Publish every type on disk. Overlapping calls are skipped.
    pub async fn first_sync(&self) -> Result<usize, CoreError> {
        let Some(_flight) = self.first_sync_flight.try_begin() else {
            debug!("first sync already running");
            return Ok(0);
        };
        let mut synced = 0;
        for type_id in self.store.list()? {
            match self.sync_type(&type_id).await {
                Ok(_) => synced += 1,
                Err(e) => warn!("failed to sync bridge type {type_id}: {e}"),
            }
        }
        info!("synced {synced} bridge types");
        Ok(synced)
    }

    /// Re-publish the stored attributes of every routed type, without the
    /// transient `event` attribute.
    pub async fn republish(&self) -> Result<(), CoreError> {
        for type_id in self.routes.attached() {
            let Some(record) = self.directory.entity(KIND, &type_id).await? else {
                continue;
            };
            let mut fields = record.fields;
            fields.remove("event");
            if let Err(e) = self.directory.publish(KIND, &type_id, fields, true).await {
                warn!("failed to republish bridge type {type_id}: {e}");
            }
        }
        Ok(())
    }

    /// Refresh staged updates from the catalog. Types the catalog no longer
    /// lists lose their staged record. Overlapping calls are skipped.
    pub async fn poll_catalog(&self) -> Result<(), CoreError> {
        let Some(_flight) = self.poll_flight.try_begin() else {
            debug!("catalog poll already running");
            return Ok(());
        };
        let Some(catalog) = self.catalog.as_ref() else {
            return Ok(());
        };

        let remote = catalog.list_types().await.map_err(remote_error)?;
        let mut known: BTreeSet<String> = self.store.list()?.into_iter().collect();
        let mut staged = 0;
        for type_id in &remote {
            known.remove(type_id);
            match self.check_remote(type_id).await {
                Ok(true) => staged += 1,
                Ok(false) => {}
                Err(e) => warn!("catalog check of {type_id} failed: {e}"),
            }
        }

        for type_id in known {
            let _guard = self.locks.acquire(&type_id).await;
            match self.store.drop_pending(&type_id) {
                Ok(true) => info!("bridge type {type_id} withdrawn from the catalog"),
                Ok(false) => {}
                Err(e) => warn!("failed to drop staged {type_id}: {e}"),
            }
            if let Err(e) = self.sync_locked(&type_id).await {
                warn!("failed to sync bridge type {type_id}: {e}");
            }
        }
        info!("catalog poll done: {} remote types, {staged} staged", remote.len());
        Ok(())
    }

    async fn fetch_remote(&self, type_id: &str) -> Result<BridgeTypeDescriptor, CoreError> {
        let Some(catalog) = self.catalog.as_ref() else {
            return Err(CoreError::Connection("no catalog configured".to_owned()));
        };
        let mut descriptor = catalog
            .type_descriptor(type_id)
            .await
            .map_err(remote_error)?;
        if descriptor.type_id.is_empty() {
            descriptor.type_id = type_id.to_owned();
        }
        Ok(descriptor)
    }

    /// Stage the catalog's descriptor if it differs from the newest one on
    /// disk. Returns whether anything was staged.
    pub async fn check_remote(&self, type_id: &str) -> Result<bool, CoreError> {
        let remote = self.fetch_remote(type_id).await?;
        let _guard = self.locks.acquire(type_id).await;
        self.check_remote_locked(type_id, remote).await
    }

    async fn check_remote_locked(
        &self,
        type_id: &str,
        remote: BridgeTypeDescriptor,
    ) -> Result<bool, CoreError> {
        let record = self.store.load(type_id)?;
        let current = record.pending.as_ref().or(record.local.as_ref());
        if !update_required(current, &remote) {
            debug!("bridge type {type_id} is current");
            return Ok(false);
        }

        let icon = match (remote.icon.as_deref(), self.catalog.as_ref()) {
            (Some(icon), Some(catalog)) => match catalog.type_file(type_id, icon).await {
                Ok(bytes) => Some(bytes),
                Err(e) => {
                    warn!("failed to fetch icon of {type_id}: {e}");
                    None
                }
            },
            _ => None,
        };
        self.store.stage(type_id, &remote, icon.as_deref())?;
        info!(
            "staged bridge type {type_id} version {}",
            remote.version.as_deref().unwrap_or("-")
        );
        self.sync_locked(type_id).await?;
        Ok(true)
    }

    /// Check the catalog for one type, then re-publish its version attribute.
    pub async fn check(&self, type_id: &str) -> Result<(), CoreError> {
        if self.catalog.is_some() {
            self.check_remote(type_id).await?;
        }
        let version = self
            .directory
            .entity(KIND, type_id)
            .await?
            .and_then(|record| record.field("version").cloned());
        if let Some(version) = version {
            self.directory
                .publish_attribute(KIND, type_id, "version", version, true)
                .await?;
        }
        Ok(())
    }

    /// Take the type's lock and pull in the background. Fails at once with a
    /// race error if the type is busy.
    pub fn begin_pull(
        self: &Arc<Self>,
        type_id: &str,
    ) -> Result<JoinHandle<Result<(), CoreError>>, CoreError> {
        let guard = self.try_lock(type_id)?;
        let this = Arc::clone(self);
        let type_id = type_id.to_owned();
        Ok(tokio::spawn(async move {
            let result = this.run_pull(&type_id, guard).await;
            if let Err(e) = &result {
                report_entity_error(this.directory.as_ref(), KIND, &type_id, "event", e).await;
            }
            result
        }))
    }

    pub async fn pull(&self, type_id: &str) -> Result<(), CoreError> {
        let guard = self.try_lock(type_id)?;
        self.run_pull(type_id, guard).await
    }

    /// Take the type's lock and remove in the background. Fails at once if the
    /// type is busy or any of its instances is started.
    pub async fn begin_remove(
        self: &Arc<Self>,
        type_id: &str,
    ) -> Result<JoinHandle<Result<(), CoreError>>, CoreError> {
        let guard = self.try_lock(type_id)?;
        self.ensure_no_started_members(type_id).await?;
        let this = Arc::clone(self);
        let type_id = type_id.to_owned();
        Ok(tokio::spawn(async move {
            let result = this.run_remove(&type_id, guard).await;
            if let Err(e) = &result {
                report_entity_error(this.directory.as_ref(), KIND, &type_id, "event", e).await;
            }
            result
        }))
    }

    pub async fn remove(&self, type_id: &str) -> Result<(), CoreError> {
        let guard = self.try_lock(type_id)?;
        self.ensure_no_started_members(type_id).await?;
        self.run_remove(type_id, guard).await
    }

    fn try_lock(&self, type_id: &str) -> Result<LockGuard, CoreError> {
        self.locks
            .try_acquire(type_id)
            .ok_or_else(|| CoreError::RaceCondition(BUSY.to_owned()))
    }

    async fn ensure_no_started_members(&self, type_id: &str) -> Result<(), CoreError> {
        if let Some(members) = self.members() {
            if members.has_started_members(type_id).await? {
                return Err(CoreError::RaceCondition(STOP_FIRST.to_owned()));
            }
        }
        Ok(())
    }

    async fn publish_state(&self, type_id: &str, status: TypeStatus) {
        if let Err(e) = self
            .directory
            .publish_attribute(KIND, type_id, "state", json!(status.as_str()), false)
            .await
        {
            warn!("failed to publish state of bridge type {type_id}: {e}");
        }
    }

    async fn run_pull(&self, type_id: &str, _guard: LockGuard) -> Result<(), CoreError> {
        let record = self.store.load(type_id)?;
        let Some(pending) = record.pending.clone() else {
            return Err(CoreError::NotFound(format!(
                "Bridge type {type_id} has no update to pull."
            )));
        };
        info!(
            "pulling bridge type {type_id} version {}",
            pending.version.as_deref().unwrap_or("-")
        );

        let members = self.members();
        let group = match &members {
            Some(m) => Some(m.lock_type(type_id).await),
            None => None,
        };
        self.publish_state(type_id, TypeStatus::Pulling).await;
        if let Some(m) = &members {
            m.stop_type_locked(type_id).await;
        }

        let installed = self.install(type_id, &pending).await;

        if let Some(m) = &members {
            m.restart_type_locked(type_id).await;
        }
        drop(group);

        match installed {
            Ok(()) => {
                self.cleanup_images(record.local.as_ref(), &pending).await;
                info!("bridge type {type_id} pulled");
                Ok(())
            }
            Err(e) => self.pull_failed(type_id, e).await,
        }
    }

    async fn install(&self, type_id: &str, pending: &BridgeTypeDescriptor) -> Result<(), CoreError> {
        let source = self.pull_reference(pending)?;
        self.runtime.pull_image(&source, self.auth.as_ref()).await?;

        let target = self.image_for(pending)?;
        if target != source {
            let reference = ImageReference::parse(&target)?;
            let tag = reference.tag.as_deref().unwrap_or(&self.channel_tag);
            self.runtime
                .tag_image(&source, &reference.repository(), tag)
                .await?;
        }

        self.store.promote(type_id)?;
        self.sync_locked(type_id).await?;
        self.directory
            .publish_attribute(
                KIND,
                type_id,
                "version",
                json!({"updateAvailable": false, "updated": true}),
                true,
            )
            .await?;
        Ok(())
    }

    async fn pull_failed(&self, type_id: &str, err: CoreError) -> Result<(), CoreError> {
        warn!("pull of bridge type {type_id} failed: {err}");
        if let Err(e) = self.sync_locked(type_id).await {
            warn!("failed to sync bridge type {type_id}: {e}");
        }
        let update_error = ErrorPayload::new(ErrorCode::ConnectionError, REQUEST_ERROR);
        let version = json!({
            "updateAvailable": true,
            "updated": false,
            "updateError": update_error,
        });
        if let Err(e) = self
            .directory
            .publish_attribute(KIND, type_id, "version", version, true)
            .await
        {
            warn!("failed to publish version of bridge type {type_id}: {e}");
        }

        if matches!(&err, CoreError::Runtime(e) if e.is_not_found()) {
            if self.catalog.is_some() {
                let rechecked = match self.fetch_remote(type_id).await {
                    Ok(remote) => self.check_remote_locked(type_id, remote).await,
                    Err(e) => Err(e),
                };
                if let Err(e) = rechecked {
                    warn!("catalog recheck of {type_id} failed: {e}");
                }
            }
            return Err(CoreError::NotFound("Repository was not found.".to_owned()));
        }
        Err(err)
    }

    /// `repository:version` when a version is declared, else the local image.
    fn pull_reference(&self, descriptor: &BridgeTypeDescriptor) -> Result<String, CoreError> {
        match descriptor.version.as_deref() {
            Some(version) if !version.is_empty() => {
                let reference = ImageReference::parse(&descriptor.registry)?;
                Ok(format!("{}:{version}", reference.repository()))
            }
            _ => self.image_for(descriptor),
        }
    }

    /// Drop every image of the old and new repositories that does not carry
    /// the freshly installed tag.
    async fn cleanup_images(
        &self,
        previous: Option<&BridgeTypeDescriptor>,
        installed: &BridgeTypeDescriptor,
    ) {
        let keep = match self.image_for(installed) {
            Ok(keep) => keep,
            Err(e) => {
                warn!("image cleanup skipped: {e}");
                return;
            }
        };
        let mut repositories = BTreeSet::new();
        for descriptor in std::iter::once(installed).chain(previous) {
            match ImageReference::parse(&descriptor.registry) {
                Ok(reference) => {
                    repositories.insert(reference.repository());
                }
                Err(e) => warn!("image cleanup skipped for {}: {e}", descriptor.registry),
            }
        }

        for repository in repositories {
            let images = match self.runtime.list_images(&repository).await {
                Ok(images) => images,
                Err(e) => {
                    warn!("failed to list images of {repository}: {e}");
                    continue;
                }
            };
            for image in images.iter().filter(|i| !i.repo_tags.contains(&keep)) {
                for tag in &image.repo_tags {
                    match self.runtime.remove_image(tag).await {
                        Ok(()) => debug!("removed stale image {tag}"),
                        Err(e) => warn!("failed to remove stale image {tag}: {e}"),
                    }
                }
            }
        }
    }

    async fn run_remove(&self, type_id: &str, _guard: LockGuard) -> Result<(), CoreError> {
        info!("removing bridge type {type_id}");
        let result = self.remove_locked(type_id).await;
        if let Err(e) = &result {
            warn!("removal of bridge type {type_id} failed: {e}");
            if let Err(e) = self.sync_locked(type_id).await {
                warn!("failed to sync bridge type {type_id}: {e}");
            }
        }
        result
    }

    async fn remove_locked(&self, type_id: &str) -> Result<(), CoreError> {
        let Some(local) = self.store.read_local(type_id)? else {
            return Err(CoreError::TypeNotInstalled(type_id.to_owned()));
        };
        let members = self.members();
        let _group = match &members {
            Some(m) => Some(m.lock_type(type_id).await),
            None => None,
        };
        // Re-checked under the group lock.
        if let Some(m) = &members {
            if m.has_started_members(type_id).await? {
                return Err(CoreError::RaceCondition(STOP_FIRST.to_owned()));
            }
        }

        self.publish_state(type_id, TypeStatus::Removing).await;
        self.store.remove_local(type_id)?;

        let repository = ImageReference::parse(&local.registry)?.repository();
        for image in self.runtime.list_images(&repository).await? {
            for tag in &image.repo_tags {
                match self.runtime.remove_image(tag).await {
                    Ok(()) => debug!("removed image {tag}"),
                    Err(e) if e.is_not_found() => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }

        self.sync_locked(type_id).await?;
        info!("bridge type {type_id} removed");
        Ok(())
    }

    /// Route one bus event. Errors are reported back on the bus.
    pub async fn handle_event(self: &Arc<Self>, event: EntityEvent) {
        let directory = self.directory.as_ref();
        match event {
            EntityEvent::Create { id, .. } => {
                let err = CoreError::Rejected(NOT_PERMITTED.to_owned());
                report_error(directory, KIND, &id, "create", &err).await;
            }
            EntityEvent::Delete { id } => {
                let err = CoreError::Rejected(NOT_PERMITTED.to_owned());
                report_error(directory, KIND, &id, "delete", &err).await;
            }
            EntityEvent::Update { id, value } => {
                if !self.routes.is_attached(&id) {
                    debug!("update for unrouted bridge type {id} ignored");
                    return;
                }
                if let Err(e) = self.handle_update(&id, &value).await {
                    report_error(directory, KIND, &id, "update", &e).await;
                }
            }
            EntityEvent::Set { id, field, value } => {
                if !self.routes.is_attached(&id) {
                    debug!("set for unrouted bridge type {id} ignored");
                    return;
                }
                if let Err(e) = self.handle_set(&id, &field, &value).await {
                    report_entity_error(directory, KIND, &id, &field, &e).await;
                }
            }
            EntityEvent::NewEntity { id } => {
                if let Err(e) = self.sync_type(&id).await {
                    warn!("failed to sync new bridge type entity {id}: {e}");
                }
            }
            EntityEvent::Reconnected => {
                if let Err(e) = self.republish().await {
                    warn!("republish after reconnect failed: {e}");
                }
            }
        }
    }

    async fn handle_update(self: &Arc<Self>, type_id: &str, value: &Fields) -> Result<(), CoreError> {
        if self.locks.is_held(type_id) {
            return Err(CoreError::RaceCondition(BUSY.to_owned()));
        }
        let Some(event) = value.get("event").and_then(Value::as_str) else {
            return Err(CoreError::validation(
                "event",
                "required",
                "Please specify 'event' field.",
            ));
        };
        self.dispatch(type_id, event).await
    }

    async fn handle_set(
        self: &Arc<Self>,
        type_id: &str,
        field: &str,
        value: &Value,
    ) -> Result<(), CoreError> {
        if self.locks.is_held(type_id) {
            return Err(CoreError::RaceCondition(BUSY.to_owned()));
        }
        if field != "event" {
            return Err(CoreError::validation(
                field,
                "not_allowed",
                format!("You cannot set the field {field}"),
            ));
        }
        let Some(event) = value.as_str() else {
            return Err(CoreError::validation(
                "event",
                "not_allowed_value",
                format!("Value {value} is not allowed for the field event."),
            ));
        };
        self.dispatch(type_id, event).await?;
        self.directory
            .publish_attribute(KIND, type_id, "event", value.clone(), false)
            .await?;
        Ok(())
    }

    async fn dispatch(self: &Arc<Self>, type_id: &str, event: &str) -> Result<(), CoreError> {
        match event {
            "pull" => self.begin_pull(type_id).map(drop),
            "remove" => self.begin_remove(type_id).await.map(drop),
            "check" => self.check(type_id).await,
            other => Err(CoreError::validation(
                "event",
                "not_allowed_value",
                format!("Value {other} is not allowed for the field event."),
            )),
        }
    }

    /// Dispatch bus events until the channel closes. Each event is handled in
    /// its own task.
    pub fn run(self: Arc<Self>, mut events: broadcast::Receiver<EntityEvent>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        let this = Arc::clone(&self);
                        tokio::spawn(async move { this.handle_event(event).await });
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("bridge type dispatcher lagged, {n} events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            debug!("bridge type dispatcher stopped");
        })
    }
}

fn remote_error(err: RemoteError) -> CoreError {
    match err {
        RemoteError::NotFound(what) => CoreError::NotFound(format!("not in the catalog: {what}")),
        RemoteError::Http(_) | RemoteError::Io(_) | RemoteError::Task(_) => {
            warn!("catalog request failed: {err}");
            CoreError::Connection(REQUEST_ERROR.to_owned())
        }
        other => CoreError::Remote(other),
    }
}

fn update_required(current: Option<&BridgeTypeDescriptor>, remote: &BridgeTypeDescriptor) -> bool {
    current.map_or(true, |current| remote.differs_from(current))
}

fn icon_url(type_id: &str, record: &TypeRecord, installed: bool) -> Option<String> {
    match (&record.local, &record.pending) {
        (Some(local), _) if installed => local.icon.as_deref().map(|icon| {
            if icon.split('/').next() == Some("api") {
                icon.to_owned()
            } else {
                format!("{ICON_ROOT}/{type_id}/{icon}")
            }
        }),
        (_, Some(pending)) => pending
            .icon
            .as_deref()
            .map(|icon| format!("{ICON_ROOT}/{type_id}/{STAGED_PREFIX}{icon}")),
        _ => None,
    }
}

/// The attributes published for a type.
fn projection(type_id: &str, record: &TypeRecord, installed: bool) -> Result<Fields, CoreError> {
    let status = if installed {
        TypeStatus::Pulled
    } else {
        TypeStatus::Removed
    };
    let base = record.local.as_ref().or(record.pending.as_ref());
    let mut fields = base.map(|d| d.extra.clone()).unwrap_or_default();

    fields.insert(
        "title".to_owned(),
        json!(base.map(|d| d.title.as_str()).unwrap_or_default()),
    );
    let configuration = match &record.local {
        Some(local) => serde_json::to_value(&local.configuration)?,
        None => json!({}),
    };
    fields.insert("configuration".to_owned(), configuration);
    fields.insert(
        "icon".to_owned(),
        icon_url(type_id, record, installed).map_or(Value::Null, Value::String),
    );
    fields.insert("status".to_owned(), json!(status.as_str()));
    fields.insert("state".to_owned(), json!(status.as_str()));
    fields.insert(
        "version".to_owned(),
        json!({"updateAvailable": record.update_available(), "updated": false}),
    );
    Ok(fields)
}
