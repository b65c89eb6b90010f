use crate::bus::{
    report_entity_error, report_error, BusError, EntityDirectory, EntityEvent, EntityKind,
    EntityRecord, Fields, RoutingTable, Subscription,
};
use crate::concurrency::SingleFlight;
use crate::config::RuntimeContext;
use crate::container::{build_container_spec, instance_container_name, shared_volumes, SpecInput};
use crate::credentials::{CredentialError, CredentialService};
use crate::lifecycle::{validate_transition, DesiredStatus, ObservedState};
use crate::lock::{LockGuard, ResourceLock};
use crate::materialize::{Materializer, MQTT_USER};
use crate::registry::{BridgeTypeRegistry, TypeMembers};
use crate::stream::{resolve_handler, EventScanner, StreamHandler};
use crate::CoreError;
use async_trait::async_trait;
use bridgekeeper_runtime::{OutputStream, RuntimeError, StreamChunk};
use bridgekeeper_schema::{
    container_name, parse_container_name, validate_id, BridgeTypeDescriptor, ConfigValidator,
    ValidationErrors,
};
use bridgekeeper_store::HostLayout;
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const KIND: EntityKind = EntityKind::Bridge;
const BUSY: &str = "Bridge is processing now, wait for the end of operation.";
const RELOAD_SIGNAL: &str = "HUP";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// The container is running and `state` is `started`.
    Started,
    /// No container is left and `state` is `stopped`.
    Stopped,
    /// The type is locked; the type operation reconciles its members when done.
    Deferred,
    /// Another reconcile of the same instance is in progress.
    Skipped,
}

pub struct InstanceDeps {
    pub context: RuntimeContext,
    pub host: HostLayout,
    pub registry: Arc<BridgeTypeRegistry>,
    pub materializer: Materializer,
    pub credentials: Arc<dyn CredentialService>,
    pub directory: Arc<dyn EntityDirectory>,
    pub validator: Arc<dyn ConfigValidator>,
    /// How long leftovers found at startup are kept before removal.
    pub orphan_grace: Duration,
}

#[derive(Default)]
struct Tracked {
    type_id: Option<String>,
    container: Option<String>,
    stream_events: BTreeMap<String, String>,
    /// Generation of the attached output stream.
    stream: Option<u64>,
    subscription: Option<Subscription>,
}

#[derive(Debug, Default)]
struct Leftovers {
    containers: Vec<String>,
    dirs: Vec<String>,
}

struct ReconcileMark<'a> {
    set: &'a Mutex<HashSet<String>>,
    id: String,
}

impl Drop for ReconcileMark<'_> {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}

pub struct BridgeInstanceManager {
    me: Weak<Self>,
    context: RuntimeContext,
    host: HostLayout,
    registry: Arc<BridgeTypeRegistry>,
    materializer: Materializer,
    credentials: Arc<dyn CredentialService>,
    directory: Arc<dyn EntityDirectory>,
    validator: Arc<dyn ConfigValidator>,
    locks: ResourceLock,
    routes: RoutingTable,
    tracked: Mutex<HashMap<String, Tracked>>,
    reconciling: Mutex<HashSet<String>>,
    leftovers: Mutex<BTreeMap<String, Leftovers>>,
    next_stream: AtomicU64,
    orphan_grace: Duration,
    cleanup_flight: SingleFlight,
}

fn observed(record: &EntityRecord) -> Option<ObservedState> {
    record.str_field("state").and_then(ObservedState::parse)
}

fn desired(record: &EntityRecord) -> DesiredStatus {
    record
        .str_field("status")
        .and_then(DesiredStatus::parse)
        .unwrap_or_else(|| DesiredStatus::from_observed(observed(record)))
}

fn type_of(record: &EntityRecord) -> Result<String, CoreError> {
    record
        .str_field("type")
        .map(str::to_owned)
        .ok_or_else(|| CoreError::validation("type", "required", "Please specify 'type' field."))
}

/// A configuration given as an object or as JSON text. Absent means empty.
fn configuration_value(value: Option<&Value>) -> Result<Map<String, Value>, CoreError> {
    let invalid = || {
        CoreError::validation(
            "configuration",
            "invalid_json",
            "Configuration must be a JSON object.",
        )
    };
    match value {
        None | Some(Value::Null) => Ok(Map::new()),
        Some(Value::Object(map)) => Ok(map.clone()),
        Some(Value::String(text)) => match serde_json::from_str::<Value>(text) {
            Ok(Value::Object(map)) => Ok(map),
            _ => Err(invalid()),
        },
        Some(_) => Err(invalid()),
    }
}

fn event_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn exists_error() -> CoreError {
    CoreError::Exists {
        fields: ValidationErrors::single("entityId", "exists"),
        message: "EntityId is already in use. Try again later.".to_owned(),
    }
}

impl BridgeInstanceManager {
    pub fn new(deps: InstanceDeps) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            context: deps.context,
            host: deps.host,
            registry: deps.registry,
            materializer: deps.materializer,
            credentials: deps.credentials,
            directory: deps.directory,
            validator: deps.validator,
            locks: ResourceLock::new(),
            routes: RoutingTable::new(),
            tracked: Mutex::new(HashMap::new()),
            reconciling: Mutex::new(HashSet::new()),
            leftovers: Mutex::new(BTreeMap::new()),
            next_stream: AtomicU64::new(0),
            orphan_grace: deps.orphan_grace,
            cleanup_flight: SingleFlight::new(),
        })
    }

    pub fn registry(&self) -> &Arc<BridgeTypeRegistry> {
        &self.registry
    }

    pub fn locks(&self) -> &ResourceLock {
        &self.locks
    }

    pub fn materializer(&self) -> &Materializer {
        &self.materializer
    }

    fn tracked(&self) -> MutexGuard<'_, HashMap<String, Tracked>> {
        self.tracked.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn leftovers(&self) -> MutexGuard<'_, BTreeMap<String, Leftovers>> {
        self.leftovers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Ids of every attached instance, sorted.
    pub fn instance_ids(&self) -> Vec<String> {
        self.routes.attached()
    }

    pub fn is_attached(&self, id: &str) -> bool {
        self.routes.is_attached(id)
    }

    /// The container last created or found for `id`.
    pub fn container_of(&self, id: &str) -> Option<String> {
        self.tracked().get(id).and_then(|t| t.container.clone())
    }

    pub fn is_streaming(&self, id: &str) -> bool {
        self.tracked().get(id).is_some_and(|t| t.stream.is_some())
    }

    /// Ids with leftovers waiting for the grace period to pass.
    pub fn pending_leftovers(&self) -> Vec<String> {
        self.leftovers().keys().cloned().collect()
    }

    async fn entity(&self, id: &str) -> Result<EntityRecord, CoreError> {
        self.directory
            .entity(KIND, id)
            .await?
            .ok_or_else(|| CoreError::EntityNotFound(id.to_owned()))
    }

    async fn type_id_of(&self, id: &str) -> Result<String, CoreError> {
        if let Some(record) = self.directory.entity(KIND, id).await? {
            return type_of(&record);
        }
        self.tracked()
            .get(id)
            .and_then(|t| t.type_id.clone())
            .ok_or_else(|| CoreError::EntityNotFound(id.to_owned()))
    }

    async fn observed_state(&self, id: &str) -> Result<Option<ObservedState>, CoreError> {
        Ok(self.entity(id).await.map(|r| observed(&r)).unwrap_or(None))
    }

    /// Name the instance's container has under the type's current descriptor.
    fn expected_name(&self, id: &str, type_id: &str) -> String {
        match self.registry.naming_descriptor(type_id) {
            Some(descriptor) => instance_container_name(&descriptor, id),
            None => container_name(type_id, id, false),
        }
    }

    fn container_name_for(&self, id: &str, type_id: &str) -> String {
        self.container_of(id)
            .unwrap_or_else(|| self.expected_name(id, type_id))
    }

    fn remember_container(&self, id: &str, type_id: &str, name: &str) {
        let mut tracked = self.tracked();
        let entry = tracked.entry(id.to_owned()).or_default();
        entry.type_id = Some(type_id.to_owned());
        entry.container = Some(name.to_owned());
    }

    fn forget_container(&self, id: &str, name: &str) {
        if let Some(entry) = self.tracked().get_mut(id) {
            if entry.container.as_deref() == Some(name) {
                entry.container = None;
            }
        }
    }

    fn try_lock(&self, type_id: &str, id: &str) -> Result<LockGuard, CoreError> {
        self.locks.try_acquire_member(type_id, id).ok_or_else(|| {
            if self.locks.is_held(id) {
                CoreError::RaceCondition(BUSY.to_owned())
            } else {
                type_locked(type_id)
            }
        })
    }

    fn is_reconciling(&self, id: &str) -> bool {
        self.reconciling
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(id)
    }

    fn begin_reconcile(&self, id: &str) -> Option<ReconcileMark<'_>> {
        let mut set = self.reconciling.lock().unwrap_or_else(PoisonError::into_inner);
        if !set.insert(id.to_owned()) {
            return None;
        }
        Some(ReconcileMark {
            set: &self.reconciling,
            id: id.to_owned(),
        })
    }

    /// Publish a new observed state. Repeating the current state is a no-op.
    async fn transition(&self, id: &str, to: ObservedState) -> Result<(), CoreError> {
        if let Some(from) = self.observed_state(id).await? {
            if from == to {
                return Ok(());
            }
            validate_transition(from, to)?;
        }
        self.directory
            .publish_attribute(KIND, id, "state", json!(to.as_str()), true)
            .await?;
        debug!("bridge {id} is {to}");
        Ok(())
    }

    async fn publish_status(&self, id: &str, status: DesiredStatus) -> Result<(), CoreError> {
        self.directory
            .publish_attribute(KIND, id, "status", json!(status.as_str()), true)
            .await?;
        Ok(())
    }

    /// Both desired and observed go to `stopped`.
    async fn publish_stopped(&self, id: &str) {
        let mut fields = Fields::new();
        fields.insert("status".to_owned(), json!(DesiredStatus::Stopped.as_str()));
        fields.insert("state".to_owned(), json!(ObservedState::Stopped.as_str()));
        if let Err(e) = self.directory.publish(KIND, id, fields, true).await {
            warn!("failed to publish stopped for bridge {id}: {e}");
        }
    }

    /// Derive `status` from the observed state.
    async fn check_status(&self, id: &str) -> Result<(), CoreError> {
        let state = self.observed_state(id).await?;
        self.publish_status(id, DesiredStatus::from_observed(state))
            .await
    }

    /// Move `state` towards `status` without touching the container.
    async fn check_state(&self, id: &str) -> Result<(), CoreError> {
        let record = self.entity(id).await?;
        let state = observed(&record);
        match desired(&record) {
            DesiredStatus::Stopped
                if !matches!(state, Some(ObservedState::Stopping | ObservedState::Stopped)) =>
            {
                self.transition(id, ObservedState::Stopping).await
            }
            DesiredStatus::Started if !state.is_some_and(ObservedState::is_up) => {
                self.transition(id, ObservedState::Starting).await
            }
            _ => Ok(()),
        }
    }

    /// Stop and remove a container. Missing or already stopped containers are
    /// fine.
    async fn teardown(&self, id: &str, name: &str) -> Result<(), CoreError> {
        self.detach_stream(id);
        match self.context.runtime.stop_container(name).await {
            Ok(()) => debug!("stopped {name}"),
            Err(RuntimeError::AlreadyStopped(_)) => {}
            Err(e) if e.is_not_found() => {
                self.forget_container(id, name);
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }
        match self.context.runtime.remove_container(name).await {
            Ok(()) => info!("removed container {name}"),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }
        self.forget_container(id, name);
        Ok(())
    }

    /// Write the instance's current configuration to disk.
    pub async fn materialize_configuration(&self, id: &str) -> Result<(), CoreError> {
        let record = self.entity(id).await?;
        let type_id = type_of(&record)?;
        let Some(descriptor) = self.registry.installed_descriptor(&type_id)? else {
            return Err(CoreError::TypeNotInstalled(type_id));
        };
        let configuration = configuration_value(record.field("configuration"))?;
        self.materializer
            .materialize(&descriptor, id, &configuration)
            .await
    }

    /// Whether materializing `desired` would change what is on disk for `id`.
    pub async fn configuration_changed(
        &self,
        id: &str,
        desired: &Map<String, Value>,
    ) -> Result<bool, CoreError> {
        let type_id = self.type_id_of(id).await?;
        let Some(descriptor) = self.registry.installed_descriptor(&type_id)? else {
            return Err(CoreError::TypeNotInstalled(type_id));
        };
        Ok(self
            .materializer
            .configuration_changed(&descriptor, id, desired))
    }

    /// Converge `id` on its desired status. Waits for the instance's lock.
    pub async fn reconcile(&self, id: &str) -> Result<ReconcileOutcome, CoreError> {
        let type_id = self.type_id_of(id).await?;
        if self.locks.is_group_locked(&type_id) {
            debug!("bridge type {type_id} is locked, reconcile of {id} deferred");
            return Ok(ReconcileOutcome::Deferred);
        }
        if self.is_reconciling(id) {
            debug!("bridge {id} is already reconciling");
            return Ok(ReconcileOutcome::Skipped);
        }
        let _guard = self.locks.acquire_member(&type_id, id).await;
        self.reconcile_locked(id).await
    }

    async fn reconcile_locked(&self, id: &str) -> Result<ReconcileOutcome, CoreError> {
        let Some(_mark) = self.begin_reconcile(id) else {
            debug!("bridge {id} is already reconciling");
            return Ok(ReconcileOutcome::Skipped);
        };
        let record = self.entity(id).await?;
        let type_id = type_of(&record)?;
        let result = match desired(&record) {
            DesiredStatus::Started => self.converge_started(id, &type_id, &record).await,
            DesiredStatus::Stopped => self.converge_stopped(id, &type_id).await,
        };
        match result {
            Ok(outcome) => Ok(outcome),
            Err(err) => self.reconcile_failed(id, &type_id, err).await,
        }
    }

    async fn reconcile_failed(
        &self,
        id: &str,
        type_id: &str,
        err: CoreError,
    ) -> Result<ReconcileOutcome, CoreError> {
        match err {
            CoreError::TypeNotInstalled(_) => {
                self.publish_stopped(id).await;
                Err(err)
            }
            CoreError::Runtime(RuntimeError::AlreadyStopped(_)) => {
                debug!("container of bridge {id} already stopped");
                self.publish_stopped(id).await;
                Ok(ReconcileOutcome::Stopped)
            }
            CoreError::Runtime(e) if e.is_not_found() => {
                warn!("reconcile of bridge {id} hit a missing image or container: {e}");
                self.publish_stopped(id).await;
                Err(CoreError::TypeNotInstalled(type_id.to_owned()))
            }
            err => {
                self.settle_transient(id).await;
                Err(err)
            }
        }
    }

    /// Replace a `starting` or `stopping` state left by a failed operation.
    async fn settle_transient(&self, id: &str) {
        if self
            .observed_state(id)
            .await
            .ok()
            .flatten()
            .is_some_and(ObservedState::is_transient)
        {
            if let Err(e) = self
                .directory
                .publish_attribute(KIND, id, "state", json!("stopped"), true)
                .await
            {
                warn!("failed to publish state of bridge {id}: {e}");
            }
        }
    }

    async fn converge_started(
        &self,
        id: &str,
        type_id: &str,
        record: &EntityRecord,
    ) -> Result<ReconcileOutcome, CoreError> {
        let Some(descriptor) = self.registry.installed_descriptor(type_id)? else {
            return Err(CoreError::TypeNotInstalled(type_id.to_owned()));
        };
        if !self.registry.is_image_installed(type_id).await? {
            return Err(CoreError::TypeNotInstalled(type_id.to_owned()));
        }
        let configuration = configuration_value(record.field("configuration")).unwrap_or_default();
        let name = instance_container_name(&descriptor, id);

        if let Some(stale) = self.container_of(id).filter(|c| *c != name) {
            info!("bridge {id} moved from {stale} to {name}");
            self.teardown(id, &stale).await?;
        }
        if self
            .materializer
            .configuration_changed(&descriptor, id, &configuration)
        {
            info!("configuration of bridge {id} changed, recreating {name}");
            self.teardown(id, &name).await?;
            self.materializer
                .materialize(&descriptor, id, &configuration)
                .await?;
        }

        let existing = match self.context.runtime.inspect_container(&name).await {
            Ok(info) => Some(info),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e.into()),
        };
        let running = existing.as_ref().is_some_and(|i| i.status.is_running());
        if !(running && observed(record) == Some(ObservedState::Started)) {
            self.transition(id, ObservedState::Starting).await?;
        }

        if existing.is_none() {
            self.create_container(id, &descriptor, &configuration, &name)
                .await?;
        } else {
            self.remember_container(id, type_id, &name);
        }
        if !running {
            self.context.runtime.start_container(&name).await?;
            info!("started {name} for bridge {id}");
        }

        self.transition(id, ObservedState::Started).await?;
        self.attach_stream(id, &name, &descriptor).await?;
        Ok(ReconcileOutcome::Started)
    }

    async fn create_container(
        &self,
        id: &str,
        descriptor: &BridgeTypeDescriptor,
        configuration: &Map<String, Value>,
        name: &str,
    ) -> Result<(), CoreError> {
        let env = self.materializer.store().read_env(name)?.unwrap_or_default();
        let plan = build_container_spec(&SpecInput {
            context: &self.context,
            host: &self.host,
            descriptor,
            instance_id: id,
            configuration,
            env: &env,
        })?;
        self.context.runtime.create_container(&plan.spec).await?;
        self.remember_container(id, &descriptor.type_id, name);
        info!("created {name} from {}", plan.spec.image);
        Ok(())
    }

    async fn converge_stopped(
        &self,
        id: &str,
        type_id: &str,
    ) -> Result<ReconcileOutcome, CoreError> {
        let name = self.container_name_for(id, type_id);
        let exists = match self.context.runtime.inspect_container(&name).await {
            Ok(_) => true,
            Err(e) if e.is_not_found() => false,
            Err(e) => return Err(e.into()),
        };
        if exists {
            if self
                .observed_state(id)
                .await?
                .is_some_and(ObservedState::is_up)
            {
                self.transition(id, ObservedState::Stopping).await?;
            }
            self.teardown(id, &name).await?;
        } else {
            self.detach_stream(id);
            self.forget_container(id, &name);
        }
        self.transition(id, ObservedState::Stopped).await?;
        Ok(ReconcileOutcome::Stopped)
    }

    fn detach_stream(&self, id: &str) {
        if let Some(entry) = self.tracked().get_mut(id) {
            if entry.stream.take().is_some() {
                debug!("output stream of bridge {id} detached");
            }
        }
    }

    fn is_current_stream(&self, id: &str, generation: u64) -> bool {
        self.tracked()
            .get(id)
            .is_some_and(|t| t.stream == Some(generation))
    }

    async fn attach_stream(
        &self,
        id: &str,
        name: &str,
        descriptor: &BridgeTypeDescriptor,
    ) -> Result<(), CoreError> {
        if self.is_streaming(id) {
            return Ok(());
        }
        let stream = self.context.runtime.attach(name).await?;
        let generation = self.next_stream.fetch_add(1, Ordering::SeqCst) + 1;
        {
            let mut tracked = self.tracked();
            let entry = tracked.entry(id.to_owned()).or_default();
            entry.stream = Some(generation);
            entry
                .stream_events
                .clone_from(&descriptor.configuration.stream_events);
        }
        if let Some(this) = self.me.upgrade() {
            tokio::spawn(this.follow_stream(id.to_owned(), generation, stream));
        }
        debug!("following output of {name}");
        Ok(())
    }

    async fn follow_stream(self: Arc<Self>, id: String, generation: u64, mut stream: OutputStream) {
        let mut scanner = EventScanner::new();
        while let Some(chunk) = stream.next().await {
            match chunk {
                StreamChunk::Data(text) => {
                    for event in scanner.push(&text) {
                        self.on_stream_event(&id, &event).await;
                    }
                }
                StreamChunk::Error(e) => {
                    warn!("output stream of bridge {id} failed: {e}");
                    break;
                }
            }
            if !self.is_current_stream(&id, generation) {
                return;
            }
        }
        self.on_stream_closed(&id, generation).await;
    }

    async fn on_stream_event(&self, id: &str, event: &str) {
        let handler = self
            .tracked()
            .get(id)
            .and_then(|t| resolve_handler(&t.stream_events, event));
        match handler {
            Some(StreamHandler::ReloadProxy) => self.reload_proxy(id).await,
            None => debug!("bridge {id} raised unhandled event {event}"),
        }
    }

    async fn reload_proxy(&self, id: &str) {
        let proxy = &self.context.proxy_container;
        match self.context.runtime.kill_container(proxy, RELOAD_SIGNAL).await {
            Ok(()) => info!("reloaded {proxy} for bridge {id}"),
            Err(e) => warn!("failed to reload {proxy}: {e}"),
        }
    }

    /// The container's output ended without the core asking for it.
    async fn on_stream_closed(&self, id: &str, generation: u64) {
        if !self.is_current_stream(id, generation) {
            return;
        }
        let Ok(type_id) = self.type_id_of(id).await else {
            return;
        };
        let _guard = self.locks.acquire_member(&type_id, id).await;
        if !self.is_current_stream(id, generation) {
            return;
        }
        info!("output of bridge {id} ended, marking it stopped");
        self.detach_stream(id);
        self.publish_stopped(id).await;
        let name = self.container_name_for(id, &type_id);
        if let Err(e) = self.teardown(id, &name).await {
            warn!("failed to remove exited container {name}: {e}");
        }
    }

    /// Route an instance entity's events to this manager and bring it in
    /// line. Returns false when it was already attached.
    pub async fn attach(&self, id: &str) -> Result<bool, CoreError> {
        let type_id = self.type_id_of(id).await?;
        let _guard = self.locks.acquire_member(&type_id, id).await;
        self.attach_locked(id).await
    }

    async fn attach_locked(&self, id: &str) -> Result<bool, CoreError> {
        let record = self.entity(id).await?;
        let type_id = type_of(&record)?;
        let Some(subscription) = self.routes.attach(id) else {
            return Ok(false);
        };
        {
            let mut tracked = self.tracked();
            let entry = tracked.entry(id.to_owned()).or_default();
            entry.type_id = Some(type_id.clone());
            entry.subscription = Some(subscription);
        }

        if record
            .str_field("status")
            .and_then(DesiredStatus::parse)
            .is_none()
        {
            self.check_status(id).await?;
        }
        self.check_state(id).await?;
        if let Err(e) = self.reconcile_locked(id).await {
            warn!("bridge {id} did not reconcile on attach: {e}");
        }
        info!("bridge {id} of type {type_id} attached");
        Ok(true)
    }

    fn detach(&self, id: &str) {
        let entry = self.tracked().remove(id);
        match entry.and_then(|t| t.subscription) {
            Some(subscription) => subscription.detach(),
            None => {
                self.routes.detach(id);
            }
        }
    }

    /// Route one bus event. Errors are reported back on the bus.
    pub async fn handle_event(&self, event: EntityEvent) {
        let directory = self.directory.as_ref();
        match event {
            EntityEvent::Create { id, value } => {
                if let Err(e) = self.handle_create(&id, &value).await {
                    report_error(directory, KIND, &id, "create", &e).await;
                }
            }
            EntityEvent::Update { id, value } => {
                if !self.routes.is_attached(&id) {
                    debug!("update for unrouted bridge {id} ignored");
                    return;
                }
                if let Err(e) = self.handle_update(&id, &value).await {
                    report_error(directory, KIND, &id, "update", &e).await;
                }
            }
            EntityEvent::Set { id, field, value } => {
                if !self.routes.is_attached(&id) {
                    debug!("set for unrouted bridge {id} ignored");
                    return;
                }
                if let Err(e) = self.handle_set(&id, &field, &value).await {
                    report_entity_error(directory, KIND, &id, &field, &e).await;
                }
            }
            EntityEvent::Delete { id } => {
                if !self.routes.is_attached(&id) {
                    debug!("delete for unrouted bridge {id} ignored");
                    return;
                }
                if let Err(e) = self.handle_delete(&id).await {
                    report_error(directory, KIND, &id, "delete", &e).await;
                }
            }
            EntityEvent::NewEntity { id } => {
                if !self.routes.is_attached(&id) {
                    if let Err(e) = self.attach(&id).await {
                        warn!("failed to attach new bridge {id}: {e}");
                    }
                }
            }
            EntityEvent::Reconnected => self.reconcile_all().await,
        }
    }

    async fn handle_create(&self, id: &str, value: &Fields) -> Result<(), CoreError> {
        validate_id(id).map_err(|_| {
            CoreError::validation(
                "entityId",
                "invalid",
                format!("Invalid entity id {id}, use letters, digits and underscores."),
            )
        })?;
        if self.routes.is_attached(id) || self.directory.entity(KIND, id).await?.is_some() {
            return Err(exists_error());
        }
        let type_id = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| CoreError::validation("type", "required", "Please specify 'type' field."))?;
        let Some(descriptor) = self.registry.installed_descriptor(type_id)? else {
            return Err(CoreError::TypeNotInstalled(type_id.to_owned()));
        };
        if !self.registry.is_image_installed(type_id).await? {
            return Err(CoreError::TypeNotInstalled(type_id.to_owned()));
        }
        let configuration = configuration_value(value.get("configuration"))?;
        self.validator
            .validate(&descriptor.configuration.fields, &configuration)?;

        let _guard = self.try_lock(type_id, id)?;
        let mut fields = Fields::new();
        fields.insert("state".to_owned(), json!(ObservedState::Stopped.as_str()));
        fields.extend(value.iter().map(|(k, v)| (k.clone(), v.clone())));
        fields.insert("configuration".to_owned(), Value::Object(configuration.clone()));
        match self.directory.attach_entity(KIND, id, fields).await {
            Ok(_) => {}
            Err(BusError::Exists { .. }) => return Err(exists_error()),
            Err(e) => return Err(e.into()),
        }

        if let Err(e) = self
            .materializer
            .materialize(&descriptor, id, &configuration)
            .await
        {
            warn!("bridge {id} could not be materialized, rolling back: {e}");
            let name = self.container_name_for(id, type_id);
            if let Err(e) = self.remove_artifacts(id, &name, &[]).await {
                warn!("failed to remove artifacts of bridge {id}: {e}");
            }
            if let Err(e) = self.directory.delete_entity(KIND, id).await {
                warn!("failed to delete entity of bridge {id}: {e}");
            }
            return Err(e);
        }
        info!("bridge {id} of type {type_id} created");
        self.attach_locked(id).await?;
        Ok(())
    }

    async fn handle_update(&self, id: &str, value: &Fields) -> Result<(), CoreError> {
        let type_id = self.type_id_of(id).await?;
        let _guard = self.try_lock(&type_id, id)?;

        let configuration = value.get("configuration").filter(|v| !v.is_null());
        let event = value.get("event").filter(|v| !v.is_null());
        if configuration.is_none() && event.is_none() {
            return Err(CoreError::Validation {
                fields: ValidationErrors::default(),
                message: "Please specify either 'configuration' or/and 'event' field.".to_owned(),
            });
        }
        if let Some(configuration) = configuration {
            let configuration = configuration_value(Some(configuration))?;
            self.set_configuration(id, &type_id, configuration).await?;
        }
        if let Some(event) = event {
            self.apply_event(id, &type_id, event).await?;
        }
        Ok(())
    }

    async fn handle_set(&self, id: &str, field: &str, value: &Value) -> Result<(), CoreError> {
        if field != "configuration" && field != "event" {
            return Err(CoreError::validation(
                field,
                "not_allowed",
                format!("You cannot set the field {field}"),
            ));
        }
        let type_id = self.type_id_of(id).await?;
        let _guard = self.try_lock(&type_id, id)?;
        if field == "configuration" {
            let configuration = configuration_value(Some(value))?;
            self.set_configuration(id, &type_id, configuration).await
        } else {
            self.apply_event(id, &type_id, value).await?;
            self.directory
                .publish_attribute(KIND, id, "event", value.clone(), false)
                .await?;
            Ok(())
        }
    }

    async fn apply_event(&self, id: &str, type_id: &str, event: &Value) -> Result<(), CoreError> {
        let status = match event.as_str() {
            Some("start") => {
                if self.locks.is_group_locked(type_id) {
                    return Err(type_locked(type_id));
                }
                DesiredStatus::Started
            }
            Some("stop") => DesiredStatus::Stopped,
            _ => {
                return Err(CoreError::validation(
                    "event",
                    "not_allowed_value",
                    format!("Value {} is not allowed for the field event.", event_text(event)),
                ))
            }
        };
        self.publish_status(id, status).await?;
        let result = match status {
            DesiredStatus::Started => self.start_locked(id, type_id).await,
            DesiredStatus::Stopped => self.stop_locked(id).await,
        };
        if result.is_err() {
            if let Err(e) = self.check_status(id).await {
                warn!("failed to restore status of bridge {id}: {e}");
            }
        }
        result
    }

    async fn start_locked(&self, id: &str, type_id: &str) -> Result<(), CoreError> {
        if !self.registry.is_image_installed(type_id).await? {
            self.publish_stopped(id).await;
            return Err(CoreError::TypeNotInstalled(type_id.to_owned()));
        }
        self.check_state(id).await?;
        self.reconcile_locked(id).await.map(drop)
    }

    async fn stop_locked(&self, id: &str) -> Result<(), CoreError> {
        self.check_state(id).await?;
        self.reconcile_locked(id).await.map(drop)
    }

    /// Validate and apply a new configuration: stop, rewrite artifacts,
    /// publish, then converge again.
    async fn set_configuration(
        &self,
        id: &str,
        type_id: &str,
        configuration: Map<String, Value>,
    ) -> Result<(), CoreError> {
        let Some(descriptor) = self.registry.installed_descriptor(type_id)? else {
            return Err(CoreError::TypeNotInstalled(type_id.to_owned()));
        };
        self.validator
            .validate(&descriptor.configuration.fields, &configuration)?;

        self.converge_stopped(id, type_id).await?;
        self.materializer
            .materialize(&descriptor, id, &configuration)
            .await?;
        self.directory
            .publish_attribute(KIND, id, "configuration", Value::Object(configuration), true)
            .await?;
        info!("configuration of bridge {id} updated");

        self.check_state(id).await?;
        self.reconcile_locked(id).await.map(drop)
    }

    async fn handle_delete(&self, id: &str) -> Result<(), CoreError> {
        let type_id = self.type_id_of(id).await?;
        let _guard = self.try_lock(&type_id, id)?;
        self.delete_locked(id, &type_id).await
    }

    async fn delete_locked(&self, id: &str, type_id: &str) -> Result<(), CoreError> {
        info!("deleting bridge {id}");
        let name = self.container_name_for(id, type_id);
        if self
            .observed_state(id)
            .await?
            .is_some_and(ObservedState::is_up)
        {
            self.transition(id, ObservedState::Stopping).await?;
        }
        if let Err(e) = self.teardown(id, &name).await {
            self.settle_transient(id).await;
            return Err(e);
        }

        let shared = self
            .registry
            .naming_descriptor(type_id)
            .map(|d| shared_volumes(&d))
            .unwrap_or_default();
        self.remove_artifacts(id, &name, &shared).await?;
        match self.directory.delete_entity(KIND, id).await {
            Ok(()) | Err(BusError::NotFound { .. }) => {}
            Err(e) => return Err(e.into()),
        }
        self.detach(id);
        info!("bridge {id} deleted");
        Ok(())
    }

    /// Drop the configuration directory and the broker credential of an
    /// instance, and clear `shared` volumes.
    async fn remove_artifacts(
        &self,
        id: &str,
        name: &str,
        shared: &[String],
    ) -> Result<(), CoreError> {
        let principal = self
            .materializer
            .store()
            .read_env(name)
            .ok()
            .flatten()
            .and_then(|env| env.get(MQTT_USER).map(str::to_owned))
            .unwrap_or_else(|| id.to_owned());
        self.materializer.remove_configuration(name, shared);

        match self.credentials.unregister(&principal).await {
            Ok(()) => debug!("credential {principal} removed"),
            Err(CredentialError::NotFound(_)) => debug!("no credential {principal} to remove"),
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    /// Reconcile every attached instance, e.g. after the bus reconnected.
    pub async fn reconcile_all(&self) {
        for id in self.routes.attached() {
            if let Err(e) = self.reconcile(&id).await {
                warn!("reconcile of bridge {id} failed: {e}");
            }
        }
    }

    /// Ids of attached instances of `type_id`.
    async fn members_of(&self, type_id: &str) -> Result<Vec<String>, CoreError> {
        Ok(self
            .directory
            .entities(KIND)
            .await?
            .into_iter()
            .filter(|r| r.str_field("type") == Some(type_id) && self.routes.is_attached(&r.id))
            .map(|r| r.id)
            .collect())
    }

    /// Inventory containers and config directories, attach every instance
    /// entity, and record leftovers for [`Self::cleanup_leftovers`].
    pub async fn startup(&self) -> Result<(), CoreError> {
        self.inventory().await?;
        for record in self.directory.entities(KIND).await? {
            if let Err(e) = self.attach(&record.id).await {
                warn!("failed to attach bridge {}: {e}", record.id);
            }
        }
        info!("{} bridges attached", self.routes.attached().len());
        Ok(())
    }

    async fn inventory(&self) -> Result<(), CoreError> {
        let owners: HashMap<String, String> = self
            .directory
            .entities(KIND)
            .await?
            .into_iter()
            .filter_map(|r| r.str_field("type").map(|t| (r.id.clone(), t.to_owned())))
            .collect();
        let mut leftovers: BTreeMap<String, Leftovers> = BTreeMap::new();
        let mut found: HashMap<String, String> = HashMap::new();

        for info in self.context.runtime.list_containers().await? {
            let name = info.name.trim_start_matches('/').to_owned();
            let Some(parsed) = parse_container_name(&name) else {
                continue;
            };
            let owned = match (owners.get(&parsed.id), parsed.type_hint.as_deref()) {
                (Some(owner), Some(hint)) => owner == hint,
                (Some(_), None) => true,
                (None, _) => false,
            };
            if !owned {
                leftovers.entry(parsed.id).or_default().containers.push(name);
                continue;
            }
            if let Some(previous) = found.insert(parsed.id.clone(), name.clone()) {
                warn!("duplicate containers {previous} and {name} for bridge {}, removing {previous}", parsed.id);
                if let Err(e) = self.teardown(&parsed.id, &previous).await {
                    warn!("failed to remove duplicate {previous}: {e}");
                }
            }
        }
        for (id, name) in &found {
            if let Some(type_id) = owners.get(id) {
                self.remember_container(id, type_id, name);
            }
        }

        for dir in self.materializer.store().list_dirs()? {
            let Some(parsed) = parse_container_name(&dir) else {
                continue;
            };
            match (owners.get(&parsed.id), parsed.type_hint.as_deref()) {
                (Some(owner), Some(hint)) if owner != hint => {
                    warn!("config {dir} does not belong to bridge {} of type {owner}, removing", parsed.id);
                    self.materializer.remove_configuration(&dir, &[]);
                }
                (Some(_), _) => {}
                (None, _) => leftovers.entry(parsed.id).or_default().dirs.push(dir),
            }
        }

        if !leftovers.is_empty() {
            info!(
                "{} bridges have leftovers, removing them in {}s unless claimed",
                leftovers.len(),
                self.orphan_grace.as_secs()
            );
        }
        *self.leftovers() = leftovers;
        debug!("inventory found {} containers", found.len());
        Ok(())
    }

    /// Remove leftovers recorded at startup that no instance claims by now.
    /// Returns the number of artifacts removed.
    pub async fn cleanup_leftovers(&self) -> usize {
        let Some(_flight) = self.cleanup_flight.try_begin() else {
            return 0;
        };
        let leftovers = std::mem::take(&mut *self.leftovers());
        let mut removed = 0;
        for (id, found) in leftovers {
            let claimed = match self.directory.entity(KIND, &id).await {
                Ok(Some(record)) => type_of(&record).ok().map(|t| self.expected_name(&id, &t)),
                Ok(None) => None,
                Err(e) => {
                    warn!("cannot check bridge {id}, keeping its leftovers: {e}");
                    continue;
                }
            };
            let _guard = self.locks.acquire(&id).await;
            for container in found.containers.iter().filter(|c| claimed.as_ref() != Some(*c)) {
                match self.teardown(&id, container).await {
                    Ok(()) => removed += 1,
                    Err(e) => warn!("failed to remove leftover {container}: {e}"),
                }
            }
            for dir in found.dirs.iter().filter(|d| claimed.as_ref() != Some(*d)) {
                self.materializer.remove_configuration(dir, &[]);
                removed += 1;
            }
        }
        if removed > 0 {
            info!("removed {removed} leftover containers and directories");
        }
        removed
    }

    /// Run [`Self::cleanup_leftovers`] once the grace period has passed.
    pub fn schedule_cleanup(self: &Arc<Self>) -> JoinHandle<usize> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(this.orphan_grace).await;
            this.cleanup_leftovers().await
        })
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
                        warn!("bridge dispatcher lagged, {n} events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            debug!("bridge dispatcher stopped");
        })
    }
}

fn type_locked(type_id: &str) -> CoreError {
    CoreError::RaceCondition(format!(
        "Bridge type {type_id} is locked now, wait for the end of operation."
    ))
}

#[async_trait]
impl TypeMembers for BridgeInstanceManager {
    async fn lock_type(&self, type_id: &str) -> LockGuard {
        self.locks.acquire_group(type_id).await
    }

    async fn has_started_members(&self, type_id: &str) -> Result<bool, CoreError> {
        Ok(self.directory.entities(KIND).await?.iter().any(|r| {
            r.str_field("type") == Some(type_id) && r.str_field("status") == Some("started")
        }))
    }

    async fn stop_type_locked(&self, type_id: &str) {
        let members = match self.members_of(type_id).await {
            Ok(members) => members,
            Err(e) => {
                warn!("cannot list bridges of type {type_id}: {e}");
                return;
            }
        };
        for id in members {
            if let Err(e) = self.converge_stopped(&id, type_id).await {
                warn!("failed to stop bridge {id}: {e}");
            }
        }
    }

    async fn start_type_locked(&self, type_id: &str) {
        let members = match self.members_of(type_id).await {
            Ok(members) => members,
            Err(e) => {
                warn!("cannot list bridges of type {type_id}: {e}");
                return;
            }
        };
        for id in members {
            let result = match self.check_state(&id).await {
                Ok(()) => self.reconcile_locked(&id).await,
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                warn!("failed to bring bridge {id} back: {e}");
            }
        }
    }
}
