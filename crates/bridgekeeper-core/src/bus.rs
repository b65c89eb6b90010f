//! Entity directory and event bus seam.

use crate::{CoreError, ErrorPayload};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, error, warn};

pub type Fields = Map<String, Value>;

const EVENT_BUFFER: usize = 256;

/// Entries kept per recorded log of a [`MemoryDirectory`].
pub const HISTORY_LIMIT: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EntityKind {
    BridgeType,
    Bridge,
}

impl EntityKind {
    /// Topic segment entities of this kind live under.
    pub fn root_topic(self) -> &'static str {
        match self {
            EntityKind::BridgeType => "bridge-types",
            EntityKind::Bridge => "bridges",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.root_topic())
    }
}

/// `errors/<kind-root>/<id>/<op>`
pub fn error_topic(kind: EntityKind, id: &str, op: &str) -> String {
    format!("errors/{}/{id}/{op}", kind.root_topic())
}

#[derive(Debug, Clone, PartialEq)]
pub enum EntityEvent {
    /// Request to create an entity that does not exist yet.
    Create { id: String, value: Fields },
    Update { id: String, value: Fields },
    Delete { id: String },
    /// Request to set one attribute.
    Set {
        id: String,
        field: String,
        value: Value,
    },
    /// An entity appeared in the directory without a create request.
    NewEntity { id: String },
    /// The bus connection was re-established.
    Reconnected,
}

impl EntityEvent {
    pub fn id(&self) -> Option<&str> {
        match self {
            EntityEvent::Create { id, .. }
            | EntityEvent::Update { id, .. }
            | EntityEvent::Delete { id }
            | EntityEvent::Set { id, .. }
            | EntityEvent::NewEntity { id } => Some(id),
            EntityEvent::Reconnected => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EntityRecord {
    pub id: String,
    pub fields: Fields,
}

impl EntityRecord {
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    pub fn str_field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(Value::as_str)
    }
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("{kind} entity '{id}' not found")]
    NotFound { kind: EntityKind, id: String },
    #[error("{kind} entity '{id}' already exists")]
    Exists { kind: EntityKind, id: String },
    #[error("publish failed: {0}")]
    Publish(String),
}

#[async_trait]
pub trait EntityDirectory: Send + Sync {
    /// Events for one entity kind. Each call returns an independent receiver.
    fn subscribe(&self, kind: EntityKind) -> broadcast::Receiver<EntityEvent>;

    async fn entities(&self, kind: EntityKind) -> Result<Vec<EntityRecord>, BusError>;

    async fn entity(&self, kind: EntityKind, id: &str) -> Result<Option<EntityRecord>, BusError>;

    /// Create the entity with its initial attributes.
    async fn attach_entity(
        &self,
        kind: EntityKind,
        id: &str,
        fields: Fields,
    ) -> Result<EntityRecord, BusError>;

    async fn delete_entity(&self, kind: EntityKind, id: &str) -> Result<(), BusError>;

    /// Merge `fields` into the entity's attributes.
    async fn publish(
        &self,
        kind: EntityKind,
        id: &str,
        fields: Fields,
        retained: bool,
    ) -> Result<(), BusError>;

    async fn publish_attribute(
        &self,
        kind: EntityKind,
        id: &str,
        name: &str,
        value: Value,
        retained: bool,
    ) -> Result<(), BusError> {
        let mut fields = Fields::new();
        fields.insert(name.to_owned(), value);
        self.publish(kind, id, fields, retained).await
    }

    /// Attach an error to one attribute of an entity.
    async fn publish_entity_error(
        &self,
        kind: EntityKind,
        id: &str,
        field: &str,
        error: &ErrorPayload,
    ) -> Result<(), BusError>;

    async fn publish_to_broker(
        &self,
        topic: &str,
        payload: &str,
        retain: bool,
    ) -> Result<(), BusError>;
}

fn log_rejection(kind: EntityKind, id: &str, op: &str, err: &CoreError) {
    if err.is_internal() {
        error!("{kind} {id} {op} failed: {err}");
    } else {
        warn!("{kind} {id} {op} rejected: {err}");
    }
}

/// Publish a rejected request's error to `errors/<kind-root>/<id>/<op>`.
/// Delivery failures are logged and dropped.
pub async fn report_error(
    directory: &dyn EntityDirectory,
    kind: EntityKind,
    id: &str,
    op: &str,
    err: &CoreError,
) {
    log_rejection(kind, id, op, err);
    let body = match serde_json::to_string(&err.to_payload()) {
        Ok(body) => body,
        Err(e) => {
            warn!("cannot encode error payload for {kind} {id}: {e}");
            return;
        }
    };
    if let Err(e) = directory
        .publish_to_broker(&error_topic(kind, id, op), &body, false)
        .await
    {
        warn!("cannot publish error for {kind} {id}: {e}");
    }
}

/// Attach a rejected request's error to one attribute of the entity.
pub async fn report_entity_error(
    directory: &dyn EntityDirectory,
    kind: EntityKind,
    id: &str,
    field: &str,
    err: &CoreError,
) {
    log_rejection(kind, id, field, err);
    if let Err(e) = directory
        .publish_entity_error(kind, id, field, &err.to_payload())
        .await
    {
        warn!("cannot publish {field} error for {kind} {id}: {e}");
    }
}

/// Which entities currently have handlers attached.
///
/// Each manager routes per-entity events only to ids present here.
#[derive(Debug, Clone, Default)]
pub struct RoutingTable {
    ids: Arc<Mutex<HashSet<String>>>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn ids(&self) -> MutexGuard<'_, HashSet<String>> {
        self.ids
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// `None` when `id` is already routed.
    pub fn attach(&self, id: &str) -> Option<Subscription> {
        if !self.ids().insert(id.to_owned()) {
            return None;
        }
        Some(Subscription {
            table: self.clone(),
            id: id.to_owned(),
            detached: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn is_attached(&self, id: &str) -> bool {
        self.ids().contains(id)
    }

    pub fn detach(&self, id: &str) -> bool {
        self.ids().remove(id)
    }

    pub fn attached(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.ids().iter().cloned().collect();
        ids.sort();
        ids
    }
}

/// Handle for one entity's routing. `detach` may be called any number of times.
#[derive(Debug, Clone)]
pub struct Subscription {
    table: RoutingTable,
    id: String,
    detached: Arc<AtomicBool>,
}

impl Subscription {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn detach(&self) {
        if !self.detached.swap(true, Ordering::SeqCst) {
            self.table.detach(&self.id);
        }
    }

    pub fn is_detached(&self) -> bool {
        self.detached.load(Ordering::SeqCst) || !self.table.is_attached(&self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerMessage {
    pub topic: String,
    pub payload: String,
    pub retain: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Publication {
    pub kind: EntityKind,
    pub id: String,
    pub fields: Fields,
    pub retained: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EntityErrorRecord {
    pub kind: EntityKind,
    pub id: String,
    pub field: String,
    pub error: ErrorPayload,
}

#[derive(Default)]
struct DirectoryState {
    entities: BTreeMap<(EntityKind, String), Fields>,
    publications: VecDeque<Publication>,
    broker: VecDeque<BrokerMessage>,
    entity_errors: VecDeque<EntityErrorRecord>,
    failing_attach: Option<String>,
}

fn record<T>(log: &mut VecDeque<T>, limit: usize, entry: T) {
    if limit == 0 {
        return;
    }
    while log.len() >= limit {
        log.pop_front();
    }
    log.push_back(entry);
}

/// In-memory directory. The latest publications, broker messages and entity
/// errors are recorded for inspection, up to a fixed number of each.
pub struct MemoryDirectory {
    state: Mutex<DirectoryState>,
    senders: HashMap<EntityKind, broadcast::Sender<EntityEvent>>,
    history_limit: usize,
}

impl Default for MemoryDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::with_history_limit(HISTORY_LIMIT)
    }

    /// Keep at most `limit` entries per recorded log. Zero disables recording.
    pub fn with_history_limit(limit: usize) -> Self {
        let senders = [EntityKind::BridgeType, EntityKind::Bridge]
            .into_iter()
            .map(|k| (k, broadcast::channel(EVENT_BUFFER).0))
            .collect();
        Self {
            state: Mutex::new(DirectoryState::default()),
            senders,
            history_limit: limit,
        }
    }

    fn state(&self) -> MutexGuard<'_, DirectoryState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Deliver an event to subscribers of `kind`. Returns the receiver count.
    pub fn emit(&self, kind: EntityKind, event: EntityEvent) -> usize {
        debug!("emit {kind} {event:?}");
        self.senders
            .get(&kind)
            .and_then(|tx| tx.send(event).ok())
            .unwrap_or(0)
    }

    /// Insert an entity as if another process had created it, and announce it.
    pub fn insert_external(&self, kind: EntityKind, id: &str, fields: Fields) {
        self.state()
            .entities
            .insert((kind, id.to_owned()), fields);
        self.emit(kind, EntityEvent::NewEntity { id: id.to_owned() });
    }

    /// Insert an entity silently, e.g. one that existed before startup.
    pub fn seed(&self, kind: EntityKind, id: &str, fields: Fields) {
        self.state()
            .entities
            .insert((kind, id.to_owned()), fields);
    }

    pub fn attribute(&self, kind: EntityKind, id: &str, name: &str) -> Option<Value> {
        self.state()
            .entities
            .get(&(kind, id.to_owned()))
            .and_then(|f| f.get(name).cloned())
    }

    pub fn contains(&self, kind: EntityKind, id: &str) -> bool {
        self.state().entities.contains_key(&(kind, id.to_owned()))
    }

    /// Make the next `attach_entity` fail with a publish error.
    pub fn fail_next_attach(&self, reason: &str) {
        self.state().failing_attach = Some(reason.to_owned());
    }

    pub fn publications(&self) -> Vec<Publication> {
        self.state().publications.iter().cloned().collect()
    }

    /// Every value `name` was published with for one entity, oldest first.
    pub fn attribute_history(&self, kind: EntityKind, id: &str, name: &str) -> Vec<Value> {
        self.state()
            .publications
            .iter()
            .filter(|p| p.kind == kind && p.id == id)
            .filter_map(|p| p.fields.get(name).cloned())
            .collect()
    }

    pub fn broker_messages(&self) -> Vec<BrokerMessage> {
        self.state().broker.iter().cloned().collect()
    }

    pub fn entity_errors(&self) -> Vec<EntityErrorRecord> {
        self.state().entity_errors.iter().cloned().collect()
    }

    /// Poll until `check` holds or `timeout` elapses.
    pub async fn wait_until<F>(&self, timeout: Duration, check: F) -> bool
    where
        F: Fn(&Self) -> bool,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if check(self) {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

#[async_trait]
impl EntityDirectory for MemoryDirectory {
    fn subscribe(&self, kind: EntityKind) -> broadcast::Receiver<EntityEvent> {
        match self.senders.get(&kind) {
            Some(tx) => tx.subscribe(),
            None => broadcast::channel(1).1,
        }
    }

    async fn entities(&self, kind: EntityKind) -> Result<Vec<EntityRecord>, BusError> {
        Ok(self
            .state()
            .entities
            .iter()
            .filter(|((k, _), _)| *k == kind)
            .map(|((_, id), fields)| EntityRecord {
                id: id.clone(),
                fields: fields.clone(),
            })
            .collect())
    }

    async fn entity(&self, kind: EntityKind, id: &str) -> Result<Option<EntityRecord>, BusError> {
        Ok(self
            .state()
            .entities
            .get(&(kind, id.to_owned()))
            .map(|fields| EntityRecord {
                id: id.to_owned(),
                fields: fields.clone(),
            }))
    }

    async fn attach_entity(
        &self,
        kind: EntityKind,
        id: &str,
        fields: Fields,
    ) -> Result<EntityRecord, BusError> {
        let mut state = self.state();
        if let Some(reason) = state.failing_attach.take() {
            return Err(BusError::Publish(reason));
        }
        let key = (kind, id.to_owned());
        if state.entities.contains_key(&key) {
            return Err(BusError::Exists {
                kind,
                id: id.to_owned(),
            });
        }
        state.entities.insert(key, fields.clone());
        record(
            &mut state.publications,
            self.history_limit,
            Publication {
                kind,
                id: id.to_owned(),
                fields: fields.clone(),
                retained: true,
            },
        );
        Ok(EntityRecord {
            id: id.to_owned(),
            fields,
        })
    }

    async fn delete_entity(&self, kind: EntityKind, id: &str) -> Result<(), BusError> {
        match self.state().entities.remove(&(kind, id.to_owned())) {
            Some(_) => Ok(()),
            None => Err(BusError::NotFound {
                kind,
                id: id.to_owned(),
            }),
        }
    }

    async fn publish(
        &self,
        kind: EntityKind,
        id: &str,
        fields: Fields,
        retained: bool,
    ) -> Result<(), BusError> {
        let mut state = self.state();
        let Some(entity) = state.entities.get_mut(&(kind, id.to_owned())) else {
            return Err(BusError::NotFound {
                kind,
                id: id.to_owned(),
            });
        };
        for (k, v) in &fields {
            entity.insert(k.clone(), v.clone());
        }
        record(
            &mut state.publications,
            self.history_limit,
            Publication {
                kind,
                id: id.to_owned(),
                fields,
                retained,
            },
        );
        Ok(())
    }

    async fn publish_entity_error(
        &self,
        kind: EntityKind,
        id: &str,
        field: &str,
        error: &ErrorPayload,
    ) -> Result<(), BusError> {
        record(
            &mut self.state().entity_errors,
            self.history_limit,
            EntityErrorRecord {
                kind,
                id: id.to_owned(),
                field: field.to_owned(),
                error: error.clone(),
            },
        );
        Ok(())
    }

    async fn publish_to_broker(
        &self,
        topic: &str,
        payload: &str,
        retain: bool,
    ) -> Result<(), BusError> {
        record(
            &mut self.state().broker,
            self.history_limit,
            BrokerMessage {
                topic: topic.to_owned(),
                payload: payload.to_owned(),
                retain,
            },
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(v: Value) -> Fields {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn error_topic_layout() {
        assert_eq!(
            error_topic(EntityKind::Bridge, "b1", "create"),
            "errors/bridges/b1/create"
        );
        assert_eq!(
            error_topic(EntityKind::BridgeType, "zigbee", "update"),
            "errors/bridge-types/zigbee/update"
        );
    }

    #[tokio::test]
    async fn publish_merges_attributes() {
        let dir = MemoryDirectory::new();
        dir.attach_entity(EntityKind::Bridge, "b1", fields(json!({"state": "stopped", "type": "t"})))
            .await
            .unwrap();
        dir.publish_attribute(EntityKind::Bridge, "b1", "state", json!("starting"), false)
            .await
            .unwrap();
        let e = dir.entity(EntityKind::Bridge, "b1").await.unwrap().unwrap();
        assert_eq!(e.str_field("state"), Some("starting"));
        assert_eq!(e.str_field("type"), Some("t"));
        assert_eq!(
            dir.attribute_history(EntityKind::Bridge, "b1", "state"),
            vec![json!("stopped"), json!("starting")]
        );
    }

    #[tokio::test]
    async fn recorded_history_is_bounded() {
        let dir = MemoryDirectory::with_history_limit(8);
        dir.attach_entity(EntityKind::Bridge, "b1", fields(json!({"state": "stopped"})))
            .await
            .unwrap();
        for n in 0..100 {
            dir.publish_attribute(EntityKind::Bridge, "b1", "n", json!(n), false)
                .await
                .unwrap();
            dir.publish_to_broker("errors/bridges/b1/update", &n.to_string(), false)
                .await
                .unwrap();
        }
        assert_eq!(dir.publications().len(), 8);
        assert_eq!(dir.broker_messages().len(), 8);
        let history = dir.attribute_history(EntityKind::Bridge, "b1", "n");
        assert_eq!(history.first(), Some(&json!(92)));
        assert_eq!(history.last(), Some(&json!(99)));
        assert_eq!(dir.attribute(EntityKind::Bridge, "b1", "state"), Some(json!("stopped")));

        let silent = MemoryDirectory::with_history_limit(0);
        silent
            .attach_entity(EntityKind::Bridge, "b1", fields(json!({})))
            .await
            .unwrap();
        assert!(silent.publications().is_empty());
        assert!(silent.contains(EntityKind::Bridge, "b1"));
    }

    #[tokio::test]
    async fn injected_attach_failure_applies_once() {
        let dir = MemoryDirectory::new();
        dir.fail_next_attach("broker offline");
        let err = dir
            .attach_entity(EntityKind::Bridge, "b1", fields(json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::Publish(_)), "{err}");
        assert!(!dir.contains(EntityKind::Bridge, "b1"));
        dir.attach_entity(EntityKind::Bridge, "b1", fields(json!({})))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn publish_to_missing_entity_fails() {
        let dir = MemoryDirectory::new();
        let err = dir
            .publish_attribute(EntityKind::Bridge, "nope", "state", json!("x"), false)
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::NotFound { .. }));
    }

    #[tokio::test]
    async fn attach_twice_fails() {
        let dir = MemoryDirectory::new();
        dir.attach_entity(EntityKind::Bridge, "b1", Fields::new()).await.unwrap();
        assert!(dir
            .attach_entity(EntityKind::Bridge, "b1", Fields::new())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn subscribers_receive_events_per_kind() {
        let dir = MemoryDirectory::new();
        let mut bridges = dir.subscribe(EntityKind::Bridge);
        let mut types = dir.subscribe(EntityKind::BridgeType);
        dir.emit(EntityKind::Bridge, EntityEvent::Delete { id: "b1".to_owned() });
        assert_eq!(
            bridges.recv().await.unwrap(),
            EntityEvent::Delete { id: "b1".to_owned() }
        );
        assert!(types.try_recv().is_err());
    }

    #[test]
    fn subscription_detach_is_idempotent() {
        let routes = RoutingTable::new();
        let sub = routes.attach("b1").unwrap();
        assert!(routes.attach("b1").is_none());
        sub.detach();
        sub.detach();
        assert!(sub.is_detached());
        assert!(!routes.is_attached("b1"));
        // A later attachment is not undone by the stale handle.
        let again = routes.attach("b1").unwrap();
        sub.detach();
        assert!(!again.is_detached());
    }
}
