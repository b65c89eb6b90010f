//! Integration tests for the reconciliation core against the mock runtime,
//! the in-memory directory and a static catalog.

use bridgekeeper_core::bus::{EntityDirectory, EntityEvent, EntityKind, Fields, MemoryDirectory};
use bridgekeeper_core::config::{RuntimeConfig, RuntimeContext};
use bridgekeeper_core::materialize::Materializer;
use bridgekeeper_core::{
    BridgeInstanceManager, BridgeTypeRegistry, CoreError, CredentialService, InstanceDeps,
    MemoryCredentials, ReconcileOutcome, RegistryDeps, ResourceLock, TypeMembers,
};
use bridgekeeper_remote::{CatalogClient, StaticCatalog};
use bridgekeeper_runtime::{ContainerRuntime, MockFailure, MockOp, MockRuntime};
use bridgekeeper_schema::{BridgeTypeDescriptor, RuleValidator};
use bridgekeeper_store::{HostLayout, InstanceStore, StoreLayout, TypeStore};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const TYPE: &str = "zigbee";
const IMAGE: &str = "registry.example.com/bridges/zigbee:market";
const CONTAINER: &str = "bridge-zigbee-b1";
const PROXY: &str = "bridgekeeper-proxy";
const WAIT: Duration = Duration::from_secs(5);

struct Harness {
    _dir: TempDir,
    layout: StoreLayout,
    runtime: Arc<MockRuntime>,
    directory: Arc<MemoryDirectory>,
    credentials: Arc<MemoryCredentials>,
    catalog: Arc<StaticCatalog>,
    registry: Arc<BridgeTypeRegistry>,
    instances: Arc<BridgeInstanceManager>,
}

async fn harness() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let layout = StoreLayout::new(dir.path().join("data"));
    layout.initialize().unwrap();

    let runtime = Arc::new(MockRuntime::new());
    let directory = Arc::new(MemoryDirectory::new());
    let credentials = Arc::new(MemoryCredentials::new());
    let catalog = Arc::new(StaticCatalog::new());

    let rt: Arc<dyn ContainerRuntime> = runtime.clone();
    let dir_dyn: Arc<dyn EntityDirectory> = directory.clone();
    let creds_dyn: Arc<dyn CredentialService> = credentials.clone();
    let catalog_dyn: Arc<dyn CatalogClient> = catalog.clone();

    let runtime_config = RuntimeConfig {
        backend: "mock".to_owned(),
        default_network: Some("bk_default".to_owned()),
        compose_project: Some("bk".to_owned()),
        ..RuntimeConfig::default()
    };
    let context = RuntimeContext::resolve(Arc::clone(&rt), &runtime_config).await;

    let registry = BridgeTypeRegistry::new(RegistryDeps {
        store: TypeStore::new(layout.clone()),
        runtime: Arc::clone(&rt),
        catalog: Some(catalog_dyn),
        directory: Arc::clone(&dir_dyn),
        channel_tag: "market".to_owned(),
        auth: None,
    });
    let materializer = Materializer::new(
        Arc::new(InstanceStore::new(layout.clone())),
        Arc::clone(&creds_dyn),
        "mqtt://mqtt:1883",
        "mqtt://localhost:1883",
    );
    let instances = BridgeInstanceManager::new(InstanceDeps {
        context,
        host: HostLayout::new(dir.path().join("host")),
        registry: Arc::clone(&registry),
        materializer,
        credentials: creds_dyn,
        directory: dir_dyn,
        validator: Arc::new(RuleValidator),
        orphan_grace: Duration::ZERO,
    });
    let members: Arc<dyn TypeMembers> = instances.clone();
    registry.bind_members(Arc::downgrade(&members));

    Harness {
        _dir: dir,
        layout,
        runtime,
        directory,
        credentials,
        catalog,
        registry,
        instances,
    }
}

fn descriptor(version: &str) -> BridgeTypeDescriptor {
    serde_json::from_value(json!({
        "type": TYPE,
        "title": "Zigbee",
        "registry": "registry.example.com/bridges/zigbee",
        "version": version,
        "configuration": {
            "fields": [
                {"name": "DEVICE", "type": "string"},
                {"name": "PORT", "type": "integer"},
                {"name": "MAPPING", "type": "json"},
                {"name": "SCRIPT", "type": "javascript"}
            ],
            "streamEvents": {"configChanged": "reloadNginx"}
        }
    }))
    .unwrap()
}

fn fields(value: Value) -> Fields {
    value.as_object().cloned().unwrap()
}

fn configuration() -> Map<String, Value> {
    fields(json!({
        "DEVICE": "/dev/ttyUSB0",
        "PORT": 8080,
        "MAPPING": {"lamp": [1, 2]},
        "SCRIPT": "module.exports = () => 1;"
    }))
}

impl Harness {
    /// Installed record plus its image.
    async fn install_type(&self, version: &str) {
        self.registry
            .store()
            .write_local(TYPE, &descriptor(version))
            .unwrap();
        self.runtime.add_image(IMAGE);
        self.registry.sync_type(TYPE).await.unwrap();
    }

    fn seed_bridge(&self, id: &str, status: &str) {
        self.directory.seed(
            EntityKind::Bridge,
            id,
            fields(json!({
                "type": TYPE,
                "status": status,
                "state": "stopped",
                "configuration": configuration()
            })),
        );
    }

    fn bridge_attr(&self, id: &str, name: &str) -> Option<Value> {
        self.directory.attribute(EntityKind::Bridge, id, name)
    }

    fn type_attr(&self, name: &str) -> Option<Value> {
        self.directory.attribute(EntityKind::BridgeType, TYPE, name)
    }

    async fn set_status(&self, id: &str, status: &str) {
        self.directory
            .publish(
                EntityKind::Bridge,
                id,
                fields(json!({ "status": status })),
                true,
            )
            .await
            .unwrap();
    }

    fn error_on(&self, topic: &str) -> Option<Value> {
        self.directory
            .broker_messages()
            .into_iter()
            .rev()
            .find(|m| m.topic == topic)
            .map(|m| serde_json::from_str(&m.payload).unwrap())
    }
}

async fn eventually(check: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}

// --- Locks ---

#[tokio::test]
async fn with_lock_releases_after_success_and_failure() {
    let locks = ResourceLock::new();

    let ok: Result<u32, String> = locks.with_lock("b1", async { Ok(7) }).await;
    assert_eq!(ok.unwrap(), 7);
    assert!(!locks.is_held("b1"));

    let failed: Result<u32, String> = locks
        .with_lock("b1", async { Err("boom".to_owned()) })
        .await;
    assert!(failed.is_err());
    assert!(!locks.is_held("b1"));
    assert!(locks.try_acquire("b1").is_some());
}

#[tokio::test]
async fn reconcile_is_deferred_while_the_type_is_locked() {
    let h = harness().await;
    h.install_type("1.0").await;
    h.seed_bridge("b1", "stopped");
    assert!(h.instances.attach("b1").await.unwrap());

    let group = h.instances.locks().acquire_group(TYPE).await;
    assert_eq!(
        h.instances.reconcile("b1").await.unwrap(),
        ReconcileOutcome::Deferred
    );
    drop(group);
    assert_eq!(
        h.instances.reconcile("b1").await.unwrap(),
        ReconcileOutcome::Stopped
    );
}

// --- Reconciliation ---

#[tokio::test]
async fn reconcile_brings_state_in_line_with_status() {
    let h = harness().await;
    h.install_type("1.0").await;
    h.seed_bridge("b1", "started");

    assert!(h.instances.attach("b1").await.unwrap());
    assert!(h.runtime.is_running(CONTAINER));
    assert_eq!(h.bridge_attr("b1", "state"), Some(json!("started")));

    h.set_status("b1", "stopped").await;
    assert_eq!(
        h.instances.reconcile("b1").await.unwrap(),
        ReconcileOutcome::Stopped
    );
    assert!(h.runtime.container_names().is_empty());
    assert_eq!(h.bridge_attr("b1", "state"), Some(json!("stopped")));

    h.set_status("b1", "started").await;
    assert_eq!(
        h.instances.reconcile("b1").await.unwrap(),
        ReconcileOutcome::Started
    );
    assert!(h.runtime.is_running(CONTAINER));
    assert_eq!(h.bridge_attr("b1", "state"), Some(json!("started")));
}

#[tokio::test]
async fn attach_is_idempotent() {
    let h = harness().await;
    h.install_type("1.0").await;
    h.seed_bridge("b1", "started");

    assert!(h.instances.attach("b1").await.unwrap());
    assert!(!h.instances.attach("b1").await.unwrap());
    assert_eq!(h.runtime.count_calls(MockOp::Create), 1);
    assert_eq!(h.instances.instance_ids(), vec!["b1".to_owned()]);
}

#[tokio::test]
async fn configuration_is_unchanged_right_after_materializing() {
    let h = harness().await;
    h.install_type("1.0").await;
    h.seed_bridge("b1", "stopped");

    h.instances.materialize_configuration("b1").await.unwrap();
    assert!(!h
        .instances
        .configuration_changed("b1", &configuration())
        .await
        .unwrap());

    for (field, value) in [
        ("DEVICE", json!("/dev/ttyACM0")),
        ("PORT", json!(8081)),
        ("MAPPING", json!({"lamp": [3]})),
        ("SCRIPT", json!("module.exports = () => 2;")),
    ] {
        let mut changed = configuration();
        changed.insert(field.to_owned(), value);
        assert!(
            h.instances.configuration_changed("b1", &changed).await.unwrap(),
            "{field} change not detected"
        );
    }

    let dir = h.layout.instance_dir(CONTAINER);
    assert!(dir.join(".env").is_file());
    assert!(dir.join("MAPPING.json").is_file());
    assert!(dir.join("SCRIPT.js").is_file());
}

#[tokio::test]
async fn blank_values_remove_materialized_files() {
    let h = harness().await;
    h.install_type("1.0").await;
    h.seed_bridge("b1", "stopped");
    h.instances.materialize_configuration("b1").await.unwrap();
    assert!(h.layout.instance_dir(CONTAINER).join("MAPPING.json").is_file());

    let blank = fields(json!({"DEVICE": "/dev/ttyUSB0", "MAPPING": null, "SCRIPT": ""}));
    h.directory
        .publish(
            EntityKind::Bridge,
            "b1",
            fields(json!({ "configuration": blank })),
            true,
        )
        .await
        .unwrap();
    h.instances.materialize_configuration("b1").await.unwrap();

    let dir = h.layout.instance_dir(CONTAINER);
    assert!(!dir.join("MAPPING.json").exists());
    assert!(!dir.join("SCRIPT.js").exists());
    assert!(!h.instances.configuration_changed("b1", &blank).await.unwrap());
}

// --- Type operations ---

#[tokio::test]
async fn concurrent_pull_and_remove_race() {
    let h = harness().await;
    h.install_type("1.0").await;
    h.registry
        .store()
        .stage(TYPE, &descriptor("2.0"), None)
        .unwrap();
    h.runtime
        .publish_remote("registry.example.com/bridges/zigbee:2.0");

    let pull = h.registry.begin_pull(TYPE).unwrap();

    let err = h.registry.remove(TYPE).await.unwrap_err();
    assert!(matches!(err, CoreError::RaceCondition(_)), "{err}");
    assert!(matches!(
        h.registry.begin_pull(TYPE),
        Err(CoreError::RaceCondition(_))
    ));
    // The refused calls left the records alone.
    let record = h.registry.record(TYPE).unwrap();
    assert_eq!(record.local.unwrap().version.as_deref(), Some("1.0"));
    assert_eq!(record.pending.unwrap().version.as_deref(), Some("2.0"));

    pull.await.unwrap().unwrap();
    let record = h.registry.record(TYPE).unwrap();
    assert_eq!(record.local.unwrap().version.as_deref(), Some("2.0"));
    assert!(record.pending.is_none());
}

#[tokio::test]
async fn remove_is_refused_while_an_instance_is_started() {
    let h = harness().await;
    h.install_type("1.0").await;
    h.seed_bridge("b1", "started");
    h.instances.attach("b1").await.unwrap();

    let err = h.registry.remove(TYPE).await.unwrap_err();
    assert!(matches!(err, CoreError::RaceCondition(_)), "{err}");
    assert!(h.runtime.has_image(IMAGE));

    h.set_status("b1", "stopped").await;
    h.instances.reconcile("b1").await.unwrap();
    h.registry.remove(TYPE).await.unwrap();
    assert!(!h.runtime.has_image(IMAGE));
    assert!(h.registry.installed_descriptor(TYPE).unwrap().is_none());
    // Nothing was staged, so the type is forgotten.
    assert!(h.registry.record(TYPE).unwrap().is_empty());
    assert!(!h.directory.contains(EntityKind::BridgeType, TYPE));
    assert!(!h.layout.type_dir(TYPE).exists());
}

#[tokio::test]
async fn remove_keeps_a_staged_update_available() {
    let h = harness().await;
    h.install_type("1.0").await;
    h.registry
        .store()
        .stage(TYPE, &descriptor("2.0"), None)
        .unwrap();

    h.registry.remove(TYPE).await.unwrap();
    let record = h.registry.record(TYPE).unwrap();
    assert!(record.local.is_none());
    assert_eq!(record.pending.unwrap().version.as_deref(), Some("2.0"));
    assert_eq!(h.type_attr("status"), Some(json!("removed")));
    assert_eq!(
        h.type_attr("version").unwrap()["updateAvailable"],
        json!(true)
    );
}

#[tokio::test]
async fn failed_image_removal_resyncs_the_type() {
    let h = harness().await;
    h.install_type("1.0").await;
    h.registry
        .store()
        .stage(TYPE, &descriptor("2.0"), None)
        .unwrap();
    h.runtime
        .fail_next(MockOp::RemoveImage, MockFailure::Failed("image in use".to_owned()));

    let err = h.registry.remove(TYPE).await.unwrap_err();
    assert!(matches!(err, CoreError::Runtime(_)), "{err}");
    // The record was already dropped; the entity follows the disk again.
    assert!(h.registry.installed_descriptor(TYPE).unwrap().is_none());
    assert_eq!(h.type_attr("status"), Some(json!("removed")));
    assert_eq!(
        h.type_attr("version").unwrap()["updateAvailable"],
        json!(true)
    );
    assert!(h.runtime.has_image(IMAGE));
    assert!(h
        .directory
        .attribute_history(EntityKind::BridgeType, TYPE, "state")
        .contains(&json!("removing")));
}

#[tokio::test]
async fn failed_tag_keeps_the_installed_version() {
    let h = harness().await;
    h.install_type("1.0").await;
    h.seed_bridge("b1", "started");
    h.instances.attach("b1").await.unwrap();
    h.registry
        .store()
        .stage(TYPE, &descriptor("2.0"), None)
        .unwrap();
    h.runtime
        .publish_remote("registry.example.com/bridges/zigbee:2.0");
    h.runtime
        .fail_next(MockOp::Tag, MockFailure::Failed("disk full".to_owned()));

    let err = h.registry.pull(TYPE).await.unwrap_err();
    assert!(matches!(err, CoreError::Runtime(_)), "{err}");

    let record = h.registry.record(TYPE).unwrap();
    assert_eq!(record.local.unwrap().version.as_deref(), Some("1.0"));
    assert_eq!(record.pending.unwrap().version.as_deref(), Some("2.0"));
    assert_eq!(h.type_attr("status"), Some(json!("pulled")));
    let version = h.type_attr("version").unwrap();
    assert_eq!(version["updateAvailable"], json!(true));
    assert_eq!(version["updated"], json!(false));
    assert_eq!(version["updateError"]["code"], json!("CONNECTION_ERROR"));

    // The member came back on the old image.
    assert!(h.runtime.is_running(CONTAINER));
    assert_eq!(h.bridge_attr("b1", "state"), Some(json!("started")));
    assert_eq!(h.runtime.count_calls(MockOp::Create), 2);
}

#[tokio::test]
async fn pull_stops_members_before_the_image_changes() {
    let h = harness().await;
    h.install_type("1.0").await;
    h.seed_bridge("b1", "started");
    h.instances.attach("b1").await.unwrap();
    h.registry
        .store()
        .stage(TYPE, &descriptor("2.0"), None)
        .unwrap();
    h.runtime
        .publish_remote("registry.example.com/bridges/zigbee:2.0");

    h.registry.pull(TYPE).await.unwrap();

    let calls = h.runtime.calls();
    let position = |call: &str| {
        calls
            .iter()
            .position(|c| c == call)
            .unwrap_or_else(|| panic!("{call} missing from {calls:?}"))
    };
    let stopped = position(&format!("Stop {CONTAINER}"));
    let pulled = position("Pull registry.example.com/bridges/zigbee:2.0");
    let tagged = position("Tag registry.example.com/bridges/zigbee:2.0");
    let recreated = calls
        .iter()
        .rposition(|c| *c == format!("Create {CONTAINER}"))
        .unwrap();
    assert!(stopped < pulled, "{calls:?}");
    assert!(tagged < recreated, "{calls:?}");

    assert!(h.runtime.is_running(CONTAINER));
    assert_eq!(h.runtime.container_spec(CONTAINER).unwrap().image, IMAGE);
    assert_eq!(h.bridge_attr("b1", "state"), Some(json!("started")));
    assert_eq!(
        h.registry.installed_descriptor(TYPE).unwrap().unwrap().version.as_deref(),
        Some("2.0")
    );
}

#[tokio::test]
async fn pull_of_a_missing_repository_reports_not_found() {
    let h = harness().await;
    h.catalog.publish(descriptor("3.0"));
    h.registry.poll_catalog().await.unwrap();
    assert_eq!(h.type_attr("status"), Some(json!("removed")));

    let err = h.registry.pull(TYPE).await.unwrap_err();
    assert!(matches!(err, CoreError::NotFound(_)), "{err}");
    let version = h.type_attr("version").unwrap();
    assert_eq!(version["updateAvailable"], json!(true));
    assert_eq!(version["updateError"]["code"], json!("CONNECTION_ERROR"));
}

#[tokio::test]
async fn type_entities_reject_create_and_delete() {
    let h = harness().await;
    h.install_type("1.0").await;

    h.registry
        .handle_event(EntityEvent::Delete { id: TYPE.to_owned() })
        .await;
    let payload = h.error_on("errors/bridge-types/zigbee/delete").unwrap();
    assert_eq!(payload["message"], json!("operation is not permitted"));
    assert!(h.directory.contains(EntityKind::BridgeType, TYPE));

    h.registry
        .handle_event(EntityEvent::Update {
            id: TYPE.to_owned(),
            value: Fields::new(),
        })
        .await;
    let payload = h.error_on("errors/bridge-types/zigbee/update").unwrap();
    assert_eq!(payload["code"], json!("VALIDATION"));
    assert_eq!(payload["fields"]["event"], json!("required"));
}

// --- Scenarios ---

#[tokio::test]
async fn scenario_a_start_without_installed_type() {
    let h = harness().await;
    h.registry
        .store()
        .write_local(TYPE, &descriptor("1.0"))
        .unwrap();
    h.registry.sync_type(TYPE).await.unwrap();
    h.seed_bridge("b1", "started");

    h.instances.attach("b1").await.unwrap();
    assert_eq!(h.bridge_attr("b1", "state"), Some(json!("stopped")));
    assert_eq!(h.bridge_attr("b1", "status"), Some(json!("stopped")));

    h.set_status("b1", "started").await;
    let err = h.instances.reconcile("b1").await.unwrap_err();
    assert!(matches!(&err, CoreError::TypeNotInstalled(t) if t == TYPE));
    assert_eq!(err.to_string(), "Bridge type zigbee is not pulled.");
    assert_eq!(h.bridge_attr("b1", "state"), Some(json!("stopped")));
    assert_eq!(h.runtime.count_calls(MockOp::Create), 0);

    h.instances
        .handle_event(EntityEvent::Update {
            id: "b1".to_owned(),
            value: fields(json!({"event": "start"})),
        })
        .await;
    let payload = h.error_on("errors/bridges/b1/update").unwrap();
    assert_eq!(payload["message"], json!("Bridge type zigbee is not pulled."));
    assert_eq!(h.bridge_attr("b1", "state"), Some(json!("stopped")));
}

#[tokio::test]
async fn scenario_b_pull_staged_update() {
    let h = harness().await;
    h.install_type("1.0").await;
    h.seed_bridge("b1", "started");
    h.instances.attach("b1").await.unwrap();
    assert_eq!(h.runtime.count_calls(MockOp::Create), 1);

    h.catalog.publish(descriptor("2.0"));
    h.runtime
        .publish_remote("registry.example.com/bridges/zigbee:2.0");
    h.registry.poll_catalog().await.unwrap();
    assert_eq!(
        h.type_attr("version").unwrap()["updateAvailable"],
        json!(true)
    );

    h.registry.pull(TYPE).await.unwrap();

    let record = h.registry.record(TYPE).unwrap();
    assert_eq!(record.local.unwrap().version.as_deref(), Some("2.0"));
    assert!(record.pending.is_none());
    assert_eq!(
        h.type_attr("version"),
        Some(json!({"updateAvailable": false, "updated": true}))
    );
    assert_eq!(h.type_attr("status"), Some(json!("pulled")));
    assert!(h.runtime.has_image(IMAGE));
    assert!(h
        .directory
        .attribute_history(EntityKind::BridgeType, TYPE, "state")
        .contains(&json!("pulling")));

    // Members were stopped for the pull and brought back afterwards.
    assert_eq!(h.runtime.count_calls(MockOp::Create), 2);
    assert!(h.runtime.is_running(CONTAINER));
    assert_eq!(h.bridge_attr("b1", "state"), Some(json!("started")));
}

#[tokio::test]
async fn scenario_c_start_creates_one_named_container() {
    let h = harness().await;
    h.install_type("1.0").await;
    h.runtime.insert_container(PROXY, "nginx", true);
    h.seed_bridge("b1", "started");

    h.instances.attach("b1").await.unwrap();

    assert_eq!(h.runtime.count_calls(MockOp::Create), 1);
    assert!(h.runtime.is_running(CONTAINER));
    assert_eq!(h.instances.container_of("b1").as_deref(), Some(CONTAINER));
    let states = h
        .directory
        .attribute_history(EntityKind::Bridge, "b1", "state");
    assert_eq!(states, vec![json!("starting"), json!("started")]);

    let spec = h.runtime.container_spec(CONTAINER).unwrap();
    assert_eq!(spec.image, IMAGE);
    assert_eq!(spec.env.get("SERVICE_ID").map(String::as_str), Some("b1"));
    assert_eq!(spec.env.get("DEVICE").map(String::as_str), Some("/dev/ttyUSB0"));
    assert!(spec.env.contains_key("MQTT_PASS"));
    assert!(h.credentials.contains("b1"));

    // Converged already: no second container.
    assert_eq!(
        h.instances.reconcile("b1").await.unwrap(),
        ReconcileOutcome::Started
    );
    assert_eq!(h.runtime.count_calls(MockOp::Create), 1);

    // A stream marker reloads the proxy.
    assert!(h.instances.is_streaming("b1"));
    assert!(
        h.runtime
            .emit_output(CONTAINER, "ready\n@event::configChanged::@end\n")
            .await
    );
    let runtime = Arc::clone(&h.runtime);
    assert!(eventually(|| runtime.count_calls(MockOp::Kill) == 1).await);
    assert!(h.runtime.calls().contains(&format!("Kill {PROXY} HUP")));

    // The container exiting on its own marks the instance stopped.
    h.runtime.exit_container(CONTAINER);
    assert!(
        h.directory
            .wait_until(WAIT, |d| {
                d.attribute(EntityKind::Bridge, "b1", "state") == Some(json!("stopped"))
            })
            .await
    );
    let runtime = Arc::clone(&h.runtime);
    assert!(eventually(|| runtime.container_names() == vec![PROXY.to_owned()]).await);
    assert_eq!(h.bridge_attr("b1", "status"), Some(json!("stopped")));
}

#[tokio::test]
async fn scenario_d_delete_during_reconcile() {
    let h = harness().await;
    h.install_type("1.0").await;
    h.seed_bridge("b1", "started");

    h.runtime.hold_creates();
    let instances = Arc::clone(&h.instances);
    let attach = tokio::spawn(async move { instances.attach("b1").await });
    h.runtime.create_reached().await;

    h.instances
        .handle_event(EntityEvent::Delete {
            id: "b1".to_owned(),
        })
        .await;
    let payload = h.error_on("errors/bridges/b1/delete").unwrap();
    assert_eq!(payload["code"], json!("RACE_CONDITION"));
    assert!(h.directory.contains(EntityKind::Bridge, "b1"));

    h.runtime.open_creates();
    assert!(attach.await.unwrap().unwrap());
    assert!(h.runtime.is_running(CONTAINER));
    assert!(h.credentials.contains("b1"));

    h.instances
        .handle_event(EntityEvent::Delete {
            id: "b1".to_owned(),
        })
        .await;
    assert!(!h.directory.contains(EntityKind::Bridge, "b1"));
    assert!(h.runtime.container_names().is_empty());
    assert!(!h.credentials.contains("b1"));
    assert!(!h.layout.instance_dir(CONTAINER).exists());
    assert!(!h.instances.is_attached("b1"));
}

#[tokio::test]
async fn failed_teardown_on_delete_settles_the_state() {
    let h = harness().await;
    h.install_type("1.0").await;
    h.seed_bridge("b1", "started");
    h.instances.attach("b1").await.unwrap();
    assert!(h.runtime.is_running(CONTAINER));

    h.runtime
        .fail_next(MockOp::Stop, MockFailure::Failed("daemon busy".to_owned()));
    h.instances
        .handle_event(EntityEvent::Delete {
            id: "b1".to_owned(),
        })
        .await;

    assert!(h.error_on("errors/bridges/b1/delete").is_some());
    assert!(h.directory.contains(EntityKind::Bridge, "b1"));
    assert_eq!(h.bridge_attr("b1", "state"), Some(json!("stopped")));
    assert!(h
        .directory
        .attribute_history(EntityKind::Bridge, "b1", "state")
        .contains(&json!("stopping")));
    assert!(h.credentials.contains("b1"));

    // A retry goes through.
    h.instances
        .handle_event(EntityEvent::Delete {
            id: "b1".to_owned(),
        })
        .await;
    assert!(!h.directory.contains(EntityKind::Bridge, "b1"));
    assert!(h.runtime.container_names().is_empty());
    assert!(!h.credentials.contains("b1"));
}

#[tokio::test]
async fn second_reconcile_is_skipped_while_one_runs() {
    let h = harness().await;
    h.install_type("1.0").await;
    h.seed_bridge("b1", "started");

    h.runtime.hold_creates();
    let instances = Arc::clone(&h.instances);
    let attach = tokio::spawn(async move { instances.attach("b1").await });
    h.runtime.create_reached().await;

    let second = tokio::time::timeout(WAIT, h.instances.reconcile("b1"))
        .await
        .expect("reconcile waited for the running pass");
    assert_eq!(second.unwrap(), ReconcileOutcome::Skipped);

    h.runtime.open_creates();
    assert!(attach.await.unwrap().unwrap());
    assert_eq!(h.runtime.count_calls(MockOp::Create), 1);
    assert_eq!(
        h.instances.reconcile("b1").await.unwrap(),
        ReconcileOutcome::Started
    );
}

#[tokio::test]
async fn scenario_e_type_without_records_is_forgotten() {
    let h = harness().await;
    h.catalog.publish(descriptor("1.0"));
    h.registry.poll_catalog().await.unwrap();
    assert!(h.directory.contains(EntityKind::BridgeType, TYPE));
    assert!(h.registry.is_routed(TYPE));

    h.catalog.withdraw(TYPE);
    h.registry.poll_catalog().await.unwrap();

    assert!(!h.directory.contains(EntityKind::BridgeType, TYPE));
    assert!(!h.layout.type_dir(TYPE).exists());
    assert!(!h.registry.is_routed(TYPE));
    assert_eq!(h.registry.status(TYPE).await.unwrap(), None);
}

// --- Bus requests ---

#[tokio::test]
async fn create_request_registers_a_stopped_bridge() {
    let h = harness().await;
    h.install_type("1.0").await;
    let dispatcher = Arc::clone(&h.instances).run(h.directory.subscribe(EntityKind::Bridge));

    h.directory.emit(
        EntityKind::Bridge,
        EntityEvent::Create {
            id: "b2".to_owned(),
            value: fields(json!({
                "type": TYPE,
                "configuration": "{\"DEVICE\": \"/dev/ttyUSB1\"}"
            })),
        },
    );
    assert!(
        h.directory
            .wait_until(WAIT, |d| {
                d.attribute(EntityKind::Bridge, "b2", "status") == Some(json!("stopped"))
            })
            .await
    );
    assert_eq!(h.bridge_attr("b2", "state"), Some(json!("stopped")));
    assert_eq!(
        h.bridge_attr("b2", "configuration"),
        Some(json!({"DEVICE": "/dev/ttyUSB1"}))
    );
    assert!(h.credentials.contains("b2"));
    assert!(h.runtime.container_names().is_empty());

    h.directory.emit(
        EntityKind::Bridge,
        EntityEvent::Create {
            id: "b2".to_owned(),
            value: fields(json!({"type": TYPE})),
        },
    );
    assert!(
        h.directory
            .wait_until(WAIT, |d| {
                d.broker_messages()
                    .iter()
                    .any(|m| m.topic == "errors/bridges/b2/create")
            })
            .await
    );
    let payload = h.error_on("errors/bridges/b2/create").unwrap();
    assert_eq!(payload["code"], json!("EXISTS"));
    assert_eq!(payload["fields"]["entityId"], json!("exists"));
    dispatcher.abort();
}

#[tokio::test]
async fn create_leaves_nothing_behind_when_the_entity_cannot_be_added() {
    let h = harness().await;
    h.install_type("1.0").await;
    h.directory.fail_next_attach("broker offline");

    h.instances
        .handle_event(EntityEvent::Create {
            id: "b2".to_owned(),
            value: fields(json!({"type": TYPE, "configuration": {"DEVICE": "/dev/ttyUSB1"}})),
        })
        .await;

    assert!(h.error_on("errors/bridges/b2/create").is_some());
    assert!(!h.directory.contains(EntityKind::Bridge, "b2"));
    assert!(!h.credentials.contains("b2"));
    assert!(!h.layout.instance_dir("bridge-zigbee-b2").exists());
    assert!(!h.instances.is_attached("b2"));
}

#[tokio::test]
async fn create_rolls_back_the_entity_when_materializing_fails() {
    let h = harness().await;
    h.install_type("1.0").await;
    // A plain file where the configuration directory belongs.
    let dir = h.layout.instance_dir("bridge-zigbee-b2");
    std::fs::create_dir_all(dir.parent().unwrap()).unwrap();
    std::fs::write(&dir, b"").unwrap();

    h.instances
        .handle_event(EntityEvent::Create {
            id: "b2".to_owned(),
            value: fields(json!({"type": TYPE, "configuration": {"DEVICE": "/dev/ttyUSB1"}})),
        })
        .await;

    assert!(h.error_on("errors/bridges/b2/create").is_some());
    assert!(!h.directory.contains(EntityKind::Bridge, "b2"));
    assert!(!h.credentials.contains("b2"));
    assert!(!h.instances.is_attached("b2"));
}

#[tokio::test]
async fn create_request_validates_the_id() {
    let h = harness().await;
    h.install_type("1.0").await;

    h.instances
        .handle_event(EntityEvent::Create {
            id: "bad-id".to_owned(),
            value: fields(json!({"type": TYPE})),
        })
        .await;
    let payload = h.error_on("errors/bridges/bad-id/create").unwrap();
    assert_eq!(payload["code"], json!("VALIDATION"));
    assert_eq!(payload["fields"]["entityId"], json!("invalid"));
    assert!(!h.directory.contains(EntityKind::Bridge, "bad-id"));
}

#[tokio::test]
async fn update_needs_configuration_or_event() {
    let h = harness().await;
    h.install_type("1.0").await;
    h.seed_bridge("b1", "stopped");
    h.instances.attach("b1").await.unwrap();

    h.instances
        .handle_event(EntityEvent::Update {
            id: "b1".to_owned(),
            value: Fields::new(),
        })
        .await;
    let payload = h.error_on("errors/bridges/b1/update").unwrap();
    assert_eq!(payload["code"], json!("VALIDATION"));

    h.instances
        .handle_event(EntityEvent::Set {
            id: "b1".to_owned(),
            field: "event".to_owned(),
            value: json!("launch"),
        })
        .await;
    let errors = h.directory.entity_errors();
    let last = errors.last().unwrap();
    assert_eq!(last.field, "event");
    assert_eq!(
        last.error.message,
        "Value launch is not allowed for the field event."
    );
}

#[tokio::test]
async fn set_configuration_recreates_a_running_bridge() {
    let h = harness().await;
    h.install_type("1.0").await;
    h.seed_bridge("b1", "started");
    h.instances.attach("b1").await.unwrap();

    let mut updated = configuration();
    updated.insert("DEVICE".to_owned(), json!("/dev/ttyACM0"));
    h.instances
        .handle_event(EntityEvent::Set {
            id: "b1".to_owned(),
            field: "configuration".to_owned(),
            value: Value::Object(updated.clone()),
        })
        .await;

    assert!(h.directory.entity_errors().is_empty());
    assert_eq!(h.runtime.count_calls(MockOp::Create), 2);
    assert!(h.runtime.is_running(CONTAINER));
    assert_eq!(h.bridge_attr("b1", "state"), Some(json!("started")));
    assert_eq!(
        h.bridge_attr("b1", "configuration"),
        Some(Value::Object(updated.clone()))
    );
    assert!(!h.instances.configuration_changed("b1", &updated).await.unwrap());
}

#[tokio::test]
async fn stop_event_tears_the_container_down() {
    let h = harness().await;
    h.install_type("1.0").await;
    h.seed_bridge("b1", "started");
    h.instances.attach("b1").await.unwrap();

    h.instances
        .handle_event(EntityEvent::Set {
            id: "b1".to_owned(),
            field: "event".to_owned(),
            value: json!("stop"),
        })
        .await;
    assert_eq!(h.bridge_attr("b1", "status"), Some(json!("stopped")));
    assert_eq!(h.bridge_attr("b1", "state"), Some(json!("stopped")));
    assert_eq!(h.bridge_attr("b1", "event"), Some(json!("stop")));
    assert!(h.runtime.container_names().is_empty());
    // The configuration stays on disk for the next start.
    assert!(h.layout.instance_dir(CONTAINER).join(".env").is_file());
}

// --- Startup inventory ---

#[tokio::test]
async fn startup_removes_leftovers_after_the_grace_period() {
    let h = harness().await;
    h.install_type("1.0").await;
    h.seed_bridge("b1", "stopped");
    h.runtime.insert_container("bridge-zigbee-ghost", IMAGE, false);
    h.runtime.insert_container("bridge-zwave-b1", IMAGE, false);
    h.instances
        .materializer()
        .store()
        .ensure_dir("bridge-other-b1")
        .unwrap();

    h.instances.startup().await.unwrap();

    // A config dir naming the wrong type goes at once.
    assert!(!h.layout.instance_dir("bridge-other-b1").exists());
    let mut pending = h.instances.pending_leftovers();
    pending.sort();
    assert_eq!(pending, vec!["b1".to_owned(), "ghost".to_owned()]);
    assert!(h.instances.is_attached("b1"));

    assert_eq!(h.instances.cleanup_leftovers().await, 2);
    assert!(h.runtime.container_names().is_empty());
    assert!(h.instances.pending_leftovers().is_empty());
}

#[tokio::test]
async fn startup_adopts_an_existing_container() {
    let h = harness().await;
    h.install_type("1.0").await;
    h.seed_bridge("b1", "started");
    h.instances.materialize_configuration("b1").await.unwrap();
    h.runtime.insert_container(CONTAINER, IMAGE, true);

    h.instances.startup().await.unwrap();

    assert_eq!(h.runtime.count_calls(MockOp::Create), 0);
    assert_eq!(h.instances.container_of("b1").as_deref(), Some(CONTAINER));
    assert_eq!(h.bridge_attr("b1", "state"), Some(json!("started")));
    assert!(h.instances.pending_leftovers().is_empty());
}
