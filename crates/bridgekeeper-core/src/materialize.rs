//! Turns an instance configuration into `.env` entries and per-field files.

use crate::container::instance_container_name;
use crate::credentials::{CredentialScope, CredentialService};
use crate::CoreError;
use bridgekeeper_schema::{BridgeTypeDescriptor, FieldKind};
use bridgekeeper_store::{EnvFile, InstanceStore};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, warn};

pub const MQTT_USER: &str = "MQTT_USER";
pub const MQTT_PASS: &str = "MQTT_PASS";
pub const MQTT_URI: &str = "MQTT_URI";

pub struct Materializer {
    store: Arc<InstanceStore>,
    credentials: Arc<dyn CredentialService>,
    broker_uri: String,
    host_broker_uri: String,
}

impl Materializer {
    pub fn new(
        store: Arc<InstanceStore>,
        credentials: Arc<dyn CredentialService>,
        broker_uri: impl Into<String>,
        host_broker_uri: impl Into<String>,
    ) -> Self {
        Self {
            store,
            credentials,
            broker_uri: broker_uri.into(),
            host_broker_uri: host_broker_uri.into(),
        }
    }

    pub fn store(&self) -> &InstanceStore {
        &self.store
    }

    fn broker_uri_for(&self, descriptor: &BridgeTypeDescriptor) -> &str {
        if descriptor.uses_host_network() {
            &self.host_broker_uri
        } else {
            &self.broker_uri
        }
    }

    /// Write every artifact of `configuration` to the instance's directory.
    ///
    /// An existing credential is reused; otherwise one is registered. Env keys
    /// that no longer correspond to a schema field are carried over.
    pub async fn materialize(
        &self,
        descriptor: &BridgeTypeDescriptor,
        id: &str,
        configuration: &Map<String, Value>,
    ) -> Result<(), CoreError> {
        let name = instance_container_name(descriptor, id);
        self.store.ensure_dir(&name)?;
        let mut old = self.store.read_env(&name)?.unwrap_or_default();

        let user = non_empty(old.get(MQTT_USER)).unwrap_or(id).to_owned();
        let pass = match non_empty(old.get(MQTT_PASS)) {
            Some(pass) => pass.to_owned(),
            None => {
                debug!("registering broker credential for {user}");
                self.credentials
                    .register(
                        &user,
                        None,
                        CredentialScope {
                            privileged: descriptor.configuration.privilege,
                            scope_id: id.to_owned(),
                        },
                    )
                    .await?
            }
        };

        let mut env = EnvFile::new();
        env.set(MQTT_USER, user);
        env.set(MQTT_PASS, pass);
        env.set(MQTT_URI, self.broker_uri_for(descriptor));

        for field in &descriptor.configuration.fields {
            old.remove(&field.name);
            let value = configuration.get(&field.name);
            let ext = field.kind.file_extension();

            if is_blank(value) {
                if let Some(ext) = ext {
                    if self.store.remove_field(&name, &field.name, ext)? {
                        debug!("removed stale {}.{ext} of {id}", field.name);
                    }
                }
                continue;
            }
            let Some(value) = value else { continue };

            match field.kind {
                FieldKind::Javascript => {
                    self.store
                        .write_field(&name, &field.name, "js", script_source(value).as_bytes())?;
                }
                FieldKind::Json | FieldKind::ModbusConfig => {
                    let mut content = serde_json::to_vec_pretty(value)?;
                    content.push(b'\n');
                    self.store.write_field(&name, &field.name, "json", &content)?;
                }
                _ => env.set(field.name.clone(), scalar_repr(value)),
            }
        }

        for (key, value) in old.iter() {
            if !env.contains(key) {
                env.set(key, value);
            }
        }

        self.store.write_env(&name, &env)?;
        debug!("materialized configuration of {id} into {name}");
        Ok(())
    }

    /// True when the materialized artifacts do not match `configuration`.
    /// Any failure to read them counts as a change.
    pub fn configuration_changed(
        &self,
        descriptor: &BridgeTypeDescriptor,
        id: &str,
        configuration: &Map<String, Value>,
    ) -> bool {
        match self.compare(descriptor, id, configuration) {
            Ok(changed) => changed,
            Err(e) => {
                debug!("treating configuration of {id} as changed: {e}");
                true
            }
        }
    }

    fn compare(
        &self,
        descriptor: &BridgeTypeDescriptor,
        id: &str,
        configuration: &Map<String, Value>,
    ) -> Result<bool, CoreError> {
        let name = instance_container_name(descriptor, id);
        let Some(env) = self.store.read_env(&name)? else {
            return Ok(true);
        };
        if [MQTT_USER, MQTT_PASS, MQTT_URI]
            .iter()
            .any(|key| non_empty(env.get(key)).is_none())
        {
            return Ok(true);
        }

        for field in &descriptor.configuration.fields {
            let value = configuration.get(&field.name).filter(|v| !is_blank(Some(*v)));
            let same = match field.kind {
                FieldKind::Javascript => {
                    let current = self.store.read_field(&name, &field.name, "js")?;
                    match (current, value) {
                        (None, None) => true,
                        (Some(bytes), Some(v)) => bytes == script_source(v).as_bytes(),
                        _ => false,
                    }
                }
                FieldKind::Json | FieldKind::ModbusConfig => {
                    let current = self.store.read_field(&name, &field.name, "json")?;
                    match (current, value) {
                        (None, None) => true,
                        (Some(bytes), Some(v)) => serde_json::from_slice::<Value>(&bytes)? == *v,
                        _ => false,
                    }
                }
                _ => {
                    let desired = value.map(scalar_repr).unwrap_or_default();
                    env.get(&field.name).unwrap_or_default() == desired
                }
            };
            if !same {
                debug!("field {} of {id} changed", field.name);
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Remove the instance's config directory and empty its shared volumes.
    pub fn remove_configuration(&self, container: &str, shared_volumes: &[String]) {
        if let Err(e) = self.store.remove_dir(container) {
            warn!("failed to remove config dir {container}: {e}");
        }
        for volume in shared_volumes {
            if let Err(e) = self.store.clear_shared(volume) {
                warn!("failed to clear shared volume {volume}: {e}");
            }
        }
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.is_empty())
}

/// Values that are not materialized at all.
pub fn is_blank(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null | Value::Bool(false)) => true,
        Some(Value::String(s)) => s.is_empty(),
        Some(Value::Number(n)) => n.as_f64() == Some(0.0),
        Some(_) => false,
    }
}

fn scalar_repr(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn script_source(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
