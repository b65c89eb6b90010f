//! Container spec construction for bridge instances.

use crate::config::RuntimeContext;
use crate::CoreError;
use bridgekeeper_runtime::{Bind, ContainerSpec, PortBinding};
use bridgekeeper_schema::{container_name, BridgeTypeDescriptor, FieldKind, ImageReference, VolumeSource};
use bridgekeeper_store::{EnvFile, HostLayout};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Directory field files are mounted under inside a bridge container.
pub const CONTAINER_CONFIG_DIR: &str = "/etc";

const COMPOSE_PROJECT_LABEL: &str = "com.docker.compose.project";
const COMPOSE_SERVICE_LABEL: &str = "com.docker.compose.service";

const KEEPALIVE_SYSCTLS: [(&str, &str); 3] = [
    ("net.ipv4.tcp_keepalive_time", "60"),
    ("net.ipv4.tcp_keepalive_intvl", "10"),
    ("net.ipv4.tcp_keepalive_probes", "4"),
];

/// A container spec plus the shared volume names it mounts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerPlan {
    pub spec: ContainerSpec,
    pub shared_volumes: Vec<String>,
}

/// Image reference a type's containers run: the registry reference as
/// declared, or retagged to `channel` when it carries no tag or digest.
pub fn local_image(registry: &str, channel: &str) -> Result<String, CoreError> {
    let reference = ImageReference::parse(registry)?;
    if reference.tag.is_some() || reference.digest.is_some() {
        Ok(reference.to_string())
    } else {
        Ok(reference.tagged(channel))
    }
}

pub fn instance_container_name(descriptor: &BridgeTypeDescriptor, id: &str) -> String {
    container_name(
        &descriptor.type_id,
        id,
        descriptor.configuration.expose_port,
    )
}

/// Names of the `{SHARED}` volumes a type mounts.
pub fn shared_volumes(descriptor: &BridgeTypeDescriptor) -> Vec<String> {
    descriptor
        .configuration
        .volumes
        .keys()
        .filter_map(|source| match VolumeSource::parse(source) {
            VolumeSource::Shared(dir) => Some(dir),
            _ => None,
        })
        .collect()
}

/// Everything needed to build the spec of one instance's container.
pub struct SpecInput<'a> {
    pub context: &'a RuntimeContext,
    pub host: &'a HostLayout,
    pub descriptor: &'a BridgeTypeDescriptor,
    pub instance_id: &'a str,
    pub configuration: &'a Map<String, Value>,
    /// The materialized `.env` of the instance.
    pub env: &'a EnvFile,
}

pub fn build_container_spec(input: &SpecInput<'_>) -> Result<ContainerPlan, CoreError> {
    let SpecInput {
        context,
        host,
        descriptor,
        instance_id,
        configuration,
        env,
    } = *input;
    let settings = &descriptor.configuration;
    let name = instance_container_name(descriptor, instance_id);
    let instance_dir = host.instance_dir(&name);

    let mut env_vars: BTreeMap<String, String> = env
        .iter()
        .map(|(k, v)| (k.to_owned(), v.to_owned()))
        .collect();
    env_vars.insert("TZ".to_owned(), context.timezone.clone());
    env_vars.insert("SERVICE_ID".to_owned(), instance_id.to_owned());

    let mut binds = Vec::new();
    let mut ports = Vec::new();
    for field in &settings.fields {
        if let Some(ext) = field.kind.file_extension() {
            let file = format!("{}.{ext}", field.name);
            binds.push(Bind {
                source: instance_dir.join(&file).display().to_string(),
                target: format!("{CONTAINER_CONFIG_DIR}/{file}"),
            });
        } else if field.kind == FieldKind::ExposedPort {
            if let Some(port) = configuration.get(&field.name).and_then(port_value) {
                ports.push(PortBinding {
                    port,
                    protocol: field
                        .exposed_port_protocol
                        .clone()
                        .unwrap_or_else(|| "tcp".to_owned()),
                });
            }
        }
    }

    let mut shared_volumes = Vec::new();
    for (source, target) in &settings.volumes {
        let source = match VolumeSource::parse(source) {
            VolumeSource::Bridge(path) => instance_dir.join(path),
            VolumeSource::Shared(dir) => {
                let resolved = host.shared_dir(&dir);
                shared_volumes.push(dir);
                resolved
            }
            VolumeSource::HostRelative(path) => host.relative(&path),
            VolumeSource::HostAbsolute(path) => path.into(),
        };
        binds.push(Bind {
            source: source.display().to_string(),
            target: target.clone(),
        });
    }

    let sysctls = if descriptor.uses_host_network() {
        BTreeMap::new()
    } else {
        KEEPALIVE_SYSCTLS
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect()
    };

    let mut labels = BTreeMap::new();
    labels.insert(
        COMPOSE_PROJECT_LABEL.to_owned(),
        context.compose_project.clone(),
    );
    labels.insert(COMPOSE_SERVICE_LABEL.to_owned(), name.clone());

    Ok(ContainerPlan {
        spec: ContainerSpec {
            image: local_image(&descriptor.registry, &context.channel_tag)?,
            name,
            env: env_vars,
            binds,
            ports,
            network_mode: Some(
                settings
                    .network_mode
                    .clone()
                    .unwrap_or_else(|| context.default_network.clone()),
            ),
            privileged: settings.privileged,
            sysctls,
            log: context.log.clone(),
            labels,
        },
        shared_volumes,
    })
}

fn port_value(value: &Value) -> Option<String> {
    match value {
        Value::Number(n) => Some(n.to_string()),
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_owned()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use bridgekeeper_runtime::{ContainerRuntime, MockRuntime};
    use serde_json::json;
    use std::sync::Arc;

    async fn context() -> RuntimeContext {
        let runtime: Arc<dyn ContainerRuntime> = Arc::new(MockRuntime::new());
        let config = RuntimeConfig {
            default_network: Some("home_net".to_owned()),
            compose_project: Some("home".to_owned()),
            timezone: "Europe/Berlin".to_owned(),
            ..RuntimeConfig::default()
        };
        RuntimeContext::resolve(runtime, &config).await
    }

    fn descriptor(value: Value) -> BridgeTypeDescriptor {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn image_gets_channel_tag_only_when_untagged() {
        assert_eq!(
            local_image("registry.example.com/bridges/zigbee", "market").unwrap(),
            "registry.example.com/bridges/zigbee:market"
        );
        assert_eq!(
            local_image("registry.example.com/bridges/zigbee:1.2", "market").unwrap(),
            "registry.example.com/bridges/zigbee:1.2"
        );
        assert_eq!(
            local_image("zigbee@sha256:abc", "market").unwrap(),
            "zigbee@sha256:abc"
        );
        assert!(local_image("", "market").is_err());
    }

    #[tokio::test]
    async fn builds_full_spec() {
        let ctx = context().await;
        let host = HostLayout::new("/srv/home");
        let desc = descriptor(json!({
            "type": "modbus",
            "registry": "r.example.com/modbus",
            "configuration": {
                "fields": [
                    {"name": "HOST", "type": "string"},
                    {"name": "extension", "type": "javascript"},
                    {"name": "mapping", "type": "modbus-config"},
                    {"name": "PORT", "type": "exposed-port", "exposed_port_protocol": "udp"}
                ],
                "volumes": {
                    "{BRIDGE}/data": "/app/data",
                    "{SHARED}/certs": "/certs",
                    "./system/media": "/media",
                    "/dev/ttyUSB0": "/dev/ttyUSB0"
                },
                "privileged": true
            }
        }));
        let configuration = json!({"HOST": "10.0.0.2", "PORT": 5020});
        let mut env = EnvFile::new();
        env.set("MQTT_USER", "m1");
        env.set("HOST", "10.0.0.2");

        let plan = build_container_spec(&SpecInput {
            context: &ctx,
            host: &host,
            descriptor: &desc,
            instance_id: "m1",
            configuration: configuration.as_object().unwrap(),
            env: &env,
        })
        .unwrap();
        let spec = plan.spec;

        assert_eq!(spec.name, "bridge-modbus-m1");
        assert_eq!(spec.image, "r.example.com/modbus:market");
        assert_eq!(spec.env["TZ"], "Europe/Berlin");
        assert_eq!(spec.env["SERVICE_ID"], "m1");
        assert_eq!(spec.env["MQTT_USER"], "m1");
        assert!(spec.privileged);
        assert_eq!(spec.network_mode.as_deref(), Some("home_net"));
        assert_eq!(spec.sysctls.len(), 3);
        assert_eq!(spec.labels["com.docker.compose.project"], "home");
        assert_eq!(spec.labels["com.docker.compose.service"], "bridge-modbus-m1");
        assert_eq!(
            spec.ports,
            vec![PortBinding {
                port: "5020".to_owned(),
                protocol: "udp".to_owned()
            }]
        );

        let binds: Vec<String> = spec.binds.iter().map(ToString::to_string).collect();
        let dir = "/srv/home/system/bridges/bridge-modbus-m1";
        assert!(binds.contains(&format!("{dir}/extension.js:/etc/extension.js")));
        assert!(binds.contains(&format!("{dir}/mapping.json:/etc/mapping.json")));
        assert!(binds.contains(&format!("{dir}/data:/app/data")));
        assert!(binds.contains(&"/srv/home/system/shared/certs:/certs".to_owned()));
        assert!(binds.contains(&"/srv/home/system/media:/media".to_owned()));
        assert!(binds.contains(&"/dev/ttyUSB0:/dev/ttyUSB0".to_owned()));
        assert_eq!(plan.shared_volumes, vec!["certs".to_owned()]);
        assert_eq!(shared_volumes(&desc), plan.shared_volumes);
    }

    #[tokio::test]
    async fn host_network_drops_sysctls() {
        let ctx = context().await;
        let host = HostLayout::new("/srv/home");
        let desc = descriptor(json!({
            "type": "hue",
            "registry": "r/hue:2.0",
            "configuration": {"fields": [], "network_mode": "host", "exposePort": true}
        }));
        let plan = build_container_spec(&SpecInput {
            context: &ctx,
            host: &host,
            descriptor: &desc,
            instance_id: "h1",
            configuration: &Map::new(),
            env: &EnvFile::new(),
        })
        .unwrap();
        assert_eq!(plan.spec.name, "service-h1");
        assert_eq!(plan.spec.image, "r/hue:2.0");
        assert_eq!(plan.spec.network_mode.as_deref(), Some("host"));
        assert!(plan.spec.sysctls.is_empty());
        assert!(plan.spec.ports.is_empty());
    }
}
