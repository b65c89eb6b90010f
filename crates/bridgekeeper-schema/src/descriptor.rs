use crate::SchemaError;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

/// Catalog descriptor of an installable bridge type.
///
/// The same document is stored twice per type on disk: once as the installed
/// (local) record and once as the staged (pending) update. Keys this struct does
/// not model are preserved in `extra` so the published projection carries
/// everything the catalog declared.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeTypeDescriptor {
    #[serde(rename = "type", default)]
    pub type_id: String,
    #[serde(default)]
    pub title: String,
    pub registry: String,
    #[serde(
        default,
        deserialize_with = "de_version",
        skip_serializing_if = "Option::is_none"
    )]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(default)]
    pub configuration: TypeSettings,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Configuration schema and container settings of a bridge type.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TypeSettings {
    #[serde(default)]
    pub fields: Vec<FieldSpec>,
    /// Host source → container target.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub volumes: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_mode: Option<String>,
    /// Container runs privileged.
    #[serde(default, skip_serializing_if = "is_false")]
    pub privileged: bool,
    /// Broker credential gets unrestricted topic access.
    #[serde(default, skip_serializing_if = "is_false")]
    pub privilege: bool,
    #[serde(rename = "exposePort", default, skip_serializing_if = "is_false")]
    pub expose_port: bool,
    /// Stream marker name → handler name.
    #[serde(
        rename = "streamEvents",
        default,
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub stream_events: BTreeMap<String, String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: FieldKind,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub validation: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exposed_port_protocol: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// How a configuration field is materialized for the container.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum FieldKind {
    String,
    Integer,
    Json,
    Javascript,
    ModbusConfig,
    ExposedPort,
    /// Kinds this build does not know; materialized as scalars.
    Other(String),
}

impl FieldKind {
    pub fn as_str(&self) -> &str {
        match self {
            FieldKind::String => "string",
            FieldKind::Integer => "integer",
            FieldKind::Json => "json",
            FieldKind::Javascript => "javascript",
            FieldKind::ModbusConfig => "modbus-config",
            FieldKind::ExposedPort => "exposed-port",
            FieldKind::Other(s) => s,
        }
    }

    /// Extension of the file this kind is written to, if it is file-backed.
    pub fn file_extension(&self) -> Option<&'static str> {
        match self {
            FieldKind::Json | FieldKind::ModbusConfig => Some("json"),
            FieldKind::Javascript => Some("js"),
            _ => None,
        }
    }

    pub fn is_file_backed(&self) -> bool {
        self.file_extension().is_some()
    }
}

impl From<String> for FieldKind {
    fn from(s: String) -> Self {
        match s.as_str() {
            "string" => FieldKind::String,
            "integer" => FieldKind::Integer,
            "json" => FieldKind::Json,
            "javascript" => FieldKind::Javascript,
            "modbus-config" => FieldKind::ModbusConfig,
            "exposed-port" => FieldKind::ExposedPort,
            _ => FieldKind::Other(s),
        }
    }
}

impl From<FieldKind> for String {
    fn from(kind: FieldKind) -> Self {
        kind.as_str().to_owned()
    }
}

impl fmt::Display for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Source side of a declared volume, by addressing mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VolumeSource {
    /// `{BRIDGE}/path`: inside the instance's own config directory.
    Bridge(String),
    /// `{SHARED}/name`: a directory shared by every instance that names it.
    Shared(String),
    /// `./path`: relative to the host data directory.
    HostRelative(String),
    /// Anything else is passed through as a host path.
    HostAbsolute(String),
}

impl VolumeSource {
    pub fn parse(source: &str) -> Self {
        if let Some(rest) = source.strip_prefix('{') {
            if let Some((placeholder, path)) = rest.split_once("}/") {
                match placeholder {
                    "BRIDGE" => return VolumeSource::Bridge(path.to_owned()),
                    "SHARED" => return VolumeSource::Shared(path.to_owned()),
                    _ => {}
                }
            }
        }
        if source.starts_with('.') {
            return VolumeSource::HostRelative(source.to_owned());
        }
        VolumeSource::HostAbsolute(source.to_owned())
    }
}

impl BridgeTypeDescriptor {
    pub fn from_slice(data: &[u8]) -> Result<Self, SchemaError> {
        let descriptor: Self = serde_json::from_slice(data)?;
        if descriptor.registry.trim().is_empty() {
            return Err(SchemaError::EmptyRegistry);
        }
        Ok(descriptor)
    }

    pub fn to_vec_pretty(&self) -> Result<Vec<u8>, SchemaError> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    /// True when `other` advertises a different image: version or registry changed.
    pub fn differs_from(&self, other: &BridgeTypeDescriptor) -> bool {
        self.version != other.version || self.registry != other.registry
    }

    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.configuration.fields.iter().find(|f| f.name == name)
    }

    /// The descriptor as projected while only a staged update exists: the
    /// configuration schema is withheld until the image is installed.
    #[must_use]
    pub fn without_configuration(&self) -> Self {
        Self {
            configuration: TypeSettings::default(),
            ..self.clone()
        }
    }

    pub fn uses_host_network(&self) -> bool {
        self.configuration.network_mode.as_deref() == Some("host")
    }
}

#[allow(clippy::trivially_copy_pass_by_ref)]
fn is_false(b: &bool) -> bool {
    !*b
}

fn de_version<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<Value>::deserialize(deserializer)?;
    Ok(match raw {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s),
        Some(other) => Some(other.to_string()),
    })
}
