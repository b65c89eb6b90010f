//! Container names are `bridge-<type>-<id>`, or `service-<id>` when the type
//! exposes a port.

use crate::SchemaError;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContainerPrefix {
    Bridge,
    Service,
}

impl ContainerPrefix {
    pub fn as_str(self) -> &'static str {
        match self {
            ContainerPrefix::Bridge => "bridge",
            ContainerPrefix::Service => "service",
        }
    }

    fn from_segment(s: &str) -> Option<Self> {
        match s {
            "bridge" => Some(ContainerPrefix::Bridge),
            "service" => Some(ContainerPrefix::Service),
            _ => None,
        }
    }
}

impl fmt::Display for ContainerPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedContainerName {
    pub prefix: ContainerPrefix,
    /// Only present for `bridge-` names; informational, the entity is authoritative.
    pub type_hint: Option<String>,
    pub id: String,
}

pub fn container_name(type_id: &str, id: &str, expose_port: bool) -> String {
    if expose_port {
        format!("{}-{id}", ContainerPrefix::Service)
    } else {
        format!("{}-{type_id}-{id}", ContainerPrefix::Bridge)
    }
}

/// Recognize a managed container or config directory name. A leading `/`
/// (as reported by the runtime) is ignored.
pub fn parse_container_name(name: &str) -> Option<ParsedContainerName> {
    let name = name.strip_prefix('/').unwrap_or(name);
    let (head, rest) = name.split_once('-')?;
    let prefix = ContainerPrefix::from_segment(head)?;
    let (type_hint, id) = match rest.rsplit_once('-') {
        Some((t, id)) => (Some(t.to_owned()), id),
        None => (None, rest),
    };
    if id.is_empty() {
        return None;
    }
    Some(ParsedContainerName {
        prefix,
        type_hint: type_hint.filter(|t| !t.is_empty()),
        id: id.to_owned(),
    })
}

/// Entity ids are restricted to `[a-zA-Z0-9_]+`.
pub fn validate_id(id: &str) -> Result<(), SchemaError> {
    if !id.is_empty() && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        Ok(())
    } else {
        Err(SchemaError::InvalidId(id.to_owned()))
    }
}
