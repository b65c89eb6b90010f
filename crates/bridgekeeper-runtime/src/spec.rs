use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Everything needed to create one bridge container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub env: BTreeMap<String, String>,
    pub binds: Vec<Bind>,
    pub ports: Vec<PortBinding>,
    pub network_mode: Option<String>,
    pub privileged: bool,
    pub sysctls: BTreeMap<String, String>,
    pub log: LogConfig,
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bind {
    pub source: String,
    pub target: String,
}

impl fmt::Display for Bind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.source, self.target)
    }
}

/// A container port published on the same host port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortBinding {
    pub port: String,
    pub protocol: String,
}

impl PortBinding {
    /// `port/protocol`, the key the runtime uses for exposed ports.
    pub fn key(&self) -> String {
        format!("{}/{}", self.port, self.protocol)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogConfig {
    pub driver: String,
    pub options: BTreeMap<String, String>,
}

impl Default for LogConfig {
    /// json-file, five rotated files of 20 MiB.
    fn default() -> Self {
        let mut options = BTreeMap::new();
        options.insert("max-file".to_owned(), "5".to_owned());
        options.insert("max-size".to_owned(), "20m".to_owned());
        Self {
            driver: "json-file".to_owned(),
            options,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContainerStatus {
    Created,
    Running,
    Paused,
    Restarting,
    Removing,
    Exited,
    Dead,
    Unknown(String),
}

impl ContainerStatus {
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "created" => ContainerStatus::Created,
            "running" => ContainerStatus::Running,
            "paused" => ContainerStatus::Paused,
            "restarting" => ContainerStatus::Restarting,
            "removing" => ContainerStatus::Removing,
            "exited" => ContainerStatus::Exited,
            "dead" => ContainerStatus::Dead,
            _ => ContainerStatus::Unknown(s.to_owned()),
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self, ContainerStatus::Running)
    }
}

impl fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContainerStatus::Created => f.write_str("created"),
            ContainerStatus::Running => f.write_str("running"),
            ContainerStatus::Paused => f.write_str("paused"),
            ContainerStatus::Restarting => f.write_str("restarting"),
            ContainerStatus::Removing => f.write_str("removing"),
            ContainerStatus::Exited => f.write_str("exited"),
            ContainerStatus::Dead => f.write_str("dead"),
            ContainerStatus::Unknown(s) => f.write_str(s),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerInfo {
    pub id: String,
    /// Without the leading `/`.
    pub name: String,
    pub image: String,
    pub status: ContainerStatus,
    pub labels: BTreeMap<String, String>,
    pub networks: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageInfo {
    pub id: String,
    pub repo_tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryAuth {
    pub username: String,
    pub password: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_log_retention() {
        let log = LogConfig::default();
        assert_eq!(log.driver, "json-file");
        assert_eq!(log.options.get("max-file").map(String::as_str), Some("5"));
        assert_eq!(log.options.get("max-size").map(String::as_str), Some("20m"));
    }

    #[test]
    fn status_parse() {
        assert!(ContainerStatus::parse("running").is_running());
        assert_eq!(ContainerStatus::parse("Exited"), ContainerStatus::Exited);
        assert_eq!(
            ContainerStatus::parse("zombie"),
            ContainerStatus::Unknown("zombie".to_owned())
        );
    }

    #[test]
    fn port_key_and_bind_display() {
        let p = PortBinding {
            port: "8080".to_owned(),
            protocol: "udp".to_owned(),
        };
        assert_eq!(p.key(), "8080/udp");
        let b = Bind {
            source: "/host/a".to_owned(),
            target: "/etc/a.js".to_owned(),
        };
        assert_eq!(b.to_string(), "/host/a:/etc/a.js");
    }
}
