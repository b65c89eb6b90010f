//! Reconciliation core for Bridgekeeper.
//!
//! Wires the schema, store, runtime and catalog crates into the
//! `BridgeTypeRegistry` and the `BridgeInstanceManager`, which serialize
//! through a shared `ResourceLock` table.

pub mod bus;
pub mod concurrency;
pub mod config;
pub mod container;
pub mod credentials;
pub mod engine;
pub mod instances;
pub mod lifecycle;
pub mod lock;
pub mod materialize;
pub mod poller;
pub mod registry;
pub mod stream;

pub use bus::{
    error_topic, EntityDirectory, EntityEvent, EntityKind, EntityRecord, Fields, MemoryDirectory,
    RoutingTable, Subscription,
};
pub use concurrency::{FlightGuard, ProcessLock, SingleFlight};
pub use config::{CoreConfig, RuntimeContext};
pub use credentials::{CredentialScope, CredentialService, MemoryCredentials};
pub use engine::{Core, CoreParts};
pub use instances::{BridgeInstanceManager, InstanceDeps, ReconcileOutcome};
pub use lifecycle::{validate_transition, DesiredStatus, ObservedState};
pub use lock::{LockGuard, LockInfo, ResourceLock};
pub use poller::CatalogPoller;
pub use registry::{BridgeTypeRegistry, RegistryDeps, TypeMembers, TypeStatus};

use bridgekeeper_schema::{SchemaError, ValidationErrors};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error classes reported to whoever issued a rejected request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    Validation,
    Exists,
    RaceCondition,
    NotFound,
    ConnectionError,
    UnknownError,
}

/// The `{code, fields, message}` object published on error topics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: ErrorCode,
    #[serde(default, skip_serializing_if = "ValidationErrors::is_empty")]
    pub fields: ValidationErrors,
    pub message: String,
}

impl ErrorPayload {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            fields: ValidationErrors::default(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("{message}")]
    Validation {
        fields: ValidationErrors,
        message: String,
    },
    #[error("{message}")]
    Exists {
        fields: ValidationErrors,
        message: String,
    },
    #[error("{0}")]
    RaceCondition(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Connection(String),
    /// Refused for a reason that has no more specific code.
    #[error("{0}")]
    Rejected(String),
    #[error("Bridge type {0} is not pulled.")]
    TypeNotInstalled(String),
    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },
    #[error("entity not found: {0}")]
    EntityNotFound(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("schema error: {0}")]
    Schema(#[from] SchemaError),
    #[error("store error: {0}")]
    Store(#[from] bridgekeeper_store::StoreError),
    #[error("runtime error: {0}")]
    Runtime(#[from] bridgekeeper_runtime::RuntimeError),
    #[error("catalog error: {0}")]
    Remote(#[from] bridgekeeper_remote::RemoteError),
    #[error("bus error: {0}")]
    Bus(#[from] bus::BusError),
    #[error("credential error: {0}")]
    Credential(#[from] credentials::CredentialError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CoreError {
    pub fn validation(field: &str, code: &str, message: impl Into<String>) -> Self {
        CoreError::Validation {
            fields: ValidationErrors::single(field, code),
            message: message.into(),
        }
    }

    /// True for failures whose text must not reach the requester.
    pub fn is_internal(&self) -> bool {
        !matches!(
            self,
            CoreError::Validation { .. }
                | CoreError::Exists { .. }
                | CoreError::RaceCondition(_)
                | CoreError::NotFound(_)
                | CoreError::Connection(_)
                | CoreError::Rejected(_)
                | CoreError::TypeNotInstalled(_)
                | CoreError::Schema(SchemaError::Validation(_))
        )
    }

    pub fn to_payload(&self) -> ErrorPayload {
        match self {
            CoreError::Validation { fields, message } => ErrorPayload {
                code: ErrorCode::Validation,
                fields: fields.clone(),
                message: message.clone(),
            },
            CoreError::Schema(SchemaError::Validation(fields)) => ErrorPayload {
                code: ErrorCode::Validation,
                fields: fields.clone(),
                message: "Validation error!".to_owned(),
            },
            CoreError::Exists { fields, message } => ErrorPayload {
                code: ErrorCode::Exists,
                fields: fields.clone(),
                message: message.clone(),
            },
            CoreError::RaceCondition(m) => ErrorPayload::new(ErrorCode::RaceCondition, m.clone()),
            CoreError::NotFound(m) => ErrorPayload::new(ErrorCode::NotFound, m.clone()),
            CoreError::Connection(m) => ErrorPayload::new(ErrorCode::ConnectionError, m.clone()),
            CoreError::Rejected(_) | CoreError::TypeNotInstalled(_) => {
                ErrorPayload::new(ErrorCode::UnknownError, self.to_string())
            }
            _ => ErrorPayload::new(ErrorCode::UnknownError, "Something went wrong"),
        }
    }
}
