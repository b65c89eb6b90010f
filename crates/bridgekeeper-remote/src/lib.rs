//! Remote bridge type catalog served as a plain HTTP directory.

pub mod config;
pub mod http;
pub mod listing;
pub mod static_catalog;

pub use config::CatalogConfig;
pub use http::HttpCatalog;
pub use static_catalog::StaticCatalog;

use async_trait::async_trait;
use bridgekeeper_schema::BridgeTypeDescriptor;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("remote I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("HTTP error: {0}")]
    Http(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("catalog config error: {0}")]
    Config(String),
    #[error("invalid descriptor: {0}")]
    Schema(#[from] bridgekeeper_schema::SchemaError),
    #[error("catalog task failed: {0}")]
    Task(String),
}

/// Read access to the remote catalog of installable bridge types.
#[async_trait]
pub trait CatalogClient: Send + Sync {
    /// Every type id the catalog advertises.
    async fn list_types(&self) -> Result<Vec<String>, RemoteError>;

    async fn type_descriptor(&self, type_id: &str) -> Result<BridgeTypeDescriptor, RemoteError>;

    /// A file from the type's directory, e.g. its icon.
    async fn type_file(&self, type_id: &str, file: &str) -> Result<Vec<u8>, RemoteError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_error_display_not_found() {
        let e = RemoteError::NotFound("https://c/x/".to_owned());
        assert!(e.to_string().contains("https://c/x/"));
    }

    #[test]
    fn remote_error_from_schema() {
        let e: RemoteError = bridgekeeper_schema::SchemaError::EmptyRegistry.into();
        assert!(e.to_string().contains("registry"));
    }
}
