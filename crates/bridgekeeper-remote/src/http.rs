use crate::listing::parse_type_listing;
use crate::{CatalogClient, CatalogConfig, RemoteError};
use async_trait::async_trait;
use bridgekeeper_schema::BridgeTypeDescriptor;
use std::io::Read;
use std::sync::Arc;

/// Catalog served over plain HTTP.
///
/// - `GET <base>`: HTML index, one sub-directory per type
/// - `GET <base><type>/<descriptor>`: the type's descriptor JSON
/// - `GET <base><type>/<file>`: any file the descriptor references
///
/// Requests are made with a blocking `ureq` agent on tokio's blocking pool.
#[derive(Clone)]
pub struct HttpCatalog {
    inner: Arc<Inner>,
}

struct Inner {
    config: CatalogConfig,
    agent: ureq::Agent,
}

impl HttpCatalog {
    pub fn new(config: CatalogConfig) -> Self {
        let agent = ureq::Agent::new_with_defaults();
        Self {
            inner: Arc::new(Inner { config, agent }),
        }
    }

    pub fn config(&self) -> &CatalogConfig {
        &self.inner.config
    }

    async fn get(&self, url: String) -> Result<Vec<u8>, RemoteError> {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || inner.do_get(&url))
            .await
            .map_err(|e| RemoteError::Task(e.to_string()))?
    }
}

impl Inner {
    fn do_get(&self, url: &str) -> Result<Vec<u8>, RemoteError> {
        tracing::debug!("GET {url}");
        let mut req = self.agent.get(url);
        if let Some(ref token) = self.config.auth_token {
            req = req.header("Authorization", &format!("Bearer {token}"));
        }
        let resp = match req.call() {
            Ok(r) => r,
            Err(ureq::Error::StatusCode(404)) => {
                return Err(RemoteError::NotFound(url.to_owned()));
            }
            Err(ureq::Error::StatusCode(code)) => {
                return Err(RemoteError::Http(format!("HTTP {code} for {url}")));
            }
            Err(e) => {
                return Err(RemoteError::Http(e.to_string()));
            }
        };

        let code = resp.status().as_u16();
        if code == 404 {
            return Err(RemoteError::NotFound(url.to_owned()));
        }
        if code >= 400 {
            return Err(RemoteError::Http(format!("HTTP {code} for {url}")));
        }

        let mut reader = resp.into_body().into_reader();
        let mut body = Vec::new();
        reader
            .read_to_end(&mut body)
            .map_err(|e| RemoteError::Http(e.to_string()))?;
        Ok(body)
    }
}

#[async_trait]
impl CatalogClient for HttpCatalog {
    async fn list_types(&self) -> Result<Vec<String>, RemoteError> {
        let body = self.get(self.inner.config.url.clone()).await?;
        let html = String::from_utf8(body).map_err(|e| RemoteError::Http(e.to_string()))?;
        Ok(parse_type_listing(&html))
    }

    async fn type_descriptor(&self, type_id: &str) -> Result<BridgeTypeDescriptor, RemoteError> {
        let body = self.get(self.inner.config.descriptor_url(type_id)).await?;
        let mut descriptor = BridgeTypeDescriptor::from_slice(&body)?;
        if descriptor.type_id.is_empty() {
            type_id.clone_into(&mut descriptor.type_id);
        }
        Ok(descriptor)
    }

    async fn type_file(&self, type_id: &str, file: &str) -> Result<Vec<u8>, RemoteError> {
        self.get(self.inner.config.file_url(type_id, file)).await
    }
}
