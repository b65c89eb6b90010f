//! Broker credential seam.

use async_trait::async_trait;
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;
use tracing::debug;

const GENERATED_PASSWORD_LEN: usize = 32;

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("Cannot find a user with username={0}")]
    NotFound(String),
    #[error("credential request rejected: {0}")]
    Rejected(String),
}

/// What a principal's credential is scoped to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialScope {
    /// Grants access beyond the principal's own topics.
    pub privileged: bool,
    /// Id of the entity the principal acts for.
    pub scope_id: String,
}

#[async_trait]
pub trait CredentialService: Send + Sync {
    /// Register `principal` and return its password. A password is generated
    /// when none is given.
    async fn register(
        &self,
        principal: &str,
        password: Option<&str>,
        scope: CredentialScope,
    ) -> Result<String, CredentialError>;

    async fn unregister(&self, principal: &str) -> Result<(), CredentialError>;
}

struct Principal {
    password_hash: blake3::Hash,
    scope: CredentialScope,
}

/// In-memory credential store. Only password hashes are kept.
#[derive(Default)]
pub struct MemoryCredentials {
    principals: Mutex<BTreeMap<String, Principal>>,
}

impl MemoryCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    fn principals(&self) -> MutexGuard<'_, BTreeMap<String, Principal>> {
        self.principals
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub fn contains(&self, principal: &str) -> bool {
        self.principals().contains_key(principal)
    }

    pub fn verify(&self, principal: &str, password: &str) -> bool {
        self.principals()
            .get(principal)
            .is_some_and(|p| p.password_hash == blake3::hash(password.as_bytes()))
    }

    pub fn scope(&self, principal: &str) -> Option<CredentialScope> {
        self.principals().get(principal).map(|p| p.scope.clone())
    }

    pub fn len(&self) -> usize {
        self.principals().len()
    }

    pub fn is_empty(&self) -> bool {
        self.principals().is_empty()
    }
}

fn generate_password() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(GENERATED_PASSWORD_LEN)
        .map(char::from)
        .collect()
}

#[async_trait]
impl CredentialService for MemoryCredentials {
    async fn register(
        &self,
        principal: &str,
        password: Option<&str>,
        scope: CredentialScope,
    ) -> Result<String, CredentialError> {
        if principal.is_empty() {
            return Err(CredentialError::Rejected("empty principal".to_owned()));
        }
        let password = password.map_or_else(generate_password, str::to_owned);
        debug!("registering credential for {principal} (privileged: {})", scope.privileged);
        self.principals().insert(
            principal.to_owned(),
            Principal {
                password_hash: blake3::hash(password.as_bytes()),
                scope,
            },
        );
        Ok(password)
    }

    async fn unregister(&self, principal: &str) -> Result<(), CredentialError> {
        match self.principals().remove(principal) {
            Some(_) => Ok(()),
            None => Err(CredentialError::NotFound(principal.to_owned())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scope(id: &str) -> CredentialScope {
        CredentialScope {
            privileged: false,
            scope_id: id.to_owned(),
        }
    }

    #[tokio::test]
    async fn generated_password_verifies() {
        let creds = MemoryCredentials::new();
        let pass = creds.register("b1", None, scope("b1")).await.unwrap();
        assert_eq!(pass.len(), GENERATED_PASSWORD_LEN);
        assert!(creds.verify("b1", &pass));
        assert!(!creds.verify("b1", "wrong"));
    }

    #[tokio::test]
    async fn explicit_password_is_kept() {
        let creds = MemoryCredentials::new();
        let pass = creds.register("b1", Some("hunter2"), scope("b1")).await.unwrap();
        assert_eq!(pass, "hunter2");
        assert_eq!(creds.scope("b1").unwrap().scope_id, "b1");
    }

    #[tokio::test]
    async fn unregister_unknown_is_not_found() {
        let creds = MemoryCredentials::new();
        let err = creds.unregister("ghost").await.unwrap_err();
        assert!(matches!(err, CredentialError::NotFound(_)));
    }

    #[tokio::test]
    async fn unregister_removes() {
        let creds = MemoryCredentials::new();
        creds.register("b1", None, scope("b1")).await.unwrap();
        creds.unregister("b1").await.unwrap();
        assert!(!creds.contains("b1"));
        assert!(creds.is_empty());
    }
}
