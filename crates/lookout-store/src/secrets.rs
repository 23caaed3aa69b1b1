//! Credential lookup trait and a static implementation.
//!
//! Device credentials are addressed by a secret reference stored on the
//! device record. The static store is filled from configuration; other
//! backends (vaults, secret services) implement [`SecretStore`].

use std::collections::HashMap;
use std::fmt;
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Errors that can occur while fetching credentials.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum SecretError {
    #[error("No credentials stored at secret reference '{0}'")]
    NotFound(String),

    #[error("Credentials at '{0}' are incomplete: username and password are required")]
    Incomplete(String),

    #[error("Secret backend error: {0}")]
    Backend(String),
}

/// Username and password for one device.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Trait for credential backends.
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Fetch credentials once, without waiting.
    async fn get_credentials(&self, secret_ref: &str) -> Result<Credentials, SecretError>;
}

/// Credentials held in memory, typically loaded from configuration.
#[derive(Default)]
pub struct StaticSecretStore {
    secrets: RwLock<HashMap<String, Credentials>>,
}

impl StaticSecretStore {
    pub fn new(secrets: HashMap<String, Credentials>) -> Self {
        Self {
            secrets: RwLock::new(secrets),
        }
    }

    /// Add or replace the credentials stored at `secret_ref`.
    pub fn insert(&self, secret_ref: impl Into<String>, credentials: Credentials) {
        let mut secrets = self
            .secrets
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        secrets.insert(secret_ref.into(), credentials);
    }
}

#[async_trait]
impl SecretStore for StaticSecretStore {
    async fn get_credentials(&self, secret_ref: &str) -> Result<Credentials, SecretError> {
        let secrets = self
            .secrets
            .read()
            .map_err(|e| SecretError::Backend(e.to_string()))?;
        let creds = secrets
            .get(secret_ref)
            .cloned()
            .ok_or_else(|| SecretError::NotFound(secret_ref.to_string()))?;
        if creds.username.is_empty() || creds.password.is_empty() {
            return Err(SecretError::Incomplete(secret_ref.to_string()));
        }
        Ok(creds)
    }
}

/// Poll `store` every `retry_interval` until credentials appear or
/// `max_wait` has elapsed, then return the last error.
///
/// Always makes at least one attempt, even with a zero `max_wait`.
pub async fn get_credentials_with_retry(
    store: &dyn SecretStore,
    secret_ref: &str,
    retry_interval: Duration,
    max_wait: Duration,
) -> Result<Credentials, SecretError> {
    let deadline = Instant::now() + max_wait;

    loop {
        let err = match store.get_credentials(secret_ref).await {
            Ok(creds) => return Ok(creds),
            Err(e) => e,
        };

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(err);
        }

        tracing::warn!(
            secret_ref = %secret_ref,
            error = %err,
            remaining_ms = remaining.as_millis() as u64,
            "Unable to retrieve device credentials, retrying"
        );
        tokio::time::sleep(retry_interval.min(remaining)).await;
    }
}
