//! Where sandboxes and operator credentials come from.
//!
//! Both sources are asynchronous and may be slow or empty at first; the
//! launcher polls them and re-matches pending requests as they fill in.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::identity::Credential;

/// One sandbox as listed by the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxEntry {
    pub name: String,
    pub sandbox_id: String,
    #[serde(default)]
    pub access_key: Option<String>,
}

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("could not connect to registry at {0}")]
    Connect(String),

    #[error("request to registry at {0} timed out")]
    Timeout(String),

    #[error("registry rejected the token (status {0})")]
    Unauthorized(u16),

    #[error("registry returned status {0}")]
    Status(u16),

    #[error("invalid registry response: {0}")]
    Decode(#[source] reqwest::Error),

    #[error("registry request failed: {0}")]
    Http(#[source] reqwest::Error),
}

#[async_trait]
pub trait SandboxRegistry: Send + Sync {
    async fn list(&self) -> Result<Vec<SandboxEntry>, RegistryError>;
}

#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// The operator's bearer token, if one has been resolved yet.
    async fn current_token(&self) -> Option<Credential>;
}

/// Registry served over HTTP: `GET {base_url}/sandboxes`.
pub struct HttpRegistry {
    base_url: String,
    credentials: Arc<dyn CredentialStore>,
    client: reqwest::Client,
}

impl HttpRegistry {
    pub fn new(base_url: impl Into<String>, credentials: Arc<dyn CredentialStore>) -> Self {
        Self {
            base_url: base_url.into(),
            credentials,
            client: reqwest::Client::new(),
        }
    }

    fn sandboxes_url(&self) -> String {
        format!("{}/sandboxes", self.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl SandboxRegistry for HttpRegistry {
    async fn list(&self) -> Result<Vec<SandboxEntry>, RegistryError> {
        let url = self.sandboxes_url();
        let mut req = self.client.get(&url);
        if let Some(cred) = self.credentials.current_token().await {
            req = req.bearer_auth(cred.token());
        }

        let resp = req.send().await.map_err(|e| map_reqwest_error(&url, e))?;

        let status = resp.status();
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(RegistryError::Unauthorized(status.as_u16()));
        }
        if !status.is_success() {
            return Err(RegistryError::Status(status.as_u16()));
        }

        let entries: Vec<SandboxEntry> = resp.json().await.map_err(RegistryError::Decode)?;
        tracing::debug!(count = entries.len(), "registry listed sandboxes");
        Ok(entries)
    }
}

fn map_reqwest_error(url: &str, e: reqwest::Error) -> RegistryError {
    if e.is_connect() {
        RegistryError::Connect(url.to_string())
    } else if e.is_timeout() {
        RegistryError::Timeout(url.to_string())
    } else {
        RegistryError::Http(e)
    }
}

/// In-process registry whose contents are replaced by the host.
#[derive(Clone, Default)]
pub struct MemoryRegistry {
    entries: Arc<RwLock<Vec<SandboxEntry>>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, entries: Vec<SandboxEntry>) {
        *self.entries.write() = entries;
    }
}

#[async_trait]
impl SandboxRegistry for MemoryRegistry {
    async fn list(&self) -> Result<Vec<SandboxEntry>, RegistryError> {
        Ok(self.entries.read().clone())
    }
}

/// Credential store backed by a value the host can fill in later.
#[derive(Clone, Default)]
pub struct StaticCredentials {
    token: Arc<RwLock<Option<Credential>>>,
}

impl StaticCredentials {
    pub fn new(token: Option<Credential>) -> Self {
        Self {
            token: Arc::new(RwLock::new(token)),
        }
    }

    pub fn set(&self, token: Credential) {
        *self.token.write() = Some(token);
    }
}

#[async_trait]
impl CredentialStore for StaticCredentials {
    async fn current_token(&self) -> Option<Credential> {
        self.token.read().clone()
    }
}

/// Pick the operator token: explicit flag, then environment, then config.
/// Blank values are skipped.
pub fn resolve_token(
    flag: Option<&str>,
    env: Option<&str>,
    config: Option<&str>,
) -> Option<Credential> {
    [flag, env, config]
        .into_iter()
        .flatten()
        .map(str::trim)
        .find(|t| !t.is_empty())
        .map(Credential::new)
}
