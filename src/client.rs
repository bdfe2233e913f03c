//! Secret write boundary
//!
//! The convergence engine only ever writes through [`SecretClient`], which
//! lets unit tests swap in a mock and integration tests an in-memory cluster.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::api::{Api, DeleteParams, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use thiserror::Error;

use crate::{Error, FIELD_MANAGER};

/// Default connection timeout for kube clients
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default read timeout for kube clients
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Outcome classes of a failed Secret write
///
/// `AlreadyExists` on create is the normal steady state and drives the update
/// fallback. `Conflict` means the resourceVersion was stale. Everything else
/// is transient from the controller's point of view and is retried by the
/// next pass.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum WriteError {
    /// The Secret already exists (create)
    #[error("already exists")]
    AlreadyExists,

    /// The resourceVersion precondition was stale (update)
    #[error("conflict: {0}")]
    Conflict(String),

    /// The Secret does not exist (update after a concurrent delete, delete)
    #[error("not found")]
    NotFound,

    /// The Secret cannot be written as built (missing name or namespace)
    #[error("invalid object: {0}")]
    Invalid(String),

    /// Any other API failure (network, timeout, server error, forbidden)
    #[error("api error: {0}")]
    Api(String),
}

impl From<kube::Error> for WriteError {
    fn from(err: kube::Error) -> Self {
        match err {
            kube::Error::Api(resp) if resp.code == 409 && resp.reason == "AlreadyExists" => {
                Self::AlreadyExists
            }
            kube::Error::Api(resp) if resp.code == 409 => Self::Conflict(resp.message),
            kube::Error::Api(resp) if resp.code == 404 => Self::NotFound,
            other => Self::Api(other.to_string()),
        }
    }
}

/// Trait abstracting Secret writes against the API server
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SecretClient: Send + Sync {
    /// Create a Secret; fails with [`WriteError::AlreadyExists`] on an identity collision
    async fn create(&self, secret: &Secret) -> Result<(), WriteError>;

    /// Replace a Secret; fails with [`WriteError::Conflict`] if its resourceVersion is stale
    ///
    /// A Secret without a resourceVersion is replaced unconditionally.
    async fn replace(&self, secret: &Secret) -> Result<(), WriteError>;

    /// Delete a Secret
    async fn delete(&self, namespace: &str, name: &str) -> Result<(), WriteError>;
}

/// [`SecretClient`] backed by the kube-rs typed Secret API
#[derive(Clone)]
pub struct KubeSecretClient {
    client: Client,
}

impl KubeSecretClient {
    /// Wrap a kube client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api_for(&self, secret: &Secret) -> Result<(Api<Secret>, String), WriteError> {
        let namespace = secret
            .metadata
            .namespace
            .as_deref()
            .ok_or_else(|| WriteError::Invalid("secret has no namespace".to_string()))?;
        let name = secret
            .metadata
            .name
            .clone()
            .ok_or_else(|| WriteError::Invalid("secret has no name".to_string()))?;
        Ok((Api::namespaced(self.client.clone(), namespace), name))
    }

    fn post_params() -> PostParams {
        PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        }
    }
}

#[async_trait]
impl SecretClient for KubeSecretClient {
    async fn create(&self, secret: &Secret) -> Result<(), WriteError> {
        let (api, _) = self.api_for(secret)?;
        api.create(&Self::post_params(), secret).await?;
        Ok(())
    }

    async fn replace(&self, secret: &Secret) -> Result<(), WriteError> {
        let (api, name) = self.api_for(secret)?;
        api.replace(&name, &Self::post_params(), secret).await?;
        Ok(())
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), WriteError> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        api.delete(name, &DeleteParams::default()).await?;
        Ok(())
    }
}

/// Create a kube client from an optional kubeconfig path with default timeouts
pub async fn create_client(kubeconfig: Option<&Path>) -> Result<Client, Error> {
    let mut config = match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path)
                .map_err(|e| Error::config(format!("failed to read kubeconfig: {e}")))?;
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(|e| Error::config(format!("failed to load kubeconfig: {e}")))?
        }
        None => Config::infer()
            .await
            .map_err(|e| Error::config(format!("failed to infer kube config: {e}")))?,
    };
    config.connect_timeout = Some(DEFAULT_CONNECT_TIMEOUT);
    config.read_timeout = Some(DEFAULT_READ_TIMEOUT);
    Ok(Client::try_from(config)?)
}
