//! Watch cache boundary
//!
//! The reconciliation core reads cluster state only through [`WatchCache`]:
//! point-in-time snapshots of an eventually consistent local mirror. It never
//! assumes a snapshot reflects writes it just issued.

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Namespace, Secret};
use kube::runtime::reflector::{ObjectRef, Store};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::{LABEL_MANAGED_BY, LABEL_MANAGED_BY_SECRETSYNC};

/// Read-only view of the watched Secrets and Namespaces
#[async_trait]
pub trait WatchCache: Send + Sync {
    /// All Secrets in the source namespace (unfiltered)
    fn list_candidate_secrets(&self) -> Vec<Arc<Secret>>;

    /// All Namespaces (unfiltered)
    fn list_namespaces(&self) -> Vec<Arc<Namespace>>;

    /// Secrets carrying the managed-by label of this controller
    fn list_managed_replicas(&self) -> Vec<Arc<Secret>>;

    /// Look up one Secret
    fn get_secret(&self, namespace: &str, name: &str) -> Option<Arc<Secret>>;

    /// Wait until both kinds completed their initial listing
    ///
    /// Returns `false` if `shutdown` fired first or the cache can never sync.
    async fn wait_for_sync(&self, shutdown: &CancellationToken) -> bool;
}

/// [`WatchCache`] backed by kube-runtime reflector stores
#[derive(Clone)]
pub struct ReflectorCache {
    secrets: Store<Secret>,
    namespaces: Store<Namespace>,
    source_namespace: String,
}

impl ReflectorCache {
    /// Wrap the reflector stores fed by [`crate::events::start_watchers`]
    pub fn new(
        secrets: Store<Secret>,
        namespaces: Store<Namespace>,
        source_namespace: impl Into<String>,
    ) -> Self {
        Self {
            secrets,
            namespaces,
            source_namespace: source_namespace.into(),
        }
    }
}

#[async_trait]
impl WatchCache for ReflectorCache {
    fn list_candidate_secrets(&self) -> Vec<Arc<Secret>> {
        self.secrets
            .state()
            .into_iter()
            .filter(|s| s.metadata.namespace.as_deref() == Some(self.source_namespace.as_str()))
            .collect()
    }

    fn list_namespaces(&self) -> Vec<Arc<Namespace>> {
        self.namespaces.state()
    }

    fn list_managed_replicas(&self) -> Vec<Arc<Secret>> {
        self.secrets
            .state()
            .into_iter()
            .filter(|s| {
                s.metadata
                    .labels
                    .as_ref()
                    .and_then(|labels| labels.get(LABEL_MANAGED_BY))
                    .is_some_and(|v| v == LABEL_MANAGED_BY_SECRETSYNC)
            })
            .collect()
    }

    fn get_secret(&self, namespace: &str, name: &str) -> Option<Arc<Secret>> {
        self.secrets.get(&ObjectRef::new(name).within(namespace))
    }

    async fn wait_for_sync(&self, shutdown: &CancellationToken) -> bool {
        tokio::select! {
            _ = shutdown.cancelled() => false,
            (secrets, namespaces) = async {
                tokio::join!(
                    self.secrets.wait_until_ready(),
                    self.namespaces.wait_until_ready()
                )
            } => match (secrets, namespaces) {
                (Ok(()), Ok(())) => true,
                // Writer gone: the watch task ended before InitDone
                _ => {
                    warn!("Reflector writer dropped before the initial listing completed");
                    false
                }
            },
        }
    }
}
