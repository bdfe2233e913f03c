//! Candidate and target predicates
//!
//! Pure functions over watched objects: no I/O, no global state. The protected
//! namespace set and every other knob come from the [`SyncConfig`] the filter
//! is built from.

use std::collections::BTreeSet;

use k8s_openapi::api::core::v1::{Namespace, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use crate::{
    SyncConfig, LABEL_MANAGED_BY, LABEL_MANAGED_BY_SECRETSYNC, REPLICATED_FROM_ANNOTATION,
    SYNC_ENABLED_VALUE,
};

/// Decides which Secrets are replicated and which namespaces receive them
#[derive(Clone, Debug)]
pub struct SyncFilter {
    sync_type: String,
    sync_annotation: String,
    source_namespace: String,
    protected: BTreeSet<String>,
}

impl SyncFilter {
    /// Build a filter from the controller configuration
    pub fn new(config: &SyncConfig) -> Self {
        // Never replicate a source back into its own namespace
        let mut protected = config.protected_namespaces.clone();
        protected.insert(config.source_namespace.clone());
        Self {
            sync_type: config.sync_type.clone(),
            sync_annotation: config.sync_annotation.clone(),
            source_namespace: config.source_namespace.clone(),
            protected,
        }
    }

    /// Namespace holding the source Secrets
    pub fn source_namespace(&self) -> &str {
        &self.source_namespace
    }

    /// Whether a Secret should be replicated
    ///
    /// True iff it lives in the source namespace, carries the sync type, and its
    /// sync annotation is exactly `"true"`. `"TRUE"`, `"1"` and `""` do not count.
    pub fn is_candidate(&self, secret: &Secret) -> bool {
        secret.metadata.namespace.as_deref() == Some(self.source_namespace.as_str())
            && secret.type_.as_deref() == Some(self.sync_type.as_str())
            && sync_enabled(&secret.metadata, &self.sync_annotation)
    }

    /// Whether a namespace should receive replicas
    pub fn is_target(&self, namespace: &Namespace) -> bool {
        let Some(name) = namespace.metadata.name.as_deref() else {
            return false;
        };
        !self.protected.contains(name) && sync_enabled(&namespace.metadata, &self.sync_annotation)
    }

    /// Whether a Secret is a replica written by this controller for this source namespace
    pub fn is_managed_replica(&self, secret: &Secret) -> bool {
        // Sources themselves are never pruned
        if secret.metadata.namespace.as_deref() == Some(self.source_namespace.as_str()) {
            return false;
        }
        let managed = secret
            .metadata
            .labels
            .as_ref()
            .and_then(|labels| labels.get(LABEL_MANAGED_BY))
            .is_some_and(|v| v == LABEL_MANAGED_BY_SECRETSYNC);
        let from_source = secret
            .metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(REPLICATED_FROM_ANNOTATION))
            .and_then(|origin| origin.split_once('/'))
            .is_some_and(|(ns, _)| ns == self.source_namespace);
        managed && from_source
    }
}

/// Exact string comparison of the sync annotation against `"true"`
fn sync_enabled(meta: &ObjectMeta, key: &str) -> bool {
    meta.annotations
        .as_ref()
        .and_then(|annotations| annotations.get(key))
        .is_some_and(|value| value == SYNC_ENABLED_VALUE)
}
