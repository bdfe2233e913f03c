//! Convergence engine
//!
//! Applies a [`DesiredMapping`] against the API server. Each entry is handled
//! independently: a failing (namespace, name) pair is recorded in the
//! [`ConvergenceReport`] and never blocks or rolls back any other entry.
//!
//! Per entry, using the cached replica when the watch cache has one:
//! - cached replica with identical payload: nothing to do
//! - cached replica that differs: update with the cached resourceVersion
//! - no cached replica: create, falling back to update on `AlreadyExists`
//!
//! Transient failures are not retried within a pass; the next pass re-reads
//! the cache and tries again.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use tracing::{debug, info, warn};

use crate::cache::WatchCache;
use crate::client::{SecretClient, WriteError};
use crate::desired::{DesiredMapping, DesiredReplica, ReplicaKey};
use crate::filter::SyncFilter;
use crate::{
    PrunePolicy, LABEL_MANAGED_BY, LABEL_MANAGED_BY_SECRETSYNC, REPLICATED_FROM_ANNOTATION,
};

/// Write operation issued for an entry
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteOp {
    /// Create request
    Create,
    /// Replace request
    Update,
    /// Delete request (pruning)
    Delete,
}

impl fmt::Display for WriteOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Create => write!(f, "create"),
            Self::Update => write!(f, "update"),
            Self::Delete => write!(f, "delete"),
        }
    }
}

/// A single entry that did not converge during a pass
#[derive(Clone, Debug, PartialEq)]
pub struct EntryFailure {
    /// Replica that failed
    pub key: ReplicaKey,
    /// Operation that failed
    pub op: WriteOp,
    /// Why it failed
    pub error: WriteError,
}

/// Result of converging one entry
#[derive(Clone, Debug, PartialEq)]
pub enum EntryOutcome {
    /// Replica was created
    Created,
    /// Existing replica was replaced with the desired payload
    Updated,
    /// Replica already matched; no write issued
    Unchanged,
    /// Replica was no longer desired and was deleted
    Pruned,
    /// A write failed
    Failed(EntryFailure),
}

/// Tally of one convergence pass
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ConvergenceReport {
    /// Replicas created
    pub created: usize,
    /// Replicas updated
    pub updated: usize,
    /// Replicas already in the desired state
    pub unchanged: usize,
    /// Replicas deleted by pruning
    pub pruned: usize,
    /// Entries whose write failed
    pub failures: Vec<EntryFailure>,
}

impl ConvergenceReport {
    fn record(&mut self, outcome: EntryOutcome) {
        match outcome {
            EntryOutcome::Created => self.created += 1,
            EntryOutcome::Updated => self.updated += 1,
            EntryOutcome::Unchanged => self.unchanged += 1,
            EntryOutcome::Pruned => self.pruned += 1,
            EntryOutcome::Failed(failure) => self.failures.push(failure),
        }
    }

    /// Number of writes that changed cluster state
    pub fn changes(&self) -> usize {
        self.created + self.updated + self.pruned
    }

    /// Whether every entry converged
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Applies desired mappings through a [`SecretClient`]
pub struct Converger {
    client: Arc<dyn SecretClient>,
    filter: SyncFilter,
    max_concurrent_writes: usize,
    prune_policy: PrunePolicy,
}

impl Converger {
    /// Create a converger
    pub fn new(
        client: Arc<dyn SecretClient>,
        filter: SyncFilter,
        max_concurrent_writes: usize,
        prune_policy: PrunePolicy,
    ) -> Self {
        Self {
            client,
            filter,
            max_concurrent_writes: max_concurrent_writes.max(1),
            prune_policy,
        }
    }

    /// Converge every desired entry, then prune according to the policy
    pub async fn converge(
        &self,
        desired: &DesiredMapping,
        cache: &dyn WatchCache,
    ) -> ConvergenceReport {
        let mut report = ConvergenceReport::default();

        let work: Vec<(ReplicaKey, DesiredReplica, Option<Arc<Secret>>)> = desired
            .iter()
            .map(|(key, replica)| {
                let observed = cache.get_secret(&key.namespace, &key.name);
                (key.clone(), replica.clone(), observed)
            })
            .collect();

        let outcomes: Vec<EntryOutcome> = stream::iter(work)
            .map(|(key, replica, observed)| async move {
                self.converge_entry(&key, &replica, observed).await
            })
            .buffer_unordered(self.max_concurrent_writes)
            .collect()
            .await;
        for outcome in outcomes {
            report.record(outcome);
        }

        // Prune only after every desired entry had its chance to be written
        if self.prune_policy == PrunePolicy::Orphaned {
            let orphans: Vec<ReplicaKey> = cache
                .list_managed_replicas()
                .iter()
                .filter(|s| self.filter.is_managed_replica(s))
                .filter_map(|s| {
                    Some(ReplicaKey::new(
                        s.metadata.namespace.clone()?,
                        s.metadata.name.clone()?,
                    ))
                })
                .filter(|key| !desired.contains(key))
                .collect();

            let outcomes: Vec<EntryOutcome> = stream::iter(orphans)
                .map(|key| self.prune_entry(key))
                .buffer_unordered(self.max_concurrent_writes)
                .collect()
                .await;
            for outcome in outcomes {
                report.record(outcome);
            }
        }

        report
    }

    /// Converge a single entry
    pub async fn converge_entry(
        &self,
        key: &ReplicaKey,
        desired: &DesiredReplica,
        observed: Option<Arc<Secret>>,
    ) -> EntryOutcome {
        let replica = build_replica(key, desired);

        if let Some(existing) = observed {
            // Extra labels or annotations added by others are left alone
            if replica_matches(&existing, &replica) {
                debug!(replica = %key, "Replica already up to date");
                return EntryOutcome::Unchanged;
            }
            return self
                .update(key, replica, existing.metadata.resource_version.clone())
                .await;
        }

        match self.client.create(&replica).await {
            Ok(()) => {
                info!(replica = %key, "Created replica");
                EntryOutcome::Created
            }
            // Cache lagged behind the API server
            Err(WriteError::AlreadyExists) => {
                debug!(replica = %key, "Replica already exists, updating");
                self.update(key, replica, None).await
            }
            Err(error) => {
                warn!(replica = %key, error = %error, "Failed to create replica");
                EntryOutcome::Failed(EntryFailure {
                    key: key.clone(),
                    op: WriteOp::Create,
                    error,
                })
            }
        }
    }

    async fn update(
        &self,
        key: &ReplicaKey,
        mut replica: Secret,
        resource_version: Option<String>,
    ) -> EntryOutcome {
        // None means an unconditional replace
        replica.metadata.resource_version = resource_version;
        match self.client.replace(&replica).await {
            Ok(()) => {
                info!(replica = %key, "Updated replica");
                EntryOutcome::Updated
            }
            Err(error) => {
                warn!(replica = %key, error = %error, "Failed to update replica");
                EntryOutcome::Failed(EntryFailure {
                    key: key.clone(),
                    op: WriteOp::Update,
                    error,
                })
            }
        }
    }

    async fn prune_entry(&self, key: ReplicaKey) -> EntryOutcome {
        match self.client.delete(&key.namespace, &key.name).await {
            // Already gone counts as pruned
            Ok(()) | Err(WriteError::NotFound) => {
                info!(replica = %key, "Pruned replica that is no longer desired");
                EntryOutcome::Pruned
            }
            Err(error) => {
                warn!(replica = %key, error = %error, "Failed to prune replica");
                EntryOutcome::Failed(EntryFailure {
                    key,
                    op: WriteOp::Delete,
                    error,
                })
            }
        }
    }
}

/// Build the Secret written for a desired entry
///
/// Only the payload and type are copied from the source. The result never
/// carries a resourceVersion or uid: the API server rejects creates that do.
pub fn build_replica(key: &ReplicaKey, desired: &DesiredReplica) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(key.name.clone()),
            namespace: Some(key.namespace.clone()),
            labels: Some(BTreeMap::from([(
                LABEL_MANAGED_BY.to_string(),
                LABEL_MANAGED_BY_SECRETSYNC.to_string(),
            )])),
            annotations: Some(BTreeMap::from([(
                REPLICATED_FROM_ANNOTATION.to_string(),
                desired.origin(&key.name),
            )])),
            ..Default::default()
        },
        type_: desired.type_.clone(),
        data: Some(desired.data.clone()),
        ..Default::default()
    }
}

/// Whether an observed replica already has the content we would write
fn replica_matches(observed: &Secret, desired: &Secret) -> bool {
    let empty = BTreeMap::new();
    observed.data.as_ref().unwrap_or(&empty) == desired.data.as_ref().unwrap_or(&empty)
        && observed.type_ == desired.type_
        && has_entries(&observed.metadata.labels, &desired.metadata.labels)
        && has_entries(&observed.metadata.annotations, &desired.metadata.annotations)
}

fn has_entries(
    observed: &Option<BTreeMap<String, String>>,
    required: &Option<BTreeMap<String, String>>,
) -> bool {
    let Some(required) = required else {
        return true;
    };
    let Some(observed) = observed else {
        return required.is_empty();
    };
    required.iter().all(|(k, v)| observed.get(k) == Some(v))
}
