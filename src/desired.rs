//! Desired replica mapping
//!
//! The mapping is a pure function of the current candidate and target sets: one
//! entry per (target namespace, candidate name) pair, carrying the candidate's
//! payload. It is recomputed from scratch on every pass.

use std::collections::btree_map;
use std::collections::BTreeMap;
use std::fmt;

use k8s_openapi::api::core::v1::{Namespace, Secret};
use k8s_openapi::ByteString;
use tracing::warn;

/// Address of a replica: the namespace it lives in and its name
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ReplicaKey {
    /// Target namespace
    pub namespace: String,
    /// Secret name (same as the source Secret's)
    pub name: String,
}

impl ReplicaKey {
    /// Create a replica key
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ReplicaKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Expected content of one replica
#[derive(Clone, Debug, PartialEq)]
pub struct DesiredReplica {
    /// Namespace of the source Secret
    pub source_namespace: String,
    /// Secret `type` copied from the source
    pub type_: Option<String>,
    /// Payload copied from the source
    pub data: BTreeMap<String, ByteString>,
}

impl DesiredReplica {
    /// `<namespace>/<name>` of the source Secret for a replica named `name`
    pub fn origin(&self, name: &str) -> String {
        format!("{}/{}", self.source_namespace, name)
    }
}

/// Full desired state of one pass, keyed by [`ReplicaKey`]
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DesiredMapping {
    entries: BTreeMap<ReplicaKey, DesiredReplica>,
}

impl DesiredMapping {
    /// Number of desired replicas
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing should be replicated
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether a replica at `key` is desired
    pub fn contains(&self, key: &ReplicaKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Desired content of the replica at `key`
    pub fn get(&self, key: &ReplicaKey) -> Option<&DesiredReplica> {
        self.entries.get(key)
    }

    /// Iterate entries in key order
    pub fn iter(&self) -> btree_map::Iter<'_, ReplicaKey, DesiredReplica> {
        self.entries.iter()
    }
}

impl<'a> IntoIterator for &'a DesiredMapping {
    type Item = (&'a ReplicaKey, &'a DesiredReplica);
    type IntoIter = btree_map::Iter<'a, ReplicaKey, DesiredReplica>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

/// Compute the desired mapping for every (target, candidate) pair
///
/// No filtering happens here; callers pass already-filtered candidates and
/// targets. Objects without a name cannot be addressed and are skipped.
pub fn compute_desired<'a, C, T>(candidates: C, targets: T) -> DesiredMapping
where
    C: IntoIterator<Item = &'a Secret>,
    T: IntoIterator<Item = &'a Namespace>,
{
    let sources: Vec<(&str, DesiredReplica)> = candidates
        .into_iter()
        .filter_map(|secret| {
            let Some(name) = secret.metadata.name.as_deref() else {
                warn!(namespace = ?secret.metadata.namespace, "Skipping candidate without a name");
                return None;
            };
            Some((
                name,
                DesiredReplica {
                    source_namespace: secret.metadata.namespace.clone().unwrap_or_default(),
                    type_: secret.type_.clone(),
                    data: secret.data.clone().unwrap_or_default(),
                },
            ))
        })
        .collect();

    // Same name from the same source namespace, so keys never collide
    let mut entries = BTreeMap::new();
    for target in targets {
        let Some(namespace) = target.metadata.name.as_deref() else {
            warn!("Skipping target namespace without a name");
            continue;
        };
        for (name, replica) in &sources {
            entries.insert(ReplicaKey::new(namespace, *name), replica.clone());
        }
    }

    DesiredMapping { entries }
}
