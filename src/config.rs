//! Controller configuration
//!
//! A single immutable [`SyncConfig`] value is built at startup (from CLI flags
//! and environment in the binary, directly in tests) and handed to every
//! component that needs it. Nothing reads configuration from global state.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::{
    Error, DEFAULT_PROTECTED_NAMESPACES, DEFAULT_SOURCE_NAMESPACE, DEFAULT_SYNC_ANNOTATION,
    DEFAULT_SYNC_TYPE,
};

/// Default interval between periodic full resyncs
pub const DEFAULT_RESYNC_INTERVAL: Duration = Duration::from_secs(300);

/// Default time allowed for the watch caches' initial listing
pub const DEFAULT_CACHE_SYNC_TIMEOUT: Duration = Duration::from_secs(120);

/// Default number of replica writes in flight during a pass
pub const DEFAULT_MAX_CONCURRENT_WRITES: usize = 8;

/// What happens to replicas that are no longer desired
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PrunePolicy {
    /// Replicas are never deleted
    #[default]
    Never,
    /// Managed replicas missing from the desired mapping are deleted, covering
    /// both deleted source Secrets and namespaces that opted out
    Orphaned,
}

impl fmt::Display for PrunePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Never => write!(f, "never"),
            Self::Orphaned => write!(f, "orphaned"),
        }
    }
}

impl FromStr for PrunePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "never" => Ok(Self::Never),
            "orphaned" => Ok(Self::Orphaned),
            other => Err(format!(
                "unknown prune policy '{other}' (expected 'never' or 'orphaned')"
            )),
        }
    }
}

/// Configuration for the replication controller
#[derive(Clone, Debug, PartialEq)]
pub struct SyncConfig {
    /// Secret `type` a source Secret must carry to be replicated
    pub sync_type: String,
    /// Annotation key that must equal `"true"` on source Secrets and target namespaces
    pub sync_annotation: String,
    /// Namespace holding the source Secrets
    pub source_namespace: String,
    /// Namespaces that never receive replicas
    pub protected_namespaces: BTreeSet<String>,
    /// Interval between periodic full resyncs; `None` disables them
    pub resync_interval: Option<Duration>,
    /// Time allowed for the initial cache listing before startup fails
    pub cache_sync_timeout: Duration,
    /// Upper bound on concurrent replica writes within one pass
    pub max_concurrent_writes: usize,
    /// Deletion policy for replicas that are no longer desired
    pub prune_policy: PrunePolicy,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            sync_type: DEFAULT_SYNC_TYPE.to_string(),
            sync_annotation: DEFAULT_SYNC_ANNOTATION.to_string(),
            source_namespace: DEFAULT_SOURCE_NAMESPACE.to_string(),
            protected_namespaces: DEFAULT_PROTECTED_NAMESPACES
                .iter()
                .map(|ns| ns.to_string())
                .collect(),
            resync_interval: Some(DEFAULT_RESYNC_INTERVAL),
            cache_sync_timeout: DEFAULT_CACHE_SYNC_TIMEOUT,
            max_concurrent_writes: DEFAULT_MAX_CONCURRENT_WRITES,
            prune_policy: PrunePolicy::Never,
        }
    }
}

impl SyncConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<(), Error> {
        if self.sync_type.trim().is_empty() {
            return Err(Error::config("sync type must not be empty"));
        }
        if self.sync_annotation.trim().is_empty() {
            return Err(Error::config("sync annotation key must not be empty"));
        }
        if self.source_namespace.trim().is_empty() {
            return Err(Error::config("source namespace must not be empty"));
        }
        if self.max_concurrent_writes == 0 {
            return Err(Error::config("max concurrent writes must be at least 1"));
        }
        if self.cache_sync_timeout.is_zero() {
            return Err(Error::config("cache sync timeout must be greater than zero"));
        }
        if self.resync_interval.is_some_and(|i| i.is_zero()) {
            return Err(Error::config(
                "resync interval must be greater than zero (omit it to disable resync)",
            ));
        }
        Ok(())
    }

    /// Whether a namespace may never receive replicas
    ///
    /// The source namespace is always protected so the controller cannot
    /// write replicas over its own sources.
    pub fn is_protected(&self, namespace: &str) -> bool {
        namespace == self.source_namespace || self.protected_namespaces.contains(namespace)
    }
}
