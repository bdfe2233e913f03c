//! Watch notification routing
//!
//! The router is a two-state machine. While **Unsynced** (the watch caches have
//! not completed their initial listing) every notification is dropped: acting
//! on a partial cache would create or prune the wrong replicas. Once
//! **Synced**, every notification on either kind asks for a full pass; the
//! pass recomputes everything from the cache, so a stale or reordered event
//! cannot leave a namespace mismatched.

use std::fmt;
use std::sync::Arc;

use k8s_openapi::api::core::v1::{Namespace, Secret};
use tracing::{debug, info, warn};

/// Kind of change a notification reports
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangeKind {
    /// Object appeared
    Added,
    /// Object changed
    Updated,
    /// Object disappeared
    Deleted,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Added => write!(f, "added"),
            Self::Updated => write!(f, "updated"),
            Self::Deleted => write!(f, "deleted"),
        }
    }
}

/// The watched object a notification carries
#[derive(Clone, Debug)]
pub enum WatchedObject {
    /// A Secret in any namespace
    Secret(Arc<Secret>),
    /// A Namespace
    Namespace(Arc<Namespace>),
}

impl WatchedObject {
    /// Kind name used in logs
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Secret(_) => "Secret",
            Self::Namespace(_) => "Namespace",
        }
    }

    /// Object name, if the notification carries one
    pub fn name(&self) -> Option<&str> {
        match self {
            Self::Secret(s) => s.metadata.name.as_deref(),
            Self::Namespace(ns) => ns.metadata.name.as_deref(),
        }
    }

    /// Object namespace (Secrets only)
    pub fn namespace(&self) -> Option<&str> {
        match self {
            Self::Secret(s) => s.metadata.namespace.as_deref(),
            Self::Namespace(_) => None,
        }
    }
}

/// A notification from the watch layer
#[derive(Clone, Debug)]
pub struct WatchEvent {
    /// What happened
    pub change: ChangeKind,
    /// To which object
    pub object: WatchedObject,
}

impl WatchEvent {
    /// Notification for a Secret
    pub fn secret(change: ChangeKind, secret: Secret) -> Self {
        Self {
            change,
            object: WatchedObject::Secret(Arc::new(secret)),
        }
    }

    /// Notification for a Namespace
    pub fn namespace(change: ChangeKind, namespace: Namespace) -> Self {
        Self {
            change,
            object: WatchedObject::Namespace(Arc::new(namespace)),
        }
    }
}

/// Router state
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RouterState {
    /// Initial listing incomplete; notifications are dropped
    Unsynced,
    /// Caches complete; notifications trigger passes
    Synced,
}

/// What the controller should do in response to a routing decision
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Trigger {
    /// Nothing
    Ignore,
    /// Run the bootstrap sweep (first pass after sync)
    Sweep,
    /// Run a full reconciliation pass
    Reconcile,
}

/// Turns watch notifications into pass requests
#[derive(Debug)]
pub struct EventRouter {
    state: RouterState,
}

impl Default for EventRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl EventRouter {
    /// Create a router in the Unsynced state
    pub fn new() -> Self {
        Self {
            state: RouterState::Unsynced,
        }
    }

    /// Current state
    pub fn state(&self) -> RouterState {
        self.state
    }

    /// Whether the caches have synced
    pub fn is_synced(&self) -> bool {
        self.state == RouterState::Synced
    }

    /// Record that both caches completed their initial listing
    ///
    /// Returns [`Trigger::Sweep`] on the Unsynced → Synced transition and
    /// [`Trigger::Ignore`] afterwards.
    pub fn mark_synced(&mut self) -> Trigger {
        match self.state {
            RouterState::Unsynced => {
                info!("Watch caches synced, starting bootstrap sweep");
                self.state = RouterState::Synced;
                Trigger::Sweep
            }
            RouterState::Synced => Trigger::Ignore,
        }
    }

    /// Route one notification
    pub fn route(&mut self, event: &WatchEvent) -> Trigger {
        let Some(name) = event.object.name() else {
            warn!(
                kind = event.object.kind(),
                change = %event.change,
                "Skipping notification for an object without a name"
            );
            return Trigger::Ignore;
        };

        if self.state == RouterState::Unsynced {
            debug!(
                kind = event.object.kind(),
                name = %name,
                change = %event.change,
                "Ignoring notification before caches synced"
            );
            return Trigger::Ignore;
        }

        debug!(
            kind = event.object.kind(),
            namespace = ?event.object.namespace(),
            name = %name,
            change = %event.change,
            "Notification received, requesting full pass"
        );
        Trigger::Reconcile
    }
}
