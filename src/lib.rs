//! secretsync - replicate annotated Secrets from a source namespace into opted-in namespaces
//!
//! A cluster-scoped controller that watches a designated source namespace for
//! Secrets tagged for distribution and keeps a copy of each of them in every
//! namespace that opted in via annotation, skipping a protected set.
//!
//! # Architecture
//!
//! Every reconciliation pass is level-triggered: desired state is recomputed
//! from the full watch cache snapshot and converged against the API server
//! through idempotent create/update calls. Watch notifications only decide
//! *when* a pass runs, never *what* it does.
//!
//! # Modules
//!
//! - [`filter`] - Candidate/target predicates
//! - [`desired`] - Desired replica mapping (target namespace × secret name)
//! - [`converge`] - Convergence engine (create, update-on-exists, prune)
//! - [`router`] - Watch notification routing (Unsynced/Synced state machine)
//! - [`controller`] - Controller loop: bootstrap sweep, event passes, periodic resync
//! - [`cache`] - Watch cache boundary and the kube-runtime reflector implementation
//! - [`client`] - Secret write boundary and the kube-rs implementation
//! - [`events`] - kube-runtime watchers feeding the cache and the router
//! - [`config`] - Controller configuration
//! - [`telemetry`] - Logging and OpenTelemetry setup
//! - [`metrics`] - OpenTelemetry instruments
//! - [`error`] - Error types

#![deny(missing_docs)]

pub mod cache;
pub mod client;
pub mod config;
pub mod controller;
pub mod converge;
pub mod desired;
pub mod error;
pub mod events;
pub mod filter;
pub mod metrics;
pub mod router;
pub mod telemetry;

pub use config::{PrunePolicy, SyncConfig};
pub use controller::Controller;
pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Default Configuration Constants
// =============================================================================

/// Default Secret `type` marking a Secret for distribution
pub const DEFAULT_SYNC_TYPE: &str = "secretsync.dev/replicated";

/// Default annotation key that opts Secrets and Namespaces into replication
pub const DEFAULT_SYNC_ANNOTATION: &str = "secretsync.dev/sync";

/// Default namespace holding the source Secrets
pub const DEFAULT_SOURCE_NAMESPACE: &str = "secretsync";

/// Namespaces that never receive replicas, even when annotated
pub const DEFAULT_PROTECTED_NAMESPACES: [&str; 4] = [
    "kube-node-lease",
    "kube-public",
    "kube-system",
    "local-path-storage",
];

/// Annotation value that enables replication (compared as an exact string)
pub const SYNC_ENABLED_VALUE: &str = "true";

/// Standard label identifying the controller that owns a resource
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";

/// Value of [`LABEL_MANAGED_BY`] on replicas written by this controller
pub const LABEL_MANAGED_BY_SECRETSYNC: &str = "secretsync";

/// Annotation on replicas recording their source as `<namespace>/<name>`
pub const REPLICATED_FROM_ANNOTATION: &str = "secretsync.dev/replicated-from";

/// Field manager used for every write issued by the controller
pub const FIELD_MANAGER: &str = "secretsync-controller";
