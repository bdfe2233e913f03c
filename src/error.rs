//! Error types for the secretsync controller

use std::time::Duration;

use thiserror::Error;

use crate::telemetry::TelemetryError;

/// Main error type for secretsync operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Invalid controller configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// The watch caches did not finish their initial listing in time
    #[error("watch caches did not sync within {}s", .0.as_secs())]
    CacheSyncTimeout(Duration),

    /// The watch notification stream ended or failed
    #[error("watch error: {0}")]
    Watch(String),

    /// Logging or OpenTelemetry setup failed
    #[error("telemetry error: {0}")]
    Telemetry(#[from] TelemetryError),
}

impl Error {
    /// Create a configuration error with the given message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a watch error with the given message
    pub fn watch(msg: impl Into<String>) -> Self {
        Self::Watch(msg.into())
    }

    /// Whether the controller should stop rather than keep reconciling
    ///
    /// A controller that never saw a complete cache must not act on it, and a
    /// controller without notifications cannot observe the cluster.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::CacheSyncTimeout(_) | Self::Watch(_) | Self::Config(_) | Self::Telemetry(_)
        )
    }
}
