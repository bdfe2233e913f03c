//! secretsync - replicate annotated Secrets into opted-in namespaces

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use secretsync::client::{create_client, KubeSecretClient};
use secretsync::events::{start_watchers, EVENT_CHANNEL_CAPACITY};
use secretsync::telemetry::{init_telemetry, LogFormat, TelemetryConfig};
use secretsync::{
    Controller, PrunePolicy, SyncConfig, DEFAULT_PROTECTED_NAMESPACES, DEFAULT_SOURCE_NAMESPACE,
    DEFAULT_SYNC_ANNOTATION, DEFAULT_SYNC_TYPE,
};

/// secretsync - replicate Secrets from a source namespace into annotated namespaces
#[derive(Parser, Debug)]
#[command(name = "secretsync", version, about, long_about = None)]
struct Cli {
    /// Path to a kubeconfig file (in-cluster config is used when unset)
    #[arg(long, env = "KUBECONFIG")]
    kubeconfig: Option<PathBuf>,

    /// Secret type that marks a source Secret for replication
    #[arg(long, env = "SECRETSYNC_SYNC_TYPE", default_value = DEFAULT_SYNC_TYPE)]
    sync_type: String,

    /// Annotation key that must be "true" on source Secrets and target namespaces
    #[arg(long, env = "SECRETSYNC_SYNC_ANNOTATION", default_value = DEFAULT_SYNC_ANNOTATION)]
    sync_annotation: String,

    /// Namespace holding the source Secrets
    #[arg(long, env = "SECRETSYNC_SOURCE_NAMESPACE", default_value = DEFAULT_SOURCE_NAMESPACE)]
    source_namespace: String,

    /// Comma-separated namespaces that never receive replicas
    #[arg(
        long = "protected-namespaces",
        env = "SECRETSYNC_PROTECTED_NAMESPACES",
        value_delimiter = ',',
        default_values_t = DEFAULT_PROTECTED_NAMESPACES.map(String::from)
    )]
    protected_namespaces: Vec<String>,

    /// Seconds between periodic full resyncs (0 disables resync)
    #[arg(long, env = "SECRETSYNC_RESYNC_INTERVAL_SECS", default_value = "300")]
    resync_interval_secs: u64,

    /// Seconds allowed for the initial cache listing before startup fails
    #[arg(long, env = "SECRETSYNC_CACHE_SYNC_TIMEOUT_SECS", default_value = "120")]
    cache_sync_timeout_secs: u64,

    /// Maximum replica writes in flight during one pass
    #[arg(long, env = "SECRETSYNC_MAX_CONCURRENT_WRITES", default_value = "8")]
    max_concurrent_writes: usize,

    /// What to do with replicas that are no longer desired: never or orphaned
    #[arg(long, env = "SECRETSYNC_PRUNE", default_value = "never")]
    prune: PrunePolicy,

    /// Log line format: json or text
    #[arg(long, env = "SECRETSYNC_LOG_FORMAT", default_value = "json")]
    log_format: LogFormat,

    /// Log filter directive (overrides RUST_LOG)
    #[arg(long, env = "SECRETSYNC_LOG_FILTER")]
    log_filter: Option<String>,

    /// OTLP collector endpoint for traces and metrics
    #[arg(long, env = "OTEL_EXPORTER_OTLP_ENDPOINT")]
    otlp_endpoint: Option<String>,
}

impl Cli {
    fn sync_config(&self) -> SyncConfig {
        SyncConfig {
            sync_type: self.sync_type.clone(),
            sync_annotation: self.sync_annotation.clone(),
            source_namespace: self.source_namespace.clone(),
            protected_namespaces: self
                .protected_namespaces
                .iter()
                .map(|ns| ns.trim())
                .filter(|ns| !ns.is_empty())
                .map(String::from)
                .collect::<BTreeSet<_>>(),
            resync_interval: (self.resync_interval_secs > 0)
                .then(|| Duration::from_secs(self.resync_interval_secs)),
            cache_sync_timeout: Duration::from_secs(self.cache_sync_timeout_secs),
            max_concurrent_writes: self.max_concurrent_writes,
            prune_policy: self.prune,
        }
    }

    fn telemetry_config(&self) -> TelemetryConfig {
        TelemetryConfig {
            log_format: self.log_format,
            log_filter: self.log_filter.clone(),
            otlp_endpoint: self.otlp_endpoint.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("failed to install TLS crypto provider: {e:?}");
        std::process::exit(1);
    }

    let cli = Cli::parse();

    let telemetry = init_telemetry(&cli.telemetry_config())?;

    let config = cli.sync_config();
    config.validate()?;

    info!(
        source_namespace = %config.source_namespace,
        sync_type = %config.sync_type,
        sync_annotation = %config.sync_annotation,
        protected = ?config.protected_namespaces,
        resync_secs = config.resync_interval.map(|d| d.as_secs()),
        prune = %config.prune_policy,
        "Starting secretsync controller"
    );

    let client = create_client(cli.kubeconfig.as_deref()).await?;

    let shutdown = CancellationToken::new();
    tokio::spawn(shutdown_signal(shutdown.clone()));

    let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let cache = start_watchers(client.clone(), &config, tx, shutdown.clone());
    let controller = Controller::new(
        config,
        Arc::new(cache),
        Arc::new(KubeSecretClient::new(client)),
    );

    let result = controller.run(rx, shutdown.clone()).await;
    // Stop the watchers even when the controller failed on its own
    shutdown.cancel();
    telemetry.shutdown();

    match result {
        Ok(()) => {
            info!("secretsync controller stopped");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, fatal = e.is_fatal(), "secretsync controller failed");
            Err(e.into())
        }
    }
}

/// Cancel `shutdown` on SIGINT or SIGTERM
async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
    shutdown.cancel();
}
