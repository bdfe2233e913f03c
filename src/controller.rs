//! Replication controller loop
//!
//! Owns the single logical worker that runs reconciliation passes. Passes are
//! started by three sources and never overlap:
//! - the bootstrap sweep, once, right after both watch caches synced
//! - watch notifications routed by [`EventRouter`], coalesced so a burst of
//!   notifications yields one pass
//! - the optional periodic resync, measured from the end of the last pass
//!
//! Shutdown lets an in-flight pass finish but starts no new one.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::time::{Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::cache::WatchCache;
use crate::client::SecretClient;
use crate::converge::{ConvergenceReport, Converger};
use crate::desired::compute_desired;
use crate::filter::SyncFilter;
use crate::metrics;
use crate::router::{EventRouter, Trigger, WatchEvent};
use crate::{Error, Result, SyncConfig};

/// What started a pass
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PassTrigger {
    /// First pass after the caches synced
    Bootstrap,
    /// One or more watch notifications
    Event,
    /// Periodic resync
    Resync,
}

impl PassTrigger {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Bootstrap => "bootstrap",
            Self::Event => "event",
            Self::Resync => "resync",
        }
    }
}

impl fmt::Display for PassTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The replication controller
pub struct Controller {
    config: SyncConfig,
    filter: SyncFilter,
    cache: Arc<dyn WatchCache>,
    converger: Converger,
}

impl Controller {
    /// Create a controller over a watch cache and a Secret writer
    pub fn new(
        config: SyncConfig,
        cache: Arc<dyn WatchCache>,
        client: Arc<dyn SecretClient>,
    ) -> Self {
        let filter = SyncFilter::new(&config);
        let converger = Converger::new(
            client,
            filter.clone(),
            config.max_concurrent_writes,
            config.prune_policy,
        );
        Self {
            config,
            filter,
            cache,
            converger,
        }
    }

    /// Controller configuration
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Run one full reconciliation pass against the current cache snapshot
    #[instrument(skip_all, fields(trigger = %trigger))]
    pub async fn reconcile_once(&self, trigger: PassTrigger) -> ConvergenceReport {
        let started = Instant::now();

        let sources = self.cache.list_candidate_secrets();
        let namespaces = self.cache.list_namespaces();
        let candidates: Vec<_> = sources
            .iter()
            .map(|s| s.as_ref())
            .filter(|s| self.filter.is_candidate(s))
            .collect();
        let targets: Vec<_> = namespaces
            .iter()
            .map(|ns| ns.as_ref())
            .filter(|ns| self.filter.is_target(ns))
            .collect();

        let desired = compute_desired(candidates.iter().copied(), targets.iter().copied());
        debug!(
            candidates = candidates.len(),
            targets = targets.len(),
            desired = desired.len(),
            "Computed desired replicas"
        );

        let report = self.converger.converge(&desired, self.cache.as_ref()).await;
        let elapsed = started.elapsed();
        metrics::record_pass(trigger.as_str(), desired.len(), &report, elapsed);

        if report.is_clean() {
            info!(
                desired = desired.len(),
                created = report.created,
                updated = report.updated,
                unchanged = report.unchanged,
                pruned = report.pruned,
                duration_ms = elapsed.as_millis() as u64,
                "Reconciliation pass complete"
            );
        } else {
            warn!(
                desired = desired.len(),
                created = report.created,
                updated = report.updated,
                unchanged = report.unchanged,
                pruned = report.pruned,
                failed = report.failures.len(),
                duration_ms = elapsed.as_millis() as u64,
                "Reconciliation pass finished with failures, next pass will retry"
            );
        }

        report
    }

    /// Run until `shutdown` fires
    ///
    /// Fails with [`Error::CacheSyncTimeout`] if the caches do not sync within
    /// the configured timeout, and with [`Error::Watch`] if a cache gives up
    /// before its initial listing or the notification stream ends.
    pub async fn run(
        &self,
        mut events: mpsc::Receiver<WatchEvent>,
        shutdown: CancellationToken,
    ) -> Result<()> {
        let mut router = EventRouter::new();
        let mut resync = self.config.resync_interval.map(resync_interval);

        info!(
            source_namespace = %self.config.source_namespace,
            sync_type = %self.config.sync_type,
            timeout_secs = self.config.cache_sync_timeout.as_secs(),
            "Waiting for watch caches to sync"
        );
        // Polled only until it completes; the guard below stops polling after sync
        let sync = tokio::time::timeout(
            self.config.cache_sync_timeout,
            self.cache.wait_for_sync(&shutdown),
        );
        tokio::pin!(sync);

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    info!("Shutdown requested, stopping controller");
                    return Ok(());
                }

                synced = &mut sync, if !router.is_synced() => match synced {
                    Err(_) => {
                        return Err(Error::CacheSyncTimeout(self.config.cache_sync_timeout));
                    }
                    Ok(false) if shutdown.is_cancelled() => {
                        info!("Stopped before watch caches synced");
                        return Ok(());
                    }
                    // A reflector went away before its first listing
                    Ok(false) => {
                        return Err(Error::watch(
                            "watch caches stopped before completing their initial listing",
                        ));
                    }
                    Ok(true) => {
                        if router.mark_synced() == Trigger::Sweep {
                            self.run_pass(PassTrigger::Bootstrap, &mut resync).await;
                        }
                    }
                },

                event = events.recv() => {
                    let Some(event) = event else {
                        return Err(Error::watch("notification stream ended"));
                    };
                    // Dropped while unsynced; the bootstrap sweep covers them
                    if router.route(&event) != Trigger::Reconcile {
                        continue;
                    }
                    let coalesced = drain_pending(&mut events, &mut router);
                    if coalesced > 0 {
                        debug!(coalesced, "Coalesced pending notifications into one pass");
                    }
                    // Never start a pass once shutdown was requested
                    if shutdown.is_cancelled() {
                        continue;
                    }
                    self.run_pass(PassTrigger::Event, &mut resync).await;
                }

                _ = next_tick(&mut resync), if router.is_synced() => {
                    self.run_pass(PassTrigger::Resync, &mut resync).await;
                }
            }
        }
    }

    async fn run_pass(&self, trigger: PassTrigger, resync: &mut Option<Interval>) {
        self.reconcile_once(trigger).await;
        if let Some(interval) = resync.as_mut() {
            interval.reset();
        }
    }
}

/// Consume every queued notification, returning how many were absorbed
fn drain_pending(events: &mut mpsc::Receiver<WatchEvent>, router: &mut EventRouter) -> usize {
    let mut coalesced = 0;
    while let Ok(event) = events.try_recv() {
        if router.route(&event) == Trigger::Reconcile {
            coalesced += 1;
        }
    }
    coalesced
}

fn resync_interval(period: Duration) -> Interval {
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

async fn next_tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
