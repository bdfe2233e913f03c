//! Metrics for secretsync observability
//!
//! OpenTelemetry instruments for reconciliation passes and replica writes.
//! They are no-ops until a meter provider is installed by
//! [`crate::telemetry::init_telemetry`].

use std::time::Duration;

use once_cell::sync::Lazy;
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Gauge, Histogram, Meter};
use opentelemetry::KeyValue;

use crate::converge::ConvergenceReport;

/// Global meter for secretsync metrics
static METER: Lazy<Meter> = Lazy::new(|| global::meter("secretsync"));

/// Counter of reconciliation passes
///
/// Labels:
/// - `trigger`: bootstrap, event, resync
pub static PASSES_TOTAL: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("secretsync_passes_total")
        .with_description("Total number of reconciliation passes")
        .with_unit("{passes}")
        .build()
});

/// Histogram of reconciliation pass duration
///
/// Labels:
/// - `trigger`: bootstrap, event, resync
pub static PASS_DURATION: Lazy<Histogram<f64>> = Lazy::new(|| {
    METER
        .f64_histogram("secretsync_pass_duration_seconds")
        .with_description("Duration of reconciliation passes in seconds")
        .with_unit("s")
        .build()
});

/// Counter of replica outcomes
///
/// Labels:
/// - `outcome`: created, updated, unchanged, pruned, failed
pub static REPLICA_OUTCOMES: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("secretsync_replica_outcomes_total")
        .with_description("Replica entries processed, by outcome")
        .with_unit("{replicas}")
        .build()
});

/// Gauge of desired replicas in the most recent pass
pub static DESIRED_REPLICAS: Lazy<Gauge<u64>> = Lazy::new(|| {
    METER
        .u64_gauge("secretsync_desired_replicas")
        .with_description("Number of replicas desired by the last pass")
        .with_unit("{replicas}")
        .build()
});

/// Record one finished pass
pub fn record_pass(
    trigger: &'static str,
    desired: usize,
    report: &ConvergenceReport,
    duration: Duration,
) {
    let trigger_label = [KeyValue::new("trigger", trigger)];
    PASSES_TOTAL.add(1, &trigger_label);
    PASS_DURATION.record(duration.as_secs_f64(), &trigger_label);
    DESIRED_REPLICAS.record(desired as u64, &[]);

    for (outcome, count) in [
        ("created", report.created),
        ("updated", report.updated),
        ("unchanged", report.unchanged),
        ("pruned", report.pruned),
        ("failed", report.failures.len()),
    ] {
        if count > 0 {
            REPLICA_OUTCOMES.add(count as u64, &[KeyValue::new("outcome", outcome)]);
        }
    }
}
