//! Long-running controller loop stories

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::{Namespace, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use secretsync::cache::WatchCache;
use secretsync::client::SecretClient;
use secretsync::router::{ChangeKind, WatchEvent};
use secretsync::{Controller, Error, SyncConfig};

use super::fake::{quiet_config, source_secret, FakeCluster};

struct Running {
    events: mpsc::Sender<WatchEvent>,
    shutdown: CancellationToken,
    handle: JoinHandle<secretsync::Result<()>>,
}

fn spawn_controller(cluster: &Arc<FakeCluster>, config: SyncConfig) -> Running {
    let cache: Arc<dyn WatchCache> = cluster.clone();
    let client: Arc<dyn SecretClient> = cluster.clone();
    let controller = Controller::new(config, cache, client);

    let (events, rx) = mpsc::channel(64);
    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    let handle = tokio::spawn(async move { controller.run(rx, token).await });
    Running {
        events,
        shutdown,
        handle,
    }
}

/// Poll `condition` until it holds or `limit` elapses
async fn eventually(limit: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

fn namespace(name: &str) -> Namespace {
    Namespace {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Story: caches never finish listing, so the controller refuses to act and
/// fails once the sync timeout elapses
#[tokio::test(start_paused = true)]
async fn story_cache_sync_timeout_fails_startup() {
    let cluster = FakeCluster::never_synced();
    cluster.put_namespace("team-a", true);
    cluster.put_secret(source_secret("db-cred", &[("user", "a")]));

    let config = SyncConfig {
        cache_sync_timeout: Duration::from_secs(5),
        ..quiet_config()
    };
    let running = spawn_controller(&cluster, config);

    let result = running.handle.await.unwrap();
    assert!(matches!(result, Err(Error::CacheSyncTimeout(d)) if d == Duration::from_secs(5)));
    assert_eq!(cluster.writes(), 0);
}

/// Story: a reflector dies before its first listing; startup fails instead of
/// exiting cleanly
#[tokio::test]
async fn story_cache_abandoning_sync_fails_startup() {
    let cluster = FakeCluster::abandoned_sync();
    cluster.put_namespace("team-a", true);
    cluster.put_secret(source_secret("db-cred", &[("user", "a")]));

    let running = spawn_controller(&cluster, quiet_config());

    let result = running.handle.await.unwrap();
    assert!(matches!(result, Err(Error::Watch(_))));
    assert_eq!(cluster.writes(), 0);
}

/// Story: notifications arrive while the caches are still listing; none of
/// them starts a pass over the partial cache
#[tokio::test(start_paused = true)]
async fn story_notifications_before_sync_never_trigger_a_pass() {
    let cluster = FakeCluster::never_synced();
    cluster.put_namespace("team-a", true);
    cluster.put_secret(source_secret("db-cred", &[("user", "a")]));

    let running = spawn_controller(&cluster, quiet_config());
    for change in [ChangeKind::Added, ChangeKind::Updated, ChangeKind::Deleted] {
        running
            .events
            .send(WatchEvent::secret(
                change,
                source_secret("db-cred", &[("user", "a")]),
            ))
            .await
            .unwrap();
    }
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(cluster.writes(), 0);
    assert!(cluster.secret("team-a", "db-cred").is_none());

    running.shutdown.cancel();
    assert!(running.handle.await.unwrap().is_ok());
}

/// Story: shutdown arrives while the bootstrap pass is writing; the write in
/// flight completes, and the notification queued behind it starts no pass
#[tokio::test]
async fn story_shutdown_mid_pass_finishes_writes_without_new_pass() {
    let cluster = FakeCluster::new();
    cluster.put_namespace("team-a", true);
    cluster.put_secret(source_secret("db-cred", &[("user", "a")]));
    let gate = cluster.hold_creates();

    let running = spawn_controller(&cluster, quiet_config());
    tokio::time::timeout(Duration::from_secs(5), gate.entered())
        .await
        .expect("bootstrap pass reached the API");

    running.shutdown.cancel();
    cluster.put_namespace("team-b", true);
    running
        .events
        .send(WatchEvent::namespace(ChangeKind::Added, namespace("team-b")))
        .await
        .unwrap();
    gate.open();

    assert!(running.handle.await.unwrap().is_ok());
    assert!(
        cluster.secret("team-a", "db-cred").is_some(),
        "in-flight create ran to completion"
    );
    assert!(cluster.secret("team-b", "db-cred").is_none());
    assert_eq!(cluster.creates(), 1);
}

/// Story: the operator stops the controller before the caches synced
#[tokio::test]
async fn story_shutdown_before_sync_is_clean() {
    let cluster = FakeCluster::never_synced();
    let running = spawn_controller(&cluster, quiet_config());

    running.shutdown.cancel();
    let result = running.handle.await.unwrap();
    assert!(result.is_ok());
    assert_eq!(cluster.writes(), 0);
}

/// Story: once the caches sync, the bootstrap sweep converges the cluster
/// without any notification
#[tokio::test]
async fn story_bootstrap_sweep_converges_without_events() {
    let cluster = FakeCluster::new();
    cluster.put_namespace("team-a", true);
    cluster.put_namespace("team-b", true);
    cluster.put_secret(source_secret("db-cred", &[("user", "a")]));

    let running = spawn_controller(&cluster, quiet_config());

    assert!(
        eventually(Duration::from_secs(5), || {
            cluster.secret("team-a", "db-cred").is_some()
                && cluster.secret("team-b", "db-cred").is_some()
        })
        .await
    );
    assert_eq!(cluster.creates(), 2);

    running.shutdown.cancel();
    assert!(running.handle.await.unwrap().is_ok());
}

/// Story: a namespace opts in after startup and the notification about it
/// triggers a pass that replicates into it
#[tokio::test]
async fn story_namespace_notification_triggers_pass() {
    let cluster = FakeCluster::new();
    cluster.put_namespace("team-a", true);
    cluster.put_secret(source_secret("db-cred", &[("user", "a")]));

    let running = spawn_controller(&cluster, quiet_config());
    assert!(eventually(Duration::from_secs(5), || cluster.creates() == 1).await);

    cluster.put_namespace("team-b", true);
    running
        .events
        .send(WatchEvent::namespace(ChangeKind::Added, namespace("team-b")))
        .await
        .unwrap();

    assert!(
        eventually(Duration::from_secs(5), || cluster
            .secret("team-b", "db-cred")
            .is_some())
        .await
    );

    running.shutdown.cancel();
    assert!(running.handle.await.unwrap().is_ok());
}

/// Story: a burst of notifications collapses into few passes, and the cluster
/// ends up converged to the last state
#[tokio::test]
async fn story_notification_burst_converges_to_latest_state() {
    let cluster = FakeCluster::new();
    cluster.put_namespace("team-a", true);
    cluster.put_secret(source_secret("db-cred", &[("user", "v0")]));

    let running = spawn_controller(&cluster, quiet_config());
    assert!(eventually(Duration::from_secs(5), || cluster.creates() == 1).await);

    for i in 1..=20 {
        let value = format!("v{i}");
        let source = source_secret("db-cred", &[("user", value.as_str())]);
        cluster.put_secret(source.clone());
        running
            .events
            .send(WatchEvent::secret(ChangeKind::Updated, source))
            .await
            .unwrap();
    }

    assert!(
        eventually(Duration::from_secs(5), || {
            cluster
                .secret("team-a", "db-cred")
                .and_then(|s| super::fake::data_value(&s, "user"))
                .as_deref()
                == Some("v20")
        })
        .await
    );
    assert_eq!(cluster.creates(), 1, "updates never recreate the replica");
    assert!(cluster.replaces() <= 20);

    running.shutdown.cancel();
    assert!(running.handle.await.unwrap().is_ok());
}

/// Story: nothing notifies the controller about a change, but the periodic
/// resync picks it up
#[tokio::test(start_paused = true)]
async fn story_periodic_resync_repairs_missed_changes() {
    let cluster = FakeCluster::new();
    cluster.put_namespace("team-a", true);
    cluster.put_secret(source_secret("db-cred", &[("user", "a")]));

    let config = SyncConfig {
        resync_interval: Some(Duration::from_secs(60)),
        ..Default::default()
    };
    let running = spawn_controller(&cluster, config);
    assert!(eventually(Duration::from_secs(1), || cluster.creates() == 1).await);

    // Someone deletes the replica and the notification is lost
    cluster.remove_secret("team-a", "db-cred");

    assert!(
        eventually(Duration::from_secs(120), || cluster
            .secret("team-a", "db-cred")
            .is_some())
        .await
    );
    assert_eq!(cluster.creates(), 2);

    running.shutdown.cancel();
    assert!(running.handle.await.unwrap().is_ok());
}

/// Story: the watch layer goes away, which the controller treats as fatal
#[tokio::test]
async fn story_closed_notification_stream_is_fatal() {
    let cluster = FakeCluster::new();
    let running = spawn_controller(&cluster, quiet_config());

    drop(running.events);
    let result = running.handle.await.unwrap();
    assert!(matches!(result, Err(Error::Watch(_))));
}

/// Story: secrets outside the source namespace generate notifications too, but
/// a pass over them changes nothing
#[tokio::test]
async fn story_unrelated_notifications_are_harmless() {
    let cluster = FakeCluster::new();
    cluster.put_namespace("team-a", true);

    let running = spawn_controller(&cluster, quiet_config());

    let unrelated = Secret {
        metadata: ObjectMeta {
            name: Some("app-config".to_string()),
            namespace: Some("team-a".to_string()),
            ..Default::default()
        },
        ..Default::default()
    };
    running
        .events
        .send(WatchEvent::secret(ChangeKind::Added, unrelated))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(cluster.writes(), 0);
    running.shutdown.cancel();
    assert!(running.handle.await.unwrap().is_ok());
}
