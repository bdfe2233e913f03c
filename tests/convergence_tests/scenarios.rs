//! Single-pass reconciliation stories

use std::sync::Arc;

use secretsync::cache::WatchCache;
use secretsync::client::SecretClient;
use secretsync::controller::PassTrigger;
use secretsync::{Controller, PrunePolicy, SyncConfig, REPLICATED_FROM_ANNOTATION};

use super::fake::{data_value, is_marked_replica, source_secret, FakeCluster};

fn controller(cluster: &Arc<FakeCluster>, config: SyncConfig) -> Controller {
    let cache: Arc<dyn WatchCache> = cluster.clone();
    let client: Arc<dyn SecretClient> = cluster.clone();
    Controller::new(config, cache, client)
}

/// Story: a platform team publishes `db-cred`; only the namespace that opted
/// in receives it
#[tokio::test]
async fn story_only_annotated_namespaces_receive_replicas() {
    let cluster = FakeCluster::new();
    cluster.put_namespace("secretsync", false);
    cluster.put_namespace("team-a", true);
    cluster.put_namespace("team-b", false);
    cluster.put_secret(source_secret("db-cred", &[("user", "a")]));

    let report = controller(&cluster, SyncConfig::default())
        .reconcile_once(PassTrigger::Bootstrap)
        .await;

    assert_eq!(report.created, 1);
    assert!(report.is_clean());
    assert_eq!(
        cluster.namespaces_with("db-cred"),
        vec!["secretsync".to_string(), "team-a".to_string()]
    );

    let replica = cluster.secret("team-a", "db-cred").unwrap();
    assert!(is_marked_replica(&replica));
    assert_eq!(data_value(&replica, "user").as_deref(), Some("a"));
    assert_eq!(replica.type_.as_deref(), Some("secretsync.dev/replicated"));
    assert_eq!(
        replica
            .metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(REPLICATED_FROM_ANNOTATION))
            .map(String::as_str),
        Some("secretsync/db-cred")
    );
}

/// Story: the source payload changes and the next pass updates every replica
/// in place instead of creating duplicates
#[tokio::test]
async fn story_payload_change_updates_replicas() {
    let cluster = FakeCluster::new();
    cluster.put_namespace("team-a", true);
    cluster.put_namespace("team-b", true);
    cluster.put_secret(source_secret("db-cred", &[("user", "a")]));
    let controller = controller(&cluster, SyncConfig::default());

    controller.reconcile_once(PassTrigger::Bootstrap).await;
    assert_eq!(cluster.creates(), 2);

    cluster.put_secret(source_secret("db-cred", &[("user", "b")]));
    let report = controller.reconcile_once(PassTrigger::Event).await;

    assert_eq!(report.updated, 2);
    assert_eq!(report.created, 0);
    assert_eq!(cluster.creates(), 2, "no duplicate create after the change");
    for ns in ["team-a", "team-b"] {
        let replica = cluster.secret(ns, "db-cred").unwrap();
        assert_eq!(data_value(&replica, "user").as_deref(), Some("b"));
    }
}

/// Story: someone annotates kube-system; it still never receives replicas
#[tokio::test]
async fn story_protected_namespaces_are_never_targeted() {
    let cluster = FakeCluster::new();
    cluster.put_namespace("kube-system", true);
    cluster.put_namespace("kube-public", true);
    cluster.put_namespace("secretsync", true);
    cluster.put_namespace("team-a", true);
    cluster.put_secret(source_secret("db-cred", &[("user", "a")]));

    let report = controller(&cluster, SyncConfig::default())
        .reconcile_once(PassTrigger::Bootstrap)
        .await;

    assert_eq!(report.created, 1);
    assert!(cluster.secret("kube-system", "db-cred").is_none());
    assert!(cluster.secret("kube-public", "db-cred").is_none());
    assert!(cluster.secret("team-a", "db-cred").is_some());
}

/// Story: the controller runs again over a converged cluster and writes nothing
#[tokio::test]
async fn story_converged_cluster_sees_zero_writes() {
    let cluster = FakeCluster::new();
    cluster.put_namespace("team-a", true);
    cluster.put_namespace("team-b", true);
    cluster.put_secret(source_secret("db-cred", &[("user", "a")]));
    cluster.put_secret(source_secret("api-key", &[("token", "t0k3n")]));
    let controller = controller(&cluster, SyncConfig::default());

    let first = controller.reconcile_once(PassTrigger::Bootstrap).await;
    assert_eq!(first.created, 4);
    let writes_after_first = cluster.writes();

    let second = controller.reconcile_once(PassTrigger::Resync).await;
    assert_eq!(second.unchanged, 4);
    assert_eq!(second.changes(), 0);
    assert_eq!(cluster.writes(), writes_after_first);
}

/// Story: one namespace rejects writes; every other namespace still converges
/// and the failure is retried on the next pass
#[tokio::test]
async fn story_failure_in_one_namespace_is_isolated() {
    let cluster = FakeCluster::new();
    for ns in ["team-a", "team-b", "team-c"] {
        cluster.put_namespace(ns, true);
    }
    cluster.put_secret(source_secret("db-cred", &[("user", "a")]));
    cluster.fail_writes_in("team-b");
    let controller = controller(&cluster, SyncConfig::default());

    let report = controller.reconcile_once(PassTrigger::Bootstrap).await;

    assert_eq!(report.created, 2);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].key.namespace, "team-b");
    assert!(cluster.secret("team-a", "db-cred").is_some());
    assert!(cluster.secret("team-b", "db-cred").is_none());
    assert!(cluster.secret("team-c", "db-cred").is_some());

    let retry = controller.reconcile_once(PassTrigger::Resync).await;
    assert_eq!(retry.failures.len(), 1, "still failing, still retried");
    assert_eq!(retry.unchanged, 2);
}

/// Story: an unmanaged Secret with the same name already sits in a target
/// namespace; it is taken over with the source content
#[tokio::test]
async fn story_existing_secret_is_taken_over() {
    let cluster = FakeCluster::new();
    cluster.put_namespace("team-a", true);
    cluster.put_secret(source_secret("db-cred", &[("user", "a")]));

    let mut squatter = source_secret("db-cred", &[("user", "stale")]);
    squatter.metadata.namespace = Some("team-a".to_string());
    squatter.metadata.annotations = None;
    cluster.put_secret(squatter);

    let report = controller(&cluster, SyncConfig::default())
        .reconcile_once(PassTrigger::Bootstrap)
        .await;

    assert_eq!(report.updated, 1);
    let replica = cluster.secret("team-a", "db-cred").unwrap();
    assert!(is_marked_replica(&replica));
    assert_eq!(data_value(&replica, "user").as_deref(), Some("a"));
}

/// Story: secrets that are not tagged, or tagged with a non-exact value, stay put
#[tokio::test]
async fn story_untagged_sources_are_not_replicated() {
    let cluster = FakeCluster::new();
    cluster.put_namespace("team-a", true);

    let mut wrong_type = source_secret("opaque", &[("k", "v")]);
    wrong_type.type_ = Some("Opaque".to_string());
    cluster.put_secret(wrong_type);

    let mut loud = source_secret("loud", &[("k", "v")]);
    loud.metadata.annotations = Some(
        [("secretsync.dev/sync".to_string(), "TRUE".to_string())]
            .into_iter()
            .collect(),
    );
    cluster.put_secret(loud);

    let report = controller(&cluster, SyncConfig::default())
        .reconcile_once(PassTrigger::Bootstrap)
        .await;

    assert_eq!(report.changes(), 0);
    assert_eq!(cluster.writes(), 0);
}

/// Story: with the default policy, replicas outlive their source
#[tokio::test]
async fn story_replicas_are_kept_by_default() {
    let cluster = FakeCluster::new();
    cluster.put_namespace("team-a", true);
    cluster.put_secret(source_secret("db-cred", &[("user", "a")]));
    let controller = controller(&cluster, SyncConfig::default());
    controller.reconcile_once(PassTrigger::Bootstrap).await;

    cluster.remove_secret("secretsync", "db-cred");
    let report = controller.reconcile_once(PassTrigger::Event).await;

    assert_eq!(report.pruned, 0);
    assert_eq!(cluster.deletes(), 0);
    assert!(cluster.secret("team-a", "db-cred").is_some());
}

/// Story: with orphan pruning, deleting a source or opting a namespace out
/// removes exactly the replicas that are no longer desired
#[tokio::test]
async fn story_orphaned_replicas_are_pruned() {
    let cluster = FakeCluster::new();
    cluster.put_namespace("team-a", true);
    cluster.put_namespace("team-b", true);
    cluster.put_secret(source_secret("db-cred", &[("user", "a")]));
    cluster.put_secret(source_secret("api-key", &[("token", "x")]));

    let mut unmanaged = source_secret("local", &[("k", "v")]);
    unmanaged.metadata.namespace = Some("team-a".to_string());
    cluster.put_secret(unmanaged);

    let config = SyncConfig {
        prune_policy: PrunePolicy::Orphaned,
        ..Default::default()
    };
    let controller = controller(&cluster, config);
    let first = controller.reconcile_once(PassTrigger::Bootstrap).await;
    assert_eq!(first.created, 4);
    assert_eq!(first.pruned, 0);

    cluster.remove_secret("secretsync", "api-key");
    cluster.put_namespace("team-b", false);
    let report = controller.reconcile_once(PassTrigger::Event).await;

    assert_eq!(report.pruned, 3);
    assert_eq!(cluster.namespaces_with("api-key"), Vec::<String>::new());
    assert!(cluster.secret("team-a", "db-cred").is_some());
    assert!(cluster.secret("team-b", "db-cred").is_none());
    assert!(
        cluster.secret("team-a", "local").is_some(),
        "unmanaged secrets are never pruned"
    );
    assert!(
        cluster.secret("secretsync", "db-cred").is_some(),
        "sources are never pruned"
    );
}
