//! Watch layer
//!
//! Runs one reflector per watched kind (Secrets in every namespace, and
//! Namespaces). Each reflector feeds a [`Store`] that backs the
//! [`ReflectorCache`] and forwards every change to the controller as a
//! [`WatchEvent`]. Watch errors are retried with kube-runtime's default
//! backoff; they never stop the stream.

use std::collections::HashSet;
use std::fmt::Debug;
use std::hash::Hash;

use futures::{Stream, StreamExt};
use k8s_openapi::api::core::v1::{Namespace, Secret};
use kube::runtime::reflector::{self, ObjectRef, Store};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Client, Resource};
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::ReflectorCache;
use crate::router::{ChangeKind, WatchEvent};
use crate::SyncConfig;

/// Capacity of the notification channel between watchers and controller
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Server-side watch timeout; shorter than typical proxy idle timeouts
const WATCH_TIMEOUT_SECS: u32 = 25;

/// Start the Secret and Namespace reflectors
///
/// Returns the cache over both stores immediately; use
/// [`crate::cache::WatchCache::wait_for_sync`] before trusting it. The
/// background tasks stop when `shutdown` fires or `tx` is closed.
pub fn start_watchers(
    client: Client,
    config: &SyncConfig,
    tx: mpsc::Sender<WatchEvent>,
    shutdown: CancellationToken,
) -> ReflectorCache {
    let secrets = spawn_reflector(
        Api::<Secret>::all(client.clone()),
        WatchEvent::secret,
        tx.clone(),
        shutdown.clone(),
    );
    let namespaces = spawn_reflector(
        Api::<Namespace>::all(client),
        WatchEvent::namespace,
        tx,
        shutdown,
    );

    info!(
        source_namespace = %config.source_namespace,
        "Started Secret and Namespace watchers"
    );
    ReflectorCache::new(secrets, namespaces, config.source_namespace.clone())
}

fn spawn_reflector<K>(
    api: Api<K>,
    to_event: fn(ChangeKind, K) -> WatchEvent,
    tx: mpsc::Sender<WatchEvent>,
    shutdown: CancellationToken,
) -> Store<K>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    K::DynamicType: Default + Eq + Hash + Clone + Send + Sync,
{
    let (store, writer) = reflector::store::<K>();
    let stream = watcher(api, watcher::Config::default().timeout(WATCH_TIMEOUT_SECS))
        .default_backoff()
        .reflect(writer);

    tokio::spawn(forward_events(stream, to_event, tx, shutdown));
    store
}

/// Drive a reflected watch stream and forward its changes
async fn forward_events<K, S>(
    stream: S,
    to_event: fn(ChangeKind, K) -> WatchEvent,
    tx: mpsc::Sender<WatchEvent>,
    shutdown: CancellationToken,
) where
    K: Resource + Clone,
    K::DynamicType: Default + Eq + Hash + Clone,
    S: Stream<Item = Result<watcher::Event<K>, watcher::Error>>,
{
    let kind = K::kind(&K::DynamicType::default()).to_string();
    let mut tracker = ChangeTracker::<K>::default();
    let mut stream = std::pin::pin!(stream);

    loop {
        let next = tokio::select! {
            _ = shutdown.cancelled() => {
                debug!(kind = %kind, "Watcher stopping on shutdown");
                return;
            }
            next = stream.next() => next,
        };

        let event = match next {
            Some(Ok(event)) => event,
            Some(Err(e)) => {
                warn!(kind = %kind, error = %e, "Watch error, retrying with backoff");
                continue;
            }
            None => {
                warn!(kind = %kind, "Watch stream ended");
                return;
            }
        };

        for (change, object) in tracker.classify(event) {
            if tx.send(to_event(change, object)).await.is_err() {
                debug!(kind = %kind, "Notification channel closed, watcher stopping");
                return;
            }
        }
    }
}

/// Tells Added from Updated by remembering which objects were seen
struct ChangeTracker<K: Resource>
where
    K::DynamicType: Eq + Hash,
{
    seen: HashSet<ObjectRef<K>>,
}

impl<K: Resource> Default for ChangeTracker<K>
where
    K::DynamicType: Eq + Hash,
{
    fn default() -> Self {
        Self {
            seen: HashSet::new(),
        }
    }
}

impl<K> ChangeTracker<K>
where
    K: Resource,
    K::DynamicType: Default + Eq + Hash + Clone,
{
    fn classify(&mut self, event: watcher::Event<K>) -> Vec<(ChangeKind, K)> {
        match event {
            watcher::Event::Apply(obj) | watcher::Event::InitApply(obj) => {
                let change = if self.seen.insert(ObjectRef::from_obj(&obj)) {
                    ChangeKind::Added
                } else {
                    ChangeKind::Updated
                };
                vec![(change, obj)]
            }
            watcher::Event::Delete(obj) => {
                self.seen.remove(&ObjectRef::from_obj(&obj));
                vec![(ChangeKind::Deleted, obj)]
            }
            // A re-list follows; objects deleted during the gap get no Delete
            watcher::Event::Init => {
                self.seen.clear();
                Vec::new()
            }
            watcher::Event::InitDone => Vec::new(),
        }
    }
}
