//! Fleet supervisor: one reconciler task per member cluster, started and
//! stopped as membership changes arrive.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use chartfleet_core::config::RetryPolicy;
use chartfleet_core::ClusterRef;
use chartfleet_kubehub::{ClusterAccess, ClusterLookup};
use chartfleet_persist::ChartStore;
use metrics::gauge;
use rustc_hash::FxHashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::reconciler::Reconciler;

/// Store attempts per removal before the purge is deferred to the next change.
const PURGE_ATTEMPTS: u32 = 5;

/// One batch of membership changes.
#[derive(Default)]
pub struct FleetChange {
    pub added: Vec<Arc<dyn ClusterAccess>>,
    pub removed: Vec<ClusterRef>,
}

impl FleetChange {
    pub fn added(access: Vec<Arc<dyn ClusterAccess>>) -> Self {
        Self { added: access, removed: Vec::new() }
    }

    pub fn removed(clusters: Vec<ClusterRef>) -> Self {
        Self { added: Vec::new(), removed: clusters }
    }
}

/// Read-only snapshot of the fleet, swapped whole on every change.
#[derive(Default)]
pub struct FleetView {
    clusters: ArcSwap<FxHashMap<String, Arc<dyn ClusterAccess>>>,
}

impl FleetView {
    /// A fixed view over already-connected clusters, with no reconcilers behind it.
    pub fn from_clusters(clusters: impl IntoIterator<Item = Arc<dyn ClusterAccess>>) -> Self {
        let view = Self::default();
        view.replace(clusters);
        view
    }

    fn replace(&self, clusters: impl IntoIterator<Item = Arc<dyn ClusterAccess>>) {
        let map: FxHashMap<String, Arc<dyn ClusterAccess>> = clusters.into_iter().map(|a| (a.cluster().key(), a)).collect();
        self.clusters.store(Arc::new(map));
    }

    pub fn get(&self, cluster: &ClusterRef) -> Option<Arc<dyn ClusterAccess>> {
        self.clusters.load().get(&cluster.key()).cloned()
    }

    pub fn len(&self) -> usize {
        self.clusters.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ClusterLookup for FleetView {
    fn cluster_access(&self, cluster: &ClusterRef) -> Option<Arc<dyn ClusterAccess>> {
        self.get(cluster)
    }
}

struct WatcherHandle {
    access: Arc<dyn ClusterAccess>,
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

pub struct FleetWatcher {
    store: Arc<dyn ChartStore>,
    retry: RetryPolicy,
    watchers: HashMap<String, WatcherHandle>,
    /// Removed clusters whose cached charts could not be deleted yet.
    unpurged: HashMap<String, ClusterRef>,
    view: Arc<FleetView>,
}

impl FleetWatcher {
    pub fn new(store: Arc<dyn ChartStore>, retry: RetryPolicy) -> Self {
        Self { store, retry, watchers: HashMap::new(), unpurged: HashMap::new(), view: Arc::new(FleetView::default()) }
    }

    pub fn view(&self) -> Arc<FleetView> {
        Arc::clone(&self.view)
    }

    /// Keys of clusters with a running reconciler.
    pub fn clusters(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.watchers.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Keys of removed clusters still holding cached charts.
    pub fn pending_purges(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.unpurged.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub async fn apply(&mut self, change: FleetChange) {
        for cluster in change.removed {
            self.stop(&cluster).await;
        }
        self.retry_purges();
        for access in change.added {
            self.start(access);
        }
        self.publish();
    }

    fn start(&mut self, access: Arc<dyn ClusterAccess>) {
        let key = access.cluster().key();
        if let Some(existing) = self.watchers.get(&key) {
            if !existing.join.is_finished() {
                debug!(cluster = %key, "reconciler already running");
                return;
            }
            info!(cluster = %key, "restarting exited reconciler");
        }
        if self.unpurged.remove(&key).is_some() {
            warn!(cluster = %key, "cluster re-added before its old charts were purged");
        }
        let cancel = CancellationToken::new();
        let reconciler = Reconciler::new(Arc::clone(&access), Arc::clone(&self.store), self.retry);
        let join = tokio::spawn(reconciler.run(cancel.clone()));
        info!(cluster = %key, "cluster watch started");
        self.watchers.insert(key, WatcherHandle { access, cancel, join });
    }

    async fn stop(&mut self, cluster: &ClusterRef) {
        let key = cluster.key();
        let Some(handle) = self.watchers.remove(&key) else {
            debug!(cluster = %key, "removal of unknown cluster ignored");
            return;
        };
        handle.cancel.cancel();
        handle.join.abort();
        if let Err(e) = handle.join.await {
            if !e.is_cancelled() {
                warn!(cluster = %key, error = %e, "reconciler task failed");
            }
        }
        info!(cluster = %key, "cluster watch stopped");
        self.purge(cluster).await;
    }

    async fn purge(&mut self, cluster: &ClusterRef) {
        let key = cluster.key();
        for attempt in 0..PURGE_ATTEMPTS {
            match self.store.delete_all_charts_for_cluster(cluster) {
                Ok(()) => {
                    self.unpurged.remove(&key);
                    return;
                }
                Err(e) if attempt + 1 < PURGE_ATTEMPTS => {
                    let delay = self.retry.delay(attempt);
                    warn!(cluster = %key, error = %e, attempt, retry_in_ms = delay.as_millis() as u64, "failed to purge charts of removed cluster");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => warn!(cluster = %key, error = %e, "giving up purging charts until the next fleet change"),
            }
        }
        self.unpurged.insert(key, cluster.clone());
    }

    /// One more attempt for every deferred purge.
    fn retry_purges(&mut self) {
        let store = Arc::clone(&self.store);
        self.unpurged.retain(|key, cluster| match store.delete_all_charts_for_cluster(cluster) {
            Ok(()) => {
                info!(cluster = %key, "deferred purge done");
                false
            }
            Err(e) => {
                warn!(cluster = %key, error = %e, "deferred purge failed");
                true
            }
        });
    }

    fn publish(&self) {
        self.view.replace(self.watchers.values().map(|h| Arc::clone(&h.access)));
        gauge!("chartfleet_fleet_clusters", self.watchers.len() as f64);
    }

    /// Cancel every reconciler and wait for them to exit. Cached charts stay.
    pub async fn shutdown(&mut self) {
        for (key, handle) in self.watchers.drain() {
            handle.cancel.cancel();
            if let Err(e) = handle.join.await {
                warn!(cluster = %key, error = %e, "reconciler task failed");
            }
        }
        self.publish();
    }

    /// Consume membership changes until the channel closes or `cancel` fires.
    pub async fn run(mut self, mut changes: mpsc::Receiver<FleetChange>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                change = changes.recv() => match change {
                    Some(change) => self.apply(change).await,
                    None => break,
                },
            }
        }
        self.shutdown().await;
        info!("fleet watcher stopped");
    }
}

/// Handle to a spawned `FleetWatcher`.
pub struct FleetHandle {
    pub view: Arc<FleetView>,
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

impl FleetHandle {
    pub async fn shutdown(self) {
        self.cancel.cancel();
        let _ = self.join.await;
    }
}

/// Spawn the supervisor. Returns a sender for membership changes and a handle for reads.
pub fn spawn_fleet_watcher(store: Arc<dyn ChartStore>, retry: RetryPolicy, cap: usize) -> (mpsc::Sender<FleetChange>, FleetHandle) {
    let (tx, rx) = mpsc::channel(cap.max(1));
    let watcher = FleetWatcher::new(store, retry);
    let view = watcher.view();
    let cancel = CancellationToken::new();
    let join = tokio::spawn(watcher.run(rx, cancel.clone()));
    (tx, FleetHandle { view, cancel, join })
}
