#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chartfleet_core::config::RetryPolicy;
use chartfleet_core::{Chart, ChartKind, ClusterRef, RepositoryRef};
use chartfleet_indexer::{spawn_fleet_watcher, FleetChange, FleetView, FleetWatcher};
use chartfleet_kubehub::testing::{repository, FakeClusterAccess};
use chartfleet_kubehub::{ClusterAccess, ClusterLookup, RepositoryEvent};
use chartfleet_persist::{CacheError, ChartReader, ChartStore, ChartWriter, Result, SqliteChartStore};

const INDEX: &str = "apiVersion: v1\nentries:\n  nginx:\n    - name: nginx\n      version: 1.0.0\n";

fn index_url(cluster: &str) -> String {
    format!("http://source-controller.flux-system.svc.cluster.local./helmrepository/{}/charts/index.yaml", cluster)
}

fn fake(name: &str) -> Arc<FakeClusterAccess> {
    let f = Arc::new(FakeClusterAccess::new(ClusterRef::new(name, "clusters")));
    f.serve(&index_url(name), INDEX);
    f
}

fn store() -> Arc<SqliteChartStore> {
    Arc::new(SqliteChartStore::open_in_memory().unwrap())
}

fn retry() -> RetryPolicy {
    RetryPolicy { base: Duration::from_millis(50), max: Duration::from_millis(200) }
}

fn charts_on(store: &SqliteChartStore, cluster: &str) -> usize {
    store.list_charts_by_cluster(&ClusterRef::new(cluster, "clusters"), None).unwrap().len()
}

/// Sqlite store whose cluster purge fails a set number of times first.
struct FlakyStore {
    inner: Arc<SqliteChartStore>,
    purge_failures: AtomicUsize,
}

impl FlakyStore {
    fn new(inner: Arc<SqliteChartStore>, failures: usize) -> Self {
        Self { inner, purge_failures: AtomicUsize::new(failures) }
    }
}

impl ChartWriter for FlakyStore {
    fn add_chart(&self, cluster: &ClusterRef, repo: &RepositoryRef, chart: &Chart) -> Result<()> {
        self.inner.add_chart(cluster, repo, chart)
    }
    fn remove_chart(&self, cluster: &ClusterRef, repo: &RepositoryRef, name: &str, version: &str) -> Result<()> {
        self.inner.remove_chart(cluster, repo, name, version)
    }
    fn delete(&self, cluster: &ClusterRef, repo: &RepositoryRef) -> Result<()> {
        self.inner.delete(cluster, repo)
    }
    fn delete_all_charts_for_cluster(&self, cluster: &ClusterRef) -> Result<()> {
        let left = self.purge_failures.load(Ordering::SeqCst);
        if left > 0 {
            self.purge_failures.store(left - 1, Ordering::SeqCst);
            return Err(CacheError::Poisoned);
        }
        self.inner.delete_all_charts_for_cluster(cluster)
    }
}

impl ChartReader for FlakyStore {
    fn list_charts_by_repository_and_cluster(&self, cluster: &ClusterRef, repo: &RepositoryRef, kind: Option<ChartKind>) -> Result<Vec<Chart>> {
        self.inner.list_charts_by_repository_and_cluster(cluster, repo, kind)
    }
    fn is_known_chart(&self, cluster: &ClusterRef, repo: &RepositoryRef, chart: &Chart) -> Result<bool> {
        self.inner.is_known_chart(cluster, repo, chart)
    }
    fn get_chart_values(&self, cluster: &ClusterRef, repo: &RepositoryRef, chart: &Chart) -> Result<Option<Vec<u8>>> {
        self.inner.get_chart_values(cluster, repo, chart)
    }
    fn update_values_yaml(&self, cluster: &ClusterRef, repo: &RepositoryRef, chart: &Chart, values: &[u8]) -> Result<()> {
        self.inner.update_values_yaml(cluster, repo, chart, values)
    }
    fn get_latest_version(&self, cluster: &ClusterRef, repo: &RepositoryRef, name: &str) -> Result<Option<String>> {
        self.inner.get_latest_version(cluster, repo, name)
    }
    fn get_layer(&self, cluster: &ClusterRef, repo: &RepositoryRef, name: &str, version: &str) -> Result<Option<String>> {
        self.inner.get_layer(cluster, repo, name, version)
    }
    fn list_charts_by_cluster(&self, cluster: &ClusterRef, kind: Option<ChartKind>) -> Result<Vec<(RepositoryRef, Chart)>> {
        self.inner.list_charts_by_cluster(cluster, kind)
    }
    fn count(&self) -> Result<u64> {
        self.inner.count()
    }
}

async fn eventually(mut cond: impl FnMut() -> bool) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met in time");
}

#[tokio::test]
async fn added_clusters_are_watched_once() {
    let store = store();
    let mut fleet = FleetWatcher::new(store.clone() as Arc<dyn ChartStore>, retry());
    let a = fake("a");
    fleet.apply(FleetChange::added(vec![a.clone() as Arc<dyn ClusterAccess>])).await;
    fleet.apply(FleetChange::added(vec![a.clone() as Arc<dyn ClusterAccess>])).await;
    assert_eq!(fleet.clusters(), vec!["clusters/a".to_string()]);

    let view = fleet.view();
    assert!(view.cluster_access(&ClusterRef::new("a", "clusters")).is_some());
    assert!(view.cluster_access(&ClusterRef::new("b", "clusters")).is_none());

    a.send(RepositoryEvent::Applied(repository("charts", "a", &index_url("a"), "r1")));
    eventually(|| charts_on(&store, "a") == 1).await;
    fleet.shutdown().await;
    assert!(view.is_empty());
}

#[tokio::test]
async fn removal_stops_in_flight_fetch_and_purges_cluster() {
    let store = store();
    let mut fleet = FleetWatcher::new(store.clone() as Arc<dyn ChartStore>, retry());
    let a = fake("a");
    let b = fake("b");
    a.hang(&index_url("a"));
    fleet.apply(FleetChange::added(vec![a.clone() as Arc<dyn ClusterAccess>, b.clone() as Arc<dyn ClusterAccess>])).await;

    // charts cached for "a" before the stall
    let cluster_a = ClusterRef::new("a", "clusters");
    store.add_chart(&cluster_a, &RepositoryRef::helm_repository("old", "a"), &Chart::reference("old", "0.1.0")).unwrap();

    a.send(RepositoryEvent::Applied(repository("charts", "a", &index_url("a"), "r1")));
    b.send(RepositoryEvent::Applied(repository("charts", "b", &index_url("b"), "r1")));
    eventually(|| !a.fetches().is_empty()).await;
    eventually(|| charts_on(&store, "b") == 1).await;

    tokio::time::timeout(Duration::from_secs(2), fleet.apply(FleetChange::removed(vec![cluster_a.clone()])))
        .await
        .expect("removal must not wait for the stalled fetch");

    assert_eq!(fleet.clusters(), vec!["clusters/b".to_string()]);
    assert!(fleet.view().get(&cluster_a).is_none());
    assert_eq!(charts_on(&store, "a"), 0);
    assert_eq!(charts_on(&store, "b"), 1);

    // the unblocked fetch belongs to a stopped reconciler and must not write
    a.release(&index_url("a"));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(charts_on(&store, "a"), 0);
    assert_eq!(charts_on(&store, "b"), 1);
    fleet.shutdown().await;
}

#[tokio::test]
async fn failed_purge_is_retried_on_removal() {
    let sqlite = store();
    let cluster_a = ClusterRef::new("a", "clusters");
    sqlite.add_chart(&cluster_a, &RepositoryRef::helm_repository("old", "a"), &Chart::reference("old", "0.1.0")).unwrap();
    let flaky = Arc::new(FlakyStore::new(sqlite.clone(), 1));
    let mut fleet = FleetWatcher::new(flaky.clone() as Arc<dyn ChartStore>, retry());
    fleet.apply(FleetChange::added(vec![fake("a") as Arc<dyn ClusterAccess>])).await;

    fleet.apply(FleetChange::removed(vec![cluster_a])).await;
    assert_eq!(flaky.purge_failures.load(Ordering::SeqCst), 0);
    assert_eq!(charts_on(&sqlite, "a"), 0);
    assert!(fleet.pending_purges().is_empty());
}

#[tokio::test]
async fn exhausted_purge_is_finished_on_next_change() {
    let sqlite = store();
    let cluster_a = ClusterRef::new("a", "clusters");
    sqlite.add_chart(&cluster_a, &RepositoryRef::helm_repository("old", "a"), &Chart::reference("old", "0.1.0")).unwrap();
    let flaky = Arc::new(FlakyStore::new(sqlite.clone(), 5));
    let mut fleet = FleetWatcher::new(flaky as Arc<dyn ChartStore>, retry());
    fleet.apply(FleetChange::added(vec![fake("a") as Arc<dyn ClusterAccess>])).await;

    fleet.apply(FleetChange::removed(vec![cluster_a])).await;
    assert_eq!(fleet.pending_purges(), vec!["clusters/a".to_string()]);
    assert_eq!(charts_on(&sqlite, "a"), 1);

    fleet.apply(FleetChange::added(vec![fake("b") as Arc<dyn ClusterAccess>])).await;
    assert!(fleet.pending_purges().is_empty());
    assert_eq!(charts_on(&sqlite, "a"), 0);
    fleet.shutdown().await;
}

#[tokio::test]
async fn static_view_looks_up_without_watching() {
    let a = fake("a");
    let view = FleetView::from_clusters(vec![a.clone() as Arc<dyn ClusterAccess>, fake("b") as Arc<dyn ClusterAccess>]);
    assert_eq!(view.len(), 2);
    assert!(view.get(&ClusterRef::new("a", "clusters")).is_some());
    assert!(view.cluster_access(&ClusterRef::new("c", "clusters")).is_none());
    assert!(a.fetches().is_empty());
}

#[tokio::test]
async fn failing_cluster_does_not_affect_others() {
    let store = store();
    let mut fleet = FleetWatcher::new(store.clone() as Arc<dyn ChartStore>, retry());
    let bad = fake("bad");
    let good = fake("good");
    bad.fail_next_fetches(usize::MAX);
    fleet.apply(FleetChange::added(vec![bad.clone() as Arc<dyn ClusterAccess>, good.clone() as Arc<dyn ClusterAccess>])).await;

    bad.send(RepositoryEvent::Applied(repository("charts", "bad", &index_url("bad"), "r1")));
    good.send(RepositoryEvent::Applied(repository("charts", "good", &index_url("good"), "r1")));
    eventually(|| charts_on(&store, "good") == 1).await;
    eventually(|| bad.fetches().len() >= 2).await;
    assert_eq!(charts_on(&store, "bad"), 0);
    assert_eq!(fleet.clusters().len(), 2);
    fleet.shutdown().await;
}

#[tokio::test]
async fn unknown_removal_is_a_no_op() {
    let mut fleet = FleetWatcher::new(store() as Arc<dyn ChartStore>, retry());
    fleet.apply(FleetChange::removed(vec![ClusterRef::new("ghost", "clusters")])).await;
    assert!(fleet.clusters().is_empty());
}

#[tokio::test]
async fn exited_reconciler_is_restarted_on_re_add() {
    let store = store();
    let mut fleet = FleetWatcher::new(store.clone() as Arc<dyn ChartStore>, retry());
    let first = fake("a");
    first.close_events();
    fleet.apply(FleetChange::added(vec![first as Arc<dyn ClusterAccess>])).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let second = fake("a");
    fleet.apply(FleetChange::added(vec![second.clone() as Arc<dyn ClusterAccess>])).await;
    second.send(RepositoryEvent::Applied(repository("charts", "a", &index_url("a"), "r1")));
    eventually(|| charts_on(&store, "a") == 1).await;
    fleet.shutdown().await;
}

#[tokio::test]
async fn spawned_supervisor_follows_channel() {
    let store = store();
    let (tx, handle) = spawn_fleet_watcher(store.clone() as Arc<dyn ChartStore>, retry(), 4);
    let a = fake("a");
    tx.send(FleetChange::added(vec![a.clone() as Arc<dyn ClusterAccess>])).await.unwrap();
    eventually(|| handle.view.len() == 1).await;

    tx.send(FleetChange::removed(vec![ClusterRef::new("a", "clusters")])).await.unwrap();
    eventually(|| handle.view.is_empty()).await;
    handle.shutdown().await;
}
