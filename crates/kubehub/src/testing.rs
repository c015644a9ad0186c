//! In-process `ClusterAccess` for tests: serves canned artifacts, records
//! mutations and lets the test drive the repository watch.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chartfleet_core::ClusterRef;
use futures::channel::{mpsc, oneshot};
use futures::stream::BoxStream;
use futures::StreamExt;
use kube::ResourceExt;

use crate::crd::{Artifact, Condition, HelmChart, HelmChartStatus, HelmRepository, HelmRepositorySpec, HelmRepositoryStatus};
use crate::{ClusterAccess, RepositoryEvent};

/// How transient HelmCharts behave once created.
#[derive(Debug, Clone)]
pub enum ChartReadiness {
    /// Ready on the first get, serving the given artifact URL.
    Ready { artifact_url: String },
    /// Ready after `gets` polls.
    ReadyAfter { gets: usize, artifact_url: String },
    NeverReady,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinalizerOp {
    Added(String),
    Removed(String),
}

struct State {
    artifacts: HashMap<String, Vec<u8>>,
    hanging: HashSet<String>,
    waiters: Vec<oneshot::Sender<()>>,
    stall_gets: bool,
    stall_create: bool,
    fetch_failures: usize,
    fetches: Vec<String>,
    finalizer_ops: Vec<FinalizerOp>,
    finalizer_failures: usize,
    charts: BTreeMap<(String, String), (HelmChart, usize)>,
    created: Vec<HelmChart>,
    deleted: Vec<(String, String)>,
    readiness: ChartReadiness,
    fail_create: bool,
    fail_delete: bool,
}

pub struct FakeClusterAccess {
    cluster: ClusterRef,
    state: Mutex<State>,
    events_tx: Mutex<Option<mpsc::UnboundedSender<Result<RepositoryEvent>>>>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<Result<RepositoryEvent>>>>,
}

impl FakeClusterAccess {
    pub fn new(cluster: ClusterRef) -> Self {
        let (tx, rx) = mpsc::unbounded();
        Self {
            cluster,
            state: Mutex::new(State {
                artifacts: HashMap::new(),
                hanging: HashSet::new(),
                waiters: Vec::new(),
                stall_gets: false,
                stall_create: false,
                fetch_failures: 0,
                fetches: Vec::new(),
                finalizer_ops: Vec::new(),
                finalizer_failures: 0,
                charts: BTreeMap::new(),
                created: Vec::new(),
                deleted: Vec::new(),
                readiness: ChartReadiness::NeverReady,
                fail_create: false,
                fail_delete: false,
            }),
            events_tx: Mutex::new(Some(tx)),
            events_rx: Mutex::new(Some(rx)),
        }
    }

    fn with<R>(&self, f: impl FnOnce(&mut State) -> R) -> R {
        let mut guard = self.state.lock().unwrap_or_else(|p| p.into_inner());
        f(&mut guard)
    }

    pub fn serve(&self, url: &str, bytes: impl Into<Vec<u8>>) {
        let bytes = bytes.into();
        self.with(|s| s.artifacts.insert(url.to_string(), bytes));
    }

    /// Fetches of `url` block until `release(url)`.
    pub fn hang(&self, url: &str) {
        self.with(|s| s.hanging.insert(url.to_string()));
    }

    /// Let blocked and future fetches of `url` through.
    pub fn release(&self, url: &str) {
        let waiters = self.with(|s| {
            s.hanging.remove(url);
            std::mem::take(&mut s.waiters)
        });
        for w in waiters {
            let _ = w.send(());
        }
    }

    /// `get_chart` never answers.
    pub fn hang_chart_reads(&self) {
        self.with(|s| s.stall_gets = true);
    }

    /// `create_chart` never answers.
    pub fn hang_chart_creation(&self) {
        self.with(|s| s.stall_create = true);
    }

    async fn stall_while(&self, cond: impl Fn(&State) -> bool) {
        loop {
            let waiter = self.with(|s| {
                cond(s).then(|| {
                    let (tx, rx) = oneshot::channel();
                    s.waiters.push(tx);
                    rx
                })
            });
            match waiter {
                Some(rx) => {
                    let _ = rx.await;
                }
                None => return,
            }
        }
    }

    pub fn fail_next_fetches(&self, n: usize) {
        self.with(|s| s.fetch_failures = n);
    }

    pub fn fail_next_finalizer_patches(&self, n: usize) {
        self.with(|s| s.finalizer_failures = n);
    }

    pub fn set_chart_readiness(&self, readiness: ChartReadiness) {
        self.with(|s| s.readiness = readiness);
    }

    pub fn fail_chart_creation(&self) {
        self.with(|s| s.fail_create = true);
    }

    pub fn fail_chart_deletion(&self) {
        self.with(|s| s.fail_delete = true);
    }

    pub fn send(&self, ev: RepositoryEvent) {
        if let Some(tx) = self.events_tx.lock().unwrap_or_else(|p| p.into_inner()).as_ref() {
            let _ = tx.unbounded_send(Ok(ev));
        }
    }

    pub fn send_error(&self, msg: &str) {
        if let Some(tx) = self.events_tx.lock().unwrap_or_else(|p| p.into_inner()).as_ref() {
            let _ = tx.unbounded_send(Err(anyhow!(msg.to_string())));
        }
    }

    /// End the watch stream.
    pub fn close_events(&self) {
        self.events_tx.lock().unwrap_or_else(|p| p.into_inner()).take();
    }

    pub fn fetches(&self) -> Vec<String> {
        self.with(|s| s.fetches.clone())
    }

    pub fn finalizer_ops(&self) -> Vec<FinalizerOp> {
        self.with(|s| s.finalizer_ops.clone())
    }

    pub fn created_charts(&self) -> Vec<HelmChart> {
        self.with(|s| s.created.clone())
    }

    pub fn deleted_charts(&self) -> Vec<(String, String)> {
        self.with(|s| s.deleted.clone())
    }

    /// Transient charts currently present on the fake cluster.
    pub fn live_charts(&self) -> Vec<(String, String)> {
        self.with(|s| s.charts.keys().cloned().collect())
    }
}

/// A HelmRepository as source-controller would report it once it has an artifact.
pub fn repository(name: &str, namespace: &str, index_url: &str, revision: &str) -> HelmRepository {
    let mut repo = HelmRepository::new(name, HelmRepositorySpec { url: format!("https://{}.example.com", name), ..Default::default() });
    repo.metadata.namespace = Some(namespace.to_string());
    repo.status = Some(HelmRepositoryStatus {
        url: Some(index_url.to_string()),
        artifact: Some(Artifact { url: index_url.to_string(), revision: revision.to_string(), ..Default::default() }),
        conditions: vec![ready_condition(true, "")],
    });
    repo
}

/// The same repository after `kubectl delete`, still held by `finalizers`.
pub fn deleting(mut repo: HelmRepository, finalizers: &[&str]) -> HelmRepository {
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    repo.metadata.deletion_timestamp = Some(Time(k8s_openapi::chrono::Utc::now()));
    repo.metadata.finalizers = Some(finalizers.iter().map(|f| f.to_string()).collect());
    repo
}

fn ready_condition(ok: bool, message: &str) -> Condition {
    Condition {
        type_: "Ready".into(),
        status: if ok { "True".into() } else { "False".into() },
        reason: String::new(),
        message: message.to_string(),
    }
}

fn mark(chart: &mut HelmChart, ready: bool, artifact_url: &str) {
    chart.status = Some(HelmChartStatus {
        url: None,
        artifact: ready.then(|| Artifact { url: artifact_url.to_string(), ..Default::default() }),
        conditions: vec![ready_condition(ready, if ready { "" } else { "pulling chart" })],
    });
}

#[async_trait]
impl ClusterAccess for FakeClusterAccess {
    fn cluster(&self) -> &ClusterRef {
        &self.cluster
    }

    async fn fetch_artifact(&self, url: &str) -> Result<Vec<u8>> {
        self.with(|s| s.fetches.push(url.to_string()));
        self.stall_while(|s| s.hanging.contains(url)).await;
        self.with(|s| {
            if s.fetch_failures > 0 {
                s.fetch_failures -= 1;
                return Err(anyhow!("connection refused fetching {}", url));
            }
            s.artifacts.get(url).cloned().ok_or_else(|| anyhow!("404 Not Found: {}", url))
        })
    }

    async fn add_finalizer(&self, repo: &HelmRepository, finalizer: &str) -> Result<()> {
        self.with(|s| {
            if s.finalizer_failures > 0 {
                s.finalizer_failures -= 1;
                return Err(anyhow!("conflict patching {}", repo.name_any()));
            }
            s.finalizer_ops.push(FinalizerOp::Added(finalizer.to_string()));
            Ok(())
        })
    }

    async fn remove_finalizer(&self, _repo: &HelmRepository, finalizer: &str) -> Result<()> {
        self.with(|s| s.finalizer_ops.push(FinalizerOp::Removed(finalizer.to_string())));
        Ok(())
    }

    async fn create_chart(&self, chart: &HelmChart) -> Result<()> {
        self.stall_while(|s| s.stall_create).await;
        self.with(|s| {
            if s.fail_create {
                return Err(anyhow!("admission webhook denied HelmChart"));
            }
            let key = (chart.namespace().unwrap_or_default(), chart.name_any());
            if s.charts.contains_key(&key) {
                return Err(anyhow!("HelmChart {}/{} already exists", key.0, key.1));
            }
            s.created.push(chart.clone());
            s.charts.insert(key, (chart.clone(), 0));
            Ok(())
        })
    }

    async fn get_chart(&self, namespace: &str, name: &str) -> Result<Option<HelmChart>> {
        self.stall_while(|s| s.stall_gets).await;
        self.with(|s| {
            let readiness = s.readiness.clone();
            let Some((chart, gets)) = s.charts.get_mut(&(namespace.to_string(), name.to_string())) else {
                return Ok(None);
            };
            *gets += 1;
            match readiness {
                ChartReadiness::Ready { artifact_url } => mark(chart, true, &artifact_url),
                ChartReadiness::ReadyAfter { gets: n, artifact_url } => mark(chart, *gets >= n, &artifact_url),
                ChartReadiness::NeverReady => mark(chart, false, ""),
            }
            Ok(Some(chart.clone()))
        })
    }

    async fn delete_chart(&self, namespace: &str, name: &str) -> Result<()> {
        self.with(|s| {
            if s.fail_delete {
                return Err(anyhow!("forbidden deleting HelmChart {}/{}", namespace, name));
            }
            s.charts.remove(&(namespace.to_string(), name.to_string()));
            s.deleted.push((namespace.to_string(), name.to_string()));
            Ok(())
        })
    }

    fn repository_events(&self) -> BoxStream<'static, Result<RepositoryEvent>> {
        match self.events_rx.lock().unwrap_or_else(|p| p.into_inner()).take() {
            Some(rx) => rx.boxed(),
            None => futures::stream::empty().boxed(),
        }
    }
}
