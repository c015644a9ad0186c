//! One reconcile loop per cluster: keeps the chart cache in step with the
//! cluster's HelmRepository objects.

use std::collections::{HashMap, HashSet};
use std::pin::Pin;
use std::sync::Arc;

use chartfleet_core::config::RetryPolicy;
use chartfleet_core::HELM_VERSION_FILTER_ANNOTATION;
use chartfleet_kubehub::{ClusterAccess, HelmRepository, RepositoryEvent, ResourceExt};
use chartfleet_persist::ChartStore;
use futures::stream::FuturesUnordered;
use futures::{Future, StreamExt};
use metrics::counter;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::classifier::load_index;
use crate::ReconcileError;

/// Finalizer that keeps a HelmRepository around until its charts are purged.
pub const FINALIZER: &str = "finalizers.helm.watcher";

/// What the event filter compares between two observations of a repository.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Fingerprint {
    revision: Option<String>,
    url: Option<String>,
    version_filter: Option<String>,
}

impl Fingerprint {
    fn of(repo: &HelmRepository) -> Self {
        Self {
            revision: repo.artifact().map(|a| a.revision.clone()),
            url: repo.index_url().map(str::to_string),
            version_filter: repo.annotations().get(HELM_VERSION_FILTER_ANNOTATION).cloned(),
        }
    }

    fn has_artifact(&self) -> bool {
        self.revision.is_some()
    }
}

type RetryTimer = Pin<Box<dyn Future<Output = String> + Send>>;

pub struct Reconciler {
    access: Arc<dyn ClusterAccess>,
    store: Arc<dyn ChartStore>,
    retry: RetryPolicy,
    indexed: HashMap<String, Fingerprint>,
    latest: HashMap<String, RepositoryEvent>,
    attempts: HashMap<String, u32>,
    scheduled: HashSet<String>,
    timers: FuturesUnordered<RetryTimer>,
}

fn object_key(repo: &HelmRepository) -> String {
    format!("{}/{}", repo.namespace().unwrap_or_default(), repo.name_any())
}

impl Reconciler {
    pub fn new(access: Arc<dyn ClusterAccess>, store: Arc<dyn ChartStore>, retry: RetryPolicy) -> Self {
        Self {
            access,
            store,
            retry,
            indexed: HashMap::new(),
            latest: HashMap::new(),
            attempts: HashMap::new(),
            scheduled: HashSet::new(),
            timers: FuturesUnordered::new(),
        }
    }

    /// Consume the cluster's repository watch until cancelled or the stream ends.
    pub async fn run(mut self, cancel: CancellationToken) {
        let cluster = self.access.cluster().clone();
        let mut events = self.access.repository_events();
        info!(cluster = %cluster, "reconciler started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                ev = events.next() => match ev {
                    Some(Ok(ev)) => {
                        let key = object_key(ev.object());
                        self.latest.insert(key.clone(), ev);
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = self.process(&key) => {}
                        }
                    }
                    Some(Err(e)) => warn!(cluster = %cluster, error = %format!("{:#}", e), "repository watch error"),
                    None => {
                        warn!(cluster = %cluster, "repository watch ended");
                        break;
                    }
                },
                Some(key) = self.timers.next(), if !self.timers.is_empty() => {
                    self.scheduled.remove(&key);
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = self.process(&key) => {}
                    }
                }
            }
        }
        info!(cluster = %cluster, "reconciler stopped");
    }

    async fn process(&mut self, key: &str) {
        let Some(ev) = self.latest.get(key).cloned() else { return };
        let result = match &ev {
            RepositoryEvent::Applied(repo) => self.reconcile(key, repo).await,
            RepositoryEvent::Deleted(repo) => self.purge(key, repo, false).await,
        };
        match result {
            Ok(()) => {
                self.attempts.remove(key);
                if matches!(ev, RepositoryEvent::Deleted(_)) {
                    self.latest.remove(key);
                }
            }
            Err(e) => {
                counter!("chartfleet_reconcile_errors_total", 1u64);
                let attempt = self.attempts.entry(key.to_string()).or_insert(0);
                let delay = self.retry.delay(*attempt);
                *attempt = attempt.saturating_add(1);
                warn!(cluster = %self.access.cluster(), repository = key, error = %e, retry_in_ms = delay.as_millis() as u64, "reconcile failed");
                if self.scheduled.insert(key.to_string()) {
                    let key = key.to_string();
                    self.timers.push(Box::pin(async move {
                        tokio::time::sleep(delay).await;
                        key
                    }));
                }
            }
        }
    }

    async fn reconcile(&mut self, key: &str, repo: &HelmRepository) -> Result<(), ReconcileError> {
        let repo_ref = repo.repository_ref();
        if repo.is_deleting() {
            return self.purge(key, repo, true).await;
        }
        if !repo.has_finalizer(FINALIZER) {
            self.access
                .add_finalizer(repo, FINALIZER)
                .await
                .map_err(|cause| ReconcileError::Finalizer { repo: repo_ref.to_string(), cause })?;
        }

        let fp = Fingerprint::of(repo);
        if self.indexed.get(key) == Some(&fp) {
            return Ok(());
        }
        if !fp.has_artifact() {
            debug!(cluster = %self.access.cluster(), repository = %repo_ref, "no artifact yet");
            self.indexed.insert(key.to_string(), fp);
            return Ok(());
        }

        let index = self
            .access
            .fetch_index(repo)
            .await
            .map_err(|cause| ReconcileError::Fetch { repo: repo_ref.to_string(), cause })?;
        let stats = load_index(self.store.as_ref(), self.access.cluster(), &repo_ref, &repo.annotations_map(), &index)
            .map_err(|source| ReconcileError::Store { repo: repo_ref.to_string(), source })?;
        info!(
            cluster = %self.access.cluster(),
            repository = %repo_ref,
            revision = fp.revision.as_deref().unwrap_or_default(),
            charts = stats.upserted,
            pruned = stats.pruned,
            "repository indexed"
        );
        self.indexed.insert(key.to_string(), fp);
        Ok(())
    }

    /// Drop the repository's charts; release the finalizer when the object is
    /// still present and being deleted.
    async fn purge(&mut self, key: &str, repo: &HelmRepository, release: bool) -> Result<(), ReconcileError> {
        let repo_ref = repo.repository_ref();
        self.store
            .delete(self.access.cluster(), &repo_ref)
            .map_err(|source| ReconcileError::Store { repo: repo_ref.to_string(), source })?;
        self.indexed.remove(key);
        if release && repo.has_finalizer(FINALIZER) {
            self.access
                .remove_finalizer(repo, FINALIZER)
                .await
                .map_err(|cause| ReconcileError::Finalizer { repo: repo_ref.to_string(), cause })?;
        }
        info!(cluster = %self.access.cluster(), repository = %repo_ref, "repository charts purged");
        Ok(())
    }
}
