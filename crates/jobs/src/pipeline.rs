//! Resolves a chart's default values: cache first, otherwise a transient
//! HelmChart on the owning cluster is created, polled until ready, and its
//! artifact fetched through the API-server proxy and unpacked.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chartfleet_core::config::ServiceConfig;
use chartfleet_core::{Chart, ClusterRef, RepositoryRef};
use chartfleet_kubehub::{ClusterAccess, ClusterLookup, HelmChart};
use chartfleet_persist::ChartStore;
use metrics::{counter, histogram};
use rand::distributions::Uniform;
use rand::Rng;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::archive::read_chart_values;
use crate::jobs::{JobId, JobStatus, Jobs};
use crate::ValuesError;

#[derive(Debug, Clone, Copy)]
pub struct PipelineTiming {
    pub poll_interval: Duration,
    pub ready_timeout: Duration,
}

impl From<&ServiceConfig> for PipelineTiming {
    fn from(cfg: &ServiceConfig) -> Self {
        Self { poll_interval: cfg.ready_poll_interval, ready_timeout: cfg.ready_timeout }
    }
}

struct Inner {
    store: Arc<dyn ChartStore>,
    fleet: Arc<dyn ClusterLookup>,
    jobs: Arc<Jobs>,
    timing: PipelineTiming,
    cancel: CancellationToken,
}

#[derive(Clone)]
pub struct ValuesPipeline {
    inner: Arc<Inner>,
}

/// Why a bounded cluster call produced nothing.
enum Interrupted {
    TimedOut,
    Cancelled,
}

impl Interrupted {
    fn into_error(self, timed_out: impl FnOnce() -> ValuesError) -> ValuesError {
        match self {
            Interrupted::TimedOut => timed_out(),
            Interrupted::Cancelled => ValuesError::Cancelled,
        }
    }
}

/// `<chart>-<5 random lowercase letters>`.
fn transient_name(chart: &str) -> String {
    let letters = Uniform::new_inclusive(b'a', b'z');
    let suffix: String = rand::thread_rng().sample_iter(letters).take(5).map(char::from).collect();
    format!("{}-{}", chart, suffix)
}

impl ValuesPipeline {
    pub fn new(store: Arc<dyn ChartStore>, fleet: Arc<dyn ClusterLookup>, jobs: Arc<Jobs>, timing: PipelineTiming) -> Self {
        Self { inner: Arc::new(Inner { store, fleet, jobs, timing, cancel: CancellationToken::new() }) }
    }

    pub fn jobs(&self) -> &Arc<Jobs> {
        &self.inner.jobs
    }

    /// Start a values job and return its id immediately.
    pub fn request_values(&self, cluster: ClusterRef, repo: RepositoryRef, chart: Chart) -> JobId {
        let id = self.inner.jobs.create();
        counter!("chartfleet_values_jobs_total", 1u64);
        let this = self.clone();
        let span = info_span!("values_job", job = %id, cluster = %cluster, chart = %chart);
        tokio::spawn(
            async move {
                let started = std::time::Instant::now();
                let res = this.fetch_values(&cluster, &repo, &chart).await;
                histogram!("chartfleet_values_job_ms", started.elapsed().as_secs_f64() * 1000.0);
                match &res {
                    Ok(v) => info!(bytes = v.len(), "values resolved"),
                    Err(e) => {
                        counter!("chartfleet_values_job_errors_total", 1u64);
                        warn!(error = %e, "values job failed");
                    }
                }
                this.inner.jobs.complete(id, res.map_err(|e| e.to_string()));
            }
            .instrument(span),
        );
        id
    }

    pub fn poll_job(&self, id: &JobId) -> Option<JobStatus> {
        self.inner.jobs.get(id)
    }

    /// The job body: resolve values for one chart, caching the result.
    pub async fn fetch_values(&self, cluster: &ClusterRef, repo: &RepositoryRef, chart: &Chart) -> Result<Vec<u8>, ValuesError> {
        if let Some(values) = self.inner.store.get_chart_values(cluster, repo, chart)? {
            debug!("values served from cache");
            return Ok(values);
        }
        let access = self.inner.fleet.cluster_access(cluster).ok_or_else(|| ValuesError::ClusterNotFound(cluster.to_string()))?;

        let name = transient_name(&chart.name);
        let namespace = repo.namespace.as_str();
        let full_name = format!("{}/{}", namespace, name);
        let helm_chart = HelmChart::for_repository(&name, namespace, &repo.name, &chart.name, &chart.version);
        match self.bounded(self.call_deadline(), access.create_chart(&helm_chart)).await {
            Ok(Ok(())) => debug!(helm_chart = %name, "transient HelmChart created"),
            Ok(Err(cause)) => return Err(ValuesError::CreateChart { name: full_name, cause }),
            Err(stop) => {
                // the create may still have been applied
                self.delete_transient(access.as_ref(), namespace, &name).await;
                return Err(stop.into_error(|| ValuesError::CreateChart {
                    name: full_name,
                    cause: anyhow::anyhow!("timed out after {:?}", self.inner.timing.ready_timeout),
                }));
            }
        }

        let res = self.pull_values(access.as_ref(), namespace, &name, &chart.name).await;
        self.delete_transient(access.as_ref(), namespace, &name).await;

        let values = res?;
        self.inner.store.update_values_yaml(cluster, repo, chart, &values)?;
        Ok(values)
    }

    fn call_deadline(&self) -> Instant {
        Instant::now() + self.inner.timing.ready_timeout
    }

    /// Run one cluster call, bounded by `deadline` and by `shutdown`.
    async fn bounded<T>(&self, deadline: Instant, call: impl Future<Output = T>) -> Result<T, Interrupted> {
        tokio::select! {
            _ = self.inner.cancel.cancelled() => Err(Interrupted::Cancelled),
            res = tokio::time::timeout_at(deadline, call) => res.map_err(|_| Interrupted::TimedOut),
        }
    }

    /// Best effort; failures are logged and never change the job result.
    async fn delete_transient(&self, access: &dyn ClusterAccess, namespace: &str, name: &str) {
        match tokio::time::timeout_at(self.call_deadline(), access.delete_chart(namespace, name)).await {
            Ok(Ok(())) => debug!(helm_chart = %name, "transient HelmChart deleted"),
            Ok(Err(e)) => warn!(helm_chart = %name, error = %format!("{:#}", e), "failed to delete transient HelmChart"),
            Err(_) => warn!(helm_chart = %name, "timed out deleting transient HelmChart"),
        }
    }

    async fn pull_values(&self, access: &dyn ClusterAccess, namespace: &str, name: &str, chart: &str) -> Result<Vec<u8>, ValuesError> {
        let ready = self.wait_for_ready(access, namespace, name).await?;
        let url = ready.artifact_url().ok_or_else(|| ValuesError::Artifact {
            cause: anyhow::anyhow!("HelmChart {}/{} is ready but has no artifact", namespace, name),
        })?;
        let archive = match self.bounded(self.call_deadline(), access.fetch_artifact(url)).await {
            Ok(fetched) => fetched.map_err(|cause| ValuesError::Artifact { cause })?,
            Err(stop) => {
                return Err(stop.into_error(|| ValuesError::Artifact {
                    cause: anyhow::anyhow!("timed out after {:?} fetching {}", self.inner.timing.ready_timeout, url),
                }))
            }
        };
        let chart_dir = chart.to_string();
        tokio::task::spawn_blocking(move || read_chart_values(&archive, &chart_dir))
            .await
            .map_err(|e| ValuesError::Unpack { chart: chart.to_string(), cause: anyhow::Error::new(e) })?
            .map_err(|cause| ValuesError::Unpack { chart: chart.to_string(), cause })
    }

    /// Poll the HelmChart until its Ready condition is true. Checks once
    /// immediately, then every poll interval; the whole wait, including a
    /// `get_chart` that never answers, is bounded by the ready timeout.
    async fn wait_for_ready(&self, access: &dyn ClusterAccess, namespace: &str, name: &str) -> Result<HelmChart, ValuesError> {
        let timing = self.inner.timing;
        let deadline = Instant::now() + timing.ready_timeout;
        let full_name = format!("{}/{}", namespace, name);
        let timed_out = |reason: &str| ValuesError::NotReady { name: full_name.clone(), reason: format!("timed out: {}", reason) };
        loop {
            let reason = match self.bounded(deadline, access.get_chart(namespace, name)).await {
                Err(stop) => return Err(stop.into_error(|| timed_out("no answer from the API server"))),
                Ok(Ok(Some(hc))) if hc.is_ready() => return Ok(hc),
                Ok(Ok(Some(hc))) => hc.ready_message().filter(|m| !m.is_empty()).unwrap_or("Ready condition not true").to_string(),
                Ok(Ok(None)) => "not found".to_string(),
                Ok(Err(e)) => return Err(ValuesError::NotReady { name: full_name.clone(), reason: format!("{:#}", e) }),
            };
            if Instant::now() + timing.poll_interval > deadline {
                return Err(timed_out(&reason));
            }
            tokio::select! {
                _ = self.inner.cancel.cancelled() => return Err(ValuesError::Cancelled),
                _ = tokio::time::sleep(timing.poll_interval) => {}
            }
        }
    }

    /// Periodic expiry of finished and abandoned jobs; stops on `shutdown`.
    pub fn spawn_reaper(&self) -> JoinHandle<()> {
        let every = self.inner.timing.ready_timeout.max(Duration::from_secs(60));
        self.inner.jobs.spawn_reaper(every, self.inner.cancel.clone())
    }

    /// Abort in-progress readiness waits and stop the reaper.
    pub fn shutdown(&self) {
        self.inner.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::chart_archive;
    use chartfleet_kubehub::testing::{ChartReadiness, FakeClusterAccess};
    use chartfleet_persist::{ChartReader, ChartWriter, SqliteChartStore};
    use std::collections::HashMap;

    const ARTIFACT: &str = "http://source-controller.flux-system.svc.cluster.local./helmchart/flux-system/nginx/nginx-1.0.0.tgz";

    struct Fleet(HashMap<String, Arc<dyn ClusterAccess>>);

    impl ClusterLookup for Fleet {
        fn cluster_access(&self, cluster: &ClusterRef) -> Option<Arc<dyn ClusterAccess>> {
            self.0.get(&cluster.key()).cloned()
        }
    }

    fn cluster() -> ClusterRef {
        ClusterRef::new("leaf", "clusters")
    }

    fn repo() -> RepositoryRef {
        RepositoryRef::helm_repository("charts", "flux-system")
    }

    fn nginx() -> Chart {
        Chart::reference("nginx", "1.0.0")
    }

    fn timing() -> PipelineTiming {
        PipelineTiming { poll_interval: Duration::from_millis(20), ready_timeout: Duration::from_millis(400) }
    }

    fn setup(readiness: ChartReadiness) -> (ValuesPipeline, Arc<FakeClusterAccess>, Arc<SqliteChartStore>) {
        let fake = Arc::new(FakeClusterAccess::new(cluster()));
        fake.set_chart_readiness(readiness);
        fake.serve(ARTIFACT, chart_archive("nginx", "replicaCount: 2\n"));
        let store = Arc::new(SqliteChartStore::open_in_memory().unwrap());
        store.add_chart(&cluster(), &repo(), &nginx()).unwrap();
        let mut fleet = HashMap::new();
        fleet.insert(cluster().key(), fake.clone() as Arc<dyn ClusterAccess>);
        let pipeline = ValuesPipeline::new(
            store.clone() as Arc<dyn ChartStore>,
            Arc::new(Fleet(fleet)),
            Arc::new(Jobs::new(Duration::from_secs(3600))),
            timing(),
        );
        (pipeline, fake, store)
    }

    async fn wait_done(p: &ValuesPipeline, id: &JobId) -> Result<Vec<u8>, String> {
        for _ in 0..1000 {
            if let Some(JobStatus::Done(res)) = p.poll_job(id) {
                return res;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {} never finished", id);
    }

    #[test]
    fn transient_names_have_random_suffix() {
        let a = transient_name("nginx");
        assert_eq!(a.len(), "nginx-".len() + 5);
        assert!(a.starts_with("nginx-"));
        assert!(a["nginx-".len()..].chars().all(|c| c.is_ascii_lowercase()));
    }

    #[tokio::test]
    async fn resolves_caches_and_cleans_up() {
        let (p, fake, store) = setup(ChartReadiness::ReadyAfter { gets: 3, artifact_url: ARTIFACT.into() });
        let id = p.request_values(cluster(), repo(), nginx());
        assert_eq!(p.poll_job(&id), Some(JobStatus::Pending));

        assert_eq!(wait_done(&p, &id).await.unwrap(), b"replicaCount: 2\n");
        let created = fake.created_charts();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].spec.chart, "nginx");
        assert_eq!(created[0].spec.version.as_deref(), Some("1.0.0"));
        assert_eq!(created[0].spec.source_ref.name, "charts");
        assert!(fake.live_charts().is_empty());
        assert_eq!(store.get_chart_values(&cluster(), &repo(), &nginx()).unwrap().as_deref(), Some(&b"replicaCount: 2\n"[..]));
    }

    #[tokio::test]
    async fn cache_hit_creates_nothing() {
        let (p, fake, store) = setup(ChartReadiness::NeverReady);
        store.update_values_yaml(&cluster(), &repo(), &nginx(), b"cached: true\n").unwrap();
        let id = p.request_values(cluster(), repo(), nginx());
        assert_eq!(wait_done(&p, &id).await.unwrap(), b"cached: true\n");
        assert!(fake.created_charts().is_empty());
        assert!(fake.fetches().is_empty());
    }

    #[tokio::test]
    async fn concurrent_requests_for_same_chart() {
        let (p, fake, _store) = setup(ChartReadiness::Ready { artifact_url: ARTIFACT.into() });
        let a = p.request_values(cluster(), repo(), nginx());
        let b = p.request_values(cluster(), repo(), nginx());
        assert_ne!(a, b);
        assert_eq!(wait_done(&p, &a).await.unwrap(), b"replicaCount: 2\n");
        assert_eq!(wait_done(&p, &b).await.unwrap(), b"replicaCount: 2\n");
        assert!(fake.live_charts().is_empty());
    }

    #[tokio::test]
    async fn never_ready_times_out_and_deletes_chart() {
        let (p, fake, store) = setup(ChartReadiness::NeverReady);
        let id = p.request_values(cluster(), repo(), nginx());
        let err = wait_done(&p, &id).await.unwrap_err();
        assert!(err.starts_with("failed to wait for chart to become ready"), "{}", err);
        assert_eq!(fake.deleted_charts().len(), 1);
        assert!(fake.live_charts().is_empty());
        assert_eq!(store.get_chart_values(&cluster(), &repo(), &nginx()).unwrap(), None);
    }

    #[tokio::test]
    async fn failed_delete_does_not_fail_job() {
        let (p, fake, _store) = setup(ChartReadiness::Ready { artifact_url: ARTIFACT.into() });
        fake.fail_chart_deletion();
        let id = p.request_values(cluster(), repo(), nginx());
        assert!(wait_done(&p, &id).await.is_ok());
    }

    #[tokio::test]
    async fn create_failure_is_reported() {
        let (p, fake, _store) = setup(ChartReadiness::NeverReady);
        fake.fail_chart_creation();
        let err = wait_done(&p, &p.request_values(cluster(), repo(), nginx())).await.unwrap_err();
        assert!(err.starts_with("failed to create HelmChart"), "{}", err);
        assert!(fake.deleted_charts().is_empty());
    }

    #[tokio::test]
    async fn missing_artifact_is_reported_after_cleanup() {
        let (p, fake, _store) = setup(ChartReadiness::Ready { artifact_url: "http://elsewhere.flux-system.svc.cluster.local./gone.tgz".into() });
        let err = wait_done(&p, &p.request_values(cluster(), repo(), nginx())).await.unwrap_err();
        assert!(err.contains("failed to fetch chart artifact"), "{}", err);
        assert_eq!(fake.deleted_charts().len(), 1);
    }

    #[tokio::test]
    async fn unknown_cluster_fails_fast() {
        let (p, _fake, _store) = setup(ChartReadiness::NeverReady);
        let other = ClusterRef::new("gone", "clusters");
        let err = p.fetch_values(&other, &repo(), &nginx()).await.unwrap_err();
        assert!(matches!(err, ValuesError::ClusterNotFound(_)));
    }

    #[tokio::test]
    async fn unanswered_ready_check_fails_within_timeout() {
        let (p, fake, store) = setup(ChartReadiness::Ready { artifact_url: ARTIFACT.into() });
        fake.hang_chart_reads();
        let started = std::time::Instant::now();
        let err = wait_done(&p, &p.request_values(cluster(), repo(), nginx())).await.unwrap_err();
        assert!(err.starts_with("failed to wait for chart to become ready"), "{}", err);
        assert!(started.elapsed() < Duration::from_secs(3), "took {:?}", started.elapsed());
        assert!(fake.live_charts().is_empty());
        assert_eq!(store.get_chart_values(&cluster(), &repo(), &nginx()).unwrap(), None);
    }

    #[tokio::test]
    async fn unanswered_create_fails_and_still_cleans_up() {
        let (p, fake, _store) = setup(ChartReadiness::Ready { artifact_url: ARTIFACT.into() });
        fake.hang_chart_creation();
        let started = std::time::Instant::now();
        let err = wait_done(&p, &p.request_values(cluster(), repo(), nginx())).await.unwrap_err();
        assert!(err.starts_with("failed to create HelmChart"), "{}", err);
        assert!(err.contains("timed out"), "{}", err);
        assert!(started.elapsed() < Duration::from_secs(3));
        assert_eq!(fake.deleted_charts().len(), 1);
    }

    #[tokio::test]
    async fn stalled_artifact_download_fails_within_timeout() {
        let (p, fake, _store) = setup(ChartReadiness::Ready { artifact_url: ARTIFACT.into() });
        fake.hang(ARTIFACT);
        let started = std::time::Instant::now();
        let err = wait_done(&p, &p.request_values(cluster(), repo(), nginx())).await.unwrap_err();
        assert!(err.starts_with("failed to fetch chart artifact"), "{}", err);
        assert!(started.elapsed() < Duration::from_secs(3));
        assert!(fake.live_charts().is_empty());
    }

    #[tokio::test]
    async fn shutdown_interrupts_unanswered_ready_check() {
        let (p, fake, _store) = setup(ChartReadiness::Ready { artifact_url: ARTIFACT.into() });
        fake.hang_chart_reads();
        let id = p.request_values(cluster(), repo(), nginx());
        tokio::time::sleep(Duration::from_millis(60)).await;
        p.shutdown();
        assert_eq!(wait_done(&p, &id).await.unwrap_err(), "values job cancelled");
        assert!(fake.live_charts().is_empty());
    }

    #[tokio::test]
    async fn shutdown_cancels_ready_wait() {
        let (p, _fake, _store) = setup(ChartReadiness::NeverReady);
        let id = p.request_values(cluster(), repo(), nginx());
        tokio::time::sleep(Duration::from_millis(60)).await;
        p.shutdown();
        assert_eq!(wait_done(&p, &id).await.unwrap_err(), "values job cancelled");
    }
}
