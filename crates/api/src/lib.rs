//! Chartfleet public API façade (in-process).
//!
//! Frontends (CLI, an RPC layer) depend on these traits and types rather than
//! on the cache or job crates directly.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chartfleet_core::{reverse_semver_sort, Chart, ChartKind, ClusterRef, RepositoryRef};
use chartfleet_jobs::{JobId, JobStatus, ValuesPipeline};
use chartfleet_persist::{CacheError, ChartStore};
use metrics::histogram;
use serde::{Deserialize, Serialize};
use tracing::info;

/// API errors suitable for transport over RPC.
#[derive(Debug, thiserror::Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum ApiError {
    #[error("validation: {0}")]
    Validation(String),
    #[error("not_found: {0}")]
    NotFound(String),
    #[error("internal: {0}")]
    Internal(String),
}

pub type ApiResult<T> = Result<T, ApiError>;

impl From<CacheError> for ApiError {
    fn from(e: CacheError) -> Self {
        ApiError::Internal(e.to_string())
    }
}

/// One chart name with every cached version, newest first.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RepositoryChart {
    pub name: String,
    pub versions: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layer: Option<String>,
}

/// Polled state of a values job. `values` is base64; both fields stay empty
/// while the job is pending.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ChartsJob {
    pub done: bool,
    pub values: String,
    pub error: String,
}

impl ChartsJob {
    fn from_status(status: JobStatus) -> Self {
        match status {
            JobStatus::Pending => Self::default(),
            JobStatus::Done(Ok(values)) => Self { done: true, values: STANDARD.encode(values), error: String::new() },
            JobStatus::Done(Err(error)) => Self { done: true, values: String::new(), error },
        }
    }
}

/// Query and async-values surface over the chart cache.
#[async_trait::async_trait]
pub trait ChartsApi: Send + Sync {
    /// Charts cached for `repo` on `cluster`, grouped by name (ascending) with
    /// versions sorted newest first. An unknown repository yields an empty list.
    async fn list_charts_for_repository(
        &self,
        cluster: &ClusterRef,
        repo: &RepositoryRef,
        kind: Option<ChartKind>,
    ) -> ApiResult<Vec<RepositoryChart>>;

    async fn get_latest_version(&self, cluster: &ClusterRef, repo: &RepositoryRef, name: &str) -> ApiResult<String>;

    async fn get_layer(&self, cluster: &ClusterRef, repo: &RepositoryRef, name: &str, version: &str) -> ApiResult<Option<String>>;

    /// Start resolving a chart's default values; returns a job id to poll.
    async fn get_values_for_chart(&self, cluster: &ClusterRef, repo: &RepositoryRef, name: &str, version: &str) -> ApiResult<JobId>;

    async fn get_charts_job(&self, id: &JobId) -> ApiResult<ChartsJob>;

    /// Same as `get_charts_job` with the values left as bytes.
    /// `None` while pending.
    async fn get_charts_job_raw(&self, id: &JobId) -> ApiResult<Option<Result<Vec<u8>, String>>>;
}

fn validate_refs(cluster: &ClusterRef, repo: &RepositoryRef) -> ApiResult<()> {
    if cluster.name.is_empty() {
        return Err(ApiError::Validation("cluster name is required".into()));
    }
    if repo.name.is_empty() || repo.namespace.is_empty() {
        return Err(ApiError::Validation("repository name and namespace are required".into()));
    }
    Ok(())
}

fn job_not_found() -> ApiError {
    ApiError::NotFound("job not found".into())
}

// ----------------- In-process implementation -----------------

/// In-process implementation over the shared cache and values pipeline.
pub struct InProcApi {
    store: Arc<dyn ChartStore>,
    values: ValuesPipeline,
}

impl InProcApi {
    pub fn new(store: Arc<dyn ChartStore>, values: ValuesPipeline) -> Self {
        Self { store, values }
    }
}

#[async_trait::async_trait]
impl ChartsApi for InProcApi {
    async fn list_charts_for_repository(
        &self,
        cluster: &ClusterRef,
        repo: &RepositoryRef,
        kind: Option<ChartKind>,
    ) -> ApiResult<Vec<RepositoryChart>> {
        let t0 = Instant::now();
        validate_refs(cluster, repo)?;
        let charts = self.store.list_charts_by_repository_and_cluster(cluster, repo, kind)?;
        let out = group_charts(charts)?;
        histogram!("chartfleet_api_list_ms", t0.elapsed().as_secs_f64() * 1000.0);
        info!(cluster = %cluster, repository = %repo.name, charts = out.len(), took_ms = %t0.elapsed().as_millis(), "api: list charts ok");
        Ok(out)
    }

    async fn get_latest_version(&self, cluster: &ClusterRef, repo: &RepositoryRef, name: &str) -> ApiResult<String> {
        validate_refs(cluster, repo)?;
        self.store
            .get_latest_version(cluster, repo, name)?
            .ok_or_else(|| ApiError::NotFound(format!("no versions of chart {} in {}/{}", name, repo.namespace, repo.name)))
    }

    async fn get_layer(&self, cluster: &ClusterRef, repo: &RepositoryRef, name: &str, version: &str) -> ApiResult<Option<String>> {
        validate_refs(cluster, repo)?;
        Ok(self.store.get_layer(cluster, repo, name, version)?)
    }

    async fn get_values_for_chart(&self, cluster: &ClusterRef, repo: &RepositoryRef, name: &str, version: &str) -> ApiResult<JobId> {
        validate_refs(cluster, repo)?;
        if name.is_empty() || version.is_empty() {
            return Err(ApiError::Validation("chart name and version are required".into()));
        }
        let id = self.values.request_values(cluster.clone(), repo.clone(), Chart::reference(name, version));
        info!(job = %id, cluster = %cluster, chart = %name, version = %version, "api: values job started");
        Ok(id)
    }

    async fn get_charts_job(&self, id: &JobId) -> ApiResult<ChartsJob> {
        self.values.poll_job(id).map(ChartsJob::from_status).ok_or_else(job_not_found)
    }

    async fn get_charts_job_raw(&self, id: &JobId) -> ApiResult<Option<Result<Vec<u8>, String>>> {
        match self.values.poll_job(id).ok_or_else(job_not_found)? {
            JobStatus::Pending => Ok(None),
            JobStatus::Done(res) => Ok(Some(res)),
        }
    }
}

fn group_charts(charts: Vec<Chart>) -> ApiResult<Vec<RepositoryChart>> {
    let mut by_name: BTreeMap<String, (Vec<String>, Option<String>)> = BTreeMap::new();
    for chart in charts {
        let slot = by_name.entry(chart.name).or_default();
        slot.0.push(chart.version);
        if slot.1.is_none() {
            slot.1 = chart.layer;
        }
    }
    by_name
        .into_iter()
        .map(|(name, (versions, layer))| {
            let versions = reverse_semver_sort(versions).map_err(|e| ApiError::Internal(format!("parsing chart {}: {}", name, e)))?;
            Ok(RepositoryChart { name, versions, layer })
        })
        .collect()
}
