//! Chartfleet kubehub: everything that talks to a member cluster's API server.
//! The indexer and job pipeline only see the `ClusterAccess` trait.

#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chartfleet_core::{ClusterRef, IndexFile};
use futures::stream::BoxStream;

pub mod artifact;
pub mod crd;
mod kube_access;
#[cfg(feature = "testing")]
pub mod testing;

pub use artifact::{override_host, parse_artifact_url, ArtifactUrlError, ServiceProxyTarget};
pub use crd::{Artifact, Condition, HelmChart, HelmChartSpec, HelmChartStatus, HelmRepository, HelmRepositorySpec, HelmRepositoryStatus};
pub use kube_access::KubeClusterAccess;
pub use kube::ResourceExt;

/// Watch notifications for HelmRepository objects on one cluster.
#[derive(Debug, Clone)]
pub enum RepositoryEvent {
    Applied(HelmRepository),
    Deleted(HelmRepository),
}

impl RepositoryEvent {
    pub fn object(&self) -> &HelmRepository {
        match self {
            RepositoryEvent::Applied(o) | RepositoryEvent::Deleted(o) => o,
        }
    }
}

/// Operations chartfleet needs on a single cluster.
#[async_trait]
pub trait ClusterAccess: Send + Sync {
    fn cluster(&self) -> &ClusterRef;

    /// Fetch bytes served at an in-cluster artifact URL.
    async fn fetch_artifact(&self, url: &str) -> Result<Vec<u8>>;

    /// Fetch and parse the repository's published index.
    async fn fetch_index(&self, repo: &HelmRepository) -> Result<IndexFile> {
        let url = repo.index_url().ok_or_else(|| anyhow!("repository {} has no index URL", repo.repository_ref()))?;
        let bytes = self.fetch_artifact(url).await?;
        IndexFile::from_yaml(&bytes).with_context(|| format!("parsing index from {}", url))
    }

    async fn add_finalizer(&self, repo: &HelmRepository, finalizer: &str) -> Result<()>;
    async fn remove_finalizer(&self, repo: &HelmRepository, finalizer: &str) -> Result<()>;

    async fn create_chart(&self, chart: &HelmChart) -> Result<()>;
    async fn get_chart(&self, namespace: &str, name: &str) -> Result<Option<HelmChart>>;
    async fn delete_chart(&self, namespace: &str, name: &str) -> Result<()>;

    /// Infinite watch of HelmRepository objects. A relist replays every
    /// object as `Applied`.
    fn repository_events(&self) -> BoxStream<'static, Result<RepositoryEvent>>;
}

/// Resolves a fleet member to its access handle.
pub trait ClusterLookup: Send + Sync {
    fn cluster_access(&self, cluster: &ClusterRef) -> Option<Arc<dyn ClusterAccess>>;
}
