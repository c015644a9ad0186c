//! Read-only `ChartReader`s that answer from memory instead of the database.
//! Cluster and repository arguments are ignored; each adapter describes a
//! single repository.

use std::collections::BTreeMap;

use chartfleet_core::version::latest_version;
use chartfleet_core::{classify, Chart, ChartKind, ClusterRef, IndexFile, RepositoryRef};

use crate::{CacheError, ChartReader, Result};

/// Fixed list of already classified charts.
#[derive(Debug, Clone)]
pub struct StaticChartReader {
    repo: RepositoryRef,
    charts: Vec<Chart>,
}

impl StaticChartReader {
    pub fn new(repo: RepositoryRef, charts: Vec<Chart>) -> Self {
        Self { repo, charts }
    }

    fn find(&self, name: &str, version: &str) -> Option<&Chart> {
        self.charts.iter().find(|c| c.name == name && c.version == version)
    }
}

impl ChartReader for StaticChartReader {
    fn list_charts_by_repository_and_cluster(&self, _: &ClusterRef, _: &RepositoryRef, kind: Option<ChartKind>) -> Result<Vec<Chart>> {
        Ok(self.charts.iter().filter(|c| kind.map_or(true, |k| c.kind == k)).cloned().collect())
    }

    fn is_known_chart(&self, _: &ClusterRef, _: &RepositoryRef, chart: &Chart) -> Result<bool> {
        Ok(self.find(&chart.name, &chart.version).is_some())
    }

    fn get_chart_values(&self, _: &ClusterRef, _: &RepositoryRef, _: &Chart) -> Result<Option<Vec<u8>>> {
        Err(CacheError::NotImplemented("get_chart_values"))
    }

    fn update_values_yaml(&self, _: &ClusterRef, _: &RepositoryRef, _: &Chart, _: &[u8]) -> Result<()> {
        Err(CacheError::NotImplemented("update_values_yaml"))
    }

    fn get_latest_version(&self, _: &ClusterRef, _: &RepositoryRef, name: &str) -> Result<Option<String>> {
        Ok(latest_version(self.charts.iter().filter(|c| c.name == name).map(|c| c.version.clone()))?)
    }

    fn get_layer(&self, _: &ClusterRef, _: &RepositoryRef, name: &str, version: &str) -> Result<Option<String>> {
        Ok(self.find(name, version).and_then(|c| c.layer.clone()))
    }

    fn list_charts_by_cluster(&self, _: &ClusterRef, kind: Option<ChartKind>) -> Result<Vec<(RepositoryRef, Chart)>> {
        Ok(self
            .charts
            .iter()
            .filter(|c| kind.map_or(true, |k| c.kind == k))
            .map(|c| (self.repo.clone(), c.clone()))
            .collect())
    }

    fn count(&self) -> Result<u64> {
        Ok(self.charts.len() as u64)
    }
}

/// Answers from one fetched index, classified with the owning repository's
/// annotations at construction.
#[derive(Debug, Clone)]
pub struct IndexChartReader {
    inner: StaticChartReader,
}

impl IndexChartReader {
    pub fn new(repo: RepositoryRef, repo_annotations: &BTreeMap<String, String>, index: &IndexFile) -> Self {
        Self { inner: StaticChartReader::new(repo, classify(index, repo_annotations)) }
    }
}

impl ChartReader for IndexChartReader {
    fn list_charts_by_repository_and_cluster(&self, c: &ClusterRef, r: &RepositoryRef, kind: Option<ChartKind>) -> Result<Vec<Chart>> {
        self.inner.list_charts_by_repository_and_cluster(c, r, kind)
    }

    fn is_known_chart(&self, c: &ClusterRef, r: &RepositoryRef, chart: &Chart) -> Result<bool> {
        self.inner.is_known_chart(c, r, chart)
    }

    fn get_chart_values(&self, c: &ClusterRef, r: &RepositoryRef, chart: &Chart) -> Result<Option<Vec<u8>>> {
        self.inner.get_chart_values(c, r, chart)
    }

    fn update_values_yaml(&self, c: &ClusterRef, r: &RepositoryRef, chart: &Chart, values: &[u8]) -> Result<()> {
        self.inner.update_values_yaml(c, r, chart, values)
    }

    fn get_latest_version(&self, c: &ClusterRef, r: &RepositoryRef, name: &str) -> Result<Option<String>> {
        self.inner.get_latest_version(c, r, name)
    }

    fn get_layer(&self, c: &ClusterRef, r: &RepositoryRef, name: &str, version: &str) -> Result<Option<String>> {
        self.inner.get_layer(c, r, name, version)
    }

    fn list_charts_by_cluster(&self, c: &ClusterRef, kind: Option<ChartKind>) -> Result<Vec<(RepositoryRef, Chart)>> {
        self.inner.list_charts_by_cluster(c, kind)
    }

    fn count(&self) -> Result<u64> {
        self.inner.count()
    }
}
