//! Syncs one classified index into the chart store.

use std::collections::{BTreeMap, HashSet};

use chartfleet_core::{classify, ClusterRef, IndexFile, RepositoryRef};
use chartfleet_persist::{CacheError, ChartStore};
use metrics::{counter, histogram};
use tracing::debug;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadStats {
    pub upserted: usize,
    pub pruned: usize,
}

/// Upsert every chart the index yields for (cluster, repo) and remove cached
/// charts it no longer yields. Running it twice is a no-op.
pub fn load_index(
    store: &dyn ChartStore,
    cluster: &ClusterRef,
    repo: &RepositoryRef,
    repo_annotations: &BTreeMap<String, String>,
    index: &IndexFile,
) -> Result<LoadStats, CacheError> {
    let started = std::time::Instant::now();
    let charts = classify(index, repo_annotations);
    let keep: HashSet<(&str, &str)> = charts.iter().map(|c| (c.name.as_str(), c.version.as_str())).collect();

    let existing = store.list_charts_by_repository_and_cluster(cluster, repo, None)?;
    for chart in &charts {
        store.add_chart(cluster, repo, chart)?;
    }
    let mut pruned = 0;
    for old in existing.iter().filter(|c| !keep.contains(&(c.name.as_str(), c.version.as_str()))) {
        store.remove_chart(cluster, repo, &old.name, &old.version)?;
        pruned += 1;
    }

    histogram!("chartfleet_index_load_ms", started.elapsed().as_secs_f64() * 1000.0);
    counter!("chartfleet_index_load_total", 1u64);
    debug!(cluster = %cluster, repository = %repo, upserted = charts.len(), pruned, "index loaded");
    Ok(LoadStats { upserted: charts.len(), pruned })
}
