//! Chartfleet persistence: SQLite cache of charts indexed per (cluster, repository),
//! with their lazily resolved default values.

#![forbid(unsafe_code)]

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chartfleet_core::version::latest_version;
use chartfleet_core::{Chart, ChartKind, ClusterRef, RepositoryRef, VersionError};
use metrics::{counter, histogram};
use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;
use tracing::debug;

mod adapters;

pub use adapters::{IndexChartReader, StaticChartReader};

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error(transparent)]
    Version(#[from] VersionError),
    #[error("{0} is not implemented by this reader")]
    NotImplemented(&'static str),
    #[error("chart store lock poisoned")]
    Poisoned,
    #[error("preparing cache directory: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = CacheError> = std::result::Result<T, E>;

pub trait ChartWriter: Send + Sync {
    /// Insert the chart, or refresh kind and layer when already present.
    fn add_chart(&self, cluster: &ClusterRef, repo: &RepositoryRef, chart: &Chart) -> Result<()>;
    fn remove_chart(&self, cluster: &ClusterRef, repo: &RepositoryRef, name: &str, version: &str) -> Result<()>;
    /// Purge every chart (and cached values) of one repository.
    fn delete(&self, cluster: &ClusterRef, repo: &RepositoryRef) -> Result<()>;
    fn delete_all_charts_for_cluster(&self, cluster: &ClusterRef) -> Result<()>;
}

pub trait ChartReader: Send + Sync {
    fn list_charts_by_repository_and_cluster(&self, cluster: &ClusterRef, repo: &RepositoryRef, kind: Option<ChartKind>) -> Result<Vec<Chart>>;
    fn is_known_chart(&self, cluster: &ClusterRef, repo: &RepositoryRef, chart: &Chart) -> Result<bool>;
    /// Cached values; `None` when the chart is unknown or not resolved yet.
    fn get_chart_values(&self, cluster: &ClusterRef, repo: &RepositoryRef, chart: &Chart) -> Result<Option<Vec<u8>>>;
    fn update_values_yaml(&self, cluster: &ClusterRef, repo: &RepositoryRef, chart: &Chart, values: &[u8]) -> Result<()>;
    /// Highest semver among the cached versions of `name`.
    fn get_latest_version(&self, cluster: &ClusterRef, repo: &RepositoryRef, name: &str) -> Result<Option<String>>;
    fn get_layer(&self, cluster: &ClusterRef, repo: &RepositoryRef, name: &str, version: &str) -> Result<Option<String>>;
    fn list_charts_by_cluster(&self, cluster: &ClusterRef, kind: Option<ChartKind>) -> Result<Vec<(RepositoryRef, Chart)>>;
    fn count(&self) -> Result<u64>;
}

/// Full read/write cache.
pub trait ChartStore: ChartWriter + ChartReader {}

impl<T: ChartWriter + ChartReader> ChartStore for T {}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS helm_charts (
    name              TEXT NOT NULL,
    version           TEXT NOT NULL,
    kind              TEXT NOT NULL,
    layer             TEXT,
    values_yaml       BLOB,
    repo_kind         TEXT NOT NULL,
    repo_api_version  TEXT NOT NULL,
    repo_name         TEXT NOT NULL,
    repo_namespace    TEXT NOT NULL,
    cluster_name      TEXT NOT NULL,
    cluster_namespace TEXT NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_helm_charts_identity ON helm_charts(
    repo_kind, repo_api_version, repo_name, repo_namespace,
    cluster_name, cluster_namespace, name, version
);
CREATE INDEX IF NOT EXISTS idx_helm_charts_cluster ON helm_charts(cluster_name, cluster_namespace);
";

// Shared WHERE fragment; positional params ?1..?6 are repo then cluster.
const REPO_AND_CLUSTER: &str = "repo_kind = ?1 AND repo_api_version = ?2 AND repo_name = ?3 AND repo_namespace = ?4 \
     AND cluster_name = ?5 AND cluster_namespace = ?6";

/// SQLite-backed chart cache. One connection, serialized by a mutex.
pub struct SqliteChartStore {
    db: Mutex<Connection>,
}

impl SqliteChartStore {
    /// Open (or create) `charts.db` under `dir`.
    pub fn open_in_dir(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        Self::open(&dir.join("charts.db"))
    }

    pub fn open(path: &Path) -> Result<Self> {
        let started = std::time::Instant::now();
        let db = Connection::open(path)?;
        db.pragma_update(None, "journal_mode", "WAL").ok();
        db.pragma_update(None, "synchronous", "NORMAL").ok();
        let me = Self::init(db)?;
        histogram!("chartfleet_store_open_ms", started.elapsed().as_secs_f64() * 1000.0);
        debug!(path = %path.display(), "chart store opened");
        Ok(me)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(db: Connection) -> Result<Self> {
        db.execute_batch(SCHEMA)?;
        Ok(Self { db: Mutex::new(db) })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.db.lock().map_err(|_| CacheError::Poisoned)
    }

    fn write<F>(&self, op: &'static str, f: F) -> Result<usize>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<usize>,
    {
        let started = std::time::Instant::now();
        let db = self.conn()?;
        let n = f(&db)?;
        histogram!("chartfleet_store_write_ms", started.elapsed().as_secs_f64() * 1000.0, "op" => op);
        counter!("chartfleet_store_writes_total", 1u64, "op" => op);
        Ok(n)
    }
}

fn row_to_chart(row: &rusqlite::Row<'_>) -> rusqlite::Result<Chart> {
    let kind: String = row.get(2)?;
    let kind = kind.parse::<ChartKind>().map_err(|e| rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, e.into()))?;
    Ok(Chart {
        name: row.get(0)?,
        version: row.get(1)?,
        kind,
        layer: row.get(3)?,
    })
}

impl ChartWriter for SqliteChartStore {
    fn add_chart(&self, cluster: &ClusterRef, repo: &RepositoryRef, chart: &Chart) -> Result<()> {
        self.write("add", |db| {
            db.execute(
                "INSERT INTO helm_charts (repo_kind, repo_api_version, repo_name, repo_namespace,
                                          cluster_name, cluster_namespace, name, version, kind, layer)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                 ON CONFLICT (repo_kind, repo_api_version, repo_name, repo_namespace,
                              cluster_name, cluster_namespace, name, version)
                 DO UPDATE SET kind = excluded.kind, layer = excluded.layer",
                params![
                    repo.kind,
                    repo.api_version,
                    repo.name,
                    repo.namespace,
                    cluster.name,
                    cluster.namespace,
                    chart.name,
                    chart.version,
                    chart.kind.as_str(),
                    chart.layer
                ],
            )
        })?;
        Ok(())
    }

    fn remove_chart(&self, cluster: &ClusterRef, repo: &RepositoryRef, name: &str, version: &str) -> Result<()> {
        let sql = format!("DELETE FROM helm_charts WHERE {} AND name = ?7 AND version = ?8", REPO_AND_CLUSTER);
        self.write("remove", |db| {
            db.execute(&sql, params![repo.kind, repo.api_version, repo.name, repo.namespace, cluster.name, cluster.namespace, name, version])
        })?;
        Ok(())
    }

    fn delete(&self, cluster: &ClusterRef, repo: &RepositoryRef) -> Result<()> {
        let sql = format!("DELETE FROM helm_charts WHERE {}", REPO_AND_CLUSTER);
        let n = self.write("delete_repo", |db| {
            db.execute(&sql, params![repo.kind, repo.api_version, repo.name, repo.namespace, cluster.name, cluster.namespace])
        })?;
        debug!(cluster = %cluster, repository = %repo, removed = n, "purged repository charts");
        Ok(())
    }

    fn delete_all_charts_for_cluster(&self, cluster: &ClusterRef) -> Result<()> {
        let n = self.write("delete_cluster", |db| {
            db.execute(
                "DELETE FROM helm_charts WHERE cluster_name = ?1 AND cluster_namespace = ?2",
                params![cluster.name, cluster.namespace],
            )
        })?;
        debug!(cluster = %cluster, removed = n, "purged cluster charts");
        Ok(())
    }
}

impl ChartReader for SqliteChartStore {
    fn list_charts_by_repository_and_cluster(&self, cluster: &ClusterRef, repo: &RepositoryRef, kind: Option<ChartKind>) -> Result<Vec<Chart>> {
        let db = self.conn()?;
        let sql = format!(
            "SELECT name, version, kind, layer FROM helm_charts WHERE {} AND (?7 IS NULL OR kind = ?7) ORDER BY name, rowid",
            REPO_AND_CLUSTER
        );
        let mut stmt = db.prepare_cached(&sql)?;
        let rows = stmt.query_map(
            params![repo.kind, repo.api_version, repo.name, repo.namespace, cluster.name, cluster.namespace, kind.map(|k| k.as_str())],
            row_to_chart,
        )?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn is_known_chart(&self, cluster: &ClusterRef, repo: &RepositoryRef, chart: &Chart) -> Result<bool> {
        let db = self.conn()?;
        let sql = format!("SELECT COUNT(*) FROM helm_charts WHERE {} AND name = ?7 AND version = ?8", REPO_AND_CLUSTER);
        let n: i64 = db.query_row(
            &sql,
            params![repo.kind, repo.api_version, repo.name, repo.namespace, cluster.name, cluster.namespace, chart.name, chart.version],
            |r| r.get(0),
        )?;
        Ok(n > 0)
    }

    fn get_chart_values(&self, cluster: &ClusterRef, repo: &RepositoryRef, chart: &Chart) -> Result<Option<Vec<u8>>> {
        let db = self.conn()?;
        let sql = format!("SELECT values_yaml FROM helm_charts WHERE {} AND name = ?7 AND version = ?8", REPO_AND_CLUSTER);
        let found: Option<Option<Vec<u8>>> = db
            .query_row(
                &sql,
                params![repo.kind, repo.api_version, repo.name, repo.namespace, cluster.name, cluster.namespace, chart.name, chart.version],
                |r| r.get(0),
            )
            .optional()?;
        Ok(found.flatten())
    }

    fn update_values_yaml(&self, cluster: &ClusterRef, repo: &RepositoryRef, chart: &Chart, values: &[u8]) -> Result<()> {
        let sql = format!("UPDATE helm_charts SET values_yaml = ?9 WHERE {} AND name = ?7 AND version = ?8", REPO_AND_CLUSTER);
        let n = self.write("values", |db| {
            db.execute(
                &sql,
                params![repo.kind, repo.api_version, repo.name, repo.namespace, cluster.name, cluster.namespace, chart.name, chart.version, values],
            )
        })?;
        if n == 0 {
            debug!(cluster = %cluster, repository = %repo, chart = %chart, "values for uncached chart dropped");
        }
        Ok(())
    }

    fn get_latest_version(&self, cluster: &ClusterRef, repo: &RepositoryRef, name: &str) -> Result<Option<String>> {
        let versions = {
            let db = self.conn()?;
            let sql = format!("SELECT version FROM helm_charts WHERE {} AND name = ?7", REPO_AND_CLUSTER);
            let mut stmt = db.prepare_cached(&sql)?;
            let rows = stmt.query_map(
                params![repo.kind, repo.api_version, repo.name, repo.namespace, cluster.name, cluster.namespace, name],
                |r| r.get::<_, String>(0),
            )?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };
        Ok(latest_version(versions)?)
    }

    fn get_layer(&self, cluster: &ClusterRef, repo: &RepositoryRef, name: &str, version: &str) -> Result<Option<String>> {
        let db = self.conn()?;
        let sql = format!("SELECT layer FROM helm_charts WHERE {} AND name = ?7 AND version = ?8", REPO_AND_CLUSTER);
        let found: Option<Option<String>> = db
            .query_row(
                &sql,
                params![repo.kind, repo.api_version, repo.name, repo.namespace, cluster.name, cluster.namespace, name, version],
                |r| r.get(0),
            )
            .optional()?;
        Ok(found.flatten())
    }

    fn list_charts_by_cluster(&self, cluster: &ClusterRef, kind: Option<ChartKind>) -> Result<Vec<(RepositoryRef, Chart)>> {
        let db = self.conn()?;
        let mut stmt = db.prepare_cached(
            "SELECT name, version, kind, layer, repo_kind, repo_api_version, repo_name, repo_namespace
             FROM helm_charts
             WHERE cluster_name = ?1 AND cluster_namespace = ?2 AND (?3 IS NULL OR kind = ?3)
             ORDER BY repo_namespace, repo_name, name, rowid",
        )?;
        let rows = stmt.query_map(params![cluster.name, cluster.namespace, kind.map(|k| k.as_str())], |r| {
            let chart = row_to_chart(r)?;
            let repo = RepositoryRef::new(r.get::<_, String>(4)?, r.get::<_, String>(5)?, r.get::<_, String>(6)?, r.get::<_, String>(7)?);
            Ok((repo, chart))
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn count(&self) -> Result<u64> {
        let db = self.conn()?;
        let n: i64 = db.query_row("SELECT COUNT(*) FROM helm_charts", [], |r| r.get(0))?;
        Ok(n.max(0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn refs() -> (ClusterRef, RepositoryRef) {
        (ClusterRef::new("cluster1", "default"), RepositoryRef::helm_repository("weave-charts", "team-a"))
    }

    #[test]
    fn upsert_refreshes_kind_and_keeps_values() {
        let store = SqliteChartStore::open_in_memory().unwrap();
        let (cluster, repo) = refs();
        let chart = Chart::new("nginx", "1.0.0", ChartKind::Chart, None);
        store.add_chart(&cluster, &repo, &chart).unwrap();
        store.update_values_yaml(&cluster, &repo, &chart, b"replicas: 1\n").unwrap();

        let profile = Chart::new("nginx", "1.0.0", ChartKind::Profile, Some("layer-0".into()));
        store.add_chart(&cluster, &repo, &profile).unwrap();

        let listed = store.list_charts_by_repository_and_cluster(&cluster, &repo, None).unwrap();
        assert_eq!(listed, vec![profile.clone()]);
        assert_eq!(store.get_chart_values(&cluster, &repo, &profile).unwrap().as_deref(), Some(&b"replicas: 1\n"[..]));
        assert_eq!(store.count().unwrap(), 1);
    }

    #[test]
    fn unknown_stored_kind_is_an_error() {
        let store = SqliteChartStore::open_in_memory().unwrap();
        let (cluster, repo) = refs();
        store.add_chart(&cluster, &repo, &Chart::new("nginx", "1.0.0", ChartKind::Chart, None)).unwrap();
        store.conn().unwrap().execute("UPDATE helm_charts SET kind = 'bogus'", []).unwrap();

        let err = store.list_charts_by_repository_and_cluster(&cluster, &repo, None).unwrap_err();
        assert!(matches!(err, CacheError::Sqlite(rusqlite::Error::FromSqlConversionFailure(2, _, _))), "{err:?}");
        assert!(store.list_charts_by_cluster(&cluster, None).is_err());
    }

    #[test]
    fn kind_filter_applies() {
        let store = SqliteChartStore::open_in_memory().unwrap();
        let (cluster, repo) = refs();
        store.add_chart(&cluster, &repo, &Chart::new("a", "1.0.0", ChartKind::Chart, None)).unwrap();
        store.add_chart(&cluster, &repo, &Chart::new("b", "1.0.0", ChartKind::Profile, None)).unwrap();
        let profiles = store.list_charts_by_repository_and_cluster(&cluster, &repo, Some(ChartKind::Profile)).unwrap();
        assert_eq!(profiles.len(), 1);
        assert_eq!(profiles[0].name, "b");
    }

    #[test]
    fn missing_values_are_none() {
        let store = SqliteChartStore::open_in_memory().unwrap();
        let (cluster, repo) = refs();
        let chart = Chart::reference("ghost", "0.1.0");
        assert_eq!(store.get_chart_values(&cluster, &repo, &chart).unwrap(), None);
        store.add_chart(&cluster, &repo, &chart).unwrap();
        assert_eq!(store.get_chart_values(&cluster, &repo, &chart).unwrap(), None);
    }
}
