#![forbid(unsafe_code)]

use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, bail, Context, Result};
use chartfleet_api::{ChartsApi, InProcApi};
use chartfleet_core::config::{ArtifactFetchMode, ServiceConfig};
use chartfleet_core::{ChartKind, ClusterRef, RepositoryRef};
use chartfleet_indexer::{spawn_fleet_watcher, FleetChange, FleetView};
use chartfleet_jobs::{Jobs, PipelineTiming, ValuesPipeline};
use chartfleet_kubehub::{ClusterAccess, ClusterLookup, KubeClusterAccess};
use chartfleet_persist::{ChartStore, SqliteChartStore};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tokio::signal;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "chartfleetctl", version, about = "Chartfleet: Helm chart cache across a cluster fleet")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Cache directory (holds charts.db)
    #[arg(long = "cache-dir", env = "CHARTFLEET_CACHE_DIR", global = true)]
    cache_dir: Option<std::path::PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Args, Debug, Clone)]
struct FleetArgs {
    /// Kubeconfig context to index as a leaf cluster (repeatable)
    #[arg(long = "context")]
    contexts: Vec<String>,
    /// Namespace recorded for leaf clusters
    #[arg(long = "leaf-namespace", default_value = "default")]
    leaf_namespace: String,
}

#[derive(Args, Debug, Clone)]
struct RepoArgs {
    /// Cluster key: "management", "<name>" or "<namespace>/<name>"
    #[arg(long = "cluster", default_value = chartfleet_core::MANAGEMENT_CLUSTER_NAME)]
    cluster: String,
    /// HelmRepository name
    #[arg(long = "repo")]
    repo: String,
    /// HelmRepository namespace
    #[arg(long = "repo-ns", default_value = "flux-system")]
    repo_namespace: String,
}

impl RepoArgs {
    fn refs(&self) -> (ClusterRef, RepositoryRef) {
        (parse_cluster(&self.cluster), RepositoryRef::helm_repository(&self.repo, &self.repo_namespace))
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Index HelmRepositories on the management cluster and every --context until Ctrl-C
    Serve {
        #[command(flatten)]
        fleet: FleetArgs,
    },
    /// List cached charts of a repository, grouped by name
    Charts {
        #[command(flatten)]
        repo: RepoArgs,
        /// Only "chart" or "profile" entries
        #[arg(long = "kind")]
        kind: Option<String>,
    },
    /// Latest cached version of a chart
    Latest {
        #[command(flatten)]
        repo: RepoArgs,
        /// Chart name
        chart: String,
    },
    /// Resolve a chart's default values (cache first, then the owning cluster)
    Values {
        #[command(flatten)]
        repo: RepoArgs,
        #[command(flatten)]
        fleet: FleetArgs,
        /// Chart name
        chart: String,
        /// Chart version
        version: String,
    },
}

fn init_tracing() {
    let env = std::env::var("CHARTFLEET_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics(cfg: &ServiceConfig) {
    if let Some(addr) = cfg.metrics_addr.as_deref() {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid CHARTFLEET_METRICS_ADDR; expected host:port");
        }
    }
}

fn parse_cluster(key: &str) -> ClusterRef {
    match key.split_once('/') {
        Some((ns, name)) => ClusterRef::new(name, ns),
        None => ClusterRef::new(key, ""),
    }
}

fn open_store(cfg: &ServiceConfig) -> Result<Arc<SqliteChartStore>> {
    let store = SqliteChartStore::open_in_dir(&cfg.cache_dir).with_context(|| format!("opening chart cache in {}", cfg.cache_dir.display()))?;
    Ok(Arc::new(store))
}

/// Management cluster from the current context plus one leaf per `--context`.
async fn connect_fleet(cfg: &ServiceConfig, fleet: &FleetArgs) -> Result<Vec<Arc<dyn ClusterAccess>>> {
    let management = ClusterRef::new(cfg.management_cluster.clone(), "");
    let mut management = KubeClusterAccess::from_context(management, None).await?;
    if cfg.management_fetch == ArtifactFetchMode::Direct {
        management = management.with_direct_fetch(cfg.source_controller_host.clone())?;
    }
    let mut out: Vec<Arc<dyn ClusterAccess>> = vec![Arc::new(management)];
    for ctx in &fleet.contexts {
        let cluster = ClusterRef::new(ctx.clone(), fleet.leaf_namespace.clone());
        out.push(Arc::new(KubeClusterAccess::from_context(cluster, Some(ctx)).await?));
    }
    Ok(out)
}

fn in_proc_api(cfg: &ServiceConfig, store: Arc<SqliteChartStore>, fleet: Arc<dyn ClusterLookup>) -> (InProcApi, ValuesPipeline) {
    let store = store as Arc<dyn ChartStore>;
    let pipeline = ValuesPipeline::new(store.clone(), fleet, Arc::new(Jobs::new(cfg.job_ttl)), PipelineTiming::from(cfg));
    (InProcApi::new(store, pipeline.clone()), pipeline)
}

#[derive(Serialize)]
struct LatestOut<'a> {
    chart: &'a str,
    version: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let mut cfg = ServiceConfig::from_env();
    if let Some(dir) = cli.cache_dir.clone() {
        cfg.cache_dir = dir;
    }
    init_metrics(&cfg);

    match cli.command {
        Commands::Serve { fleet } => {
            let store = open_store(&cfg)?;
            let clusters = connect_fleet(&cfg, &fleet).await?;
            let (tx, handle) = spawn_fleet_watcher(store.clone() as Arc<dyn ChartStore>, cfg.retry_policy(), cfg.fleet_queue_cap);
            let (_api, pipeline) = in_proc_api(&cfg, store, handle.view.clone() as Arc<dyn ClusterLookup>);
            let reaper = pipeline.spawn_reaper();
            info!(clusters = clusters.len(), db = %cfg.database_path().display(), "serving");
            tx.send(FleetChange::added(clusters)).await.map_err(|_| anyhow!("fleet supervisor stopped before start"))?;

            signal::ctrl_c().await.context("waiting for Ctrl-C")?;
            info!("shutting down");
            pipeline.shutdown();
            drop(tx);
            handle.shutdown().await;
            let _ = reaper.await;
        }
        Commands::Charts { repo, kind } => {
            let kind = kind.as_deref().map(ChartKind::from_str).transpose().map_err(|e| anyhow!("--kind: {}", e))?;
            let (cluster, repo_ref) = repo.refs();
            let (api, _) = in_proc_api(&cfg, open_store(&cfg)?, Arc::new(FleetView::default()));
            let charts = api.list_charts_for_repository(&cluster, &repo_ref, kind).await?;
            match cli.output {
                Output::Human => {
                    if charts.is_empty() {
                        eprintln!("no charts cached for {}/{} on {}", repo_ref.namespace, repo_ref.name, cluster);
                    }
                    for c in charts {
                        match c.layer {
                            Some(layer) => println!("{} • {} • layer={}", c.name, c.versions.join(", "), layer),
                            None => println!("{} • {}", c.name, c.versions.join(", ")),
                        }
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&charts)?),
            }
        }
        Commands::Latest { repo, chart } => {
            let (cluster, repo_ref) = repo.refs();
            let (api, _) = in_proc_api(&cfg, open_store(&cfg)?, Arc::new(FleetView::default()));
            let version = api.get_latest_version(&cluster, &repo_ref, &chart).await?;
            match cli.output {
                Output::Human => println!("{}@{}", chart, version),
                Output::Json => println!("{}", serde_json::to_string_pretty(&LatestOut { chart: &chart, version })?),
            }
        }
        Commands::Values { repo, fleet, chart, version } => {
            let t0 = Instant::now();
            let (cluster, repo_ref) = repo.refs();
            let store = open_store(&cfg)?;
            // lookup only: no reconcilers, so nothing on the clusters is patched or indexed
            let view = Arc::new(FleetView::from_clusters(connect_fleet(&cfg, &fleet).await?));
            if view.get(&cluster).is_none() {
                bail!("cluster {} is not part of the fleet", cluster);
            }

            let (api, pipeline) = in_proc_api(&cfg, store, view as Arc<dyn ClusterLookup>);
            let id = api.get_values_for_chart(&cluster, &repo_ref, &chart, &version).await?;
            let outcome = loop {
                if let Some(done) = api.get_charts_job_raw(&id).await? {
                    break done;
                }
                tokio::time::sleep(cfg.ready_poll_interval).await;
            };
            pipeline.shutdown();

            let values = outcome.map_err(|e| anyhow!(e))?;
            info!(job = %id, bytes = values.len(), took_ms = %t0.elapsed().as_millis(), "values resolved");
            match cli.output {
                Output::Human => print!("{}", String::from_utf8_lossy(&values)),
                Output::Json => {
                    let job = api.get_charts_job(&id).await?;
                    println!("{}", serde_json::to_string_pretty(&job)?);
                }
            }
        }
    }
    Ok(())
}
