use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chartfleet_core::ClusterRef;
use futures::io::AsyncReadExt;
use futures::stream::BoxStream;
use futures::StreamExt;
use kube::{
    api::{Api, DeleteParams, Patch, PatchParams, PostParams},
    config::KubeConfigOptions,
    runtime::{watcher, watcher::Event, WatchStreamExt},
    Client, ResourceExt,
};
use metrics::{counter, histogram};
use tracing::{debug, info};

use crate::artifact::{override_host, parse_artifact_url};
use crate::crd::{HelmChart, HelmRepository};
use crate::{ClusterAccess, RepositoryEvent};

const DIRECT_FETCH_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone)]
enum Transport {
    /// Through the API server's service proxy.
    Proxy,
    /// Plain GET against the artifact URL, optionally with its host swapped.
    Direct { http: reqwest::Client, host: Option<String> },
}

/// `ClusterAccess` over a real API server.
#[derive(Clone)]
pub struct KubeClusterAccess {
    cluster: ClusterRef,
    client: Client,
    transport: Transport,
}

impl KubeClusterAccess {
    pub fn new(cluster: ClusterRef, client: Client) -> Self {
        Self { cluster, client, transport: Transport::Proxy }
    }

    /// Fetch artifacts with plain HTTP instead of the service proxy. Only
    /// useful when source-controller is reachable from this process.
    pub fn with_direct_fetch(mut self, host_override: Option<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(DIRECT_FETCH_TIMEOUT)
            .build()
            .context("building artifact HTTP client")?;
        info!(cluster = %self.cluster, host_override = ?host_override, "artifacts fetched directly");
        self.transport = Transport::Direct { http, host: host_override };
        Ok(self)
    }

    pub fn from_config(cluster: ClusterRef, config: kube::Config) -> Result<Self> {
        let client = Client::try_from(config).with_context(|| format!("building client for cluster {}", cluster))?;
        Ok(Self::new(cluster, client))
    }

    /// Connect using a kubeconfig context (`None` = current context).
    pub async fn from_context(cluster: ClusterRef, context: Option<&str>) -> Result<Self> {
        let opts = KubeConfigOptions { context: context.map(str::to_string), ..Default::default() };
        let config = kube::Config::from_kubeconfig(&opts)
            .await
            .with_context(|| format!("loading kubeconfig context {:?}", context))?;
        info!(cluster = %cluster, context = ?context, "cluster client ready");
        Self::from_config(cluster, config)
    }

    fn repositories(&self, namespace: &str) -> Api<HelmRepository> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn charts(&self, namespace: &str) -> Api<HelmChart> {
        Api::namespaced(self.client.clone(), namespace)
    }

    async fn fetch_proxied(&self, url: &str) -> Result<Vec<u8>> {
        let target = parse_artifact_url(url)?;
        let req = http::Request::get(target.proxy_path()).body(Vec::new()).context("building proxy request")?;
        let reader = self
            .client
            .request_stream(req)
            .await
            .with_context(|| format!("proxying {} through cluster {}", url, self.cluster))?;
        futures::pin_mut!(reader);
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await.with_context(|| format!("reading artifact {}", url))?;
        Ok(buf)
    }

    async fn fetch_direct(http: &reqwest::Client, host: Option<&str>, url: &str) -> Result<Vec<u8>> {
        let target = match host {
            Some(h) => override_host(url, h)?,
            None => url.to_string(),
        };
        let resp = http.get(&target).send().await.with_context(|| format!("fetching {}", target))?;
        let resp = resp.error_for_status().with_context(|| format!("fetching {}", target))?;
        let body = resp.bytes().await.with_context(|| format!("reading artifact {}", target))?;
        Ok(body.to_vec())
    }

    async fn patch_finalizers(&self, repo: &HelmRepository, finalizers: Vec<String>) -> Result<()> {
        let ns = repo.namespace().unwrap_or_default();
        let name = repo.name_any();
        let patch = serde_json::json!({ "metadata": { "finalizers": finalizers } });
        self.repositories(&ns)
            .patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .with_context(|| format!("patching finalizers of {}/{}", ns, name))?;
        Ok(())
    }
}

fn is_not_found(e: &kube::Error) -> bool {
    matches!(e, kube::Error::Api(ae) if ae.code == 404)
}

#[async_trait]
impl ClusterAccess for KubeClusterAccess {
    fn cluster(&self) -> &ClusterRef {
        &self.cluster
    }

    async fn fetch_artifact(&self, url: &str) -> Result<Vec<u8>> {
        let started = std::time::Instant::now();
        let (buf, mode) = match &self.transport {
            Transport::Proxy => (self.fetch_proxied(url).await?, "proxy"),
            Transport::Direct { http, host } => (Self::fetch_direct(http, host.as_deref(), url).await?, "direct"),
        };
        histogram!("chartfleet_artifact_fetch_ms", started.elapsed().as_secs_f64() * 1000.0, "mode" => mode);
        counter!("chartfleet_artifact_fetch_bytes", buf.len() as u64, "mode" => mode);
        debug!(cluster = %self.cluster, url, mode, bytes = buf.len(), "artifact fetched");
        Ok(buf)
    }

    async fn add_finalizer(&self, repo: &HelmRepository, finalizer: &str) -> Result<()> {
        if repo.has_finalizer(finalizer) {
            return Ok(());
        }
        let mut finalizers = repo.finalizers().to_vec();
        finalizers.push(finalizer.to_string());
        self.patch_finalizers(repo, finalizers).await
    }

    async fn remove_finalizer(&self, repo: &HelmRepository, finalizer: &str) -> Result<()> {
        if !repo.has_finalizer(finalizer) {
            return Ok(());
        }
        let finalizers = repo.finalizers().iter().filter(|f| f.as_str() != finalizer).cloned().collect();
        match self.patch_finalizers(repo, finalizers).await {
            Err(e) if e.downcast_ref::<kube::Error>().map_or(false, is_not_found) => Ok(()),
            other => other,
        }
    }

    async fn create_chart(&self, chart: &HelmChart) -> Result<()> {
        let ns = chart.namespace().unwrap_or_default();
        self.charts(&ns)
            .create(&PostParams::default(), chart)
            .await
            .with_context(|| format!("creating HelmChart {}/{}", ns, chart.name_any()))?;
        Ok(())
    }

    async fn get_chart(&self, namespace: &str, name: &str) -> Result<Option<HelmChart>> {
        self.charts(namespace).get_opt(name).await.with_context(|| format!("getting HelmChart {}/{}", namespace, name))
    }

    async fn delete_chart(&self, namespace: &str, name: &str) -> Result<()> {
        match self.charts(namespace).delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e).with_context(|| format!("deleting HelmChart {}/{}", namespace, name)),
        }
    }

    fn repository_events(&self) -> BoxStream<'static, Result<RepositoryEvent>> {
        let api: Api<HelmRepository> = Api::all(self.client.clone());
        let cluster = self.cluster.clone();
        watcher::watcher(api, watcher::Config::default())
            .default_backoff()
            .flat_map(move |ev| {
                let items: Vec<Result<RepositoryEvent>> = match ev {
                    Ok(Event::Applied(o)) => vec![Ok(RepositoryEvent::Applied(o))],
                    Ok(Event::Deleted(o)) => vec![Ok(RepositoryEvent::Deleted(o))],
                    Ok(Event::Restarted(list)) => {
                        debug!(cluster = %cluster, count = list.len(), "repository watch restart");
                        list.into_iter().map(|o| Ok(RepositoryEvent::Applied(o))).collect()
                    }
                    Err(e) => vec![Err(anyhow::Error::new(e).context(format!("watching HelmRepository on {}", cluster)))],
                };
                futures::stream::iter(items)
            })
            .boxed()
    }
}
