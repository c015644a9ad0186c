//! Maps in-cluster artifact URLs (`http://<svc>.<ns>.svc.cluster.local./...`)
//! onto API-server service proxy requests, so artifacts served inside a
//! remote cluster are reachable from outside it.

use thiserror::Error;
use url::Url;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid artifact URL {url:?}: {reason}")]
pub struct ArtifactUrlError {
    pub url: String,
    pub reason: String,
}

impl ArtifactUrlError {
    fn new(url: &str, reason: impl Into<String>) -> Self {
        Self { url: url.to_string(), reason: reason.into() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceProxyTarget {
    pub scheme: String,
    pub namespace: String,
    pub service: String,
    pub port: u16,
    pub path: String,
}

impl ServiceProxyTarget {
    /// API-server path that proxies to this service.
    pub fn proxy_path(&self) -> String {
        format!(
            "/api/v1/namespaces/{}/services/{}:{}:{}/proxy{}",
            self.namespace, self.scheme, self.service, self.port, self.path
        )
    }
}

const INDEX_SUFFIX: &str = "/index.yaml";

/// `Url` forgets a port equal to the scheme default, so look at the raw authority.
fn port_or_80(raw: &str, url: &Url) -> u16 {
    if let Some(port) = url.port() {
        return port;
    }
    let authority = raw.split_once("://").and_then(|(_, rest)| rest.split(['/', '?', '#']).next()).unwrap_or("");
    let explicit = authority.rsplit_once(':').is_some_and(|(_, p)| !p.is_empty() && p.bytes().all(|b| b.is_ascii_digit()));
    if explicit { url.port_or_known_default().unwrap_or(80) } else { 80 }
}

pub fn parse_artifact_url(raw: &str) -> Result<ServiceProxyTarget, ArtifactUrlError> {
    let url = Url::parse(raw).map_err(|e| ArtifactUrlError::new(raw, e.to_string()))?;
    let host = url.host_str().ok_or_else(|| ArtifactUrlError::new(raw, "missing host"))?;
    let labels: Vec<&str> = host.split('.').collect();
    if labels.len() != 6 {
        return Err(ArtifactUrlError::new(raw, format!("expected a fully qualified service host, got {:?}", host)));
    }
    if labels[2] != "svc" {
        return Err(ArtifactUrlError::new(raw, format!("host {:?} is not a service address", host)));
    }
    let mut path = url.path().to_string();
    if path.is_empty() || path == "/" {
        return Err(ArtifactUrlError::new(raw, "missing artifact path"));
    }
    if let Some(head) = path.strip_suffix(INDEX_SUFFIX) {
        if head.ends_with(".yaml") {
            path = head.to_string();
        }
    }
    Ok(ServiceProxyTarget {
        scheme: url.scheme().to_string(),
        namespace: labels[1].to_string(),
        service: labels[0].to_string(),
        port: port_or_80(raw, &url),
        path,
    })
}

/// Point an artifact URL at `host` (`name` or `name:port`), keeping scheme and path.
/// Used when the in-cluster service name is not resolvable from where we run.
pub fn override_host(raw: &str, host: &str) -> Result<String, ArtifactUrlError> {
    let mut url = Url::parse(raw).map_err(|e| ArtifactUrlError::new(raw, e.to_string()))?;
    let with = Url::parse(&format!("http://{}", host)).map_err(|e| ArtifactUrlError::new(raw, format!("bad override host {:?}: {}", host, e)))?;
    if with.path() != "/" || with.query().is_some() {
        return Err(ArtifactUrlError::new(raw, format!("override host {:?} must not carry a path", host)));
    }
    let name = with.host_str().ok_or_else(|| ArtifactUrlError::new(raw, format!("override host {:?} is empty", host)))?;
    url.set_host(Some(name)).map_err(|e| ArtifactUrlError::new(raw, e.to_string()))?;
    url.set_port(with.port()).map_err(|_| ArtifactUrlError::new(raw, "cannot set port"))?;
    Ok(url.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_source_controller_url() {
        let t = parse_artifact_url(
            "http://source-controller.flux-system.svc.cluster.local./helmchart/default/demo-profile/demo-profile-0.0.1.tgz",
        )
        .unwrap();
        assert_eq!(
            t,
            ServiceProxyTarget {
                scheme: "http".into(),
                namespace: "flux-system".into(),
                service: "source-controller".into(),
                port: 80,
                path: "/helmchart/default/demo-profile/demo-profile-0.0.1.tgz".into(),
            }
        );
        assert_eq!(
            t.proxy_path(),
            "/api/v1/namespaces/flux-system/services/http:source-controller:80/proxy/helmchart/default/demo-profile/demo-profile-0.0.1.tgz"
        );
    }

    #[test]
    fn port_defaults_to_80_even_for_https() {
        let t = parse_artifact_url("https://charts.flux-system.svc.cluster.local./index.yaml").unwrap();
        assert_eq!(t.port, 80);
        let t = parse_artifact_url("https://charts.flux-system.svc.cluster.local.:443/index.yaml").unwrap();
        assert_eq!(t.port, 443);
    }

    #[test]
    fn explicit_port_is_kept() {
        let t = parse_artifact_url("http://source-controller.flux-system.svc.cluster.local.:9090/x.tgz").unwrap();
        assert_eq!(t.port, 9090);
    }

    #[test]
    fn strips_trailing_index_after_yaml_artifact() {
        let t = parse_artifact_url(
            "http://source-controller.flux-system.svc.cluster.local./helmrepository/default/charts/index-1a2b.yaml/index.yaml",
        )
        .unwrap();
        assert_eq!(t.path, "/helmrepository/default/charts/index-1a2b.yaml");
        let plain = parse_artifact_url("http://source-controller.flux-system.svc.cluster.local./helmrepository/default/charts/index.yaml").unwrap();
        assert_eq!(plain.path, "/helmrepository/default/charts/index.yaml");
    }

    #[test]
    fn yaml_artifact_at_root_keeps_its_name() {
        let t = parse_artifact_url("http://source-controller.flux-system.svc.cluster.local./demo-index.yaml/index.yaml").unwrap();
        assert_eq!(t.path, "/demo-index.yaml");
        assert_eq!(t.proxy_path(), "/api/v1/namespaces/flux-system/services/http:source-controller:80/proxy/demo-index.yaml");
    }

    #[test]
    fn override_replaces_host_and_port() {
        let raw = "http://source-controller.flux-system.svc.cluster.local./helmrepository/default/charts/index.yaml";
        assert_eq!(override_host(raw, "localhost:8080").unwrap(), "http://localhost:8080/helmrepository/default/charts/index.yaml");
        assert_eq!(override_host(raw, "127.0.0.1").unwrap(), "http://127.0.0.1/helmrepository/default/charts/index.yaml");
        let ported = "http://source-controller.flux-system.svc.cluster.local.:9090/x.tgz";
        assert_eq!(override_host(ported, "localhost").unwrap(), "http://localhost/x.tgz");
    }

    #[test]
    fn override_rejects_paths_and_garbage() {
        let raw = "http://source-controller.flux-system.svc.cluster.local./x.tgz";
        assert!(override_host(raw, "localhost/extra").is_err());
        assert!(override_host(raw, "").is_err());
        assert!(override_host("not a url", "localhost").is_err());
    }

    #[test]
    fn rejects_non_service_hosts() {
        for bad in [
            "http://example.com/chart.tgz",
            "http://source-controller.flux-system.svc.cluster.local/chart.tgz",
            "http://source-controller.flux-system.pod.cluster.local./chart.tgz",
            "http://source-controller.flux-system.svc.cluster.local./",
            "not a url",
        ] {
            let err = parse_artifact_url(bad).unwrap_err();
            assert!(err.to_string().starts_with("invalid artifact URL"), "{}", err);
        }
    }
}
