//! The subset of Flux `source.toolkit.fluxcd.io/v1beta2` types chartfleet reads and writes.

use std::collections::BTreeMap;

use chartfleet_core::RepositoryRef;
use kube::{CustomResource, ResourceExt};
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[kube(
    group = "source.toolkit.fluxcd.io",
    version = "v1beta2",
    kind = "HelmRepository",
    namespaced,
    status = "HelmRepositoryStatus",
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct HelmRepositorySpec {
    #[serde(default)]
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<String>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub repo_type: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelmRepositoryStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<Artifact>,
    /// Fetch link for the latest index artifact.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Artifact {
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub revision: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: String,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
}

fn ready(conditions: &[Condition]) -> Option<&Condition> {
    conditions.iter().find(|c| c.type_ == "Ready")
}

#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[kube(
    group = "source.toolkit.fluxcd.io",
    version = "v1beta2",
    kind = "HelmChart",
    namespaced,
    status = "HelmChartStatus",
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct HelmChartSpec {
    pub chart: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub source_ref: LocalSourceReference,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalSourceReference {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,
    pub kind: String,
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelmChartStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<Artifact>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl HelmRepository {
    pub fn repository_ref(&self) -> RepositoryRef {
        RepositoryRef::helm_repository(self.name_any(), self.namespace().unwrap_or_default())
    }

    pub fn annotations_map(&self) -> BTreeMap<String, String> {
        self.metadata.annotations.clone().unwrap_or_default()
    }

    pub fn artifact(&self) -> Option<&Artifact> {
        self.status.as_ref().and_then(|s| s.artifact.as_ref())
    }

    /// Where to fetch the index: the status URL, else the artifact URL.
    pub fn index_url(&self) -> Option<&str> {
        let status = self.status.as_ref()?;
        status
            .url
            .as_deref()
            .filter(|u| !u.is_empty())
            .or_else(|| status.artifact.as_ref().map(|a| a.url.as_str()).filter(|u| !u.is_empty()))
    }

    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    pub fn has_finalizer(&self, finalizer: &str) -> bool {
        self.finalizers().iter().any(|f| f == finalizer)
    }
}

impl HelmChart {
    /// A chart object pulling `chart@version` from the given HelmRepository.
    pub fn for_repository(name: &str, namespace: &str, repository: &str, chart: &str, version: &str) -> Self {
        let mut hc = HelmChart::new(
            name,
            HelmChartSpec {
                chart: chart.to_string(),
                version: Some(version.to_string()),
                source_ref: LocalSourceReference {
                    api_version: None,
                    kind: chartfleet_core::HELM_REPOSITORY_KIND.to_string(),
                    name: repository.to_string(),
                },
                interval: Some("10m".to_string()),
            },
        );
        hc.metadata.namespace = Some(namespace.to_string());
        hc
    }

    pub fn is_ready(&self) -> bool {
        self.status.as_ref().and_then(|s| ready(&s.conditions)).map_or(false, |c| c.status == "True")
    }

    /// Message of the Ready condition, for error reporting.
    pub fn ready_message(&self) -> Option<&str> {
        self.status.as_ref().and_then(|s| ready(&s.conditions)).map(|c| c.message.as_str())
    }

    pub fn artifact_url(&self) -> Option<&str> {
        let status = self.status.as_ref()?;
        status
            .artifact
            .as_ref()
            .map(|a| a.url.as_str())
            .filter(|u| !u.is_empty())
            .or_else(|| status.url.as_deref().filter(|u| !u.is_empty()))
    }
}
