//! Chartfleet core types: cluster and repository references, cached charts,
//! the Helm index model and semver helpers shared by every other crate.

#![forbid(unsafe_code)]

use std::fmt;

use serde::{Deserialize, Serialize};

pub mod classify;
pub mod config;
pub mod index;
pub mod version;

pub use classify::{classify, ChartFilter};
pub use index::{ChartVersion, IndexError, IndexFile};
pub use version::{reverse_semver_sort, VersionError};

/// Name of the management cluster inside the fleet.
pub const MANAGEMENT_CLUSTER_NAME: &str = "management";

/// Annotation that marks a single chart version as a profile.
pub const PROFILE_ANNOTATION: &str = "weave.works/profile";
/// Annotation on a HelmRepository marking every chart in it as a profile.
pub const REPOSITORY_PROFILES_ANNOTATION: &str = "weave.works/profiles";
/// Install ordering hint for profiles.
pub const LAYER_ANNOTATION: &str = "weave.works/layer";
/// Semver constraint on a HelmRepository limiting which versions get cached.
pub const HELM_VERSION_FILTER_ANNOTATION: &str = "weave.works/helm-version-filter";

pub const HELM_REPOSITORY_KIND: &str = "HelmRepository";
pub const SOURCE_API_VERSION: &str = "source.toolkit.fluxcd.io/v1beta2";

/// A member cluster of the fleet.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClusterRef {
    pub name: String,
    #[serde(default)]
    pub namespace: String,
}

impl ClusterRef {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self { name: name.into(), namespace: namespace.into() }
    }

    /// The reserved reference for the management cluster.
    pub fn management() -> Self {
        Self::new(MANAGEMENT_CLUSTER_NAME, "")
    }

    pub fn is_management(&self) -> bool {
        self.name == MANAGEMENT_CLUSTER_NAME && self.namespace.is_empty()
    }

    /// Key used to track the cluster in the fleet (`ns/name`, or `name` when unnamespaced).
    pub fn key(&self) -> String {
        if self.namespace.is_empty() { self.name.clone() } else { format!("{}/{}", self.namespace, self.name) }
    }
}

impl fmt::Display for ClusterRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

/// A chart repository object living on some cluster.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RepositoryRef {
    pub kind: String,
    pub api_version: String,
    pub name: String,
    pub namespace: String,
}

impl RepositoryRef {
    pub fn new(kind: impl Into<String>, api_version: impl Into<String>, name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self { kind: kind.into(), api_version: api_version.into(), name: name.into(), namespace: namespace.into() }
    }

    /// Reference to a Flux `HelmRepository`.
    pub fn helm_repository(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self::new(HELM_REPOSITORY_KIND, SOURCE_API_VERSION, name, namespace)
    }
}

impl fmt::Display for RepositoryRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.kind, self.namespace, self.name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ChartKind {
    #[default]
    Chart,
    Profile,
}

impl ChartKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChartKind::Chart => "chart",
            ChartKind::Profile => "profile",
        }
    }
}

impl fmt::Display for ChartKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ChartKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "chart" => Ok(ChartKind::Chart),
            "profile" => Ok(ChartKind::Profile),
            other => Err(format!("unknown chart kind: {}", other)),
        }
    }
}

/// A cached chart version.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Chart {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub kind: ChartKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layer: Option<String>,
}

impl Chart {
    pub fn new(name: impl Into<String>, version: impl Into<String>, kind: ChartKind, layer: Option<String>) -> Self {
        Self { name: name.into(), version: version.into(), kind, layer }
    }

    /// Name/version pair used in lookups; kind and layer default.
    pub fn reference(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self::new(name, version, ChartKind::Chart, None)
    }
}

impl fmt::Display for Chart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.version)
    }
}

pub mod prelude {
    pub use super::{Chart, ChartKind, ClusterRef, RepositoryRef};
    pub use super::index::{ChartVersion, IndexFile};
}
