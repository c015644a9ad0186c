//! Pure classification of an index into cacheable charts.

use std::collections::BTreeMap;

use tracing::{debug, warn};

use crate::index::IndexFile;
use crate::version::{parse_version, VersionConstraint};
use crate::{Chart, ChartKind, HELM_VERSION_FILTER_ANNOTATION, LAYER_ANNOTATION, PROFILE_ANNOTATION, REPOSITORY_PROFILES_ANNOTATION};

/// Version filter taken from a repository's annotations.
#[derive(Debug, Clone, Default)]
pub struct ChartFilter {
    constraint: Option<VersionConstraint>,
}

impl ChartFilter {
    /// Build from repository annotations. An unparsable constraint is logged
    /// and the filter admits everything.
    pub fn from_annotations(annotations: &BTreeMap<String, String>) -> Self {
        let Some(raw) = annotations.get(HELM_VERSION_FILTER_ANNOTATION) else {
            return Self::default();
        };
        match VersionConstraint::parse(raw) {
            Ok(c) => Self { constraint: Some(c) },
            Err(e) => {
                warn!(constraint = %raw, error = %e, "ignoring invalid helm version filter");
                Self::default()
            }
        }
    }

    pub fn is_active(&self) -> bool {
        self.constraint.is_some()
    }

    /// Whether a version passes. With an active filter, unparsable versions do not.
    pub fn admits(&self, version: &str) -> bool {
        let Some(c) = &self.constraint else { return true };
        match parse_version(version) {
            Ok(v) => c.matches(&v),
            Err(e) => {
                debug!(version, error = %e, "skipping unparsable chart version");
                false
            }
        }
    }
}

/// Classify every (name, version) in the index. Profile when the version or
/// the repository says so; layer from the version's annotation.
pub fn classify(index: &IndexFile, repo_annotations: &BTreeMap<String, String>) -> Vec<Chart> {
    let filter = ChartFilter::from_annotations(repo_annotations);
    let repo_profiles = repo_annotations.contains_key(REPOSITORY_PROFILES_ANNOTATION);
    index
        .versions()
        .filter(|(_, v)| filter.admits(&v.version))
        .map(|(name, v)| {
            let kind = if repo_profiles || v.annotations.contains_key(PROFILE_ANNOTATION) {
                ChartKind::Profile
            } else {
                ChartKind::Chart
            };
            Chart::new(name, v.version.clone(), kind, v.annotations.get(LAYER_ANNOTATION).cloned())
        })
        .collect()
}
