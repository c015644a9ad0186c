//! Helm repository `index.yaml` model.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

use crate::version::cmp_desc_lenient;

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("no API version specified")]
    MissingApiVersion,
    #[error("malformed index: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IndexFile {
    #[serde(rename = "apiVersion", default)]
    pub api_version: String,
    #[serde(default, deserialize_with = "lenient_time", skip_serializing_if = "Option::is_none")]
    pub generated: Option<DateTime<Utc>>,
    #[serde(default)]
    pub entries: BTreeMap<String, Vec<ChartVersion>>,
}

/// One published version of a chart (the flattened chart metadata Helm writes).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChartVersion {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub digest: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(rename = "appVersion", default, skip_serializing_if = "String::is_empty")]
    pub app_version: String,
    #[serde(default, deserialize_with = "lenient_time", skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,
}

// Timestamps are informational; a malformed one must not reject the index.
fn lenient_time<'de, D>(d: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(d)?;
    Ok(raw.and_then(|s| DateTime::parse_from_rfc3339(&s).ok()).map(|t| t.with_timezone(&Utc)))
}

impl IndexFile {
    /// Parse an index document, rejecting one without `apiVersion`, and sort
    /// each chart's versions newest first.
    pub fn from_yaml(bytes: &[u8]) -> Result<Self, IndexError> {
        let mut index: IndexFile = serde_yaml::from_slice(bytes)?;
        if index.api_version.is_empty() {
            return Err(IndexError::MissingApiVersion);
        }
        index.sort_entries();
        Ok(index)
    }

    pub fn sort_entries(&mut self) {
        for versions in self.entries.values_mut() {
            versions.sort_by(|a, b| cmp_desc_lenient(&a.version, &b.version));
        }
    }

    /// Every (chart name, version) pair, in entry order.
    pub fn versions(&self) -> impl Iterator<Item = (&str, &ChartVersion)> {
        self.entries.iter().flat_map(|(name, vs)| vs.iter().map(move |v| (name.as_str(), v)))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.values().all(|v| v.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INDEX: &str = r#"
apiVersion: v1
generated: "2021-06-01T10:00:00.123456789Z"
entries:
  demo-profile:
    - name: demo-profile
      version: 0.0.1
      annotations:
        weave.works/profile: demo-profile
        weave.works/layer: layer-0
      urls: ["http://example.com/demo-profile-0.0.1.tgz"]
    - name: demo-profile
      version: 0.1.0
      created: not-a-time
  nginx:
    - name: nginx
      version: 1.0.0-rc.1
    - name: nginx
      version: 1.0.0
"#;

    #[test]
    fn parses_and_sorts_newest_first() {
        let idx = IndexFile::from_yaml(INDEX.as_bytes()).unwrap();
        assert_eq!(idx.api_version, "v1");
        assert!(idx.generated.is_some());
        let demo: Vec<_> = idx.entries["demo-profile"].iter().map(|v| v.version.as_str()).collect();
        assert_eq!(demo, vec!["0.1.0", "0.0.1"]);
        let nginx: Vec<_> = idx.entries["nginx"].iter().map(|v| v.version.as_str()).collect();
        assert_eq!(nginx, vec!["1.0.0", "1.0.0-rc.1"]);
        assert_eq!(idx.versions().count(), 4);
    }

    #[test]
    fn missing_api_version_is_rejected() {
        let err = IndexFile::from_yaml(b"entries: {}\n").unwrap_err();
        assert!(matches!(err, IndexError::MissingApiVersion));
        assert_eq!(err.to_string(), "no API version specified");
    }

    #[test]
    fn garbage_is_a_yaml_error() {
        assert!(matches!(IndexFile::from_yaml(b"apiVersion: [unclosed"), Err(IndexError::Yaml(_))));
    }
}
