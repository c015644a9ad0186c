//! Semver helpers. Chart versions in Helm indexes are looser than strict
//! semver (`v1.2`, `1.0-rc1`), so parsing coerces them first.

use std::cmp::Ordering;

use semver::{Comparator, Op, Version, VersionReq};
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum VersionError {
    #[error("invalid semantic version {version:?}: {reason}")]
    InvalidVersion { version: String, reason: String },
    #[error("invalid version constraint {constraint:?}: {reason}")]
    InvalidConstraint { constraint: String, reason: String },
}

/// Parse a chart version, accepting a leading `v` and a missing minor/patch.
pub fn parse_version(raw: &str) -> Result<Version, VersionError> {
    let trimmed = raw.trim();
    let s = trimmed.strip_prefix('v').or_else(|| trimmed.strip_prefix('V')).unwrap_or(trimmed);
    let split = s.find(|c| c == '-' || c == '+').unwrap_or(s.len());
    let (core, rest) = s.split_at(split);
    let parts = core.split('.').count();
    let coerced = match parts {
        1 => format!("{}.0.0{}", core, rest),
        2 => format!("{}.0{}", core, rest),
        _ => s.to_string(),
    };
    Version::parse(&coerced).map_err(|e| VersionError::InvalidVersion { version: raw.to_string(), reason: e.to_string() })
}

/// Sort version strings newest first. Any unparsable entry fails the whole sort;
/// callers rely on the head of the list being authoritative.
pub fn reverse_semver_sort<I, S>(versions: I) -> Result<Vec<String>, VersionError>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let mut parsed: Vec<(Version, String)> = Vec::new();
    for raw in versions {
        let raw = raw.into();
        let v = parse_version(&raw)?;
        parsed.push((v, raw));
    }
    parsed.sort_by(|a, b| b.0.cmp(&a.0));
    Ok(parsed.into_iter().map(|(_, raw)| raw).collect())
}

/// Highest version in the list, `None` when empty.
pub fn latest_version<I, S>(versions: I) -> Result<Option<String>, VersionError>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    Ok(reverse_semver_sort(versions)?.into_iter().next())
}

/// Descending comparison used when sorting index entries; unparsable versions
/// sort after parsable ones and among themselves lexically.
pub(crate) fn cmp_desc_lenient(a: &str, b: &str) -> Ordering {
    match (parse_version(a), parse_version(b)) {
        (Ok(va), Ok(vb)) => vb.cmp(&va),
        (Ok(_), Err(_)) => Ordering::Less,
        (Err(_), Ok(_)) => Ordering::Greater,
        (Err(_), Err(_)) => b.cmp(a),
    }
}

/// A semver requirement with the permissive pre-release rule used by Helm
/// tooling: once any comparator names a pre-release, pre-release versions are
/// compared by plain precedence instead of being excluded.
#[derive(Debug, Clone)]
pub struct VersionConstraint {
    req: VersionReq,
    allows_prerelease: bool,
}

impl VersionConstraint {
    pub fn parse(raw: &str) -> Result<Self, VersionError> {
        let req = VersionReq::parse(raw.trim())
            .map_err(|e| VersionError::InvalidConstraint { constraint: raw.to_string(), reason: e.to_string() })?;
        let allows_prerelease = req.comparators.iter().any(|c| !c.pre.is_empty());
        Ok(Self { req, allows_prerelease })
    }

    pub fn matches(&self, v: &Version) -> bool {
        if v.pre.is_empty() || !self.allows_prerelease {
            return self.req.matches(v);
        }
        self.req.comparators.iter().all(|c| comparator_allows(c, v))
    }
}

fn comparator_floor(c: &Comparator) -> Version {
    Version {
        major: c.major,
        minor: c.minor.unwrap_or(0),
        patch: c.patch.unwrap_or(0),
        pre: c.pre.clone(),
        build: semver::BuildMetadata::EMPTY,
    }
}

fn comparator_allows(c: &Comparator, v: &Version) -> bool {
    let floor = comparator_floor(c);
    let precise = c.minor.is_some() && c.patch.is_some();
    let ord = cmp_precedence(v, &floor);
    match c.op {
        Op::Exact if precise => ord == Ordering::Equal,
        Op::Greater if precise => ord == Ordering::Greater,
        Op::GreaterEq if precise => ord != Ordering::Less,
        Op::Less if precise => ord == Ordering::Less,
        Op::LessEq if precise => ord != Ordering::Greater,
        _ => {
            let mut release = v.clone();
            release.pre = semver::Prerelease::EMPTY;
            c.matches(&release) && ord != Ordering::Less
        }
    }
}

fn cmp_precedence(a: &Version, b: &Version) -> Ordering {
    (a.major, a.minor, a.patch).cmp(&(b.major, b.minor, b.patch)).then_with(|| a.pre.cmp(&b.pre))
}
