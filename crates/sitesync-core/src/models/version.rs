//! App version descriptor and comparison

use std::cmp::Ordering;
use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Features this build of the client understands
pub const CLIENT_FEATURES: [&str; 4] = ["offline-store", "batch-sync", "conflict-log", "id-map"];

/// Schema/feature version of a client or server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
    pub build: u32,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub features: Vec<String>,
    /// Named data migrations in ascending order
    #[serde(default)]
    pub migrations: Vec<String>,
}

impl AppVersion {
    pub fn new(major: u32, minor: u32, patch: u32, build: u32) -> Self {
        Self {
            major,
            minor,
            patch,
            build,
            timestamp: Utc::now(),
            features: Vec::new(),
            migrations: Vec::new(),
        }
    }

    /// Version compiled into this crate.
    pub fn current() -> Self {
        let mut version = Self::parse(env!("CARGO_PKG_VERSION")).unwrap_or_else(|| Self::new(0, 1, 0, 0));
        version.build = option_env!("SITESYNC_BUILD")
            .and_then(|build| build.parse().ok())
            .unwrap_or(0);
        version.features = CLIENT_FEATURES.iter().map(ToString::to_string).collect();
        version
    }

    /// Parse `major.minor.patch[+build]`.
    pub fn parse(value: &str) -> Option<Self> {
        let (core, build) = match value.trim().split_once('+') {
            Some((core, build)) => (core, build.parse().ok()?),
            None => (value.trim(), 0),
        };
        let mut parts = core.split('.').map(str::parse::<u32>);
        let major = parts.next()?.ok()?;
        let minor = parts.next().unwrap_or(Ok(0)).ok()?;
        let patch = parts.next().unwrap_or(Ok(0)).ok()?;
        if parts.next().is_some() {
            return None;
        }
        Some(Self::new(major, minor, patch, build))
    }

    const fn triple(&self) -> (u32, u32, u32, u32) {
        (self.major, self.minor, self.patch, self.build)
    }

    /// Compare numeric components only.
    pub fn cmp_version(&self, other: &Self) -> Ordering {
        self.triple().cmp(&other.triple())
    }

    /// Classify how `remote` differs from `self`.
    pub const fn update_type_to(&self, remote: &Self) -> UpdateType {
        if remote.major != self.major {
            UpdateType::Major
        } else if remote.minor != self.minor {
            UpdateType::Minor
        } else if remote.patch != self.patch {
            UpdateType::Patch
        } else if remote.build != self.build {
            UpdateType::Build
        } else {
            UpdateType::None
        }
    }
}

impl std::fmt::Display for AppVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}+{}", self.major, self.minor, self.patch, self.build)
    }
}

/// Magnitude of a version delta
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateType {
    None,
    Build,
    Patch,
    Minor,
    Major,
}

/// Result of comparing the local descriptor with the remote one
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionComparison {
    pub current: AppVersion,
    pub remote: AppVersion,
    pub update_available: bool,
    pub update_type: UpdateType,
    pub breaking: bool,
    pub requires_data_migration: bool,
    /// Remote migrations not yet known locally, in remote order
    pub pending_migrations: Vec<String>,
}

impl VersionComparison {
    /// Compare descriptors; `applied` lists migrations already run locally.
    pub fn between(current: &AppVersion, remote: &AppVersion, applied: &[String]) -> Self {
        let update_available = remote.cmp_version(current) == Ordering::Greater;
        let update_type = if update_available {
            current.update_type_to(remote)
        } else {
            UpdateType::None
        };

        let known: BTreeSet<&str> = current
            .migrations
            .iter()
            .chain(applied.iter())
            .map(String::as_str)
            .collect();
        let pending_migrations: Vec<String> = remote
            .migrations
            .iter()
            .filter(|name| !known.contains(name.as_str()))
            .cloned()
            .collect();

        Self {
            current: current.clone(),
            remote: remote.clone(),
            update_available,
            update_type,
            breaking: update_type == UpdateType::Major,
            requires_data_migration: !pending_migrations.is_empty(),
            pending_migrations,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn version(major: u32, minor: u32, patch: u32, build: u32) -> AppVersion {
        AppVersion::new(major, minor, patch, build)
    }

    #[test]
    fn parse_accepts_build_suffix() {
        let parsed = AppVersion::parse("2.4.1+17").unwrap();
        assert_eq!((parsed.major, parsed.minor, parsed.patch, parsed.build), (2, 4, 1, 17));
        assert!(AppVersion::parse("1.2.3.4").is_none());
        assert!(AppVersion::parse("x").is_none());
    }

    #[test]
    fn classifies_each_component() {
        let base = version(1, 2, 3, 4);
        let cases = [
            (version(1, 2, 3, 4), UpdateType::None, false),
            (version(1, 2, 3, 5), UpdateType::Build, true),
            (version(1, 2, 4, 0), UpdateType::Patch, true),
            (version(1, 3, 0, 0), UpdateType::Minor, true),
            (version(2, 0, 0, 0), UpdateType::Major, true),
        ];
        for (remote, expected, available) in cases {
            let comparison = VersionComparison::between(&base, &remote, &[]);
            assert_eq!(comparison.update_type, expected);
            assert_eq!(comparison.update_available, available);
            assert_eq!(comparison.breaking, expected == UpdateType::Major);
        }
    }

    #[test]
    fn older_remote_is_not_an_update() {
        let comparison = VersionComparison::between(&version(2, 0, 0, 0), &version(1, 9, 0, 0), &[]);
        assert!(!comparison.update_available);
        assert_eq!(comparison.update_type, UpdateType::None);
    }

    #[test]
    fn migration_required_only_for_unknown_names() {
        let mut local = version(1, 0, 0, 0);
        local.migrations = vec!["001-init".into()];
        let mut remote = version(1, 1, 0, 0);
        remote.migrations = vec!["001-init".into(), "002-split".into(), "003-index".into()];

        let comparison = VersionComparison::between(&local, &remote, &["003-index".into()]);
        assert!(comparison.requires_data_migration);
        assert_eq!(comparison.pending_migrations, vec!["002-split".to_string()]);

        let settled = VersionComparison::between(
            &local,
            &remote,
            &["002-split".into(), "003-index".into()],
        );
        assert!(!settled.requires_data_migration);
    }
}
