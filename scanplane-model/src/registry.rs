use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};

use crate::error::{ModelError, Result};
use crate::scan::{ScanErrorCode, ScanStatus};

/// Registry backend flavour. Only a few behaviours key off it: Docker Hub's
/// implicit `library` organisation, OpenShift creator-domain scoping and the
/// image bank, and public-registry limits for Red Hat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum RegistryType {
    #[default]
    Docker,
    OpenShift,
    RedHat,
    GitLab,
    JFrog,
    AmazonEcr,
    GoogleGcr,
    AzureAcr,
    IbmCloud,
    Harbor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum ScanSchedule {
    #[default]
    Manual,
    Auto,
    Periodical,
}

/// Parsed `[org/]repo[:tag]` filter. `repo` and `tag` hold regular
/// expressions with `*` already expanded to `.*`; `org` is literal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RegistryFilter {
    pub org: String,
    pub repo: String,
    pub tag: String,
}

impl RegistryFilter {
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(ModelError::InvalidFilter("empty filter".into()));
        }
        if raw == "*" {
            return Ok(Self::match_all());
        }

        let (path, tag) = match raw.rfind(':') {
            Some(i) if !raw[i..].contains('/') => (&raw[..i], &raw[i + 1..]),
            _ => (raw, "latest"),
        };
        if path.is_empty() {
            return Err(ModelError::InvalidFilter(format!(
                "missing repository in '{raw}'"
            )));
        }
        if tag.is_empty() {
            return Err(ModelError::InvalidFilter(format!(
                "missing tag after ':' in '{raw}'"
            )));
        }

        let (org, repo) = match path.find('/') {
            Some(i) => (&path[..i], &path[i + 1..]),
            None => ("", path),
        };
        if repo.is_empty() {
            return Err(ModelError::InvalidFilter(format!(
                "missing repository in '{raw}'"
            )));
        }
        if org.contains('*') {
            return Err(ModelError::InvalidFilter(format!(
                "organization cannot contain wildcards in '{raw}'"
            )));
        }

        Ok(Self {
            org: org.to_string(),
            repo: expand_wildcard(repo),
            tag: expand_wildcard(tag),
        })
    }

    pub fn match_all() -> Self {
        Self {
            org: String::new(),
            repo: ".*".into(),
            tag: ".*".into(),
        }
    }
}

impl fmt::Display for RegistryFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let repo = self.repo.replace(".*", "*");
        let tag = self.tag.replace(".*", "*");
        if self.org.is_empty() {
            write!(f, "{repo}:{tag}")
        } else {
            write!(f, "{}/{repo}:{tag}", self.org)
        }
    }
}

fn expand_wildcard(pattern: &str) -> String {
    if pattern.contains(".*") {
        pattern.to_string()
    } else {
        pattern.replace('*', ".*")
    }
}

/// Registry configuration as written under `config/registry/{name}`.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct RegistryConfig {
    pub name: String,
    pub registry_type: RegistryType,
    /// Base URL of the registry.
    pub registry: String,
    pub username: String,
    pub password: String,
    pub auth_token: String,
    pub filters: Vec<RegistryFilter>,
    /// OpenShift namespaces the creating user may see. Empty means no
    /// restriction.
    pub creater_domains: Vec<String>,
    pub schedule: ScanSchedule,
    /// Seconds between polls when `schedule` is `Periodical`.
    pub poll_period_secs: u64,
    pub rescan_after_db_update: bool,
    pub scan_layers: bool,
    pub disable_files: bool,
    /// Cap on matched repositories per filter; public registries only.
    pub repo_limit: usize,
    /// Cap on matched tags per repository; public registries only.
    pub tag_limit: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            registry_type: RegistryType::Docker,
            registry: String::new(),
            username: String::new(),
            password: String::new(),
            auth_token: String::new(),
            filters: Vec::new(),
            creater_domains: Vec::new(),
            schedule: ScanSchedule::Manual,
            poll_period_secs: 0,
            rescan_after_db_update: true,
            scan_layers: false,
            disable_files: false,
            repo_limit: 0,
            tag_limit: 0,
        }
    }
}

impl RegistryConfig {
    pub fn is_public(&self) -> bool {
        self.registry.contains(".docker.com")
            || self.registry.contains(".docker.io")
            || self.registry_type == RegistryType::RedHat
    }

    pub fn credentials_differ(&self, other: &RegistryConfig) -> bool {
        self.username != other.username
            || self.password != other.password
            || self.auth_token != other.auth_token
    }

    /// Creator domains are only honoured for OpenShift registries.
    pub fn scoped_domains(&self) -> Option<&[String]> {
        if self.registry_type == RegistryType::OpenShift
            && !self.creater_domains.is_empty()
        {
            Some(&self.creater_domains)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum RegistryStatus {
    #[default]
    Idle,
    Scanning,
}

impl fmt::Display for RegistryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryStatus::Idle => f.write_str("idle"),
            RegistryStatus::Scanning => f.write_str("scanning"),
        }
    }
}

/// Persisted registry state under `scan/state/registry/{name}`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct RegistryState {
    pub status: RegistryStatus,
    pub err_msg: String,
    pub err_detail: String,
    pub started_at: Option<DateTime<Utc>>,
}

impl RegistryState {
    pub fn idle() -> Self {
        Self::default()
    }

    pub fn scanning() -> Self {
        Self {
            status: RegistryStatus::Scanning,
            started_at: Some(Utc::now()),
            ..Self::default()
        }
    }

    pub fn failed(err_msg: impl Into<String>, err_detail: impl Into<String>) -> Self {
        Self {
            status: RegistryStatus::Idle,
            err_msg: err_msg.into(),
            err_detail: err_detail.into(),
            started_at: None,
        }
    }
}

/// One human-readable reference to image content.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ImageRef {
    pub domain: String,
    pub repo: String,
    pub tag: String,
}

impl ImageRef {
    pub fn new(
        domain: impl Into<String>,
        repo: impl Into<String>,
        tag: impl Into<String>,
    ) -> Self {
        Self {
            domain: domain.into(),
            repo: repo.into(),
            tag: tag.into(),
        }
    }

    pub fn display_name(&self) -> String {
        format!("{}:{}", self.repo, self.tag)
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.domain.is_empty() {
            write!(f, "{}:{}", self.repo, self.tag)
        } else {
            write!(f, "{}/{}:{}", self.domain, self.repo, self.tag)
        }
    }
}

/// Image metadata as returned by a registry driver.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct ImageInfo {
    /// Content ID.
    pub id: String,
    pub digest: String,
    pub size: i64,
    pub author: String,
    pub layers: Vec<String>,
    pub envs: Vec<String>,
    pub labels: HashMap<String, String>,
}

/// Bitset of completed scan facets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
pub struct ScanFlags(u32);

impl ScanFlags {
    pub const CVE: ScanFlags = ScanFlags(1);
    pub const LAYERS: ScanFlags = ScanFlags(1 << 1);
    pub const FILES: ScanFlags = ScanFlags(1 << 2);

    pub fn empty() -> Self {
        ScanFlags(0)
    }

    pub fn bits(&self) -> u32 {
        self.0
    }

    pub fn contains(&self, other: ScanFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: ScanFlags) {
        self.0 |= other.0;
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

/// Persisted per-content summary under `scan/state/image/{name}/{id}`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct ImageSummary {
    pub image_id: String,
    pub registry: String,
    pub reg_name: String,
    pub digest: String,
    pub images: Vec<ImageRef>,
    pub status: ScanStatus,
    pub scan_flags: ScanFlags,
    pub result: ScanErrorCode,
    pub scanned_at: Option<DateTime<Utc>>,
    pub base_os: String,
    /// CVE database version used for the last scan.
    pub version: String,
    pub size: i64,
    pub author: String,
}

impl ImageSummary {
    /// Drop the outcome of any pending or previous scan.
    pub fn reset_to_idle(&mut self) {
        self.status = ScanStatus::Idle;
        self.scan_flags = ScanFlags::empty();
        self.result = ScanErrorCode::None;
        self.scanned_at = None;
        self.base_os.clear();
        self.version.clear();
    }
}
