use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};

/// Kind of object a scan targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum ScanObjectType {
    Container,
    Host,
    Platform,
    Image,
}

impl ScanObjectType {
    /// Token used for this object kind inside store keys.
    pub fn key_token(&self) -> &'static str {
        match self {
            ScanObjectType::Container => "workload",
            ScanObjectType::Host => "host",
            ScanObjectType::Platform => "platform",
            ScanObjectType::Image => "image",
        }
    }

    pub fn from_key_token(token: &str) -> Option<Self> {
        match token {
            "workload" => Some(ScanObjectType::Container),
            "host" => Some(ScanObjectType::Host),
            "platform" => Some(ScanObjectType::Platform),
            "image" => Some(ScanObjectType::Image),
            _ => None,
        }
    }
}

impl fmt::Display for ScanObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScanObjectType::Container => write!(f, "container"),
            ScanObjectType::Host => write!(f, "host"),
            ScanObjectType::Platform => write!(f, "platform"),
            ScanObjectType::Image => write!(f, "image"),
        }
    }
}

/// Closed set of outcomes a scanner reports for a scan request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum ScanErrorCode {
    #[default]
    None,
    Network,
    ContainerApi,
    FileSystem,
    Timeout,
    NotSupport,
    ContainerExit,
    RegistryApi,
    Certificate,
    Authentication,
    ImageNotFound,
    SizeOverLimit,
    Canceled,
}

impl ScanErrorCode {
    pub fn is_none(&self) -> bool {
        matches!(self, ScanErrorCode::None)
    }

    /// Objects that cannot be scanned by nature; consumers treat these as a
    /// completed scan without findings.
    pub fn is_benign(&self) -> bool {
        matches!(
            self,
            ScanErrorCode::NotSupport | ScanErrorCode::ContainerExit
        )
    }

    /// Infrastructure failures worth another attempt for registry images.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ScanErrorCode::Timeout
                | ScanErrorCode::RegistryApi
                | ScanErrorCode::FileSystem
                | ScanErrorCode::Network
                | ScanErrorCode::ContainerApi
        )
    }
}

impl fmt::Display for ScanErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ScanErrorCode::None => "succeeded",
            ScanErrorCode::Network => "network error",
            ScanErrorCode::ContainerApi => "container API call error",
            ScanErrorCode::FileSystem => "file system error",
            ScanErrorCode::Timeout => "timeout",
            ScanErrorCode::NotSupport => "not supported",
            ScanErrorCode::ContainerExit => "container exited",
            ScanErrorCode::RegistryApi => "registry API call error",
            ScanErrorCode::Certificate => "certificate error",
            ScanErrorCode::Authentication => "authentication error",
            ScanErrorCode::ImageNotFound => "image not found",
            ScanErrorCode::SizeOverLimit => "image size over limit",
            ScanErrorCode::Canceled => "canceled",
        };
        f.write_str(text)
    }
}

/// Scan status as persisted in the shared store and shown to users.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum ScanStatus {
    #[default]
    Idle,
    Scheduled,
    Scanning,
    Finished,
    Failed,
}

impl ScanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanStatus::Idle => "idle",
            ScanStatus::Scheduled => "scheduled",
            ScanStatus::Scanning => "scanning",
            ScanStatus::Finished => "finished",
            ScanStatus::Failed => "failed",
        }
    }

    /// Scheduled or Scanning: work is still outstanding.
    pub fn is_pending(&self) -> bool {
        matches!(self, ScanStatus::Scheduled | ScanStatus::Scanning)
    }
}

impl fmt::Display for ScanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Thin per-object projection persisted under the scan state key.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ScanState {
    pub status: ScanStatus,
    #[cfg_attr(feature = "serde", serde(default))]
    pub scanned_at: Option<DateTime<Utc>>,
}

impl ScanState {
    pub fn new(status: ScanStatus) -> Self {
        let scanned_at = match status {
            ScanStatus::Finished => Some(Utc::now()),
            _ => None,
        };
        Self { status, scanned_at }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum Severity {
    #[default]
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Unknown strings fall back to `Low`.
    pub fn parse_lenient(raw: &str) -> Self {
        match raw.to_ascii_lowercase().as_str() {
            "critical" => Severity::Critical,
            "high" => Severity::High,
            "medium" => Severity::Medium,
            _ => Severity::Low,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct Vulnerability {
    pub name: String,
    pub score: f32,
    pub score_v3: f32,
    pub severity: Severity,
    pub package_name: String,
    pub package_version: String,
    pub fixed_version: String,
    /// Unix seconds or an RFC 3339 timestamp, as produced by the scanner.
    pub published_date: String,
    pub description: String,
    pub link: String,
    pub in_base_image: bool,
    /// Annotations attached when a profile suppresses the entry but the
    /// caller asked to keep it visible.
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct ScanLayer {
    pub digest: String,
    pub cmds: String,
    pub vulnerabilities: Vec<Vulnerability>,
    pub size: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct SecretFinding {
    pub rule: String,
    pub text: String,
    pub file: String,
    pub suggestion: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct SetIdFinding {
    pub kind: String,
    pub evidence: String,
    pub file: String,
}

/// Result returned by a scanner for one scan request.
#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct ScanResult {
    pub error: ScanErrorCode,
    pub provider: String,
    /// Base OS reported by the scanner, e.g. `ubuntu:22.04`.
    pub namespace: String,
    pub version: String,
    pub cve_db_create_time: String,
    pub image_id: String,
    pub registry: String,
    pub repository: String,
    pub tag: String,
    pub digest: String,
    pub author: String,
    pub size: i64,
    pub vulnerabilities: Vec<Vulnerability>,
    pub layers: Vec<ScanLayer>,
    /// `None` when the scanner did not run the file facet at all.
    pub secrets: Option<Vec<SecretFinding>>,
    pub set_id_perms: Vec<SetIdFinding>,
    pub envs: Vec<String>,
    pub labels: HashMap<String, String>,
    pub cmds: Vec<String>,
}

impl ScanResult {
    pub fn from_error(error: ScanErrorCode) -> Self {
        Self {
            error,
            ..Self::default()
        }
    }
}

/// Authoritative scan report written to the shared store.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ScanReport {
    pub scanned_at: DateTime<Utc>,
    pub result: ScanResult,
}

impl ScanReport {
    pub fn new(result: ScanResult) -> Self {
        Self {
            scanned_at: Utc::now(),
            result,
        }
    }
}

/// Cluster-wide scan configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct ScanConfig {
    pub auto_scan: bool,
}

/// Last computed scan summary for one object.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ScanBrief {
    pub status: ScanStatus,
    pub high: usize,
    pub medium: usize,
    pub result: Option<ScanErrorCode>,
    pub scanned_at: Option<DateTime<Utc>>,
    pub base_os: String,
    pub cve_db_version: String,
    pub cve_db_create_time: String,
}

/// Aggregate counters across all scan objects.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ScanStatusSummary {
    pub scheduled: usize,
    pub scanning: usize,
    pub scanned: usize,
    pub cve_db_version: String,
    pub cve_db_create_time: String,
}
