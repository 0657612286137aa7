use chrono::{DateTime, Utc};

/// Reserved scanner record id carrying the CVE database version rather than
/// a scanner process.
pub const CVE_DB_VERSION_ID: &str = "cvedb-version";

/// Scanner registration written under `scanner/{id}`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct ScannerRecord {
    pub id: String,
    /// `host:port` of the scanner's RPC endpoint.
    pub address: String,
    /// Built-in scanners run inside a controller and are only used by the
    /// controller whose id matches.
    pub built_in: bool,
    pub cve_db_version: String,
    pub cve_db_create_time: String,
    pub joined_at: Option<DateTime<Utc>>,
}

impl ScannerRecord {
    pub fn is_db_marker(&self) -> bool {
        self.id == CVE_DB_VERSION_ID
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CveDbInfo {
    pub version: String,
    pub create_time: String,
}
