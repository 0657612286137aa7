//! Core data model definitions shared across scanplane crates.
#![allow(missing_docs)]

pub use ::chrono;

pub mod error;
pub mod profile;
pub mod registry;
pub mod scan;
pub mod scanner;

pub use error::{ModelError, Result as ModelResult};
pub use profile::{
    DEFAULT_PROFILE_NAME, IdName, ProfileEntry, VULN_NAME_RECENT,
    VULN_NAME_RECENT_WITHOUT_FIX, VulnerabilityProfile,
};
pub use registry::{
    ImageInfo, ImageRef, ImageSummary, RegistryConfig, RegistryFilter,
    RegistryState, RegistryStatus, RegistryType, ScanFlags, ScanSchedule,
};
pub use scan::{
    ScanBrief, ScanConfig, ScanErrorCode, ScanLayer, ScanObjectType,
    ScanReport, ScanResult, ScanState, ScanStatus, ScanStatusSummary,
    SecretFinding, SetIdFinding, Severity, Vulnerability,
};
pub use scanner::{CVE_DB_VERSION_ID, CveDbInfo, ScannerRecord};
