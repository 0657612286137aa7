use chrono::{DateTime, Utc};

pub const DEFAULT_PROFILE_NAME: &str = "default";

/// Entry name matching vulnerabilities published within `days`.
pub const VULN_NAME_RECENT: &str = "_RecentVuln";
/// Like [`VULN_NAME_RECENT`] but only for vulnerabilities without a fix.
pub const VULN_NAME_RECENT_WITHOUT_FIX: &str = "_RecentVulnWithoutFix";

/// One suppression rule. `domains` and `images` are optional scopes; an
/// empty list does not constrain on that axis.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct ProfileEntry {
    pub id: u32,
    pub name: String,
    pub comment: String,
    /// Age window for the recency entries.
    pub days: u32,
    pub domains: Vec<String>,
    pub images: Vec<String>,
}

impl ProfileEntry {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_domains<I, S>(mut self, domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.domains = domains.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_images<I, S>(mut self, images: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.images = images.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_days(mut self, days: u32) -> Self {
        self.days = days;
        self
    }
}

/// Ordered suppression ruleset stored under
/// `config/profile/vulnerability/{name}`.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct VulnerabilityProfile {
    pub name: String,
    #[cfg_attr(feature = "serde", serde(default))]
    pub entries: Vec<ProfileEntry>,
    pub updated_at: DateTime<Utc>,
}

impl VulnerabilityProfile {
    pub fn new(name: impl Into<String>, entries: Vec<ProfileEntry>) -> Self {
        Self {
            name: name.into(),
            entries,
            updated_at: Utc::now(),
        }
    }
}

/// Identity scope of one consumer of a scan result: the namespaces it runs
/// in and the image it was started from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct IdName {
    pub domains: Vec<String>,
    pub image: String,
}

impl IdName {
    pub fn new(domains: Vec<String>, image: impl Into<String>) -> Self {
        Self {
            domains,
            image: image.into(),
        }
    }
}
